use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// PCMサンプルフォーマット
///
/// キャプチャ側が書き出す生PCMのサンプル表現。現在サポートするのは
/// 符号付き16ビット・リトルエンディアンのみだが、リカバリ時の
/// 再生時間推定が暗黙の仮定に依存しないよう、明示的な型として
/// 設定・マニフェストに保存する。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// 符号付き16ビット整数・リトルエンディアン
    S16Le,
}

impl SampleFormat {
    /// 1サンプルあたりのバイト数
    pub fn bytes_per_sample(&self) -> u64 {
        match self {
            SampleFormat::S16Le => 2,
        }
    }

    /// WAVヘッダに書くビット深度
    pub fn bits_per_sample(&self) -> u16 {
        match self {
            SampleFormat::S16Le => 16,
        }
    }
}

/// PCMフォーマット情報
///
/// サンプリングレート・チャンネル数・サンプル表現の組。
/// 上流のキャプチャが実際に書き込んだ値と一致している必要がある。
///
/// # Examples
///
/// ```
/// # use vc_transcribe::types::{PcmFormat, SampleFormat};
/// let format = PcmFormat {
///     sample_rate: 48000, // 48kHz
///     channels: 2,        // ステレオ
///     sample_format: SampleFormat::S16Le,
/// };
/// assert_eq!(format.bytes_per_second(), 192_000);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PcmFormat {
    /// サンプリングレート (Hz)
    pub sample_rate: u32,

    /// チャンネル数
    ///
    /// 1: モノラル, 2: ステレオ
    pub channels: u16,

    /// サンプル表現
    pub sample_format: SampleFormat,
}

impl PcmFormat {
    /// 1秒あたりのバイト数
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * self.sample_format.bytes_per_sample()
    }

    /// 1フレーム（全チャンネル1サンプル分）のバイト数
    pub fn frame_bytes(&self) -> u64 {
        self.channels as u64 * self.sample_format.bytes_per_sample()
    }
}

/// 音声セグメント
///
/// 1話者の連続した発話チャンク。キャプチャと文字起こしの最小単位。
/// キャプチャ側が書き出したファイルを指し、スキャン後は読み取り専用。
///
/// `segment_index` は話者ごとに狭義単調増加する。欠番は許容され、
/// 無音として補間されることはない。
#[derive(Clone, Debug)]
pub struct Segment {
    /// 話者ID（Discordのスノーフレーク等、不透明な識別子）
    pub speaker_id: String,

    /// 話者の表示名（不明な場合は speaker_id と同じ）
    pub speaker_name: String,

    /// 話者内で単調増加するセグメント番号
    pub segment_index: u32,

    /// 録音時の壁時計時刻（UNIXエポックからのミリ秒）
    pub capture_timestamp_ms: u64,

    /// 音声データのPCMフォーマット
    pub format: PcmFormat,

    /// 音声ファイルのパス
    pub file_path: PathBuf,

    /// ファイルサイズ（バイト）
    pub byte_size: u64,
}

/// セッション情報
///
/// ディレクトリ名とセグメント群から導出される録音単位。
/// 独立して永続化されることはなく、開始・終了時刻は
/// キャプチャ時刻からの推定値。
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// セッションID（ディレクトリ名由来の不透明な識別子）
    pub session_id: String,

    /// 話者ID → 表示名
    pub participants: BTreeMap<String, String>,

    /// 推定開始時刻（ミリ秒）: 最古のセグメントのキャプチャ時刻
    pub start_time_ms: u64,

    /// 推定終了時刻（ミリ秒）: 最新のセグメントのキャプチャ時刻
    pub end_time_ms: u64,

    /// 推定セッション長（ミリ秒）
    pub duration_ms: u64,
}

/// 文字起こしセグメント
///
/// 1つの音声セグメントをエンジンに通した結果。オフセットは
/// セグメント自身の音声先頭からの相対秒であり、セッション時刻ではない。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    /// 文字起こしテキスト
    pub text: String,

    /// セグメント音声内の開始オフセット（秒）
    pub start_offset_sec: f64,

    /// セグメント音声内の終了オフセット（秒）
    pub end_offset_sec: f64,

    /// 信頼度 (0.0〜1.0)
    pub confidence: f32,
}

/// 1話者分の文字起こし
///
/// `audio_start_time_ms` はセグメント相対オフセットをセッション時刻へ
/// 投影するための絶対アンカー（ミリ秒）。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTranscript {
    pub speaker_id: String,
    pub speaker_name: String,
    pub segments: Vec<TranscriptSegment>,

    /// 単語数（空白区切り。分かち書きされない言語では近似値）
    pub word_count: usize,

    /// セグメント信頼度の算術平均
    pub average_confidence: f32,

    /// セッション時刻への投影アンカー（ミリ秒）
    pub audio_start_time_ms: u64,
}

impl UserTranscript {
    /// セグメント列から導出値（単語数・平均信頼度）を計算して作成する
    pub fn from_segments(
        speaker_id: String,
        speaker_name: String,
        audio_start_time_ms: u64,
        segments: Vec<TranscriptSegment>,
    ) -> Self {
        let word_count = segments.iter().map(|s| count_words(&s.text)).sum();
        let average_confidence = if segments.is_empty() {
            0.0
        } else {
            segments.iter().map(|s| s.confidence).sum::<f32>() / segments.len() as f32
        };

        Self {
            speaker_id,
            speaker_name,
            segments,
            word_count,
            average_confidence,
            audio_start_time_ms,
        }
    }
}

/// 時系列マージ後の1エントリ
///
/// 全話者のセグメントをセッション絶対時刻に投影したもの。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub speaker_id: String,
    pub speaker_name: String,

    /// セッション絶対時刻での開始（ミリ秒）
    pub absolute_start_ms: u64,

    /// セッション絶対時刻での終了（ミリ秒）
    pub absolute_end_ms: u64,

    pub text: String,
}

/// セッション全体の文字起こし成果物
///
/// `entries` は絶対時刻で全順序に整列済み（同時刻は話者IDの辞書順）。
/// JSON形式とmarkdown形式は必ずこの同じ列から描画され、
/// 再実行しても同一入力からはバイト単位で同じ出力になる。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTranscript {
    pub session_id: String,

    /// セッション全体の単語数（話者ごとの合計）
    pub word_count: usize,

    /// 話者平均の算術平均（セグメント数で重み付けしない近似値）
    pub average_confidence: f32,

    /// 時系列順のエントリ
    pub entries: Vec<TranscriptEntry>,

    /// 話者ごとの文字起こし
    pub users: Vec<UserTranscript>,
}

/// 文字起こしオプション
///
/// 全バックエンドでベストエフォート扱い。対応しないバックエンドは
/// 黙って無視し、エラーにはしない。
#[derive(Clone, Debug, Default)]
pub struct TranscribeOptions {
    /// 言語コード（"ja", "en" など）
    pub language: Option<String>,

    /// サンプリング温度 (0.0 = 決定的)
    pub temperature: Option<f32>,

    /// エンジンへのヒントプロンプト
    pub prompt: Option<String>,
}

/// リカバリマニフェスト (`manifest.json`)
///
/// クラッシュ後にディスク上の残骸だけから再構築されるセッション記録。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryManifest {
    pub session_id: String,

    /// 推定開始時刻（ミリ秒）
    pub session_start_time: u64,

    /// 推定終了時刻（ミリ秒）
    pub session_end_time: u64,

    pub participants: Vec<ManifestParticipant>,
    pub segments: Vec<ManifestSegment>,

    /// リカバリ経路で生成されたことを示すフラグ
    pub recovered: bool,

    /// 再生時間推定に使ったPCMフォーマット
    pub pcm_format: PcmFormat,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestParticipant {
    pub speaker_id: String,
    pub speaker_name: String,
}

/// マニフェスト内の1セグメント
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSegment {
    pub speaker_id: String,
    pub file_name: String,

    /// セッション絶対時刻での開始（ミリ秒）
    pub absolute_start_time: u64,

    /// セッション絶対時刻での終了（ミリ秒）
    pub absolute_end_time: u64,

    /// 再生時間（ミリ秒、バイトサイズからの推定値）
    pub duration: u64,

    /// ファイルサイズ（バイト）
    pub file_size: u64,
}

/// 空白区切りの単語数
///
/// 分かち書きされない言語（日本語など）では近似値にしかならない。
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}
