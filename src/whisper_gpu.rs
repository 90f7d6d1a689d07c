use crate::config::{ModelConfig, TranscribeConfig};
use crate::error::EngineError;
use crate::model_registry::{default_cache_dir, ensure_model, ModelSize};
use crate::transcribe_backend::{estimate_confidence, TranscribeBackend, TranscribeRequest};
use crate::types::{TranscribeOptions, TranscriptSegment, UserTranscript};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex_lite::Regex;
use std::path::PathBuf;
use tokio::process::Command;

/// デフォルトのエンジンバイナリ名（PATHから探索する）
const DEFAULT_ENGINE_BINARY: &str = "whisper-cli";

/// ロード済みのエンジンセッション
///
/// モデルファイルの解決が済んだ状態。ハンドルはこのバックエンド
/// インスタンスが排他的に所有する。
struct GpuSession {
    model_path: PathBuf,
}

/// GPUアクセラレーション版バックエンド
///
/// GPUビルド済みのwhisperエンジンバイナリを起動して文字起こしする。
/// モデルのライフサイクルはローカルバックエンドと同一
/// （レジストリ解決 → キャッシュへダウンロード → 使用可能化）。
///
/// ローカル/クラウドと違い、このエンジンは構造化された結果を
/// 返さない。出力はタイムスタンプ付きテキストの損失の多い形式で、
/// `(開始, 終了, テキスト)` の組を寛容なパーサで復元する。
/// 不正な行はスキップし、トランスクリプト全体を失敗にはしない。
pub struct WhisperGpuBackend {
    model_size: ModelSize,
    cache_dir: PathBuf,
    defaults: TranscribeConfig,
    binary: PathBuf,
    timestamp_re: Regex,
    session: Option<GpuSession>,
}

impl WhisperGpuBackend {
    /// 構築時にプラットフォームとエンジンバイナリを確認する
    ///
    /// バイナリが見つからないホストでは `UnsupportedPlatform` を返し、
    /// モデルのダウンロードは試みない。
    pub fn new(model: &ModelConfig, defaults: &TranscribeConfig) -> Result<Self, EngineError> {
        if let Some(reason) = crate::whisper_local::platform_unsupported_reason() {
            return Err(EngineError::UnsupportedPlatform(reason));
        }

        let binary = match &model.engine_binary {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    return Err(EngineError::UnsupportedPlatform(format!(
                        "指定されたエンジンバイナリが存在しません: {:?}",
                        path
                    )));
                }
                path
            }
            None => which::which(DEFAULT_ENGINE_BINARY).map_err(|_| {
                EngineError::UnsupportedPlatform(format!(
                    "エンジンバイナリ '{}' がPATHに見つかりません",
                    DEFAULT_ENGINE_BINARY
                ))
            })?,
        };

        let cache_dir = match &model.cache_dir {
            Some(dir) => PathBuf::from(dir),
            None => default_cache_dir().context("キャッシュディレクトリの解決に失敗")?,
        };

        Ok(Self {
            model_size: model.size,
            cache_dir,
            defaults: defaults.clone(),
            binary,
            timestamp_re: timestamp_regex()?,
            session: None,
        })
    }
}

#[async_trait]
impl TranscribeBackend for WhisperGpuBackend {
    fn name(&self) -> &'static str {
        "whisper-gpu"
    }

    fn is_available(&self) -> bool {
        self.session.is_some()
    }

    async fn initialize(&mut self) -> Result<(), EngineError> {
        if self.session.is_some() {
            return Ok(());
        }

        let model_path = ensure_model(self.model_size, &self.cache_dir, None)
            .await
            .context("モデルの取得に失敗")?;

        log::info!(
            "GPUエンジン準備完了: {:?} / モデル {:?}",
            self.binary,
            model_path
        );
        self.session = Some(GpuSession { model_path });

        Ok(())
    }

    async fn transcribe_file(
        &self,
        request: &TranscribeRequest,
        options: &TranscribeOptions,
    ) -> Result<UserTranscript, EngineError> {
        let session = self.session.as_ref().ok_or(EngineError::NotInitialized)?;

        let language = options
            .language
            .clone()
            .unwrap_or_else(|| self.defaults.language.clone());
        let temperature = options.temperature.unwrap_or(self.defaults.temperature);

        let mut command = Command::new(&self.binary);
        command
            .arg("-m")
            .arg(&session.model_path)
            .arg("-f")
            .arg(&request.file_path)
            .arg("-l")
            .arg(&language)
            .arg("--temperature")
            .arg(temperature.to_string());

        if let Some(prompt) = options.prompt.clone().or_else(|| self.defaults.prompt.clone()) {
            command.arg("--prompt").arg(prompt);
        }

        log::debug!("GPUエンジン実行: {:?}", request.file_path);

        let output = command
            .output()
            .await
            .with_context(|| format!("エンジンの起動に失敗: {:?}", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::TranscriptionFailed(format!(
                "エンジンが異常終了しました ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let segments = parse_timestamped_output(&self.timestamp_re, &stdout);

        if segments.is_empty() {
            log::warn!(
                "エンジン出力からセグメントを復元できませんでした: {:?}",
                request.file_path
            );
        }

        Ok(UserTranscript::from_segments(
            request.speaker_id.clone(),
            request.speaker_name.clone(),
            request.audio_start_time_ms,
            segments,
        ))
    }

    fn estimate_time(&self, total_audio_secs: f64) -> String {
        let secs = (total_audio_secs * 0.1).max(1.0);
        format!("約{:.0}秒（GPU性能に依存）", secs)
    }

    fn release(&mut self) {
        if self.session.take().is_some() {
            log::info!("GPUエンジンセッションを解放しました");
        }
    }
}

/// `[hh:mm:ss.mmm --> hh:mm:ss.mmm] テキスト` 行のパターン
///
/// 小数点区切りはピリオドとカンマの両方を受け付ける。
fn timestamp_regex() -> Result<Regex> {
    Regex::new(r"^\[(\d{2}):(\d{2}):(\d{2})[.,](\d{3}) --> (\d{2}):(\d{2}):(\d{2})[.,](\d{3})\]\s*(.*)$")
        .context("タイムスタンプパターンのコンパイルに失敗")
}

/// エンジンのテキスト出力から `(開始, 終了, テキスト)` の組を復元する
///
/// 損失の多いテキスト形式として扱う。タイムスタンプ行以外
/// （バナーや統計出力）は無視し、時刻が逆転した行やテキストの
/// ない行は不正としてスキップする。行単位の不正で全体を
/// 失敗させることはない。
fn parse_timestamped_output(re: &Regex, raw: &str) -> Vec<TranscriptSegment> {
    let mut segments = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        let Some(caps) = re.captures(line) else {
            continue;
        };

        let start = hms_to_secs(&caps[1], &caps[2], &caps[3], &caps[4]);
        let end = hms_to_secs(&caps[5], &caps[6], &caps[7], &caps[8]);
        let (Some(start), Some(end)) = (start, end) else {
            log::debug!("時刻を解釈できない行をスキップ: {}", line);
            continue;
        };

        if end < start {
            log::debug!("時刻が逆転した行をスキップ: {}", line);
            continue;
        }

        let text = caps[9].trim();
        if text.is_empty() {
            continue;
        }

        segments.push(TranscriptSegment {
            confidence: estimate_confidence(text, end - start),
            text: text.to_string(),
            start_offset_sec: start,
            end_offset_sec: end,
        });
    }

    segments
}

fn hms_to_secs(h: &str, m: &str, s: &str, ms: &str) -> Option<f64> {
    let h: u64 = h.parse().ok()?;
    let m: u64 = m.parse().ok()?;
    let s: u64 = s.parse().ok()?;
    let ms: u64 = ms.parse().ok()?;
    Some((h * 3600 + m * 60 + s) as f64 + ms as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Vec<TranscriptSegment> {
        parse_timestamped_output(&timestamp_regex().unwrap(), raw)
    }

    #[test]
    fn test_parse_recovers_triples() {
        let raw = "\
[00:00:00.000 --> 00:00:02.500]  こちら本部
[00:00:03.000 --> 00:00:05.120]  応答願います
";
        let segments = parse(raw);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "こちら本部");
        assert_eq!(segments[0].start_offset_sec, 0.0);
        assert_eq!(segments[0].end_offset_sec, 2.5);
        assert_eq!(segments[1].start_offset_sec, 3.0);
        assert!((segments[1].end_offset_sec - 5.12).abs() < 1e-9);
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let raw = "\
whisper_init_from_file: loading model
[00:00:00.000 --> 00:00:01.000] 正常な行
[00:00:05.000 --> 00:00:02.000] 時刻が逆転
[00:00:06.000 --> 00:00:07.000]
[broken --> timestamps] テキスト
[00:00:08.000 --> 00:00:09.000] 次の正常な行

whisper_print_timings: total time = 1234 ms
";
        let segments = parse(raw);
        // 不正な行を読み飛ばしても正常な行は全て残る
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "正常な行");
        assert_eq!(segments[1].text, "次の正常な行");
    }

    #[test]
    fn test_parse_accepts_comma_separator() {
        let raw = "[00:01:02,345 --> 00:01:03,456] カンマ区切り";
        let segments = parse(raw);
        assert_eq!(segments.len(), 1);
        assert!((segments[0].start_offset_sec - 62.345).abs() < 1e-9);
        assert!((segments[0].end_offset_sec - 63.456).abs() < 1e-9);
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse("").is_empty());
        assert!(parse("no timestamps here").is_empty());
    }

    #[test]
    fn test_new_rejects_missing_binary() {
        let model = ModelConfig {
            engine_binary: Some("/nonexistent/whisper-cli".to_string()),
            cache_dir: Some("/tmp/cache".to_string()),
            ..ModelConfig::default()
        };
        let result = WhisperGpuBackend::new(&model, &TranscribeConfig::default());
        assert!(matches!(result, Err(EngineError::UnsupportedPlatform(_))));
    }

    #[tokio::test]
    async fn test_transcribe_before_initialize_fails() {
        // 実在するファイルならバイナリとして受理される（実行はしない）
        let file = tempfile::NamedTempFile::new().unwrap();
        let model = ModelConfig {
            engine_binary: Some(file.path().to_string_lossy().into_owned()),
            cache_dir: Some("/tmp/cache".to_string()),
            ..ModelConfig::default()
        };
        let backend = WhisperGpuBackend::new(&model, &TranscribeConfig::default()).unwrap();
        assert!(!backend.is_available());

        let request = TranscribeRequest {
            file_path: "missing.wav".into(),
            speaker_id: "1".to_string(),
            speaker_name: "alice".to_string(),
            audio_start_time_ms: 0,
        };
        let result = backend
            .transcribe_file(&request, &TranscribeOptions::default())
            .await;
        assert!(matches!(result, Err(EngineError::NotInitialized)));
    }
}
