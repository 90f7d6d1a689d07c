use crate::config::{Config, TranscribeBackendType};
use crate::error::EngineError;
use crate::types::{TranscribeOptions, UserTranscript};
use async_trait::async_trait;
use std::path::PathBuf;

/// 1ファイル分の文字起こし要求
#[derive(Clone, Debug)]
pub struct TranscribeRequest {
    /// 音声ファイル（WAV）のパス
    pub file_path: PathBuf,
    pub speaker_id: String,
    pub speaker_name: String,
    /// セッション時刻への投影アンカー（ミリ秒）
    pub audio_start_time_ms: u64,
}

/// バッチ処理の結果
///
/// 部分的な成功と失敗の両方を返す。1ファイルの失敗でバッチ全体を
/// 中断することはない。
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub transcripts: Vec<UserTranscript>,
    pub failures: Vec<(PathBuf, EngineError)>,
}

/// 文字起こしバックエンドの共通トレイト
///
/// クラウドAPI・プロセス内ネイティブモデル・GPUエンジンを
/// 同一の契約で差し替えられるようにする。プロセスごとに
/// アクティブなバックエンドは起動時に選択された1つだけで、
/// モデルハンドルはそのインスタンスが排他的に所有する。
#[async_trait]
pub trait TranscribeBackend: Send + Sync {
    /// バックエンド名（ログ用）
    fn name(&self) -> &'static str;

    /// 利用可能かどうか
    ///
    /// モデル/セッションハンドルがロード済みのときのみ true。
    /// 安価で副作用を持たない。
    fn is_available(&self) -> bool;

    /// バックエンドを使用可能な状態にする
    ///
    /// ネイティブ系はここでモデルの取得とロードを行う。
    /// クラウドはモデル取得が不要なため準備完了を記録するだけ。
    async fn initialize(&mut self) -> Result<(), EngineError>;

    /// 1つの音声ファイルを文字起こしする
    ///
    /// `options` はベストエフォート扱いで、対応しないバックエンドは
    /// 黙って無視する。`initialize()` 前に呼ぶと `NotInitialized`。
    async fn transcribe_file(
        &self,
        request: &TranscribeRequest,
        options: &TranscribeOptions,
    ) -> Result<UserTranscript, EngineError>;

    /// 複数ファイルを逐次処理する
    ///
    /// ネイティブハンドルの占有とクラウドのレート制限のため
    /// 並列化はしない。ファイル単位の失敗は収集して続行し、
    /// 最後に成功/失敗のサマリをログに残す。
    async fn transcribe_files(
        &self,
        requests: &[TranscribeRequest],
        options: &TranscribeOptions,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for request in requests {
            match self.transcribe_file(request, options).await {
                Ok(transcript) => outcome.transcripts.push(transcript),
                Err(e) => {
                    log::warn!(
                        "文字起こし失敗（続行します）: {:?}: {}",
                        request.file_path,
                        e
                    );
                    outcome.failures.push((request.file_path.clone(), e));
                }
            }
        }

        log::info!(
            "バッチ完了: 成功 {} 件 / 失敗 {} 件",
            outcome.transcripts.len(),
            outcome.failures.len()
        );

        outcome
    }

    /// 処理時間の概算をユーザ向け文字列で返す
    ///
    /// 表示専用であり、スケジューリングには使わない。
    fn estimate_time(&self, total_audio_secs: f64) -> String;

    /// ハンドルを解放する
    ///
    /// 冪等。呼び出し後は `is_available()` が false に戻る。
    fn release(&mut self);
}

/// 設定からバックエンドを1つ選択して構築する
///
/// 構築はプラットフォーム対応の確認までで、モデルの取得は
/// `initialize()` まで行わない。未対応ホストでは
/// `UnsupportedPlatform` を返すため、呼び出し側は別バックエンドへ
/// フォールバックできる。
pub fn create_backend(config: &Config) -> Result<Box<dyn TranscribeBackend>, EngineError> {
    match config.transcribe.backend {
        TranscribeBackendType::Cloud => {
            log::info!("Whisper API バックエンドを使用します");
            let api_config = config.whisper_api.clone().ok_or_else(|| {
                EngineError::Auth("[whisper_api] セクションが設定されていません".to_string())
            })?;
            Ok(Box::new(crate::whisper_api::WhisperApiBackend::new(
                api_config,
                config.transcribe.clone(),
            )?))
        }
        TranscribeBackendType::Local => {
            log::info!("ローカル whisper バックエンドを使用します");
            Ok(Box::new(crate::whisper_local::WhisperLocalBackend::new(
                &config.model,
                &config.transcribe,
            )?))
        }
        TranscribeBackendType::Gpu => {
            log::info!("GPUエンジンバックエンドを使用します");
            Ok(Box::new(crate::whisper_gpu::WhisperGpuBackend::new(
                &config.model,
                &config.transcribe,
            )?))
        }
    }
}

/// テキスト量と音声長からの粗い信頼度推定
///
/// 構造化された確率を返さないエンジン（ネイティブ系）向けの近似。
pub(crate) fn estimate_confidence(text: &str, duration_secs: f64) -> f32 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.1;
    }

    let char_count = trimmed.chars().count();
    let mut confidence = (char_count as f32 / 100.0).min(0.6) + 0.3;

    if duration_secs > 0.0 {
        let chars_per_sec = char_count as f64 / duration_secs;
        // 発話速度として不自然な範囲は減点
        if !(1.0..=40.0).contains(&chars_per_sec) {
            confidence -= 0.2;
        }
    }

    confidence.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TranscriptSegment;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 指定した回数だけ失敗するモックバックエンド
    struct FlakyBackend {
        fail_first: usize,
        calls: AtomicUsize,
        ready: bool,
    }

    #[async_trait]
    impl TranscribeBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn is_available(&self) -> bool {
            self.ready
        }

        async fn initialize(&mut self) -> Result<(), EngineError> {
            self.ready = true;
            Ok(())
        }

        async fn transcribe_file(
            &self,
            request: &TranscribeRequest,
            _options: &TranscribeOptions,
        ) -> Result<UserTranscript, EngineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(EngineError::TranscriptionFailed("mock".to_string()));
            }
            Ok(UserTranscript::from_segments(
                request.speaker_id.clone(),
                request.speaker_name.clone(),
                request.audio_start_time_ms,
                vec![TranscriptSegment {
                    text: "ok".to_string(),
                    start_offset_sec: 0.0,
                    end_offset_sec: 1.0,
                    confidence: 0.9,
                }],
            ))
        }

        fn estimate_time(&self, _total_audio_secs: f64) -> String {
            "すぐ".to_string()
        }

        fn release(&mut self) {
            self.ready = false;
        }
    }

    fn request(name: &str) -> TranscribeRequest {
        TranscribeRequest {
            file_path: PathBuf::from(format!("{name}.wav")),
            speaker_id: "1".to_string(),
            speaker_name: "alice".to_string(),
            audio_start_time_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_batch_continues_past_failures() {
        let mut backend = FlakyBackend {
            fail_first: 2,
            calls: AtomicUsize::new(0),
            ready: false,
        };
        backend.initialize().await.unwrap();

        let requests = vec![request("a"), request("b"), request("c"), request("d")];
        let outcome = backend
            .transcribe_files(&requests, &TranscribeOptions::default())
            .await;

        // 先頭2件は失敗するが、バッチは最後まで続行する
        assert_eq!(outcome.transcripts.len(), 2);
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.failures[0].0, PathBuf::from("a.wav"));
        assert_eq!(outcome.failures[1].0, PathBuf::from("b.wav"));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let mut backend = FlakyBackend {
            fail_first: 0,
            calls: AtomicUsize::new(0),
            ready: false,
        };
        backend.initialize().await.unwrap();
        assert!(backend.is_available());

        backend.release();
        assert!(!backend.is_available());
        backend.release(); // 2回目も安全
        assert!(!backend.is_available());
    }

    #[test]
    fn test_estimate_confidence_bounds() {
        assert!(estimate_confidence("", 1.0) < 0.2);
        let normal = estimate_confidence("こちら本部、応答願います。", 3.0);
        assert!((0.0..=1.0).contains(&normal));
        assert!(normal > 0.3);
        // 極端に速い「発話」は減点される
        let suspicious = estimate_confidence(&"あ".repeat(500), 1.0);
        assert!(suspicious <= 1.0);
    }
}
