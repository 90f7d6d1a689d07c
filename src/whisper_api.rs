use crate::config::{TranscribeConfig, WhisperApiConfig};
use crate::error::EngineError;
use crate::transcribe_backend::{estimate_confidence, TranscribeBackend, TranscribeRequest};
use crate::types::{TranscribeOptions, TranscriptSegment, UserTranscript};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;

/// Whisper API のアップロード上限（25MB）
const MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// Whisper API のレスポンス（verbose_json形式）
#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    segments: Vec<ApiSegment>,
}

#[derive(Debug, Deserialize)]
struct ApiSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    avg_logprob: Option<f64>,
}

/// Whisper API バックエンド（クラウド）
///
/// モデルのダウンロードは不要で、呼び出しごとにステートレス。
/// レート制限と認証エラーは一般の失敗と区別して分類し、
/// 呼び出し側が再試行するか中断するかを判断できるようにする。
pub struct WhisperApiBackend {
    config: WhisperApiConfig,
    defaults: TranscribeConfig,
    client: reqwest::Client,
    ready: bool,
}

impl WhisperApiBackend {
    pub fn new(
        config: WhisperApiConfig,
        defaults: TranscribeConfig,
    ) -> Result<Self, EngineError> {
        if config.api_key.trim().is_empty() {
            return Err(EngineError::Auth("APIキーが設定されていません".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Whisper API HTTPクライアント作成失敗")?;

        Ok(Self {
            config,
            defaults,
            client,
            ready: false,
        })
    }

    /// Whisper APIを呼び出して文字起こし
    async fn call_api(
        &self,
        wav_data: Vec<u8>,
        file_name: String,
        options: &TranscribeOptions,
    ) -> Result<WhisperResponse, EngineError> {
        let payload_size = wav_data.len() as u64;
        let part = multipart::Part::bytes(wav_data)
            .file_name(file_name)
            .mime_str("audio/wav")
            .context("multipartパートの作成に失敗")?;

        let language = options
            .language
            .clone()
            .unwrap_or_else(|| self.defaults.language.clone());
        let temperature = options.temperature.unwrap_or(self.defaults.temperature);

        let mut form = multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone())
            .text("response_format", "verbose_json")
            .text("language", language)
            .text("temperature", temperature.to_string());

        if let Some(prompt) = options.prompt.clone().or_else(|| self.defaults.prompt.clone()) {
            form = form.text("prompt", prompt);
        }

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .multipart(form)
            .send()
            .await
            .context("Whisper API リクエスト失敗")?;

        let status = response.status();
        if status.is_success() {
            let parsed = response
                .json::<WhisperResponse>()
                .await
                .context("Whisper API レスポンスパース失敗")?;
            return Ok(parsed);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 | 403 => EngineError::Auth(format!("{} - {}", status, body)),
            429 => EngineError::RateLimited,
            413 => EngineError::PayloadTooLarge {
                size: payload_size,
                limit: MAX_UPLOAD_BYTES,
            },
            _ => EngineError::TranscriptionFailed(format!(
                "Whisper API エラー: {} - {}",
                status, body
            )),
        })
    }
}

#[async_trait]
impl TranscribeBackend for WhisperApiBackend {
    fn name(&self) -> &'static str {
        "whisper-api"
    }

    fn is_available(&self) -> bool {
        self.ready
    }

    async fn initialize(&mut self) -> Result<(), EngineError> {
        // クラウドはモデル取得が不要。準備完了を記録するだけ
        self.ready = true;
        Ok(())
    }

    async fn transcribe_file(
        &self,
        request: &TranscribeRequest,
        options: &TranscribeOptions,
    ) -> Result<UserTranscript, EngineError> {
        if !self.ready {
            return Err(EngineError::NotInitialized);
        }

        let byte_size = tokio::fs::metadata(&request.file_path)
            .await
            .with_context(|| format!("音声ファイルを確認できません: {:?}", request.file_path))?
            .len();

        // APIのハードリミットは送信前に検査する
        if byte_size > MAX_UPLOAD_BYTES {
            return Err(EngineError::PayloadTooLarge {
                size: byte_size,
                limit: MAX_UPLOAD_BYTES,
            });
        }

        let wav_data = tokio::fs::read(&request.file_path)
            .await
            .with_context(|| format!("音声ファイルの読み込みに失敗: {:?}", request.file_path))?;

        let file_name = request
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.wav".to_string());

        log::debug!(
            "Whisper API: {:?} ({} バイト) を文字起こし中",
            request.file_path,
            byte_size
        );

        let response = self.call_api(wav_data, file_name, options).await?;
        let segments = segments_from_response(response, &request.file_path);

        Ok(UserTranscript::from_segments(
            request.speaker_id.clone(),
            request.speaker_name.clone(),
            request.audio_start_time_ms,
            segments,
        ))
    }

    fn estimate_time(&self, total_audio_secs: f64) -> String {
        // アップロードとAPI処理でおおよそ実時間の1割
        let secs = (total_audio_secs * 0.1).max(5.0);
        format!("約{:.0}秒（API応答時間とレート制限に依存）", secs)
    }

    fn release(&mut self) {
        self.ready = false;
    }
}

/// APIレスポンスをセグメント列へ変換する
///
/// セグメント情報がない場合（古いAPIや簡易レスポンス）は
/// 全文を1セグメントとして扱う。
fn segments_from_response(
    response: WhisperResponse,
    file_path: &std::path::Path,
) -> Vec<TranscriptSegment> {
    if !response.segments.is_empty() {
        return response
            .segments
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .map(|s| TranscriptSegment {
                confidence: confidence_from_logprob(s.avg_logprob, &s.text, s.end - s.start),
                text: s.text.trim().to_string(),
                start_offset_sec: s.start,
                end_offset_sec: s.end,
            })
            .collect();
    }

    let text = response.text.trim().to_string();
    if text.is_empty() {
        return Vec::new();
    }

    let duration_secs = crate::wav_writer::wav_duration_ms(file_path)
        .map(|ms| ms as f64 / 1000.0)
        .unwrap_or(0.0);

    vec![TranscriptSegment {
        confidence: estimate_confidence(&text, duration_secs),
        text,
        start_offset_sec: 0.0,
        end_offset_sec: duration_secs,
    }]
}

/// 対数確率から信頼度を導く
///
/// `avg_logprob` はセグメント内トークンの平均対数確率。
/// 指数を取って確率へ戻し、なければテキスト量からの推定で代用する。
fn confidence_from_logprob(avg_logprob: Option<f64>, text: &str, duration_secs: f64) -> f32 {
    match avg_logprob {
        Some(lp) => (lp.exp() as f32).clamp(0.0, 1.0),
        None => estimate_confidence(text, duration_secs),
    }
}
