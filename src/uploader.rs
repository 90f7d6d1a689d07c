use crate::config::UploadConfig;
use crate::error::UploadError;
use reqwest::{multipart, Body};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// アップロード対象の成果物一式
#[derive(Clone, Debug)]
pub struct UploadBundle {
    pub session_id: String,
    /// 話者ごとのWAVファイル
    pub audio_files: Vec<PathBuf>,
    pub transcript_json: Option<PathBuf>,
    pub transcript_markdown: Option<PathBuf>,
    /// アップロード成功後に削除してよいローカル作業ディレクトリ
    pub working_dir: PathBuf,
}

/// アップロードAPIのレスポンス
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub recording_id: String,
    #[serde(default)]
    pub download_urls: DownloadUrls,
    #[serde(default)]
    pub view_url: String,
    #[serde(default)]
    pub estimated_processing_time: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DownloadUrls {
    #[serde(default)]
    pub audio: Vec<String>,
}

/// アップロード進捗
#[derive(Clone, Copy, Debug)]
pub struct UploadProgress {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub percentage: u8,
}

pub type UploadProgressFn = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// 1回のアップロード試行の状態
///
/// `Completed` と `Failed(terminal)` のみが吸収状態。
/// 再試行可能な失敗は `Pending` に戻って次の試行を待つ。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    Pending,
    Uploading,
    Completed,
    FailedRetryable,
    FailedTerminal,
}

/// 全パートで共有する累積進捗
///
/// 事前に計算した合計バイト数に対する進捗を、おおよそ5%刻みで
/// コールバックへ報告する。
struct ProgressState {
    uploaded: AtomicU64,
    total: u64,
    last_reported: AtomicU64,
    callback: Option<UploadProgressFn>,
}

impl ProgressState {
    fn new(total: u64, callback: Option<UploadProgressFn>) -> Self {
        Self {
            uploaded: AtomicU64::new(0),
            total,
            last_reported: AtomicU64::new(0),
            callback,
        }
    }

    fn record(&self, bytes: u64) {
        let uploaded = self.uploaded.fetch_add(bytes, Ordering::SeqCst) + bytes;
        let percentage = if self.total == 0 {
            100
        } else {
            ((uploaded as f64 / self.total as f64) * 100.0).min(100.0) as u64
        };

        let last = self.last_reported.load(Ordering::SeqCst);
        if percentage >= last + 5 || (percentage == 100 && last != 100) {
            self.last_reported.store(percentage, Ordering::SeqCst);
            if let Some(ref cb) = self.callback {
                cb(UploadProgress {
                    uploaded_bytes: uploaded,
                    total_bytes: self.total,
                    percentage: percentage as u8,
                });
            }
        }
    }
}

/// アップロードオーケストレータ
///
/// 完成した音声と文字起こしの一式をリモートストレージへ届ける。
/// HTTP 4xx はクライアント/バリデーションエラーとして再試行せず、
/// ネットワーク断と5xxのみを再試行可能として扱う。転送は
/// クライアントのタイムアウトで上限が切られ、永遠にハングしない。
pub struct Uploader {
    config: UploadConfig,
    client: reqwest::Client,
}

impl Uploader {
    pub fn new(config: UploadConfig) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| UploadError::Terminal(format!("HTTPクライアント作成失敗: {e}")))?;
        Ok(Self { config, client })
    }

    /// 成果物一式を1回アップロードする
    ///
    /// 各ファイルはストリーミングで送信し、事前に計算した合計に
    /// 対する累積バイト数を進捗として報告する。
    pub async fn upload(
        &self,
        bundle: &UploadBundle,
        metadata: &serde_json::Value,
        on_progress: Option<UploadProgressFn>,
    ) -> Result<UploadResponse, UploadError> {
        let mut all_files: Vec<(&Path, &str, &str)> = Vec::new();
        for path in &bundle.audio_files {
            all_files.push((path, "audio", "audio/wav"));
        }
        if let Some(path) = &bundle.transcript_json {
            all_files.push((path, "transcript", "application/json"));
        }
        if let Some(path) = &bundle.transcript_markdown {
            all_files.push((path, "transcriptMarkdown", "text/markdown"));
        }

        let mut total_bytes = 0u64;
        for (path, _, _) in &all_files {
            total_bytes += tokio::fs::metadata(path)
                .await
                .map_err(|e| {
                    UploadError::Terminal(format!("ローカルファイルを確認できません: {:?}: {}", path, e))
                })?
                .len();
        }

        let progress = Arc::new(ProgressState::new(total_bytes, on_progress));

        let mut form = multipart::Form::new().text("metadata", metadata.to_string());
        for (path, field, mime) in all_files {
            form = form.part(field.to_string(), file_part(path, mime, progress.clone()).await?);
        }

        log::info!(
            "アップロード開始: セッション {} ({} ファイル, {:.1} MB)",
            bundle.session_id,
            bundle.audio_files.len(),
            total_bytes as f64 / (1024.0 * 1024.0)
        );

        let mut request = self
            .client
            .post(format!("{}/recordings", self.config.endpoint.trim_end_matches('/')));
        if !self.config.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let response = request
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Retryable(format!("接続に失敗: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let parsed: UploadResponse = response
                .json()
                .await
                .map_err(|e| UploadError::Terminal(format!("レスポンスのパースに失敗: {e}")))?;
            log::info!(
                "アップロード完了: recordingId={} viewUrl={}",
                parsed.recording_id,
                parsed.view_url
            );
            Ok(parsed)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }

    /// 再試行付きアップロード
    ///
    /// 再試行可能な失敗のみを `2^attempt` 秒の指数バックオフで
    /// やり直す。4xx確定後は再試行しない。回数を使い切ったら
    /// 最後の失敗を返す。
    pub async fn upload_with_retry(
        &self,
        bundle: &UploadBundle,
        metadata: &serde_json::Value,
        max_retries: u32,
        on_progress: Option<UploadProgressFn>,
    ) -> Result<UploadResponse, UploadError> {
        retry_with_backoff(max_retries, || {
            self.upload(bundle, metadata, on_progress.clone())
        })
        .await
    }

    /// リカバリした単一セグメントをアップロードする
    pub async fn upload_segment(
        &self,
        recording_id: &str,
        wav_path: &Path,
        metadata: &serde_json::Value,
    ) -> Result<(), UploadError> {
        let byte_size = tokio::fs::metadata(wav_path)
            .await
            .map_err(|e| {
                UploadError::Terminal(format!("ローカルファイルを確認できません: {:?}: {}", wav_path, e))
            })?
            .len();
        let progress = Arc::new(ProgressState::new(byte_size, None));

        let form = multipart::Form::new()
            .text("metadata", metadata.to_string())
            .part("audio", file_part(wav_path, "audio/wav", progress).await?);

        let url = format!(
            "{}/recordings/{}/segments",
            self.config.endpoint.trim_end_matches('/'),
            recording_id
        );

        let mut request = self.client.post(url);
        if !self.config.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let response = request
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Retryable(format!("接続に失敗: {e}")))?;

        let status = response.status();
        if status.is_success() {
            log::info!("セグメントアップロード完了: {:?}", wav_path);
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }
}

/// 再試行可能な失敗のみを指数バックオフで再試行する汎用ループ
///
/// 待機時間は `2^attempt` 秒（1回目の失敗後2秒、2回目の失敗後4秒）。
/// 状態遷移は `Pending → Uploading → {Completed | Failed}` で、
/// `Completed` と `Failed(terminal)` だけが吸収状態になる。
pub async fn retry_with_backoff<T, F, Fut>(max_retries: u32, mut op: F) -> Result<T, UploadError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, UploadError>>,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        log::debug!(
            "アップロード状態: {:?} → {:?} (試行 {})",
            UploadState::Pending,
            UploadState::Uploading,
            attempt
        );

        match op().await {
            Ok(value) => {
                log::debug!("アップロード状態: {:?} (試行 {})", UploadState::Completed, attempt);
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt <= max_retries => {
                let delay_secs = 2u64.saturating_pow(attempt);
                log::warn!(
                    "アップロード失敗（試行 {}、状態 {:?}）: {}。{}秒後に再試行します",
                    attempt,
                    UploadState::FailedRetryable,
                    e,
                    delay_secs
                );
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            }
            Err(e) => {
                let state = if e.is_retryable() {
                    // 再試行可能だが回数を使い切った
                    UploadState::FailedRetryable
                } else {
                    UploadState::FailedTerminal
                };
                log::error!("アップロードを断念します（試行 {}、状態 {:?}）: {}", attempt, state, e);
                return Err(e);
            }
        }
    }
}

/// アップロード成功後のローカルファイル削除（ベストエフォート）
///
/// 削除の失敗はログに残すだけで呼び出し側へ伝播しない。
/// 成功したアップロードという論理的な結果を覆してはならないため。
pub fn cleanup_local_files(bundle: &UploadBundle) {
    match std::fs::remove_dir_all(&bundle.working_dir) {
        Ok(()) => {
            log::info!("ローカル作業ディレクトリを削除しました: {:?}", bundle.working_dir);
        }
        Err(e) => {
            log::warn!(
                "ローカルファイルの削除に失敗しました（アップロードは成功済み）: {:?}: {}",
                bundle.working_dir,
                e
            );
        }
    }
}

/// HTTPステータスを再試行可能性で分類する
fn classify_status(status: reqwest::StatusCode, body: &str) -> UploadError {
    if status.is_client_error() {
        UploadError::Terminal(format!("{} - {}", status, body))
    } else {
        UploadError::Retryable(format!("{} - {}", status, body))
    }
}

/// ファイルをストリーミング送信するmultipartパートを作る
///
/// 読み取った各チャンクを共有の進捗カウンタへ計上する。
async fn file_part(
    path: &Path,
    mime: &str,
    progress: Arc<ProgressState>,
) -> Result<multipart::Part, UploadError> {
    use tokio::io::AsyncReadExt;

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| UploadError::Terminal(format!("ローカルファイルを確認できません: {:?}: {}", path, e)))?;
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| UploadError::Terminal(format!("ローカルファイルを開けません: {:?}: {}", path, e)))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    let stream = async_stream::stream! {
        let mut file = file;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    progress.record(n as u64);
                    yield Ok::<Vec<u8>, std::io::Error>(buf[..n].to_vec());
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    };

    multipart::Part::stream_with_length(Body::wrap_stream(stream), metadata.len())
        .file_name(file_name)
        .mime_str(mime)
        .map_err(|e| UploadError::Terminal(format!("multipartパートの作成に失敗: {e}")))
}
