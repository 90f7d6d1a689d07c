use thiserror::Error;

/// 文字起こしエンジンのエラー分類
///
/// 呼び出し側が再試行・中断・フォールバックを判断できるよう、
/// バックエンド共通の分類で表現する。個々のファイルの失敗は
/// バッチ全体を止めず、収集して継続するのが原則。
#[derive(Debug, Error)]
pub enum EngineError {
    /// `initialize()` 前に文字起こしを呼んだ（呼び出し側のバグ）
    #[error("バックエンドが初期化されていません")]
    NotInitialized,

    /// ネイティブランタイムがこのホストでは動作しない。
    /// 構築時点で返されるため、呼び出し側は別バックエンドへ
    /// フォールバックできる。
    #[error("このプラットフォームでは利用できません: {0}")]
    UnsupportedPlatform(String),

    /// バックエンドのサイズ上限超過（クラウドAPIのハードリミット等）
    #[error("音声ファイルが大きすぎます: {size} バイト（上限 {limit} バイト）")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// レート制限（クラウドのみ）。時間を置けば再試行できる。
    #[error("レート制限に達しました")]
    RateLimited,

    /// 認証・認可の失敗（クラウドのみ）。再試行しても解決しない。
    #[error("認証に失敗しました: {0}")]
    Auth(String),

    /// その他のエンジン内部エラー
    #[error("文字起こしに失敗しました: {0}")]
    TranscriptionFailed(String),
}

/// anyhowエラーを不透明なエンジン失敗として取り込む
///
/// `?` でコンテキスト付きのまま `TranscriptionFailed` に変換できる。
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::TranscriptionFailed(format!("{:#}", err))
    }
}

/// アップロードエラー
///
/// 再試行可能性で二分する。4xx系（クライアント/バリデーションエラー）は
/// Terminal、ネットワーク断や5xx系は Retryable。
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("アップロード失敗（再試行可能）: {0}")]
    Retryable(String),

    #[error("アップロード失敗（再試行不可）: {0}")]
    Terminal(String),
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Retryable(_))
    }
}

/// ファイル名文法のパースエラー
///
/// スキャン対象に文法へ一致しないファイルが混ざるのは正常系で、
/// 該当ファイルをスキップする根拠としてログに残すだけ。
/// スキャン全体を中断する理由にはならない。
#[derive(Debug, Error)]
#[error("ファイル名を解析できません: {file_name} ({reason})")]
pub struct ParseError {
    pub file_name: String,
    pub reason: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_error_retryability() {
        assert!(UploadError::Retryable("503".to_string()).is_retryable());
        assert!(!UploadError::Terminal("400".to_string()).is_retryable());
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::PayloadTooLarge {
            size: 30_000_000,
            limit: 26_214_400,
        };
        let msg = err.to_string();
        assert!(msg.contains("30000000"));
        assert!(msg.contains("26214400"));
    }
}
