use crate::model_registry::ModelSize;
use crate::types::{PcmFormat, SampleFormat};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub transcribe: TranscribeConfig,
    pub whisper_api: Option<WhisperApiConfig>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// 生PCMのフォーマット設定
///
/// 上流のキャプチャが実際に書き込んだフォーマットと一致している
/// 必要がある。不一致のまま変換すると壊れた音声になる。
///
/// # デフォルト値
///
/// - `sample_rate`: 48000 Hz（ボイスチャンネルの標準）
/// - `channels`: 2（ステレオ）
/// - `sample_format`: s16_le
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_sample_format")]
    pub sample_format: SampleFormat,
}

impl AudioConfig {
    /// 設定値から [`PcmFormat`] を組み立てる
    pub fn format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_format: self.sample_format,
        }
    }
}

/// 文字起こしバックエンドの種類
///
/// プロセスごとに起動時に1つだけ選択される。バッチの途中で
/// 切り替えることはない。
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranscribeBackendType {
    /// OpenAI互換 Whisper API（クラウド）
    Cloud,
    /// whisper.cpp をプロセス内で実行（CPU / ビルド時featureでGPU）
    Local,
    /// GPUアクセラレーション済みエンジンバイナリ
    Gpu,
}

/// 文字起こし設定
///
/// # デフォルト値
///
/// - `backend`: "local"（認証情報なしで動くため）
/// - `language`: "ja"
/// - `temperature`: 0.0（決定的な出力）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscribeConfig {
    #[serde(default = "default_backend")]
    pub backend: TranscribeBackendType,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// エンジンへのヒントプロンプト。省略可能
    pub prompt: Option<String>,
}

/// Whisper API 設定（backend = "cloud" のとき必須）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhisperApiConfig {
    /// APIキー
    pub api_key: String,
    /// モデル名（通常 "whisper-1"）
    #[serde(default = "default_whisper_model")]
    pub model: String,
    /// エンドポイントURL
    #[serde(default = "default_whisper_endpoint")]
    pub endpoint: String,
    /// 1リクエストのタイムアウト（秒）
    #[serde(default = "default_api_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// ネイティブモデル設定（backend = "local" / "gpu"）
///
/// # デフォルト値
///
/// - `size`: "base"（速度と精度のバランス）
/// - `cache_dir`: 未指定ならOSのキャッシュディレクトリ
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_size")]
    pub size: ModelSize,
    /// モデルキャッシュディレクトリ。省略可能
    pub cache_dir: Option<String>,
    /// GPUエンジンバイナリのパス。省略時はPATHから探索する
    pub engine_binary: Option<String>,
}

/// アップロード設定
///
/// # デフォルト値
///
/// - `endpoint`: ""（空のときアップロードをスキップ）
/// - `max_retries`: 3 回
/// - `timeout_seconds`: 300 秒（これを超えた転送は失敗扱い）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_upload_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// 出力設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// アップロード成功後もローカルファイルを残すかどうか
    #[serde(default)]
    pub keep_local_files: bool,
}

// Default functions
fn default_sample_rate() -> u32 {
    48000 // ボイスチャンネルの標準
}

fn default_channels() -> u16 {
    2
}

fn default_sample_format() -> SampleFormat {
    SampleFormat::S16Le
}

fn default_backend() -> TranscribeBackendType {
    TranscribeBackendType::Local
}

fn default_language() -> String {
    "ja".to_string()
}

fn default_temperature() -> f32 {
    0.0
}

fn default_whisper_model() -> String {
    "whisper-1".to_string()
}

fn default_whisper_endpoint() -> String {
    "https://api.openai.com/v1/audio/transcriptions".to_string()
}

fn default_api_timeout_seconds() -> u64 {
    120
}

fn default_model_size() -> ModelSize {
    ModelSize::Base
}

fn default_max_retries() -> u32 {
    3
}

fn default_upload_timeout_seconds() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            transcribe: TranscribeConfig::default(),
            whisper_api: None, // デフォルトではクラウド設定なし
            model: ModelConfig::default(),
            upload: UploadConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            sample_format: default_sample_format(),
        }
    }
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            language: default_language(),
            temperature: default_temperature(),
            prompt: None,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            size: default_model_size(),
            cache_dir: None,
            engine_binary: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            max_retries: default_max_retries(),
            timeout_seconds: default_upload_timeout_seconds(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            keep_local_files: false,
        }
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成する。
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    ///
    /// # Errors
    ///
    /// ファイルが存在するがパースに失敗した場合にエラーを返す。
    /// ファイルが存在しない場合はエラーにならず、デフォルト設定を返す。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.audio.sample_format, SampleFormat::S16Le);
        assert_eq!(config.transcribe.backend, TranscribeBackendType::Local);
        assert_eq!(config.transcribe.language, "ja");
        assert_eq!(config.model.size, ModelSize::Base);
        assert_eq!(config.upload.max_retries, 3);
        assert!(config.upload.endpoint.is_empty());
        assert!(config.whisper_api.is_none());
    }

    #[test]
    fn test_write_and_read_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        // デフォルト設定を書き込み
        Config::write_default(path).unwrap();

        // 読み込み
        let config = Config::from_file(path).unwrap();
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.transcribe.backend, TranscribeBackendType::Local);
    }

    #[test]
    fn test_custom_config() {
        let toml_content = r#"
[audio]
sample_rate = 44100
channels = 1
sample_format = "s16_le"

[transcribe]
backend = "cloud"
language = "en"
temperature = 0.2
prompt = "radio chatter"

[whisper_api]
api_key = "sk-test"
model = "whisper-1"

[model]
size = "small"
cache_dir = "/tmp/models"

[upload]
endpoint = "https://storage.example.com/api"
api_key = "token"
max_retries = 5
timeout_seconds = 60

[output]
log_level = "debug"
keep_local_files = true
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();

        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.transcribe.backend, TranscribeBackendType::Cloud);
        assert_eq!(config.transcribe.language, "en");
        assert_eq!(config.transcribe.temperature, 0.2);
        assert_eq!(config.transcribe.prompt.as_deref(), Some("radio chatter"));

        let api = config.whisper_api.unwrap();
        assert_eq!(api.api_key, "sk-test");
        // 省略したフィールドはデフォルト値
        assert_eq!(api.endpoint, "https://api.openai.com/v1/audio/transcriptions");

        assert_eq!(config.model.size, ModelSize::Small);
        assert_eq!(config.model.cache_dir.as_deref(), Some("/tmp/models"));
        assert_eq!(config.upload.endpoint, "https://storage.example.com/api");
        assert_eq!(config.upload.max_retries, 5);
        assert_eq!(config.output.log_level, "debug");
        assert!(config.output.keep_local_files);
    }

    #[test]
    fn test_partial_config() {
        // 一部の設定のみ記述した場合、残りはデフォルト値が使われる
        let toml_content = r#"
[transcribe]
backend = "gpu"

[model]
size = "large-v3"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();

        // 指定した値
        assert_eq!(config.transcribe.backend, TranscribeBackendType::Gpu);
        assert_eq!(config.model.size, ModelSize::LargeV3);

        // デフォルト値
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.transcribe.language, "ja");
        assert_eq!(config.upload.max_retries, 3);
    }

    #[test]
    fn test_load_or_default_nonexistent() {
        let config = Config::load_or_default("nonexistent_file.toml").unwrap();
        // デフォルト設定が返されることを確認
        assert_eq!(config.audio.sample_rate, 48000);
    }

    #[test]
    fn test_audio_config_to_pcm_format() {
        let config = AudioConfig::default();
        let format = config.format();
        assert_eq!(format.sample_rate, 48000);
        assert_eq!(format.channels, 2);
        assert_eq!(format.bytes_per_second(), 192_000);
    }
}
