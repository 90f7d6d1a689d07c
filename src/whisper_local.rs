use crate::config::{ModelConfig, TranscribeConfig};
use crate::error::EngineError;
use crate::model_registry::{default_cache_dir, ensure_model, ModelSize};
use crate::transcribe_backend::{estimate_confidence, TranscribeBackend, TranscribeRequest};
use crate::types::{TranscribeOptions, TranscriptSegment, UserTranscript};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// whisperエンジンが要求する入力サンプリングレート
const WHISPER_SAMPLE_RATE: u32 = 16_000;

/// ローカル whisper バックエンド
///
/// whisper.cpp をプロセス内で実行する。初回の `initialize()` で
/// モデルレジストリからモデルを取得（未キャッシュならダウンロード）し、
/// プロセスローカルなコンテキストにロードする。ロード済みハンドルは
/// このインスタンスが排他的に所有する。
///
/// CPUで動作し、ビルド時のfeature（metal / cuda / vulkan）が有効なら
/// GPUアクセラレーションを使う。
pub struct WhisperLocalBackend {
    model_size: ModelSize,
    cache_dir: PathBuf,
    defaults: TranscribeConfig,
    context: Option<WhisperContext>,
}

impl WhisperLocalBackend {
    /// 構築時にプラットフォーム対応を確認する
    ///
    /// 未対応ホストでは `UnsupportedPlatform` を返し、モデルの
    /// ダウンロードは試みない。確認は能力プローブであり、
    /// ロード失敗を握りつぶす方式は取らない。
    pub fn new(model: &ModelConfig, defaults: &TranscribeConfig) -> Result<Self, EngineError> {
        if let Some(reason) = platform_unsupported_reason() {
            return Err(EngineError::UnsupportedPlatform(reason));
        }

        let cache_dir = resolve_cache_dir(model)?;

        Ok(Self {
            model_size: model.size,
            cache_dir,
            defaults: defaults.clone(),
            context: None,
        })
    }
}

#[async_trait]
impl TranscribeBackend for WhisperLocalBackend {
    fn name(&self) -> &'static str {
        "whisper-local"
    }

    fn is_available(&self) -> bool {
        self.context.is_some()
    }

    async fn initialize(&mut self) -> Result<(), EngineError> {
        if self.context.is_some() {
            return Ok(());
        }

        let model_path = ensure_model(self.model_size, &self.cache_dir, None)
            .await
            .context("モデルの取得に失敗")?;

        let use_gpu = gpu_acceleration_available();
        log::info!(
            "whisperコンテキストをロードします: {:?} (GPU: {})",
            model_path,
            use_gpu
        );

        let params = WhisperContextParameters {
            use_gpu,
            gpu_device: 0,
            flash_attn: false,
            ..Default::default()
        };

        let ctx = WhisperContext::new_with_params(&model_path.to_string_lossy(), params)
            .map_err(|e| anyhow!("モデルのロードに失敗: {:?}: {}", model_path, e))?;

        self.context = Some(ctx);
        log::info!("whisperモデルのロード完了: {}", self.model_size);

        Ok(())
    }

    async fn transcribe_file(
        &self,
        request: &TranscribeRequest,
        options: &TranscribeOptions,
    ) -> Result<UserTranscript, EngineError> {
        let ctx = self.context.as_ref().ok_or(EngineError::NotInitialized)?;

        let (samples, sample_rate) = read_wav_mono_f32(&request.file_path)
            .with_context(|| format!("音声ファイルの読み込みに失敗: {:?}", request.file_path))?;
        let mut samples = resample_linear(samples, sample_rate, WHISPER_SAMPLE_RATE);

        // whisperは1秒未満の入力で不安定になるため無音でパディングする
        let min_samples = (WHISPER_SAMPLE_RATE as f64 * 1.1) as usize;
        if samples.len() < min_samples {
            samples.resize(min_samples, 0.0);
        }

        let language = options
            .language
            .clone()
            .unwrap_or_else(|| self.defaults.language.clone());
        let temperature = options.temperature.unwrap_or(self.defaults.temperature);
        let prompt = options.prompt.clone().or_else(|| self.defaults.prompt.clone());

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some(language.as_str()));
        params.set_translate(false);
        params.set_temperature(temperature);
        if let Some(ref prompt) = prompt {
            params.set_initial_prompt(prompt);
        }
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_suppress_blank(true);

        log::debug!(
            "ローカル文字起こし開始: {:?} ({:.1}秒)",
            request.file_path,
            samples.len() as f64 / WHISPER_SAMPLE_RATE as f64
        );

        let mut state = ctx
            .create_state()
            .map_err(|e| anyhow!("whisperステートの作成に失敗: {}", e))?;
        state
            .full(params, &samples)
            .map_err(|e| anyhow!("whisper実行に失敗: {}", e))?;

        let num_segments = state
            .full_n_segments()
            .map_err(|e| anyhow!("セグメント数の取得に失敗: {}", e))?;

        let mut segments = Vec::new();
        for i in 0..num_segments {
            let text = match state.full_get_segment_text_lossy(i) {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("セグメント {} のテキスト取得に失敗（スキップ）: {}", i, e);
                    continue;
                }
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }

            // t0/t1 は10ミリ秒単位
            let start_offset_sec = state.full_get_segment_t0(i).unwrap_or(0) as f64 / 100.0;
            let end_offset_sec = state.full_get_segment_t1(i).unwrap_or(0) as f64 / 100.0;

            segments.push(TranscriptSegment {
                confidence: estimate_confidence(trimmed, end_offset_sec - start_offset_sec),
                text: trimmed.to_string(),
                start_offset_sec,
                end_offset_sec,
            });
        }

        Ok(UserTranscript::from_segments(
            request.speaker_id.clone(),
            request.speaker_name.clone(),
            request.audio_start_time_ms,
            segments,
        ))
    }

    fn estimate_time(&self, total_audio_secs: f64) -> String {
        // CPU実行時のおおよその実時間比
        let factor = match self.model_size {
            ModelSize::Tiny => 0.3,
            ModelSize::Base => 0.5,
            ModelSize::Small => 1.0,
            ModelSize::Medium => 2.0,
            ModelSize::LargeV3 => 4.0,
        };
        let secs = (total_audio_secs * factor).max(1.0);
        format!(
            "約{}分{}秒（{}モデル・CPU性能に依存）",
            (secs as u64) / 60,
            (secs as u64) % 60,
            self.model_size
        )
    }

    fn release(&mut self) {
        if self.context.take().is_some() {
            log::info!("whisperコンテキストを解放しました");
        }
    }
}

/// ネイティブランタイムが動作しないターゲットなら理由を返す
///
/// whisper.cpp が対応する主要アーキテクチャ以外（wasm等）では
/// 構築自体を拒否する。
pub(crate) fn platform_unsupported_reason() -> Option<String> {
    if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
        None
    } else {
        Some(format!(
            "未対応のアーキテクチャです: {}",
            std::env::consts::ARCH
        ))
    }
}

/// GPUアクセラレーションが使えるビルドかどうか
fn gpu_acceleration_available() -> bool {
    cfg!(any(
        feature = "metal",
        feature = "coreml",
        feature = "cuda",
        feature = "vulkan"
    ))
}

fn resolve_cache_dir(model: &ModelConfig) -> Result<PathBuf, EngineError> {
    match &model.cache_dir {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => Ok(default_cache_dir().context("キャッシュディレクトリの解決に失敗")?),
    }
}

/// WAVファイルをモノラルf32サンプル列として読み込む
///
/// 複数チャンネルはフレームごとの平均でダウンミックスする。
pub(crate) fn read_wav_mono_f32(path: &Path) -> Result<(Vec<f32>, u32)> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("WAVファイルを開けません: {:?}", path))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .into_samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<Result<Vec<_>, _>>()
            .context("WAVサンプルの読み込みに失敗")?,
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("WAVサンプルの読み込みに失敗")?,
    };

    if channels == 1 {
        return Ok((interleaved, spec.sample_rate));
    }

    let mut mono = Vec::with_capacity(interleaved.len() / channels);
    for frame in interleaved.chunks_exact(channels) {
        mono.push(frame.iter().sum::<f32>() / channels as f32);
    }
    Ok((mono, spec.sample_rate))
}

/// 線形補間によるリサンプリング
///
/// 文字起こし前処理用の簡易実装。忠実度よりも依存の少なさを優先する。
pub(crate) fn resample_linear(samples: Vec<f32>, from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples;
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = if idx + 1 < samples.len() {
            samples[idx + 1]
        } else {
            a
        };
        out.push(a + (b - a) * frac);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PcmFormat, SampleFormat};
    use tempfile::TempDir;

    #[test]
    fn test_platform_probe_on_supported_arch() {
        // CIは x86_64 / aarch64 のどちらかで走る
        assert!(platform_unsupported_reason().is_none());
    }

    #[test]
    fn test_construction_does_not_touch_network_or_disk() {
        let model = ModelConfig {
            cache_dir: Some("/nonexistent/cache".to_string()),
            ..ModelConfig::default()
        };
        let backend = WhisperLocalBackend::new(&model, &TranscribeConfig::default()).unwrap();
        // 構築直後はモデル未ロード
        assert!(!backend.is_available());
    }

    #[tokio::test]
    async fn test_transcribe_before_initialize_fails() {
        let model = ModelConfig {
            cache_dir: Some("/nonexistent/cache".to_string()),
            ..ModelConfig::default()
        };
        let backend = WhisperLocalBackend::new(&model, &TranscribeConfig::default()).unwrap();

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

    #[test]
    fn test_resample_identity() {
        let samples = vec![0.0, 0.5, 1.0];
        assert_eq!(resample_linear(samples.clone(), 16000, 16000), samples);
    }

    #[test]
    fn test_resample_downsamples_by_ratio() {
        let samples = vec![0.0f32; 48000];
        let out = resample_linear(samples, 48000, 16000);
        assert_eq!(out.len(), 16000);
    }

    #[test]
    fn test_resample_interpolates() {
        // 2倍へのアップサンプリングで中間値が補間される
        let samples = vec![0.0, 1.0];
        let out = resample_linear(samples, 8000, 16000);
        assert_eq!(out.len(), 4);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_read_wav_mono_f32_downmixes_stereo() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("stereo.wav");
        let format = PcmFormat {
            sample_rate: 16000,
            channels: 2,
            sample_format: SampleFormat::S16Le,
        };
        // 左: 16384, 右: 0 → モノラル平均 0.25
        let samples: Vec<i16> = [16384i16, 0].repeat(100);
        crate::wav_writer::write_wav(&path, &samples, format)?;

        let (mono, rate) = read_wav_mono_f32(&path)?;
        assert_eq!(rate, 16000);
        assert_eq!(mono.len(), 100);
        assert!((mono[0] - 0.25).abs() < 1e-3);
        Ok(())
    }
}
