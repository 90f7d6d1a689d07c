use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// モデルサイズ（品質ティア）
///
/// ネイティブバックエンドが使うモデルの静的レジストリのキー。
/// サイズが大きいほど精度が上がり、処理時間とダウンロード量が増える。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    LargeV3,
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::LargeV3 => "large-v3",
        };
        write!(f, "{}", name)
    }
}

/// モデルレジストリの1エントリ
///
/// サイズタグをファイル名・取得URL・想定サイズに解決する。
pub struct ModelSpec {
    pub size: ModelSize,
    pub filename: &'static str,
    pub url: &'static str,
    /// 想定ファイルサイズ（バイト）。進捗計算のフォールバックと
    /// 破損検出の下限判定に使う
    pub approx_bytes: u64,
}

/// 静的モデルレジストリ
pub const MODEL_SPECS: &[ModelSpec] = &[
    ModelSpec {
        size: ModelSize::Tiny,
        filename: "ggml-tiny.bin",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.bin",
        approx_bytes: 78 * 1024 * 1024,
    },
    ModelSpec {
        size: ModelSize::Base,
        filename: "ggml-base.bin",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin",
        approx_bytes: 148 * 1024 * 1024,
    },
    ModelSpec {
        size: ModelSize::Small,
        filename: "ggml-small.bin",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-small.bin",
        approx_bytes: 488 * 1024 * 1024,
    },
    ModelSpec {
        size: ModelSize::Medium,
        filename: "ggml-medium.bin",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-medium.bin",
        approx_bytes: 1530 * 1024 * 1024,
    },
    ModelSpec {
        size: ModelSize::LargeV3,
        filename: "ggml-large-v3.bin",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-large-v3.bin",
        approx_bytes: 3100 * 1024 * 1024,
    },
];

/// サイズタグをレジストリエントリに解決する
pub fn spec_for(size: ModelSize) -> &'static ModelSpec {
    // レジストリは全サイズを網羅している（テストで保証）
    MODEL_SPECS
        .iter()
        .find(|s| s.size == size)
        .unwrap_or(&MODEL_SPECS[0])
}

/// デフォルトのモデルキャッシュディレクトリ
pub fn default_cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow!("キャッシュディレクトリを特定できません"))?;
    Ok(base.join("vc-transcribe").join("models"))
}

/// ダウンロード進捗
#[derive(Clone, Copy, Debug)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub percentage: u8,
}

pub type DownloadProgressFn = Box<dyn Fn(DownloadProgress) + Send + Sync>;

/// モデルをキャッシュに用意し、ローカルパスを返す
///
/// キャッシュ済みで破損していなければネットワークアクセスなしで返す。
/// 未取得の場合はストリーミングでダウンロードする（全体をメモリに
/// 展開しない）。書き込みは一時ファイルに行い、完了後にリネームする。
/// 別プロセスの読み取りが書き込み途中のモデルを観測することはない。
///
/// 進捗コールバックはおおよそ5%刻みで呼ばれる。
pub async fn ensure_model(
    size: ModelSize,
    cache_dir: &Path,
    progress: Option<&DownloadProgressFn>,
) -> Result<PathBuf> {
    let spec = spec_for(size);
    let path = cache_dir.join(spec.filename);

    if path.exists() {
        match validate_model_file(&path) {
            Ok(()) => {
                log::debug!("キャッシュ済みモデルを使用: {:?}", path);
                return Ok(path);
            }
            Err(e) => {
                log::warn!("キャッシュ済みモデルが破損しています（再取得します）: {}", e);
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("破損モデルの削除に失敗: {:?}", path))?;
            }
        }
    }

    tokio::fs::create_dir_all(cache_dir)
        .await
        .with_context(|| format!("モデルキャッシュディレクトリの作成に失敗: {:?}", cache_dir))?;

    log::info!(
        "モデル {} をダウンロードします: {} ({:.0} MB)",
        size,
        spec.url,
        spec.approx_bytes as f64 / (1024.0 * 1024.0)
    );

    let client = reqwest::Client::new();
    let response = client
        .get(spec.url)
        .send()
        .await
        .with_context(|| format!("モデルダウンロードの開始に失敗: {}", spec.url))?;

    if !response.status().is_success() {
        anyhow::bail!("モデルダウンロードに失敗: HTTP {}", response.status());
    }

    let total_bytes = response.content_length().unwrap_or(spec.approx_bytes);

    // 一時ファイルへ書き込み、完了後にリネームする
    let part_path = cache_dir.join(format!("{}.part", spec.filename));
    let mut file = tokio::fs::File::create(&part_path)
        .await
        .with_context(|| format!("一時ファイルの作成に失敗: {:?}", part_path))?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut last_reported: u8 = 0;

    if let Some(cb) = progress {
        cb(DownloadProgress {
            downloaded_bytes: 0,
            total_bytes,
            percentage: 0,
        });
    }

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("ダウンロードストリームの読み取りに失敗")?;
        file.write_all(&chunk)
            .await
            .context("一時ファイルへの書き込みに失敗")?;
        downloaded += chunk.len() as u64;

        let percentage = percentage(downloaded, total_bytes);
        // 5%刻みで報告
        if percentage >= last_reported.saturating_add(5) || percentage == 100 {
            log::info!(
                "モデルダウンロード進捗: {}% ({:.1} MB / {:.1} MB)",
                percentage,
                downloaded as f64 / (1024.0 * 1024.0),
                total_bytes as f64 / (1024.0 * 1024.0)
            );
            if let Some(cb) = progress {
                cb(DownloadProgress {
                    downloaded_bytes: downloaded,
                    total_bytes,
                    percentage,
                });
            }
            last_reported = percentage;
        }
    }

    file.flush().await.context("一時ファイルのflushに失敗")?;
    drop(file);

    validate_model_file(&part_path)
        .with_context(|| "ダウンロードしたモデルの検証に失敗")?;

    tokio::fs::rename(&part_path, &path)
        .await
        .with_context(|| format!("モデルファイルのリネームに失敗: {:?}", path))?;

    log::info!("モデルダウンロード完了: {:?} ({} バイト)", path, downloaded);

    Ok(path)
}

/// モデルファイルのマジックナンバーを検証する
///
/// GGML/GGUF系の既知ヘッダで始まらないファイルは破損とみなす。
pub fn validate_model_file(path: &Path) -> Result<()> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)
        .with_context(|| format!("モデルファイルを開けません: {:?}", path))?;

    let mut buffer = [0u8; 8];
    file.read_exact(&mut buffer)
        .with_context(|| format!("モデルファイルのヘッダを読めません: {:?}", path))?;

    // エンディアン・バージョン違いを含む既知のマジックナンバー
    let known = [
        b"ggml".as_slice(),
        b"GGUF".as_slice(),
        b"ggmf".as_slice(),
        b"lmgg".as_slice(),
        b"FUGU".as_slice(),
        b"fmgg".as_slice(),
    ];
    if known.iter().any(|magic| buffer.starts_with(magic)) {
        Ok(())
    } else {
        Err(anyhow!(
            "モデルファイルが不正です（マジックナンバー不一致）: {:?}",
            String::from_utf8_lossy(&buffer[..4])
        ))
    }
}

fn percentage(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((downloaded as f64 / total as f64) * 100.0).min(100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_registry_covers_all_sizes() {
        for size in [
            ModelSize::Tiny,
            ModelSize::Base,
            ModelSize::Small,
            ModelSize::Medium,
            ModelSize::LargeV3,
        ] {
            let spec = spec_for(size);
            assert_eq!(spec.size, size);
            assert!(spec.url.starts_with("https://"));
            assert!(spec.filename.ends_with(".bin"));
        }
    }

    #[test]
    fn test_model_size_serialization() {
        assert_eq!(serde_json::to_string(&ModelSize::LargeV3).unwrap(), r#""large-v3""#);
        assert_eq!(serde_json::to_string(&ModelSize::Base).unwrap(), r#""base""#);

        let parsed: ModelSize = serde_json::from_str(r#""medium""#).unwrap();
        assert_eq!(parsed, ModelSize::Medium);
    }

    #[test]
    fn test_validate_model_file_accepts_ggml_magic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"ggml\x01\x02\x03\x04rest-of-model").unwrap();
        file.flush().unwrap();

        assert!(validate_model_file(file.path()).is_ok());
    }

    #[test]
    fn test_validate_model_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"<html>not a model</html>").unwrap();
        file.flush().unwrap();

        assert!(validate_model_file(file.path()).is_err());
    }

    #[test]
    fn test_percentage_math() {
        assert_eq!(percentage(0, 100), 0);
        assert_eq!(percentage(50, 100), 50);
        assert_eq!(percentage(100, 100), 100);
        assert_eq!(percentage(10, 0), 0);
    }
}
