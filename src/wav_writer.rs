use crate::types::PcmFormat;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// 生PCMファイルをWAVコンテナに変換する
///
/// ヘッダなしのサンプル列を固定長ヘッダ付きの自己記述形式で包む。
/// 変換は決定的かつ冪等: 変換先が既に存在する場合は何もせず
/// そのパスを返す（再エンコードしない）。
///
/// # Arguments
///
/// * `pcm_path` - 生PCMファイルのパス
/// * `format` - キャプチャ側が書き込んだPCMフォーマット
///
/// # Errors
///
/// PCMファイルの読み込みまたはWAVファイルの書き込みに失敗した場合に
/// エラーを返す。
pub fn pcm_to_wav(pcm_path: &Path, format: PcmFormat) -> Result<PathBuf> {
    let wav_path = pcm_path.with_extension("wav");

    if wav_path.exists() {
        log::debug!("変換済みのためスキップ: {:?}", wav_path);
        return Ok(wav_path);
    }

    let data = fs::read(pcm_path)
        .with_context(|| format!("PCMファイルの読み込みに失敗: {:?}", pcm_path))?;

    let frame_bytes = format.frame_bytes() as usize;
    let remainder = data.len() % frame_bytes;
    if remainder != 0 {
        // フレーム境界の端数は書き込み途中のクラッシュ痕。切り捨てる
        log::warn!(
            "{:?}: フレーム境界に揃わない {} バイトを切り捨てます",
            pcm_path,
            remainder
        );
    }
    let usable = &data[..data.len() - remainder];

    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.sample_format.bits_per_sample(),
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(&wav_path, spec)
        .with_context(|| format!("WAVファイルの作成に失敗: {:?}", wav_path))?;

    for chunk in usable.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        writer
            .write_sample(sample)
            .with_context(|| "WAVファイルへのサンプル書き込みに失敗")?;
    }

    writer
        .finalize()
        .with_context(|| "WAVファイルのファイナライズに失敗")?;

    log::info!(
        "PCM→WAV変換完了: {:?} ({} バイト → {:.2}秒)",
        wav_path,
        usable.len(),
        usable.len() as f64 / format.bytes_per_second() as f64
    );

    Ok(wav_path)
}

/// サンプル列をWAVファイルとして書き出す
///
/// テストデータ生成とリカバリ検証に使う補助関数。
pub fn write_wav(path: &Path, samples: &[i16], format: PcmFormat) -> Result<()> {
    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.sample_format.bits_per_sample(),
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("WAVファイルの作成に失敗: {:?}", path))?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .with_context(|| "WAVファイルへのサンプル書き込みに失敗")?;
    }
    writer
        .finalize()
        .with_context(|| "WAVファイルのファイナライズに失敗")?;
    Ok(())
}

/// 生PCMのバイトサイズから再生時間を推定する（ミリ秒）
///
/// キャプチャ時のメタデータが失われたリカバリ経路で使う。
/// フォーマットは引数で明示し、暗黙の仮定を持たない。
pub fn estimate_duration_ms(byte_size: u64, format: PcmFormat) -> u64 {
    let bps = format.bytes_per_second();
    if bps == 0 {
        return 0;
    }
    byte_size * 1000 / bps
}

/// WAVファイルの再生時間を読み取る（ミリ秒）
pub fn wav_duration_ms(path: &Path) -> Result<u64> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("WAVファイルを開けません: {:?}", path))?;
    let spec = reader.spec();
    let frames = reader.duration() as u64;
    if spec.sample_rate == 0 {
        return Ok(0);
    }
    Ok(frames * 1000 / spec.sample_rate as u64)
}
