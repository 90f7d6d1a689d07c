use crate::segment_scanner::{group_by_user, session_info, SegmentScanner};
use crate::types::{ManifestParticipant, ManifestSegment, PcmFormat, RecoveryManifest};
use crate::uploader::Uploader;
use crate::wav_writer::{estimate_duration_ms, pcm_to_wav, wav_duration_ms};
use anyhow::{Context, Result};
use serde_json::json;
use std::path::{Path, PathBuf};

/// リカバリ結果の集計
///
/// セグメント単位の失敗は `failures` に集め、バッチ全体は
/// 最後まで続行する。
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub manifest_path: Option<PathBuf>,
    pub recovered_segments: usize,
    pub uploaded: usize,
    pub failures: Vec<(PathBuf, String)>,
}

/// クラッシュ後に取り残されたセグメントを復元して再アップロードする
///
/// キャプチャ時のメモリ上の状態には一切依存せず、ディスク上の
/// 残骸だけを入力とする。スキャナでセグメントを列挙し直し、
/// PCM残骸をWAVへ変換し、失われた再生時間をバイトサイズと
/// 明示されたPCMフォーマットから推定して `manifest.json` を書き出す。
/// その後、各セグメントを個別にアップロードする（`uploader` が
/// `None` のときは復元とマニフェスト生成のみ）。
pub async fn recover_orphaned_segments(
    session_dir: &Path,
    recording_id: &str,
    format: PcmFormat,
    uploader: Option<&Uploader>,
) -> Result<RecoveryReport> {
    log::info!(
        "オーファンセグメントのリカバリを開始します: {:?} (recordingId={})",
        session_dir,
        recording_id
    );

    let scanner = SegmentScanner::new(format)?;
    let scan = scanner.scan(session_dir)?;

    if scan.segments.is_empty() {
        log::warn!("復元可能なセグメントが見つかりません: {:?}", session_dir);
        return Ok(RecoveryReport::default());
    }

    let info = session_info(session_dir, &scan.segments);
    let groups = group_by_user(scan.segments);

    let mut report = RecoveryReport::default();
    let mut manifest_segments = Vec::new();
    // (WAVパス, マニフェストエントリ) — アップロード時に再利用する
    let mut recovered: Vec<(PathBuf, ManifestSegment)> = Vec::new();

    for (speaker_id, segments) in &groups {
        for segment in segments {
            let is_pcm = segment
                .file_path
                .extension()
                .map(|e| e == "pcm")
                .unwrap_or(false);

            let (wav_path, duration_ms) = if is_pcm {
                let wav_path = match pcm_to_wav(&segment.file_path, segment.format) {
                    Ok(path) => path,
                    Err(e) => {
                        log::warn!("変換失敗（スキップ）: {:?}: {}", segment.file_path, e);
                        report.failures.push((segment.file_path.clone(), e.to_string()));
                        continue;
                    }
                };
                // 本来の再生時間メタデータは失われているため
                // 生データのサイズとフォーマットから推定する
                (wav_path, estimate_duration_ms(segment.byte_size, segment.format))
            } else {
                let duration = wav_duration_ms(&segment.file_path).unwrap_or_else(|_| {
                    estimate_duration_ms(
                        segment.byte_size.saturating_sub(44), // WAVヘッダ分
                        segment.format,
                    )
                });
                (segment.file_path.clone(), duration)
            };

            let file_name = wav_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let file_size = std::fs::metadata(&wav_path).map(|m| m.len()).unwrap_or(0);

            let entry = ManifestSegment {
                speaker_id: speaker_id.clone(),
                file_name,
                absolute_start_time: segment.capture_timestamp_ms,
                absolute_end_time: segment.capture_timestamp_ms + duration_ms,
                duration: duration_ms,
                file_size,
            };
            manifest_segments.push(entry.clone());
            recovered.push((wav_path, entry));
        }
    }

    report.recovered_segments = recovered.len();

    let manifest = RecoveryManifest {
        session_id: info.session_id.clone(),
        session_start_time: info.start_time_ms,
        session_end_time: info.end_time_ms,
        participants: info
            .participants
            .iter()
            .map(|(id, name)| ManifestParticipant {
                speaker_id: id.clone(),
                speaker_name: name.clone(),
            })
            .collect(),
        segments: manifest_segments,
        recovered: true,
        pcm_format: format,
    };

    let manifest_path = session_dir.join("manifest.json");
    let manifest_json =
        serde_json::to_string_pretty(&manifest).context("マニフェストのシリアライズに失敗")?;
    std::fs::write(&manifest_path, manifest_json)
        .with_context(|| format!("マニフェストの書き込みに失敗: {:?}", manifest_path))?;
    log::info!("マニフェストを書き出しました: {:?}", manifest_path);
    report.manifest_path = Some(manifest_path);

    if let Some(uploader) = uploader {
        for (wav_path, entry) in &recovered {
            let metadata = json!({
                "speakerId": entry.speaker_id,
                "fileName": entry.file_name,
                "absoluteStartTime": entry.absolute_start_time,
                "absoluteEndTime": entry.absolute_end_time,
                "duration": entry.duration,
                "fileSize": entry.file_size,
                "recovered": true,
            });

            match uploader.upload_segment(recording_id, wav_path, &metadata).await {
                Ok(()) => report.uploaded += 1,
                Err(e) => {
                    log::warn!("セグメントアップロード失敗（続行します）: {:?}: {}", wav_path, e);
                    report.failures.push((wav_path.clone(), e.to_string()));
                }
            }
        }
    } else {
        log::info!("アップロード先が未設定のため、復元のみ行いました");
    }

    log::info!(
        "リカバリ完了: 復元 {} 件 / アップロード成功 {} 件 / 失敗 {} 件",
        report.recovered_segments,
        report.uploaded,
        report.failures.len()
    );

    Ok(report)
}
