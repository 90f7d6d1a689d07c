use crate::error::ParseError;
use crate::types::{PcmFormat, Segment, SessionInfo};
use anyhow::{Context, Result};
use regex_lite::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// スキャン結果
///
/// 文法に一致しなかったファイルは `skipped` に数えるだけで、
/// スキャン自体は失敗しない。
#[derive(Debug)]
pub struct ScanResult {
    pub segments: Vec<Segment>,
    pub skipped: usize,
}

/// セグメントストアスキャナ
///
/// セッションディレクトリを走査し、ファイル名に埋め込まれた
/// メタデータから話者→セグメント列の対応を再構築する。
/// キャプチャ時のメモリ上の状態には一切依存しないため、
/// クラッシュ後の部分的なディレクトリに対しても動作する。
///
/// 対応するファイル名文法:
///
/// - `temp_{speakerId}_seg{index}_{timestampMs}_{random}.pcm` — 生キャプチャ
/// - `segment_{index:3桁}.wav` — 話者名のサブディレクトリ配下の変換済みファイル
pub struct SegmentScanner {
    temp_pattern: Regex,
    wav_pattern: Regex,
    speaker_dir_pattern: Regex,
    format: PcmFormat,
}

/// `temp_*.pcm` ファイル名から取り出したメタデータ
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedTempName {
    pub speaker_id: String,
    pub segment_index: u32,
    pub capture_timestamp_ms: u64,
}

impl SegmentScanner {
    pub fn new(format: PcmFormat) -> Result<Self> {
        Ok(Self {
            temp_pattern: Regex::new(r"^temp_(\d+)_seg(\d+)_(\d+)_([0-9A-Za-z]+)\.pcm$")
                .context("tempファイル名パターンのコンパイルに失敗")?,
            wav_pattern: Regex::new(r"^segment_(\d{3})\.wav$")
                .context("wavファイル名パターンのコンパイルに失敗")?,
            speaker_dir_pattern: Regex::new(r"^(\d{6,})[-_](.+)$")
                .context("話者ディレクトリ名パターンのコンパイルに失敗")?,
            format,
        })
    }

    /// ディレクトリを再帰的に走査してセグメントを列挙する
    ///
    /// 文法に一致しないファイルはスキップして数えるだけで、
    /// 1つの不正なファイルがスキャン全体を失敗させることはない。
    /// 解析できるセグメントが1つもない場合も空の結果を返すだけで
    /// エラーにはしない（致命的かどうかは呼び出し側が決める）。
    pub fn scan(&self, dir: &Path) -> Result<ScanResult> {
        let mut segments = Vec::new();
        let mut skipped = 0usize;

        self.walk(dir, None, &mut segments, &mut skipped, true)?;

        // 決定的な並びにしておく（話者ID → セグメント番号）
        segments.sort_by(|a, b| {
            (a.speaker_id.as_str(), a.segment_index).cmp(&(b.speaker_id.as_str(), b.segment_index))
        });

        log::info!(
            "スキャン完了: {:?} → セグメント {} 件、スキップ {} 件",
            dir,
            segments.len(),
            skipped
        );

        Ok(ScanResult { segments, skipped })
    }

    fn walk(
        &self,
        dir: &Path,
        speaker: Option<&(String, String)>,
        segments: &mut Vec<Segment>,
        skipped: &mut usize,
        is_root: bool,
    ) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if is_root => {
                return Err(e).with_context(|| format!("ディレクトリを読めません: {:?}", dir));
            }
            Err(e) => {
                log::warn!("サブディレクトリを読めません（スキップ）: {:?}: {}", dir, e);
                return Ok(());
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("ディレクトリエントリの読み取りに失敗（スキップ）: {}", e);
                    *skipped += 1;
                    continue;
                }
            };

            let path = entry.path();
            if path.is_dir() {
                let dir_name = entry.file_name().to_string_lossy().into_owned();
                let speaker_info = self.parse_speaker_dir(&dir_name);
                self.walk(&path, Some(&speaker_info), segments, skipped, false)?;
                continue;
            }

            let file_name = entry.file_name().to_string_lossy().into_owned();
            match self.classify_file(&path, &file_name, speaker) {
                Ok(Some(segment)) => segments.push(segment),
                Ok(None) => {}
                Err(e) => {
                    log::debug!("スキップ: {}", e);
                    *skipped += 1;
                }
            }
        }

        Ok(())
    }

    fn classify_file(
        &self,
        path: &Path,
        file_name: &str,
        speaker: Option<&(String, String)>,
    ) -> Result<Option<Segment>, ParseError> {
        let byte_size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        if file_name.ends_with(".pcm") {
            let parsed = self.parse_temp_filename(file_name)?;
            return Ok(Some(Segment {
                speaker_name: parsed.speaker_id.clone(), // 表示名はこの文法に含まれない
                speaker_id: parsed.speaker_id,
                segment_index: parsed.segment_index,
                capture_timestamp_ms: parsed.capture_timestamp_ms,
                format: self.format,
                file_path: path.to_path_buf(),
                byte_size,
            }));
        }

        if let Some(caps) = self.wav_pattern.captures(file_name) {
            let (speaker_id, speaker_name) = match speaker {
                Some(info) => info.clone(),
                None => {
                    return Err(ParseError {
                        file_name: file_name.to_string(),
                        reason: "話者ディレクトリの外にある変換済みセグメント",
                    });
                }
            };
            let segment_index: u32 = caps[1].parse().map_err(|_| ParseError {
                file_name: file_name.to_string(),
                reason: "セグメント番号が数値ではない",
            })?;
            return Ok(Some(Segment {
                speaker_id,
                speaker_name,
                segment_index,
                // 変換済みレイアウトにはキャプチャ時刻が残らないため
                // ファイルの更新時刻で近似する
                capture_timestamp_ms: file_mtime_ms(path),
                format: self.format,
                file_path: path.to_path_buf(),
                byte_size,
            }));
        }

        if file_name.ends_with(".wav") {
            return Err(ParseError {
                file_name: file_name.to_string(),
                reason: "ファイル名が文法に一致しない",
            });
        }

        // 音声以外のファイル（マニフェスト等）は黙って無視する
        Ok(None)
    }

    /// `temp_{speakerId}_seg{index}_{timestampMs}_{random}.pcm` を解析する
    pub fn parse_temp_filename(&self, file_name: &str) -> Result<ParsedTempName, ParseError> {
        let caps = self.temp_pattern.captures(file_name).ok_or(ParseError {
            file_name: file_name.to_string(),
            reason: "ファイル名が文法に一致しない",
        })?;

        let segment_index: u32 = caps[2].parse().map_err(|_| ParseError {
            file_name: file_name.to_string(),
            reason: "セグメント番号が大きすぎる",
        })?;
        let capture_timestamp_ms: u64 = caps[3].parse().map_err(|_| ParseError {
            file_name: file_name.to_string(),
            reason: "タイムスタンプが大きすぎる",
        })?;

        Ok(ParsedTempName {
            speaker_id: caps[1].to_string(),
            segment_index,
            capture_timestamp_ms,
        })
    }

    /// 話者ディレクトリ名を (話者ID, 表示名) に解決する
    ///
    /// `{speakerId}-{表示名}` 形式（先頭が6桁以上の数値ID）なら分解し、
    /// それ以外はディレクトリ名をIDと表示名の両方に使う。
    fn parse_speaker_dir(&self, dir_name: &str) -> (String, String) {
        if let Some(caps) = self.speaker_dir_pattern.captures(dir_name) {
            (caps[1].to_string(), caps[2].to_string())
        } else {
            (dir_name.to_string(), dir_name.to_string())
        }
    }
}

/// 話者ごとにグループ化し、各話者内をセグメント番号の昇順に整列する
///
/// BTreeMapを使うのは反復順を決定的にするため。番号の欠番は
/// そのまま許容する（無音として補間しない）。
pub fn group_by_user(segments: Vec<Segment>) -> BTreeMap<String, Vec<Segment>> {
    let mut map: BTreeMap<String, Vec<Segment>> = BTreeMap::new();
    for segment in segments {
        map.entry(segment.speaker_id.clone()).or_default().push(segment);
    }
    for list in map.values_mut() {
        list.sort_by_key(|s| s.segment_index);
    }
    map
}

/// セグメント群からセッション情報を導出する
///
/// 開始・終了はキャプチャ時刻の最小・最大からの推定値であり、
/// 真のセッション開始時刻ではない。出力には推定である旨を明記する。
pub fn session_info(dir: &Path, segments: &[Segment]) -> SessionInfo {
    let session_id = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session".to_string());

    let mut participants = BTreeMap::new();
    for segment in segments {
        let entry = participants
            .entry(segment.speaker_id.clone())
            .or_insert_with(|| segment.speaker_name.clone());
        // IDしか分からなかった話者に表示名が見つかれば差し替える
        if *entry == segment.speaker_id && segment.speaker_name != segment.speaker_id {
            *entry = segment.speaker_name.clone();
        }
    }

    let start_time_ms = segments.iter().map(|s| s.capture_timestamp_ms).min().unwrap_or(0);
    let end_time_ms = segments.iter().map(|s| s.capture_timestamp_ms).max().unwrap_or(0);

    SessionInfo {
        session_id,
        participants,
        start_time_ms,
        end_time_ms,
        duration_ms: end_time_ms.saturating_sub(start_time_ms),
    }
}

fn file_mtime_ms(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SampleFormat;
    use std::fs;
    use tempfile::TempDir;

    fn scanner() -> SegmentScanner {
        SegmentScanner::new(PcmFormat {
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::S16Le,
        })
        .unwrap()
    }

    #[test]
    fn test_parse_temp_filename() {
        let scanner = scanner();
        let parsed = scanner
            .parse_temp_filename("temp_451606006120710144_seg0_1700000000000_ab12.pcm")
            .unwrap();
        assert_eq!(parsed.speaker_id, "451606006120710144");
        assert_eq!(parsed.segment_index, 0);
        assert_eq!(parsed.capture_timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_parse_temp_filename_rejects_malformed() {
        let scanner = scanner();
        for name in [
            "temp_abc_seg0_1700000000000_ab12.pcm", // 話者IDが数値でない
            "temp_1_seg_1700000000000_ab12.pcm",    // セグメント番号欠落
            "temp_1_seg0_1700000000000.pcm",        // 識別子欠落
            "temp_1_seg0_1700000000000_ab12.wav",   // 拡張子違い
            "notes.txt",
        ] {
            assert!(scanner.parse_temp_filename(name).is_err(), "{}", name);
        }
    }

    #[test]
    fn test_scan_groups_and_orders_segments() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        // 順不同で作成しても segment_index 順に整列される
        fs::write(dir.join("temp_451606006120710144_seg2_1700000002000_cd34.pcm"), [0u8; 8]).unwrap();
        fs::write(dir.join("temp_451606006120710144_seg0_1700000000000_ab12.pcm"), [0u8; 8]).unwrap();
        // 欠番（seg1なし）は許容される
        fs::write(dir.join("temp_99_seg5_1700000001000_ff00.pcm"), [0u8; 4]).unwrap();
        // 文法に一致しないファイルはスキップされるだけ
        fs::write(dir.join("garbage.pcm"), [0u8; 4]).unwrap();
        fs::write(dir.join("manifest.json"), b"{}").unwrap();

        let scanner = scanner();
        let result = scanner.scan(dir).unwrap();

        assert_eq!(result.segments.len(), 3);
        assert_eq!(result.skipped, 1); // garbage.pcm のみ（manifest.jsonは音声ではない）

        let groups = group_by_user(result.segments);
        assert_eq!(groups.len(), 2);

        let alice = &groups["451606006120710144"];
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].segment_index, 0);
        assert_eq!(alice[1].segment_index, 2);
        assert!(alice[0].segment_index < alice[1].segment_index);

        assert_eq!(groups["99"][0].segment_index, 5);
    }

    #[test]
    fn test_scan_converted_layout() {
        let temp_dir = TempDir::new().unwrap();
        let speaker_dir = temp_dir.path().join("451606006120710144-alice");
        fs::create_dir(&speaker_dir).unwrap();
        fs::write(speaker_dir.join("segment_000.wav"), [0u8; 44]).unwrap();
        fs::write(speaker_dir.join("segment_001.wav"), [0u8; 44]).unwrap();
        // 3桁でないものは文法違反
        fs::write(speaker_dir.join("segment_1.wav"), [0u8; 44]).unwrap();

        let scanner = scanner();
        let result = scanner.scan(temp_dir.path()).unwrap();

        assert_eq!(result.segments.len(), 2);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.segments[0].speaker_id, "451606006120710144");
        assert_eq!(result.segments[0].speaker_name, "alice");
        assert_eq!(result.segments[0].segment_index, 0);
        assert_eq!(result.segments[1].segment_index, 1);
    }

    #[test]
    fn test_scan_empty_directory_is_not_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = scanner().scan(temp_dir.path()).unwrap();
        assert!(result.segments.is_empty());
        assert_eq!(result.skipped, 0);
    }

    #[test]
    fn test_scan_missing_directory_is_an_error() {
        let result = scanner().scan(Path::new("/nonexistent/session-dir"));
        assert!(result.is_err());
    }

    #[test]
    fn test_session_info_estimates_timing() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("temp_1_seg0_1700000000000_aa00.pcm"), [0u8; 4]).unwrap();
        fs::write(dir.join("temp_1_seg1_1700000500000_bb11.pcm"), [0u8; 4]).unwrap();
        fs::write(dir.join("temp_2_seg0_1700000250000_cc22.pcm"), [0u8; 4]).unwrap();

        let result = scanner().scan(dir).unwrap();
        let info = session_info(dir, &result.segments);

        assert_eq!(info.start_time_ms, 1_700_000_000_000);
        assert_eq!(info.end_time_ms, 1_700_000_500_000);
        assert_eq!(info.duration_ms, 500_000);
        assert_eq!(info.participants.len(), 2);
    }

    #[test]
    fn test_speaker_dir_parsing() {
        let scanner = scanner();
        assert_eq!(
            scanner.parse_speaker_dir("451606006120710144-alice"),
            ("451606006120710144".to_string(), "alice".to_string())
        );
        assert_eq!(
            scanner.parse_speaker_dir("999999_bob the builder"),
            ("999999".to_string(), "bob the builder".to_string())
        );
        // 数値IDで始まらない場合はそのまま
        assert_eq!(
            scanner.parse_speaker_dir("alice"),
            ("alice".to_string(), "alice".to_string())
        );
    }
}
