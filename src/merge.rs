use crate::types::{SessionInfo, SessionTranscript, TranscriptEntry, UserTranscript};
use chrono::DateTime;

/// 同一話者の複数ファイル分の文字起こしを1本に統合する
///
/// ファイルごとに独立したアンカーを持つ部分文字起こしを、
/// 最古のアンカーを基準にオフセットを振り直して結合する。
/// 単語数と平均信頼度は結合後のセグメント列から再計算される。
pub fn combine_user_transcripts(parts: Vec<UserTranscript>) -> Option<UserTranscript> {
    let first = parts.first()?;
    let speaker_id = first.speaker_id.clone();
    let speaker_name = first.speaker_name.clone();

    let anchor_ms = parts.iter().map(|p| p.audio_start_time_ms).min()?;

    let mut segments = Vec::new();
    for part in parts {
        let shift_sec = part.audio_start_time_ms.saturating_sub(anchor_ms) as f64 / 1000.0;
        for mut segment in part.segments {
            segment.start_offset_sec += shift_sec;
            segment.end_offset_sec += shift_sec;
            segments.push(segment);
        }
    }
    segments.sort_by(|a, b| {
        a.start_offset_sec
            .partial_cmp(&b.start_offset_sec)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Some(UserTranscript::from_segments(
        speaker_id,
        speaker_name,
        anchor_ms,
        segments,
    ))
}

/// 話者ごとの文字起こしをセッション全体の時系列へマージする
///
/// 各セグメントの相対オフセットを話者のアンカーでセッション
/// 絶対時刻へ投影し、全話者分を1つの列に平坦化して開始時刻の
/// 昇順に整列する。同時刻は話者IDの辞書順で決定的に並べるため、
/// 同一入力への再実行はバイト単位で同じ出力になる。
///
/// 話者をまたぐ発話の重なりは解決せず、開始時刻順のまま残す。
pub fn merge_transcripts(session: &SessionInfo, users: &[UserTranscript]) -> SessionTranscript {
    let mut entries = Vec::new();

    for user in users {
        for segment in &user.segments {
            let absolute_start_ms =
                user.audio_start_time_ms + (segment.start_offset_sec * 1000.0).round() as u64;
            let absolute_end_ms =
                user.audio_start_time_ms + (segment.end_offset_sec * 1000.0).round() as u64;
            entries.push(TranscriptEntry {
                speaker_id: user.speaker_id.clone(),
                speaker_name: user.speaker_name.clone(),
                absolute_start_ms,
                absolute_end_ms,
                text: segment.text.clone(),
            });
        }
    }

    entries.sort_by(|a, b| {
        a.absolute_start_ms
            .cmp(&b.absolute_start_ms)
            .then_with(|| a.speaker_id.cmp(&b.speaker_id))
    });

    let word_count = users.iter().map(|u| u.word_count).sum();
    // 話者平均の単純平均（セグメント数で重み付けしない近似値）
    let average_confidence = if users.is_empty() {
        0.0
    } else {
        users.iter().map(|u| u.average_confidence).sum::<f32>() / users.len() as f32
    };

    SessionTranscript {
        session_id: session.session_id.clone(),
        word_count,
        average_confidence,
        entries,
        users: users.to_vec(),
    }
}

/// セッション文字起こしをmarkdownとして描画する
///
/// 構造化されたエントリ列と同じ並びから生成するため、
/// JSON形式とこの描画が食い違うことはない。
pub fn render_markdown(session: &SessionInfo, transcript: &SessionTranscript) -> String {
    let mut out = String::new();

    out.push_str(&format!("# 文字起こし: {}\n\n", session.session_id));
    out.push_str(&format!(
        "- 日時（推定）: {}\n",
        format_utc_datetime(session.start_time_ms)
    ));
    out.push_str(&format!(
        "- 録音時間（推定）: {}\n",
        format_offset(session.duration_ms)
    ));

    // セグメントが1つもない話者も参加者としては列挙する
    let participants: Vec<&str> = session.participants.values().map(|s| s.as_str()).collect();
    out.push_str(&format!(
        "- 参加者: {}\n\n",
        if participants.is_empty() {
            "なし".to_string()
        } else {
            participants.join(", ")
        }
    ));

    for entry in &transcript.entries {
        let offset_ms = entry.absolute_start_ms.saturating_sub(session.start_time_ms);
        out.push_str(&format!(
            "**{}** [{}]: {}\n",
            entry.speaker_name,
            format_offset(offset_ms),
            entry.text
        ));
    }

    out
}

fn format_utc_datetime(timestamp_ms: u64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms as i64)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "不明".to_string())
}

fn format_offset(ms: u64) -> String {
    let total_secs = ms / 1000;
    format!(
        "{:02}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60
    )
}
