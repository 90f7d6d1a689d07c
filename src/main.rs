use anyhow::{Context, Result};
use env_logger::Env;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vc_transcribe::config::Config;
use vc_transcribe::merge::{combine_user_transcripts, merge_transcripts, render_markdown};
use vc_transcribe::recovery::recover_orphaned_segments;
use vc_transcribe::segment_scanner::{group_by_user, session_info, SegmentScanner};
use vc_transcribe::transcribe_backend::{create_backend, TranscribeRequest};
use vc_transcribe::types::{TranscribeOptions, UserTranscript};
use vc_transcribe::uploader::{
    cleanup_local_files, UploadBundle, UploadProgressFn, Uploader,
};
use vc_transcribe::wav_writer::{pcm_to_wav, wav_duration_ms};

fn print_usage() {
    println!("使い方:");
    println!("  vc-transcribe [config.toml] --session <セッションディレクトリ>");
    println!("  vc-transcribe [config.toml] --recover <セッションディレクトリ> <recordingId>");
    println!("  vc-transcribe --generate-config [出力先]");
}

#[tokio::main]
async fn main() -> Result<()> {
    // ロガーを初期化
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    let mut config_path = "config.toml".to_string();
    let mut session_dir: Option<PathBuf> = None;
    let mut recover: Option<(PathBuf, String)> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--session" => {
                let dir = args
                    .get(i + 1)
                    .context("--session にはディレクトリを指定してください")?;
                session_dir = Some(PathBuf::from(dir));
                i += 2;
            }
            "--recover" => {
                let dir = args
                    .get(i + 1)
                    .context("--recover にはディレクトリを指定してください")?;
                let recording_id = args
                    .get(i + 2)
                    .context("--recover には recordingId を指定してください")?;
                recover = Some((PathBuf::from(dir), recording_id.clone()));
                i += 3;
            }
            other if !other.starts_with("--") => {
                // 先頭の位置引数は設定ファイルのパス
                config_path = other.to_string();
                i += 1;
            }
            other => {
                log::warn!("不明なオプションを無視します: {}", other);
                i += 1;
            }
        }
    }

    let config = Config::load_or_default(&config_path)?;

    log::info!("vc-transcribe を起動します");

    if let Some((dir, recording_id)) = recover {
        return run_recovery(&config, &dir, &recording_id).await;
    }

    match session_dir {
        Some(dir) => run_pipeline(&config, &dir).await,
        None => {
            print_usage();
            Ok(())
        }
    }
}

/// セッションディレクトリの文字起こしパイプライン
///
/// スキャン → 変換 → 文字起こし → マージ → 成果物書き出し →
/// アップロード → クリーンアップ。
async fn run_pipeline(config: &Config, session_dir: &Path) -> Result<()> {
    let format = config.audio.format();
    let scanner = SegmentScanner::new(format)?;
    let scan = scanner.scan(session_dir)?;

    if scan.segments.is_empty() {
        log::warn!("解析できるセグメントがありません: {:?}", session_dir);
        return Ok(());
    }

    let info = session_info(session_dir, &scan.segments);
    log::info!(
        "セッション {}: 話者 {} 名、セグメント {} 件（スキップ {} 件）",
        info.session_id,
        info.participants.len(),
        scan.segments.len(),
        scan.skipped
    );

    // PCM残骸をWAVに変換し、ファイル単位の文字起こし要求を組み立てる
    let groups = group_by_user(scan.segments);
    let mut requests = Vec::new();
    let mut audio_files = Vec::new();
    let mut conversion_failures = 0usize;
    let mut total_audio_secs = 0f64;

    for (speaker_id, segments) in &groups {
        for segment in segments {
            let is_pcm = segment
                .file_path
                .extension()
                .map(|e| e == "pcm")
                .unwrap_or(false);
            let wav_path = if is_pcm {
                match pcm_to_wav(&segment.file_path, segment.format) {
                    Ok(path) => path,
                    Err(e) => {
                        log::warn!("変換失敗（スキップ）: {:?}: {}", segment.file_path, e);
                        conversion_failures += 1;
                        continue;
                    }
                }
            } else {
                segment.file_path.clone()
            };

            total_audio_secs += wav_duration_ms(&wav_path).unwrap_or(0) as f64 / 1000.0;
            audio_files.push(wav_path.clone());
            requests.push(TranscribeRequest {
                file_path: wav_path,
                speaker_id: speaker_id.clone(),
                speaker_name: segment.speaker_name.clone(),
                audio_start_time_ms: segment.capture_timestamp_ms,
            });
        }
    }

    // バックエンドは起動時に1つだけ構築し、このスコープが所有する
    let mut backend = create_backend(config)?;
    backend.initialize().await?;
    log::info!(
        "バックエンド {} 準備完了。処理時間の目安: {}",
        backend.name(),
        backend.estimate_time(total_audio_secs)
    );

    let options = TranscribeOptions {
        language: Some(config.transcribe.language.clone()),
        temperature: Some(config.transcribe.temperature),
        prompt: config.transcribe.prompt.clone(),
    };

    let outcome = backend.transcribe_files(&requests, &options).await;
    backend.release();

    let transcribed = outcome.transcripts.len();
    let failed = outcome.failures.len();

    if outcome.transcripts.is_empty() {
        anyhow::bail!("文字起こしに成功したセグメントがありません（失敗 {} 件）", failed);
    }

    // ファイル単位の結果を話者ごとに統合する
    let mut per_speaker: BTreeMap<String, Vec<UserTranscript>> = BTreeMap::new();
    for transcript in outcome.transcripts {
        per_speaker
            .entry(transcript.speaker_id.clone())
            .or_default()
            .push(transcript);
    }

    let mut users: Vec<UserTranscript> = per_speaker
        .into_values()
        .filter_map(combine_user_transcripts)
        .collect();

    // 1件も復元できなかった話者も参加者として成果物に載せる
    for (speaker_id, name) in &info.participants {
        if !users.iter().any(|u| &u.speaker_id == speaker_id) {
            users.push(UserTranscript::from_segments(
                speaker_id.clone(),
                name.clone(),
                info.start_time_ms,
                Vec::new(),
            ));
        }
    }
    users.sort_by(|a, b| a.speaker_id.cmp(&b.speaker_id));

    let transcript = merge_transcripts(&info, &users);
    let markdown = render_markdown(&info, &transcript);

    let json_path = session_dir.join("transcript.json");
    let md_path = session_dir.join("transcript.md");
    std::fs::write(&json_path, serde_json::to_string_pretty(&transcript)?)
        .with_context(|| format!("成果物の書き込みに失敗: {:?}", json_path))?;
    std::fs::write(&md_path, &markdown)
        .with_context(|| format!("成果物の書き込みに失敗: {:?}", md_path))?;

    log::info!(
        "成果物を書き出しました: {:?}, {:?} (単語数 {}, 平均信頼度 {:.2})",
        json_path,
        md_path,
        transcript.word_count,
        transcript.average_confidence
    );

    if config.upload.endpoint.is_empty() {
        log::info!("[upload] endpoint が未設定のためアップロードをスキップします");
        log::info!(
            "完了: 文字起こし成功 {} 件 / 失敗 {} 件 / 変換失敗 {} 件",
            transcribed,
            failed,
            conversion_failures
        );
        return Ok(());
    }

    let uploader = Uploader::new(config.upload.clone())?;
    let bundle = UploadBundle {
        session_id: info.session_id.clone(),
        audio_files,
        transcript_json: Some(json_path),
        transcript_markdown: Some(md_path),
        working_dir: session_dir.to_path_buf(),
    };

    let metadata = serde_json::json!({
        "sessionId": info.session_id,
        "sessionStartTime": info.start_time_ms,
        "sessionEndTime": info.end_time_ms,
        "participants": info.participants,
        "wordCount": transcript.word_count,
        "averageConfidence": transcript.average_confidence,
    });

    let progress: UploadProgressFn = Arc::new(|p| {
        log::info!(
            "アップロード進捗: {}% ({:.1} MB / {:.1} MB)",
            p.percentage,
            p.uploaded_bytes as f64 / (1024.0 * 1024.0),
            p.total_bytes as f64 / (1024.0 * 1024.0)
        );
    });

    let response = uploader
        .upload_with_retry(&bundle, &metadata, config.upload.max_retries, Some(progress))
        .await?;

    log::info!("アップロード成功: recordingId={}", response.recording_id);
    if !response.view_url.is_empty() {
        log::info!("閲覧URL: {}", response.view_url);
    }
    for url in &response.download_urls.audio {
        log::info!("音声URL: {}", url);
    }
    if let Some(eta) = &response.estimated_processing_time {
        log::info!("リモート処理の目安: {}", eta);
    }

    if config.output.keep_local_files {
        log::info!("keep_local_files が有効のためローカルファイルを残します");
    } else {
        cleanup_local_files(&bundle);
    }

    log::info!(
        "完了: 文字起こし成功 {} 件 / 失敗 {} 件 / 変換失敗 {} 件",
        transcribed,
        failed,
        conversion_failures
    );

    Ok(())
}

/// オーファンセグメントのリカバリモード
async fn run_recovery(config: &Config, session_dir: &Path, recording_id: &str) -> Result<()> {
    let uploader = if config.upload.endpoint.is_empty() {
        log::warn!("[upload] endpoint が未設定のため、復元とマニフェスト生成のみ行います");
        None
    } else {
        Some(Uploader::new(config.upload.clone())?)
    };

    let report = recover_orphaned_segments(
        session_dir,
        recording_id,
        config.audio.format(),
        uploader.as_ref(),
    )
    .await?;

    for (path, reason) in &report.failures {
        log::warn!("  失敗: {:?}: {}", path, reason);
    }
    if let Some(path) = &report.manifest_path {
        log::info!("マニフェスト: {:?}", path);
    }

    Ok(())
}
