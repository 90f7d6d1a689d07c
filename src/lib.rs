//! vc-transcribe - ボイスチャンネル録音の文字起こしパイプライン
//!
//! このクレートは、話者ごとに分離して録音されたボイスチャンネルの
//! 音声セグメントをディスクから復元し、差し替え可能な音声認識
//! バックエンドで文字起こしして、時系列にマージした1本の
//! トランスクリプトを生成し、リモートストレージへアップロードする
//! パイプラインを提供します。
//!
//! # 主な機能
//!
//! - **セグメントストアスキャナ**: ファイル名に埋め込まれたメタデータから
//!   話者→セグメント列を再構築。クラッシュ後の部分的なディレクトリにも対応
//! - **PCM→WAV変換**: 生PCM残骸を自己記述形式へ冪等に変換
//! - **バックエンド抽象**: クラウドAPI / プロセス内whisper / GPUエンジンを
//!   同一契約で差し替え
//! - **時系列マージ**: 話者ごとの結果をセッション絶対時刻で統合し、
//!   JSONとmarkdownの両形式を同じ並びから生成
//! - **アップロード**: 進捗報告と指数バックオフ付き再試行、
//!   オーファンセグメントの復元アップロード
//!
//! # アーキテクチャ
//!
//! ```text
//! [Session Dir] → [SegmentScanner] → [pcm_to_wav]
//!                        ↓
//!                 [TranscribeBackend]  (cloud / local / gpu のいずれか1つ)
//!                        ↓
//!                 [UserTranscript (話者ごと)]
//!                        ↓
//!                    [merge] → transcript.json / transcript.md
//!                        ↓
//!                   [Uploader] → リモート録音 + manifest.json
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use vc_transcribe::config::Config;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//!
//! // またはデフォルト設定を生成
//! Config::write_default("config.toml").unwrap();
//! ```

pub mod config;
pub mod error;
pub mod merge;
pub mod model_registry;
pub mod recovery;
pub mod segment_scanner;
pub mod transcribe_backend;
pub mod types;
pub mod uploader;
pub mod wav_writer;
pub mod whisper_api;
pub mod whisper_gpu;
pub mod whisper_local;
