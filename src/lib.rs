pub mod analyzer;
pub mod audio;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod ingest;
pub mod storage;
pub mod timeline;

use indicatif::{ProgressBar, ProgressStyle};

/// Audio file extensions accepted for ingestion
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "wav",
    // Via ffmpeg
    "mp3", "flac", "ogg", "opus", "m4a", "aac", "aif", "aiff", "wv",
];

/// Application name for XDG paths
pub const APP_NAME: &str = "beatgrid";

/// Progress bar in the house style.
pub fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    match ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => log::debug!("Falling back to default progress style: {}", e),
    }
    pb
}
