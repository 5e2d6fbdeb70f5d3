pub mod fetch;
pub mod metadata;

use crate::SUPPORTED_EXTENSIONS;
use crate::db::models::{NewTrack, SourceKind};
use crate::db::{Database, DbError};
use crate::storage::{LocalStorage, StorageError, keys};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Fetch error: {0}")]
    Fetch(#[from] fetch::FetchError),
    #[error("Unsupported file type: {0}")]
    Unsupported(String),
}

pub struct IngestResult {
    pub found: u64,
    pub added: Vec<i64>,
    pub errors: u64,
}

fn has_supported_extension(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    SUPPORTED_EXTENSIONS.contains(&ext.as_str())
}

/// Expand files and directories into the supported audio files they contain, in walk order.
pub fn collect_audio_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        for entry in WalkDir::new(path)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() && has_supported_extension(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    files
}

/// Add every supported file under `paths` as a pending track.
/// Per-file failures are logged and counted; they don't stop the batch.
pub fn add_paths(db: &Database, storage: &LocalStorage, paths: &[PathBuf]) -> IngestResult {
    let files = collect_audio_files(paths);
    let pb = crate::progress_bar(files.len() as u64);
    pb.set_message("Adding...");

    let mut result = IngestResult {
        found: files.len() as u64,
        added: Vec::new(),
        errors: 0,
    };

    for path in &files {
        match add_file(db, storage, path) {
            Ok(id) => result.added.push(id),
            Err(e) => {
                log::warn!("Error adding {}: {}", path.display(), e);
                result.errors += 1;
            }
        }
        pb.inc(1);
    }

    pb.finish_with_message(format!(
        "Done: {} added, {} errors",
        result.added.len(),
        result.errors
    ));
    result
}

/// Copy one local file into storage and record it as a pending upload.
pub fn add_file(db: &Database, storage: &LocalStorage, path: &Path) -> Result<i64, IngestError> {
    if !has_supported_extension(path) {
        return Err(IngestError::Unsupported(path.display().to_string()));
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(sanitize_file_name)
        .unwrap_or_else(|| "upload".into());

    let key = free_upload_key(storage, &name);
    storage.import(path, &key)?;

    let source_uri = std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string();
    let track = NewTrack {
        title: metadata::track_title(path),
        source_kind: SourceKind::Upload,
        source_uri,
        storage_path: key,
    };
    insert_or_discard(db, storage, &track)
}

/// Download a URL into storage and record it as a pending external fetch.
pub fn add_url(db: &Database, storage: &LocalStorage, url: &str) -> Result<i64, IngestError> {
    let name = fetch::file_name_from_url(url)
        .map(|n| sanitize_file_name(&n))
        .unwrap_or_else(|| "download".into());

    let key = free_upload_key(storage, &name);
    let dest = storage.prepare(&key)?;
    if let Err(e) = fetch::download(url, &dest) {
        storage.remove(&key).ok();
        return Err(e.into());
    }

    let title = metadata::track_title(&dest);
    let track = NewTrack {
        title,
        source_kind: SourceKind::ExternalFetch,
        source_uri: url.to_string(),
        storage_path: key,
    };
    insert_or_discard(db, storage, &track)
}

fn insert_or_discard(db: &Database, storage: &LocalStorage, track: &NewTrack) -> Result<i64, IngestError> {
    match db.insert_track(track) {
        Ok(id) => {
            log::debug!("Added track {} from {}", id, track.source_uri);
            Ok(id)
        }
        Err(e) => {
            storage.remove(&track.storage_path).ok();
            Err(e.into())
        }
    }
}

/// An upload key that nothing in storage occupies yet.
fn free_upload_key(storage: &LocalStorage, name: &str) -> String {
    let mut stamp = chrono::Utc::now().timestamp_millis();
    let mut key = keys::upload(stamp, name);
    while storage.exists(&key) {
        stamp += 1;
        key = keys::upload(stamp, name);
    }
    key
}

/// Keep ASCII alphanumerics, `.`, `-` and `_`; everything else becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() { "upload".into() } else { trimmed.to_string() }
}
