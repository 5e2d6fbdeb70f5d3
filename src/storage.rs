use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage key escapes the storage root: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Path-addressed byte storage rooted at a directory.
///
/// Keys are relative, `/`-separated paths such as `stems/12/drums.wav`; they are
/// what the database records, so the root can move without rewriting rows.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a key. Rejects absolute keys and `..` components.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let valid = !key.is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }

    /// Absolute path for a key with its parent directories created, ready to be written.
    pub fn prepare(&self, key: &str) -> Result<PathBuf> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(path)
    }

    pub fn write(&self, key: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.prepare(key)?;
        fs::write(&path, bytes).map_err(|source| StorageError::Io { path: path.clone(), source })?;
        Ok(path)
    }

    /// Copy an external file into storage under `key`.
    pub fn import(&self, source_path: &Path, key: &str) -> Result<PathBuf> {
        let path = self.prepare(key)?;
        fs::copy(source_path, &path).map_err(|source| StorageError::Io {
            path: source_path.to_path_buf(),
            source,
        })?;
        Ok(path)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.exists()).unwrap_or(false)
    }

    /// Remove a directory key and everything under it. Missing directories are fine.
    pub fn remove_dir(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    /// Remove a single file key. Missing files are fine.
    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }
}

/// Storage layout shared by ingestion and the pipeline.
pub mod keys {
    pub fn upload(stamp: i64, file_name: &str) -> String {
        format!("uploads/{stamp}-{file_name}")
    }

    pub fn normalized(track_id: i64) -> String {
        format!("normalized/{track_id}.wav")
    }

    pub fn stems_dir(track_id: i64) -> String {
        format!("stems/{track_id}")
    }

    pub fn stem_audio(track_id: i64, analysis_id: i64, stem: &str) -> String {
        format!("stems/{track_id}/{analysis_id}/{stem}.wav")
    }

    pub fn scratch(name: &str) -> String {
        format!("scratch/{name}")
    }
}
