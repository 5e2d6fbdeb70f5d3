use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults; the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Root for uploads, normalized audio and stems (overrides XDG default).
    pub storage_dir: Option<PathBuf>,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub audio: AudioConfig,
    pub separation: SeparationConfig,
    pub events: EventsConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscoderBackend {
    Ffmpeg,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeparationBackend {
    Demucs,
    None,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Every track is normalized to mono at this rate before analysis.
    pub target_sample_rate: u32,
    /// Number of windows in a stem's peak preview.
    pub peaks_downsample: usize,
    pub transcoder: TranscoderBackend,
    pub ffmpeg_bin: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 22050,
            peaks_downsample: 4000,
            transcoder: TranscoderBackend::Ffmpeg,
            ffmpeg_bin: "ffmpeg".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    pub backend: SeparationBackend,
    pub demucs_bin: String,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            backend: SeparationBackend::Demucs,
            demucs_bin: "demucs".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// An onset at or above this fraction of the stem's strongest onset is an accent.
    pub accent_ratio: f64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { accent_ratio: 0.8 }
    }
}

/// Job execution and retention knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub job_timeout_secs: i64,
    pub max_attempts: i64,
    pub success_ttl_secs: i64,
    pub failure_ttl_secs: i64,
    pub poll_interval_ms: u64,
    /// How often a running job refreshes its lease.
    pub heartbeat_secs: u64,
    /// A timed-out job whose lease is older than this belongs to a worker that
    /// is gone; the sweep releases and retries it.
    pub lease_secs: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 1800,
            max_attempts: 3,
            success_ttl_secs: 86_400,
            failure_ttl_secs: 604_800,
            poll_interval_ms: 500,
            heartbeat_secs: 10,
            lease_secs: 60,
        }
    }
}

impl AppConfig {
    /// Load config from `path`, or from `~/.config/beatgrid/config.toml` when `None`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load(path: Option<&Path>) -> Self {
        let config_path = path.map(Path::to_path_buf).or_else(Self::config_path);
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Storage root: config value, else the XDG data dir.
    pub fn resolve_storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(default_storage_dir)
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

fn data_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", crate::APP_NAME).map(|dirs| {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.to_path_buf()
    })
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    match data_dir() {
        Some(dir) => dir.join("beatgrid.db"),
        // Fallback: current directory
        None => PathBuf::from("beatgrid.db"),
    }
}

pub fn default_storage_dir() -> PathBuf {
    match data_dir() {
        Some(dir) => dir.join("storage"),
        None => PathBuf::from("beatgrid-storage"),
    }
}
