//! Source-separation port and its adapters.

use super::transcode::resample_linear;
use crate::audio::{self, Waveform};
use crate::db::models::StemType;
use std::collections::BTreeMap;
use std::io::ErrorKind as IoKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum SeparationError {
    #[error("separation binary not found: {0}")]
    BinaryMissing(String),
    #[error("separation failed: {0}")]
    Failed(String),
    #[error("WAV error: {0}")]
    Wav(#[from] audio::WavError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Splits a waveform into labeled stems. Stem types the engine doesn't
/// produce are simply absent from the map.
pub trait Separator: Send + Sync {
    fn separate(&self, waveform: &Waveform) -> Result<BTreeMap<StemType, Waveform>, SeparationError>;
}

/// Produces no stems. The pipeline still completes, with an empty timeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSeparator;

impl Separator for NoSeparator {
    fn separate(&self, _waveform: &Waveform) -> Result<BTreeMap<StemType, Waveform>, SeparationError> {
        Ok(BTreeMap::new())
    }
}

/// Runs the `demucs` CLI in a scratch directory and collects its stem WAVs.
#[derive(Debug, Clone)]
pub struct DemucsSeparator {
    pub bin: String,
    pub scratch_dir: PathBuf,
}

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

impl DemucsSeparator {
    pub fn new(bin: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    fn run_in(&self, work: &Path, waveform: &Waveform) -> Result<BTreeMap<StemType, Waveform>, SeparationError> {
        let input = work.join("mix.wav");
        let out_dir = work.join("out");
        audio::write_wav(&input, waveform)?;

        log::debug!("Running {} on {}", self.bin, input.display());
        let result = Command::new(&self.bin).arg("-o").arg(&out_dir).arg(&input).output();
        let out = match result {
            Ok(out) => out,
            Err(e) if e.kind() == IoKind::NotFound => {
                return Err(SeparationError::BinaryMissing(self.bin.clone()));
            }
            Err(e) => return Err(SeparationError::Io(e)),
        };
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(SeparationError::Failed(stderr.trim().to_string()));
        }

        collect_stems(&out_dir, waveform.sample_rate)
    }
}

impl Separator for DemucsSeparator {
    fn separate(&self, waveform: &Waveform) -> Result<BTreeMap<StemType, Waveform>, SeparationError> {
        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let work = self
            .scratch_dir
            .join(format!("demucs-{}-{}", std::process::id(), seq));
        std::fs::create_dir_all(&work)?;

        let result = self.run_in(&work, waveform);

        if let Err(e) = std::fs::remove_dir_all(&work) {
            log::warn!("Could not remove scratch dir {}: {}", work.display(), e);
        }
        result
    }
}

/// Find `<stem>.wav` files anywhere under `dir` and load them as mono at `sample_rate`.
///
/// Demucs nests its output as `<out>/<model>/<input>/<stem>.wav`; only the file
/// name matters here. The first match per stem type wins, in walk order.
pub fn collect_stems(dir: &Path, sample_rate: u32) -> Result<BTreeMap<StemType, Waveform>, SeparationError> {
    let mut stems = BTreeMap::new();

    for entry in WalkDir::new(dir).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_wav = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
        if !is_wav {
            continue;
        }
        let Some(stem_type) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<StemType>().ok())
        else {
            continue;
        };
        if stems.contains_key(&stem_type) {
            continue;
        }

        let wave = audio::read_wav(path)?;
        let samples = resample_linear(&wave.samples, wave.sample_rate, sample_rate);
        stems.insert(stem_type, Waveform::new(samples, sample_rate));
    }

    Ok(stems)
}
