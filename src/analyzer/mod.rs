pub mod alignment;
pub mod features;
pub mod separate;
pub mod transcode;

use crate::audio::{self, Waveform};
use crate::config::{AppConfig, SeparationBackend, TranscoderBackend};
use crate::db::models::{EventKind, NewAnalysis, NewStem, NewStemEvent, StemType, Track, TrackStatus, Transition};
use crate::db::{Database, DbError};
use crate::storage::{LocalStorage, StorageError, keys};
use alignment::Alignment;
use features::{BeatAnalysis, EnergyFluxExtractor, FeatureError, FeatureExtractor};
use separate::{DemucsSeparator, NoSeparator, Separator};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use transcode::{FfmpegTranscoder, NativeTranscoder, TranscodeError, Transcoder};

/// Coarse classification of pipeline failures, used for retry decisions and job error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InputError,
    UpstreamFailure,
    Timeout,
    PersistenceFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InputError => "input_error",
            Self::UpstreamFailure => "upstream_failure",
            Self::Timeout => "timeout",
            Self::PersistenceFailure => "persistence_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Normalize,
    Extract,
    Align,
    Persist,
    Separate,
    StemEvents,
    Complete,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::Extract => "extract",
            Self::Align => "align",
            Self::Persist => "persist",
            Self::Separate => "separate",
            Self::StemEvents => "stem_events",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("track {0} not found")]
    NotFound(i64),
    #[error("track {track_id} is {status}")]
    Conflict { track_id: i64, status: TrackStatus },
    #[error("unusable input: {0}")]
    Input(String),
    #[error("{stage} failed: {message}")]
    Upstream { stage: Stage, message: String },
    #[error("job {0} exceeded its deadline")]
    Timeout(i64),
    #[error("database error: {0}")]
    Persistence(#[from] DbError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Input(_) => ErrorKind::InputError,
            Self::Upstream { .. } => ErrorKind::UpstreamFailure,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Persistence(_) | Self::Storage(_) => ErrorKind::PersistenceFailure,
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UpstreamFailure | ErrorKind::Timeout | ErrorKind::PersistenceFailure
        )
    }

    fn upstream(stage: Stage, err: impl fmt::Display) -> Self {
        Self::Upstream {
            stage,
            message: err.to_string(),
        }
    }
}

impl From<TranscodeError> for PipelineError {
    fn from(e: TranscodeError) -> Self {
        match e {
            TranscodeError::InputMissing(_) | TranscodeError::Unreadable { .. } => {
                Self::Input(e.to_string())
            }
            other => Self::upstream(Stage::Normalize, other),
        }
    }
}

/// The external collaborators a run talks to.
pub struct Ports {
    pub transcoder: Box<dyn Transcoder>,
    pub features: Box<dyn FeatureExtractor>,
    pub separator: Box<dyn Separator>,
}

impl Ports {
    pub fn from_config(config: &AppConfig, storage: &LocalStorage) -> Self {
        let transcoder: Box<dyn Transcoder> = match config.audio.transcoder {
            TranscoderBackend::Ffmpeg => Box::new(FfmpegTranscoder {
                bin: config.audio.ffmpeg_bin.clone(),
            }),
            TranscoderBackend::Native => Box::new(NativeTranscoder),
        };
        let separator: Box<dyn Separator> = match config.separation.backend {
            SeparationBackend::Demucs => Box::new(DemucsSeparator::new(
                config.separation.demucs_bin.clone(),
                storage.root().join(keys::scratch("separation")),
            )),
            SeparationBackend::None => Box::new(NoSeparator),
        };
        Self {
            transcoder,
            features: Box::new(EnergyFluxExtractor::default()),
            separator,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub target_sample_rate: u32,
    pub peaks_downsample: usize,
    pub accent_ratio: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            target_sample_rate: 22050,
            peaks_downsample: 4000,
            accent_ratio: 0.8,
        }
    }
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            target_sample_rate: config.audio.target_sample_rate,
            peaks_downsample: config.audio.peaks_downsample,
            accent_ratio: config.events.accent_ratio,
        }
    }
}

/// Everything one run is allowed to touch, passed explicitly to every stage.
pub struct UnitOfWork<'a> {
    pub db: &'a Database,
    pub track_id: i64,
    pub job_id: i64,
    started: Instant,
}

impl<'a> UnitOfWork<'a> {
    pub fn new(db: &'a Database, track_id: i64, job_id: i64) -> Self {
        Self {
            db,
            track_id,
            job_id,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fails with `Timeout` once the reaper has taken the job away from us.
    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.db.job_is_running(self.job_id)? {
            Ok(())
        } else {
            Err(PipelineError::Timeout(self.job_id))
        }
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub analysis_id: i64,
    pub bpm: f64,
    pub confidence: f64,
    pub phase_shift_ms: i64,
    pub measures: i64,
    pub stems: usize,
    pub events: usize,
}

struct StoredStem {
    id: i64,
    stem_type: StemType,
    waveform: Waveform,
}

/// Drives one track through the analysis stages.
pub struct Orchestrator {
    ports: Ports,
    storage: LocalStorage,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(ports: Ports, storage: LocalStorage, settings: PipelineSettings) -> Self {
        Self {
            ports,
            storage,
            settings,
        }
    }

    /// Run every stage for the unit of work's track.
    ///
    /// The track must be `queued` and the job `running`. On any other error the
    /// track is marked `failed` (best effort, from `queued` too when the run broke
    /// before reaching `processing`) and rows committed by earlier stages stay in
    /// place. A `Timeout` leaves the track status to the reaper.
    pub fn run(&self, uow: &UnitOfWork<'_>) -> Result<RunSummary, PipelineError> {
        let result = self.start(uow).and_then(|()| self.run_stages(uow));
        match &result {
            Ok(summary) => log::info!(
                "track={} done in {:.1}s: {:.1} bpm, {} stems, {} events",
                uow.track_id,
                uow.elapsed().as_secs_f64(),
                summary.bpm,
                summary.stems,
                summary.events
            ),
            // Not our run to fail
            Err(PipelineError::Timeout(_) | PipelineError::Conflict { .. } | PipelineError::NotFound(_)) => {}
            Err(_) => mark_failed(uow),
        }
        result
    }

    /// `queued -> processing`, while the job still owns the run.
    fn start(&self, uow: &UnitOfWork<'_>) -> Result<(), PipelineError> {
        uow.checkpoint()?;
        match uow
            .db
            .transition_track(uow.track_id, &[TrackStatus::Queued], TrackStatus::Processing)?
        {
            Transition::Applied => {
                log::debug!("track={} job={} processing", uow.track_id, uow.job_id);
                Ok(())
            }
            Transition::Rejected(status) => Err(PipelineError::Conflict {
                track_id: uow.track_id,
                status,
            }),
            Transition::Missing => Err(PipelineError::NotFound(uow.track_id)),
        }
    }

    fn run_stages(&self, uow: &UnitOfWork<'_>) -> Result<RunSummary, PipelineError> {
        let track = uow
            .db
            .get_track(uow.track_id)?
            .ok_or(PipelineError::NotFound(uow.track_id))?;

        let waveform = stage(uow, Stage::Normalize, || self.normalize(uow, &track))?;
        let beats = stage(uow, Stage::Extract, || self.extract(&waveform, Stage::Extract))?;
        let alignment = stage(uow, Stage::Align, || {
            Ok(alignment::align(&beats.beat_times, &beats.onset_times, &beats.envelope))
        })?;
        let analysis_id = stage(uow, Stage::Persist, || persist_analysis(uow, &beats, &alignment))?;
        let stems = stage(uow, Stage::Separate, || self.separate(uow, analysis_id, &waveform))?;
        let events = stage(uow, Stage::StemEvents, || self.stem_events(uow, &stems, &alignment))?;
        stage(uow, Stage::Complete, || complete(uow))?;

        Ok(RunSummary {
            analysis_id,
            bpm: beats.tempo_bpm,
            confidence: alignment.confidence,
            phase_shift_ms: alignment.phase_shift_ms(),
            measures: alignment.measures,
            stems: stems.len(),
            events,
        })
    }

    /// Stage 1: transcode the stored input to canonical mono WAV and load it.
    fn normalize(&self, uow: &UnitOfWork<'_>, track: &Track) -> Result<Waveform, PipelineError> {
        let input = self.storage.path_for(&track.storage_path)?;
        let output = self.storage.prepare(&keys::normalized(track.id))?;

        log::debug!("track={} transcoding {}", track.id, input.display());
        let normalized = self
            .ports
            .transcoder
            .normalize(&input, self.settings.target_sample_rate, &output)?;

        uow.db.set_track_audio(
            track.id,
            normalized.sample_rate as i64,
            normalized.duration_ms,
        )?;

        audio::read_wav(&normalized.wav_path).map_err(|e| PipelineError::upstream(Stage::Normalize, e))
    }

    fn extract(&self, waveform: &Waveform, stage: Stage) -> Result<BeatAnalysis, PipelineError> {
        log::debug!("extracting features from {:.1}s of audio", waveform.duration_secs());
        let beats = self
            .ports
            .features
            .analyze_beats(waveform)
            .map_err(|e| PipelineError::upstream(stage, e))?;
        if beats.onset_times.len() != beats.onset_strengths.len() {
            let err = FeatureError::OnsetMismatch {
                times: beats.onset_times.len(),
                strengths: beats.onset_strengths.len(),
            };
            return Err(PipelineError::upstream(stage, err));
        }
        Ok(beats)
    }

    /// Stage 5: split into stems, store each one and record it.
    fn separate(
        &self,
        uow: &UnitOfWork<'_>,
        analysis_id: i64,
        waveform: &Waveform,
    ) -> Result<Vec<StoredStem>, PipelineError> {
        let separated: BTreeMap<StemType, Waveform> = self
            .ports
            .separator
            .separate(waveform)
            .map_err(|e| PipelineError::upstream(Stage::Separate, e))?;

        let mut stored = Vec::with_capacity(separated.len());
        for (stem_type, stem_wave) in separated {
            let key = keys::stem_audio(uow.track_id, analysis_id, stem_type.as_str());
            let bytes = audio::encode_wav(&stem_wave)
                .map_err(|e| PipelineError::upstream(Stage::Separate, e))?;
            self.storage.write(&key, &bytes)?;

            let id = uow.db.insert_stem(&NewStem {
                track_id: uow.track_id,
                analysis_id,
                stem_type,
                storage_path: key,
                peak_preview: audio::peak_preview(&stem_wave.samples, self.settings.peaks_downsample),
            })?;
            log::debug!("track={} stored {} stem", uow.track_id, stem_type);

            stored.push(StoredStem {
                id,
                stem_type,
                waveform: stem_wave,
            });
        }
        Ok(stored)
    }

    /// Stage 6: onsets per stem, snapped to the labeled beat grid. One transaction per stem.
    fn stem_events(
        &self,
        uow: &UnitOfWork<'_>,
        stems: &[StoredStem],
        alignment: &Alignment,
    ) -> Result<usize, PipelineError> {
        let mut total = 0;
        for stem in stems {
            let beats = self.extract(&stem.waveform, Stage::StemEvents)?;
            let events = snap_events(
                &beats.onset_times,
                &beats.onset_strengths,
                alignment,
                self.settings.accent_ratio,
            );
            total += uow.db.insert_stem_events(stem.id, &events)?;
            log::debug!(
                "track={} {}: {} events",
                uow.track_id,
                stem.stem_type,
                events.len()
            );
        }
        Ok(total)
    }
}

/// Checkpoint, run one stage, and log how it went.
fn stage<T>(
    uow: &UnitOfWork<'_>,
    stage: Stage,
    f: impl FnOnce() -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    uow.checkpoint()?;
    let start = Instant::now();
    let result = f();
    let secs = start.elapsed().as_secs_f64();
    match &result {
        Ok(_) => log::info!("track={} stage={} ok in {:.2}s", uow.track_id, stage, secs),
        Err(e) => log::error!(
            "track={} stage={} failed after {:.2}s: {}",
            uow.track_id,
            stage,
            secs,
            e
        ),
    }
    result
}

/// Stage 4.
fn persist_analysis(
    uow: &UnitOfWork<'_>,
    beats: &BeatAnalysis,
    alignment: &Alignment,
) -> Result<i64, PipelineError> {
    let id = uow.db.insert_analysis(&NewAnalysis {
        track_id: uow.track_id,
        bpm: beats.tempo_bpm,
        confidence: alignment.confidence,
        phase_shift_ms: alignment.phase_shift_ms(),
        measures: alignment.measures,
        beat_count: beats.beat_times.len() as i64,
        onset_count: beats.onset_times.len() as i64,
    })?;
    Ok(id)
}

/// Stage 7: `processing -> done`, only while our job still owns the run.
fn complete(uow: &UnitOfWork<'_>) -> Result<(), PipelineError> {
    if uow.db.complete_track(uow.track_id, uow.job_id)? {
        return Ok(());
    }
    if !uow.db.job_is_running(uow.job_id)? {
        return Err(PipelineError::Timeout(uow.job_id));
    }
    match uow.db.track_status(uow.track_id)? {
        Some(status) => Err(PipelineError::Conflict {
            track_id: uow.track_id,
            status,
        }),
        None => Err(PipelineError::NotFound(uow.track_id)),
    }
}

fn mark_failed(uow: &UnitOfWork<'_>) {
    match uow.db.transition_track(
        uow.track_id,
        &[TrackStatus::Queued, TrackStatus::Processing],
        TrackStatus::Failed,
    )
    {
        Ok(Transition::Applied) => {}
        Ok(other) => log::warn!("track={} not marked failed: {:?}", uow.track_id, other),
        Err(e) => log::warn!("track={} could not be marked failed: {}", uow.track_id, e),
    }
}

/// Turn a stem's onsets into events on the beat grid.
///
/// `strengths` pairs with `onset_times` index for index. Each onset takes the
/// labels of its nearest beat. Onsets at or above
/// `accent_ratio` of the stem's strongest onset are accents. An empty grid
/// yields no events.
pub fn snap_events(
    onset_times: &[f64],
    strengths: &[f64],
    alignment: &Alignment,
    accent_ratio: f64,
) -> Vec<NewStemEvent> {
    debug_assert_eq!(onset_times.len(), strengths.len());
    let max_strength = strengths.iter().copied().fold(0.0, f64::max);

    onset_times
        .iter()
        .zip(strengths)
        .filter_map(|(&t, &strength)| {
            let beat = alignment.snap(t)?;
            let kind = if max_strength > 0.0 && strength >= accent_ratio * max_strength {
                EventKind::Accent
            } else {
                EventKind::Onset
            };
            Some(NewStemEvent {
                ts_ms: beat.ts_ms,
                onset_ms: (t * 1000.0) as i64,
                strength,
                kind,
                count: beat.count,
                measure: beat.measure,
            })
        })
        .collect()
}
