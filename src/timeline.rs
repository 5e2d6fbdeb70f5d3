//! Read-time timeline assembly from persisted analysis, stems and events.

use crate::db::models::{EventKind, StemEventRecord, StemType, TrackStatus};
use crate::db::{Database, DbError};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TimelineError {
    #[error("track {0} not found")]
    NotFound(i64),
    #[error("track {track_id} is not ready (status: {status})")]
    NotReady { track_id: i64, status: TrackStatus },
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// One entry of the exposed beat grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BeatItem {
    pub idx: usize,
    pub ms: i64,
    pub count: i64,
    pub measure: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventItem {
    pub ms: i64,
    pub onset_ms: i64,
    pub strength: f64,
    pub kind: EventKind,
    pub count: i64,
    pub measure: i64,
}

impl From<&StemEventRecord> for EventItem {
    fn from(e: &StemEventRecord) -> Self {
        Self {
            ms: e.ts_ms,
            onset_ms: e.onset_ms,
            strength: e.strength,
            kind: e.kind,
            count: e.count,
            measure: e.measure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StemLane {
    pub events: Vec<EventItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    pub track_id: i64,
    pub analysis_id: i64,
    pub bpm: f64,
    pub confidence: f64,
    pub phase_shift_ms: i64,
    pub measures: i64,
    pub beat_grid: Vec<BeatItem>,
    pub stems: BTreeMap<StemType, StemLane>,
}

/// Build the timeline of a finished track from its most recent analysis run.
///
/// Only `done` tracks with an analysis row have a timeline; anything else is
/// `NotReady`, never a partial view.
pub fn build_timeline(db: &Database, track_id: i64) -> Result<Timeline, TimelineError> {
    let status = db
        .track_status(track_id)?
        .ok_or(TimelineError::NotFound(track_id))?;
    if status != TrackStatus::Done {
        return Err(TimelineError::NotReady { track_id, status });
    }
    let analysis = db
        .latest_analysis(track_id)?
        .ok_or(TimelineError::NotReady { track_id, status })?;

    let mut stems = BTreeMap::new();
    for stem in db.stems_for_analysis(analysis.id)? {
        let events = db.events_for_stem(stem.id)?;
        stems.insert(
            stem.stem_type,
            StemLane {
                events: events.iter().map(EventItem::from).collect(),
            },
        );
    }

    Ok(Timeline {
        track_id,
        analysis_id: analysis.id,
        bpm: analysis.bpm,
        confidence: analysis.confidence,
        phase_shift_ms: analysis.phase_shift_ms,
        measures: analysis.measures,
        beat_grid: beat_grid(&stems),
        stems,
    })
}

/// Pool every lane's events into one grid: first occurrence of each
/// (ms, count, measure) wins, then a stable sort by time and a fresh index.
pub fn beat_grid(lanes: &BTreeMap<StemType, StemLane>) -> Vec<BeatItem> {
    let mut seen = HashSet::new();
    let mut grid: Vec<BeatItem> = lanes
        .values()
        .flat_map(|lane| &lane.events)
        .filter(|e| seen.insert((e.ms, e.count, e.measure)))
        .map(|e| BeatItem {
            idx: 0,
            ms: e.ms,
            count: e.count,
            measure: e.measure,
        })
        .collect();

    grid.sort_by_key(|b| b.ms);
    for (i, beat) in grid.iter_mut().enumerate() {
        beat.idx = i;
    }
    grid
}
