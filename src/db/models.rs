use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A string read from the database that doesn't name any variant of a closed enum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Closed string-backed enums stored as TEXT columns.
///
/// Expands to `as_str`, `Display`, `FromStr`, and the rusqlite `ToSql`/`FromSql` pair,
/// so a stray string in the database fails the row conversion instead of leaking through.
macro_rules! text_enum {
    ($name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: UnknownVariant| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// Lifecycle of a track through the analysis pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    Pending,
    Queued,
    Processing,
    Done,
    Failed,
}

text_enum!(TrackStatus, "track status" {
    Pending => "pending",
    Queued => "queued",
    Processing => "processing",
    Done => "done",
    Failed => "failed",
});

impl TrackStatus {
    /// A run is in flight (or about to be): a second enqueue must be rejected.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Upload,
    ExternalFetch,
}

text_enum!(SourceKind, "source kind" {
    Upload => "upload",
    ExternalFetch => "external_fetch",
});

/// The fixed set of stems a separation run can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StemType {
    Drums,
    Bass,
    Vocals,
    Other,
}

text_enum!(StemType, "stem type" {
    Drums => "drums",
    Bass => "bass",
    Vocals => "vocals",
    Other => "other",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Onset,
    Accent,
}

text_enum!(EventKind, "event kind" {
    Onset => "onset",
    Accent => "accent",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

text_enum!(JobStatus, "job status" {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    TimedOut => "timed_out",
});

/// Outcome of a conditional status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The track exists but its current status isn't an allowed source state.
    Rejected(TrackStatus),
    Missing,
}

/// Data for inserting a track (ingestion).
pub struct NewTrack {
    pub title: Option<String>,
    pub source_kind: SourceKind,
    pub source_uri: String,
    pub storage_path: String,
}

/// A track row read from the database.
#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: i64,
    pub title: Option<String>,
    pub source_kind: SourceKind,
    pub source_uri: String,
    pub storage_path: String,
    pub sample_rate: Option<i64>,
    pub duration_ms: Option<i64>,
    pub status: TrackStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Analysis summary to store for one pipeline run.
#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub track_id: i64,
    pub bpm: f64,
    pub confidence: f64,
    pub phase_shift_ms: i64,
    pub measures: i64,
    pub beat_count: i64,
    pub onset_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRecord {
    pub id: i64,
    pub track_id: i64,
    pub bpm: f64,
    pub confidence: f64,
    pub phase_shift_ms: i64,
    pub measures: i64,
    pub beat_count: i64,
    pub onset_count: i64,
    pub created_at: String,
}

pub struct NewStem {
    pub track_id: i64,
    pub analysis_id: i64,
    pub stem_type: StemType,
    pub storage_path: String,
    pub peak_preview: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StemRecord {
    pub id: i64,
    pub track_id: i64,
    pub analysis_id: i64,
    pub stem_type: StemType,
    pub storage_path: String,
    pub peak_preview: Vec<u8>,
}

/// One onset on a stem, already snapped to the beat grid.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStemEvent {
    pub ts_ms: i64,
    pub onset_ms: i64,
    pub strength: f64,
    pub kind: EventKind,
    pub count: i64,
    pub measure: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StemEventRecord {
    pub id: i64,
    pub stem_id: i64,
    pub ts_ms: i64,
    pub onset_ms: i64,
    pub strength: f64,
    pub kind: EventKind,
    pub count: i64,
    pub measure: i64,
}

/// A job row claimed by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: i64,
    pub track_id: i64,
    pub attempt: i64,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub track_id: i64,
    pub attempt: i64,
    pub status: JobStatus,
    pub worker: Option<String>,
    pub error: Option<String>,
    pub enqueued_at: i64,
    pub started_at: Option<i64>,
    pub deadline_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub heartbeat_at: Option<i64>,
    /// Set once the run has stopped; until then the job counts as live.
    pub released_at: Option<i64>,
}

/// Library statistics.
pub struct LibraryStats {
    pub total_tracks: i64,
    pub by_status: Vec<(TrackStatus, i64)>,
    pub total_duration_hours: f64,
    pub stems: Vec<(StemType, i64)>,
    pub events: i64,
    pub jobs: Vec<(JobStatus, i64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_text_round_trip() {
        for s in TrackStatus::ALL {
            assert_eq!(s.as_str().parse::<TrackStatus>().unwrap(), *s);
        }
        assert_eq!("timed_out".parse::<JobStatus>().unwrap(), JobStatus::TimedOut);
        assert_eq!(SourceKind::ExternalFetch.to_string(), "external_fetch");
    }

    #[test]
    fn test_unknown_variant_rejected() {
        let err = "guitar".parse::<StemType>().unwrap_err();
        assert_eq!(err.kind, "stem type");
        assert_eq!(err.to_string(), "unknown stem type value: \"guitar\"");
    }

    #[test]
    fn test_active_statuses() {
        assert!(TrackStatus::Queued.is_active());
        assert!(TrackStatus::Processing.is_active());
        assert!(!TrackStatus::Pending.is_active());
        assert!(!TrackStatus::Done.is_active());
        assert!(!TrackStatus::Failed.is_active());
    }

    #[test]
    fn test_stem_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&StemType::Vocals).unwrap(), "\"vocals\"");
        assert_eq!(serde_json::to_string(&EventKind::Accent).unwrap(), "\"accent\"");
    }
}
