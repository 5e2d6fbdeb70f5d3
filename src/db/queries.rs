use super::models::{
    AnalysisRecord, JobStatus, LibraryStats, NewAnalysis, NewStem, NewStemEvent, NewTrack,
    StemEventRecord, StemRecord, StemType, Track, TrackStatus, Transition,
};
use super::{Database, Result};
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

const TRACK_COLUMNS: &str = "id, title, source_kind, source_uri, storage_path, sample_rate,
     duration_ms, status, created_at, updated_at";

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        id: row.get(0)?,
        title: row.get(1)?,
        source_kind: row.get(2)?,
        source_uri: row.get(3)?,
        storage_path: row.get(4)?,
        sample_rate: row.get(5)?,
        duration_ms: row.get(6)?,
        status: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl Database {
    /// Insert a new pending track. Returns the track id.
    pub fn insert_track(&self, t: &NewTrack) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO tracks (title, source_kind, source_uri, storage_path, status)
             VALUES (?1, ?2, ?3, ?4, 'pending')",
            params![t.title, t.source_kind, t.source_uri, t.storage_path],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_track(&self, id: i64) -> Result<Option<Track>> {
        let track = self
            .conn
            .query_row(
                &format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = ?1"),
                params![id],
                track_from_row,
            )
            .optional()?;
        Ok(track)
    }

    /// List tracks, optionally restricted to one status.
    pub fn list_tracks(&self, status: Option<TrackStatus>) -> Result<Vec<Track>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY id"
        ))?;

        let tracks = stmt
            .query_map(params![status], track_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(tracks)
    }

    pub fn track_status(&self, id: i64) -> Result<Option<TrackStatus>> {
        let status = self
            .conn
            .query_row("SELECT status FROM tracks WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        Ok(status)
    }

    /// Move a track to `to`, but only if its current status is one of `from`.
    ///
    /// The check and the write are a single UPDATE, so two callers racing on the
    /// same track can't both see `Applied`.
    pub fn transition_track(
        &self,
        id: i64,
        from: &[TrackStatus],
        to: TrackStatus,
    ) -> Result<Transition> {
        let placeholders = (0..from.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE tracks SET status = ?1, updated_at = datetime('now')
             WHERE id = ?2 AND status IN ({placeholders})"
        );

        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&to, &id];
        for s in from {
            values.push(s);
        }

        let changed = self.conn.execute(&sql, params_from_iter(values))?;
        if changed > 0 {
            return Ok(Transition::Applied);
        }

        Ok(match self.track_status(id)? {
            Some(current) => Transition::Rejected(current),
            None => Transition::Missing,
        })
    }

    /// `processing -> done`, only while the given job still owns the run.
    /// Returns false if the track left `processing` or the job was reaped.
    pub fn complete_track(&self, track_id: i64, job_id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE tracks SET status = ?1, updated_at = datetime('now')
             WHERE id = ?2 AND status = ?3
               AND EXISTS (SELECT 1 FROM jobs WHERE id = ?4 AND track_id = ?2 AND status = ?5)",
            params![
                TrackStatus::Done,
                track_id,
                TrackStatus::Processing,
                job_id,
                JobStatus::Running
            ],
        )?;
        Ok(changed > 0)
    }

    /// Record the canonical sample rate and duration after normalization.
    pub fn set_track_audio(&self, id: i64, sample_rate: i64, duration_ms: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE tracks SET sample_rate = ?1, duration_ms = ?2, updated_at = datetime('now')
             WHERE id = ?3",
            params![sample_rate, duration_ms, id],
        )?;
        Ok(())
    }

    pub fn insert_analysis(&self, a: &NewAnalysis) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO analysis_results (
                track_id, bpm, confidence, phase_shift_ms, measures, beat_count, onset_count
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                a.track_id, a.bpm, a.confidence, a.phase_shift_ms,
                a.measures, a.beat_count, a.onset_count,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// The authoritative analysis for a track: the most recently inserted row.
    pub fn latest_analysis(&self, track_id: i64) -> Result<Option<AnalysisRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, track_id, bpm, confidence, phase_shift_ms, measures,
                        beat_count, onset_count, created_at
                 FROM analysis_results WHERE track_id = ?1
                 ORDER BY id DESC LIMIT 1",
                params![track_id],
                |row| {
                    Ok(AnalysisRecord {
                        id: row.get(0)?,
                        track_id: row.get(1)?,
                        bpm: row.get(2)?,
                        confidence: row.get(3)?,
                        phase_shift_ms: row.get(4)?,
                        measures: row.get(5)?,
                        beat_count: row.get(6)?,
                        onset_count: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn insert_stem(&self, s: &NewStem) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO stems (track_id, analysis_id, stem_type, storage_path, peak_preview)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![s.track_id, s.analysis_id, s.stem_type, s.storage_path, s.peak_preview],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Stems produced by one analysis run, in stem-type order.
    pub fn stems_for_analysis(&self, analysis_id: i64) -> Result<Vec<StemRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, track_id, analysis_id, stem_type, storage_path, peak_preview
             FROM stems WHERE analysis_id = ?1 ORDER BY id",
        )?;

        let mut stems = stmt
            .query_map(params![analysis_id], |row| {
                Ok(StemRecord {
                    id: row.get(0)?,
                    track_id: row.get(1)?,
                    analysis_id: row.get(2)?,
                    stem_type: row.get(3)?,
                    storage_path: row.get(4)?,
                    peak_preview: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        stems.sort_by_key(|s| s.stem_type);
        Ok(stems)
    }

    /// Store all events for one stem in a single transaction.
    pub fn insert_stem_events(&self, stem_id: i64, events: &[NewStemEvent]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO stem_events (
                    stem_id, ts_ms, onset_ms, strength, kind, count_in_8, measure_index
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for e in events {
                stmt.execute(params![
                    stem_id, e.ts_ms, e.onset_ms, e.strength, e.kind, e.count, e.measure
                ])?;
            }
        }
        tx.commit()?;
        Ok(events.len())
    }

    /// Events for one stem, ordered by timestamp (insertion order breaks ties).
    pub fn events_for_stem(&self, stem_id: i64) -> Result<Vec<StemEventRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, stem_id, ts_ms, onset_ms, strength, kind, count_in_8, measure_index
             FROM stem_events WHERE stem_id = ?1
             ORDER BY ts_ms, id",
        )?;

        let events = stmt
            .query_map(params![stem_id], |row| {
                Ok(StemEventRecord {
                    id: row.get(0)?,
                    stem_id: row.get(1)?,
                    ts_ms: row.get(2)?,
                    onset_ms: row.get(3)?,
                    strength: row.get(4)?,
                    kind: row.get(5)?,
                    count: row.get(6)?,
                    measure: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// Library statistics.
    pub fn stats(&self) -> Result<LibraryStats> {
        let total_tracks: i64 =
            self.conn.query_row("SELECT COUNT(*) FROM tracks", [], |r| r.get(0))?;

        let total_duration_ms: f64 = self.conn.query_row(
            "SELECT COALESCE(SUM(duration_ms), 0.0) FROM tracks",
            [],
            |r| r.get(0),
        )?;

        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tracks GROUP BY status ORDER BY status")?;
        let by_status = stmt
            .query_map([], |row| Ok((row.get::<_, TrackStatus>(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT stem_type, COUNT(*) FROM stems GROUP BY stem_type")?;
        let mut stems = stmt
            .query_map([], |row| Ok((row.get::<_, StemType>(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        stems.sort_by_key(|(t, _)| *t);

        let events: i64 =
            self.conn.query_row("SELECT COUNT(*) FROM stem_events", [], |r| r.get(0))?;

        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")?;
        let jobs = stmt
            .query_map([], |row| Ok((row.get::<_, JobStatus>(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(LibraryStats {
            total_tracks,
            by_status,
            total_duration_hours: total_duration_ms / 3_600_000.0,
            stems,
            events,
            jobs,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::jobs::DeleteOutcome;
    use crate::db::models::{EventKind, SourceKind};

    pub(crate) fn test_track() -> NewTrack {
        NewTrack {
            title: Some("Cupid Shuffle".to_string()),
            source_kind: SourceKind::Upload,
            source_uri: "/music/cupid_shuffle.wav".to_string(),
            storage_path: "uploads/cupid_shuffle.wav".to_string(),
        }
    }

    pub(crate) fn test_analysis(track_id: i64) -> NewAnalysis {
        NewAnalysis {
            track_id,
            bpm: 120.0,
            confidence: 0.5,
            phase_shift_ms: 0,
            measures: 2,
            beat_count: 16,
            onset_count: 12,
        }
    }

    pub(crate) fn event(ts_ms: i64, count: i64, measure: i64) -> NewStemEvent {
        NewStemEvent {
            ts_ms,
            onset_ms: ts_ms + 3,
            strength: 0.4,
            kind: EventKind::Onset,
            count,
            measure,
        }
    }

    #[test]
    fn test_insert_and_get_track() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_track(&test_track()).unwrap();
        assert!(id > 0);

        let t = db.get_track(id).unwrap().unwrap();
        assert_eq!(t.status, TrackStatus::Pending);
        assert_eq!(t.source_kind, SourceKind::Upload);
        assert_eq!(t.title.as_deref(), Some("Cupid Shuffle"));
        assert!(t.sample_rate.is_none());

        assert!(db.get_track(id + 1).unwrap().is_none());
    }

    #[test]
    fn test_transition_guards() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_track(&test_track()).unwrap();

        let t = db
            .transition_track(id, &[TrackStatus::Queued], TrackStatus::Processing)
            .unwrap();
        assert_eq!(t, Transition::Rejected(TrackStatus::Pending));

        let t = db
            .transition_track(id, &[TrackStatus::Pending, TrackStatus::Failed], TrackStatus::Queued)
            .unwrap();
        assert_eq!(t, Transition::Applied);
        assert_eq!(db.track_status(id).unwrap(), Some(TrackStatus::Queued));

        let t = db
            .transition_track(999, &[TrackStatus::Pending], TrackStatus::Queued)
            .unwrap();
        assert_eq!(t, Transition::Missing);
    }

    #[test]
    fn test_list_tracks_by_status() {
        let db = Database::open_in_memory().unwrap();
        let a = db.insert_track(&test_track()).unwrap();
        let _b = db.insert_track(&test_track()).unwrap();
        db.transition_track(a, &[TrackStatus::Pending], TrackStatus::Failed).unwrap();

        assert_eq!(db.list_tracks(None).unwrap().len(), 2);
        let failed = db.list_tracks(Some(TrackStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a);
    }

    #[test]
    fn test_latest_analysis_wins() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_track(&test_track()).unwrap();
        assert!(db.latest_analysis(id).unwrap().is_none());

        db.insert_analysis(&test_analysis(id)).unwrap();
        let mut second = test_analysis(id);
        second.bpm = 128.0;
        let second_id = db.insert_analysis(&second).unwrap();

        let latest = db.latest_analysis(id).unwrap().unwrap();
        assert_eq!(latest.id, second_id);
        assert_eq!(latest.bpm, 128.0);
    }

    #[test]
    fn test_stem_type_unique_per_analysis() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_track(&test_track()).unwrap();
        let analysis_id = db.insert_analysis(&test_analysis(id)).unwrap();

        let stem = NewStem {
            track_id: id,
            analysis_id,
            stem_type: StemType::Drums,
            storage_path: "stems/1/drums.wav".into(),
            peak_preview: vec![0, 1, 2, 3],
        };
        db.insert_stem(&stem).unwrap();
        assert!(db.insert_stem(&stem).is_err());

        // A later run may produce drums again
        let retry_id = db.insert_analysis(&test_analysis(id)).unwrap();
        db.insert_stem(&NewStem { analysis_id: retry_id, ..stem }).unwrap();
    }

    #[test]
    fn test_events_ordered_by_timestamp() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_track(&test_track()).unwrap();
        let analysis_id = db.insert_analysis(&test_analysis(id)).unwrap();
        let stem_id = db
            .insert_stem(&NewStem {
                track_id: id,
                analysis_id,
                stem_type: StemType::Bass,
                storage_path: "stems/1/bass.wav".into(),
                peak_preview: Vec::new(),
            })
            .unwrap();

        let n = db
            .insert_stem_events(stem_id, &[event(1000, 3, 0), event(0, 1, 0), event(500, 2, 0)])
            .unwrap();
        assert_eq!(n, 3);

        let events = db.events_for_stem(stem_id).unwrap();
        let ts: Vec<i64> = events.iter().map(|e| e.ts_ms).collect();
        assert_eq!(ts, vec![0, 500, 1000]);
        assert_eq!(events[0].onset_ms, 3);
    }

    #[test]
    fn test_delete_cascades() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_track(&test_track()).unwrap();
        let analysis_id = db.insert_analysis(&test_analysis(id)).unwrap();
        let stem_id = db
            .insert_stem(&NewStem {
                track_id: id,
                analysis_id,
                stem_type: StemType::Vocals,
                storage_path: "stems/1/vocals.wav".into(),
                peak_preview: Vec::new(),
            })
            .unwrap();
        db.insert_stem_events(stem_id, &[event(0, 1, 0)]).unwrap();

        assert_eq!(db.delete_idle_track(id).unwrap(), DeleteOutcome::Deleted);
        assert_eq!(db.delete_idle_track(id).unwrap(), DeleteOutcome::Missing);

        for table in ["analysis_results", "stems", "stem_events"] {
            let n: i64 = db
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                .unwrap();
            assert_eq!(n, 0, "{table} not cleared");
        }
    }

    #[test]
    fn test_stats() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.total_tracks, 0);
        assert_eq!(stats.events, 0);

        let id = db.insert_track(&test_track()).unwrap();
        db.set_track_audio(id, 22050, 3_600_000).unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.total_tracks, 1);
        assert_eq!(stats.by_status, vec![(TrackStatus::Pending, 1)]);
        assert!((stats.total_duration_hours - 1.0).abs() < 1e-9);
    }
}
