//! Job table queries backing the dispatch boundary.
//!
//! Every write that races with other workers runs inside a `BEGIN IMMEDIATE`
//! transaction, so the busy handler (not a snapshot error) arbitrates contention.

use super::models::{ClaimedJob, JobRecord, JobStatus, TrackStatus};
use super::{Database, Result};
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params};

/// Outcome of trying to put a track on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { job_id: i64 },
    /// The track already has a run queued or in flight.
    Rejected(TrackStatus),
    Missing,
}

/// Outcome of deleting a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Rejected(TrackStatus),
    Missing,
}

const JOB_COLUMNS: &str = "id, track_id, attempt, status, worker, error, enqueued_at,
    started_at, deadline_at, finished_at, heartbeat_at, released_at";

impl Database {
    /// Atomically move a track to `queued` and create its job row.
    ///
    /// A track is enqueueable while it has no live job. A job stays live after
    /// the reaper times it out, until its run is known to have stopped. An active
    /// track without a live job was left behind by a run that failed before it
    /// could record `failed`, and is taken back onto the queue.
    pub fn enqueue_job(&self, track_id: i64, attempt: i64, now: i64) -> Result<EnqueueOutcome> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let outcome = match self.track_status(track_id)? {
            None => EnqueueOutcome::Missing,
            Some(status) if self.has_live_job(track_id)? => {
                EnqueueOutcome::Rejected(in_flight_status(status))
            }
            Some(_) => {
                tx.execute(
                    "UPDATE tracks SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![TrackStatus::Queued, track_id],
                )?;
                tx.execute(
                    "INSERT INTO jobs (track_id, attempt, status, enqueued_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![track_id, attempt, JobStatus::Queued, now],
                )?;
                EnqueueOutcome::Enqueued { job_id: tx.last_insert_rowid() }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Delete a track unless it has a run queued or in flight. Analysis rows,
    /// stems, events and jobs go with it.
    pub fn delete_idle_track(&self, track_id: i64) -> Result<DeleteOutcome> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let outcome = match self.track_status(track_id)? {
            None => DeleteOutcome::Missing,
            Some(status) if status.is_active() || self.has_live_job(track_id)? => {
                DeleteOutcome::Rejected(in_flight_status(status))
            }
            Some(_) => {
                tx.execute("DELETE FROM tracks WHERE id = ?1", params![track_id])?;
                DeleteOutcome::Deleted
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn has_live_job(&self, track_id: i64) -> Result<bool> {
        let live = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM jobs WHERE track_id = ?1 AND released_at IS NULL)",
            params![track_id],
            |row| row.get(0),
        )?;
        Ok(live)
    }

    /// Take the oldest queued job, mark it running and stamp its deadline.
    pub fn claim_next_job(
        &self,
        worker: &str,
        now: i64,
        timeout_secs: i64,
    ) -> Result<Option<ClaimedJob>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let job = tx
            .query_row(
                "UPDATE jobs
                 SET status = ?1, worker = ?2, started_at = ?3, heartbeat_at = ?3,
                     deadline_at = ?3 + ?4
                 WHERE id = (SELECT id FROM jobs WHERE status = ?5 ORDER BY id LIMIT 1)
                 RETURNING id, track_id, attempt",
                params![JobStatus::Running, worker, now, timeout_secs, JobStatus::Queued],
                claimed_from_row,
            )
            .optional()?;

        tx.commit()?;
        Ok(job)
    }

    /// Whether the job still owns its run (not finished, not reaped).
    pub fn job_is_running(&self, job_id: i64) -> Result<bool> {
        let status: Option<JobStatus> = self
            .conn
            .query_row("SELECT status FROM jobs WHERE id = ?1", params![job_id], |row| row.get(0))
            .optional()?;
        Ok(status == Some(JobStatus::Running))
    }

    /// Refresh a live job's lease. Keeps beating after a timeout, since the run
    /// it belongs to is still executing.
    pub fn heartbeat_job(&self, job_id: i64, now: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE jobs SET heartbeat_at = ?2 WHERE id = ?1 AND released_at IS NULL",
            params![job_id, now],
        )?;
        Ok(changed > 0)
    }

    /// Record a job's terminal status and release it. A job the reaper already
    /// timed out is left alone.
    pub fn finish_job(
        &self,
        job_id: i64,
        status: JobStatus,
        error: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE jobs SET status = ?1, error = ?2, finished_at = ?3, released_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![status, error, now, job_id, JobStatus::Running],
        )?;
        Ok(changed > 0)
    }

    /// Mark a job's run as stopped. Exactly one caller wins, and the winner owns
    /// the retry decision.
    pub fn release_job(&self, job_id: i64, now: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE jobs SET released_at = ?2 WHERE id = ?1 AND released_at IS NULL",
            params![job_id, now],
        )?;
        Ok(changed > 0)
    }

    /// Time out every running job whose deadline has passed, failing its track.
    /// A claimed track that never reached `processing` is failed too, so the worker's
    /// own `queued -> processing` step loses the race instead of orphaning it.
    ///
    /// Reaped jobs stay live: their runs may still be executing stages, so
    /// nothing can be re-enqueued for the track until the job is released.
    pub fn reap_expired_jobs(&self, now: i64) -> Result<Vec<ClaimedJob>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let reaped = {
            let mut stmt = tx.prepare(
                "UPDATE jobs SET status = ?1, finished_at = ?2,
                    error = 'execution deadline exceeded'
                 WHERE status = ?3 AND deadline_at <= ?2
                 RETURNING id, track_id, attempt",
            )?;
            let rows = stmt
                .query_map(params![JobStatus::TimedOut, now, JobStatus::Running], claimed_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        for job in &reaped {
            tx.execute(
                "UPDATE tracks SET status = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND status IN (?3, ?4)",
                params![
                    TrackStatus::Failed,
                    job.track_id,
                    TrackStatus::Queued,
                    TrackStatus::Processing
                ],
            )?;
        }

        tx.commit()?;
        Ok(reaped)
    }

    /// Release timed-out jobs whose lease went stale before `stale_before`:
    /// their worker is gone and will never release them itself.
    pub fn release_abandoned_jobs(&self, now: i64, stale_before: i64) -> Result<Vec<ClaimedJob>> {
        let mut stmt = self.conn.prepare(
            "UPDATE jobs SET released_at = ?1
             WHERE status = ?2 AND released_at IS NULL
               AND COALESCE(heartbeat_at, started_at, enqueued_at) < ?3
             RETURNING id, track_id, attempt",
        )?;
        let jobs = stmt
            .query_map(params![now, JobStatus::TimedOut, stale_before], claimed_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Drop released jobs past their retention window. Returns the number removed.
    pub fn purge_finished_jobs(&self, success_before: i64, failure_before: i64) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM jobs
             WHERE released_at IS NOT NULL
               AND ((status = ?1 AND finished_at < ?2)
                 OR (status IN (?3, ?4) AND finished_at < ?5))",
            params![
                JobStatus::Succeeded,
                success_before,
                JobStatus::Failed,
                JobStatus::TimedOut,
                failure_before
            ],
        )?;
        Ok(removed)
    }

    /// Number of live jobs: queued, running, or timed out with a run not yet stopped.
    pub fn outstanding_jobs(&self) -> Result<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE released_at IS NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<JobRecord>> {
        let job = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// All jobs for a track, oldest first.
    pub fn jobs_for_track(&self, track_id: i64) -> Result<Vec<JobRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE track_id = ?1 ORDER BY id"))?;
        let jobs = stmt
            .query_map(params![track_id], job_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }
}

/// Status to report for a track that has a run in flight. An idle status here
/// means a reaped run that has not stopped yet.
fn in_flight_status(status: TrackStatus) -> TrackStatus {
    if status.is_active() { status } else { TrackStatus::Processing }
}

fn claimed_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClaimedJob> {
    Ok(ClaimedJob {
        id: row.get(0)?,
        track_id: row.get(1)?,
        attempt: row.get(2)?,
    })
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        track_id: row.get(1)?,
        attempt: row.get(2)?,
        status: row.get(3)?,
        worker: row.get(4)?,
        error: row.get(5)?,
        enqueued_at: row.get(6)?,
        started_at: row.get(7)?,
        deadline_at: row.get(8)?,
        finished_at: row.get(9)?,
        heartbeat_at: row.get(10)?,
        released_at: row.get(11)?,
    })
}
