//! Job dispatch: enqueueing, the worker pool, retries, the timeout reaper and
//! result retention.
//!
//! Jobs live in the same SQLite database as everything else. Each worker thread
//! owns its own connection and runs one track's pipeline at a time.
//!
//! A run can't be killed from outside, so a job the reaper times out stays live
//! until its run has stopped. The worker that owned it releases it and decides
//! on the retry. If that worker is gone, its lease goes stale and the sweep
//! releases and retries the job instead.

use crate::analyzer::{Orchestrator, PipelineError, RunSummary, UnitOfWork};
use crate::config::DispatchConfig;
use crate::db::jobs::EnqueueOutcome;
use crate::db::models::{ClaimedJob, JobStatus};
use crate::db::{Database, DbError};
use indicatif::ProgressBar;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Worker pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Put a track on the queue for its first attempt. Returns the job id.
pub fn enqueue(db: &Database, track_id: i64) -> Result<i64, PipelineError> {
    enqueue_attempt(db, track_id, 1)
}

fn enqueue_attempt(db: &Database, track_id: i64, attempt: i64) -> Result<i64, PipelineError> {
    match db.enqueue_job(track_id, attempt, unix_now())? {
        EnqueueOutcome::Enqueued { job_id } => {
            log::debug!("track={} queued as job {} (attempt {})", track_id, job_id, attempt);
            Ok(job_id)
        }
        EnqueueOutcome::Rejected(status) => Err(PipelineError::Conflict { track_id, status }),
        EnqueueOutcome::Missing => Err(PipelineError::NotFound(track_id)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    Retried,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
}

impl WorkerReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Retried => self.retried += 1,
        }
    }

    fn merge(mut self, other: WorkerReport) -> Self {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.retried += other.retried;
        self
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reaped: usize,
    /// Timed-out jobs whose worker stopped heartbeating.
    pub abandoned: usize,
    pub retried: usize,
    pub purged: usize,
}

/// Runs claimed jobs through an orchestrator under the configured policy.
pub struct Dispatcher<'a> {
    orchestrator: &'a Orchestrator,
    config: DispatchConfig,
    progress: Option<&'a ProgressBar>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(orchestrator: &'a Orchestrator, config: DispatchConfig) -> Self {
        Self {
            orchestrator,
            config,
            progress: None,
        }
    }

    /// Tick `progress` once per job that reaches a terminal state.
    pub fn with_progress(mut self, progress: &'a ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Start `workers` threads, each with its own connection to `db_path`.
    ///
    /// In burst mode every worker returns once nothing is queued or running;
    /// otherwise they poll forever.
    pub fn run_workers(
        &self,
        db_path: &Path,
        workers: usize,
        burst: bool,
    ) -> Result<WorkerReport, DispatchError> {
        let workers = workers.max(1);
        log::info!("Starting {} workers{}", workers, if burst { " (burst)" } else { "" });

        let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
        let results = pool.broadcast(|ctx| {
            let name = format!("pid{}-w{}", std::process::id(), ctx.index());
            self.worker_loop(&name, db_path, burst)
        });

        let mut total = WorkerReport::default();
        for result in results {
            total = total.merge(result?);
        }
        Ok(total)
    }

    fn worker_loop(&self, name: &str, db_path: &Path, burst: bool) -> Result<WorkerReport, DispatchError> {
        let db = Database::open(db_path)?;
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let mut report = WorkerReport::default();

        loop {
            if let Err(e) = self.sweep_at(&db, unix_now()) {
                log::warn!("{}: sweep failed: {}", name, e);
            }

            match db.claim_next_job(name, unix_now(), self.config.job_timeout_secs)? {
                Some(job) => {
                    log::debug!("{}: claimed job {} for track {}", name, job.id, job.track_id);
                    report.record(self.execute(&db, db_path, &job));
                }
                None => {
                    if burst && db.outstanding_jobs()? == 0 {
                        break;
                    }
                    std::thread::sleep(poll);
                }
            }
        }

        log::debug!("{}: exiting, {:?}", name, report);
        Ok(report)
    }

    /// Run one claimed job and record its result. Database errors while recording
    /// are logged; the reaper and the lease clean up whatever state they leave behind.
    fn execute(&self, db: &Database, db_path: &Path, job: &ClaimedJob) -> Outcome {
        let result = self.run_leased(db, db_path, job);

        let now = unix_now();
        let finished = match &result {
            Ok(_) => db.finish_job(job.id, JobStatus::Succeeded, None, now),
            Err(PipelineError::Timeout(_)) => Ok(false),
            Err(e) => {
                let error = format!("{}: {}", e.kind(), e);
                db.finish_job(job.id, JobStatus::Failed, Some(&error), now)
            }
        };

        let outcome = match (finished, result) {
            (Err(e), _) => {
                log::warn!("job {}: could not record result: {}", job.id, e);
                return Outcome::Failed;
            }
            (Ok(true), Ok(_)) => Outcome::Succeeded,
            (Ok(true), Err(e)) if e.is_retryable() => self.retry(db, job),
            (Ok(true), Err(_)) => Outcome::Failed,
            // The reaper took the job while it ran. Our run has stopped now,
            // so whoever releases the job owns its retry.
            (Ok(false), result) => {
                if !self.release(db, job) {
                    return Outcome::Failed;
                }
                match result {
                    Ok(_) => Outcome::Succeeded,
                    Err(e) if e.is_retryable() => self.retry(db, job),
                    Err(_) => Outcome::Failed,
                }
            }
        };
        self.tick(outcome);
        outcome
    }

    /// Run the orchestrator while a second connection keeps the job's lease fresh.
    fn run_leased(
        &self,
        db: &Database,
        db_path: &Path,
        job: &ClaimedJob,
    ) -> Result<RunSummary, PipelineError> {
        let interval = Duration::from_secs(self.config.heartbeat_secs.max(1));
        let job_id = job.id;
        std::thread::scope(|scope| {
            let (stop, stopped) = mpsc::channel::<()>();
            scope.spawn(move || heartbeat(db_path, job_id, interval, stopped));

            let uow = UnitOfWork::new(db, job.track_id, job.id);
            let result = self.orchestrator.run(&uow);
            drop(stop);
            result
        })
    }

    fn release(&self, db: &Database, job: &ClaimedJob) -> bool {
        match db.release_job(job.id, unix_now()) {
            Ok(released) => released,
            Err(e) => {
                log::warn!("job {}: could not release: {}", job.id, e);
                false
            }
        }
    }

    /// Re-enqueue a failed job's track if attempts remain.
    fn retry(&self, db: &Database, job: &ClaimedJob) -> Outcome {
        if job.attempt >= self.config.max_attempts {
            log::warn!(
                "track={} giving up after {} attempts",
                job.track_id,
                job.attempt
            );
            return Outcome::Failed;
        }
        match enqueue_attempt(db, job.track_id, job.attempt + 1) {
            Ok(job_id) => {
                log::info!(
                    "track={} retrying as job {} (attempt {})",
                    job.track_id,
                    job_id,
                    job.attempt + 1
                );
                Outcome::Retried
            }
            Err(e) => {
                log::warn!("track={} could not be re-enqueued: {}", job.track_id, e);
                Outcome::Failed
            }
        }
    }

    fn tick(&self, outcome: Outcome) {
        if let Some(pb) = self.progress {
            if outcome != Outcome::Retried {
                pb.inc(1);
            }
        }
    }

    /// Reap expired jobs, retry the ones whose worker is gone, and purge
    /// released jobs past their retention window.
    pub fn sweep(&self, db: &Database) -> Result<SweepReport, DispatchError> {
        self.sweep_at(db, unix_now())
    }

    fn sweep_at(&self, db: &Database, now: i64) -> Result<SweepReport, DispatchError> {
        let reaped = db.reap_expired_jobs(now)?;
        for job in &reaped {
            log::warn!("job {} for track {} timed out", job.id, job.track_id);
        }

        let abandoned = db.release_abandoned_jobs(now, now - self.config.lease_secs)?;
        let mut retried = 0;
        for job in &abandoned {
            log::warn!("job {} for track {} lost its worker", job.id, job.track_id);
            let outcome = self.retry(db, job);
            if outcome == Outcome::Retried {
                retried += 1;
            }
            self.tick(outcome);
        }

        let purged = db.purge_finished_jobs(
            now - self.config.success_ttl_secs,
            now - self.config.failure_ttl_secs,
        )?;
        if purged > 0 {
            log::debug!("Purged {} finished jobs", purged);
        }

        Ok(SweepReport {
            reaped: reaped.len(),
            abandoned: abandoned.len(),
            retried,
            purged,
        })
    }
}

/// Refresh a job's lease every `interval` until `stop` hangs up.
fn heartbeat(db_path: &Path, job_id: i64, interval: Duration, stop: Receiver<()>) {
    let db = match Database::open(db_path) {
        Ok(db) => db,
        Err(e) => {
            log::warn!("job {}: no heartbeat connection: {}", job_id, e);
            return;
        }
    };
    while let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(interval) {
        if let Err(e) = db.heartbeat_job(job_id, unix_now()) {
            log::warn!("job {}: heartbeat failed: {}", job_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::separate::NoSeparator;
    use crate::analyzer::tests::{
        BrokenSeparator, Harness, ScriptedExtractor, block_processing, steady_120, unblock_processing,
    };
    use crate::analyzer::transcode::{NativeTranscoder, NormalizedAudio, TranscodeError, Transcoder};
    use crate::analyzer::{PipelineSettings, Ports};
    use crate::audio::Waveform;
    use crate::db::models::TrackStatus;
    use crate::storage::LocalStorage;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    fn quiet(n: usize) -> Waveform {
        Waveform::new(vec![0.1; n], 22050)
    }

    fn steady_ports() -> Ports {
        Ports {
            transcoder: Box::new(NativeTranscoder),
            features: Box::new(ScriptedExtractor(steady_120())),
            separator: Box::new(NoSeparator),
        }
    }

    /// While the first run is inside stage 1, acts as a second worker: sweeps,
    /// then tries to claim the next job.
    struct SecondWorker {
        db_path: PathBuf,
        storage: LocalStorage,
        config: DispatchConfig,
        seen: Arc<Mutex<Option<(SweepReport, Option<ClaimedJob>)>>>,
    }

    impl Transcoder for SecondWorker {
        fn normalize(
            &self,
            input: &Path,
            target_sample_rate: u32,
            output: &Path,
        ) -> Result<NormalizedAudio, TranscodeError> {
            let out = NativeTranscoder.normalize(input, target_sample_rate, output)?;

            let db = Database::open(&self.db_path).unwrap();
            let orch = Orchestrator::new(steady_ports(), self.storage.clone(), PipelineSettings::default());
            let report = Dispatcher::new(&orch, self.config.clone()).sweep(&db).unwrap();
            let claimed = db.claim_next_job("w1", unix_now(), 60).unwrap();
            *self.seen.lock().unwrap() = Some((report, claimed));
            Ok(out)
        }
    }

    fn config(max_attempts: i64) -> DispatchConfig {
        DispatchConfig {
            max_attempts,
            poll_interval_ms: 10,
            ..DispatchConfig::default()
        }
    }

    #[test]
    fn test_enqueue_conflict_and_not_found() {
        let h = Harness::new();
        let id = h.add_track("a.wav", &quiet(100));

        enqueue(&h.db, id).unwrap();
        assert!(matches!(
            enqueue(&h.db, id),
            Err(PipelineError::Conflict { status: TrackStatus::Queued, .. })
        ));
        assert!(matches!(enqueue(&h.db, 999), Err(PipelineError::NotFound(999))));

        h.db.claim_next_job("w0", unix_now(), 60).unwrap().unwrap();
        h.db.transition_track(id, &[TrackStatus::Queued], TrackStatus::Processing).unwrap();
        assert!(matches!(
            enqueue(&h.db, id),
            Err(PipelineError::Conflict { status: TrackStatus::Processing, .. })
        ));
    }

    #[test]
    fn test_reaped_run_keeps_its_track_until_it_stops() {
        let h = Harness::new();
        let cfg = DispatchConfig {
            job_timeout_secs: 0,
            ..config(3)
        };
        let seen = Arc::new(Mutex::new(None));
        let orch = h.orchestrator(Ports {
            transcoder: Box::new(SecondWorker {
                db_path: h.db_path(),
                storage: h.storage.clone(),
                config: cfg.clone(),
                seen: Arc::clone(&seen),
            }),
            features: Box::new(ScriptedExtractor(steady_120())),
            separator: Box::new(NoSeparator),
        });
        let id = h.add_track("slow.wav", &quiet(2205));
        enqueue(&h.db, id).unwrap();
        let job = h.db.claim_next_job("w0", unix_now(), 0).unwrap().unwrap();

        let outcome = Dispatcher::new(&orch, cfg).execute(&h.db, &h.db_path(), &job);

        // The other worker saw the timeout but could neither retry nor claim the track
        let (report, claimed) = seen.lock().unwrap().take().unwrap();
        assert_eq!((report.reaped, report.abandoned, report.retried), (1, 0, 0));
        assert!(claimed.is_none());

        // Once the run stopped, its own worker released the job and retried
        assert_eq!(outcome, Outcome::Retried);
        let jobs = h.db.jobs_for_track(id).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].status, JobStatus::TimedOut);
        assert!(jobs[0].released_at.is_some());
        assert_eq!((jobs[1].attempt, jobs[1].status), (2, JobStatus::Queued));
        assert_eq!(h.db.track_status(id).unwrap(), Some(TrackStatus::Queued));
        assert!(h.db.latest_analysis(id).unwrap().is_none());

        let steady = h.orchestrator(steady_ports());
        let report = Dispatcher::new(&steady, config(3))
            .run_workers(&h.db_path(), 1, true)
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(h.db.track_status(id).unwrap(), Some(TrackStatus::Done));
    }

    #[test]
    fn test_failed_start_is_retried() {
        let h = Harness::new();
        let orch = h.orchestrator(steady_ports());
        let dispatcher = Dispatcher::new(&orch, config(3));
        let id = h.add_track("a.wav", &quiet(2205));
        enqueue(&h.db, id).unwrap();
        let job = h.db.claim_next_job("w0", unix_now(), 60).unwrap().unwrap();
        block_processing(&h.db);

        assert_eq!(dispatcher.execute(&h.db, &h.db_path(), &job), Outcome::Retried);
        let first = h.db.get_job(job.id).unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Failed);
        assert!(first.error.as_deref().unwrap().starts_with("persistence_failure"));
        assert_eq!(h.db.track_status(id).unwrap(), Some(TrackStatus::Queued));
        assert_eq!(h.db.outstanding_jobs().unwrap(), 1);

        unblock_processing(&h.db);
        let report = dispatcher.run_workers(&h.db_path(), 1, true).unwrap();
        assert_eq!(report, WorkerReport { succeeded: 1, failed: 0, retried: 0 });
        assert_eq!(h.db.track_status(id).unwrap(), Some(TrackStatus::Done));
    }

    #[test]
    fn test_burst_workers_drain_queue() {
        let h = Harness::new();
        let orch = h.orchestrator(steady_ports());
        let ids: Vec<i64> = (0..3)
            .map(|i| h.add_track(&format!("t{i}.wav"), &quiet(2205)))
            .collect();
        for id in &ids {
            enqueue(&h.db, *id).unwrap();
        }

        let report = Dispatcher::new(&orch, config(3))
            .run_workers(&h.db_path(), 2, true)
            .unwrap();
        assert_eq!(report, WorkerReport { succeeded: 3, failed: 0, retried: 0 });

        for id in ids {
            assert_eq!(h.db.track_status(id).unwrap(), Some(TrackStatus::Done));
            let jobs = h.db.jobs_for_track(id).unwrap();
            assert_eq!(jobs.len(), 1);
            assert_eq!(jobs[0].status, JobStatus::Succeeded);
        }
        assert_eq!(h.db.outstanding_jobs().unwrap(), 0);
    }

    #[test]
    fn test_retryable_failure_uses_all_attempts() {
        let h = Harness::new();
        let orch = h.orchestrator(Ports {
            transcoder: Box::new(NativeTranscoder),
            features: Box::new(ScriptedExtractor(steady_120())),
            separator: Box::new(BrokenSeparator),
        });
        let id = h.add_track("a.wav", &quiet(2205));
        enqueue(&h.db, id).unwrap();

        let report = Dispatcher::new(&orch, config(2))
            .run_workers(&h.db_path(), 1, true)
            .unwrap();
        assert_eq!(report, WorkerReport { succeeded: 0, failed: 1, retried: 1 });

        let jobs = h.db.jobs_for_track(id).unwrap();
        assert_eq!(jobs.iter().map(|j| j.attempt).collect::<Vec<_>>(), vec![1, 2]);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Failed));
        assert!(jobs[0].error.as_deref().unwrap().starts_with("upstream_failure"));
        assert_eq!(h.db.track_status(id).unwrap(), Some(TrackStatus::Failed));
    }

    #[test]
    fn test_input_error_is_not_retried() {
        let h = Harness::new();
        let orch = h.orchestrator(steady_ports());
        let id = h.add_track("a.wav", &quiet(100));
        let track = h.db.get_track(id).unwrap().unwrap();
        h.storage.remove(&track.storage_path).unwrap();
        enqueue(&h.db, id).unwrap();

        let report = Dispatcher::new(&orch, config(3))
            .run_workers(&h.db_path(), 1, true)
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(h.db.jobs_for_track(id).unwrap().len(), 1);
    }

    #[test]
    fn test_sweep_reaps_retries_and_purges() {
        let h = Harness::new();
        let orch = h.orchestrator(steady_ports());
        let dispatcher = Dispatcher::new(&orch, config(2));

        let stuck = h.add_track("stuck.wav", &quiet(100));
        h.db.enqueue_job(stuck, 1, 0).unwrap();
        let job = h.db.claim_next_job("w0", 0, 60).unwrap().unwrap();

        let now = 1_000_000;
        let report = dispatcher.sweep_at(&h.db, now).unwrap();
        assert_eq!(report.reaped, 1);
        // Nothing has heartbeated since the claim, so the worker is gone
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.retried, 1);

        assert_eq!(h.db.get_job(job.id).unwrap().unwrap().status, JobStatus::TimedOut);
        assert_eq!(h.db.track_status(stuck).unwrap(), Some(TrackStatus::Queued));
        let jobs = h.db.jobs_for_track(stuck).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].attempt, 2);

        // Timed-out job is inside the failure window until a week has passed
        let later = dispatcher.sweep_at(&h.db, now + 604_800 + 1).unwrap();
        assert_eq!(later.purged, 1);
        assert!(h.db.get_job(job.id).unwrap().is_none());
    }
}
