//! Dispatch loop: picks due jobs and drives their runs.
//!
//! Each tick loads jobs whose start date has been reached, skips the ones
//! whose status forbids a run or that are already in flight, and spawns one
//! task per job bounded by a semaphore. Parts of one job run sequentially
//! inside its task (the guarantee that two instances of the same job never
//! run concurrently lives here); parallelism inside a run comes from the
//! controller's part fan-out.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use groupsync_common::{JobId, JobRepository, RunCursor, SyncJob, SyncStatus};

use crate::orchestrator::{JobStatusController, RunOutcome};

/// Injected time source, so cache expiry is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The most recent successful run, cached for heartbeat reporting.
///
/// Single writer: the scheduler owns the cache and is the only component
/// that records into it. Entries expire after `ttl` so a stale run is never
/// reported as recent.
pub struct LastRunCache {
    entry: Option<(JobId, DateTime<Utc>)>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl LastRunCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entry: None,
            ttl,
            clock,
        }
    }

    pub fn record(&mut self, job_id: JobId) {
        self.entry = Some((job_id, self.clock.now()));
    }

    pub fn get(&mut self) -> Option<(JobId, DateTime<Utc>)> {
        let now = self.clock.now();
        if let Some((_, at)) = self.entry {
            let age = (now - at).to_std().unwrap_or_default();
            if age > self.ttl {
                self.entry = None;
            }
        }
        self.entry
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between dispatch ticks.
    pub tick: Duration,
    /// Concurrent jobs across the whole process.
    pub max_concurrent_jobs: usize,
    /// How long a job may sit InProgress before it is considered stuck and
    /// eligible for re-dispatch (resuming via its step logs).
    pub stuck_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            max_concurrent_jobs: 2,
            stuck_after: Duration::from_secs(2 * 60 * 60),
        }
    }
}

pub struct Scheduler {
    controller: Arc<JobStatusController>,
    repository: Arc<dyn JobRepository>,
    config: SchedulerConfig,
    in_flight: Arc<Mutex<HashSet<JobId>>>,
    slots: Arc<Semaphore>,
    last_run: Arc<Mutex<LastRunCache>>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(
        controller: Arc<JobStatusController>,
        repository: Arc<dyn JobRepository>,
        config: SchedulerConfig,
    ) -> Self {
        Self::with_clock(controller, repository, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        controller: Arc<JobStatusController>,
        repository: Arc<dyn JobRepository>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        let cache = LastRunCache::new(Duration::from_secs(24 * 60 * 60), clock.clone());
        Self {
            controller,
            repository,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            slots,
            last_run: Arc::new(Mutex::new(cache)),
            clock,
        }
    }

    /// Run dispatch ticks until the process is stopped.
    pub async fn run_loop(&self) {
        loop {
            match self.tick().await {
                Ok(dispatched) if dispatched > 0 => {
                    info!(dispatched, "dispatch tick complete");
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "dispatch tick failed"),
            }
            self.heartbeat();
            tokio::time::sleep(self.config.tick).await;
        }
    }

    /// One dispatch pass. Returns how many jobs were started.
    pub async fn tick(&self) -> Result<usize, groupsync_common::SyncError> {
        let now = self.clock.now();
        let due = self.repository.due_jobs(now).await?;

        let mut dispatched = 0;
        for job in due {
            if !self.should_dispatch(&job, now) {
                continue;
            }
            self.spawn_job(job);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn should_dispatch(&self, job: &SyncJob, now: DateTime<Utc>) -> bool {
        if !job.status.is_runnable() {
            return false;
        }
        // An InProgress job is only re-dispatched once it looks stuck; its
        // step logs make the re-dispatch a resume, not a restart.
        if job.status == SyncStatus::InProgress {
            let stuck = match job.last_run {
                Some(last) => {
                    (now - last).to_std().unwrap_or_default() >= self.config.stuck_after
                }
                None => true,
            };
            if !stuck {
                return false;
            }
            warn!(job_id = %job.id, "job looks stuck; re-dispatching for resume");
        }

        // A job already in flight here is never dispatched twice.
        let mut in_flight = self.in_flight.lock().expect("in-flight guard poisoned");
        if !in_flight.insert(job.id) {
            return false;
        }
        true
    }

    fn spawn_job(&self, job: SyncJob) {
        let controller = self.controller.clone();
        let in_flight = self.in_flight.clone();
        let last_run = self.last_run.clone();
        let slots = self.slots.clone();

        tokio::spawn(async move {
            let _permit = slots
                .acquire_owned()
                .await
                .expect("scheduler semaphore never closed");

            let total_parts = job.query.parts.len().max(1) as u32;
            let mut all_accepted = true;
            let mut finished = true;

            for part in 1..=total_parts {
                let cursor = RunCursor::new(part, total_parts);
                match controller.run(job.id, cursor).await {
                    Ok(RunOutcome::Completed {
                        downstream_accepted,
                        ..
                    }) => {
                        // `None` means a dry run, confirmed by the
                        // controller already.
                        if downstream_accepted == Some(false) {
                            all_accepted = false;
                        }
                    }
                    Ok(RunOutcome::Deferred { until }) => {
                        info!(job_id = %job.id, %until, "job deferred");
                        finished = false;
                        break;
                    }
                    Ok(RunOutcome::Rejected { status }) => {
                        warn!(job_id = %job.id, %status, "job rejected");
                        finished = false;
                        break;
                    }
                    Err(err) => {
                        error!(job_id = %job.id, error = %err, "job run failed");
                        finished = false;
                        break;
                    }
                }
            }

            if finished && !job.dry_run {
                if all_accepted {
                    if let Err(err) = controller.confirm_completion(job.id, true).await {
                        error!(job_id = %job.id, error = %err, "confirmation failed");
                    } else {
                        last_run
                            .lock()
                            .expect("last-run cache poisoned")
                            .record(job.id);
                    }
                } else {
                    warn!(job_id = %job.id, "downstream rejected at least one part; confirmation withheld");
                }
            } else if finished && job.dry_run {
                last_run
                    .lock()
                    .expect("last-run cache poisoned")
                    .record(job.id);
            }

            in_flight
                .lock()
                .expect("in-flight guard poisoned")
                .remove(&job.id);
        });
    }

    fn heartbeat(&self) {
        let cached = self
            .last_run
            .lock()
            .expect("last-run cache poisoned")
            .get();
        match cached {
            Some((job_id, at)) => info!(%job_id, %at, "scheduler alive; last successful run"),
            None => info!("scheduler alive; no recent successful run"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(start),
            }
        }

        fn advance(&self, d: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::from_std(d).unwrap();
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    #[test]
    fn test_last_run_cache_expires() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut cache = LastRunCache::new(Duration::from_secs(60), clock.clone());
        assert!(cache.get().is_none());

        let job_id = JobId::new();
        cache.record(job_id);
        assert_eq!(cache.get().map(|(id, _)| id), Some(job_id));

        clock.advance(Duration::from_secs(30));
        assert!(cache.get().is_some());

        clock.advance(Duration::from_secs(31));
        assert!(cache.get().is_none());
        // Stays empty after expiry.
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_last_run_cache_latest_wins() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut cache = LastRunCache::new(Duration::from_secs(60), clock.clone());

        let first = JobId::new();
        let second = JobId::new();
        cache.record(first);
        clock.advance(Duration::from_secs(10));
        cache.record(second);
        assert_eq!(cache.get().map(|(id, _)| id), Some(second));
    }
}
