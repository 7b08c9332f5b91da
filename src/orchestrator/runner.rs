//! Top-level run state machine for one sync job.
//!
//! A run advances Validating → ReadingSources → Aggregating → Persisting →
//! NotifyingDownstream, then finalizes. Every failure is classified: source
//! absence and validation problems write a terminal status, transient
//! upstream trouble defers the whole run by pushing the job's start date
//! forward, and anything unclassified sets Error and is re-raised so the
//! host records the run as failed. The controller is the sole writer of
//! terminal job status, and writes at most one per run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

use groupsync_common::{
    BlobStore, DownstreamAck, DownstreamAggregator, JobId, JobRepository, MembershipReady,
    MessageKind, NotificationSink, QueryPart, RunCursor, SourceDirectory, SourceRef, SyncError,
    SyncJob, SyncStatus,
};

use crate::aggregate::{AggregationInput, aggregate};
use crate::blob::{ArtifactHandle, BlobWriter, PayloadCompressor};
use crate::orchestrator::state::{StepLog, clear_run_state};
use crate::paginator::Paginator;
use crate::reader::PartReader;
use crate::retry::RetryPolicy;

/// Stages a run passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Validating,
    ReadingSources,
    Aggregating,
    Persisting,
    NotifyingDownstream,
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStage::Validating => "validating",
            RunStage::ReadingSources => "reading_sources",
            RunStage::Aggregating => "aggregating",
            RunStage::Persisting => "persisting",
            RunStage::NotifyingDownstream => "notifying_downstream",
        };
        write!(f, "{}", s)
    }
}

/// Events emitted during a run for the host to render.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StageStarted {
        job_id: JobId,
        stage: RunStage,
    },
    PartCompleted {
        job_id: JobId,
        part_index: u32,
        members: u64,
        non_members: u64,
        pages: u32,
    },
    RunDeferred {
        job_id: JobId,
        until: DateTime<Utc>,
    },
    RunCompleted {
        job_id: JobId,
        artifact_path: String,
        members: u64,
    },
    RunFailed {
        job_id: JobId,
        status: SyncStatus,
        error: String,
    },
}

/// Final disposition of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// All stages finished; the artifact was persisted and (unless the job
    /// is a dry run) announced downstream.
    Completed {
        artifact: ArtifactHandle,
        members: u64,
        duplicates_removed: u64,
        /// `None` when the announcement was skipped (dry run).
        downstream_accepted: Option<bool>,
    },
    /// Transient upstream trouble: start date pushed forward, status left
    /// effectively Idle, the whole run retried wholesale later.
    Deferred { until: DateTime<Utc> },
    /// Terminal classified failure; the written status says which.
    Rejected { status: SyncStatus },
}

/// Controller tuning. Paths and budgets come from the runtime config.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Root directory for per-run step logs.
    pub state_dir: PathBuf,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
    /// Concurrent part readers per run.
    pub max_fan_out: usize,
    /// How far the start date moves on deferral.
    pub defer: Duration,
    /// Gzip level for the artifact.
    pub compression_level: u32,
}

impl RunnerConfig {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
            max_fan_out: 4,
            defer: Duration::from_secs(30 * 60),
            compression_level: 6,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_fan_out(mut self, max_fan_out: usize) -> Self {
        self.max_fan_out = max_fan_out.max(1);
        self
    }

    pub fn with_defer(mut self, defer: Duration) -> Self {
        self.defer = defer;
        self
    }
}

/// Recorded by the first step of every run; replay hands the same run id and
/// start time back after an interruption, which keeps the artifact path and
/// all later steps deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunStart {
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

pub struct JobStatusController {
    directory: Arc<dyn SourceDirectory>,
    repository: Arc<dyn JobRepository>,
    blobs: Arc<dyn BlobStore>,
    notifications: Arc<dyn NotificationSink>,
    downstream: Arc<dyn DownstreamAggregator>,
    config: RunnerConfig,
    event_tx: Option<mpsc::Sender<RunEvent>>,
}

impl JobStatusController {
    pub fn new(
        directory: Arc<dyn SourceDirectory>,
        repository: Arc<dyn JobRepository>,
        blobs: Arc<dyn BlobStore>,
        notifications: Arc<dyn NotificationSink>,
        downstream: Arc<dyn DownstreamAggregator>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            directory,
            repository,
            blobs,
            notifications,
            downstream,
            config,
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Execute one run of `job_id` for the given part cursor.
    pub async fn run(&self, job_id: JobId, cursor: RunCursor) -> Result<RunOutcome, SyncError> {
        let job = self
            .repository
            .get(job_id)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))?;

        self.stage(job_id, RunStage::Validating).await;

        // Validation happens before any remote call or state mutation.
        if !cursor.is_valid() {
            let err = SyncError::InvalidCursor {
                current: cursor.current_part,
                total: cursor.total_parts,
            };
            error!(%job_id, %cursor, "run rejected: cursor out of bounds");
            self.write_terminal(&job, SyncStatus::Error, MessageKind::SyncFailed, &err.to_string())
                .await;
            self.finish(&job, "rejected");
            return Ok(RunOutcome::Rejected {
                status: SyncStatus::Error,
            });
        }

        if !job.query.is_valid() || job.query.batch(cursor).is_empty() {
            warn!(%job_id, "run rejected: query not valid");
            self.write_terminal(
                &job,
                SyncStatus::QueryNotValid,
                MessageKind::InvalidQuery,
                "query is structurally invalid or names only empty sources",
            )
            .await;
            self.finish(&job, "rejected");
            return Ok(RunOutcome::Rejected {
                status: SyncStatus::QueryNotValid,
            });
        }

        let run_dir = self.run_dir(job_id, cursor);
        let result = self.execute(&job, cursor, &run_dir).await;

        match result {
            Ok(outcome) => {
                self.release(&run_dir);
                self.finish(&job, "completed");
                Ok(outcome)
            }
            Err(err) => self.classify_failure(&job, cursor, err, &run_dir).await,
        }
    }

    /// Final Idle transition, owned by the downstream confirmation step.
    /// Never performed by the success path of [`Self::run`] itself.
    pub async fn confirm_completion(&self, job_id: JobId, success: bool) -> Result<(), SyncError> {
        let job = self
            .repository
            .get(job_id)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))?;

        if !success {
            warn!(%job_id, "downstream did not confirm; job left in progress");
            return Ok(());
        }

        self.repository
            .update_status(&[job_id], SyncStatus::Idle)
            .await?;
        self.repository
            .record_successful_run(job_id, Utc::now(), job.dry_run)
            .await?;
        info!(%job_id, dry_run = job.dry_run, "run confirmed; job idle");
        Ok(())
    }

    fn run_dir(&self, job_id: JobId, cursor: RunCursor) -> PathBuf {
        self.config
            .state_dir
            .join(format!("{}_part{}", job_id, cursor.current_part))
    }

    async fn execute(
        &self,
        job: &SyncJob,
        cursor: RunCursor,
        run_dir: &Path,
    ) -> Result<RunOutcome, SyncError> {
        let mut run_log = StepLog::open(run_dir, "run")?;
        let start: RunStart = run_log
            .step("start", || async {
                Ok(RunStart {
                    run_id: Uuid::new_v4(),
                    started_at: Utc::now(),
                })
            })
            .await?;

        self.repository
            .update_status(&[job.id], SyncStatus::InProgress)
            .await?;
        self.repository.record_run(job.id, Utc::now()).await?;

        self.stage(job.id, RunStage::ReadingSources).await;
        let batch: Vec<QueryPart> = job.query.batch(cursor).into_iter().cloned().collect();
        let inputs = self.read_batch(job, &batch, run_dir).await?;

        self.stage(job.id, RunStage::Aggregating).await;
        let aggregated = aggregate(job.id, start.run_id, job.destination, &inputs);
        let duplicates_removed = aggregated.duplicates_removed();

        self.stage(job.id, RunStage::Persisting).await;
        let compressor = PayloadCompressor::new(self.config.compression_level);
        let handle: ArtifactHandle = run_log
            .step("persist", || async {
                BlobWriter::new(self.blobs.as_ref(), compressor)
                    .persist(&aggregated, start.started_at, cursor.current_part)
                    .await
            })
            .await?;

        self.stage(job.id, RunStage::NotifyingDownstream).await;
        let downstream_accepted = if job.dry_run {
            info!(job_id = %job.id, "dry run: downstream announcement skipped");
            self.confirm_completion(job.id, true).await?;
            None
        } else {
            let notice = MembershipReady {
                file_path: handle.path.clone(),
                job_id: job.id,
                part_number: cursor.current_part,
                parts_count: cursor.total_parts,
                is_destination_part: batch.iter().any(|p| p.is_destination_part),
            };
            let ack: DownstreamAck = run_log
                .step("notify", || self.downstream.membership_ready(notice.clone()))
                .await?;
            if !ack.accepted {
                // Logged only: the final status transition belongs to the
                // confirmation path, not to this response.
                warn!(
                    job_id = %job.id,
                    message = ack.message.as_deref().unwrap_or(""),
                    "downstream rejected membership announcement"
                );
            }
            Some(ack.accepted)
        };

        self.emit(RunEvent::RunCompleted {
            job_id: job.id,
            artifact_path: handle.path.clone(),
            members: aggregated.members.len() as u64,
        })
        .await;

        Ok(RunOutcome::Completed {
            artifact: handle,
            members: aggregated.members.len() as u64,
            duplicates_removed,
            downstream_accepted,
        })
    }

    /// Fan the batch's parts out to concurrent readers (bounded) and join at
    /// the barrier. Results come back in positional slot order regardless of
    /// completion order.
    async fn read_batch(
        &self,
        job: &SyncJob,
        batch: &[QueryPart],
        run_dir: &Path,
    ) -> Result<Vec<AggregationInput>, SyncError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_fan_out.max(1)));

        let reads = batch.iter().map(|part| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("run semaphore never closed");

                // The destination part reads the destination's own current
                // membership in place of its named source.
                let source = if part.is_destination_part {
                    SourceRef::Group {
                        id: job.destination,
                    }
                } else {
                    part.source.clone()
                };

                let mut log = StepLog::open(run_dir, &format!("part-{}", part.index))?;
                let paginator = Paginator::new(
                    self.directory.as_ref(),
                    self.config.retry,
                    self.config.call_timeout,
                );
                let outcome = PartReader::new(paginator)
                    .read(part.index, &source, &mut log)
                    .await?;

                self.emit(RunEvent::PartCompleted {
                    job_id: job.id,
                    part_index: part.index,
                    members: outcome.members.len() as u64,
                    non_members: outcome.non_members,
                    pages: outcome.pages,
                })
                .await;

                Ok(AggregationInput {
                    part: part.clone(),
                    members: outcome.members,
                    non_members: outcome.non_members,
                })
            }
        });

        let results: Vec<Result<AggregationInput, SyncError>> =
            futures::future::join_all(reads).await;

        let mut inputs = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(input) => inputs.push(input),
                Err(err) => failures.push(err),
            }
        }
        if let Some(err) = pick_failure(failures) {
            return Err(err);
        }
        Ok(inputs)
    }

    /// Map a failed run onto a job status and disposition.
    async fn classify_failure(
        &self,
        job: &SyncJob,
        cursor: RunCursor,
        err: SyncError,
        run_dir: &Path,
    ) -> Result<RunOutcome, SyncError> {
        match err {
            SyncError::SourceNotFound { source_name: ref source } => {
                warn!(job_id = %job.id, source, "source absent upstream");
                self.write_terminal(
                    job,
                    SyncStatus::SecurityGroupNotFound,
                    MessageKind::SourceNotFound,
                    source,
                )
                .await;
                self.release(run_dir);
                self.finish(job, "rejected");
                Ok(RunOutcome::Rejected {
                    status: SyncStatus::SecurityGroupNotFound,
                })
            }
            ref e if e.is_transient() => {
                let until = Utc::now()
                    + chrono::Duration::from_std(self.config.defer)
                        .unwrap_or_else(|_| chrono::Duration::minutes(30));
                info!(job_id = %job.id, %cursor, %until, error = %e, "upstream unavailable; run deferred");
                if let Err(repo_err) = self.repository.defer_start(job.id, until).await {
                    error!(job_id = %job.id, error = %repo_err, "failed to defer start date");
                }
                // Status goes back to effectively Idle so the scheduler picks
                // the job up again once the deferred start date arrives.
                if let Err(repo_err) = self
                    .repository
                    .update_status(&[job.id], SyncStatus::Idle)
                    .await
                {
                    error!(job_id = %job.id, error = %repo_err, "failed to reset status");
                }
                self.emit(RunEvent::RunDeferred {
                    job_id: job.id,
                    until,
                })
                .await;
                // Wholesale retry: the deferred run starts from scratch.
                self.release(run_dir);
                self.finish(job, "deferred");
                Ok(RunOutcome::Deferred { until })
            }
            err => {
                error!(job_id = %job.id, error = %err, "run failed");
                self.write_terminal(job, SyncStatus::Error, MessageKind::SyncFailed, &err.to_string())
                    .await;
                self.release(run_dir);
                self.finish(job, "failed");
                // Re-raised so the host records the run as failed.
                Err(err)
            }
        }
    }

    /// The single terminal status write of a run, plus its stakeholder
    /// notification. Both are best-effort beyond the first status write.
    async fn write_terminal(
        &self,
        job: &SyncJob,
        status: SyncStatus,
        message: MessageKind,
        details: &str,
    ) {
        if let Err(err) = self.repository.update_status(&[job.id], status).await {
            error!(job_id = %job.id, %status, error = %err, "terminal status write failed");
        }
        if let Err(err) = self.notifications.send(message, job.id, details).await {
            warn!(job_id = %job.id, %message, error = %err, "notification delivery failed");
        }
        self.emit(RunEvent::RunFailed {
            job_id: job.id,
            status,
            error: details.to_string(),
        })
        .await;
    }

    /// Release per-run correlation state.
    fn release(&self, run_dir: &Path) {
        if let Err(err) = clear_run_state(run_dir) {
            warn!(dir = %run_dir.display(), error = %err, "failed to clear run state");
        }
    }

    /// The completion log line every run ends with, whatever the outcome.
    fn finish(&self, job: &SyncJob, disposition: &str) {
        info!(job_id = %job.id, destination = %job.destination, disposition, "run finished");
    }

    async fn stage(&self, job_id: JobId, stage: RunStage) {
        info!(%job_id, %stage, "stage started");
        self.emit(RunEvent::StageStarted { job_id, stage }).await;
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

/// Deterministic failure precedence for the fan-in barrier: source absence
/// first, then any other permanent fault, then transient ones. Concurrent
/// completion order never changes the classification.
fn pick_failure(mut failures: Vec<SyncError>) -> Option<SyncError> {
    if failures.is_empty() {
        return None;
    }
    if let Some(pos) = failures
        .iter()
        .position(|e| matches!(e, SyncError::SourceNotFound { .. }))
    {
        return Some(failures.remove(pos));
    }
    if let Some(pos) = failures.iter().position(|e| !e.is_transient()) {
        return Some(failures.remove(pos));
    }
    Some(failures.remove(0))
}
