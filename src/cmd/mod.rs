//! Command handlers for the groupsync CLI.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use uuid::Uuid;

use groupsync::blob::FsBlobStore;
use groupsync::config::GroupsyncConfig;
use groupsync::directory::{HttpDirectoryConfig, HttpSourceDirectory};
use groupsync::downstream::{HttpDownstream, LogNotificationSink, WebhookNotificationSink};
use groupsync::orchestrator::{JobStatusController, RunOutcome};
use groupsync::repo::SqliteJobRepository;
use groupsync::scheduler::Scheduler;
use groupsync_common::{
    GroupId, JobId, JobRepository, NotificationSink, RunCursor, SyncJob, SyncQuery, SyncStatus,
};

/// Job definition accepted by `groupsync add`.
#[derive(Deserialize)]
struct JobSpec {
    destination: Uuid,
    query: SyncQuery,
    #[serde(default = "default_period_hours")]
    period_hours: u32,
    #[serde(default)]
    dry_run: bool,
}

fn default_period_hours() -> u32 {
    24
}

fn open_repository(config: &GroupsyncConfig) -> Result<Arc<SqliteJobRepository>> {
    let repo = SqliteJobRepository::open(&config.database_path())
        .map_err(|e| anyhow!("cannot open job database: {}", e))?;
    Ok(Arc::new(repo))
}

fn build_controller(
    config: &GroupsyncConfig,
    repository: Arc<SqliteJobRepository>,
) -> Result<JobStatusController> {
    let base_url = config
        .directory
        .base_url
        .clone()
        .context("directory.base_url must be configured to run jobs")?;
    let aggregator_url = config
        .downstream
        .aggregator_url
        .clone()
        .context("downstream.aggregator_url must be configured to run jobs")?;

    let directory = Arc::new(HttpSourceDirectory::new(HttpDirectoryConfig {
        base_url,
        token: config.directory_token(),
    }));
    let blobs = Arc::new(FsBlobStore::new(config.artifact_dir()));
    let notifications: Arc<dyn NotificationSink> =
        match config.downstream.notification_webhook.clone() {
            Some(url) => Arc::new(WebhookNotificationSink::new(url)),
            None => Arc::new(LogNotificationSink),
        };
    let downstream = Arc::new(HttpDownstream::new(aggregator_url));

    Ok(JobStatusController::new(
        directory,
        repository,
        blobs,
        notifications,
        downstream,
        config.runner_config(),
    ))
}

pub async fn add(config: &GroupsyncConfig, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read job file {}", file.display()))?;
    let spec: JobSpec = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job file {}", file.display()))?;

    let mut job = SyncJob::new(GroupId(spec.destination), spec.query, spec.period_hours);
    job.dry_run = spec.dry_run;

    let repository = open_repository(config)?;
    repository
        .insert(job.clone())
        .await
        .map_err(|e| anyhow!("{}", e))?;

    println!("Registered job {} (pending review)", job.id);
    Ok(())
}

pub async fn approve(config: &GroupsyncConfig, job: Uuid) -> Result<()> {
    let repository = open_repository(config)?;
    let job_id = JobId(job);
    let existing = repository
        .get(job_id)
        .await
        .map_err(|e| anyhow!("{}", e))?
        .with_context(|| format!("Job {} not found", job))?;

    if existing.status != SyncStatus::PendingReview {
        bail!("Job {} is {}, not pending review", job, existing.status);
    }
    repository
        .update_status(&[job_id], SyncStatus::Idle)
        .await
        .map_err(|e| anyhow!("{}", e))?;
    println!("Approved job {}", job);
    Ok(())
}

pub async fn run(
    config: &GroupsyncConfig,
    job: Uuid,
    part: Option<u32>,
    parts: Option<u32>,
) -> Result<()> {
    let repository = open_repository(config)?;
    let job_id = JobId(job);
    let existing = repository
        .get(job_id)
        .await
        .map_err(|e| anyhow!("{}", e))?
        .with_context(|| format!("Job {} not found", job))?;

    let controller = build_controller(config, repository)?;

    let total = parts.unwrap_or(existing.query.parts.len().max(1) as u32);
    let selected: Vec<u32> = match part {
        Some(p) => vec![p],
        None => (1..=total).collect(),
    };

    for current in selected {
        let cursor = RunCursor::new(current, total);
        match controller.run(job_id, cursor).await {
            Ok(RunOutcome::Completed {
                artifact,
                members,
                duplicates_removed,
                downstream_accepted,
            }) => {
                println!(
                    "Part {}/{}: {} members ({} duplicates removed) -> {}",
                    current, total, members, duplicates_removed, artifact.path
                );
                if downstream_accepted == Some(false) {
                    println!("  downstream rejected the announcement");
                }
            }
            Ok(RunOutcome::Deferred { until }) => {
                println!("Part {}/{}: deferred until {}", current, total, until);
                break;
            }
            Ok(RunOutcome::Rejected { status }) => {
                println!("Part {}/{}: rejected, job status {}", current, total, status);
                break;
            }
            Err(err) => return Err(anyhow!("run failed: {}", err)),
        }
    }
    Ok(())
}

pub async fn daemon(config: &GroupsyncConfig) -> Result<()> {
    let repository = open_repository(config)?;
    let controller = Arc::new(build_controller(config, repository.clone())?);
    let scheduler = Scheduler::new(controller, repository, config.scheduler_config());

    println!("groupsync daemon started (ctrl-c to stop)");
    tokio::select! {
        _ = scheduler.run_loop() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("shutting down");
        }
    }
    Ok(())
}

pub async fn list(config: &GroupsyncConfig) -> Result<()> {
    let repository = open_repository(config)?;
    let jobs = repository.list().await.map_err(|e| anyhow!("{}", e))?;

    if jobs.is_empty() {
        println!("No jobs registered");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<24}  dest {}  parts {}  next {}",
            job.id,
            job.status.to_string(),
            job.destination,
            job.query.parts.len(),
            job.start_date.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

pub async fn status(config: &GroupsyncConfig, job: Uuid) -> Result<()> {
    let repository = open_repository(config)?;
    let existing = repository
        .get(JobId(job))
        .await
        .map_err(|e| anyhow!("{}", e))?
        .with_context(|| format!("Job {} not found", job))?;

    println!("Job {}", existing.id);
    println!("  status:       {}", existing.status);
    println!("  destination:  {}", existing.destination);
    println!("  parts:        {}", existing.query.parts.len());
    println!("  period:       {}h", existing.period_hours);
    println!("  next start:   {}", existing.start_date);
    match existing.last_run {
        Some(at) => println!("  last run:     {}", at),
        None => println!("  last run:     never"),
    }
    match existing.last_successful_run {
        Some(at) => println!("  last success: {}", at),
        None => println!("  last success: never"),
    }
    if existing.dry_run {
        match existing.last_dry_run {
            Some(at) => println!("  last dry run: {}", at),
            None => println!("  last dry run: never"),
        }
    }
    Ok(())
}
