//! Collaborator ports consumed by the sync engine.
//!
//! The engine is written against these traits; production wiring provides
//! HTTP and SQLite implementations, tests provide in-memory ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::model::{
    ContinuationToken, JobId, MembershipPage, SourceRef, SyncJob, SyncStatus,
};

/// Remote membership-listing API.
///
/// Pagination is driven one page at a time: `first_page` opens the listing,
/// `next_page` follows the continuation token from the previous response.
/// Token absence is the only termination signal.
#[async_trait]
pub trait SourceDirectory: Send + Sync {
    async fn exists(&self, source: &SourceRef) -> Result<bool, SyncError>;

    async fn first_page(&self, source: &SourceRef) -> Result<MembershipPage, SyncError>;

    async fn next_page(&self, token: &ContinuationToken) -> Result<MembershipPage, SyncError>;
}

/// Persistence of sync jobs: one relational row per job holding status and
/// schedule fields. Updates are last-writer-wins; there is no
/// optimistic-concurrency token at this layer.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get(&self, job_id: JobId) -> Result<Option<SyncJob>, SyncError>;

    /// Jobs whose start date has been reached, regardless of status.
    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<SyncJob>, SyncError>;

    async fn update_status(&self, job_ids: &[JobId], status: SyncStatus)
        -> Result<(), SyncError>;

    /// Push the start date forward so the whole run is retried later.
    async fn defer_start(&self, job_id: JobId, until: DateTime<Utc>) -> Result<(), SyncError>;

    /// Record that a run was started.
    async fn record_run(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), SyncError>;

    /// Record a successful run (or dry run) and schedule the next one.
    async fn record_successful_run(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<(), SyncError>;
}

/// Durable blob storage, caller-addressed. A write either lands completely
/// or not at all; partial output must never become visible.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), SyncError>;
}

/// Categories of stakeholder notifications the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// The job's query failed structural validation.
    InvalidQuery,
    /// A source named by the query does not exist upstream.
    SourceNotFound,
    /// The run ended in a terminal error.
    SyncFailed,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageKind::InvalidQuery => "invalid_query",
            MessageKind::SourceNotFound => "source_not_found",
            MessageKind::SyncFailed => "sync_failed",
        };
        write!(f, "{}", s)
    }
}

/// Fire-and-forget stakeholder notifications, at-least-once delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(
        &self,
        message: MessageKind,
        job_id: JobId,
        details: &str,
    ) -> Result<(), SyncError>;
}

/// Announcement that one run's membership artifact is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipReady {
    pub file_path: String,
    pub job_id: JobId,
    pub part_number: u32,
    pub parts_count: u32,
    pub is_destination_part: bool,
}

/// Downstream response to a membership-ready announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Consumer that applies the aggregated membership to the destination.
/// The orchestrator does not retry this call; a rejected announcement is
/// logged and resolved by the confirmation path.
#[async_trait]
pub trait DownstreamAggregator: Send + Sync {
    async fn membership_ready(
        &self,
        notice: MembershipReady,
    ) -> Result<DownstreamAck, SyncError>;
}
