//! SQLite-backed job repository: one row per sync job holding status and
//! schedule fields.
//!
//! All access runs on tokio's blocking thread pool behind [`DbHandle`], so
//! synchronous SQLite I/O never ties up async worker threads. Updates are
//! last-writer-wins; there is no optimistic-concurrency token at this layer.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use groupsync_common::{
    GroupId, JobId, JobRepository, SyncError, SyncJob, SyncQuery, SyncStatus,
};

/// Async-safe handle to the job database.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobDb>>,
}

impl DbHandle {
    pub fn new(db: JobDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, SyncError>
    where
        F: FnOnce(&JobDb) -> Result<R, SyncError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| SyncError::Repository(format!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| SyncError::Repository(format!("DB task panicked: {}", e)))?
    }
}

pub struct JobDb {
    conn: Connection,
}

impl JobDb {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let conn = Connection::open(path).map_err(db_err)?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<(), SyncError> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS sync_jobs (
                    id TEXT PRIMARY KEY,
                    destination TEXT NOT NULL,
                    query TEXT NOT NULL,
                    status TEXT NOT NULL,
                    period_hours INTEGER NOT NULL,
                    start_date TEXT NOT NULL,
                    last_run TEXT,
                    last_successful_run TEXT,
                    threshold_additions INTEGER NOT NULL DEFAULT 100,
                    threshold_removals INTEGER NOT NULL DEFAULT 20,
                    dry_run INTEGER NOT NULL DEFAULT 0,
                    last_dry_run TEXT,
                    threshold_violations INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_sync_jobs_due
                    ON sync_jobs (status, start_date);
                "#,
            )
            .map_err(db_err)
    }

    pub fn insert(&self, job: &SyncJob) -> Result<(), SyncError> {
        self.conn
            .execute(
                r#"
                INSERT INTO sync_jobs (
                    id, destination, query, status, period_hours, start_date,
                    last_run, last_successful_run, threshold_additions,
                    threshold_removals, dry_run, last_dry_run, threshold_violations
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    job.id.to_string(),
                    job.destination.to_string(),
                    serde_json::to_string(&job.query)
                        .map_err(|e| SyncError::Repository(e.to_string()))?,
                    job.status.to_string(),
                    job.period_hours,
                    job.start_date.to_rfc3339(),
                    job.last_run.map(|t| t.to_rfc3339()),
                    job.last_successful_run.map(|t| t.to_rfc3339()),
                    job.threshold_percentage_for_additions,
                    job.threshold_percentage_for_removals,
                    job.dry_run as i64,
                    job.last_dry_run.map(|t| t.to_rfc3339()),
                    job.threshold_violations,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get(&self, job_id: JobId) -> Result<Option<SyncJob>, SyncError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM sync_jobs WHERE id = ?1")
            .map_err(db_err)?;
        let mut rows = stmt
            .query_map(params![job_id.to_string()], row_to_job)
            .map_err(db_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(db_err)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<SyncJob>, SyncError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM sync_jobs ORDER BY start_date")
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_job).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<SyncJob>, SyncError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM sync_jobs WHERE start_date <= ?1 ORDER BY start_date")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![now.to_rfc3339()], row_to_job)
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn update_status(&self, job_ids: &[JobId], status: SyncStatus) -> Result<(), SyncError> {
        for job_id in job_ids {
            self.conn
                .execute(
                    "UPDATE sync_jobs SET status = ?1 WHERE id = ?2",
                    params![status.to_string(), job_id.to_string()],
                )
                .map_err(db_err)?;
        }
        Ok(())
    }

    pub fn defer_start(&self, job_id: JobId, until: DateTime<Utc>) -> Result<(), SyncError> {
        self.conn
            .execute(
                "UPDATE sync_jobs SET start_date = ?1 WHERE id = ?2",
                params![until.to_rfc3339(), job_id.to_string()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn record_run(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), SyncError> {
        self.conn
            .execute(
                "UPDATE sync_jobs SET last_run = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), job_id.to_string()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Record a successful run (or dry run) and schedule the next one a
    /// period later.
    pub fn record_successful_run(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<(), SyncError> {
        let period_hours: i64 = self
            .conn
            .query_row(
                "SELECT period_hours FROM sync_jobs WHERE id = ?1",
                params![job_id.to_string()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let next_start = at + chrono::Duration::hours(period_hours);

        let column = if dry_run {
            "last_dry_run"
        } else {
            "last_successful_run"
        };
        self.conn
            .execute(
                &format!(
                    "UPDATE sync_jobs SET {} = ?1, start_date = ?2 WHERE id = ?3",
                    column
                ),
                params![at.to_rfc3339(), next_start.to_rfc3339(), job_id.to_string()],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: rusqlite::Error) -> SyncError {
    SyncError::Repository(e.to_string())
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncJob> {
    let parse_dt = |value: Option<String>| {
        value.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
    };
    let text_err =
        |e: Box<dyn std::error::Error + Send + Sync>| rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e,
        );

    let id: String = row.get("id")?;
    let destination: String = row.get("destination")?;
    let query: String = row.get("query")?;
    let status: String = row.get("status")?;
    let start_date: String = row.get("start_date")?;

    Ok(SyncJob {
        id: JobId(uuid::Uuid::from_str(&id).map_err(|e| text_err(Box::new(e)))?),
        destination: GroupId(
            uuid::Uuid::from_str(&destination).map_err(|e| text_err(Box::new(e)))?,
        ),
        query: serde_json::from_str::<SyncQuery>(&query).map_err(|e| text_err(Box::new(e)))?,
        status: SyncStatus::from_str(&status)
            .map_err(|e| text_err(format!("{}", e).into()))?,
        period_hours: row.get("period_hours")?,
        start_date: DateTime::parse_from_rfc3339(&start_date)
            .map_err(|e| text_err(Box::new(e)))?
            .with_timezone(&Utc),
        last_run: parse_dt(row.get("last_run")?),
        last_successful_run: parse_dt(row.get("last_successful_run")?),
        threshold_percentage_for_additions: row.get("threshold_additions")?,
        threshold_percentage_for_removals: row.get("threshold_removals")?,
        dry_run: row.get::<_, i64>("dry_run")? != 0,
        last_dry_run: parse_dt(row.get("last_dry_run")?),
        threshold_violations: row.get("threshold_violations")?,
    })
}

/// [`JobRepository`] port over the SQLite store.
#[derive(Clone)]
pub struct SqliteJobRepository {
    handle: DbHandle,
}

impl SqliteJobRepository {
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        Ok(Self {
            handle: DbHandle::new(JobDb::open(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self, SyncError> {
        Ok(Self {
            handle: DbHandle::new(JobDb::open_in_memory()?),
        })
    }

    pub async fn insert(&self, job: SyncJob) -> Result<(), SyncError> {
        self.handle.call(move |db| db.insert(&job)).await
    }

    pub async fn list(&self) -> Result<Vec<SyncJob>, SyncError> {
        self.handle.call(|db| db.list()).await
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn get(&self, job_id: JobId) -> Result<Option<SyncJob>, SyncError> {
        self.handle.call(move |db| db.get(job_id)).await
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<SyncJob>, SyncError> {
        self.handle.call(move |db| db.due(now)).await
    }

    async fn update_status(
        &self,
        job_ids: &[JobId],
        status: SyncStatus,
    ) -> Result<(), SyncError> {
        let job_ids = job_ids.to_vec();
        self.handle
            .call(move |db| db.update_status(&job_ids, status))
            .await
    }

    async fn defer_start(&self, job_id: JobId, until: DateTime<Utc>) -> Result<(), SyncError> {
        self.handle
            .call(move |db| db.defer_start(job_id, until))
            .await
    }

    async fn record_run(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), SyncError> {
        self.handle.call(move |db| db.record_run(job_id, at)).await
    }

    async fn record_successful_run(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<(), SyncError> {
        self.handle
            .call(move |db| db.record_successful_run(job_id, at, dry_run))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use groupsync_common::{QueryPart, SourceRef};
    use uuid::Uuid;

    fn job() -> SyncJob {
        SyncJob::new(
            GroupId(Uuid::new_v4()),
            SyncQuery::new(vec![QueryPart {
                index: 0,
                source: SourceRef::Group {
                    id: GroupId(Uuid::new_v4()),
                },
                exclusionary: false,
                is_destination_part: false,
            }]),
            24,
        )
    }

    #[tokio::test]
    async fn test_insert_get_round_trip() {
        let repo = SqliteJobRepository::open_in_memory().unwrap();
        let mut original = job();
        original.dry_run = true;
        repo.insert(original.clone()).await.unwrap();

        let loaded = repo.get(original.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.destination, original.destination);
        assert_eq!(loaded.query, original.query);
        assert_eq!(loaded.status, SyncStatus::PendingReview);
        assert!(loaded.dry_run);
        // RFC3339 round trip loses nothing observable.
        assert_eq!(loaded.start_date.timestamp(), original.start_date.timestamp());
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let repo = SqliteJobRepository::open_in_memory().unwrap();
        assert!(repo.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_multiple_jobs() {
        let repo = SqliteJobRepository::open_in_memory().unwrap();
        let a = job();
        let b = job();
        repo.insert(a.clone()).await.unwrap();
        repo.insert(b.clone()).await.unwrap();

        repo.update_status(&[a.id, b.id], SyncStatus::Idle)
            .await
            .unwrap();
        assert_eq!(
            repo.get(a.id).await.unwrap().unwrap().status,
            SyncStatus::Idle
        );
        assert_eq!(
            repo.get(b.id).await.unwrap().unwrap().status,
            SyncStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_due_jobs_respects_start_date() {
        let repo = SqliteJobRepository::open_in_memory().unwrap();
        let now = Utc::now();

        let mut due = job();
        due.start_date = now - Duration::hours(1);
        let mut later = job();
        later.start_date = now + Duration::hours(1);
        repo.insert(due.clone()).await.unwrap();
        repo.insert(later.clone()).await.unwrap();

        let found = repo.due_jobs(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn test_defer_start_pushes_job_out_of_due_set() {
        let repo = SqliteJobRepository::open_in_memory().unwrap();
        let now = Utc::now();
        let mut j = job();
        j.start_date = now - Duration::hours(1);
        repo.insert(j.clone()).await.unwrap();
        assert_eq!(repo.due_jobs(now).await.unwrap().len(), 1);

        repo.defer_start(j.id, now + Duration::minutes(30))
            .await
            .unwrap();
        assert!(repo.due_jobs(now).await.unwrap().is_empty());
        let loaded = repo.get(j.id).await.unwrap().unwrap();
        assert!(loaded.start_date > now);
    }

    #[tokio::test]
    async fn test_record_successful_run_schedules_next() {
        let repo = SqliteJobRepository::open_in_memory().unwrap();
        let j = job();
        repo.insert(j.clone()).await.unwrap();

        let at = Utc::now();
        repo.record_successful_run(j.id, at, false).await.unwrap();
        let loaded = repo.get(j.id).await.unwrap().unwrap();
        assert!(loaded.last_successful_run.is_some());
        assert!(loaded.last_dry_run.is_none());
        // Next start is one period out.
        let gap = loaded.start_date - at;
        assert!(gap >= Duration::hours(23) && gap <= Duration::hours(25));
    }

    #[tokio::test]
    async fn test_record_dry_run_touches_dry_run_column() {
        let repo = SqliteJobRepository::open_in_memory().unwrap();
        let j = job();
        repo.insert(j.clone()).await.unwrap();

        repo.record_successful_run(j.id, Utc::now(), true)
            .await
            .unwrap();
        let loaded = repo.get(j.id).await.unwrap().unwrap();
        assert!(loaded.last_dry_run.is_some());
        assert!(loaded.last_successful_run.is_none());
    }

    #[tokio::test]
    async fn test_removed_jobs_stay_in_table() {
        let repo = SqliteJobRepository::open_in_memory().unwrap();
        let j = job();
        repo.insert(j.clone()).await.unwrap();
        repo.update_status(&[j.id], SyncStatus::Removed)
            .await
            .unwrap();

        // Soft delete: the row is still there.
        let loaded = repo.get(j.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SyncStatus::Removed);
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }
}
