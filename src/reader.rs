//! Reads the full transitive membership of one query part.
//!
//! Pagination is strictly sequential (each page depends on the previous
//! response's continuation token) and every page fetch is one recorded step,
//! so an interrupted read resumes from its last completed page instead of
//! restarting at page one. Accumulated state is reconstructed from the step
//! log during replay; only unread pages hit the remote API, which bounds the
//! remote work per invocation for very large sources.

use tracing::{debug, info};

use groupsync_common::{MemberId, SourceRef, SyncError};

use crate::orchestrator::state::StepLog;
use crate::paginator::Paginator;

/// Accumulated result of reading one query part to the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartOutcome {
    pub part_index: u32,
    pub members: Vec<MemberId>,
    /// Non-user objects returned by transitive expansion, counted separately.
    pub non_members: u64,
    pub pages: u32,
}

pub struct PartReader<'a> {
    paginator: Paginator<'a>,
}

impl<'a> PartReader<'a> {
    pub fn new(paginator: Paginator<'a>) -> Self {
        Self { paginator }
    }

    /// Read `source` to the last page, accumulating members and the
    /// non-member count through the given step log.
    pub async fn read(
        &self,
        part_index: u32,
        source: &SourceRef,
        log: &mut StepLog,
    ) -> Result<PartOutcome, SyncError> {
        let exists = log
            .step("exists", || self.paginator.exists(source))
            .await?;
        if !exists {
            return Err(SyncError::SourceNotFound {
                source_name: source.to_string(),
            });
        }

        let mut members: Vec<MemberId> = Vec::new();
        let mut non_members: u64 = 0;
        let mut pages: u32 = 0;

        let mut page = log
            .step("page-1", || self.paginator.first_page(source))
            .await?;

        loop {
            pages += 1;
            members.extend(page.members.iter().copied());
            non_members += page.non_members;
            debug!(
                part = part_index,
                page = pages,
                members = members.len(),
                "accumulated page"
            );

            // Termination is signaled solely by token absence; an empty page
            // with a token present keeps the loop going.
            let Some(token) = page.next_token.take() else {
                break;
            };
            page = log
                .step(&format!("page-{}", pages + 1), || {
                    self.paginator.next_page(&token)
                })
                .await?;
        }

        info!(
            part = part_index,
            source = %source,
            members = members.len(),
            non_members,
            pages,
            "part read complete"
        );

        Ok(PartOutcome {
            part_index,
            members,
            non_members,
            pages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{Backoff, RetryPolicy};
    use async_trait::async_trait;
    use groupsync_common::{ContinuationToken, GroupId, MembershipPage, SourceDirectory};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use uuid::Uuid;

    /// Directory serving a fixed page table, with injected faults targeted
    /// at one fetch (the first page, or a specific token) and a fetch
    /// counter.
    struct FixedPages {
        first: MembershipPage,
        rest: HashMap<String, MembershipPage>,
        faults: Mutex<Vec<SyncError>>,
        /// Token whose fetch consumes injected faults; `None` targets the
        /// first page.
        fault_token: Option<String>,
        fetches: AtomicU32,
        exists: bool,
    }

    impl FixedPages {
        fn new(first: MembershipPage, rest: Vec<(&str, MembershipPage)>) -> Self {
            Self {
                first,
                rest: rest
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                faults: Mutex::new(Vec::new()),
                fault_token: None,
                fetches: AtomicU32::new(0),
                exists: true,
            }
        }

        fn inject(&self, err: SyncError) {
            self.faults.lock().unwrap().push(err);
        }

        fn take_fault(&self) -> Option<SyncError> {
            let mut faults = self.faults.lock().unwrap();
            if faults.is_empty() {
                None
            } else {
                Some(faults.remove(0))
            }
        }
    }

    #[async_trait]
    impl SourceDirectory for FixedPages {
        async fn exists(&self, _source: &SourceRef) -> Result<bool, SyncError> {
            Ok(self.exists)
        }

        async fn first_page(&self, _source: &SourceRef) -> Result<MembershipPage, SyncError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fault_token.is_none()
                && let Some(err) = self.take_fault()
            {
                return Err(err);
            }
            Ok(self.first.clone())
        }

        async fn next_page(&self, token: &ContinuationToken) -> Result<MembershipPage, SyncError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fault_token.as_deref() == Some(token.as_str())
                && let Some(err) = self.take_fault()
            {
                return Err(err);
            }
            self.rest
                .get(token.as_str())
                .cloned()
                .ok_or_else(|| SyncError::MalformedToken(token.as_str().to_string()))
        }
    }

    fn ids(n: usize) -> Vec<MemberId> {
        (0..n).map(|_| MemberId(Uuid::new_v4())).collect()
    }

    fn source() -> SourceRef {
        SourceRef::Group {
            id: GroupId(Uuid::new_v4()),
        }
    }

    fn reader(dir: &FixedPages) -> PartReader<'_> {
        PartReader::new(Paginator::new(
            dir,
            RetryPolicy::new(3, Duration::from_millis(1), Backoff::Fixed),
            Duration::from_secs(5),
        ))
    }

    fn three_pages() -> (FixedPages, Vec<MemberId>) {
        let p1 = ids(2);
        let p2 = ids(3);
        let p3 = ids(1);
        let all: Vec<MemberId> = p1.iter().chain(&p2).chain(&p3).copied().collect();
        let dir = FixedPages::new(
            MembershipPage::with_token(p1, 1, "t-2"),
            vec![
                ("t-2", MembershipPage::with_token(p2, 0, "t-3")),
                ("t-3", MembershipPage::last(p3, 2)),
            ],
        );
        (dir, all)
    }

    #[tokio::test]
    async fn test_accumulates_all_pages_in_order() {
        let (dir, all) = three_pages();
        let tmp = tempdir().unwrap();
        let mut log = StepLog::open(tmp.path(), "part-0").unwrap();

        let outcome = reader(&dir).read(0, &source(), &mut log).await.unwrap();
        assert_eq!(outcome.members, all);
        assert_eq!(outcome.non_members, 3);
        assert_eq!(outcome.pages, 3);
        assert_eq!(dir.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_source_is_not_found() {
        let mut dir = FixedPages::new(MembershipPage::last(vec![], 0), vec![]);
        dir.exists = false;
        let tmp = tempdir().unwrap();
        let mut log = StepLog::open(tmp.path(), "part-0").unwrap();

        let err = reader(&dir).read(0, &source(), &mut log).await.unwrap_err();
        assert!(matches!(err, SyncError::SourceNotFound { .. }));
        assert_eq!(dir.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_page_with_token_does_not_terminate() {
        let p3 = ids(2);
        let dir = FixedPages::new(
            MembershipPage::with_token(ids(1), 0, "t-2"),
            vec![
                // Legitimately empty middle page.
                ("t-2", MembershipPage::with_token(vec![], 0, "t-3")),
                ("t-3", MembershipPage::last(p3, 0)),
            ],
        );
        let tmp = tempdir().unwrap();
        let mut log = StepLog::open(tmp.path(), "part-0").unwrap();

        let outcome = reader(&dir).read(0, &source(), &mut log).await.unwrap();
        assert_eq!(outcome.pages, 3);
        assert_eq!(outcome.members.len(), 3);
    }

    #[tokio::test]
    async fn test_transient_fault_mid_pagination_recovers() {
        let (dir, all) = three_pages();
        dir.inject(SyncError::Timeout {
            what: "next_page".into(),
            millis: 1,
        });
        let tmp = tempdir().unwrap();
        let mut log = StepLog::open(tmp.path(), "part-0").unwrap();

        let outcome = reader(&dir).read(0, &source(), &mut log).await.unwrap();
        assert_eq!(outcome.members, all);
        // One extra fetch for the faulted attempt.
        assert_eq!(dir.fetches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_resume_replays_completed_pages() {
        let (mut dir, all) = three_pages();
        dir.fault_token = Some("t-3".into());
        let tmp = tempdir().unwrap();

        // First invocation dies on page 3: enough transient faults there to
        // exhaust the retry budget. Pages 1 and 2 are already recorded.
        {
            let mut log = StepLog::open(tmp.path(), "part-0").unwrap();
            for _ in 0..4 {
                dir.inject(SyncError::Connection("reset".into()));
            }
            let err = reader(&dir).read(0, &source(), &mut log).await.unwrap_err();
            assert!(matches!(err, SyncError::UpstreamUnavailable { .. }));
        }

        // Second invocation: pages 1 and 2 replay from the log; only page 3
        // hits the directory.
        let fetched_before = dir.fetches.load(Ordering::SeqCst);
        let mut log = StepLog::open(tmp.path(), "part-0").unwrap();
        let outcome = reader(&dir).read(0, &source(), &mut log).await.unwrap();
        assert_eq!(outcome.members, all);
        assert_eq!(outcome.pages, 3);
        let fetched_after = dir.fetches.load(Ordering::SeqCst);
        assert_eq!(fetched_after - fetched_before, 1);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let (dir, all) = three_pages();
        let tmp = tempdir().unwrap();

        {
            let mut log = StepLog::open(tmp.path(), "part-0").unwrap();
            reader(&dir).read(0, &source(), &mut log).await.unwrap();
        }

        // Replaying against identical history yields the identical member
        // set, however many times we do it, with zero fresh fetches.
        let fetched = dir.fetches.load(Ordering::SeqCst);
        for _ in 0..3 {
            let mut log = StepLog::open(tmp.path(), "part-0").unwrap();
            let outcome = reader(&dir).read(0, &source(), &mut log).await.unwrap();
            assert_eq!(outcome.members, all);
        }
        assert_eq!(dir.fetches.load(Ordering::SeqCst), fetched);
    }
}
