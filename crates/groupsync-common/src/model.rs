//! Domain types shared between the sync engine, the scheduler and the
//! administration surface.
//!
//! A [`SyncJob`] is one recurring membership-synchronization unit. Its
//! [`SyncQuery`] names the upstream sources; each run of the engine reads a
//! batch of those sources, aggregates the result into an
//! [`AggregatedMembership`] and hands it to the downstream consumer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a directory group (source or destination).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl GroupId {
    /// The all-zero identity. Never a valid source once reading begins.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of one member as reported by the upstream directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub Uuid);

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque cursor indicating more membership pages remain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(pub String);

impl ContinuationToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of a sync job.
///
/// This is a closed set: the relational row stores the string form, and every
/// transition site matches exhaustively so a new status cannot be added
/// without the compiler pointing at each of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Created through the administration API, awaiting review.
    PendingReview,
    /// Healthy and schedulable.
    Idle,
    /// A run is underway (or was interrupted and can be resumed).
    InProgress,
    /// Terminal failure; requires administrator attention.
    Error,
    /// The job's query is structurally invalid or names only empty sources.
    QueryNotValid,
    /// A source named by the query does not exist upstream.
    SecurityGroupNotFound,
    /// Soft-deleted; never physically removed.
    Removed,
}

impl SyncStatus {
    /// Whether the scheduler may dispatch a run for a job in this status.
    pub fn is_runnable(&self) -> bool {
        match self {
            SyncStatus::Idle | SyncStatus::InProgress => true,
            SyncStatus::PendingReview
            | SyncStatus::Error
            | SyncStatus::QueryNotValid
            | SyncStatus::SecurityGroupNotFound
            | SyncStatus::Removed => false,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::PendingReview => "pending_review",
            SyncStatus::Idle => "idle",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Error => "error",
            SyncStatus::QueryNotValid => "query_not_valid",
            SyncStatus::SecurityGroupNotFound => "security_group_not_found",
            SyncStatus::Removed => "removed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_review" => Ok(SyncStatus::PendingReview),
            "idle" => Ok(SyncStatus::Idle),
            "in_progress" => Ok(SyncStatus::InProgress),
            "error" => Ok(SyncStatus::Error),
            "query_not_valid" => Ok(SyncStatus::QueryNotValid),
            "security_group_not_found" => Ok(SyncStatus::SecurityGroupNotFound),
            "removed" => Ok(SyncStatus::Removed),
            _ => anyhow::bail!("Unknown sync status '{}'", s),
        }
    }
}

/// One addressable source inside a job's query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceRef {
    /// A directory group, expanded transitively.
    Group { id: GroupId },
    /// A SQL-backed org-hierarchy filter.
    SqlFilter { filter: String },
    /// A channel roster inside a team group.
    Channel { group: GroupId, channel: String },
}

impl SourceRef {
    /// True when the reference carries no usable identity.
    ///
    /// An empty reference must be rejected during validation; reading never
    /// begins against one.
    pub fn is_empty(&self) -> bool {
        match self {
            SourceRef::Group { id } => id.is_nil(),
            SourceRef::SqlFilter { filter } => filter.trim().is_empty(),
            SourceRef::Channel { group, channel } => group.is_nil() || channel.trim().is_empty(),
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceRef::Group { id } => write!(f, "group:{}", id),
            SourceRef::SqlFilter { filter } => write!(f, "sql:{}", filter),
            SourceRef::Channel { group, channel } => write!(f, "channel:{}/{}", group, channel),
        }
    }
}

/// One positional entry of a [`SyncQuery`]. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPart {
    /// Position inside the query. Aggregation order follows this index, not
    /// completion order.
    pub index: u32,
    pub source: SourceRef,
    /// Members of an exclusionary source are subtracted from the union of
    /// all others instead of joining it.
    #[serde(default)]
    pub exclusionary: bool,
    /// When set, the engine reads the destination's own current membership
    /// in place of the named source.
    #[serde(default)]
    pub is_destination_part: bool,
}

/// The structured multi-part source query of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncQuery {
    pub parts: Vec<QueryPart>,
}

impl SyncQuery {
    pub fn new(parts: Vec<QueryPart>) -> Self {
        Self { parts }
    }

    /// Structural validation: at least one part, and no part may name an
    /// empty source identity.
    pub fn is_valid(&self) -> bool {
        !self.parts.is_empty() && self.parts.iter().all(|p| !p.source.is_empty())
    }

    /// The parts a run with the given cursor is responsible for, in
    /// positional order.
    pub fn batch(&self, cursor: RunCursor) -> Vec<&QueryPart> {
        self.parts
            .iter()
            .filter(|p| p.index % cursor.total_parts == cursor.current_part - 1)
            .collect()
    }
}

/// (current, total) position of a run within a job's part batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCursor {
    pub current_part: u32,
    pub total_parts: u32,
}

impl RunCursor {
    pub fn new(current_part: u32, total_parts: u32) -> Self {
        Self {
            current_part,
            total_parts,
        }
    }

    /// A single batch covering the whole query.
    pub fn whole() -> Self {
        Self::new(1, 1)
    }

    pub fn is_valid(&self) -> bool {
        self.current_part >= 1 && self.current_part <= self.total_parts
    }
}

impl std::fmt::Display for RunCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.current_part, self.total_parts)
    }
}

/// One recurring membership-synchronization unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub destination: GroupId,
    pub query: SyncQuery,
    pub status: SyncStatus,
    /// Hours between scheduled runs.
    pub period_hours: u32,
    /// Next time the job becomes due. Pushed forward on deferral.
    pub start_date: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_successful_run: Option<DateTime<Utc>>,
    /// Percentage ceilings enforced by the downstream consumer.
    pub threshold_percentage_for_additions: u32,
    pub threshold_percentage_for_removals: u32,
    pub dry_run: bool,
    pub last_dry_run: Option<DateTime<Utc>>,
    /// Consecutive threshold violations observed downstream.
    pub threshold_violations: u32,
}

impl SyncJob {
    /// A new job as the administration API creates it: pending review, due
    /// immediately once approved.
    pub fn new(destination: GroupId, query: SyncQuery, period_hours: u32) -> Self {
        Self {
            id: JobId::new(),
            destination,
            query,
            status: SyncStatus::PendingReview,
            period_hours,
            start_date: Utc::now(),
            last_run: None,
            last_successful_run: None,
            threshold_percentage_for_additions: 100,
            threshold_percentage_for_removals: 20,
            dry_run: false,
            last_dry_run: None,
            threshold_violations: 0,
        }
    }
}

/// One page of membership as returned by the source directory.
///
/// `next_token` absence is the only termination signal; an empty `members`
/// list with a token present means the page happened to be empty, not that
/// pagination is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipPage {
    pub members: Vec<MemberId>,
    /// Objects returned by transitive expansion that are not users (nested
    /// groups, devices). Counted, never treated as members.
    pub non_members: u64,
    pub next_token: Option<ContinuationToken>,
}

impl MembershipPage {
    pub fn last(members: Vec<MemberId>, non_members: u64) -> Self {
        Self {
            members,
            non_members,
            next_token: None,
        }
    }

    pub fn with_token(members: Vec<MemberId>, non_members: u64, token: &str) -> Self {
        Self {
            members,
            non_members,
            next_token: Some(ContinuationToken(token.to_string())),
        }
    }
}

/// The deduplicated result of one run: the job's sole output artifact.
///
/// Always computed fresh per run, never merged incrementally across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedMembership {
    pub job_id: JobId,
    pub run_id: Uuid,
    pub destination: GroupId,
    /// Deduplicated members, first occurrence in positional source order.
    pub members: Vec<MemberId>,
    /// Non-member objects encountered across every source read.
    pub non_member_count: u64,
    /// Pre-dedup total across non-exclusionary sources.
    pub raw_total: u64,
}

impl AggregatedMembership {
    pub fn duplicates_removed(&self) -> u64 {
        self.raw_total.saturating_sub(self.members.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(index: u32, source: SourceRef) -> QueryPart {
        QueryPart {
            index,
            source,
            exclusionary: false,
            is_destination_part: false,
        }
    }

    #[test]
    fn test_status_display_from_str_round_trip() {
        let all = [
            SyncStatus::PendingReview,
            SyncStatus::Idle,
            SyncStatus::InProgress,
            SyncStatus::Error,
            SyncStatus::QueryNotValid,
            SyncStatus::SecurityGroupNotFound,
            SyncStatus::Removed,
        ];
        for status in all {
            let parsed: SyncStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_status_from_str_rejects_unknown() {
        assert!("paused".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_status_runnable() {
        assert!(SyncStatus::Idle.is_runnable());
        assert!(SyncStatus::InProgress.is_runnable());
        assert!(!SyncStatus::PendingReview.is_runnable());
        assert!(!SyncStatus::Removed.is_runnable());
    }

    #[test]
    fn test_source_ref_emptiness() {
        assert!(SourceRef::Group { id: GroupId::nil() }.is_empty());
        assert!(
            SourceRef::SqlFilter {
                filter: "  ".into()
            }
            .is_empty()
        );
        assert!(
            SourceRef::Channel {
                group: GroupId(Uuid::new_v4()),
                channel: "".into()
            }
            .is_empty()
        );
        assert!(
            !SourceRef::Group {
                id: GroupId(Uuid::new_v4())
            }
            .is_empty()
        );
    }

    #[test]
    fn test_query_validation() {
        let empty = SyncQuery::new(vec![]);
        assert!(!empty.is_valid());

        let all_nil = SyncQuery::new(vec![part(0, SourceRef::Group { id: GroupId::nil() })]);
        assert!(!all_nil.is_valid());

        let mixed = SyncQuery::new(vec![
            part(
                0,
                SourceRef::Group {
                    id: GroupId(Uuid::new_v4()),
                },
            ),
            part(1, SourceRef::Group { id: GroupId::nil() }),
        ]);
        assert!(!mixed.is_valid());

        let ok = SyncQuery::new(vec![part(
            0,
            SourceRef::Group {
                id: GroupId(Uuid::new_v4()),
            },
        )]);
        assert!(ok.is_valid());
    }

    #[test]
    fn test_cursor_bounds() {
        assert!(RunCursor::new(1, 1).is_valid());
        assert!(RunCursor::new(3, 3).is_valid());
        assert!(!RunCursor::new(0, 3).is_valid());
        assert!(!RunCursor::new(4, 3).is_valid());
    }

    #[test]
    fn test_batch_selection_round_robin() {
        let parts: Vec<QueryPart> = (0..4)
            .map(|i| {
                part(
                    i,
                    SourceRef::Group {
                        id: GroupId(Uuid::new_v4()),
                    },
                )
            })
            .collect();
        let query = SyncQuery::new(parts);

        // One batch per part.
        let batch = query.batch(RunCursor::new(2, 4));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].index, 1);

        // Single batch covers everything.
        let whole = query.batch(RunCursor::whole());
        assert_eq!(whole.len(), 4);

        // Two batches split even/odd.
        let evens = query.batch(RunCursor::new(1, 2));
        assert_eq!(
            evens.iter().map(|p| p.index).collect::<Vec<_>>(),
            vec![0, 2]
        );
    }

    #[test]
    fn test_page_termination_is_token_absence() {
        let done = MembershipPage::last(vec![], 0);
        assert!(done.next_token.is_none());

        // An empty page with a token is not terminal.
        let empty_mid = MembershipPage::with_token(vec![], 0, "t-2");
        assert!(empty_mid.next_token.is_some());
    }

    #[test]
    fn test_duplicates_removed() {
        let agg = AggregatedMembership {
            job_id: JobId::new(),
            run_id: Uuid::new_v4(),
            destination: GroupId(Uuid::new_v4()),
            members: vec![MemberId(Uuid::new_v4())],
            non_member_count: 0,
            raw_total: 3,
        };
        assert_eq!(agg.duplicates_removed(), 2);
    }

    #[test]
    fn test_new_job_pending_review() {
        let job = SyncJob::new(
            GroupId(Uuid::new_v4()),
            SyncQuery::new(vec![part(
                0,
                SourceRef::Group {
                    id: GroupId(Uuid::new_v4()),
                },
            )]),
            24,
        );
        assert_eq!(job.status, SyncStatus::PendingReview);
        assert!(job.last_run.is_none());
    }
}
