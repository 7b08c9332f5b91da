//! Merges per-source read results into the run's single membership artifact.
//!
//! Inputs are keyed by source position, never completion order, so the output
//! is deterministic regardless of how the concurrent reads interleaved.
//! Dedup key is the member identity; the first occurrence in positional
//! order wins. Exclusionary sources are subtracted from the union of all
//! others as a final step, after dedup, so the result is stable under
//! reordering of equal-priority sources.

use std::collections::HashSet;

use tracing::info;
use uuid::Uuid;

use groupsync_common::{AggregatedMembership, GroupId, JobId, MemberId, QueryPart};

/// One source's contribution, in positional order.
#[derive(Debug, Clone)]
pub struct AggregationInput {
    pub part: QueryPart,
    pub members: Vec<MemberId>,
    pub non_members: u64,
}

/// Compute the run's aggregated membership from the ordered part results.
pub fn aggregate(
    job_id: JobId,
    run_id: Uuid,
    destination: GroupId,
    inputs: &[AggregationInput],
) -> AggregatedMembership {
    let mut inputs: Vec<&AggregationInput> = inputs.iter().collect();
    inputs.sort_by_key(|i| i.part.index);

    let mut seen: HashSet<MemberId> = HashSet::new();
    let mut members: Vec<MemberId> = Vec::new();
    let mut raw_total: u64 = 0;
    let mut non_member_count: u64 = 0;

    for input in inputs.iter().filter(|i| !i.part.exclusionary) {
        raw_total += input.members.len() as u64;
        non_member_count += input.non_members;
        for id in &input.members {
            if seen.insert(*id) {
                members.push(*id);
            }
        }
    }

    // Subtraction happens after the union is deduplicated, so exclusion is
    // insensitive to where the excluded identity first appeared.
    let excluded: HashSet<MemberId> = inputs
        .iter()
        .filter(|i| i.part.exclusionary)
        .flat_map(|i| i.members.iter().copied())
        .collect();
    if !excluded.is_empty() {
        members.retain(|id| !excluded.contains(id));
    }
    for input in inputs.iter().filter(|i| i.part.exclusionary) {
        non_member_count += input.non_members;
    }

    let result = AggregatedMembership {
        job_id,
        run_id,
        destination,
        members,
        non_member_count,
        raw_total,
    };
    info!(
        %job_id,
        %run_id,
        members = result.members.len(),
        duplicates_removed = result.duplicates_removed(),
        non_members = result.non_member_count,
        "aggregation complete"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupsync_common::SourceRef;

    fn part(index: u32, exclusionary: bool) -> QueryPart {
        QueryPart {
            index,
            source: SourceRef::Group {
                id: GroupId(Uuid::new_v4()),
            },
            exclusionary,
            is_destination_part: false,
        }
    }

    fn input(index: u32, exclusionary: bool, members: Vec<MemberId>, non_members: u64) -> AggregationInput {
        AggregationInput {
            part: part(index, exclusionary),
            members,
            non_members,
        }
    }

    fn ids(n: usize) -> Vec<MemberId> {
        (0..n).map(|_| MemberId(Uuid::new_v4())).collect()
    }

    fn run(inputs: &[AggregationInput]) -> AggregatedMembership {
        aggregate(
            JobId::new(),
            Uuid::new_v4(),
            GroupId(Uuid::new_v4()),
            inputs,
        )
    }

    #[test]
    fn test_disjoint_union_keeps_everything() {
        let a = ids(3);
        let b = ids(2);
        let agg = run(&[
            input(0, false, a.clone(), 1),
            input(1, false, b.clone(), 2),
        ]);
        let expected: Vec<MemberId> = a.into_iter().chain(b).collect();
        assert_eq!(agg.members, expected);
        assert_eq!(agg.raw_total, 5);
        assert_eq!(agg.duplicates_removed(), 0);
        assert_eq!(agg.non_member_count, 3);
    }

    #[test]
    fn test_first_occurrence_wins() {
        let shared = ids(2);
        let only_b = ids(1);
        let mut b_members = shared.clone();
        b_members.extend(only_b.iter().copied());

        let agg = run(&[
            input(0, false, shared.clone(), 0),
            input(1, false, b_members, 0),
        ]);
        let expected: Vec<MemberId> = shared.into_iter().chain(only_b).collect();
        assert_eq!(agg.members, expected);
        assert_eq!(agg.raw_total, 5);
        assert_eq!(agg.duplicates_removed(), 2);
    }

    #[test]
    fn test_positional_order_not_completion_order() {
        let a = ids(1);
        let b = ids(1);
        // Inputs arrive out of positional order.
        let agg = run(&[
            input(1, false, b.clone(), 0),
            input(0, false, a.clone(), 0),
        ]);
        assert_eq!(agg.members, vec![a[0], b[0]]);
    }

    #[test]
    fn test_exclusion_applied_after_dedup() {
        let keep = ids(2);
        let drop = ids(2);
        let mut union_side = keep.clone();
        union_side.extend(drop.iter().copied());

        let agg = run(&[
            input(0, false, union_side, 0),
            input(1, true, drop.clone(), 0),
        ]);
        assert_eq!(agg.members, keep);
        // Raw total counts only non-exclusionary sources.
        assert_eq!(agg.raw_total, 4);
    }

    #[test]
    fn test_exclusion_stable_under_reordering() {
        let keep = ids(2);
        let drop = ids(1);
        let mut first = keep.clone();
        first.push(drop[0]);

        let forward = run(&[
            input(0, false, first.clone(), 0),
            input(1, false, vec![drop[0]], 0),
            input(2, true, drop.clone(), 0),
        ]);
        let reversed = run(&[
            input(2, true, drop.clone(), 0),
            input(1, false, vec![drop[0]], 0),
            input(0, false, first, 0),
        ]);
        assert_eq!(forward.members, keep);
        assert_eq!(forward.members, reversed.members);
    }

    #[test]
    fn test_non_members_counted_across_all_sources() {
        let agg = run(&[
            input(0, false, ids(1), 4),
            input(1, true, ids(1), 6),
        ]);
        assert_eq!(agg.non_member_count, 10);
    }

    #[test]
    fn test_empty_inputs_produce_empty_aggregate() {
        let agg = run(&[]);
        assert!(agg.members.is_empty());
        assert_eq!(agg.raw_total, 0);
        assert_eq!(agg.duplicates_removed(), 0);
    }
}
