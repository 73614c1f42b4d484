use kyomei_common::types::{LIVE_WORKER_ID, SyncStatus, SyncWorker};

/// Chunks of at least this many blocks get their own worker when the count
/// is derived rather than configured.
const BLOCKS_PER_DERIVED_WORKER: u64 = 100_000;
const MAX_DERIVED_WORKERS: u64 = 8;

/// The start-up decision for one chain: which persisted leases resume and
/// which uncovered sub-ranges become new workers.
#[derive(Debug)]
pub struct RangePlan {
    /// Existing historical leases that stopped short of their range end.
    pub resumable: Vec<SyncWorker>,
    /// New `[start, end]` chunks to lease out, disjoint and ordered.
    pub new_ranges: Vec<(u64, u64)>,
    /// Where the live follower is upserted.
    pub live_start: u64,
}

/// Pure range planning over the persisted worker table.
///
/// Existing historical rows cover their full `[range_start, range_end]`
/// (resumed workers finish their own tail); the previous live row covers
/// what it actually committed. Whatever remains of `[start, finalized]` is
/// split into roughly equal chunks.
pub fn plan(
    existing: &[SyncWorker],
    start: u64,
    finalized: u64,
    configured_workers: Option<usize>,
) -> RangePlan {
    let resumable: Vec<SyncWorker> = existing
        .iter()
        .filter(|w| w.is_resumable())
        .cloned()
        .collect();

    let mut covered: Vec<(u64, u64)> = existing
        .iter()
        .filter_map(|w| match (w.status, w.range_end) {
            (SyncStatus::Historical | SyncStatus::Completed, Some(end)) => {
                Some((w.range_start, end))
            }
            (SyncStatus::Live, _) if w.worker_id == LIVE_WORKER_ID => {
                Some((w.range_start, w.current_block))
            }
            _ => None,
        })
        .collect();
    covered.sort_unstable();

    let uncovered = subtract(start, finalized, &covered);
    let total: u64 = uncovered.iter().map(|(s, e)| e - s + 1).sum();

    let workers = match configured_workers {
        Some(w) => (w as u64).max(1),
        None => total
            .div_ceil(BLOCKS_PER_DERIVED_WORKER)
            .clamp(1, MAX_DERIVED_WORKERS),
    };

    let new_ranges = if total == 0 {
        Vec::new()
    } else {
        chunk(&uncovered, total.div_ceil(workers))
    };

    RangePlan {
        resumable,
        new_ranges,
        live_start: finalized,
    }
}

/// `[start, end]` minus the (sorted) covered intervals.
fn subtract(start: u64, end: u64, covered: &[(u64, u64)]) -> Vec<(u64, u64)> {
    if start > end {
        return Vec::new();
    }

    let mut gaps = Vec::new();
    let mut cursor = start;
    for &(c_start, c_end) in covered {
        if c_end < cursor {
            continue;
        }
        if c_start > end {
            break;
        }
        if c_start > cursor {
            gaps.push((cursor, (c_start - 1).min(end)));
        }
        cursor = cursor.max(c_end + 1);
        if cursor > end {
            return gaps;
        }
    }
    if cursor <= end {
        gaps.push((cursor, end));
    }
    gaps
}

/// Cut the uncovered intervals into pieces of at most `chunk_size` blocks.
fn chunk(intervals: &[(u64, u64)], chunk_size: u64) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    for &(start, end) in intervals {
        let mut cursor = start;
        while cursor <= end {
            let chunk_end = (cursor + chunk_size - 1).min(end);
            chunks.push((cursor, chunk_end));
            cursor = chunk_end + 1;
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn worker(id: i32, start: u64, end: Option<u64>, current: u64, status: SyncStatus) -> SyncWorker {
        SyncWorker {
            chain_id: 1,
            worker_id: id,
            range_start: start,
            range_end: end,
            current_block: current,
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn assert_covers(ranges: &[(u64, u64)], start: u64, end: u64) {
        let mut cursor = start;
        for &(s, e) in ranges {
            assert_eq!(s, cursor, "gap or overlap before {s}");
            assert!(e >= s);
            cursor = e + 1;
        }
        assert_eq!(cursor, end + 1, "ranges stop short of {end}");
    }

    #[test]
    fn fresh_chain_is_fully_partitioned() {
        let plan = plan(&[], 100, 199, Some(4));
        assert!(plan.resumable.is_empty());
        assert_eq!(plan.new_ranges.len(), 4);
        assert_covers(&plan.new_ranges, 100, 199);
        assert_eq!(plan.live_start, 199);
    }

    #[test]
    fn derived_worker_count_scales_with_span() {
        // 50k blocks: one worker.
        let plan_small = plan(&[], 0, 49_999, None);
        assert_eq!(plan_small.new_ranges.len(), 1);

        // 300k blocks: three workers.
        let plan_medium = plan(&[], 0, 299_999, None);
        assert_eq!(plan_medium.new_ranges.len(), 3);
        assert_covers(&plan_medium.new_ranges, 0, 299_999);

        // 10M blocks: capped at eight.
        let plan_large = plan(&[], 0, 9_999_999, None);
        assert_eq!(plan_large.new_ranges.len(), 8);
        assert_covers(&plan_large.new_ranges, 0, 9_999_999);
    }

    #[test]
    fn existing_rows_are_not_recovered() {
        let existing = vec![
            worker(1, 100, Some(149), 120, SyncStatus::Historical),
            worker(2, 150, Some(199), 199, SyncStatus::Completed),
            worker(0, 200, None, 230, SyncStatus::Live),
        ];

        let plan = plan(&existing, 100, 300, Some(2));
        // Worker 1 resumes its own tail.
        assert_eq!(plan.resumable.len(), 1);
        assert_eq!(plan.resumable[0].worker_id, 1);
        // Only the live follower's gap [231, 300] needs new leases.
        assert_covers(&plan.new_ranges, 231, 300);
    }

    #[test]
    fn fully_covered_chain_plans_nothing() {
        let existing = vec![
            worker(1, 0, Some(499), 499, SyncStatus::Completed),
            worker(0, 500, None, 500, SyncStatus::Live),
        ];
        let plan = plan(&existing, 0, 500, None);
        assert!(plan.resumable.is_empty());
        assert!(plan.new_ranges.is_empty());
    }

    #[test]
    fn interval_subtraction() {
        assert_eq!(subtract(0, 100, &[]), vec![(0, 100)]);
        assert_eq!(subtract(0, 100, &[(20, 30)]), vec![(0, 19), (31, 100)]);
        assert_eq!(subtract(0, 100, &[(0, 100)]), vec![]);
        assert_eq!(
            subtract(10, 90, &[(0, 19), (40, 49), (85, 200)]),
            vec![(20, 39), (50, 84)]
        );
        assert_eq!(subtract(50, 40, &[]), vec![]);
    }

    #[test]
    fn chunks_never_exceed_size() {
        let chunks = chunk(&[(0, 99), (200, 204)], 30);
        assert_eq!(chunks, vec![(0, 29), (30, 59), (60, 89), (90, 99), (200, 204)]);
    }
}
