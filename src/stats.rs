//! Instance-scoped allocator counters.
//!
//! The original Ceph implementation keeps these as process-wide globals;
//! here they are plain fields updated under the allocator's own lock and
//! returned by value, never shared mutable state.

use std::collections::BTreeMap;

use crate::l0::Leaf;

/// Counters describing allocator activity since construction.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub l0_dives: u64,
    pub l0_iterations: u64,
    pub l0_inner_iterations: u64,
    pub alloc_fragments: u64,
    pub alloc_fragments_fast: u64,
    pub l2_allocs: u64,
}

/// A histogram of free-run lengths, keyed by `floor(log2(run_length))` —
/// bin `k` counts runs of length in `[2^k, 2^(k+1))`, matching the
/// original's `cbits(len) - 1` bucketing.
pub fn collect_free_run_histogram(leaf: &Leaf) -> BTreeMap<u32, u64> {
    let mut bins = BTreeMap::new();
    let mut run = 0u64;
    let granules = leaf.granules();

    let mut flush = |bins: &mut BTreeMap<u32, u64>, run: u64| {
        if run > 0 {
            let bucket = 63 - run.leading_zeros();
            *bins.entry(bucket).or_insert(0) += 1;
        }
    };

    for idx in 0..granules {
        if leaf.get(idx).is_free() {
            run += 1;
        } else if run > 0 {
            flush(&mut bins, run);
            run = 0;
        }
    }
    flush(&mut bins, run);
    bins
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn histogram_buckets_free_runs_by_log2_length() {
        let mut leaf = Leaf::new(256, false);
        leaf.mark_free(0, 1);
        leaf.mark_free(4, 8);
        let hist = collect_free_run_histogram(&leaf);
        assert_eq!(hist.get(&0), Some(&1));
        assert_eq!(hist.get(&2), Some(&1));
    }

    #[test]
    fn histogram_buckets_non_power_of_two_run_by_floor_log2() {
        let mut leaf = Leaf::new(256, false);
        leaf.mark_free(10, 13);
        let hist = collect_free_run_histogram(&leaf);
        assert_eq!(hist.get(&1), Some(&1));
        assert_eq!(hist.get(&2), None);
    }

    #[test]
    fn histogram_empty_when_all_allocated() {
        let leaf = Leaf::new(256, false);
        assert!(collect_free_run_histogram(&leaf).is_empty());
    }
}
