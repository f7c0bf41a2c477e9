//! Counters and observables.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Hit/miss/bypass accounting, kept as running totals.
#[derive(Default)]
pub struct CacheStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_bypass_hits: AtomicU64,
    pub cache_bypass_misses: AtomicU64,
    pub cache_readaheads: AtomicU64,
    pub cache_read_races: AtomicU64,
    pub bypass_sequential: AtomicU64,
    pub bypass_congested: AtomicU64,
    pub sectors_bypassed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_bypass_hits: u64,
    pub cache_bypass_misses: u64,
    pub cache_readaheads: u64,
    pub cache_read_races: u64,
    pub bypass_sequential: u64,
    pub bypass_congested: u64,
    pub sectors_bypassed: u64,
    pub cache_hit_ratio: u64,
}

impl CacheStats {
    pub fn new() -> CacheStats {
        CacheStats::default()
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn mark_cache_accounting(&self, hit: bool, bypass: bool) {
        let counter = match (hit, bypass) {
            (true, false) => &self.cache_hits,
            (false, false) => &self.cache_misses,
            (true, true) => &self.cache_bypass_hits,
            (false, true) => &self.cache_bypass_misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        StatsSnapshot {
            cache_hits: hits,
            cache_misses: misses,
            cache_bypass_hits: self.cache_bypass_hits.load(Ordering::Relaxed),
            cache_bypass_misses: self.cache_bypass_misses.load(Ordering::Relaxed),
            cache_readaheads: self.cache_readaheads.load(Ordering::Relaxed),
            cache_read_races: self.cache_read_races.load(Ordering::Relaxed),
            bypass_sequential: self.bypass_sequential.load(Ordering::Relaxed),
            bypass_congested: self.bypass_congested.load(Ordering::Relaxed),
            sectors_bypassed: self.sectors_bypassed.load(Ordering::Relaxed),
            cache_hit_ratio: if total > 0 { hits * 100 / total } else { 0 },
        }
    }
}

/// Tree-shape observables. The incrementally-maintained versions of these
/// went stale in the old implementation; they are re-derived by walking the
/// tree on demand instead.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TreeStats {
    pub nodes: u64,
    pub live_keys: u64,
    /// Average data-key size in sectors.
    pub average_key_size: u64,
    /// Live keys as a percentage of total node key capacity.
    pub btree_used_percent: u64,
}

pub fn tree_stats(cs: &crate::super_block::CacheSet) -> TreeStats {
    use crate::bkey::{pos, BtreeId, BTREE_ID_NR};
    use crate::btree::iter::BtreeTrans;
    use crate::btree::BTREE_NODE_MAX_KEYS;

    let mut s = TreeStats::default();
    let mut total_sectors = 0u64;
    let mut sized_keys = 0u64;

    for i in 0..BTREE_ID_NR {
        let trans = BtreeTrans::new(cs);
        let mut iter = trans.iter(BtreeId::from_index(i), pos(0, 0), 0);
        loop {
            match iter.peek() {
                Ok(Some(k)) => {
                    s.live_keys += 1;
                    if k.size > 0 {
                        sized_keys += 1;
                        total_sectors += k.size as u64;
                    }
                    iter.advance(&k);
                }
                Ok(None) => break,
                Err(crate::errcode::ErrCode::Retry) => continue,
                Err(_) => break,
            }
        }
    }

    s.nodes = cs.node_cache.used() as u64;
    if sized_keys > 0 {
        s.average_key_size = total_sectors / sized_keys;
    }
    let capacity = s.nodes * BTREE_NODE_MAX_KEYS as u64;
    if capacity > 0 {
        s.btree_used_percent = (s.live_keys * 100 / capacity).min(100);
    }
    s
}

pub const NR_QUANTILES: usize = 31;

/// 31 evenly spaced quantiles, largest first. Used for the bucket
/// priority and fragmentation summaries.
pub fn quantiles(mut values: Vec<u64>) -> [u64; NR_QUANTILES] {
    let mut q = [0u64; NR_QUANTILES];
    if values.is_empty() {
        return q;
    }
    values.sort_unstable_by(|a, b| b.cmp(a));
    for (i, slot) in q.iter_mut().enumerate() {
        let idx = (i + 1) * values.len() / (NR_QUANTILES + 1);
        *slot = values[idx.min(values.len() - 1)];
    }
    q
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio() {
        let s = CacheStats::new();
        for _ in 0..3 {
            s.mark_cache_accounting(true, false);
        }
        s.mark_cache_accounting(false, false);
        let snap = s.snapshot();
        assert_eq!(snap.cache_hits, 3);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.cache_hit_ratio, 75);
    }

    #[test]
    fn quantiles_sorted_descending() {
        let q = quantiles((0..1000).collect());
        assert!(q.windows(2).all(|w| w[0] >= w[1]));
        assert!(q[0] > q[NR_QUANTILES - 1]);
    }

    #[test]
    fn quantiles_empty_and_single() {
        assert_eq!(quantiles(vec![]), [0; NR_QUANTILES]);
        assert_eq!(quantiles(vec![7]), [7; NR_QUANTILES]);
    }

    #[test]
    fn snapshot_serializes() {
        let s = CacheStats::new();
        s.mark_cache_accounting(true, true);
        let js = serde_json::to_string(&s.snapshot()).unwrap();
        assert!(js.contains("cache_bypass_hits"));
    }
}
