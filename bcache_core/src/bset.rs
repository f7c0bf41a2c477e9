//! Sorted key sets within a btree node.
//!
//! A node holds up to [`MAX_BSETS`] sets: the older ones correspond to runs
//! already written to disk, the last one takes new inserts. Iteration merges
//! all sets with a small cursor heap. Compaction sorts everything into a
//! single set and drops whiteouts.

use crate::bkey::{bpos_lt, Bkey, Bpos};

pub const MAX_BSETS: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct Bset {
    pub keys: Vec<Bkey>,
}

impl Bset {
    /// Index of the first key that a search from `pos` should yield:
    /// first key with `p > pos` for extents, `p >= pos` otherwise.
    fn search(&self, pos: Bpos, is_extents: bool) -> usize {
        self.keys.partition_point(|k| {
            if is_extents {
                !bpos_lt(pos, k.p)
            } else {
                bpos_lt(k.p, pos)
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct NodeKeys {
    pub sets: Vec<Bset>,
    /// Sets below this index are on disk; they may still be trimmed in
    /// memory by overlap fixups, which dirties the node.
    pub written_sets: usize,
}

impl NodeKeys {
    pub fn new() -> NodeKeys {
        NodeKeys {
            sets: vec![Bset::default()],
            written_sets: 0,
        }
    }

    pub fn nr_keys(&self) -> usize {
        self.sets.iter().map(|s| s.keys.len()).sum()
    }

    pub fn nr_live_keys(&self) -> usize {
        self.sets
            .iter()
            .flat_map(|s| s.keys.iter())
            .filter(|k| !k.is_deleted())
            .count()
    }

    pub fn nsets(&self) -> usize {
        self.sets.len()
    }

    /// Largest live key position, if any.
    pub fn max_key(&self) -> Option<Bpos> {
        self.sets
            .iter()
            .flat_map(|s| s.keys.iter())
            .filter(|k| !k.is_deleted())
            .map(|k| k.p)
            .max_by(|a, b| {
                if bpos_lt(*a, *b) {
                    std::cmp::Ordering::Less
                } else if a == b {
                    std::cmp::Ordering::Equal
                } else {
                    std::cmp::Ordering::Greater
                }
            })
    }

    fn unwritten(&mut self) -> &mut Bset {
        debug_assert!(self.written_sets < self.sets.len());
        self.sets.last_mut().unwrap()
    }

    /// Insert into the unwritten set at its sorted position.
    pub fn insert(&mut self, k: Bkey) {
        let set = self.unwritten();
        let at = set.keys.partition_point(|e| bpos_lt(e.p, k.p));
        set.keys.insert(at, k);
    }

    /// Freeze the current unwritten set (it just went to disk) and open a
    /// fresh one for appends.
    pub fn start_new_set(&mut self) {
        self.written_sets = self.sets.len();
        self.sets.push(Bset::default());
    }

    /// Freeze without opening a new set; `ensure_writable` reopens lazily.
    pub fn freeze_written(&mut self) {
        self.written_sets = self.sets.len();
    }

    /// Make sure there is an unwritten set to insert into.
    pub fn ensure_writable(&mut self) {
        if self.written_sets == self.sets.len() {
            self.sets.push(Bset::default());
        }
    }

    pub fn needs_sort(&self) -> bool {
        self.sets.len() > MAX_BSETS
    }

    /// Merge every set into one, dropping whiteouts. Invalidates node
    /// iterators; callers re-init them afterwards.
    pub fn sort_all(&mut self) {
        let mut all: Vec<Bkey> = self
            .sets
            .drain(..)
            .flat_map(|s| s.keys)
            .filter(|k| !k.is_deleted())
            .collect();
        all.sort_by(|a, b| {
            if bpos_lt(a.p, b.p) {
                std::cmp::Ordering::Less
            } else if a.p == b.p {
                std::cmp::Ordering::Equal
            } else {
                std::cmp::Ordering::Greater
            }
        });
        self.sets = vec![Bset { keys: all }];
        self.written_sets = 0;
    }

    /// Apply `f` to every live key overlapping `(start, end]`; used by the
    /// extent insert path to trim existing keys. `f` may shrink or delete
    /// the key it is given.
    pub fn for_each_overlapping_mut<F>(&mut self, start: Bpos, end: Bpos, mut f: F)
    where
        F: FnMut(&mut Bkey),
    {
        for set in &mut self.sets {
            for k in &mut set.keys {
                if !k.is_deleted() && k.overlaps(start, end) {
                    f(k);
                }
            }
        }
    }

    /// Resolve overlaps between sets after a node is read from disk:
    /// newer sets win. In memory the insert path keeps keys disjoint by
    /// trimming in place, but those trims never reach the already-written
    /// runs on disk, so a freshly read node replays them here instead.
    /// Whiteouts in newer sets suppress older keys, then drop out.
    pub fn sort_fix_overlapping(&mut self, is_extents: bool) {
        let mut merged: Vec<Bkey> = Vec::new();

        for set in self.sets.iter().rev() {
            for k in &set.keys {
                if !is_extents {
                    if !merged.iter().any(|m| m.p == k.p) {
                        merged.push(k.clone());
                    }
                    continue;
                }

                // Trim this (older) key against everything already kept.
                let mut parts = vec![k.clone()];
                for cov in &merged {
                    if cov.size == 0 {
                        continue;
                    }
                    let mut next = Vec::new();
                    for p in parts {
                        if p.size == 0 || !p.overlaps(cov.start(), cov.p) {
                            next.push(p);
                            continue;
                        }
                        if bpos_lt(p.start(), cov.start()) {
                            let mut front = p.clone();
                            crate::extents::cut_back(cov.start(), &mut front);
                            next.push(front);
                        }
                        if bpos_lt(cov.p, p.p) {
                            let mut back = p.clone();
                            crate::extents::cut_front(cov.p, &mut back);
                            next.push(back);
                        }
                    }
                    parts = next;
                }
                merged.extend(parts.into_iter().filter(|p| p.size > 0));
            }
        }

        merged.retain(|k| !k.is_deleted());
        merged.sort_by(|a, b| {
            if bpos_lt(a.p, b.p) {
                std::cmp::Ordering::Less
            } else if a.p == b.p {
                std::cmp::Ordering::Equal
            } else {
                std::cmp::Ordering::Greater
            }
        });
        self.sets = vec![Bset { keys: merged }];
        self.written_sets = 1;
    }

    /// All live keys in order, materialized. Used by node write and split.
    pub fn keys_sorted(&self) -> Vec<Bkey> {
        let mut all: Vec<Bkey> = self
            .sets
            .iter()
            .flat_map(|s| s.keys.iter())
            .filter(|k| !k.is_deleted())
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            if bpos_lt(a.p, b.p) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        all
    }
}

impl Default for NodeKeys {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge cursor over a node's sets: `peek` yields the smallest live key at
/// or after the position it was initialized at.
#[derive(Debug, Clone, Default)]
pub struct NodeIter {
    cursors: Vec<usize>,
}

impl NodeIter {
    pub fn init(&mut self, keys: &NodeKeys, pos: Bpos, is_extents: bool) {
        self.cursors.clear();
        self.cursors
            .extend(keys.sets.iter().map(|s| s.search(pos, is_extents)));
    }

    fn best_set(&self, keys: &NodeKeys) -> Option<usize> {
        let mut best: Option<(usize, Bpos)> = None;
        for (si, set) in keys.sets.iter().enumerate() {
            let mut i = self.cursors.get(si).copied().unwrap_or(0);
            // Skip whiteouts in place; cursor advance happens in advance().
            while let Some(k) = set.keys.get(i) {
                if !k.is_deleted() {
                    break;
                }
                i += 1;
            }
            if let Some(k) = set.keys.get(i) {
                match best {
                    Some((_, p)) if !bpos_lt(k.p, p) => {}
                    _ => best = Some((si, k.p)),
                }
            }
        }
        best.map(|(si, _)| si)
    }

    /// Smallest live key at/after the iterator position, without advancing.
    pub fn peek(&mut self, keys: &NodeKeys) -> Option<Bkey> {
        let si = self.best_set(keys)?;
        let set = &keys.sets[si];
        let mut i = self.cursors[si];
        while set.keys[i].is_deleted() {
            i += 1;
        }
        self.cursors[si] = i;
        Some(set.keys[i].clone())
    }

    /// Step past the key `peek` would return.
    pub fn advance(&mut self, keys: &NodeKeys) {
        if let Some(si) = self.best_set(keys) {
            let set = &keys.sets[si];
            let mut i = self.cursors[si];
            while set.keys[i].is_deleted() {
                i += 1;
            }
            self.cursors[si] = i + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::{pos, Bval};

    fn k(inode: u64, end: u64, size: u32) -> Bkey {
        Bkey::new(pos(inode, end), size, Bval::Check)
    }

    fn keys_of(iter: &mut NodeIter, keys: &NodeKeys) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(key) = iter.peek(keys) {
            out.push(key.p.offset);
            iter.advance(keys);
        }
        out
    }

    #[test]
    fn insert_keeps_sorted() {
        let mut nk = NodeKeys::new();
        for end in [64u64, 16, 48, 32] {
            nk.insert(k(1, end, 16));
        }
        let sorted = nk.keys_sorted();
        let ends: Vec<u64> = sorted.iter().map(|k| k.p.offset).collect();
        assert_eq!(ends, vec![16, 32, 48, 64]);
    }

    #[test]
    fn iter_merges_across_sets() {
        let mut nk = NodeKeys::new();
        nk.insert(k(1, 16, 16));
        nk.insert(k(1, 48, 16));
        nk.start_new_set();
        nk.insert(k(1, 32, 16));
        nk.insert(k(1, 64, 16));

        let mut it = NodeIter::default();
        it.init(&nk, pos(1, 0), true);
        assert_eq!(keys_of(&mut it, &nk), vec![16, 32, 48, 64]);
    }

    #[test]
    fn extents_search_is_strictly_greater() {
        let mut nk = NodeKeys::new();
        nk.insert(k(1, 16, 16));
        nk.insert(k(1, 32, 16));

        let mut it = NodeIter::default();
        // A key ending exactly at pos does not cover pos.
        it.init(&nk, pos(1, 16), true);
        assert_eq!(it.peek(&nk).unwrap().p, pos(1, 32));

        // Non-extent search is >=.
        it.init(&nk, pos(1, 16), false);
        assert_eq!(it.peek(&nk).unwrap().p, pos(1, 16));
    }

    #[test]
    fn deleted_keys_are_invisible() {
        let mut nk = NodeKeys::new();
        nk.insert(k(1, 16, 16));
        nk.insert(Bkey::deleted(pos(1, 32), 16));
        nk.insert(k(1, 48, 16));

        let mut it = NodeIter::default();
        it.init(&nk, pos(1, 0), true);
        assert_eq!(keys_of(&mut it, &nk), vec![16, 48]);
        assert_eq!(nk.nr_live_keys(), 2);
    }

    #[test]
    fn sort_all_drops_whiteouts_and_merges() {
        let mut nk = NodeKeys::new();
        nk.insert(k(1, 16, 16));
        nk.start_new_set();
        nk.insert(Bkey::deleted(pos(1, 32), 16));
        nk.insert(k(1, 64, 16));
        assert_eq!(nk.nsets(), 2);

        nk.sort_all();
        assert_eq!(nk.nsets(), 1);
        assert_eq!(nk.written_sets, 0);
        assert_eq!(nk.nr_keys(), 2);
    }

    #[test]
    fn read_fixup_newer_set_wins() {
        let mut nk = NodeKeys::new();
        nk.insert(k(1, 128, 128)); // (0, 128], older
        nk.start_new_set();
        nk.insert(k(1, 192, 128)); // (64, 192], newer

        nk.sort_fix_overlapping(true);
        let keys = nk.keys_sorted();
        assert_eq!(keys.len(), 2);
        assert_eq!((keys[0].start().offset, keys[0].p.offset), (0, 64));
        assert_eq!((keys[1].start().offset, keys[1].p.offset), (64, 192));
    }

    #[test]
    fn read_fixup_whiteout_suppresses_older() {
        let mut nk = NodeKeys::new();
        nk.insert(k(1, 128, 128));
        nk.start_new_set();
        nk.insert(Bkey::deleted(pos(1, 96), 96)); // discard (0, 96]

        nk.sort_fix_overlapping(true);
        let keys = nk.keys_sorted();
        assert_eq!(keys.len(), 1);
        assert_eq!((keys[0].start().offset, keys[0].p.offset), (96, 128));
    }

    #[test]
    fn read_fixup_middle_overwrite_splits() {
        let mut nk = NodeKeys::new();
        nk.insert(k(1, 256, 256)); // (0, 256]
        nk.start_new_set();
        nk.insert(k(1, 192, 64)); // (128, 192]

        nk.sort_fix_overlapping(true);
        let spans: Vec<(u64, u64)> = nk
            .keys_sorted()
            .iter()
            .map(|k| (k.start().offset, k.p.offset))
            .collect();
        assert_eq!(spans, vec![(0, 128), (128, 192), (192, 256)]);
    }

    #[test]
    fn max_key_ignores_deleted() {
        let mut nk = NodeKeys::new();
        nk.insert(k(1, 16, 16));
        nk.insert(Bkey::deleted(pos(1, 99), 1));
        assert_eq!(nk.max_key(), Some(pos(1, 16)));
    }
}
