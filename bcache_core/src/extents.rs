//! Extent values: pointer assembly, staleness, pick-for-read, and the
//! cut-front/cut-back helpers the update path splits overlapping keys with.

use crate::bkey::{bpos_ge, bpos_le, Bkey, Bpos, Bval};
use crate::super_block::CacheSet;
use crate::util::crc64;

/// Replication cap per extent.
pub const MAX_PTRS: usize = 4;

/// Pointer into a cache device: absolute sector plus the bucket generation
/// the pointer expects. A pointer is stale once the bucket's generation has
/// moved past `gen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ptr {
    pub dev: u8,
    pub gen: u8,
    pub offset: u64,
}

impl Ptr {
    /// Hash-table key for the node cache: nodes are hashed by their first
    /// pointer's identity, generation excluded (a node reused at a new gen
    /// is a different pointer value but the same slot).
    pub fn cache_key(&self) -> u64 {
        ((self.dev as u64) << 56) ^ self.offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc {
    pub csum: u64,
}

impl Crc {
    pub fn of(data: &[u8]) -> Crc {
        Crc { csum: crc64(data) }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtentVal {
    pub ptrs: Vec<Ptr>,
    pub crc: Option<Crc>,
    /// Data exists only in cache, not yet written back to the backing
    /// device.
    pub dirty: bool,
}

impl ExtentVal {
    pub fn new() -> ExtentVal {
        ExtentVal::default()
    }

    pub fn first_ptr(&self) -> Option<&Ptr> {
        self.ptrs.first()
    }

    pub fn push_ptr(&mut self, ptr: Ptr) {
        assert!(self.ptrs.len() < MAX_PTRS);
        self.ptrs.push(ptr);
    }
}

/// Outcome of choosing a pointer to read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickResult {
    Ok(Ptr),
    /// Pointers exist but every one is stale; caller re-peeks and retries.
    Stale,
    /// A pointer references a device that is gone; permanent EIO for this
    /// read.
    NoDevice,
    /// No pointers at all (hole or placeholder).
    None,
}

impl CacheSet {
    /// Choose a pointer to read an extent from, preferring non-congested
    /// devices, then lower tier, then fewer accumulated errors.
    pub fn extent_pick_ptr(&self, e: &ExtentVal) -> PickResult {
        if e.ptrs.is_empty() {
            return PickResult::None;
        }

        let mut saw_missing = false;
        let mut saw_stale = false;
        let mut best: Option<(&Ptr, (u8, u8, u64))> = None;

        for ptr in &e.ptrs {
            let Some(ca) = self.cache(ptr.dev) else {
                saw_missing = true;
                continue;
            };
            if ca.ptr_stale(ptr) {
                saw_stale = true;
                continue;
            }

            let score = (
                ca.congested() as u8,
                ca.tier(),
                ca.error_count(),
            );
            match best {
                Some((_, best_score)) if best_score <= score => {}
                _ => best = Some((ptr, score)),
            }
        }

        match best {
            Some((ptr, _)) => PickResult::Ok(*ptr),
            None if saw_stale => PickResult::Stale,
            None if saw_missing => PickResult::NoDevice,
            None => PickResult::None,
        }
    }

    /// True if any pointer of `e` is stale.
    pub fn extent_ptrs_stale(&self, e: &ExtentVal) -> bool {
        e.ptrs.iter().any(|ptr| {
            self.cache(ptr.dev).map_or(true, |ca| ca.ptr_stale(ptr))
        })
    }
}

fn val_cut_front(sectors: u64, val: &mut Bval) {
    match val {
        Bval::Extent(e) | Bval::BtreePtr(e) => {
            for ptr in &mut e.ptrs {
                ptr.offset += sectors;
            }
            // A partial extent no longer matches its whole-extent checksum.
            e.crc = None;
        }
        _ => {}
    }
}

/// Trim the front of `k` so it starts at `at`. No-op if `at` is at or
/// before the current start.
pub fn cut_front(at: Bpos, k: &mut Bkey) {
    if bpos_le(at, k.start()) {
        return;
    }
    assert_eq!(at.inode, k.p.inode);
    assert!(bpos_le(at, k.p));

    let sectors = at.offset - k.start().offset;
    k.size -= sectors as u32;
    val_cut_front(sectors, &mut k.val);
    if k.size == 0 && !k.is_deleted() {
        k.val = Bval::Deleted;
    }
}

/// Trim the back of `k` so it ends at `at`. No-op if `at` is at or past the
/// current end.
pub fn cut_back(at: Bpos, k: &mut Bkey) {
    if bpos_ge(at, k.p) {
        return;
    }
    assert_eq!(at.inode, k.p.inode);
    assert!(bpos_ge(at, k.start()));

    k.size -= (k.p.offset - at.offset) as u32;
    k.p = at;
    if let Bval::Extent(e) | Bval::BtreePtr(e) = &mut k.val {
        e.crc = None;
    }
    if k.size == 0 && !k.is_deleted() {
        k.val = Bval::Deleted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::pos;

    fn extent_key(inode: u64, end: u64, size: u32, ptr_offset: u64) -> Bkey {
        let mut e = ExtentVal::new();
        e.push_ptr(Ptr { dev: 0, gen: 1, offset: ptr_offset });
        e.crc = Some(Crc { csum: 0xdead });
        Bkey::new(pos(inode, end), size, Bval::Extent(e))
    }

    #[test]
    fn cut_front_advances_ptrs() {
        let mut k = extent_key(1, 128, 64, 1000);
        cut_front(pos(1, 96), &mut k);
        assert_eq!(k.start(), pos(1, 96));
        assert_eq!(k.p, pos(1, 128));
        assert_eq!(k.size, 32);
        let e = k.extent().unwrap();
        assert_eq!(e.ptrs[0].offset, 1032);
        assert!(e.crc.is_none());
    }

    #[test]
    fn cut_back_moves_end() {
        let mut k = extent_key(1, 128, 64, 1000);
        cut_back(pos(1, 96), &mut k);
        assert_eq!(k.start(), pos(1, 64));
        assert_eq!(k.p, pos(1, 96));
        assert_eq!(k.size, 32);
        assert_eq!(k.extent().unwrap().ptrs[0].offset, 1000);
    }

    #[test]
    fn cut_to_nothing_deletes() {
        let mut k = extent_key(1, 128, 64, 1000);
        cut_front(pos(1, 128), &mut k);
        assert_eq!(k.size, 0);
        assert!(k.is_deleted());
    }

    #[test]
    fn cut_outside_range_is_noop() {
        let mut k = extent_key(1, 128, 64, 1000);
        cut_front(pos(1, 10), &mut k);
        cut_back(pos(1, 1000), &mut k);
        assert_eq!(k, extent_key(1, 128, 64, 1000));
    }

    #[test]
    fn cache_key_ignores_gen() {
        let a = Ptr { dev: 1, gen: 3, offset: 4096 };
        let b = Ptr { dev: 1, gen: 9, offset: 4096 };
        assert_eq!(a.cache_key(), b.cache_key());
    }
}
