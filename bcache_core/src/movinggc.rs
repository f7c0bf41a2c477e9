//! Moving garbage collection: copy live data out of mostly-empty buckets
//! so the allocator can invalidate them. Runs off its own reserve so it
//! can always make progress even when normal allocation is starved.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, trace};

use crate::bkey::{pos, Bkey, BtreeId, Bval};
use crate::btree::iter::BtreeTrans;
use crate::btree::update;
use crate::buckets::BucketDataType;
use crate::errcode::{ErrCode, Result};
use crate::extents::{Crc, ExtentVal};
use crate::io::{Bio, SECTOR_SHIFT};
use crate::super_block::CacheSet;
use crate::writepoint::{alloc_sectors_append_ptrs, alloc_sectors_done, alloc_sectors_start};

/// Buckets under this fraction full are copy candidates.
const FRAGMENT_DENOMINATOR: u32 = 4;

fn pick_fragmented(cs: &CacheSet) -> HashSet<(u8, u64)> {
    let mut targets = HashSet::new();
    for ca in cs.caches_iter() {
        let threshold = ca.bucket_size / FRAGMENT_DENOMINATOR;
        let buckets = ca.buckets.read();
        for (i, b) in buckets.iter().enumerate() {
            if b.data_type == BucketDataType::Data
                && b.pin == 0
                && !b.in_free_list
                && b.sectors_used() > 0
                && b.sectors_used() < threshold
            {
                targets.insert((ca.dev_idx, i as u64));
            }
        }
    }
    targets
}

/// Copy one extent into a fresh bucket via the moving-GC write point,
/// swapping the key only if it hasn't changed meanwhile.
fn move_extent(cs: &Arc<CacheSet>, k: &Bkey) -> Result<bool> {
    let e = k.extent().ok_or(ErrCode::NoDisk)?;
    let data = cs.read_extent_data(k)?;

    let total = (data.len() >> SECTOR_SHIFT) as u64;
    let alloc = alloc_sectors_start(cs, &cs.moving_gc_wp, 1, total as u32, true)?;
    if (alloc.sectors as u64) < total {
        // The extent straddles an open-bucket boundary; skip it this round
        // rather than splitting the key.
        alloc_sectors_done(cs, alloc);
        return Ok(false);
    }

    for ptr in &alloc.ptrs {
        let ca = cs.cache(ptr.dev).ok_or(ErrCode::NoDev)?;
        let mut bio = Bio::write(ptr.offset, data.clone());
        if let Err(err) = ca.bdev.submit(&mut bio) {
            ca.count_io_error(cs);
            alloc_sectors_done(cs, alloc);
            return Err(err);
        }
    }

    let mut ext = ExtentVal::new();
    alloc_sectors_append_ptrs(&mut ext, &alloc);
    ext.dirty = e.dirty;
    ext.crc = Some(Crc::of(&data));
    let new = Bkey::new(k.p, k.size, Bval::Extent(ext));

    let trans = BtreeTrans::new(cs);
    let iter = trans.iter(BtreeId::Extents, k.start(), 1);
    let moved = update::btree_insert_replace(&trans, iter.idx, k, new)?;
    drop(iter);
    alloc_sectors_done(cs, alloc);
    Ok(moved)
}

/// One moving-GC pass: returns the number of extents relocated.
pub fn moving_gc_once(cs: &Arc<CacheSet>) -> Result<usize> {
    if !cs.opts.copy_gc_enabled.load(Ordering::Relaxed) || cs.is_read_only() {
        return Ok(0);
    }

    let targets = pick_fragmented(cs);
    if targets.is_empty() {
        return Ok(0);
    }
    debug!("moving gc: {} candidate buckets", targets.len());

    let mut to_move = Vec::new();
    {
        let trans = BtreeTrans::new(cs);
        let mut iter = trans.iter(BtreeId::Extents, pos(0, 0), 0);
        loop {
            let k = match iter.peek() {
                Ok(Some(k)) => k,
                Ok(None) => break,
                Err(ErrCode::Retry) => continue,
                Err(e) => return Err(e),
            };
            if let Some(e) = k.extent() {
                if let Some(ptr) = e.first_ptr() {
                    if let Some(ca) = cs.cache(ptr.dev) {
                        if targets.contains(&(ptr.dev, ca.bucket_of(ptr.offset))) {
                            to_move.push(k.clone());
                        }
                    }
                }
            }
            iter.advance(&k);
        }
    }

    let mut moved = 0;
    for k in &to_move {
        match move_extent(cs, k) {
            Ok(true) => {
                moved += 1;
                trace!("moving gc: relocated extent at {:?}", k.start());
            }
            Ok(false) => {}
            Err(ErrCode::Retry) => {}
            Err(e) => return Err(e),
        }
    }

    // The drained buckets are now clean-cached or empty; nudge the
    // allocators.
    for ca in cs.caches_iter() {
        ca.alloc.wake_allocator();
    }
    debug!("moving gc: relocated {moved} extents");
    Ok(moved)
}
