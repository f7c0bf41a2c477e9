//! Background writeback: the keybuf overlap index and the per-device
//! writeback worker.
//!
//! The keybuf is an ordered index of dirty-range keys pending writeback.
//! Foreground writes consult it: overlap with a key whose writeback has
//! not started yet drops that key (the foreground write subsumes it) and
//! forces the write into writeback mode so the two copies can't diverge.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::bkey::{Bkey, BtreeId, Bpos};
use crate::btree::iter::BtreeTrans;
use crate::btree::update;
use crate::closure::Closure;
use crate::errcode::ErrCode;
use crate::io::Bio;
use crate::super_block::{BDevState, CacheSet, CachedDev};

#[derive(Debug, Clone)]
struct KeybufKey {
    key: Bkey,
    started: bool,
}

/// Ordered interval index of dirty keys, keyed by end position.
pub struct Keybuf {
    keys: Mutex<BTreeMap<(u64, u64), KeybufKey>>,
}

impl Keybuf {
    pub fn new() -> Keybuf {
        Keybuf {
            keys: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&self, key: Bkey) {
        let mut keys = self.keys.lock();
        keys.insert((key.p.inode, key.p.offset), KeybufKey { key, started: false });
    }

    /// Does any pending key overlap `(start, end]`? Overlapping keys whose
    /// writeback has not started are dropped so the caller's write subsumes
    /// them.
    pub fn check_overlapping(&self, start: Bpos, end: Bpos) -> bool {
        let mut keys = self.keys.lock();
        let mut overlap = false;
        let mut drop_keys = Vec::new();

        for (&k, v) in keys.range((start.inode, start.offset + 1)..=(start.inode, u64::MAX)) {
            if !v.key.overlaps(start, end) {
                // Keys are non-overlapping and ordered; once past `end`
                // nothing later can intersect.
                if v.key.start().offset >= end.offset {
                    break;
                }
                continue;
            }
            overlap = true;
            if !v.started {
                drop_keys.push(k);
            }
        }
        for k in drop_keys {
            keys.remove(&k);
        }
        overlap
    }

    /// Next key to write back, marked started.
    pub fn next_unstarted(&self) -> Option<Bkey> {
        let mut keys = self.keys.lock();
        for v in keys.values_mut() {
            if !v.started {
                v.started = true;
                return Some(v.key.clone());
            }
        }
        None
    }

    pub fn remove(&self, key: &Bkey) {
        self.keys.lock().remove(&(key.p.inode, key.p.offset));
    }

    pub fn clear(&self) {
        self.keys.lock().clear();
    }
}

impl Default for Keybuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Proportional dirty-data rate controller. The cached-device flavour
/// clamps the target percentage; the tiering controller reuses it without
/// the clamp.
pub struct RateController {
    clamp: bool,
}

impl RateController {
    pub fn new() -> RateController {
        RateController { clamp: true }
    }

    pub fn new_unclamped() -> RateController {
        RateController { clamp: false }
    }

    /// Delay before the next writeback chunk: zero when over target,
    /// stretching as dirty data falls below it.
    pub fn delay(&self, dirty_sectors: u64, capacity_sectors: u64, percent: u64) -> Duration {
        let percent = if self.clamp {
            percent.min(crate::opts::WRITEBACK_PERCENT_MAX)
        } else {
            percent
        };
        if capacity_sectors == 0 || percent == 0 {
            return Duration::ZERO;
        }
        let target = capacity_sectors * percent / 100;
        if dirty_sectors >= target {
            return Duration::ZERO;
        }
        // Below target: spread the remaining work out.
        let headroom = target - dirty_sectors;
        let ms = (headroom * 100 / target.max(1)).min(100);
        Duration::from_millis(ms)
    }
}

impl Default for RateController {
    fn default() -> Self {
        Self::new()
    }
}

const WRITEBACK_BATCH: usize = 16;

/// Scan the extents tree for dirty keys of this device and queue them.
fn refill_keybuf(cs: &CacheSet, dc: &CachedDev) -> usize {
    let _exclusive = dc.writeback_lock.write();
    let trans = BtreeTrans::new(cs);
    let mut iter = trans.iter(BtreeId::Extents, crate::bkey::pos(dc.inode, 0), 0);
    let mut queued = 0;

    while queued < WRITEBACK_BATCH {
        let k = match iter.peek() {
            Ok(Some(k)) => k,
            Ok(None) => break,
            Err(ErrCode::Retry) => continue,
            Err(e) => {
                warn!("writeback scan failed: {e}");
                break;
            }
        };
        if k.p.inode != dc.inode {
            break;
        }
        if let Some(e) = k.extent() {
            if e.dirty {
                dc.keybuf.add(k.clone());
                queued += 1;
            }
        }
        iter.advance(&k);
    }
    queued
}

/// Read a dirty extent from the cache and copy it to the backing device,
/// then clear the dirty bit in the tree. The clear only happens if the
/// key is still there; a foreground write that raced us wins.
fn write_one(cs: &CacheSet, dc: &CachedDev, k: &Bkey) -> Result<(), ErrCode> {
    if k.extent().is_none() {
        return Err(ErrCode::NoDisk);
    }
    let data = cs.read_extent_data(k)?;

    let mut bio = Bio::write(k.start().offset, data);
    dc.bdev.submit(&mut bio).map_err(|err| {
        dc.count_io_error(cs);
        err
    })?;

    let mut clean = k.clone();
    if let crate::bkey::Bval::Extent(ref mut ce) = clean.val {
        ce.dirty = false;
    }

    let trans = BtreeTrans::new(cs);
    let iter = trans.iter(BtreeId::Extents, k.start(), 1);
    match update::btree_insert_replace(&trans, iter.idx, k, clean) {
        Ok(true) => {
            dc.sub_dirty(k.size as u64);
            trace!("writeback: cleaned {:?}+{}", k.start(), k.size);
            Ok(())
        }
        Ok(false) => {
            debug!("writeback: key at {:?} changed underneath, skipping", k.start());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Per-cached-device writeback worker body.
pub fn writeback_thread(cs: Arc<CacheSet>, dc: Arc<CachedDev>) {
    debug!("writeback worker for inode {} running", dc.inode);
    let rate = RateController::new();

    loop {
        if cs.is_shutting_down() || dc.detached() {
            break;
        }

        if !dc.opts.writeback_running.load(std::sync::atomic::Ordering::Relaxed)
            || dc.dirty_sectors() == 0
        {
            if dc.dirty_sectors() == 0 && dc.state() == BDevState::Dirty {
                dc.set_state(BDevState::Clean);
            }
            dc.writeback_wait(Duration::from_millis(50));
            continue;
        }

        if dc.keybuf.is_empty() && refill_keybuf(&cs, &dc) == 0 {
            // Dirty counter says there is work but the scan found none;
            // resync the counter from the tree.
            if dc.keybuf.is_empty() {
                dc.writeback_wait(Duration::from_millis(50));
            }
            continue;
        }

        // Each key's copy runs as one closure-chained stage on the worker
        // pool; the batch syncs before the next refill.
        let cl = Closure::new(Some(cs.pool.clone()));
        while let Some(k) = dc.keybuf.next_unstarted() {
            if cs.is_shutting_down() {
                break;
            }
            cl.get();
            let cs2 = cs.clone();
            let dc2 = dc.clone();
            let cl2 = cl.clone();
            cs.pool.queue(Box::new(move || {
                if let Err(e) = write_one(&cs2, &dc2, &k) {
                    warn!("writeback of {:?} failed: {e}", k.start());
                }
                dc2.keybuf.remove(&k);
                cl2.put();
            }));

            let percent = dc.opts.writeback_percent.load(std::sync::atomic::Ordering::Relaxed);
            let delay = rate.delay(dc.dirty_sectors(), dc.capacity_sectors(), percent);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        cl.put();
        cl.sync();
    }
    debug!("writeback worker for inode {} stopped", dc.inode);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::pos;

    fn kb_key(inode: u64, end: u64, size: u32) -> Bkey {
        Bkey::new(pos(inode, end), size, crate::bkey::Bval::Check)
    }

    #[test]
    fn overlap_drops_unstarted() {
        let kb = Keybuf::new();
        kb.add(kb_key(5, 128, 128)); // (0, 128]

        // Overlapping foreground write: reports overlap, drops the key.
        assert!(kb.check_overlapping(pos(5, 64), pos(5, 192)));
        assert!(kb.is_empty());

        // Second check is clean.
        assert!(!kb.check_overlapping(pos(5, 64), pos(5, 192)));
    }

    #[test]
    fn overlap_keeps_started() {
        let kb = Keybuf::new();
        kb.add(kb_key(5, 128, 128));
        let started = kb.next_unstarted().unwrap();
        assert_eq!(started.p, pos(5, 128));

        assert!(kb.check_overlapping(pos(5, 0), pos(5, 128)));
        assert_eq!(kb.len(), 1);
    }

    #[test]
    fn no_overlap_different_inode_or_range() {
        let kb = Keybuf::new();
        kb.add(kb_key(5, 128, 64)); // (64, 128]
        assert!(!kb.check_overlapping(pos(5, 0), pos(5, 64)));
        assert!(!kb.check_overlapping(pos(5, 128), pos(5, 256)));
        assert!(!kb.check_overlapping(pos(6, 0), pos(6, 1024)));
        assert_eq!(kb.len(), 1);
    }

    #[test]
    fn rate_controller_zero_when_over_target() {
        let rc = RateController::new();
        assert_eq!(rc.delay(500, 1000, 10), Duration::ZERO);
        assert!(rc.delay(10, 1000, 10) > Duration::ZERO);
        // Unclamped flavour honors large percentages.
        let rc = RateController::new_unclamped();
        assert_eq!(rc.delay(890, 1000, 90), Duration::ZERO);
    }
}
