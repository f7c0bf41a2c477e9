// SPDX-License-Identifier: GPL-2.0

//! The request pipeline: bypass decision, sequential detection, congestion
//! accounting, and the read and write state machines.
//!
//! A read walks the extents btree over the bio's range; each slice is
//! served from cache (with a post-read generation check and retry on a
//! stale race) or from the backing device. A write consults the writeback
//! keybuf, picks bypass / writethrough / writeback, and drives the data
//! write machine that allocates sectors from a write point and inserts
//! extents.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use log::{debug, trace, warn};
use rand::Rng;

use crate::bkey::{pos, Bkey, BtreeId, Bval};
use crate::btree::iter::BtreeTrans;
use crate::btree::update;
use crate::errcode::{ErrCode, Result};
use crate::extents::{Crc, ExtentVal, PickResult};
use crate::io::{Bio, BioFlags, BioOp, SECTOR_SHIFT};
use crate::opts::CacheMode;
use crate::super_block::{BDevState, CacheSet, CachedDev};
use crate::util::{ewma_add, hash_64, monotonic_us, LruList};
use crate::writepoint::{alloc_sectors_append_ptrs, alloc_sectors_done, alloc_sectors_start};

/// Request and cache-insert granularity, in sectors.
pub const BLOCK_SECTORS: u32 = 8;

/// Bypass everything once free space falls under this percentage.
pub const CUTOFF_CACHE_ADD: u64 = 10;

/// Dirty-cache utilization ceilings for the writeback decision.
const CUTOFF_WRITEBACK: u64 = 40;
const CUTOFF_WRITEBACK_SYNC: u64 = 70;

bitflags! {
    pub struct WriteOpFlags: u32 {
        /// Insert as clean cached data rather than dirty.
        const CACHED           = 1 << 0;
        /// Flush the journal after the insert.
        const FLUSH            = 1 << 1;
        /// The op is a discard of the cached range.
        const DISCARD          = 1 << 2;
        /// On cache-write error, drop the cached copy instead of failing.
        const DISCARD_ON_ERROR = 1 << 3;
        /// Fail rather than wait for a free bucket.
        const ALLOC_NOWAIT     = 1 << 4;
    }
}

pub const RECENT_IO: usize = 128;
const SEQUENTIAL_MERGE_US: u64 = 5_000_000;

#[derive(Debug, Clone, Copy, Default)]
struct IoEntry {
    last_sector: u64,
    sequential_bytes: u64,
    last_us: u64,
}

/// Per-cached-device table of recent I/O runs, LRU-replaced, keyed by the
/// sector a sequential successor would start at.
pub struct RecentIo {
    entries: Vec<IoEntry>,
    lru: LruList,
    by_sector: std::collections::HashMap<u64, usize>,
}

impl RecentIo {
    pub fn new() -> RecentIo {
        let mut lru = LruList::new();
        for i in 0..RECENT_IO {
            lru.push_front(i);
        }
        RecentIo {
            entries: vec![IoEntry::default(); RECENT_IO],
            lru,
            by_sector: std::collections::HashMap::new(),
        }
    }

    /// Record a bio and return the length in bytes of the sequential run
    /// it extends (including itself).
    pub fn note(&mut self, sector: u64, sectors: u32) -> u64 {
        let now = monotonic_us();
        let bytes = (sectors as u64) << SECTOR_SHIFT;
        let _ = hash_64(sector, 7); // hashed placement, resolved by the map

        let idx = match self.by_sector.remove(&sector) {
            Some(idx) => {
                if self.lru.contains(idx) {
                    self.lru.remove(idx);
                }
                let e = &mut self.entries[idx];
                if now.saturating_sub(e.last_us) > SEQUENTIAL_MERGE_US {
                    e.sequential_bytes = 0;
                }
                idx
            }
            None => {
                // Replace the least recently used entry.
                let idx = self.lru.pop_back().expect("table never empties");
                let e = &mut self.entries[idx];
                if e.last_sector != 0 {
                    self.by_sector.remove(&e.last_sector);
                }
                e.sequential_bytes = 0;
                idx
            }
        };

        let e = &mut self.entries[idx];
        e.sequential_bytes += bytes;
        e.last_sector = sector + sectors as u64;
        e.last_us = now;
        let run = e.sequential_bytes;
        self.by_sector.insert(e.last_sector, idx);
        self.lru.push_front(idx);
        run
    }
}

impl Default for RecentIo {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task sequential-I/O statistics, the analog of the fields a kernel
/// keeps in the task struct.
#[derive(Default)]
pub struct TaskHint {
    pub sequential_io: AtomicU64,
    pub sequential_io_avg: AtomicU64,
}

/// Should this request go around the cache?
pub fn check_should_bypass(
    cs: &CacheSet,
    dc: &CachedDev,
    bio: &Bio,
    task: Option<&TaskHint>,
) -> bool {
    let mode = dc.opts.cache_mode();
    let is_write = bio.op == BioOp::Write;

    if dc.detaching() || cs.is_read_only() {
        return true;
    }
    if mode == CacheMode::None || (mode == CacheMode::Writearound && is_write) {
        return true;
    }
    if bio.op == BioOp::Discard {
        return true;
    }
    if bio.sector % BLOCK_SECTORS as u64 != 0 || bio.sectors() % BLOCK_SECTORS != 0 {
        return true;
    }
    if cs.free_percent() < CUTOFF_CACHE_ADD {
        return true;
    }

    // Congestion: when the cache is slow, larger requests go to backing.
    let read_thr = cs.opts.congested_read_threshold_us.load(Ordering::Relaxed);
    let write_thr = cs.opts.congested_write_threshold_us.load(Ordering::Relaxed);
    if read_thr != 0 || write_thr != 0 {
        let congested = cs.congestion.get();
        if congested > 0 && bio.sectors() as u64 >= congested {
            cs.stats.bypass_congested.fetch_add(1, Ordering::Relaxed);
            return true;
        }
    }

    // Sequential detection: table run length plus the task's EWMA.
    let cutoff = dc.opts.sequential_cutoff.load(Ordering::Relaxed);
    let run = dc.recent_io.lock().note(bio.sector, bio.sectors());
    let sequential = match task {
        Some(t) => {
            t.sequential_io.store(run, Ordering::Relaxed);
            let avg = ewma_add(t.sequential_io_avg.load(Ordering::Relaxed), run, 3);
            t.sequential_io_avg.store(avg, Ordering::Relaxed);
            run.max(avg)
        }
        None => run,
    };
    if cutoff != 0 && sequential >= cutoff {
        trace!("bypass: sequential run of {sequential} bytes >= {cutoff}");
        cs.stats.bypass_sequential.fetch_add(1, Ordering::Relaxed);
        return true;
    }

    if dc.opts.bypass_torture_test.load(Ordering::Relaxed) && rand::thread_rng().gen_ratio(1, 16) {
        return true;
    }

    false
}

fn note_device_latency(cs: &CacheSet, dev: u8, latency_us: u64, is_write: bool) {
    let threshold = if is_write {
        cs.opts.congested_write_threshold_us.load(Ordering::Relaxed)
    } else {
        cs.opts.congested_read_threshold_us.load(Ordering::Relaxed)
    };
    if threshold != 0 && latency_us > threshold {
        cs.congestion.add(latency_us - threshold);
    }
    if let Some(ca) = cs.cache(dev) {
        ca.note_latency(latency_us, threshold);
    }
}

fn backing_submit(cs: &CacheSet, dc: &CachedDev, bio: &mut Bio) -> Result<()> {
    let start = Instant::now();
    let ret = dc.bdev.submit(bio);
    let threshold = if bio.op == BioOp::Write {
        cs.opts.congested_write_threshold_us.load(Ordering::Relaxed)
    } else {
        cs.opts.congested_read_threshold_us.load(Ordering::Relaxed)
    };
    let latency = start.elapsed().as_micros() as u64;
    if threshold != 0 && latency > threshold {
        cs.congestion.add(latency - threshold);
    }
    if ret.is_err() {
        dc.count_io_error(cs);
    }
    ret
}

/// The per-request state machine: alloc → bypass check → read/write →
/// complete, with reads looping through the stale-retry edge.
pub struct Search {
    pub inode: u64,
    pub bypass: bool,
    pub writeback: bool,
    pub recoverable: bool,
    pub read_dirty_data: bool,
    pub cache_miss: bool,
    pub start_us: u64,
}

impl Search {
    fn new(dc: &CachedDev) -> Search {
        Search {
            inode: dc.inode,
            bypass: false,
            writeback: false,
            recoverable: true,
            read_dirty_data: false,
            cache_miss: false,
            start_us: monotonic_us(),
        }
    }
}

/// Entry point for a bio on a cached (virtual) device.
pub fn cached_dev_submit_bio(
    cs: &Arc<CacheSet>,
    dc: &Arc<CachedDev>,
    bio: &mut Bio,
    task: Option<&TaskHint>,
) -> Result<()> {
    if !dc.get() {
        return Err(ErrCode::NoDev);
    }
    let ret = cached_dev_run(cs, dc, bio, task);
    dc.put();
    ret
}

fn cached_dev_run(
    cs: &Arc<CacheSet>,
    dc: &Arc<CachedDev>,
    bio: &mut Bio,
    task: Option<&TaskHint>,
) -> Result<()> {
    if dc.state() == BDevState::Inconsistent {
        return Err(ErrCode::Inconsistent);
    }

    let mut s = Search::new(dc);
    match bio.op {
        BioOp::Flush => backing_submit(cs, dc, bio),
        BioOp::Discard => {
            s.bypass = true;
            cached_dev_write(cs, dc, &mut s, bio)
        }
        BioOp::Read => {
            s.bypass = check_should_bypass(cs, dc, bio, task);
            cached_dev_read(cs, dc, &mut s, bio)
        }
        BioOp::Write => {
            s.bypass = check_should_bypass(cs, dc, bio, task);
            cached_dev_write(cs, dc, &mut s, bio)
        }
    }
}

enum CacheRead {
    Served,
    /// The key's pointers were already stale (lazily invalidated clean
    /// data); the backing device has the bytes.
    StaleBeforeRead,
    /// The bucket was reused under the read; re-peek, since the tree may
    /// hold a rewritten copy by now.
    StaleRaced,
}

/// Serve one slice `(sector, sector+nsec)` from the cache extent `k`.
fn cache_read_slice(
    cs: &CacheSet,
    k: &Bkey,
    sector: u64,
    nsec: u64,
    out: &mut [u8],
) -> Result<CacheRead> {
    let e = k.extent().expect("caller checked");
    let ptr = match cs.extent_pick_ptr(e) {
        PickResult::Ok(ptr) => ptr,
        PickResult::Stale | PickResult::None => return Ok(CacheRead::StaleBeforeRead),
        PickResult::NoDevice => return Err(ErrCode::NoDisk),
    };
    let ca = cs.cache(ptr.dev).ok_or(ErrCode::NoDisk)?;

    let off_in_extent = sector - k.start().offset;
    let mut cache_bio = Bio::read(ptr.offset + off_in_extent, nsec as u32);
    let start = Instant::now();
    let ret = ca.bdev.submit(&mut cache_bio);
    note_device_latency(cs, ptr.dev, start.elapsed().as_micros() as u64, false);

    if let Err(err) = ret {
        ca.count_io_error(cs);
        return Err(err);
    }

    // The race this engine is named for: did the bucket get reused while
    // we were reading from it?
    if ca.ptr_stale(&ptr) {
        cs.stats.cache_read_races.fetch_add(1, Ordering::Relaxed);
        return Ok(CacheRead::StaleRaced);
    }

    // Whole-extent reads with a checksum can be verified.
    if nsec == k.size as u64 && off_in_extent == 0 {
        if let Some(Crc { csum }) = e.crc {
            if crate::util::crc64(&cache_bio.data) != csum {
                warn!("extent at {:?}: checksum mismatch on read", k.start());
                return Err(ErrCode::IO);
            }
        }
    }

    out.copy_from_slice(&cache_bio.data);
    ca.touch_read(ca.bucket_of(ptr.offset));
    Ok(CacheRead::Served)
}

/// Read a missed slice from the backing device, with readahead rounding
/// feeding the promote path when enabled.
fn cache_miss_slice(
    cs: &Arc<CacheSet>,
    dc: &Arc<CachedDev>,
    s: &mut Search,
    sector: u64,
    nsec: u64,
    out: &mut [u8],
) -> Result<()> {
    s.cache_miss = true;

    // Readahead rounds the miss up; the surplus only has somewhere to go
    // when the promote path is compiled in.
    let mut ra_sectors = 0u64;
    if !s.bypass && cfg!(feature = "promote") {
        let ra = dc.opts.readahead.load(Ordering::Relaxed);
        if ra > 0 {
            ra_sectors = ra.min(dc.bdev.size_sectors().saturating_sub(sector + nsec));
        }
    }

    #[cfg(feature = "promote")]
    let placeholder = if !s.bypass {
        promote_reserve(cs, s.inode, sector, nsec + ra_sectors)
    } else {
        None
    };

    let read_sectors = {
        #[cfg(feature = "promote")]
        {
            if placeholder.is_some() {
                if ra_sectors > 0 {
                    cs.stats.cache_readaheads.fetch_add(1, Ordering::Relaxed);
                }
                nsec + ra_sectors
            } else {
                nsec
            }
        }
        #[cfg(not(feature = "promote"))]
        {
            let _ = ra_sectors;
            nsec
        }
    };

    let mut miss_bio = Bio::read(sector, read_sectors as u32);
    backing_submit(cs, dc, &mut miss_bio)?;
    out.copy_from_slice(&miss_bio.data[..out.len()]);

    #[cfg(feature = "promote")]
    if let Some(check_key) = placeholder {
        promote_complete(cs, dc, &check_key, sector, miss_bio.data);
    }

    Ok(())
}

/// Read path: walk extents over the bio's range, cache hits direct, holes
/// and stale pointers to backing.
fn cached_dev_read(
    cs: &Arc<CacheSet>,
    dc: &Arc<CachedDev>,
    s: &mut Search,
    bio: &mut Bio,
) -> Result<()> {
    let inode = s.inode;
    let start = bio.sector;
    let end = bio.end_sector();

    if s.bypass {
        // Straight to backing; accounted as a bypassed miss.
        cs.stats.mark_cache_accounting(false, true);
        cs.stats
            .sectors_bypassed
            .fetch_add(bio.sectors() as u64, Ordering::Relaxed);
        return backing_submit(cs, dc, bio);
    }

    let trans = BtreeTrans::new(cs);
    let mut iter = trans.iter(BtreeId::Extents, pos(inode, start), 0);

    let mut sector = start;
    while sector < end {
        iter.set_pos(pos(inode, sector));
        let k = match iter.peek_with_holes(pos(inode, end)) {
            Ok(Some(k)) => k,
            Ok(None) => break,
            Err(ErrCode::Retry) => continue,
            Err(e) => return Err(e),
        };

        let slice_end = k.p.offset.min(end);
        let nsec = slice_end - sector;
        debug_assert!(nsec > 0);
        let buf_off = ((sector - start) as usize) << SECTOR_SHIFT;
        let buf_end = buf_off + ((nsec as usize) << SECTOR_SHIFT);
        let out = &mut bio.data[buf_off..buf_end];

        let served_from_cache = if k.is_extent() {
            match cache_read_slice(cs, &k, sector, nsec, out) {
                Ok(CacheRead::Served) => {
                    if k.extent().map_or(false, |e| e.dirty) {
                        s.read_dirty_data = true;
                    }
                    cs.stats.mark_cache_accounting(true, false);
                    true
                }
                // Raced a reuse: re-enter the iterator at the same
                // position; the next peek sees either a rewritten copy or
                // a now-stale key that falls through to backing.
                Ok(CacheRead::StaleRaced) => continue,
                Ok(CacheRead::StaleBeforeRead) => false,
                Err(err) if s.recoverable => {
                    debug!("cache read error ({err}), falling back to backing device");
                    false
                }
                Err(err) => return Err(err),
            }
        } else {
            false
        };

        if !served_from_cache {
            // No btree locks across backing I/O (or the promote insert,
            // which needs the leaf write-locked).
            iter.unlock();
            cs.stats.mark_cache_accounting(false, false);
            cache_miss_slice(cs, dc, s, sector, nsec, out)?;
        }

        sector = slice_end;
        iter.advance(&k);
    }

    Ok(())
}

/// The writeback policy decision for a non-bypassed write.
fn should_writeback(cs: &CacheSet, dc: &CachedDev, bio: &Bio, would_skip: bool) -> bool {
    if dc.opts.cache_mode() != CacheMode::Writeback {
        return false;
    }
    if would_skip {
        return false;
    }
    let in_use = 100 - cs.free_percent();
    if in_use > CUTOFF_WRITEBACK_SYNC {
        return false;
    }
    if bio.flags.contains(BioFlags::SYNC) {
        return true;
    }
    in_use <= CUTOFF_WRITEBACK
}

/// Write path. Runs under the device's writeback lock (shared side).
fn cached_dev_write(
    cs: &Arc<CacheSet>,
    dc: &Arc<CachedDev>,
    s: &mut Search,
    bio: &mut Bio,
) -> Result<()> {
    let _wb = dc.writeback_lock.read();

    let start_pos = pos(s.inode, bio.sector);
    let end_pos = pos(s.inode, bio.end_sector());

    // Overlap with dirty data whose writeback hasn't started forces this
    // write into writeback so the copies can't diverge; the pending keys
    // were dropped and are now covered by us.
    if dc.keybuf.check_overlapping(start_pos, end_pos) {
        s.bypass = false;
        s.writeback = true;
    }

    if should_writeback(cs, dc, bio, s.bypass) {
        s.bypass = false;
        s.writeback = true;
    }

    if s.bypass {
        cs.stats
            .sectors_bypassed
            .fetch_add(bio.sectors() as u64, Ordering::Relaxed);
        // Stale cached copies of the range must go.
        invalidate_cache_range(cs, s.inode, bio.sector, bio.end_sector())?;

        if bio.op == BioOp::Discard && !dc.bdev.supports_discard() {
            return Ok(());
        }
        return backing_submit(cs, dc, bio);
    }

    if s.writeback {
        if bio.flags.contains(BioFlags::PREFLUSH) {
            let mut flush = Bio::flush();
            backing_submit(cs, dc, &mut flush)?;
        }
        let mut flags = WriteOpFlags::empty();
        if bio.flags.contains(BioFlags::SYNC) {
            flags |= WriteOpFlags::FLUSH;
        }
        data_write(cs, dc, bio.sector, &bio.data, flags)?;
        dc.add_dirty(bio.sectors() as u64);
        Ok(())
    } else {
        // Writethrough: backing first, cache copy best-effort.
        backing_submit(cs, dc, bio)?;
        match data_write(
            cs,
            dc,
            bio.sector,
            &bio.data,
            WriteOpFlags::CACHED | WriteOpFlags::ALLOC_NOWAIT,
        ) {
            Ok(_) => {}
            Err(ErrCode::NoSpace) => {
                // No free bucket without waiting; the cached copy of this
                // range must still be dropped lest a stale one linger.
                invalidate_cache_range(cs, s.inode, bio.sector, bio.end_sector())?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

fn invalidate_cache_range(cs: &CacheSet, inode: u64, start: u64, end: u64) -> Result<()> {
    let trans = BtreeTrans::new(cs);
    let iter = trans.iter(BtreeId::Extents, pos(inode, start), 1);
    update::discard_cached_range(&trans, iter.idx, inode, start, end)
}

/// The data write machine: allocate sectors from a write point, write each
/// replica, insert the extent. Loops until the whole range is covered.
pub fn data_write(
    cs: &Arc<CacheSet>,
    dc: &CachedDev,
    sector: u64,
    data: &[u8],
    flags: WriteOpFlags,
) -> Result<u64> {
    let inode = dc.inode;
    let dirty = !flags.contains(WriteOpFlags::CACHED);
    let wait = !flags.contains(WriteOpFlags::ALLOC_NOWAIT);
    let wp = cs.write_point(inode);

    let total_sectors = (data.len() >> SECTOR_SHIFT) as u64;
    let mut done = 0u64;
    let mut last_seq = 0u64;

    while done < total_sectors {
        let alloc = alloc_sectors_start(cs, wp, 1, (total_sectors - done) as u32, wait)?;
        let chunk = alloc.sectors as u64;
        let chunk_data =
            &data[(done as usize) << SECTOR_SHIFT..((done + chunk) as usize) << SECTOR_SHIFT];

        let mut write_err = None;
        for ptr in &alloc.ptrs {
            let Some(ca) = cs.cache(ptr.dev) else {
                write_err = Some(ErrCode::NoDev);
                break;
            };
            let mut bio = Bio::write(ptr.offset, chunk_data.to_vec());
            let t0 = Instant::now();
            let ret = ca.bdev.submit(&mut bio);
            note_device_latency(cs, ptr.dev, t0.elapsed().as_micros() as u64, true);
            if let Err(e) = ret {
                ca.count_io_error(cs);
                write_err = Some(e);
                break;
            }
            ca.touch_write(ca.bucket_of(ptr.offset));
        }

        if let Some(e) = write_err {
            alloc_sectors_done(cs, alloc);
            if flags.contains(WriteOpFlags::DISCARD_ON_ERROR) {
                let _ = invalidate_cache_range(cs, inode, sector, sector + done);
                return Ok(last_seq);
            }
            return Err(e);
        }

        let mut ext = ExtentVal::new();
        alloc_sectors_append_ptrs(&mut ext, &alloc);
        ext.dirty = dirty;
        ext.crc = Some(Crc::of(chunk_data));
        let k = Bkey::new(
            pos(inode, sector + done + chunk),
            chunk as u32,
            Bval::Extent(ext),
        );

        let trans = BtreeTrans::new(cs);
        let iter = trans.iter(BtreeId::Extents, k.start(), 1);
        last_seq = update::btree_insert_key(&trans, iter.idx, k)?;
        drop(iter);
        drop(trans);

        alloc_sectors_done(cs, alloc);
        done += chunk;
    }

    if flags.contains(WriteOpFlags::FLUSH) {
        cs.journal.flush_seq(last_seq)?;
    }
    Ok(last_seq)
}

// Promote: copy read-miss data into the cache. The placeholder protocol is
// still settling (see DESIGN.md); gated off by default.

#[cfg(feature = "promote")]
fn promote_reserve(cs: &Arc<CacheSet>, inode: u64, sector: u64, nsec: u64) -> Option<Bkey> {
    let k = Bkey::new(pos(inode, sector + nsec), nsec as u32, Bval::Check);
    let trans = BtreeTrans::new(cs);
    let iter = trans.iter(BtreeId::Extents, k.start(), 1);
    match update::insert_check_key(&trans, iter.idx, k.clone()) {
        Ok(true) => Some(k),
        _ => None,
    }
}

#[cfg(feature = "promote")]
fn promote_complete(
    cs: &Arc<CacheSet>,
    dc: &CachedDev,
    check_key: &Bkey,
    sector: u64,
    data: Vec<u8>,
) {
    // Allocate cache sectors and write the data, then swap the placeholder
    // for the real extent, but only if the placeholder survived. A racing
    // foreground write overwrote it, and wins. Promotes that don't fit one
    // open bucket are dropped whole rather than replaced piecemeal.
    let wp = cs.write_point(dc.inode);
    let total = (data.len() >> SECTOR_SHIFT) as u64;

    let Ok(alloc) = alloc_sectors_start(cs, wp, 1, total as u32, false) else {
        return;
    };
    if (alloc.sectors as u64) < total {
        alloc_sectors_done(cs, alloc);
        return;
    }

    for ptr in &alloc.ptrs {
        let Some(ca) = cs.cache(ptr.dev) else {
            alloc_sectors_done(cs, alloc);
            return;
        };
        let mut bio = Bio::write(ptr.offset, data.clone());
        if ca.bdev.submit(&mut bio).is_err() {
            alloc_sectors_done(cs, alloc);
            return;
        }
    }

    let mut ext = ExtentVal::new();
    alloc_sectors_append_ptrs(&mut ext, &alloc);
    ext.crc = Some(Crc::of(&data));
    let new = Bkey::new(pos(dc.inode, sector + total), total as u32, Bval::Extent(ext));

    let trans = BtreeTrans::new(cs);
    let iter = trans.iter(BtreeId::Extents, new.start(), 1);
    match update::btree_insert_replace(&trans, iter.idx, check_key, new) {
        Ok(true) => trace!("promoted {sector}+{total} sectors"),
        Ok(false) => debug!("promote raced a foreground write, dropping"),
        Err(e) => debug!("promote insert failed: {e}"),
    }
    drop(iter);
    alloc_sectors_done(cs, alloc);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_io_extends_runs() {
        let mut r = RecentIo::new();
        let mut run = 0;
        for i in 0..4 {
            run = r.note(i * 8, 8);
        }
        assert_eq!(run, 4 * 8 * 512);

        // A non-contiguous I/O starts a fresh run.
        assert_eq!(r.note(1000, 8), 8 * 512);
    }

    #[test]
    fn recent_io_tracks_parallel_streams() {
        let mut r = RecentIo::new();
        for i in 0..3 {
            r.note(i * 8, 8);
            r.note(10_000 + i * 8, 8);
        }
        assert_eq!(r.note(3 * 8, 8), 4 * 8 * 512);
        assert_eq!(r.note(10_000 + 3 * 8, 8), 4 * 8 * 512);
    }

    #[test]
    fn recent_io_lru_replacement() {
        let mut r = RecentIo::new();
        for i in 0..(RECENT_IO as u64 + 10) {
            r.note(i * 1_000_000, 8);
        }
        // Oldest entries were replaced; a successor of one of them starts
        // a new run rather than extending.
        assert_eq!(r.note(8, 8), 8 * 512);
    }

    #[test]
    fn task_hint_ewma() {
        let t = TaskHint::default();
        t.sequential_io_avg.store(0, Ordering::Relaxed);
        let avg = ewma_add(t.sequential_io_avg.load(Ordering::Relaxed), 1 << 20, 3);
        assert_eq!(avg, 1 << 17);
    }
}
