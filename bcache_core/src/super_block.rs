// SPDX-License-Identifier: GPL-2.0

//! Cache-set assembly: cache devices, backing devices, roots, lifecycle.
//!
//! A `CacheSet` exclusively owns its node cache, allocator threads, write
//! points and journal. Backing devices (`CachedDev`) borrow refcounted
//! handles per request; a detach requested while I/O is in flight completes
//! on the last put.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use uuid::Uuid;

use crate::alloc::{allocator_thread, bucket_alloc, DeviceAlloc, Reserve};
use crate::bkey::{Bkey, Bpos, BtreeId, Bval, InodeVal, BTREE_ID_NR, POS_MAX};
use crate::bset::{Bset, NodeKeys};
use crate::btree::cache::NodeCache;
use crate::btree::{io as btree_io, BtreeNode, NodeData, NodeFlags};
use crate::buckets::{Bucket, BucketDataType, BucketGens, BucketStats, PrioClock, READ, WRITE};
use crate::closure::WorkerPool;
use crate::errcode::{ErrCode, Result};
use crate::extents::{PickResult, Ptr};
use crate::io::{Bio, BlockDevice, IoErrorAccounting};
use crate::journal::MemJournal;
use crate::opts::{CacheReplacementPolicy, CacheSetOpts, CachedDevOpts};
use crate::six::SixLockType;
use crate::stats::CacheStats;
use crate::util::monotonic_us;
use crate::writeback::{writeback_thread, Keybuf};
use crate::writepoint::{CacheGroup, WritePoint};

pub const FIRST_BUCKET: u64 = 1;

/// One cache device: bucket records, generations, allocator state.
pub struct Cache {
    pub dev_idx: u8,
    pub bdev: Arc<dyn BlockDevice>,
    pub nbuckets: u64,
    /// Bucket size in sectors; also the btree node size.
    pub bucket_size: u32,
    pub first_bucket: u64,
    pub gens: BucketGens,
    pub buckets: RwLock<Vec<Bucket>>,
    pub prio_clocks: Mutex<[PrioClock; 2]>,
    pub alloc: DeviceAlloc,
    pub discard: AtomicBool,
    pub replacement: Mutex<CacheReplacementPolicy>,
    tier: AtomicU8,
    err_acct: IoErrorAccounting,
    congested_until_us: AtomicU64,
    read_ticks: AtomicU64,
}

impl Cache {
    pub fn new(dev_idx: u8, bdev: Arc<dyn BlockDevice>, bucket_size: u32) -> Cache {
        let nbuckets = bdev.size_sectors() / bucket_size as u64;
        Cache {
            dev_idx,
            bdev,
            nbuckets,
            bucket_size,
            first_bucket: FIRST_BUCKET,
            gens: BucketGens::new(nbuckets),
            buckets: RwLock::new(vec![Bucket::new(); nbuckets as usize]),
            prio_clocks: Mutex::new([PrioClock::default(), PrioClock::default()]),
            alloc: DeviceAlloc::new(nbuckets),
            discard: AtomicBool::new(false),
            replacement: Mutex::new(CacheReplacementPolicy::Lru),
            tier: AtomicU8::new(0),
            err_acct: IoErrorAccounting::new(),
            congested_until_us: AtomicU64::new(0),
            read_ticks: AtomicU64::new(0),
        }
    }

    pub fn bucket_of(&self, sector: u64) -> u64 {
        sector / self.bucket_size as u64
    }

    pub fn ptr_stale(&self, ptr: &Ptr) -> bool {
        self.gens.get(self.bucket_of(ptr.offset)) != ptr.gen
    }

    pub fn tier(&self) -> u8 {
        self.tier.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        // Half-life handled at count time; this is just the level.
        self.err_acct.level(0)
    }

    /// Record a completion latency; a slow one marks the device congested
    /// for a short window (used by pointer picking).
    pub fn note_latency(&self, latency_us: u64, threshold_us: u64) {
        if threshold_us > 0 && latency_us > threshold_us {
            self.congested_until_us
                .store(monotonic_us() + 100_000, Ordering::Relaxed);
        }
    }

    pub fn congested(&self) -> bool {
        monotonic_us() < self.congested_until_us.load(Ordering::Relaxed)
    }

    pub fn count_io_error(&self, cs: &CacheSet) {
        let halflife = cs.opts.io_error_halflife_us.load(Ordering::Relaxed);
        let limit = cs.opts.io_error_limit.load(Ordering::Relaxed);
        let level = self.err_acct.count_error(halflife);
        warn!("cache device {}: I/O error ({level}/{limit})", self.dev_idx);
        if level >= limit {
            error!("cache device {}: too many I/O errors, setting read-only", self.dev_idx);
            cs.set_inconsistent();
        }
    }

    /// Bump the bucket's read priority and occasionally advance the clock.
    pub fn touch_read(&self, bucket: u64) {
        {
            let mut buckets = self.buckets.write();
            let clocks = self.prio_clocks.lock();
            clocks[READ].touch(READ, &mut buckets[bucket as usize]);
        }
        if self.read_ticks.fetch_add(1, Ordering::Relaxed) % 128 == 127 {
            let mut buckets = self.buckets.write();
            let mut clocks = self.prio_clocks.lock();
            clocks[READ].tick(READ, &mut buckets);
        }
    }

    pub fn touch_write(&self, bucket: u64) {
        let mut buckets = self.buckets.write();
        let clocks = self.prio_clocks.lock();
        clocks[WRITE].touch(WRITE, &mut buckets[bucket as usize]);
    }

    pub fn bucket_stats(&self) -> BucketStats {
        let buckets = self.buckets.read();
        let stats = BucketStats::collect(&buckets);
        stats.assert_partition(self.nbuckets);
        stats
    }

    pub fn set_option(&self, key: &str, val: &str) -> Result<()> {
        match key {
            "discard" => {
                let v = matches!(val, "1" | "true" | "on");
                self.discard.store(v, Ordering::Relaxed);
            }
            "cache_replacement_policy" => {
                let p: CacheReplacementPolicy = val.parse().map_err(|_| ErrCode::IO)?;
                *self.replacement.lock() = p;
            }
            "tier" => {
                let t: u8 = val.parse().map_err(|_| ErrCode::IO)?;
                if t >= crate::opts::TIER_MAX {
                    return Err(ErrCode::IO);
                }
                self.tier.store(t, Ordering::Relaxed);
            }
            _ => return Err(ErrCode::IO),
        }
        Ok(())
    }
}

/// Backing-device states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BDevState {
    NoCache,
    Clean,
    Dirty,
    Inconsistent,
}

impl BDevState {
    fn to_u8(self) -> u8 {
        match self {
            BDevState::NoCache => 0,
            BDevState::Clean => 1,
            BDevState::Dirty => 2,
            BDevState::Inconsistent => 3,
        }
    }

    fn from_u8(v: u8) -> BDevState {
        match v {
            0 => BDevState::NoCache,
            1 => BDevState::Clean,
            2 => BDevState::Dirty,
            _ => BDevState::Inconsistent,
        }
    }
}

/// A backing device attached to the cache set.
pub struct CachedDev {
    pub uuid: Uuid,
    pub label: String,
    /// Key of this device's extents in the extents btree.
    pub inode: u64,
    pub bdev: Arc<dyn BlockDevice>,
    pub opts: CachedDevOpts,
    pub keybuf: Keybuf,
    /// Foreground writes shared, writeback refill exclusive.
    pub writeback_lock: RwLock<()>,
    pub recent_io: Mutex<crate::request::RecentIo>,
    dirty_sectors: AtomicU64,
    state: AtomicU8,
    refs: AtomicUsize,
    detach_requested: AtomicBool,
    detached: AtomicBool,
    err_acct: IoErrorAccounting,
    wb_lock: Mutex<()>,
    wb_wait: Condvar,
}

impl CachedDev {
    fn new(uuid: Uuid, label: String, inode: u64, bdev: Arc<dyn BlockDevice>) -> CachedDev {
        CachedDev {
            uuid,
            label,
            inode,
            bdev,
            opts: CachedDevOpts::new(),
            keybuf: Keybuf::new(),
            writeback_lock: RwLock::new(()),
            recent_io: Mutex::new(crate::request::RecentIo::new()),
            dirty_sectors: AtomicU64::new(0),
            state: AtomicU8::new(BDevState::Clean.to_u8()),
            refs: AtomicUsize::new(0),
            detach_requested: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            err_acct: IoErrorAccounting::new(),
            wb_lock: Mutex::new(()),
            wb_wait: Condvar::new(),
        }
    }

    /// Take a request reference. Fails once detach has been requested.
    /// The full barrier pairs with the decrement in `put`.
    pub fn get(&self) -> bool {
        self.refs.fetch_add(1, Ordering::SeqCst);
        if self.detach_requested.load(Ordering::SeqCst) {
            self.put();
            return false;
        }
        true
    }

    pub fn put(&self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1
            && self.detach_requested.load(Ordering::SeqCst)
        {
            self.finish_detach();
        }
    }

    pub fn request_detach(&self) {
        self.detach_requested.store(true, Ordering::SeqCst);
        if self.refs.load(Ordering::SeqCst) == 0 {
            self.finish_detach();
        }
    }

    fn finish_detach(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            info!("backing device {} (inode {}) detached", self.label, self.inode);
            self.set_state(BDevState::NoCache);
            self.wake_writeback();
        }
    }

    pub fn detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn detaching(&self) -> bool {
        self.detach_requested.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> BDevState {
        BDevState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, s: BDevState) {
        self.state.store(s.to_u8(), Ordering::SeqCst);
    }

    pub fn dirty_sectors(&self) -> u64 {
        self.dirty_sectors.load(Ordering::Relaxed)
    }

    pub fn add_dirty(&self, sectors: u64) {
        self.dirty_sectors.fetch_add(sectors, Ordering::Relaxed);
        if self.state() == BDevState::Clean {
            self.set_state(BDevState::Dirty);
        }
        self.wake_writeback();
    }

    pub fn sub_dirty(&self, sectors: u64) {
        let mut cur = self.dirty_sectors.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_sub(sectors);
            match self.dirty_sectors.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => cur = v,
            }
        }
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.bdev.size_sectors()
    }

    pub fn writeback_wait(&self, d: Duration) {
        let mut guard = self.wb_lock.lock();
        self.wb_wait.wait_for(&mut guard, d);
    }

    pub fn wake_writeback(&self) {
        self.wb_wait.notify_all();
    }

    pub fn count_io_error(&self, cs: &CacheSet) {
        let halflife = cs.opts.io_error_halflife_us.load(Ordering::Relaxed);
        let limit = cs.opts.io_error_limit.load(Ordering::Relaxed);
        let level = self.err_acct.count_error(halflife);
        warn!("backing device {}: I/O error ({level}/{limit})", self.label);
        if level >= limit {
            self.set_state(BDevState::Inconsistent);
        }
    }
}

struct RootEntry {
    node: Arc<BtreeNode>,
    level: u8,
}

/// Cache-set wide congestion: a signed fixed-point value pushed negative by
/// slow completions and decayed back toward zero by wall-clock time.
pub struct Congestion {
    val: Mutex<i64>,
    last_us: AtomicU64,
}

const CONGESTED_MAX: i64 = 1024;

impl Congestion {
    fn new() -> Congestion {
        Congestion {
            val: Mutex::new(0),
            last_us: AtomicU64::new(monotonic_us()),
        }
    }

    pub fn add(&self, over_us: u64) {
        let mut v = self.val.lock();
        *v = (*v - over_us as i64).max(-CONGESTED_MAX);
    }

    /// 0 = not congested; otherwise a magnitude compared against request
    /// size by the bypass check.
    pub fn get(&self) -> u64 {
        let now = monotonic_us();
        let last = self.last_us.swap(now, Ordering::Relaxed);
        let elapsed = now.saturating_sub(last) as i64;

        let mut v = self.val.lock();
        *v = (*v + elapsed / 1024).min(0);
        if *v == 0 {
            0
        } else {
            (-*v) as u64
        }
    }
}

pub const NR_WRITE_POINTS: usize = 8;

pub struct CacheSet {
    pub uuid: Uuid,
    pub journal: MemJournal,
    pub node_cache: NodeCache,
    pub stats: CacheStats,
    pub opts: CacheSetOpts,
    pub group: CacheGroup,
    pub congestion: Congestion,
    pub pool: Arc<WorkerPool>,
    caches: RwLock<Vec<Option<Arc<Cache>>>>,
    cached_devs: RwLock<Vec<Arc<CachedDev>>>,
    btree_roots: Vec<Mutex<Option<RootEntry>>>,
    write_points: Vec<WritePoint>,
    pub moving_gc_wp: WritePoint,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
    read_only: AtomicBool,
    next_inode: AtomicU64,
    /// Fault injection: every Nth cached-node verification fails (0 = off).
    verify_fail_every: AtomicU32,
    verify_counter: AtomicU32,
}

impl CacheSet {
    /// Build and start a cache set over `devices`, formatting empty btrees.
    pub fn create(
        devices: Vec<Arc<dyn BlockDevice>>,
        bucket_size: u32,
        node_cache_capacity: usize,
    ) -> Result<Arc<CacheSet>> {
        assert!(!devices.is_empty());

        let cs = Arc::new(CacheSet {
            uuid: Uuid::new_v4(),
            journal: MemJournal::new(),
            node_cache: NodeCache::new(node_cache_capacity),
            stats: CacheStats::new(),
            opts: CacheSetOpts::new(),
            group: CacheGroup::new(),
            congestion: Congestion::new(),
            pool: WorkerPool::new(4, "bcache-wq"),
            caches: RwLock::new(Vec::new()),
            cached_devs: RwLock::new(Vec::new()),
            btree_roots: (0..BTREE_ID_NR).map(|_| Mutex::new(None)).collect(),
            write_points: (0..NR_WRITE_POINTS)
                .map(|_| WritePoint::new(Reserve::None))
                .collect(),
            moving_gc_wp: WritePoint::new(Reserve::MovingGc),
            threads: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            next_inode: AtomicU64::new(1),
            verify_fail_every: AtomicU32::new(0),
            verify_counter: AtomicU32::new(0),
        });

        {
            let mut caches = cs.caches.write();
            for (i, bdev) in devices.into_iter().enumerate() {
                let ca = Arc::new(Cache::new(i as u8, bdev, bucket_size));
                if ca.nbuckets <= ca.first_bucket + 8 {
                    return Err(ErrCode::NoSpace);
                }
                caches.push(Some(ca.clone()));
                cs.group.add(i as u8);
            }
        }

        // Allocators first: formatting the roots draws from the reserves.
        for ca in cs.caches.read().iter().flatten() {
            let cs2 = cs.clone();
            let ca2 = ca.clone();
            cs.threads.lock().push(
                std::thread::Builder::new()
                    .name(format!("bcache-alloc/{}", ca.dev_idx))
                    .spawn(move || allocator_thread(cs2, ca2))
                    .expect("spawning allocator"),
            );
        }

        for i in 0..BTREE_ID_NR {
            Self::format_root(&cs, BtreeId::from_index(i))?;
        }

        info!("cache set {} ready", cs.uuid);
        Ok(cs)
    }

    fn format_root(cs: &Arc<CacheSet>, id: BtreeId) -> Result<()> {
        let node = cs.node_cache.alloc(cs, id)?;
        let ptr = cs.alloc_btree_bucket()?;
        {
            let mut meta = node.meta.lock();
            let mut e = crate::extents::ExtentVal::new();
            e.push_ptr(ptr);
            meta.key = Bkey::new(POS_MAX, 0, Bval::BtreePtr(e));
            meta.level = 0;
            meta.btree_id = id;
        }
        {
            let mut guard = node.data.write();
            *guard = Some(Box::new(NodeData {
                keys: NodeKeys { sets: vec![Bset::default()], written_sets: 0 },
                written: 0,
                node_seq: 0,
            }));
        }
        btree_io::write_node(cs, &node)?;
        let hash = BtreeNode::hash_of_key(&node.meta.lock().key).expect("root key has ptr");
        assert!(cs.node_cache.hash_insert(hash, &node));
        node.set_flag(NodeFlags::NOEVICT);
        cs.set_btree_root(id, node.clone(), 0);
        node.lock.unlock(SixLockType::Write);
        Ok(())
    }

    pub fn cache(&self, dev: u8) -> Option<Arc<Cache>> {
        self.caches.read().get(dev as usize).and_then(|c| c.clone())
    }

    pub fn caches_iter(&self) -> Vec<Arc<Cache>> {
        self.caches.read().iter().flatten().cloned().collect()
    }

    pub fn cached_devs(&self) -> Vec<Arc<CachedDev>> {
        self.cached_devs.read().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Demote to read-only; in-flight I/O surfaces errors.
    pub fn set_inconsistent(&self) {
        if !self.read_only.swap(true, Ordering::SeqCst) {
            error!("cache set {}: inconsistent, now read-only", self.uuid);
            for dc in self.cached_devs.read().iter() {
                dc.set_state(BDevState::Inconsistent);
            }
        }
    }

    // Btree roots.

    pub fn btree_root_node(&self, id: BtreeId) -> (Arc<BtreeNode>, u8) {
        let guard = self.btree_roots[id.index()].lock();
        let root = guard.as_ref().expect("btree root exists");
        (root.node.clone(), root.level)
    }

    pub fn btree_root_is(&self, id: BtreeId, node: &Arc<BtreeNode>) -> bool {
        let guard = self.btree_roots[id.index()].lock();
        guard
            .as_ref()
            .map_or(false, |r| Arc::ptr_eq(&r.node, node))
    }

    pub fn btree_root_level(&self, id: BtreeId) -> u8 {
        self.btree_roots[id.index()].lock().as_ref().map_or(0, |r| r.level)
    }

    pub fn set_btree_root(&self, id: BtreeId, node: Arc<BtreeNode>, level: u8) {
        let mut guard = self.btree_roots[id.index()].lock();
        if let Some(old) = guard.as_ref() {
            old.node.clear_flag(NodeFlags::NOEVICT);
        }
        *guard = Some(RootEntry { node, level });
        debug!("{id:?}: new root at level {level}");
    }

    pub fn btree_inject_fault(&self) -> bool {
        let every = self.verify_fail_every.load(Ordering::Relaxed);
        if every == 0 {
            return false;
        }
        self.verify_counter.fetch_add(1, Ordering::Relaxed) % every == every - 1
    }

    pub fn set_verify_fail_every(&self, every: u32) {
        self.verify_fail_every.store(every, Ordering::Relaxed);
    }

    // Bucket helpers for the btree layer.

    /// Allocate a bucket for a btree node from the btree reserve, marked
    /// and unpinned; returns the pointer to write the node through.
    pub fn alloc_btree_bucket(&self) -> Result<Ptr> {
        let dev = self.group.pick(self, &[]).ok_or(ErrCode::NoSpace)?;
        let ca = self.cache(dev).ok_or(ErrCode::NoDev)?;
        let bucket = bucket_alloc(self, &ca, Reserve::Btree, true)?;
        let gen = {
            let mut buckets = ca.buckets.write();
            let b = &mut buckets[bucket as usize];
            b.data_type = BucketDataType::Btree;
            b.pin -= 1;
            b.gen
        };
        Ok(Ptr {
            dev,
            gen,
            offset: bucket * ca.bucket_size as u64,
        })
    }

    /// A btree node died; its bucket becomes reclaimable.
    pub fn free_btree_bucket(&self, ptr: &Ptr) {
        let Some(ca) = self.cache(ptr.dev) else { return };
        let bucket = ca.bucket_of(ptr.offset);
        let mut buckets = ca.buckets.write();
        let b = &mut buckets[bucket as usize];
        if b.gen == ptr.gen {
            b.data_type = BucketDataType::None;
        }
        ca.alloc.wake_allocator();
    }

    /// Write points are sharded so unrelated writers fill unrelated
    /// buckets.
    pub fn write_point(&self, shard: u64) -> &WritePoint {
        &self.write_points[(shard % NR_WRITE_POINTS as u64) as usize]
    }

    /// Fraction of cache buckets holding no data, in percent.
    pub fn free_percent(&self) -> u64 {
        let mut free = 0u64;
        let mut total = 0u64;
        for ca in self.caches.read().iter().flatten() {
            let stats = ca.bucket_stats();
            free += stats.free + stats.open;
            total += ca.nbuckets;
        }
        if total == 0 { 0 } else { free * 100 / total }
    }

    /// Read an extent's data out of the cache, verifying generation and
    /// checksum.
    pub fn read_extent_data(&self, k: &Bkey) -> Result<Vec<u8>> {
        let e = k.extent().ok_or(ErrCode::NoDisk)?;
        let ptr = match self.extent_pick_ptr(e) {
            PickResult::Ok(ptr) => ptr,
            PickResult::Stale => return Err(ErrCode::Retry),
            _ => return Err(ErrCode::NoDisk),
        };
        let ca = self.cache(ptr.dev).ok_or(ErrCode::NoDisk)?;

        let mut bio = Bio::read(ptr.offset, k.size);
        ca.bdev.submit(&mut bio).map_err(|err| {
            ca.count_io_error(self);
            err
        })?;

        if ca.ptr_stale(&ptr) {
            return Err(ErrCode::Retry);
        }
        if let Some(crc) = &e.crc {
            if crate::util::crc64(&bio.data) != crc.csum {
                warn!("extent at {:?}: checksum mismatch", k.start());
                return Err(ErrCode::IO);
            }
        }
        ca.touch_read(ca.bucket_of(ptr.offset));
        Ok(bio.data)
    }

    // Backing devices.

    /// Attach a backing device: allocate its inode, record it in the
    /// inodes btree, start its writeback worker.
    pub fn attach(cs: &Arc<CacheSet>, bdev: Arc<dyn BlockDevice>, label: &str) -> Result<Arc<CachedDev>> {
        let inode = cs.next_inode.fetch_add(1, Ordering::SeqCst);
        let ival = InodeVal::new(bdev.size_sectors() << crate::io::SECTOR_SHIFT, label);

        {
            let trans = crate::btree::iter::BtreeTrans::new(cs);
            let iter = trans.iter(BtreeId::Inodes, Bpos { inode, offset: 0 }, 1);
            crate::btree::update::btree_insert_key(
                &trans,
                iter.idx,
                Bkey::new(Bpos { inode, offset: 0 }, 0, Bval::Inode(ival)),
            )?;
        }

        let dc = Arc::new(CachedDev::new(Uuid::new_v4(), label.to_string(), inode, bdev));
        cs.cached_devs.write().push(dc.clone());

        let cs2 = cs.clone();
        let dc2 = dc.clone();
        cs.threads.lock().push(
            std::thread::Builder::new()
                .name(format!("bcache-writeback/{inode}"))
                .spawn(move || writeback_thread(cs2, dc2))
                .expect("spawning writeback worker"),
        );

        info!("attached backing device {label} as inode {inode}");
        Ok(dc)
    }

    pub fn find_cached_dev(&self, label: &str) -> Option<Arc<CachedDev>> {
        self.cached_devs
            .read()
            .iter()
            .find(|d| d.label == label)
            .cloned()
    }

    /// Shut down: stop workers, flush dirty nodes, release write points.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("cache set {}: stopping", self.uuid);

        for ca in self.caches.read().iter().flatten() {
            ca.alloc.wake_allocator();
            ca.alloc.wake_waiters();
        }
        for dc in self.cached_devs.read().iter() {
            dc.wake_writeback();
        }

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for t in threads {
            let _ = t.join();
        }
        self.pool.shutdown();

        for wp in &self.write_points {
            crate::writepoint::write_point_release(self, wp);
        }
        crate::writepoint::write_point_release(self, &self.moving_gc_wp);
    }
}

/// Process-wide registry of running cache sets, for the admin surface.
/// Constructed once at startup and passed by reference.
pub struct Registry {
    sets: Mutex<Vec<Arc<CacheSet>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { sets: Mutex::new(Vec::new()) }
    }

    pub fn register(&self, cs: Arc<CacheSet>) {
        self.sets.lock().push(cs);
    }

    pub fn unregister(&self, uuid: &Uuid) {
        self.sets.lock().retain(|cs| cs.uuid != *uuid);
    }

    pub fn list(&self) -> Vec<Arc<CacheSet>> {
        self.sets.lock().clone()
    }

    pub fn find(&self, uuid: &Uuid) -> Option<Arc<CacheSet>> {
        self.sets.lock().iter().find(|cs| cs.uuid == *uuid).cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
