//! Open buckets and write points.
//!
//! A write point batches writes of related data into the same bucket(s) to
//! keep fragmentation down. It holds one open bucket per replica, on
//! distinct devices; sector ranges are handed out front to back, and a
//! bucket is released back to normal bookkeeping once its last sector is
//! spoken for and its pin drops.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;
use parking_lot::{Mutex, RwLock};

use crate::alloc::{bucket_alloc, Reserve};
use crate::errcode::Result;
use crate::extents::{ExtentVal, Ptr, MAX_PTRS};
use crate::super_block::CacheSet;

#[derive(Debug, Clone, Copy)]
pub struct OpenBucket {
    pub dev: u8,
    pub bucket: u64,
    pub gen: u8,
    /// Next free absolute sector within the bucket.
    pub offset: u64,
    pub sectors_free: u32,
}

#[derive(Default)]
struct WritePointState {
    obs: Vec<OpenBucket>,
}

/// A long-lived allocation cursor; the cache set keeps a small pool of
/// these plus dedicated ones for writeback and moving GC.
pub struct WritePoint {
    state: Mutex<WritePointState>,
    pub reserve: Reserve,
}

impl WritePoint {
    pub fn new(reserve: Reserve) -> WritePoint {
        WritePoint {
            state: Mutex::new(WritePointState::default()),
            reserve,
        }
    }
}

/// Result of one sector allocation: the granted length and one pointer per
/// replica. Pointers are exclusive to the caller as soon as they are
/// returned.
#[derive(Debug)]
pub struct SectorAlloc {
    pub sectors: u32,
    pub ptrs: Vec<Ptr>,
    /// Buckets this allocation filled; unpinned in `alloc_sectors_done`.
    full: Vec<(u8, u64)>,
}

/// Round-robin replica placement across the devices of a tier group.
pub struct CacheGroup {
    devs: RwLock<Vec<u8>>,
    next: AtomicUsize,
}

impl CacheGroup {
    pub fn new() -> CacheGroup {
        CacheGroup {
            devs: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    pub fn add(&self, dev: u8) {
        self.devs.write().push(dev);
    }

    pub fn remove(&self, dev: u8) {
        self.devs.write().retain(|&d| d != dev);
    }

    pub fn len(&self) -> usize {
        self.devs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next device not in `exclude`, preferring lower tiers.
    pub fn pick(&self, cs: &CacheSet, exclude: &[u8]) -> Option<u8> {
        let devs = self.devs.read();
        if devs.is_empty() {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut best: Option<(u8, u8)> = None;
        for i in 0..devs.len() {
            let dev = devs[(start + i) % devs.len()];
            if exclude.contains(&dev) {
                continue;
            }
            let Some(ca) = cs.cache(dev) else { continue };
            let tier = ca.tier();
            match best {
                Some((_, best_tier)) if best_tier <= tier => {}
                _ => best = Some((dev, tier)),
            }
        }
        best.map(|(dev, _)| dev)
    }
}

impl Default for CacheGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Ensure `wp` has an open bucket per replica and grant up to `nr_sectors`
/// from each. The grant covers at least one sector.
pub fn alloc_sectors_start(
    cs: &CacheSet,
    wp: &WritePoint,
    nr_replicas: usize,
    nr_sectors: u32,
    wait: bool,
) -> Result<SectorAlloc> {
    assert!(nr_replicas >= 1 && nr_replicas <= MAX_PTRS);
    let mut st = wp.state.lock();

    // Drop open buckets whose generation moved underneath us (device
    // forced them stale) or that are already full.
    st.obs.retain(|ob| {
        let live = cs
            .cache(ob.dev)
            .map_or(false, |ca| ca.gens.get(ob.bucket) == ob.gen && ob.sectors_free > 0);
        if !live {
            if let Some(ca) = cs.cache(ob.dev) {
                crate::alloc::bucket_unalloc(&ca, ob.bucket);
            }
        }
        live
    });

    while st.obs.len() < nr_replicas {
        let exclude: Vec<u8> = st.obs.iter().map(|ob| ob.dev).collect();
        let Some(dev) = cs.group.pick(cs, &exclude) else {
            return Err(crate::errcode::ErrCode::NoSpace);
        };
        let ca = cs.cache(dev).ok_or(crate::errcode::ErrCode::NoDev)?;
        let bucket = bucket_alloc(cs, &ca, wp.reserve, wait)?;
        let gen = ca.gens.get(bucket);
        st.obs.push(OpenBucket {
            dev,
            bucket,
            gen,
            offset: bucket * ca.bucket_size as u64,
            sectors_free: ca.bucket_size,
        });
        trace!("write point: opened bucket {bucket} gen {gen} on dev {dev}");
    }

    let sectors = st.obs[..nr_replicas]
        .iter()
        .map(|ob| ob.sectors_free)
        .min()
        .unwrap()
        .min(nr_sectors);
    debug_assert!(sectors > 0);

    let mut ptrs = Vec::with_capacity(nr_replicas);
    let mut full = Vec::new();
    for ob in st.obs[..nr_replicas].iter_mut() {
        ptrs.push(Ptr {
            dev: ob.dev,
            gen: ob.gen,
            offset: ob.offset,
        });
        ob.offset += sectors as u64;
        ob.sectors_free -= sectors;
        if ob.sectors_free == 0 {
            full.push((ob.dev, ob.bucket));
        }
    }
    st.obs.retain(|ob| ob.sectors_free > 0);

    Ok(SectorAlloc { sectors, ptrs, full })
}

/// Emit the allocation's pointers into an extent value.
pub fn alloc_sectors_append_ptrs(e: &mut ExtentVal, alloc: &SectorAlloc) {
    for ptr in &alloc.ptrs {
        e.push_ptr(*ptr);
    }
}

/// Release buckets the allocation filled: drop their pins so the sector
/// accounting (done by the key insert) takes over ownership.
pub fn alloc_sectors_done(cs: &CacheSet, alloc: SectorAlloc) {
    for (dev, bucket) in alloc.full {
        if let Some(ca) = cs.cache(dev) {
            crate::alloc::bucket_unalloc(&ca, bucket);
        }
    }
}

/// Tear down a write point, returning any open buckets to the allocator.
pub fn write_point_release(cs: &CacheSet, wp: &WritePoint) {
    let mut st = wp.state.lock();
    for ob in st.obs.drain(..) {
        if let Some(ca) = cs.cache(ob.dev) {
            crate::alloc::bucket_unalloc(&ca, ob.bucket);
        }
    }
}
