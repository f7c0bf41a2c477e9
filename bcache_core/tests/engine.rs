//! End-to-end scenarios over a memory-backed cache set.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bcache_core::bkey::{pos, BtreeId};
use bcache_core::btree::iter::BtreeTrans;
use bcache_core::io::{Bio, BlockDevice, SECTOR_SIZE};
use bcache_core::request::cached_dev_submit_bio;
use bcache_core::super_block::{BDevState, CacheSet, CachedDev};
use bcache_core::MemDevice;

const BUCKET_SECTORS: u32 = 128; // 64 KiB buckets
const CACHE_BUCKETS: u64 = 256;
const BACKING_SECTORS: u64 = 1 << 16;

struct Rig {
    cs: Arc<CacheSet>,
    dc: Arc<CachedDev>,
    cache_dev: Arc<MemDevice>,
    backing_dev: Arc<MemDevice>,
}

impl Rig {
    fn new() -> Rig {
        Self::with_cache_capacity(bcache_core::btree::cache::DEFAULT_CAPACITY)
    }

    fn with_cache_capacity(capacity: usize) -> Rig {
        let cache_dev = Arc::new(MemDevice::new(CACHE_BUCKETS * BUCKET_SECTORS as u64));
        let backing_dev = Arc::new(MemDevice::new(BACKING_SECTORS));
        let cs = CacheSet::create(
            vec![cache_dev.clone() as Arc<dyn BlockDevice>],
            BUCKET_SECTORS,
            capacity,
        )
        .unwrap();
        let dc = CacheSet::attach(&cs, backing_dev.clone() as Arc<dyn BlockDevice>, "backing0")
            .unwrap();
        Rig { cs, dc, cache_dev, backing_dev }
    }

    fn write(&self, sector: u64, data: &[u8]) {
        let mut bio = Bio::write(sector, data.to_vec());
        cached_dev_submit_bio(&self.cs, &self.dc, &mut bio, None).unwrap();
    }

    fn read(&self, sector: u64, nr_sectors: u32) -> Vec<u8> {
        let mut bio = Bio::read(sector, nr_sectors);
        cached_dev_submit_bio(&self.cs, &self.dc, &mut bio, None).unwrap();
        bio.data
    }

    fn raw_backing(&self, sector: u64, nr_sectors: u32) -> Vec<u8> {
        let mut bio = Bio::read(sector, nr_sectors);
        self.backing_dev.submit(&mut bio).unwrap();
        bio.data
    }

    fn check_bucket_partition(&self) {
        for ca in self.cs.caches_iter() {
            let stats = ca.bucket_stats();
            assert_eq!(stats.total(), ca.nbuckets);
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.cs.stop();
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn dirty_bucket_count(cs: &CacheSet) -> u64 {
    cs.caches_iter().iter().map(|ca| ca.bucket_stats().dirty).sum()
}

#[test]
fn writeback_then_read() {
    let rig = Rig::new();
    rig.dc.opts.set("cache_mode", "writeback").unwrap();
    rig.dc.opts.set("writeback_running", "0").unwrap();

    let data = pattern(64 << 10, 3);
    rig.write(0, &data);

    let misses_before = rig.cs.stats.cache_misses.load(Ordering::Relaxed);
    let got = rig.read(0, 128);
    assert_eq!(got, data);

    assert_eq!(rig.dc.state(), BDevState::Dirty);
    assert!(dirty_bucket_count(&rig.cs) >= 1);
    assert_eq!(
        rig.cs.stats.cache_misses.load(Ordering::Relaxed),
        misses_before,
        "read of just-written data must not miss"
    );

    // Writeback mode: the backing device hasn't seen the data yet.
    assert_ne!(rig.raw_backing(0, 128), data);
    rig.check_bucket_partition();
}

#[test]
fn sequential_bypass() {
    let rig = Rig::new();
    rig.dc.opts.set("sequential_cutoff", &(256u64 << 10).to_string()).unwrap();

    for i in 0..10u64 {
        let data = pattern(64 << 10, i as u8);
        rig.write(i * 128, &data);
    }

    let seq = rig.cs.stats.bypass_sequential.load(Ordering::Relaxed);
    assert!(seq >= 7, "expected >= 7 sequential bypasses, got {seq}");

    // Regardless of path, reads return what was written.
    for i in 0..10u64 {
        assert_eq!(rig.read(i * 128, 128), pattern(64 << 10, i as u8));
    }
}

#[test]
fn stale_pointer_retry() {
    let rig = Rig::new();
    // Writethrough: data lands in cache and on backing.
    let data = pattern(64 << 10, 7);
    rig.write(0, &data);

    // Find the cached extent's pointer.
    let ptr = {
        let trans = BtreeTrans::new(&rig.cs);
        let mut iter = trans.iter(BtreeId::Extents, pos(rig.dc.inode, 0), 0);
        let k = iter.peek().unwrap().expect("cached extent");
        k.extent().expect("extent").ptrs[0]
    };
    let ca = rig.cs.cache(ptr.dev).unwrap();
    let bucket = ca.bucket_of(ptr.offset);

    // Slow the cache read down, then reuse the bucket mid-flight.
    rig.cache_dev.set_delay_us(30_000);
    let ca2 = ca.clone();
    let bumper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        let mut buckets = ca2.buckets.write();
        let b = &mut buckets[bucket as usize];
        b.gen = b.gen.wrapping_add(1);
        let gen = b.gen;
        drop(buckets);
        ca2.gens.set(bucket, gen);
    });

    let races_before = rig.cs.stats.cache_read_races.load(Ordering::Relaxed);
    let got = rig.read(0, 128);
    bumper.join().unwrap();
    rig.cache_dev.set_delay_us(0);

    assert_eq!(got, data, "fallback must serve the backing copy");
    let races = rig.cs.stats.cache_read_races.load(Ordering::Relaxed);
    assert!(races > races_before, "stale race must be counted");
}

#[test]
fn cannibalize_under_pressure() {
    let rig = Rig::new();
    rig.dc.opts.set("sequential_cutoff", "0").unwrap();

    // Grow the extents tree well past one leaf.
    for i in 0..600u64 {
        let data = pattern(4 << 10, i as u8);
        rig.write(i * 8, &data);
    }

    // Detach data from most of the tree, then clamp capacity so the next
    // fill cannot allocate without reclaiming a live node.
    rig.cs.node_cache.set_reserve(4);
    rig.cs.node_cache.shrinker_scan(&rig.cs, usize::MAX);
    rig.cs.node_cache.shrinker_scan(&rig.cs, usize::MAX);
    let used = rig.cs.node_cache.used();
    rig.cs.node_cache.set_capacity(used);

    // Lookups repopulate evicted nodes; allocation has to go through the
    // cannibalize path and must not surface NoMem.
    for i in (0..600u64).step_by(97) {
        let got = rig.read(i * 8, 8);
        assert_eq!(got, pattern(4 << 10, i as u8));
    }
}

#[test]
fn writeback_overlap_forces_writeback() {
    let rig = Rig::new();
    rig.dc.opts.set("cache_mode", "writearound").unwrap();
    rig.dc.opts.set("writeback_running", "0").unwrap();

    // A dirty key pending writeback over sectors (0, 128].
    let mut e = bcache_core::extents::ExtentVal::new();
    e.push_ptr(bcache_core::extents::Ptr { dev: 0, gen: 0, offset: 0 });
    e.dirty = true;
    let pending = bcache_core::Bkey::new(
        pos(rig.dc.inode, 128),
        128,
        bcache_core::Bval::Extent(e),
    );
    rig.dc.keybuf.add(pending);

    // Foreground write overlapping it: would bypass (writearound), must be
    // upgraded to writeback instead.
    let data = pattern(64 << 10, 9);
    rig.write(64, &data);

    assert!(rig.dc.keybuf.is_empty(), "unstarted overlap key must be dropped");
    assert!(rig.dc.dirty_sectors() >= 128, "write must have gone to cache as dirty");
    assert!(
        rig.raw_backing(64, 128).iter().all(|&b| b == 0),
        "writeback upgrade must not touch the backing device"
    );
    assert_eq!(rig.read(64, 128), data);
}

#[test]
fn shrinker_respects_reserve() {
    let rig = Rig::new();
    rig.dc.opts.set("sequential_cutoff", "0").unwrap();

    // Populate a few dozen nodes.
    for i in 0..4000u64 {
        let data = pattern(4 << 10, i as u8);
        rig.write(i * 8, &data);
    }
    let populated = rig.cs.node_cache.used();
    assert!(populated >= 40, "tree too small for the test: {populated} nodes");

    rig.cs.node_cache.set_reserve(32);
    // Two passes: the first clears accessed bits, the second reclaims.
    rig.cs.node_cache.shrinker_scan(&rig.cs, usize::MAX);
    rig.cs.node_cache.shrinker_scan(&rig.cs, usize::MAX);

    let used = rig.cs.node_cache.used();
    assert!(used >= 32, "shrinker went below the reserve: {used}");
    assert!(used < populated, "shrinker freed nothing");

    // And the tree still works.
    let got = rig.read(0, 8);
    assert_eq!(got, pattern(4 << 10, 0));
}

#[test]
fn overlapping_writes_roundtrip() {
    let rig = Rig::new();
    let a = pattern(64 << 10, 1);
    let b = pattern(64 << 10, 2);

    rig.write(0, &a);
    rig.write(64, &b); // overlaps the second half of `a`

    let got = rig.read(0, 192);
    assert_eq!(&got[..64 * SECTOR_SIZE], &a[..64 * SECTOR_SIZE]);
    assert_eq!(&got[64 * SECTOR_SIZE..], &b[..]);
    rig.check_bucket_partition();
}

#[test]
fn insert_same_extent_twice_is_absorbed() {
    let rig = Rig::new();
    let data = pattern(32 << 10, 5);
    rig.write(0, &data);
    rig.write(0, &data);

    // Exactly one live extent covers the range.
    let trans = BtreeTrans::new(&rig.cs);
    let mut iter = trans.iter(BtreeId::Extents, pos(rig.dc.inode, 0), 0);
    let mut live = 0;
    while let Some(k) = iter.peek().unwrap() {
        if k.p.inode != rig.dc.inode {
            break;
        }
        assert!(k.is_extent());
        live += 1;
        iter.advance(&k);
    }
    assert_eq!(live, 1);
    assert_eq!(rig.read(0, 64), data);
}

#[test]
fn background_writeback_cleans() {
    let rig = Rig::new();
    rig.dc.opts.set("cache_mode", "writeback").unwrap();

    let data = pattern(64 << 10, 11);
    rig.write(0, &data);
    assert!(rig.dc.dirty_sectors() > 0);

    let deadline = Instant::now() + Duration::from_secs(10);
    while rig.dc.dirty_sectors() > 0 {
        assert!(Instant::now() < deadline, "writeback did not drain");
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(rig.raw_backing(0, 128), data);
    let deadline = Instant::now() + Duration::from_secs(10);
    while rig.dc.state() != BDevState::Clean {
        assert!(Instant::now() < deadline, "state never returned to clean");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn bypassed_write_invalidates_cached_copy() {
    let rig = Rig::new();
    let a = pattern(64 << 10, 1);
    rig.write(0, &a); // writethrough: cached + on backing

    rig.dc.opts.set("cache_mode", "writearound").unwrap();
    let b = pattern(64 << 10, 2);
    rig.write(0, &b); // bypass: backing only, cached copy dropped

    assert_eq!(rig.read(0, 128), b, "stale cached copy must not be served");
}

#[test]
fn detach_completes_on_last_put() {
    let rig = Rig::new();
    assert!(rig.dc.get());
    rig.dc.request_detach();
    assert!(!rig.dc.detached(), "detach must wait for in-flight requests");

    // New I/O is refused while detaching.
    let mut bio = Bio::read(0, 8);
    assert!(cached_dev_submit_bio(&rig.cs, &rig.dc, &mut bio, None).is_err());

    rig.dc.put();
    assert!(rig.dc.detached());
}

#[test]
fn extents_iterate_sorted_and_disjoint() {
    let rig = Rig::new();
    // Interleaved, overlapping writes at various offsets.
    for i in 0..300u64 {
        let at = (i * 37) % 2048;
        let data = pattern(8 << 9, i as u8);
        rig.write(at * 8, &data);
    }

    let trans = BtreeTrans::new(&rig.cs);
    let mut iter = trans.iter(BtreeId::Extents, pos(rig.dc.inode, 0), 0);
    let mut prev_end = 0u64;
    while let Some(k) = iter.peek().unwrap() {
        if k.p.inode != rig.dc.inode {
            break;
        }
        assert!(
            k.start().offset >= prev_end,
            "extents overlap: {:?} starts before {prev_end}",
            k
        );
        assert!(k.p.offset > k.start().offset);
        prev_end = k.p.offset;
        iter.advance(&k);
    }
    rig.check_bucket_partition();
}

#[test]
fn fault_injection_is_absorbed_by_retry() {
    let rig = Rig::new();
    rig.dc.opts.set("sequential_cutoff", "0").unwrap();
    for i in 0..600u64 {
        rig.write(i * 8, &pattern(4 << 10, i as u8));
    }

    // Evict everything evictable so lookups go through fill/get, then make
    // every third node verification fail.
    rig.cs.node_cache.set_reserve(4);
    rig.cs.node_cache.shrinker_scan(&rig.cs, usize::MAX);
    rig.cs.node_cache.shrinker_scan(&rig.cs, usize::MAX);
    rig.cs.set_verify_fail_every(3);

    for i in (0..600u64).step_by(41) {
        assert_eq!(rig.read(i * 8, 8), pattern(4 << 10, i as u8));
    }
    rig.cs.set_verify_fail_every(0);
}

#[test]
fn moving_gc_relocates_fragmented_buckets() {
    let rig = Rig::new();
    rig.cs.opts.set("copy_gc_enabled", "1").unwrap();

    // Fill one bucket, then overwrite most of it: the full bucket is left
    // holding a small remnant, unpinned and fragmented.
    let a = pattern(64 << 10, 1);
    rig.write(0, &a);
    let b = pattern(60 << 10, 2);
    rig.write(0, &b);

    let moved = bcache_core::movinggc::moving_gc_once(&rig.cs).unwrap();
    assert!(moved >= 1, "remnant extent not relocated");

    let got = rig.read(0, 128);
    assert_eq!(&got[..120 * SECTOR_SIZE], &b[..]);
    assert_eq!(&got[120 * SECTOR_SIZE..], &a[120 * SECTOR_SIZE..]);
    rig.check_bucket_partition();
}

#[cfg(feature = "promote")]
#[test]
fn read_miss_promotes_into_cache() {
    let rig = Rig::new();
    // Seed the backing device directly; the cache knows nothing.
    let data = pattern(64 << 10, 13);
    let mut bio = Bio::write(0, data.clone());
    rig.backing_dev.submit(&mut bio).unwrap();

    assert_eq!(rig.read(0, 128), data); // miss + promote
    let hits_before = rig.cs.stats.cache_hits.load(Ordering::Relaxed);
    assert_eq!(rig.read(0, 128), data); // now a hit
    assert!(rig.cs.stats.cache_hits.load(Ordering::Relaxed) > hits_before);
}
