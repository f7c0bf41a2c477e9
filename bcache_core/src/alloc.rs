//! The bucket allocator.
//!
//! Each cache device has a producer thread that keeps four free-bucket
//! fifos topped up, one per reserve class. Victim buckets are chosen by the
//! device's replacement policy, pushed through `free_inc` where their
//! generation is bumped, journaled, optionally discarded, and only then
//! made allocatable: a bucket never reappears on a reserve before the
//! journal has committed that its old generation is dead.
//!
//! Callers holding critical locks allocate from `Reserve::Btree` or
//! `Reserve::Prio` so they never wait behind user I/O; `Reserve::MovingGc`
//! guarantees garbage collection can always copy data out.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::buckets::WRITE;
use crate::errcode::{ErrCode, Result};
use crate::io::Bio;
use crate::journal::JournalPayload;
use crate::opts::CacheReplacementPolicy;
use crate::super_block::{Cache, CacheSet};
use crate::util::Fifo;

pub const RESERVE_NR: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reserve {
    Prio,
    Btree,
    MovingGc,
    None,
}

impl Reserve {
    pub fn index(self) -> usize {
        match self {
            Reserve::Prio => 0,
            Reserve::Btree => 1,
            Reserve::MovingGc => 2,
            Reserve::None => 3,
        }
    }
}

pub struct AllocState {
    pub free: [Fifo<u64>; RESERVE_NR],
    pub free_inc: Fifo<u64>,
    /// FIFO replacement cursor.
    next_bucket: u64,
}

pub struct DeviceAlloc {
    pub state: Mutex<AllocState>,
    /// Waiters in `bucket_alloc`.
    bucket_wait: Condvar,
    /// The allocator thread parks here when the fifos are full or no
    /// victims exist.
    thread_wait: Condvar,
}

const RESERVE_META_SIZE: usize = 8;
const RESERVE_MOVINGGC_SIZE: usize = 8;

impl DeviceAlloc {
    pub fn new(nbuckets: u64) -> DeviceAlloc {
        let general = ((nbuckets / 8) as usize).max(16);
        DeviceAlloc {
            state: Mutex::new(AllocState {
                free: [
                    Fifo::new(RESERVE_META_SIZE),
                    Fifo::new(RESERVE_META_SIZE),
                    Fifo::new(RESERVE_MOVINGGC_SIZE),
                    Fifo::new(general),
                ],
                free_inc: Fifo::new(general),
                next_bucket: 0,
            }),
            bucket_wait: Condvar::new(),
            thread_wait: Condvar::new(),
        }
    }

    pub fn wake_allocator(&self) {
        self.thread_wait.notify_all();
    }

    pub fn wake_waiters(&self) {
        self.bucket_wait.notify_all();
    }

    /// Queue depth of each reserve, for the stats surface.
    pub fn reserve_depths(&self) -> [usize; RESERVE_NR] {
        let st = self.state.lock();
        [
            st.free[0].len(),
            st.free[1].len(),
            st.free[2].len(),
            st.free[3].len(),
        ]
    }
}

/// Pop a free bucket from the requested reserve, waiting if empty (unless
/// `wait` is false). The returned bucket is pinned; the caller owns it
/// until it unpins or assigns a data type.
pub fn bucket_alloc(cs: &CacheSet, ca: &Cache, reserve: Reserve, wait: bool) -> Result<u64> {
    loop {
        let popped = {
            let mut st = ca.alloc.state.lock();
            // The general pool first, then the class reserve.
            st.free[Reserve::None.index()]
                .pop()
                .or_else(|| st.free[reserve.index()].pop())
        };

        if let Some(bucket) = popped {
            ca.alloc.wake_allocator();
            {
                let mut buckets = ca.buckets.write();
                let b = &mut buckets[bucket as usize];
                debug_assert!(b.in_free_list && b.pin == 0);
                b.in_free_list = false;
                b.pin = 1;
                let clocks = ca.prio_clocks.lock();
                b.prio = [clocks[0].hand, clocks[1].hand];
                trace!("dev {}: allocated bucket {} gen {} reserve {:?}",
                       ca.dev_idx, bucket, b.gen, reserve);
            }
            // Handing out a bucket is one tick of write IO time.
            tick_write_clock(ca);
            return Ok(bucket);
        }

        if cs.is_shutting_down() {
            return Err(ErrCode::NoDev);
        }
        if !wait {
            return Err(ErrCode::NoSpace);
        }

        ca.alloc.wake_allocator();
        let mut st = ca.alloc.state.lock();
        if st.free[Reserve::None.index()].is_empty() && st.free[reserve.index()].is_empty() {
            ca.alloc
                .bucket_wait
                .wait_for(&mut st, Duration::from_millis(100));
        }
    }
}

/// Return a pinned, unused bucket to the allocator (error-path unwind).
pub fn bucket_unalloc(ca: &Cache, bucket: u64) {
    let mut buckets = ca.buckets.write();
    let b = &mut buckets[bucket as usize];
    debug_assert!(b.pin > 0);
    b.pin -= 1;
    ca.alloc.wake_allocator();
}

fn pick_victims(ca: &Cache, max: usize) -> Vec<u64> {
    let policy = *ca.replacement.lock();
    let buckets = ca.buckets.read();

    let candidates = || {
        (ca.first_bucket..ca.nbuckets)
            .filter(|&i| buckets[i as usize].can_invalidate())
    };

    match policy {
        CacheReplacementPolicy::Lru => {
            // Lowest read priority first: least recently touched.
            let mut v: Vec<u64> = candidates().collect();
            v.sort_by_key(|&i| buckets[i as usize].prio[crate::buckets::READ]);
            v.truncate(max);
            v
        }
        CacheReplacementPolicy::Fifo => {
            let mut st = ca.alloc.state.lock();
            let mut v = Vec::new();
            let mut scanned = 0;
            while v.len() < max && scanned < ca.nbuckets {
                let i = ca.first_bucket
                    + (st.next_bucket + scanned) % (ca.nbuckets - ca.first_bucket);
                if buckets[i as usize].can_invalidate() {
                    v.push(i);
                }
                scanned += 1;
            }
            st.next_bucket = (st.next_bucket + scanned) % (ca.nbuckets - ca.first_bucket);
            v
        }
        CacheReplacementPolicy::Random => {
            let all: Vec<u64> = candidates().collect();
            if all.is_empty() {
                return Vec::new();
            }
            let mut rng = rand::thread_rng();
            let mut v = Vec::new();
            let mut tries = 0;
            while v.len() < max.min(all.len()) && tries < all.len() * 4 {
                let pick = all[rng.gen_range(0..all.len())];
                if !v.contains(&pick) {
                    v.push(pick);
                }
                tries += 1;
            }
            v
        }
    }
}

/// One pass of the invalidate pipeline. Returns true if any bucket moved.
pub fn invalidate_buckets(cs: &CacheSet, ca: &Cache) -> bool {
    let room = {
        let st = ca.alloc.state.lock();
        st.free_inc.free()
    };
    let mut moved = false;

    if room > 0 {
        let victims = pick_victims(ca, room);
        if !victims.is_empty() {
            let mut gen_updates = Vec::with_capacity(victims.len());
            {
                let mut buckets = ca.buckets.write();
                let mut st = ca.alloc.state.lock();
                for bucket in victims {
                    let b = &mut buckets[bucket as usize];
                    if !b.can_invalidate() {
                        continue;
                    }
                    let gen = b.invalidate();
                    b.in_free_list = true;
                    ca.gens.set(bucket, gen);
                    gen_updates.push((bucket, gen));
                    st.free_inc
                        .push(bucket)
                        .expect("free_inc sized by caller");
                }
            }

            if !gen_updates.is_empty() {
                moved = true;
                let seq = cs.journal.add_entry(JournalPayload::GenUpdate {
                    dev: ca.dev_idx,
                    buckets: gen_updates,
                });
                // New generations must be durable before these buckets can
                // be handed out again.
                if let Err(e) = cs.journal.flush_seq(seq) {
                    error!("dev {}: journal write failed ({e}), going read-only", ca.dev_idx);
                    cs.set_inconsistent();
                    return false;
                }
            }
        }
    }

    // Journal has committed: promote free_inc to the reserve fifos.
    let discard = ca.discard.load(Ordering::Relaxed);
    loop {
        let bucket = {
            let mut st = ca.alloc.state.lock();
            let Some(bucket) = st.free_inc.pop() else { break };

            let target = [Reserve::Prio, Reserve::Btree, Reserve::MovingGc, Reserve::None]
                .into_iter()
                .find(|r| !st.free[r.index()].is_full());
            match target {
                Some(r) => {
                    st.free[r.index()].push(bucket).expect("checked not full");
                }
                None => {
                    // Everything is full; put it back and stop.
                    // free_inc just popped, push cannot fail.
                    st.free_inc.push(bucket).expect("just popped");
                    break;
                }
            }
            bucket
        };

        if discard && ca.bdev.supports_discard() {
            let mut bio = Bio::discard(bucket * ca.bucket_size as u64, ca.bucket_size);
            if let Err(e) = ca.bdev.submit(&mut bio) {
                debug!("dev {}: discard failed on bucket {bucket}: {e}", ca.dev_idx);
            }
        }
        moved = true;
        ca.alloc.wake_waiters();
    }

    moved
}

/// Allocator thread body, one per cache device.
pub fn allocator_thread(cs: Arc<CacheSet>, ca: Arc<Cache>) {
    debug!("dev {}: allocator running", ca.dev_idx);
    loop {
        if cs.is_shutting_down() {
            break;
        }
        let moved = invalidate_buckets(&cs, &ca);
        if !moved {
            let mut st = ca.alloc.state.lock();
            ca.alloc
                .thread_wait
                .wait_for(&mut st, Duration::from_millis(50));
        }
    }
    debug!("dev {}: allocator stopped", ca.dev_idx);
}

/// Advance the device's write clock one IO-time tick.
pub fn tick_write_clock(ca: &Cache) {
    let mut buckets = ca.buckets.write();
    let mut clocks = ca.prio_clocks.lock();
    clocks[WRITE].tick(WRITE, &mut buckets);
}
