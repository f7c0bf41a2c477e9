//! The btree node cache.
//!
//! Shells are slab-allocated and never freed until teardown; the shrinker
//! reclaims data buffers only. Nodes with data live either on the main LRU
//! (hashed, reachable) or on `freeable` (unhashed, awaiting reuse); shells
//! without data sit on `freed`. Lookup is keyed by the node's first pointer
//! and only takes a shard lock, never the list lock.
//!
//! When every list is empty and the cache is at capacity, a caller holding
//! the cannibalize token may evict a reapable node straight off the LRU;
//! everyone else gets `NoMem` and backs off to the iterator retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::bkey::{BtreeId, BTREE_ID_NR};
use crate::btree::{io as btree_io, BtreeNode, NodeData, NodeFlags};
use crate::errcode::{ErrCode, Result};
use crate::six::SixLockType;
use crate::super_block::CacheSet;
use crate::util::LruList;

const HASH_SHARDS: usize = 16;

struct CacheInner {
    nodes: Vec<Arc<BtreeNode>>,
    /// Hashed nodes with data.
    lru: LruList,
    /// Unhashed nodes whose data buffer is still attached.
    freeable: LruList,
    /// Shells with no data.
    freed: LruList,
    /// Nodes currently holding a data buffer.
    used: usize,
}

struct CannibalizeState {
    owner: Option<ThreadId>,
}

pub struct NodeCache {
    shards: Vec<RwLock<HashMap<u64, Arc<BtreeNode>>>>,
    inner: Mutex<CacheInner>,
    cannibalize: Mutex<CannibalizeState>,
    cannibalize_wait: Condvar,
    /// Max nodes with data before allocation requires reclaim.
    capacity: AtomicUsize,
    /// Reserve floor override; 0 means derive from tree depths.
    reserve_override: AtomicUsize,
}

pub const DEFAULT_CAPACITY: usize = 1024;

impl NodeCache {
    pub fn new(capacity: usize) -> NodeCache {
        NodeCache {
            shards: (0..HASH_SHARDS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            inner: Mutex::new(CacheInner {
                nodes: Vec::new(),
                lru: LruList::new(),
                freeable: LruList::new(),
                freed: LruList::new(),
                used: 0,
            }),
            cannibalize: Mutex::new(CannibalizeState { owner: None }),
            cannibalize_wait: Condvar::new(),
            capacity: AtomicUsize::new(capacity),
            reserve_override: AtomicUsize::new(0),
        }
    }

    fn shard(&self, hash: u64) -> &RwLock<HashMap<u64, Arc<BtreeNode>>> {
        &self.shards[(hash as usize) % HASH_SHARDS]
    }

    pub fn set_capacity(&self, n: usize) {
        self.capacity.store(n, Ordering::Relaxed);
    }

    pub fn set_reserve(&self, n: usize) {
        self.reserve_override.store(n, Ordering::Relaxed);
    }

    /// Nodes that must stay resident so a single key insert can always
    /// allocate: 16 + 8·depth per rooted tree.
    pub fn reserve(&self, cs: &CacheSet) -> usize {
        let overridden = self.reserve_override.load(Ordering::Relaxed);
        if overridden != 0 {
            return overridden;
        }
        (0..BTREE_ID_NR)
            .map(|i| {
                let depth = cs.btree_root_level(BtreeId::from_index(i)) as usize + 1;
                16 + 8 * depth
            })
            .sum()
    }

    pub fn used(&self) -> usize {
        self.inner.lock().used
    }

    /// Lock-free-path lookup by first-pointer hash.
    pub fn find(&self, hash: u64) -> Option<Arc<BtreeNode>> {
        let node = self.shard(hash).read().get(&hash).cloned()?;
        node.set_flag(NodeFlags::ACCESSED);
        Some(node)
    }

    /// Make a filled node visible. Fails (and leaves the node untouched)
    /// if a racing fill inserted the same hash first.
    pub fn hash_insert(&self, hash: u64, node: &Arc<BtreeNode>) -> bool {
        {
            let mut shard = self.shard(hash).write();
            if shard.contains_key(&hash) {
                return false;
            }
            shard.insert(hash, node.clone());
        }
        node.meta.lock().hash_key = Some(hash);
        let mut inner = self.inner.lock();
        inner.lru.push_front(node.slot);
        true
    }

    fn hash_remove_locked(&self, inner: &mut CacheInner, node: &BtreeNode) {
        let mut meta = node.meta.lock();
        if let Some(hash) = meta.hash_key.take() {
            self.shard(hash).write().remove(&hash);
        }
        if inner.lru.contains(node.slot) {
            inner.lru.remove(node.slot);
        }
    }

    /// Try to take exclusive ownership of a node for reclaim. On success
    /// the node is intent+write locked and, if it was dirty, clean.
    ///
    /// `flush` selects whether dirty nodes are written out or skipped.
    fn reap_trylock(&self, cs: &CacheSet, node: &BtreeNode, flush: bool) -> bool {
        if !node.lock.try_lock(SixLockType::Intent) {
            return false;
        }
        if !node.lock.try_upgrade() {
            node.lock.unlock(SixLockType::Intent);
            return false;
        }
        if node.test_flag(NodeFlags::NOEVICT)
            || node.test_flag(NodeFlags::WRITE_ERROR)
            || node.test_flag(NodeFlags::WRITE_IN_FLIGHT)
        {
            node.lock.unlock(SixLockType::Write);
            return false;
        }
        if node.test_flag(NodeFlags::DIRTY) {
            if !flush {
                node.lock.unlock(SixLockType::Write);
                return false;
            }
            // The node is about to die; a plain flush write, no point
            // compacting afterwards.
            if btree_io::write_node(cs, node).is_err() {
                node.lock.unlock(SixLockType::Write);
                return false;
            }
        }
        true
    }

    fn prep_reused(node: &Arc<BtreeNode>, btree_id: BtreeId) {
        {
            let mut guard = node.data.write();
            let d = guard.as_mut().expect("reused node keeps its buffer");
            d.keys = crate::bset::NodeKeys::new();
            d.written = 0;
        }
        let mut meta = node.meta.lock();
        meta.btree_id = btree_id;
        meta.hash_key = None;
        node.clear_flag(NodeFlags::DIRTY | NodeFlags::ACCESSED | NodeFlags::READ_ERROR);
    }

    /// Allocate a node with intent+write held. The caller fills in the
    /// meta and either hashes the node or returns it via `release_unused`.
    pub fn alloc(&self, cs: &CacheSet, btree_id: BtreeId) -> Result<Arc<BtreeNode>> {
        let mut inner = self.inner.lock();

        // Freeable shells keep their data buffer; cheapest reuse.
        let freeable: Vec<usize> = inner.freeable.iter_lru().collect();
        for slot in freeable {
            let node = inner.nodes[slot].clone();
            if self.reap_trylock(cs, &node, false) {
                inner.freeable.remove(slot);
                drop(inner);
                Self::prep_reused(&node, btree_id);
                return Ok(node);
            }
        }

        let capacity = self.capacity.load(Ordering::Relaxed);

        // Freed shells: reattach a buffer.
        if inner.used < capacity {
            if let Some(slot) = inner.freed.pop_back() {
                let node = inner.nodes[slot].clone();
                inner.used += 1;
                drop(inner);
                node.lock.lock(SixLockType::Intent);
                node.lock.upgrade();
                *node.data.write() = Some(Box::new(NodeData::default()));
                let mut meta = node.meta.lock();
                meta.btree_id = btree_id;
                meta.hash_key = None;
                drop(meta);
                node.clear_flag(NodeFlags::DIRTY | NodeFlags::ACCESSED | NodeFlags::READ_ERROR);
                return Ok(node);
            }

            // Fresh shell.
            let slot = inner.nodes.len();
            let node = Arc::new(BtreeNode::new_shell(slot, btree_id));
            inner.nodes.push(node.clone());
            inner.used += 1;
            drop(inner);
            node.lock.lock(SixLockType::Intent);
            node.lock.upgrade();
            *node.data.write() = Some(Box::new(NodeData::default()));
            return Ok(node);
        }

        // At capacity: only the cannibalize-lock holder may evict live
        // nodes.
        if self.cannibalize.lock().owner != Some(thread::current().id()) {
            return Err(ErrCode::NoMem);
        }

        let lru: Vec<usize> = inner.lru.iter_lru().collect();
        for slot in lru {
            let node = inner.nodes[slot].clone();
            if self.reap_trylock(cs, &node, true) {
                trace!("cannibalizing btree node slot {slot}");
                self.hash_remove_locked(&mut inner, &node);
                drop(inner);
                Self::prep_reused(&node, btree_id);
                return Ok(node);
            }
        }

        Err(ErrCode::NoMem)
    }

    /// Return a node that never became visible (lost a fill race, or an
    /// error path) to the freeable list. Drops its locks.
    pub fn release_unused(&self, node: &Arc<BtreeNode>) {
        debug_assert!(node.meta.lock().hash_key.is_none());
        node.clear_flag(NodeFlags::DIRTY);
        node.lock.unlock(SixLockType::Write);
        let mut inner = self.inner.lock();
        if node.has_data() {
            inner.freeable.push_front(node.slot);
        } else {
            inner.freed.push_front(node.slot);
        }
    }

    /// Evict a hashed node (structural delete). Caller holds intent+write;
    /// data is detached and the shell parked on `freed`.
    pub fn evict(&self, node: &Arc<BtreeNode>) {
        let mut inner = self.inner.lock();
        self.hash_remove_locked(&mut inner, node);
        if node.data.write().take().is_some() {
            inner.used -= 1;
        }
        inner.freed.push_front(node.slot);
        node.clear_flag(NodeFlags::DIRTY | NodeFlags::ACCESSED);
    }

    /// Best-effort shrink: free up to `nr` node buffers, never dropping
    /// below the reserve. Returns the number freed.
    pub fn shrinker_scan(&self, cs: &CacheSet, nr: usize) -> usize {
        let Some(mut inner) = self.inner.try_lock() else {
            // Contended; the shrinker gives up rather than stall.
            return 0;
        };
        let reserve = self.reserve(cs);
        let mut freed_count = 0;

        // Pass 1: freeable shells, no I/O needed.
        let freeable: Vec<usize> = inner.freeable.iter_lru().collect();
        for slot in freeable {
            if freed_count >= nr || inner.used <= reserve {
                break;
            }
            let node = inner.nodes[slot].clone();
            if self.reap_trylock(cs, &node, false) {
                inner.freeable.remove(slot);
                if node.data.write().take().is_some() {
                    inner.used -= 1;
                }
                inner.freed.push_front(node.slot);
                node.lock.unlock(SixLockType::Write);
                freed_count += 1;
            }
        }

        // Pass 2: the main LRU, giving accessed nodes a second chance.
        let lru: Vec<usize> = inner.lru.iter_lru().collect();
        for slot in lru {
            if freed_count >= nr || inner.used <= reserve {
                break;
            }
            let node = inner.nodes[slot].clone();
            if node.test_flag(NodeFlags::ACCESSED) {
                node.clear_flag(NodeFlags::ACCESSED);
                continue;
            }
            if self.reap_trylock(cs, &node, true) {
                self.hash_remove_locked(&mut inner, &node);
                if node.data.write().take().is_some() {
                    inner.used -= 1;
                }
                inner.freed.push_front(node.slot);
                node.lock.unlock(SixLockType::Write);
                freed_count += 1;
            }
        }

        debug!("shrinker: freed {freed_count} nodes, {} resident", inner.used);
        freed_count
    }

    /// Take the process-wide "one reclaimer at a time" token, waiting if
    /// another task holds it.
    pub fn cannibalize_lock(&self) {
        let me = thread::current().id();
        let mut st = self.cannibalize.lock();
        if st.owner == Some(me) {
            return;
        }
        while st.owner.is_some() {
            self.cannibalize_wait.wait(&mut st);
        }
        st.owner = Some(me);
    }

    pub fn try_cannibalize_lock(&self) -> bool {
        let me = thread::current().id();
        let mut st = self.cannibalize.lock();
        if st.owner == Some(me) {
            return true;
        }
        if st.owner.is_some() {
            return false;
        }
        st.owner = Some(me);
        true
    }

    pub fn cannibalize_unlock(&self) {
        let mut st = self.cannibalize.lock();
        if st.owner == Some(thread::current().id()) {
            st.owner = None;
            self.cannibalize_wait.notify_one();
        }
    }

    /// List membership invariant: data ⇒ lru or freeable; no data ⇒ freed.
    #[cfg(debug_assertions)]
    pub fn check_lists(&self) {
        let inner = self.inner.lock();
        for node in &inner.nodes {
            let slot = node.slot;
            let has_data = node.has_data();
            let on_live = inner.lru.contains(slot) || inner.freeable.contains(slot);
            let on_freed = inner.freed.contains(slot);
            if has_data {
                assert!(on_live && !on_freed, "node {slot} has data but is misfiled");
            } else {
                assert!(on_freed && !on_live, "node {slot} lost data but is misfiled");
            }
            if node.test_flag(NodeFlags::DIRTY) {
                assert!(!on_freed, "dirty node {slot} on freed list");
            }
        }
        assert_eq!(
            inner.used,
            inner.lru.len() + inner.freeable.len(),
            "used count out of sync"
        );
    }
}
