//! Btree iterators.
//!
//! A transaction owns the state of every iterator opened under it; all
//! iterators of one transaction are linked, meaning they share lock
//! acquisitions on nodes they hold in common (same task, so shares never
//! race). An iterator holds a path of locked nodes from the root down,
//! taking intent locks below `locks_want` and read locks above, with a
//! lock-sequence snapshot per level so dropped locks can be revalidated.
//!
//! Any relock failure walks back to the deepest still-valid ancestor and
//! re-descends; discovering a node was unhashed returns `Retry` to the
//! caller, which restarts from the root.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use log::trace;

use crate::bkey::{bpos_le, bpos_lt, Bkey, Bpos, BtreeId, POS_MAX};
use crate::bset::NodeIter;
use crate::btree::{BtreeNode, NodeFlags, BTREE_MAX_DEPTH};
use crate::errcode::{ErrCode, Result};
use crate::six::SixLockType;
use crate::super_block::CacheSet;

const TRAVERSE_RESTART_CAP: u32 = 2048;

struct IterData {
    btree_id: BtreeId,
    pos: Bpos,
    locks_want: u8,
    nodes: [Option<Arc<BtreeNode>>; BTREE_MAX_DEPTH],
    lock_type: [Option<SixLockType>; BTREE_MAX_DEPTH],
    lock_seq: [u64; BTREE_MAX_DEPTH],
    node_iter: NodeIter,
    uptodate: bool,
    active: bool,
}

impl IterData {
    fn new(btree_id: BtreeId, pos: Bpos, locks_want: u8) -> IterData {
        IterData {
            btree_id,
            pos,
            locks_want,
            nodes: Default::default(),
            lock_type: [None; BTREE_MAX_DEPTH],
            lock_seq: [0; BTREE_MAX_DEPTH],
            node_iter: NodeIter::default(),
            uptodate: false,
            active: true,
        }
    }
}

pub struct BtreeTrans<'c> {
    pub c: &'c CacheSet,
    iters: RefCell<Vec<IterData>>,
    cannibalize_held: Cell<bool>,
}

pub struct BtreeIter<'t, 'c> {
    pub trans: &'t BtreeTrans<'c>,
    pub idx: usize,
}

impl<'c> BtreeTrans<'c> {
    pub fn new(c: &'c CacheSet) -> BtreeTrans<'c> {
        BtreeTrans {
            c,
            iters: RefCell::new(Vec::new()),
            cannibalize_held: Cell::new(false),
        }
    }

    /// Open an iterator. `locks_want` is the level *below which* intent
    /// locks are taken: 0 = read everywhere, 1 = intent on leaves.
    pub fn iter(&self, btree_id: BtreeId, pos: Bpos, locks_want: u8) -> BtreeIter<'_, 'c> {
        let mut iters = self.iters.borrow_mut();
        let idx = iters.iter().position(|i| !i.active).unwrap_or(iters.len());
        let data = IterData::new(btree_id, pos, locks_want);
        if idx == iters.len() {
            iters.push(data);
        } else {
            iters[idx] = data;
        }
        BtreeIter { trans: self, idx }
    }

    fn unlock_level(&self, idx: usize, level: usize) {
        let mut iters = self.iters.borrow_mut();
        let it = &mut iters[idx];
        if let (Some(node), Some(ty)) = (&it.nodes[level], it.lock_type[level].take()) {
            node.lock.unlock(ty);
        }
    }

    pub fn unlock_iter(&self, idx: usize) {
        let mut iters = self.iters.borrow_mut();
        let it = &mut iters[idx];
        for level in 0..BTREE_MAX_DEPTH {
            if let (Some(node), Some(ty)) = (&it.nodes[level], it.lock_type[level].take()) {
                node.lock.unlock(ty);
            }
            it.nodes[level] = None;
        }
        it.uptodate = false;
    }

    fn release_iter(&self, idx: usize) {
        self.unlock_iter(idx);
        self.iters.borrow_mut()[idx].active = false;
    }

    /// Another linked iterator holding this node with a shareable mode?
    fn find_share(&self, node: &Arc<BtreeNode>, want: SixLockType) -> bool {
        let iters = self.iters.borrow();
        for it in iters.iter().filter(|i| i.active) {
            for level in 0..BTREE_MAX_DEPTH {
                let Some(held) = &it.nodes[level] else { continue };
                if !Arc::ptr_eq(held, node) {
                    continue;
                }
                match (it.lock_type[level], want) {
                    (Some(SixLockType::Read) | Some(SixLockType::Intent), SixLockType::Read) => {
                        return true
                    }
                    (Some(SixLockType::Intent), SixLockType::Intent) => return true,
                    _ => {}
                }
            }
        }
        false
    }

    /// Acquire `want` on `node`, sharing with linked iterators when one of
    /// them already holds a covering mode.
    fn lock_node(&self, node: &Arc<BtreeNode>, want: SixLockType) {
        if self.find_share(node, want) {
            node.lock.lock_increment(want);
        } else {
            node.lock.lock(want);
        }
    }

    fn record_level(&self, idx: usize, level: usize, node: Arc<BtreeNode>, ty: SixLockType) {
        let mut iters = self.iters.borrow_mut();
        let it = &mut iters[idx];
        it.lock_seq[level] = node.lock.seq();
        it.nodes[level] = Some(node);
        it.lock_type[level] = Some(ty);
    }

    fn lock_mode_for(&self, idx: usize, level: usize) -> SixLockType {
        let iters = self.iters.borrow();
        if (level as u8) < iters[idx].locks_want {
            SixLockType::Intent
        } else {
            SixLockType::Read
        }
    }

    /// Drop a read lock at `level`, keeping the node and seq for relock.
    fn unlock_if_read(&self, idx: usize, level: usize) {
        let mut iters = self.iters.borrow_mut();
        let it = &mut iters[idx];
        if level >= BTREE_MAX_DEPTH {
            return;
        }
        if let (Some(node), Some(SixLockType::Read)) = (&it.nodes[level], it.lock_type[level]) {
            it.lock_seq[level] = node.lock.seq();
            node.lock.unlock(SixLockType::Read);
            it.lock_type[level] = None;
        }
    }

    /// Re-take a read lock dropped by `unlock_if_read`. True on success or
    /// if nothing was dropped.
    fn relock_level(&self, idx: usize, level: usize) -> bool {
        let mut iters = self.iters.borrow_mut();
        let it = &mut iters[idx];
        if level >= BTREE_MAX_DEPTH {
            return true;
        }
        match (&it.nodes[level], it.lock_type[level]) {
            (Some(node), None) => {
                if node.lock.relock(SixLockType::Read, it.lock_seq[level]) {
                    it.lock_type[level] = Some(SixLockType::Read);
                    true
                } else {
                    false
                }
            }
            _ => true,
        }
    }

    /// The primary node lookup: cached fast path with verification, slow
    /// path through `fill`.
    fn btree_node_get(
        &self,
        idx: usize,
        key: &Bkey,
        level: u8,
        mode: SixLockType,
    ) -> Result<Arc<BtreeNode>> {
        let hash = BtreeNode::hash_of_key(key).ok_or(ErrCode::Inconsistent)?;

        loop {
            let Some(node) = self.c.node_cache.find(hash) else {
                match self.btree_node_fill(idx, key, level, mode, hash)? {
                    Some(node) => return Ok(node),
                    // Lost the insert race to a concurrent fill.
                    None => continue,
                }
            };

            // Taking an exclusive mode while holding the parent read-locked
            // can deadlock against a writer that holds this node's intent
            // and wants to upgrade the parent; drop the parent first.
            if mode != SixLockType::Read {
                self.unlock_if_read(idx, level as usize + 1);
            }
            self.lock_node(&node, mode);

            let ok = {
                let meta = node.meta.lock();
                meta.hash_key == Some(hash) && meta.level == level && meta.key.p == key.p
            } && !self.c.btree_inject_fault();

            if ok {
                if mode != SixLockType::Read && !self.relock_level(idx, level as usize + 1) {
                    node.lock.unlock(mode);
                    return Err(ErrCode::Retry);
                }
                return Ok(node);
            }

            node.lock.unlock(mode);
            if self.relock_level(idx, level as usize + 1) {
                continue;
            }
            return Err(ErrCode::Retry);
        }
    }

    /// Slow path: allocate a shell, make it visible, then read from disk.
    /// The parent's read lock is held across the unhashed-check-and-insert
    /// only, never across the I/O.
    fn btree_node_fill(
        &self,
        idx: usize,
        key: &Bkey,
        level: u8,
        mode: SixLockType,
        hash: u64,
    ) -> Result<Option<Arc<BtreeNode>>> {
        let btree_id = self.iters.borrow()[idx].btree_id;
        let node = self.node_alloc(btree_id)?;

        {
            let mut meta = node.meta.lock();
            meta.key = key.clone();
            meta.level = level;
            meta.btree_id = btree_id;
        }

        if !self.c.node_cache.hash_insert(hash, &node) {
            self.c.node_cache.release_unused(&node);
            return Ok(None);
        }

        // Insert succeeded: a concurrent split can no longer free the node
        // out from under us, so the parent lock can go before the read.
        self.unlock_if_read(idx, level as usize + 1);

        match crate::btree::io::read_node(self.c, key, level) {
            Ok(data) => {
                *node.data.write() = Some(Box::new(data));
            }
            Err(e) => {
                node.set_flag(NodeFlags::READ_ERROR);
                self.c.node_cache.evict(&node);
                node.lock.unlock(SixLockType::Write);
                return Err(e);
            }
        }

        match mode {
            SixLockType::Write => {}
            SixLockType::Intent => node.lock.downgrade_write(),
            SixLockType::Read => {
                node.lock.downgrade_write();
                node.lock.downgrade_intent();
            }
        }

        if !self.relock_level(idx, level as usize + 1) {
            node.lock.unlock(mode);
            return Err(ErrCode::Retry);
        }
        Ok(Some(node))
    }

    /// Node-cache allocation with the cannibalize fallback: on `NoMem`,
    /// take the reclaim token and retry against the LRU.
    pub(crate) fn node_alloc(&self, btree_id: BtreeId) -> Result<Arc<BtreeNode>> {
        match self.c.node_cache.alloc(self.c, btree_id) {
            Ok(node) => Ok(node),
            Err(ErrCode::NoMem) => {
                self.c.node_cache.cannibalize_lock();
                self.cannibalize_held.set(true);
                let ret = self.c.node_cache.alloc(self.c, btree_id);
                if ret.is_ok() {
                    self.c.node_cache.cannibalize_unlock();
                    self.cannibalize_held.set(false);
                }
                ret
            }
            Err(e) => Err(e),
        }
    }

    /// Walk from the root to the leaf containing `pos`, locking per
    /// `locks_want`. Restarts internally on `Retry`.
    pub fn traverse(&self, idx: usize) -> Result<()> {
        let (btree_id, is_extents) = {
            let iters = self.iters.borrow();
            (iters[idx].btree_id, iters[idx].btree_id.is_extents())
        };

        let mut restarts = 0u32;
        'restart: loop {
            restarts += 1;
            if restarts > TRAVERSE_RESTART_CAP {
                return Err(ErrCode::Retry);
            }
            self.unlock_iter(idx);

            let (root, root_level) = self.c.btree_root_node(btree_id);
            let mode = self.lock_mode_for(idx, root_level as usize);
            self.lock_node(&root, mode);
            if !self.c.btree_root_is(btree_id, &root) {
                root.lock.unlock(mode);
                continue 'restart;
            }
            self.record_level(idx, root_level as usize, root.clone(), mode);

            let mut level = root_level;
            let mut node = root;
            while level > 0 {
                let pos = self.iters.borrow()[idx].pos;
                let child_key = {
                    let guard = node.data.read();
                    let Some(d) = guard.as_ref() else {
                        // Reaped between find and lock; start over.
                        continue 'restart;
                    };
                    let mut cursor = NodeIter::default();
                    cursor.init(&d.keys, pos, is_extents);
                    cursor.peek(&d.keys)
                };
                let Some(child_key) = child_key else {
                    log::error!("btree {btree_id:?}: interior node missing child for {pos:?}");
                    self.c.set_inconsistent();
                    return Err(ErrCode::Inconsistent);
                };

                let mode = self.lock_mode_for(idx, level as usize - 1);
                match self.btree_node_get(idx, &child_key, level - 1, mode) {
                    Ok(child) => {
                        self.record_level(idx, level as usize - 1, child.clone(), mode);
                        node = child;
                        level -= 1;
                    }
                    Err(ErrCode::Retry) => continue 'restart,
                    Err(e) => return Err(e),
                }
            }

            let (leaf, pos) = {
                let iters = self.iters.borrow();
                let it = &iters[idx];
                (it.nodes[0].clone().expect("leaf locked"), it.pos)
            };
            {
                let guard = leaf.data.read();
                let Some(d) = guard.as_ref() else {
                    continue 'restart;
                };
                let mut iters = self.iters.borrow_mut();
                let it = &mut iters[idx];
                it.node_iter.init(&d.keys, pos, is_extents);
                it.uptodate = true;
            }
            trace!("traverse {btree_id:?} to {pos:?}: {restarts} pass(es)");
            return Ok(());
        }
    }

    /// Next key at/after the position; `None` at end of tree.
    pub fn peek(&self, idx: usize) -> Result<Option<Bkey>> {
        loop {
            let uptodate = self.iters.borrow()[idx].uptodate;
            if !uptodate {
                self.traverse(idx)?;
            }

            let (found, leaf_max, is_extents) = {
                let mut iters = self.iters.borrow_mut();
                let it = &mut iters[idx];
                let leaf = it.nodes[0].as_ref().expect("traversed").clone();
                let guard = leaf.data.read();
                let d = guard.as_ref().expect("locked leaf has data");
                let found = it.node_iter.peek(&d.keys);
                let max = leaf.meta.lock().key.p;
                (found, max, it.btree_id.is_extents())
            };

            if let Some(k) = found {
                return Ok(Some(k));
            }

            // Leaf exhausted: step to the next one.
            if leaf_max == POS_MAX {
                return Ok(None);
            }
            let mut iters = self.iters.borrow_mut();
            let it = &mut iters[idx];
            it.pos = if is_extents {
                leaf_max
            } else {
                crate::bkey::bpos_successor(leaf_max)
            };
            it.uptodate = false;
        }
    }

    /// `peek`, with holes between extents synthesised as zero-valued keys
    /// so callers can walk a dense position space. `end` bounds the hole.
    pub fn peek_with_holes(&self, idx: usize, end: Bpos) -> Result<Option<Bkey>> {
        let pos = self.iters.borrow()[idx].pos;
        debug_assert!(self.iters.borrow()[idx].btree_id.is_extents());

        let hole_to = |to: Bpos| {
            let span = to.offset - pos.offset;
            Bkey::deleted(to, span.min(u32::MAX as u64) as u32)
        };

        match self.peek(idx)? {
            None => Ok(Some(hole_to(end))),
            Some(k) => {
                if k.p.inode != pos.inode || !bpos_lt(k.start(), end) {
                    Ok(Some(hole_to(end)))
                } else if bpos_lt(pos, k.start()) {
                    Ok(Some(hole_to(k.start())))
                } else {
                    Ok(Some(k))
                }
            }
        }
    }

    /// Step past a key returned by peek. For holes, only the position
    /// advances.
    pub fn advance(&self, idx: usize, k: &Bkey) {
        let mut iters = self.iters.borrow_mut();
        let it = &mut iters[idx];
        let new_pos = it.btree_id.advance_pos(k.p);
        it.pos = new_pos;
        if !it.uptodate {
            return;
        }
        if k.is_deleted() {
            // Synthesised hole: the cursor is already past it, but it may
            // end beyond this leaf.
            let leaf_max = it.nodes[0].as_ref().map(|n| n.meta.lock().key.p);
            if let Some(max) = leaf_max {
                if bpos_lt(max, new_pos) {
                    it.uptodate = false;
                }
            }
            return;
        }
        let leaf = it.nodes[0].as_ref().expect("uptodate iter has leaf").clone();
        let guard = leaf.data.read();
        if let Some(d) = guard.as_ref() {
            it.node_iter.advance(&d.keys);
        }
    }

    /// Move to an explicit position. Forward moves within the current leaf
    /// keep the path; anything else re-traverses.
    pub fn set_pos(&self, idx: usize, pos: Bpos) {
        let mut iters = self.iters.borrow_mut();
        let it = &mut iters[idx];
        let old = it.pos;
        it.pos = pos;
        if !it.uptodate {
            return;
        }
        let leaf = it.nodes[0].as_ref().expect("uptodate iter has leaf").clone();
        let max = leaf.meta.lock().key.p;
        if bpos_le(old, pos) && bpos_le(pos, max) {
            let guard = leaf.data.read();
            if let Some(d) = guard.as_ref() {
                let is_extents = it.btree_id.is_extents();
                it.node_iter.init(&d.keys, pos, is_extents);
                return;
            }
        }
        it.uptodate = false;
    }

    pub fn pos(&self, idx: usize) -> Bpos {
        self.iters.borrow()[idx].pos
    }

    /// Raise or lower intent coverage. Upgrades attempt an in-place
    /// read→intent relock; failure leaves the iterator needing a
    /// re-traverse and returns false.
    pub fn set_locks_want(&self, idx: usize, locks_want: u8) -> bool {
        let mut iters = self.iters.borrow_mut();
        let it = &mut iters[idx];
        let old = it.locks_want;
        it.locks_want = locks_want;
        if locks_want <= old || !it.uptodate {
            if locks_want > old {
                it.uptodate = false;
            }
            return locks_want <= old;
        }

        for level in 0..(locks_want as usize).min(BTREE_MAX_DEPTH) {
            if it.lock_type[level] != Some(SixLockType::Read) {
                continue;
            }
            let node = it.nodes[level].as_ref().expect("lock without node").clone();
            let seq = node.lock.seq();
            node.lock.unlock(SixLockType::Read);
            it.lock_type[level] = None;
            if node.lock.relock(SixLockType::Intent, seq) {
                it.lock_type[level] = Some(SixLockType::Intent);
                it.lock_seq[level] = node.lock.seq();
            } else {
                it.uptodate = false;
                return false;
            }
        }
        true
    }

    /// A key was added to `node`: reinitialise the intra-node cursor of
    /// every linked iterator parked on it.
    pub(crate) fn fix_iterators_on(&self, node: &Arc<BtreeNode>) {
        let mut iters = self.iters.borrow_mut();
        for it in iters.iter_mut().filter(|i| i.active && i.uptodate) {
            let Some(leaf) = &it.nodes[0] else { continue };
            if !Arc::ptr_eq(leaf, node) {
                continue;
            }
            let guard = node.data.read();
            if let Some(d) = guard.as_ref() {
                let pos = it.pos;
                let is_extents = it.btree_id.is_extents();
                it.node_iter.init(&d.keys, pos, is_extents);
            }
        }
    }

    /// `node` is about to be freed by a structural update: every linked
    /// iterator except `keep_idx` drops its record and lock share.
    pub(crate) fn drop_node_other_iters(&self, node: &Arc<BtreeNode>, keep_idx: usize) {
        let mut iters = self.iters.borrow_mut();
        for (i, it) in iters.iter_mut().enumerate() {
            if !it.active || i == keep_idx {
                continue;
            }
            for level in 0..BTREE_MAX_DEPTH {
                let Some(held) = &it.nodes[level] else { continue };
                if !Arc::ptr_eq(held, node) {
                    continue;
                }
                if let Some(ty) = it.lock_type[level].take() {
                    node.lock.unlock(ty);
                }
                it.nodes[level] = None;
                it.uptodate = false;
            }
        }
    }

    /// Clear an iterator's record at `level` without touching the lock,
    /// for callers about to release the lock themselves.
    pub(crate) fn forget_node(&self, idx: usize, level: usize) {
        let mut iters = self.iters.borrow_mut();
        let it = &mut iters[idx];
        it.nodes[level] = None;
        it.lock_type[level] = None;
        it.uptodate = false;
    }

    pub(crate) fn iter_node(&self, idx: usize, level: usize) -> Option<Arc<BtreeNode>> {
        self.iters.borrow()[idx].nodes[level].clone()
    }

    pub(crate) fn holds_intent(&self, idx: usize, level: usize) -> bool {
        level < BTREE_MAX_DEPTH
            && self.iters.borrow()[idx].lock_type[level] == Some(SixLockType::Intent)
    }

    pub(crate) fn iter_btree_id(&self, idx: usize) -> BtreeId {
        self.iters.borrow()[idx].btree_id
    }

    /// Unlock every linked iterator, yield, and leave them to re-traverse.
    pub fn cond_resched(&self) {
        let nr = self.iters.borrow().len();
        for idx in 0..nr {
            if self.iters.borrow()[idx].active {
                self.unlock_iter(idx);
            }
        }
        std::thread::yield_now();
    }
}

impl Drop for BtreeTrans<'_> {
    fn drop(&mut self) {
        let nr = self.iters.borrow().len();
        for idx in 0..nr {
            if self.iters.borrow()[idx].active {
                self.unlock_iter(idx);
            }
        }
        if self.cannibalize_held.get() {
            self.c.node_cache.cannibalize_unlock();
        }
    }
}

impl<'t, 'c> BtreeIter<'t, 'c> {
    pub fn traverse(&mut self) -> Result<()> {
        self.trans.traverse(self.idx)
    }

    pub fn peek(&mut self) -> Result<Option<Bkey>> {
        self.trans.peek(self.idx)
    }

    pub fn peek_with_holes(&mut self, end: Bpos) -> Result<Option<Bkey>> {
        self.trans.peek_with_holes(self.idx, end)
    }

    pub fn advance(&mut self, k: &Bkey) {
        self.trans.advance(self.idx, k)
    }

    pub fn set_pos(&mut self, pos: Bpos) {
        self.trans.set_pos(self.idx, pos)
    }

    pub fn pos(&self) -> Bpos {
        self.trans.pos(self.idx)
    }

    pub fn set_locks_want(&mut self, locks_want: u8) -> bool {
        self.trans.set_locks_want(self.idx, locks_want)
    }

    /// Drop every lock this iterator holds; the next operation
    /// re-traverses. Used before blocking on non-btree work.
    pub fn unlock(&mut self) {
        self.trans.unlock_iter(self.idx)
    }
}

impl Drop for BtreeIter<'_, '_> {
    fn drop(&mut self) {
        self.trans.release_iter(self.idx);
    }
}
