//! Btree updates: key insertion with extent overlap splitting, placeholder
//! (check) keys, node splits and root growth.
//!
//! Inserting an extent first trims every existing key it overlaps (cut
//! front, cut back, whiteout, or three-way split) so extent keys never
//! overlap after insertion, and inserting the same key twice is absorbed.
//! Structural changes write child nodes before the parent references them,
//! and every insert is stamped by a journal sequence number.
//!
//! Write locks are taken top-down (parent before child) so a reader
//! mid-descent can always finish and drain.

use std::sync::Arc;

use log::{debug, trace};

use crate::bkey::{bpos_lt, Bkey, BtreeId, Bval, POS_MAX};
use crate::bset::Bset;
use crate::btree::iter::BtreeTrans;
use crate::btree::{io as btree_io, BtreeNode, NodeData, NodeFlags, BTREE_NODE_MAX_KEYS};
use crate::buckets::{account_ptr, BucketDataType};
use crate::errcode::{ErrCode, Result};
use crate::extents::{cut_back, cut_front, ExtentVal, Ptr};
use crate::journal::JournalPayload;
use crate::six::SixLockType;
use crate::super_block::CacheSet;

/// Apply a key's sector counts to its buckets; `sign` is +1 on insert, -1
/// on overwrite/trim.
fn account_key(cs: &CacheSet, k: &Bkey, sign: i64) {
    let Some(e) = k.extent() else { return };
    for ptr in &e.ptrs {
        let Some(ca) = cs.cache(ptr.dev) else { continue };
        let bucket = ca.bucket_of(ptr.offset);
        let mut buckets = ca.buckets.write();
        account_ptr(
            &mut buckets[bucket as usize],
            ptr,
            sign * k.size as i64,
            e.dirty,
            BucketDataType::Data,
        );
    }
}

/// Trim `old` against the inserted range `(start, end]`, accounting the
/// sectors that go away. Returns a back half when the overwrite punched a
/// hole in the middle.
fn trim_overlapping(cs: &CacheSet, old: &mut Bkey, new: &Bkey) -> Option<Bkey> {
    let s = new.start();
    let e = new.p;
    debug_assert!(old.overlaps(s, e));

    let keeps_front = bpos_lt(old.start(), s);
    let keeps_back = bpos_lt(e, old.p);

    match (keeps_front, keeps_back) {
        (true, true) => {
            let mut tail = old.clone();
            cut_front(e, &mut tail);
            let mut removed = old.clone();
            cut_front(s, &mut removed);
            cut_back(e, &mut removed);
            account_key(cs, &removed, -1);
            cut_back(s, old);
            Some(tail)
        }
        (true, false) => {
            let mut removed = old.clone();
            cut_front(s, &mut removed);
            account_key(cs, &removed, -1);
            cut_back(s, old);
            None
        }
        (false, true) => {
            let mut removed = old.clone();
            cut_back(e, &mut removed);
            account_key(cs, &removed, -1);
            cut_front(e, old);
            None
        }
        (false, false) => {
            account_key(cs, old, -1);
            *old = Bkey::deleted(old.p, old.size);
            None
        }
    }
}

fn node_needs_split(node: &BtreeNode) -> bool {
    let guard = node.data.read();
    guard
        .as_ref()
        .map_or(false, |d| d.keys.nr_keys() >= BTREE_NODE_MAX_KEYS)
}

/// Insert `k` into the tree the iterator is positioned over. Splits the
/// key at leaf boundaries, trims overlapping extents, journals each part.
/// Returns the journal sequence of the last part.
pub fn btree_insert_key(trans: &BtreeTrans<'_>, iter_idx: usize, k: Bkey) -> Result<u64> {
    let cs = trans.c;
    if cs.is_read_only() {
        return Err(ErrCode::Inconsistent);
    }

    let mut k = k;
    let mut last_seq = 0;

    trans.set_locks_want(iter_idx, 1);

    loop {
        trans.set_pos(iter_idx, k.start());
        trans.traverse(iter_idx)?;

        let leaf = trans
            .iter_node(iter_idx, 0)
            .expect("traverse leaves the leaf locked");

        if node_needs_split(&leaf) {
            match btree_split(trans, iter_idx, 0) {
                Ok(()) | Err(ErrCode::Retry) => continue,
                Err(e) => return Err(e),
            }
        }

        let (part, remainder) = {
            let leaf_max = leaf.meta.lock().key.p;
            if k.is_extent_like() && bpos_lt(leaf_max, k.p) {
                let mut part = k.clone();
                cut_back(leaf_max, &mut part);
                let mut rest = k.clone();
                cut_front(leaf_max, &mut rest);
                (part, Some(rest))
            } else {
                (k.clone(), None)
            }
        };

        leaf.lock.upgrade();
        {
            let mut guard = leaf.data.write();
            let d = guard.as_mut().expect("locked leaf has data");

            let mut tails = Vec::new();
            if part.is_extent_like() {
                let (s, e) = (part.start(), part.p);
                d.keys.for_each_overlapping_mut(s, e, |old| {
                    if let Some(tail) = trim_overlapping(cs, old, &part) {
                        tails.push(tail);
                    }
                });
            } else {
                // Non-extent btrees: replacement is exact-position.
                for set in &mut d.keys.sets {
                    for old in &mut set.keys {
                        if !old.is_deleted() && old.p == part.p {
                            *old = Bkey::deleted(old.p, old.size);
                        }
                    }
                }
            }

            d.keys.ensure_writable();
            account_key(cs, &part, 1);
            last_seq = cs.journal.add_entry(JournalPayload::Keys(vec![part.clone()]));
            d.keys.insert(part);
            for tail in tails {
                d.keys.insert(tail);
            }
            if d.keys.needs_sort() {
                d.keys.sort_all();
                d.written = 0;
            }
        }
        leaf.set_flag(NodeFlags::DIRTY);
        leaf.lock.downgrade_write();
        trans.fix_iterators_on(&leaf);

        match remainder {
            Some(rest) if rest.size > 0 => k = rest,
            _ => break,
        }
    }

    Ok(last_seq)
}

/// Compare-and-replace: swap `old` for `new` only if `old` is still the
/// sole key covering the range. Returns false (no change) when a racing
/// write got there first. `old` and `new` must cover the same range.
pub fn btree_insert_replace(
    trans: &BtreeTrans<'_>,
    iter_idx: usize,
    old: &Bkey,
    new: Bkey,
) -> Result<bool> {
    let cs = trans.c;
    if cs.is_read_only() {
        return Err(ErrCode::Inconsistent);
    }
    debug_assert!(old.start() == new.start() && old.p == new.p);

    trans.set_locks_want(iter_idx, 1);

    loop {
        trans.set_pos(iter_idx, new.start());
        trans.traverse(iter_idx)?;

        let leaf = trans
            .iter_node(iter_idx, 0)
            .expect("traverse leaves the leaf locked");

        if node_needs_split(&leaf) {
            match btree_split(trans, iter_idx, 0) {
                Ok(()) | Err(ErrCode::Retry) => continue,
                Err(e) => return Err(e),
            }
        }

        leaf.lock.upgrade();
        let replaced = {
            let mut guard = leaf.data.write();
            let d = guard.as_mut().expect("locked leaf has data");

            let mut live: Vec<Bkey> = Vec::new();
            for set in &d.keys.sets {
                for k in &set.keys {
                    if !k.is_deleted() && k.overlaps(new.start(), new.p) {
                        live.push(k.clone());
                    }
                }
            }

            if live.len() == 1 && live[0] == *old {
                d.keys.for_each_overlapping_mut(new.start(), new.p, |o| {
                    account_key(cs, o, -1);
                    *o = Bkey::deleted(o.p, o.size);
                });
                d.keys.ensure_writable();
                account_key(cs, &new, 1);
                cs.journal
                    .add_entry(JournalPayload::Keys(vec![new.clone()]));
                d.keys.insert(new.clone());
                if d.keys.needs_sort() {
                    d.keys.sort_all();
                    d.written = 0;
                }
                true
            } else {
                false
            }
        };
        if replaced {
            leaf.set_flag(NodeFlags::DIRTY);
        }
        leaf.lock.downgrade_write();
        trans.fix_iterators_on(&leaf);
        return Ok(replaced);
    }
}

/// Insert a placeholder reserving `(k.start, k.p]` for an in-flight
/// promote, unless any live key already intersects the range. Returns
/// whether the placeholder went in.
pub fn insert_check_key(trans: &BtreeTrans<'_>, iter_idx: usize, k: Bkey) -> Result<bool> {
    debug_assert!(k.is_check());
    trans.set_pos(iter_idx, k.start());
    match trans.peek(iter_idx)? {
        Some(existing)
            if !existing.is_deleted() && existing.overlaps(k.start(), k.p) =>
        {
            Ok(false)
        }
        _ => {
            btree_insert_key(trans, iter_idx, k)?;
            Ok(true)
        }
    }
}

/// Drop any cached data in `(start, end]` of an inode: a whiteout insert
/// whose only effect is the overlap trim. Used when a bypassed write makes
/// cached copies stale.
pub fn discard_cached_range(
    trans: &BtreeTrans<'_>,
    iter_idx: usize,
    inode: u64,
    start: u64,
    end: u64,
) -> Result<()> {
    if end <= start {
        return Ok(());
    }
    let k = Bkey::deleted(crate::bkey::pos(inode, end), (end - start) as u32);
    btree_insert_key(trans, iter_idx, k)?;
    Ok(())
}

fn new_node_key(max: crate::bkey::Bpos, ptr: Ptr) -> Bkey {
    let mut e = ExtentVal::new();
    e.push_ptr(ptr);
    Bkey::new(max, 0, Bval::BtreePtr(e))
}

/// Allocate, populate, write and hash a fresh node holding `keys`. Returns
/// it locked intent+write.
fn make_node(
    trans: &BtreeTrans<'_>,
    btree_id: BtreeId,
    level: u8,
    max: crate::bkey::Bpos,
    keys: Vec<Bkey>,
) -> Result<Arc<BtreeNode>> {
    let cs = trans.c;

    let node = trans.node_alloc(btree_id)?;
    let ptr = match cs.alloc_btree_bucket() {
        Ok(ptr) => ptr,
        Err(e) => {
            cs.node_cache.release_unused(&node);
            return Err(e);
        }
    };

    {
        let mut meta = node.meta.lock();
        meta.key = new_node_key(max, ptr);
        meta.level = level;
        meta.btree_id = btree_id;
    }
    {
        let mut guard = node.data.write();
        *guard = Some(Box::new(NodeData {
            keys: crate::bset::NodeKeys {
                sets: vec![Bset { keys }],
                written_sets: 0,
            },
            written: 0,
            node_seq: 0,
        }));
    }

    if let Err(e) = btree_io::write_node(cs, &node) {
        cs.free_btree_bucket(&ptr);
        cs.node_cache.evict(&node);
        node.lock.unlock(SixLockType::Write);
        return Err(e);
    }

    let hash = BtreeNode::hash_of_key(&node.meta.lock().key).expect("node key has a pointer");
    if !cs.node_cache.hash_insert(hash, &node) {
        // A fresh bucket's pointer can't alias a live node.
        cs.free_btree_bucket(&ptr);
        cs.node_cache.release_unused(&node);
        return Err(ErrCode::Inconsistent);
    }
    Ok(node)
}

fn discard_new_node(cs: &CacheSet, node: &Arc<BtreeNode>) {
    let ptr = node
        .meta
        .lock()
        .key
        .btree_ptr()
        .and_then(|e| e.first_ptr())
        .copied();
    cs.node_cache.evict(node);
    node.lock.unlock(SixLockType::Write);
    if let Some(ptr) = ptr {
        cs.free_btree_bucket(&ptr);
    }
}

/// Split the node the iterator holds at `level` into two, updating (and if
/// necessary recursively splitting) the parent, or growing a new root.
///
/// Needs intent on the parent; when the iterator doesn't hold it yet this
/// returns `Retry` after raising `locks_want`, and the caller re-traverses.
pub fn btree_split(trans: &BtreeTrans<'_>, iter_idx: usize, level: u8) -> Result<()> {
    let cs = trans.c;
    let btree_id = trans.iter_btree_id(iter_idx);
    let node = trans
        .iter_node(iter_idx, level as usize)
        .ok_or(ErrCode::Retry)?;

    let (_, root_level) = cs.btree_root_node(btree_id);
    let is_root = level == root_level;

    if !is_root && !trans.holds_intent(iter_idx, level as usize + 1) {
        trans.set_locks_want(iter_idx, level + 2);
        return Err(ErrCode::Retry);
    }

    // Intent is enough to freeze the key image.
    let keys = {
        let guard = node.data.read();
        let Some(d) = guard.as_ref() else {
            return Err(ErrCode::Retry);
        };
        d.keys.keys_sorted()
    };
    if keys.len() < 2 {
        return Ok(());
    }

    let old_key = node.meta.lock().key.clone();
    let mid = keys.len() / 2;
    let left_max = keys[mid - 1].p;
    let right_max = old_key.p;
    let (left_keys, right_keys) = {
        let mut l = keys;
        let r = l.split_off(mid);
        (l, r)
    };

    trace!(
        "splitting level {level} node at {:?}: {} + {} keys",
        old_key.p,
        left_keys.len(),
        right_keys.len()
    );

    let left = make_node(trans, btree_id, level, left_max, left_keys)?;
    let right = match make_node(trans, btree_id, level, right_max, right_keys) {
        Ok(n) => n,
        Err(e) => {
            discard_new_node(cs, &left);
            return Err(e);
        }
    };
    let left_key = left.meta.lock().key.clone();
    let right_key = right.meta.lock().key.clone();

    if is_root {
        let new_root = match make_node(
            trans,
            btree_id,
            level + 1,
            POS_MAX,
            vec![left_key.clone(), right_key.clone()],
        ) {
            Ok(n) => n,
            Err(e) => {
                discard_new_node(cs, &left);
                discard_new_node(cs, &right);
                return Err(e);
            }
        };
        new_root.set_flag(NodeFlags::NOEVICT);
        cs.set_btree_root(btree_id, new_root.clone(), level + 1);
        new_root.lock.unlock(SixLockType::Write);
        cs.journal
            .add_entry(JournalPayload::Keys(vec![left_key, right_key]));
    } else {
        let parent = trans
            .iter_node(iter_idx, level as usize + 1)
            .expect("intent held on parent");
        // Parent write before child write: top-down.
        parent.lock.upgrade();
        {
            let mut guard = parent.data.write();
            let d = guard.as_mut().expect("locked parent has data");
            for set in &mut d.keys.sets {
                for pk in &mut set.keys {
                    if !pk.is_deleted() && pk.p == old_key.p && pk.btree_ptr().is_some() {
                        *pk = Bkey::deleted(pk.p, pk.size);
                    }
                }
            }
            d.keys.ensure_writable();
            d.keys.insert(left_key.clone());
            d.keys.insert(right_key.clone());
            if d.keys.needs_sort() {
                d.keys.sort_all();
                d.written = 0;
            }
        }
        parent.set_flag(NodeFlags::DIRTY);
        cs.journal
            .add_entry(JournalPayload::Keys(vec![left_key, right_key]));
        // Parent durable before the old child's bucket can be reused.
        let write_ret = btree_io::write_node(cs, &parent);
        parent.lock.downgrade_write();
        trans.fix_iterators_on(&parent);
        write_ret?;
    }

    left.lock.unlock(SixLockType::Write);
    right.lock.unlock(SixLockType::Write);

    // Retire the old node. Our iterator keeps its intent share; everyone
    // else drops theirs, then we upgrade (bumping the seq so stale relocks
    // fail), unhash, and free the bucket.
    trans.drop_node_other_iters(&node, iter_idx);
    node.lock.upgrade();
    node.clear_flag(NodeFlags::DIRTY | NodeFlags::NOEVICT);
    cs.node_cache.evict(&node);
    trans.forget_node(iter_idx, level as usize);
    node.lock.unlock(SixLockType::Write);
    if let Some(ptr) = old_key.btree_ptr().and_then(|e| e.first_ptr()) {
        cs.free_btree_bucket(ptr);
    }

    // The parent may itself have gone over; handle it while the intent is
    // still in hand.
    if !is_root {
        if let Some(parent) = trans.iter_node(iter_idx, level as usize + 1) {
            if node_needs_split(&parent) {
                let _ = btree_split(trans, iter_idx, level + 1);
            }
        }
    }

    debug!("split complete at level {level}");
    Ok(())
}

impl Bkey {
    /// Keys that occupy a sector range (participate in overlap logic).
    pub fn is_extent_like(&self) -> bool {
        matches!(self.val, Bval::Extent(_) | Bval::Check | Bval::Deleted) && self.size > 0
    }
}
