//! In-memory btree nodes.
//!
//! A node is a shell (never freed until teardown) plus a detachable data
//! buffer the shrinker can take back. The shell carries the six-mode lock,
//! flags, and its own key (the pointer key its parent reaches it by); the
//! node's max key equals that key's position.

pub mod cache;
pub mod io;
pub mod iter;
pub mod update;

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::bkey::{Bkey, BtreeId};
use crate::bset::NodeKeys;
use crate::six::SixLock;

pub const BTREE_MAX_DEPTH: usize = 4;

/// Split threshold: total keys (live or not) a node may hold before the
/// update path splits it.
pub const BTREE_NODE_MAX_KEYS: usize = 128;

bitflags! {
    pub struct NodeFlags: u32 {
        const DIRTY           = 1 << 0;
        const WRITE_IN_FLIGHT = 1 << 1;
        const READ_ERROR      = 1 << 2;
        const WRITE_ERROR     = 1 << 3;
        const NOEVICT         = 1 << 4;
        const ACCESSED        = 1 << 5;
    }
}

#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub key: Bkey,
    pub level: u8,
    pub btree_id: BtreeId,
    /// Present while the node is in the cache's hash table.
    pub hash_key: Option<u64>,
}

#[derive(Debug, Default)]
pub struct NodeData {
    pub keys: NodeKeys,
    /// Sector cursor: how much of the node's bucket holds written sets.
    pub written: u32,
    /// Identity of the current on-disk image; regenerated on full rewrite
    /// so continuation records from an older image never parse as ours.
    pub node_seq: u64,
}

pub struct BtreeNode {
    /// Slab index in the node cache; stable for the shell's lifetime.
    pub slot: usize,
    pub lock: SixLock,
    pub meta: Mutex<NodeMeta>,
    pub data: RwLock<Option<Box<NodeData>>>,
    flags: AtomicU32,
    /// Waiters for WRITE_IN_FLIGHT to clear.
    write_done_lock: Mutex<()>,
    write_done: Condvar,
}

impl BtreeNode {
    pub fn new_shell(slot: usize, btree_id: BtreeId) -> BtreeNode {
        BtreeNode {
            slot,
            lock: SixLock::new(),
            meta: Mutex::new(NodeMeta {
                key: Bkey::deleted(crate::bkey::POS_MIN, 0),
                level: 0,
                btree_id,
                hash_key: None,
            }),
            data: RwLock::new(None),
            flags: AtomicU32::new(0),
            write_done_lock: Mutex::new(()),
            write_done: Condvar::new(),
        }
    }

    pub fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, f: NodeFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, f: NodeFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
        if f.contains(NodeFlags::WRITE_IN_FLIGHT) {
            let _guard = self.write_done_lock.lock();
            self.write_done.notify_all();
        }
    }

    pub fn test_flag(&self, f: NodeFlags) -> bool {
        self.flags().contains(f)
    }

    pub fn has_data(&self) -> bool {
        self.data.read().is_some()
    }

    /// Wait for an in-flight write to finish.
    pub fn wait_write_done(&self) {
        let mut guard = self.write_done_lock.lock();
        while self.test_flag(NodeFlags::WRITE_IN_FLIGHT) {
            self.write_done.wait(&mut guard);
        }
    }

    /// The hash key a node with this first pointer lives under.
    pub fn hash_of_key(key: &Bkey) -> Option<u64> {
        key.btree_ptr()
            .and_then(|e| e.first_ptr())
            .map(|p| p.cache_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::{pos, Bval, POS_MAX};
    use crate::extents::{ExtentVal, Ptr};

    #[test]
    fn flags_set_clear() {
        let n = BtreeNode::new_shell(0, BtreeId::Extents);
        assert!(!n.test_flag(NodeFlags::DIRTY));
        n.set_flag(NodeFlags::DIRTY | NodeFlags::ACCESSED);
        assert!(n.test_flag(NodeFlags::DIRTY));
        n.clear_flag(NodeFlags::DIRTY);
        assert!(!n.test_flag(NodeFlags::DIRTY));
        assert!(n.test_flag(NodeFlags::ACCESSED));
    }

    #[test]
    fn hash_follows_first_ptr() {
        let mut e = ExtentVal::new();
        e.push_ptr(Ptr { dev: 2, gen: 0, offset: 2048 });
        let k = Bkey::new(POS_MAX, 0, Bval::BtreePtr(e));
        assert_eq!(
            BtreeNode::hash_of_key(&k),
            Some(Ptr { dev: 2, gen: 0, offset: 2048 }.cache_key())
        );
        assert_eq!(BtreeNode::hash_of_key(&Bkey::deleted(pos(0, 0), 0)), None);
    }
}
