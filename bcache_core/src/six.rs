//! The three-mode btree node lock: shared read, exclusive intent, exclusive
//! write.
//!
//! Multiple readers may coexist with one intent holder; write excludes
//! everything and is only taken by upgrading from intent once readers have
//! drained. Every write acquisition/release pair bumps `seq` twice, so an
//! odd `seq` means write-locked and an unchanged even `seq` means the node
//! was not modified in between, which is the basis of the iterator
//! relock protocol.
//!
//! Intent is a count rather than a flag so that linked iterators belonging
//! to one task can share a single logical acquisition via
//! [`SixLock::lock_increment`].

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SixLockType {
    Read,
    Intent,
    Write,
}

#[derive(Debug, Default)]
struct State {
    readers: u32,
    intent: u32,
    write: bool,
}

#[derive(Debug)]
pub struct SixLock {
    state: Mutex<State>,
    wait: Condvar,
    seq: AtomicU64,
}

impl SixLock {
    pub fn new() -> SixLock {
        SixLock {
            state: Mutex::new(State::default()),
            wait: Condvar::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Current sequence number. Even = not write-locked.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn lock(&self, ty: SixLockType) {
        let mut s = self.state.lock();
        match ty {
            SixLockType::Read => {
                while s.write {
                    self.wait.wait(&mut s);
                }
                s.readers += 1;
            }
            SixLockType::Intent => {
                while s.intent > 0 || s.write {
                    self.wait.wait(&mut s);
                }
                s.intent = 1;
            }
            SixLockType::Write => {
                while s.intent > 0 || s.write {
                    self.wait.wait(&mut s);
                }
                s.intent = 1;
                while s.readers > 0 {
                    self.wait.wait(&mut s);
                }
                s.write = true;
                self.seq.fetch_add(1, Ordering::Release);
            }
        }
    }

    pub fn try_lock(&self, ty: SixLockType) -> bool {
        let mut s = self.state.lock();
        match ty {
            SixLockType::Read => {
                if s.write {
                    return false;
                }
                s.readers += 1;
            }
            SixLockType::Intent => {
                if s.intent > 0 || s.write {
                    return false;
                }
                s.intent = 1;
            }
            SixLockType::Write => {
                if s.intent > 0 || s.write || s.readers > 0 {
                    return false;
                }
                s.intent = 1;
                s.write = true;
                self.seq.fetch_add(1, Ordering::Release);
            }
        }
        true
    }

    pub fn unlock(&self, ty: SixLockType) {
        let mut s = self.state.lock();
        match ty {
            SixLockType::Read => {
                debug_assert!(s.readers > 0);
                s.readers -= 1;
            }
            SixLockType::Intent => {
                debug_assert!(s.intent > 0 && !s.write);
                s.intent -= 1;
            }
            SixLockType::Write => {
                debug_assert!(s.write && s.intent > 0);
                self.seq.fetch_add(1, Ordering::Release);
                s.write = false;
                s.intent -= 1;
            }
        }
        drop(s);
        self.wait.notify_all();
    }

    /// Intent → write: drain readers, then set write. Caller must hold
    /// intent.
    pub fn upgrade(&self) {
        let mut s = self.state.lock();
        debug_assert!(s.intent > 0 && !s.write);
        while s.readers > 0 {
            self.wait.wait(&mut s);
        }
        s.write = true;
        self.seq.fetch_add(1, Ordering::Release);
    }

    pub fn try_upgrade(&self) -> bool {
        let mut s = self.state.lock();
        debug_assert!(s.intent > 0 && !s.write);
        if s.readers > 0 {
            return false;
        }
        s.write = true;
        self.seq.fetch_add(1, Ordering::Release);
        true
    }

    /// Write → intent, keeping the lock held.
    pub fn downgrade_write(&self) {
        let mut s = self.state.lock();
        debug_assert!(s.write);
        self.seq.fetch_add(1, Ordering::Release);
        s.write = false;
        drop(s);
        self.wait.notify_all();
    }

    /// Intent → read, keeping the lock held.
    pub fn downgrade_intent(&self) {
        let mut s = self.state.lock();
        debug_assert!(s.intent > 0 && !s.write);
        s.intent -= 1;
        s.readers += 1;
        drop(s);
        self.wait.notify_all();
    }

    /// Re-take a lock previously held at sequence `want_seq`; fails if the
    /// node was write-locked in between (seq moved) or the mode is
    /// currently unavailable.
    pub fn relock(&self, ty: SixLockType, want_seq: u64) -> bool {
        let mut s = self.state.lock();
        if self.seq.load(Ordering::Acquire) != want_seq {
            return false;
        }
        match ty {
            SixLockType::Read => {
                if s.write {
                    return false;
                }
                s.readers += 1;
            }
            SixLockType::Intent => {
                if s.intent > 0 || s.write {
                    return false;
                }
                s.intent = 1;
            }
            SixLockType::Write => return false,
        }
        true
    }

    /// Share an acquisition already held by a linked iterator of the same
    /// task. Never blocks; the caller guarantees the mode is already held.
    pub fn lock_increment(&self, ty: SixLockType) {
        let mut s = self.state.lock();
        match ty {
            SixLockType::Read => {
                debug_assert!(!s.write);
                s.readers += 1;
            }
            SixLockType::Intent => {
                debug_assert!(s.intent > 0);
                s.intent += 1;
            }
            SixLockType::Write => unreachable!("write locks are never shared"),
        }
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().write
    }
}

impl Default for SixLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share() {
        let l = SixLock::new();
        l.lock(SixLockType::Read);
        assert!(l.try_lock(SixLockType::Read));
        assert!(l.try_lock(SixLockType::Intent));
        assert!(!l.try_lock(SixLockType::Intent));
        l.unlock(SixLockType::Read);
        l.unlock(SixLockType::Read);
        l.unlock(SixLockType::Intent);
    }

    #[test]
    fn write_excludes_all() {
        let l = SixLock::new();
        l.lock(SixLockType::Write);
        assert!(!l.try_lock(SixLockType::Read));
        assert!(!l.try_lock(SixLockType::Intent));
        assert!(!l.try_lock(SixLockType::Write));
        l.unlock(SixLockType::Write);
        assert!(l.try_lock(SixLockType::Read));
        l.unlock(SixLockType::Read);
    }

    #[test]
    fn seq_odd_while_write_locked() {
        let l = SixLock::new();
        assert_eq!(l.seq() % 2, 0);
        l.lock(SixLockType::Write);
        assert_eq!(l.seq() % 2, 1);
        l.unlock(SixLockType::Write);
        assert_eq!(l.seq() % 2, 0);
    }

    #[test]
    fn relock_detects_modification() {
        let l = SixLock::new();
        l.lock(SixLockType::Read);
        let seq = l.seq();
        l.unlock(SixLockType::Read);

        assert!(l.relock(SixLockType::Read, seq));
        l.unlock(SixLockType::Read);

        l.lock(SixLockType::Write);
        l.unlock(SixLockType::Write);
        assert!(!l.relock(SixLockType::Read, seq));
    }

    #[test]
    fn upgrade_drains_readers() {
        let l = Arc::new(SixLock::new());
        l.lock(SixLockType::Intent);
        l.lock(SixLockType::Read);
        assert!(!l.try_upgrade());

        let l2 = l.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            l2.unlock(SixLockType::Read);
        });
        l.upgrade();
        assert!(l.is_write_locked());
        l.unlock(SixLockType::Write);
        h.join().unwrap();
    }

    #[test]
    fn downgrade_intent_admits_other_intent() {
        let l = SixLock::new();
        l.lock(SixLockType::Intent);
        l.downgrade_intent();
        assert!(l.try_lock(SixLockType::Intent));
        l.unlock(SixLockType::Intent);
        l.unlock(SixLockType::Read);
    }

    #[test]
    fn lock_increment_shares_intent() {
        let l = SixLock::new();
        l.lock(SixLockType::Intent);
        l.lock_increment(SixLockType::Intent);
        l.unlock(SixLockType::Intent);
        // Still held by the second share.
        assert!(!l.try_lock(SixLockType::Intent));
        l.unlock(SixLockType::Intent);
        assert!(l.try_lock(SixLockType::Intent));
        l.unlock(SixLockType::Intent);
    }
}
