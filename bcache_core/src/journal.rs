//! Journal interface.
//!
//! The core needs very little from the journal: updates return a sequence
//! number, `flush_seq` waits for durability of everything up to a sequence,
//! and `meta_async` runs a callback once the current head has committed.
//! Journal sequence numbers define the visible order of metadata updates;
//! in particular a freed bucket's generation bump must commit before the
//! bucket reappears on a reserve fifo.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::bkey::Bkey;
use crate::errcode::{ErrCode, Result};

#[derive(Debug, Clone)]
pub enum JournalPayload {
    /// Btree inserts.
    Keys(Vec<Bkey>),
    /// Bucket generation bumps from the invalidate pipeline.
    GenUpdate { dev: u8, buckets: Vec<(u64, u8)> },
}

impl fmt::Display for JournalPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalPayload::Keys(keys) => write!(f, "keys nr={}", keys.len()),
            JournalPayload::GenUpdate { dev, buckets } => {
                write!(f, "gen_update dev={} nr={}", dev, buckets.len())
            }
        }
    }
}

type MetaCb = Box<dyn FnOnce() + Send + 'static>;

struct JournalState {
    head: u64,
    committed: u64,
    /// Callbacks waiting on commit of the sequence they were registered at.
    pending_meta: Vec<(u64, MetaCb)>,
    /// Recent entries, for the debug dump.
    recent: VecDeque<(u64, JournalPayload)>,
}

const RECENT_ENTRIES: usize = 256;

/// In-memory journal. Commits every entry immediately unless switched to
/// manual mode, where commit happens only on [`MemJournal::commit_all`].
/// Manual mode is how tests hold the allocator at "waiting for journal
/// commit".
pub struct MemJournal {
    state: Mutex<JournalState>,
    commit_wait: Condvar,
    auto_commit: AtomicBool,
    errored: AtomicBool,
}

impl MemJournal {
    pub fn new() -> MemJournal {
        MemJournal {
            state: Mutex::new(JournalState {
                head: 0,
                committed: 0,
                pending_meta: Vec::new(),
                recent: VecDeque::new(),
            }),
            commit_wait: Condvar::new(),
            auto_commit: AtomicBool::new(true),
            errored: AtomicBool::new(false),
        }
    }

    pub fn set_auto_commit(&self, auto: bool) {
        self.auto_commit.store(auto, Ordering::SeqCst);
    }

    /// Mark the journal failed: flushes error out, nothing commits again.
    pub fn set_error(&self) {
        self.errored.store(true, Ordering::SeqCst);
        self.commit_wait.notify_all();
    }

    pub fn errored(&self) -> bool {
        self.errored.load(Ordering::SeqCst)
    }

    fn commit_locked(&self, s: &mut JournalState, up_to: u64) {
        if self.errored() {
            return;
        }
        s.committed = s.committed.max(up_to);
        let committed = s.committed;
        let mut i = 0;
        while i < s.pending_meta.len() {
            if s.pending_meta[i].0 <= committed {
                let (_, cb) = s.pending_meta.swap_remove(i);
                cb();
            } else {
                i += 1;
            }
        }
        self.commit_wait.notify_all();
    }

    /// Append an entry; returns its sequence number.
    pub fn add_entry(&self, payload: JournalPayload) -> u64 {
        let mut s = self.state.lock();
        s.head += 1;
        let seq = s.head;
        if s.recent.len() == RECENT_ENTRIES {
            s.recent.pop_front();
        }
        s.recent.push_back((seq, payload));
        if self.auto_commit.load(Ordering::SeqCst) {
            self.commit_locked(&mut s, seq);
        }
        seq
    }

    /// Wait until everything up to `seq` is committed.
    pub fn flush_seq(&self, seq: u64) -> Result<()> {
        let mut s = self.state.lock();
        while s.committed < seq {
            if self.errored() {
                return Err(ErrCode::Inconsistent);
            }
            self.commit_wait.wait(&mut s);
        }
        if self.errored() {
            return Err(ErrCode::Inconsistent);
        }
        Ok(())
    }

    /// Run `cb` once the current head has committed. In auto-commit mode
    /// that is immediately.
    pub fn meta_async(&self, cb: MetaCb) {
        let mut s = self.state.lock();
        let at = s.head;
        if s.committed >= at {
            drop(s);
            cb();
        } else {
            s.pending_meta.push((at, cb));
        }
    }

    /// Commit everything outstanding (manual-mode pump).
    pub fn commit_all(&self) {
        let mut s = self.state.lock();
        let head = s.head;
        self.commit_locked(&mut s, head);
    }

    pub fn cur_seq(&self) -> u64 {
        self.state.lock().head
    }

    pub fn committed_seq(&self) -> u64 {
        self.state.lock().committed
    }

    /// Textual dump of recent entries.
    pub fn debug_dump(&self) -> String {
        let s = self.state.lock();
        let mut out = format!(
            "journal: head {} committed {}\n",
            s.head, s.committed
        );
        for (seq, payload) in &s.recent {
            out.push_str(&format!("  seq {seq}: {payload}\n"));
        }
        out
    }
}

impl Default for MemJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn auto_commit_flush_returns_immediately() {
        let j = MemJournal::new();
        let seq = j.add_entry(JournalPayload::Keys(vec![]));
        assert_eq!(seq, 1);
        j.flush_seq(seq).unwrap();
        assert_eq!(j.committed_seq(), 1);
    }

    #[test]
    fn manual_mode_blocks_until_pumped() {
        let j = Arc::new(MemJournal::new());
        j.set_auto_commit(false);
        let seq = j.add_entry(JournalPayload::Keys(vec![]));
        assert_eq!(j.committed_seq(), 0);

        let j2 = j.clone();
        let h = std::thread::spawn(move || j2.flush_seq(seq));
        std::thread::sleep(std::time::Duration::from_millis(10));
        j.commit_all();
        h.join().unwrap().unwrap();
    }

    #[test]
    fn meta_async_ordering() {
        let j = MemJournal::new();
        j.set_auto_commit(false);
        j.add_entry(JournalPayload::Keys(vec![]));

        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        j.meta_async(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        j.commit_all();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_fails_flush() {
        let j = MemJournal::new();
        j.set_auto_commit(false);
        let seq = j.add_entry(JournalPayload::Keys(vec![]));
        j.set_error();
        assert_eq!(j.flush_seq(seq), Err(ErrCode::Inconsistent));
    }
}
