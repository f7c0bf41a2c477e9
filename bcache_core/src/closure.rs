//! Completion-continuation primitive for chaining asynchronous I/O stages.
//!
//! A closure is a refcount plus an optional continuation. Stages `get` the
//! closure before starting work and `put` when done; the drop to zero runs
//! the continuation, on the worker pool when one is attached, inline
//! otherwise. At most one continuation of a given closure runs at a time,
//! and a closure is non-cancellable once submitted; teardown waits via
//! [`Closure::sync`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    tx: Mutex<Option<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(nr_threads: usize, name: &str) -> Arc<WorkerPool> {
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut threads = Vec::with_capacity(nr_threads);

        for i in 0..nr_threads {
            let rx = rx.clone();
            let thread_name = format!("{name}/{i}");
            threads.push(
                std::thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || loop {
                        let job = {
                            let rx = rx.lock();
                            rx.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
                    .expect("spawning worker thread"),
            );
        }

        Arc::new(WorkerPool {
            tx: Mutex::new(Some(tx)),
            threads: Mutex::new(threads),
        })
    }

    pub fn queue(&self, job: Job) {
        // After shutdown, run inline so the completion is never lost.
        let sent = {
            let tx = self.tx.lock();
            match tx.as_ref() {
                Some(tx) => tx.send(job).map_err(|e| e.0),
                None => Err(job),
            }
        };
        if let Err(job) = sent {
            job();
        }
    }

    /// Stop accepting work and join the threads. Queued jobs drain first.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        let mut threads = self.threads.lock();
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }
}

struct ClosureState {
    cont: Option<Job>,
    done: bool,
}

struct ClosureInner {
    remaining: AtomicUsize,
    state: Mutex<ClosureState>,
    done_wait: Condvar,
    pool: Option<Arc<WorkerPool>>,
}

#[derive(Clone)]
pub struct Closure {
    inner: Arc<ClosureInner>,
}

impl Closure {
    /// New closure with one reference held by the caller.
    pub fn new(pool: Option<Arc<WorkerPool>>) -> Closure {
        Closure {
            inner: Arc::new(ClosureInner {
                remaining: AtomicUsize::new(1),
                state: Mutex::new(ClosureState { cont: None, done: false }),
                done_wait: Condvar::new(),
                pool,
            }),
        }
    }

    /// Register the continuation to run when the count drops to zero.
    pub fn set_continuation<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut s = self.inner.state.lock();
        debug_assert!(s.cont.is_none());
        s.cont = Some(Box::new(f));
    }

    pub fn get(&self) {
        let prev = self.inner.remaining.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "closure get after drop to zero");
    }

    pub fn put(&self) {
        let prev = self.inner.remaining.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
        if prev != 1 {
            return;
        }

        let cont = {
            let mut s = self.inner.state.lock();
            s.done = true;
            s.cont.take()
        };
        self.inner.done_wait.notify_all();

        if let Some(cont) = cont {
            match &self.inner.pool {
                Some(pool) => pool.queue(cont),
                None => cont(),
            }
        }
    }

    /// Block until the count has dropped to zero.
    pub fn sync(&self) {
        let mut s = self.inner.state.lock();
        while !s.done {
            self.inner.done_wait.wait(&mut s);
        }
    }

    /// Rearm a completed closure for another round.
    pub fn reinit(&self) {
        let mut s = self.inner.state.lock();
        debug_assert!(s.done, "reinit of a live closure");
        s.done = false;
        s.cont = None;
        self.inner.remaining.store(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn continuation_runs_on_last_put() {
        let fired = Arc::new(AtomicU32::new(0));
        let cl = Closure::new(None);
        let f = fired.clone();
        cl.set_continuation(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        cl.get();
        cl.put();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        cl.put();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sync_waits_for_parallel_puts() {
        let cl = Closure::new(None);
        for _ in 0..4 {
            cl.get();
            let cl2 = cl.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                cl2.put();
            });
        }
        cl.put();
        cl.sync();
    }

    #[test]
    fn pool_runs_continuation() {
        let pool = WorkerPool::new(2, "test-wq");
        let fired = Arc::new(AtomicU32::new(0));

        let cl = Closure::new(Some(pool.clone()));
        let f = fired.clone();
        cl.set_continuation(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        cl.put();
        cl.sync();

        pool.shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reinit_allows_reuse() {
        let count = Arc::new(AtomicU32::new(0));
        let cl = Closure::new(None);
        for _ in 0..3 {
            let c = count.clone();
            cl.set_continuation(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            cl.put();
            cl.sync();
            cl.reinit();
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
