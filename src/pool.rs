//! Ref-counted shared worker pool for the thread-pool backend.
//!
//! All files using the thread-pool backend share one process-wide pool.
//! The pool is created when the first backend acquires a [`PoolRef`] and
//! torn down (workers joined) when the last reference drops, so an
//! application that never touches the fallback backend pays nothing.

use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

pub(crate) struct ThreadPool {
    inner: Mutex<PoolInner>,
}

impl ThreadPool {
    fn new(threads: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..threads.max(1))
            .map(|_| {
                let rx = Arc::clone(&rx);
                thread::spawn(move || loop {
                    let job = rx.lock().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
            })
            .collect();
        Self {
            inner: Mutex::new(PoolInner {
                tx: Some(tx),
                workers,
            }),
        }
    }

    fn spawn(&self, job: Job) {
        let inner = self.inner.lock();
        if let Some(tx) = &inner.tx {
            // A send error means shutdown already started; the job is
            // dropped, which only happens after every backend is gone.
            let _ = tx.send(job);
        }
    }

    fn shutdown(&self) {
        let (tx, workers) = {
            let mut inner = self.inner.lock();
            (inner.tx.take(), std::mem::take(&mut inner.workers))
        };
        drop(tx);
        for worker in workers {
            let _ = worker.join();
        }
    }
}

struct SharedPool {
    pool: Option<Arc<ThreadPool>>,
    refs: u64,
}

static SHARED: Mutex<SharedPool> = Mutex::new(SharedPool {
    pool: None,
    refs: 0,
});

/// Handle keeping the shared worker pool alive.
pub(crate) struct PoolRef {
    pool: Arc<ThreadPool>,
}

impl PoolRef {
    /// Acquires the shared pool, creating it on first use.
    pub(crate) fn acquire() -> Self {
        let mut shared = SHARED.lock();
        if shared.refs == 0 {
            debug_assert!(shared.pool.is_none());
            let threads = thread::available_parallelism().map_or(4, usize::from);
            shared.pool = Some(Arc::new(ThreadPool::new(threads)));
            log::debug!("shared worker pool created with {threads} threads");
        }
        shared.refs += 1;
        let pool = match &shared.pool {
            Some(pool) => Arc::clone(pool),
            None => unreachable!("pool exists while refs > 0"),
        };
        Self { pool }
    }

    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        self.pool.spawn(Box::new(job));
    }
}

impl Drop for PoolRef {
    fn drop(&mut self) {
        let retired = {
            let mut shared = SHARED.lock();
            debug_assert!(shared.refs > 0);
            shared.refs -= 1;
            if shared.refs == 0 {
                log::debug!("shared worker pool torn down");
                shared.pool.take()
            } else {
                None
            }
        };
        if let Some(pool) = retired {
            pool.shutdown();
        }
    }
}
