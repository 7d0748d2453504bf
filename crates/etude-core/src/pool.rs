// src/pool.rs
use crate::error::{EtudeError, EtudeResult};
use crate::sync::Semaphore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, Scope};
use tracing::{debug, info};

/// Fixed pool of worker threads draining a bounded FIFO queue.
///
/// Workers are scoped threads: they borrow the pool and whatever their handler borrows,
/// so nothing they touch can be dropped while they still run.
pub struct WorkerPool<T> {
    queue: Mutex<VecDeque<T>>,
    available: Semaphore,
    stop: AtomicBool,
    workers: usize,
    max_requests: usize,
}

impl<T: Send> WorkerPool<T> {
    /// `max_requests` is the number of items that may wait in the queue at once.
    pub fn new(workers: usize, max_requests: usize) -> EtudeResult<Self> {
        if workers == 0 {
            return Err(EtudeError::Config("worker count must be positive".into()));
        }
        if max_requests == 0 {
            return Err(EtudeError::Config("queue capacity must be positive".into()));
        }
        Ok(Self {
            queue: Mutex::new(VecDeque::with_capacity(max_requests)),
            available: Semaphore::new(0),
            stop: AtomicBool::new(false),
            workers,
            max_requests,
        })
    }

    /// Queue an item for the workers. Never blocks; a full queue rejects the item.
    pub fn submit(&self, item: T) -> EtudeResult<()> {
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= self.max_requests {
                return Err(EtudeError::QueueFull);
            }
            queue.push_back(item);
        }
        self.available.post();
        Ok(())
    }

    /// Start the workers inside `scope`. Each popped item is passed to `handler`.
    pub fn spawn_workers<'scope, 'env, F>(
        &'env self,
        scope: &'scope Scope<'scope, 'env>,
        handler: &'env F,
    ) -> EtudeResult<()>
    where
        T: 'env,
        F: Fn(T) + Sync,
    {
        for i in 0..self.workers {
            thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn_scoped(scope, move || self.worker_loop(i, handler))?;
        }
        info!(workers = self.workers, queue = self.max_requests, "worker pool started");
        Ok(())
    }

    fn worker_loop<F: Fn(T)>(&self, id: usize, handler: &F) {
        loop {
            self.available.wait();
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let item = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            if let Some(item) = item {
                handler(item);
            }
        }
        debug!(worker = id, "worker exiting");
    }

    /// Ask every worker to exit at its next wake-up. In-flight items finish first;
    /// queued ones are dropped with the pool.
    pub fn shutdown(&self) {
        if !self.is_empty() {
            debug!(dropped = self.len(), "dropping queued items at shutdown");
        }
        self.stop.store(true, Ordering::Release);
        for _ in 0..self.workers {
            self.available.post();
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_requests
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}
