//! Worker pool for task runs
//!
//! Provides bounded concurrency across tasks:
//! - at most `max_workers` runs execute at once, the rest wait for a permit
//! - a task id has at most one run in flight
//! - shutdown stops intake and drains running work

use crate::error::PoolError;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use sdo_artifact::TaskId;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Runs accepted
    pub submitted: usize,
    /// Runs finished (including panicked ones)
    pub completed: usize,
    /// Submissions refused
    pub rejected: usize,
    /// Runs in flight or waiting for a permit
    pub in_flight: usize,
}

/// Removes the task from the running set even if the run panics
struct RunGuard {
    running: Arc<DashMap<TaskId, ()>>,
    stats: Arc<Mutex<PoolStats>>,
    task_id: TaskId,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.remove(&self.task_id);
        self.stats.lock().completed += 1;
    }
}

/// Bounded pool of task runs
#[derive(Debug)]
pub struct WorkerPool {
    max_workers: usize,
    permits: Arc<Semaphore>,
    running: Arc<DashMap<TaskId, ()>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<Mutex<PoolStats>>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Pool with `max_workers` concurrent runs (at least one)
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            permits: Arc::new(Semaphore::new(max_workers)),
            running: Arc::new(DashMap::new()),
            handles: Mutex::new(Vec::new()),
            stats: Arc::new(Mutex::new(PoolStats::default())),
            closed: AtomicBool::new(false),
        }
    }

    /// Configured concurrency
    #[inline]
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Spawn a run for `task_id`
    pub fn submit<F>(&self, task_id: TaskId, run: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            self.stats.lock().rejected += 1;
            return Err(PoolError::ShuttingDown);
        }
        if self.running.insert(task_id, ()).is_some() {
            self.stats.lock().rejected += 1;
            warn!(task_id = %task_id, "task already has a worker; submission refused");
            return Err(PoolError::AlreadyRunning(task_id));
        }
        self.stats.lock().submitted += 1;

        let guard = RunGuard {
            running: Arc::clone(&self.running),
            stats: Arc::clone(&self.stats),
            task_id,
        };
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            debug!(task_id = %task_id, "worker started");
            run.await;
        });

        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Whether a run for the task is in flight
    #[must_use]
    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.running.contains_key(&task_id)
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = *self.stats.lock();
        stats.in_flight = self.running.len();
        stats
    }

    /// Wait for every run submitted so far
    pub async fn drain(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                return;
            }
            for result in join_all(handles).await {
                if let Err(e) = result {
                    warn!(error = %e, "worker ended abnormally");
                }
            }
        }
    }

    /// Refuse new work and drain
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.drain().await;
    }
}
