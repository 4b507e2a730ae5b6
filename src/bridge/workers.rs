//! Per-key ordered job execution
//!
//! Jobs submitted under the same key run one after another in submission
//! order; jobs under different keys run concurrently. Each key gets a worker
//! task with a bounded queue, which exits after sitting idle.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Idle time after which a key's worker exits
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("Queue for '{key}' is full ({capacity} jobs)")]
    QueueFull { key: String, capacity: usize },
    #[error("Not accepting new work")]
    Stopped,
}

/// Outcome of a bounded drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Jobs abandoned when the timeout hit
    pub undelivered: usize,
    pub timed_out: bool,
}

struct Worker {
    tx: mpsc::Sender<Job>,
    abort: AbortHandle,
}

struct Shared {
    name: &'static str,
    capacity: usize,
    queues: Mutex<HashMap<String, Worker>>,
    accepting: AtomicBool,
    pending: watch::Sender<usize>,
}

/// Ordered-per-key, concurrent-across-keys executor
#[derive(Clone)]
pub struct KeyedWorkers {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl KeyedWorkers {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                name,
                capacity: capacity.max(1),
                queues: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                pending,
            }),
        }
    }

    /// Queue a job behind every job already queued under `key`
    pub fn submit<F>(&self, key: &str, job: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_accepting() {
            return Err(SubmitError::Stopped);
        }

        let mut queues = lock(&self.shared.queues);
        let job: Job = Box::pin(job);
        let job = match queues.get(key) {
            Some(worker) => match worker.tx.try_send(job) {
                Ok(()) => {
                    self.shared.pending.send_modify(|n| *n += 1);
                    return Ok(());
                }
                Err(TrySendError::Full(_)) => {
                    return Err(SubmitError::QueueFull {
                        key: key.to_string(),
                        capacity: self.shared.capacity,
                    });
                }
                // Worker is gone; start a new one below
                Err(TrySendError::Closed(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::channel(self.shared.capacity);
        if tx.try_send(job).is_err() {
            return Err(SubmitError::Stopped);
        }
        self.shared.pending.send_modify(|n| *n += 1);

        let handle = tokio::spawn(run_worker(
            Arc::clone(&self.shared),
            key.to_string(),
            rx,
        ));
        queues.insert(
            key.to_string(),
            Worker {
                tx,
                abort: handle.abort_handle(),
            },
        );
        Ok(())
    }

    pub fn stop_accepting(&self) {
        if self.shared.accepting.swap(false, Ordering::SeqCst) {
            debug!(workers = self.shared.name, "Stopped accepting new work");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        *self.shared.pending.borrow()
    }

    /// Keys with a live worker
    pub fn active_keys(&self) -> usize {
        lock(&self.shared.queues).len()
    }

    /// Stop accepting and wait for queued jobs, up to `timeout`
    ///
    /// On timeout the remaining jobs are abandoned and their count reported.
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        self.stop_accepting();

        let mut pending_rx = self.shared.pending.subscribe();
        let drained = tokio::time::timeout(timeout, pending_rx.wait_for(|n| *n == 0))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);

        if drained {
            return DrainReport {
                undelivered: 0,
                timed_out: false,
            };
        }

        let undelivered = self.pending();
        for (_, worker) in lock(&self.shared.queues).drain() {
            worker.abort.abort();
        }
        self.shared.pending.send_replace(0);
        warn!(
            workers = self.shared.name,
            undelivered, "Drain timed out, abandoning queued work"
        );
        DrainReport {
            undelivered,
            timed_out: true,
        }
    }
}

async fn run_worker(shared: Arc<Shared>, key: String, mut rx: mpsc::Receiver<Job>) {
    loop {
        let job = match tokio::time::timeout(WORKER_IDLE_TIMEOUT, rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => {
                // Retire under the map lock so no submit can slip in behind us
                let mut queues = lock(&shared.queues);
                match rx.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        queues.remove(&key);
                        break;
                    }
                }
            }
        };

        job.await;
        shared.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}
