//! Single-writer queue for durable writes.
//!
//! All mutations funnel through one background worker so SQLite never
//! sees interleaved transactions from concurrent callers. Submissions
//! complete in FIFO order; each submitter awaits its own result slot.
//! Shutdown drains the queue before the worker exits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use ag_domain::{Error, Result};

use crate::store::Store;

/// Backoff schedule for writes that hit a held file lock.
const BUSY_RETRY_DELAYS_MS: [u64; 3] = [50, 100, 200];

/// One queued write: attempt it; `false` means "busy, try again"
/// (unless `last`, in which case the busy error has been delivered).
type WriteOp = Box<dyn FnMut(&Store, bool) -> bool + Send>;

pub struct WriteQueue {
    store: Store,
    tx: Mutex<Option<mpsc::UnboundedSender<WriteOp>>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl WriteQueue {
    /// Create the queue without starting the worker. `enqueue` before
    /// `start` falls back to direct execution with a warning.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            tx: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start the background worker. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::warn!("write queue worker already running");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel::<WriteOp>();
        *self.tx.lock() = Some(tx);
        self.shutdown.store(false, Ordering::SeqCst);

        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        let pending = self.pending.clone();
        *worker = Some(tokio::spawn(writer_loop(store, rx, shutdown, pending)));
        tracing::info!("write queue started - all DB writes will be serialized");
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Number of writes waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Enqueue a write and await its result.
    ///
    /// The job may run more than once when the store reports a held
    /// lock, so it takes `&Store` through a `Fn`.
    pub async fn enqueue<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Store) -> Result<T> + Send + 'static,
    {
        let sender = self.tx.lock().clone();
        let Some(sender) = sender else {
            // Queue not started: execute in the caller. Tests rely on
            // this; the server bootstrap always starts the queue before
            // any write path is reachable, so hitting this in
            // production is a wiring defect.
            tracing::error!("write queue not initialized, executing directly");
            return job(&self.store);
        };

        let (result_tx, result_rx) = oneshot::channel::<Result<T>>();
        let mut result_slot = Some(result_tx);
        let op: WriteOp = Box::new(move |store, last| {
            match job(store) {
                Err(e) if e.is_storage_busy() && !last => false,
                outcome => {
                    if let Some(slot) = result_slot.take() {
                        let _ = slot.send(outcome);
                    }
                    true
                }
            }
        });

        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(op).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Lifecycle("write queue worker is gone".into()));
        }

        result_rx
            .await
            .map_err(|_| Error::Lifecycle("write queue dropped the result slot".into()))?
    }

    /// Stop the worker gracefully, draining pending writes up to
    /// `timeout`, then aborting.
    pub async fn stop(&self, timeout: Duration) {
        let handle = {
            let mut worker = self.worker.lock();
            self.shutdown.store(true, Ordering::SeqCst);
            // Dropping the sender lets the worker observe end-of-queue
            // after the drain.
            *self.tx.lock() = None;
            worker.take()
        };
        let Some(handle) = handle else { return };

        tracing::info!("stopping write queue...");
        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => tracing::info!("write queue stopped"),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "write queue didn't stop in time, cancelling"
                );
                abort.abort();
            }
        }
    }
}

async fn writer_loop(
    store: Store,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    shutdown: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
) {
    loop {
        // Poll with a timeout so the shutdown flag stays responsive even
        // when the queue is quiet.
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(mut op)) => {
                run_op(&store, &mut op).await;
                pending.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(None) => {
                tracing::info!("write queue shut down gracefully");
                return;
            }
            Err(_) => {
                if shutdown.load(Ordering::SeqCst) {
                    // Drain whatever is still queued before exiting.
                    while let Ok(mut op) = rx.try_recv() {
                        run_op(&store, &mut op).await;
                        pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    tracing::info!("write queue shut down gracefully");
                    return;
                }
            }
        }
    }
}

async fn run_op(store: &Store, op: &mut WriteOp) {
    if op(store, false) {
        return;
    }
    for (attempt, delay_ms) in BUSY_RETRY_DELAYS_MS.iter().enumerate() {
        tracing::warn!(attempt = attempt + 1, "storage busy, retrying write");
        tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
        let last = attempt == BUSY_RETRY_DELAYS_MS.len() - 1;
        if op(store, last) {
            return;
        }
    }
}
