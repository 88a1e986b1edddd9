use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::executor::TransferExecutor;
use crate::types::{
    ProgressCallback, Transfer, TransferEvent, TransferHandle, TransferOptions,
};
use crate::{BandwidthLimiter, ResumeStore, TransferError};

/// Configuration for the transfer queue.
#[derive(Debug, Clone)]
pub struct TransferQueueConfig {
    /// Upper bound on concurrently running executors.
    pub max_concurrent_transfers: usize,
    /// Aggregate throughput cap shared by all executors, in bytes/second.
    pub bandwidth_limit: Option<u64>,
    /// How long finished transfers stay visible in the active set.
    pub eviction_grace: Duration,
    /// Buffered capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for TransferQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 3,
            bandwidth_limit: None,
            eviction_grace: Duration::from_secs(60),
            event_capacity: 256,
        }
    }
}

/// FIFO transfer queue with bounded concurrency, retry with back-off and
/// cancellation.
///
/// All scheduling state (pending order, running set, retry and eviction
/// deadlines) is owned by a single scheduler task; the public methods talk
/// to it over channels. Observers read transfer snapshots from a shared
/// registry.
pub struct TransferQueue {
    shared: Arc<QueueShared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events_rx: Mutex<Option<mpsc::Receiver<TransferEvent>>>,
}

struct QueueShared {
    transfers: RwLock<HashMap<String, Arc<TransferHandle>>>,
    events_tx: mpsc::Sender<TransferEvent>,
}

impl QueueShared {
    /// Sends an event without blocking the engine.
    ///
    /// High-frequency progress samples are dropped under backpressure;
    /// lifecycle events are handed to a background send so a slow consumer
    /// still sees every terminal transition.
    fn emit(&self, event: TransferEvent) {
        if matches!(event, TransferEvent::Progress(_)) {
            if self.events_tx.try_send(event).is_err() {
                debug!("event channel full, dropping progress sample");
            }
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events_tx.try_send(event) {
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(event).await;
            });
        }
    }

    fn handle(&self, id: &str) -> Option<Arc<TransferHandle>> {
        self.transfers.read().unwrap().get(id).cloned()
    }
}

enum Command {
    Enqueue { id: String, options: TransferOptions },
    Cancel {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Delayed actions processed by the scheduler loop.
enum Deadline {
    Retry(String),
    Evict(String),
}

impl TransferQueue {
    /// Creates the queue and spawns its scheduler task.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: TransferQueueConfig, resume: Arc<ResumeStore>) -> Self {
        let limiter = Arc::new(BandwidthLimiter::new(config.bandwidth_limit));
        let executor = Arc::new(TransferExecutor::new(resume, limiter));

        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let shared = Arc::new(QueueShared {
            transfers: RwLock::new(HashMap::new()),
            events_tx,
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(scheduler_loop(
            Arc::clone(&shared),
            executor,
            cmd_rx,
            config.max_concurrent_transfers.max(1),
            config.eviction_grace,
        ));

        Self {
            shared,
            cmd_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Enqueues a copy and returns its transfer id.
    ///
    /// The size is fixed here, at enqueue time. Invalid options are
    /// rejected immediately, before any work is attempted.
    pub async fn queue_transfer(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        options: TransferOptions,
    ) -> Result<String, TransferError> {
        self.queue_transfer_with_metadata(source, destination, options, HashMap::new())
            .await
    }

    /// Like [`queue_transfer`](Self::queue_transfer) with caller-owned
    /// metadata carried through to snapshots.
    pub async fn queue_transfer_with_metadata(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        options: TransferOptions,
        metadata: HashMap<String, String>,
    ) -> Result<String, TransferError> {
        options.validate()?;
        let source = source.into();
        let destination = destination.into();
        let size = tokio::fs::metadata(&source).await?.len();

        let id = Uuid::new_v4().to_string();
        let handle = Arc::new(TransferHandle::new(
            id.clone(),
            source,
            destination,
            size,
            metadata,
        ));
        self.shared
            .transfers
            .write()
            .unwrap()
            .insert(id.clone(), handle);

        self.cmd_tx
            .send(Command::Enqueue {
                id: id.clone(),
                options,
            })
            .map_err(|_| TransferError::Shutdown)?;

        self.shared.emit(TransferEvent::Queued {
            transfer_id: id.clone(),
        });
        info!(transfer = %id, size, "transfer queued");
        Ok(id)
    }

    /// Cancels a pending or running transfer.
    ///
    /// Returns `false` when the transfer is unknown or already terminal.
    pub async fn cancel_transfer(&self, id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Cancel {
                id: id.to_string(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Returns a snapshot of one transfer, if still visible.
    pub fn get_transfer(&self, id: &str) -> Option<Transfer> {
        self.shared.handle(id).map(|h| h.snapshot())
    }

    /// Snapshots of every transfer in the active set, including recently
    /// finished ones still inside the eviction grace window.
    pub fn active_transfers(&self) -> Vec<Transfer> {
        self.shared
            .transfers
            .read()
            .unwrap()
            .values()
            .map(|h| h.snapshot())
            .collect()
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Stops the scheduler and cancels all running transfers.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

struct SchedulerState {
    pending: VecDeque<String>,
    options: HashMap<String, TransferOptions>,
    running: HashMap<String, CancellationToken>,
    retry_keys: HashMap<String, Key>,
    max: usize,
    eviction_grace: Duration,
}

enum Wake {
    Cmd(Option<Command>),
    Done(String, Result<Option<String>, TransferError>),
    Expired(Deadline),
}

async fn scheduler_loop(
    shared: Arc<QueueShared>,
    executor: Arc<TransferExecutor>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    max: usize,
    eviction_grace: Duration,
) {
    let mut delays: DelayQueue<Deadline> = DelayQueue::new();
    let (done_tx, mut done_rx) =
        mpsc::unbounded_channel::<(String, Result<Option<String>, TransferError>)>();
    let mut state = SchedulerState {
        pending: VecDeque::new(),
        options: HashMap::new(),
        running: HashMap::new(),
        retry_keys: HashMap::new(),
        max,
        eviction_grace,
    };

    loop {
        // An empty DelayQueue resolves to None, which disables the branch
        // for this round.
        let wake = tokio::select! {
            cmd = cmd_rx.recv() => Wake::Cmd(cmd),
            Some((id, result)) = done_rx.recv() => Wake::Done(id, result),
            Some(expired) = std::future::poll_fn(|cx| delays.poll_expired(cx)) => {
                Wake::Expired(expired.into_inner())
            }
        };

        match wake {
            Wake::Cmd(Some(Command::Enqueue { id, options })) => {
                state.options.insert(id.clone(), options);
                state.pending.push_back(id);
            }
            Wake::Cmd(Some(Command::Cancel { id, reply })) => {
                let cancelled = handle_cancel(&shared, &mut state, &mut delays, &id);
                let _ = reply.send(cancelled);
            }
            Wake::Cmd(Some(Command::Shutdown)) | Wake::Cmd(None) => {
                for token in state.running.values() {
                    token.cancel();
                }
                debug!("transfer scheduler stopped");
                return;
            }
            Wake::Done(id, result) => {
                handle_done(&shared, &mut state, &mut delays, &id, result);
            }
            Wake::Expired(Deadline::Retry(id)) => {
                state.retry_keys.remove(&id);
                // Front of the queue: a retried transfer must not be
                // starved behind a growing backlog.
                state.pending.push_front(id);
            }
            Wake::Expired(Deadline::Evict(id)) => {
                state.options.remove(&id);
                if shared.transfers.write().unwrap().remove(&id).is_some() {
                    debug!(transfer = %id, "evicted finished transfer");
                }
            }
        }

        dispatch(&shared, &executor, &mut state, &done_tx);
    }
}

/// Starts executors for queued transfers while slots are free.
fn dispatch(
    shared: &Arc<QueueShared>,
    executor: &Arc<TransferExecutor>,
    state: &mut SchedulerState,
    done_tx: &mpsc::UnboundedSender<(String, Result<Option<String>, TransferError>)>,
) {
    while state.running.len() < state.max {
        let Some(id) = state.pending.pop_front() else {
            break;
        };
        let Some(handle) = shared.handle(&id) else {
            state.options.remove(&id);
            continue;
        };
        let Some(options) = state.options.get(&id).cloned() else {
            continue;
        };

        let cancel = CancellationToken::new();
        state.running.insert(id.clone(), cancel.clone());
        // The attempt is counted here, not in the executor, so failures
        // before the copy starts still exhaust the retry budget.
        handle.start();
        shared.emit(TransferEvent::Started {
            transfer_id: id.clone(),
            attempt: handle.attempt(),
        });
        debug!(transfer = %id, running = state.running.len(), "dispatching transfer");

        let executor = Arc::clone(executor);
        let done_tx = done_tx.clone();
        let event_shared = Arc::clone(shared);
        tokio::spawn(async move {
            let progress: ProgressCallback = Box::new({
                let shared = Arc::clone(&event_shared);
                move |sample| shared.emit(TransferEvent::Progress(sample))
            });
            let result = executor
                .execute(&handle, &options, &cancel, Some(&progress))
                .await;
            let _ = done_tx.send((id, result));
        });
    }
}

/// Applies the outcome of one executor run.
fn handle_done(
    shared: &Arc<QueueShared>,
    state: &mut SchedulerState,
    delays: &mut DelayQueue<Deadline>,
    id: &str,
    result: Result<Option<String>, TransferError>,
) {
    state.running.remove(id);
    let Some(handle) = shared.handle(id) else {
        state.options.remove(id);
        return;
    };
    let (retry_attempts, retry_delay) = state
        .options
        .get(id)
        .map(|o| (o.retry_attempts, o.retry_delay))
        .unwrap_or((1, Duration::ZERO));

    match result {
        Ok(checksum) => {
            handle.complete(checksum.clone());
            shared.emit(TransferEvent::Completed {
                transfer_id: id.to_string(),
                checksum,
            });
            info!(transfer = %id, "transfer completed");
            delays.insert(Deadline::Evict(id.to_string()), state.eviction_grace);
        }
        Err(TransferError::Cancelled) => {
            handle.fail("cancelled");
            shared.emit(TransferEvent::Cancelled {
                transfer_id: id.to_string(),
            });
            info!(transfer = %id, "transfer cancelled");
            delays.insert(Deadline::Evict(id.to_string()), state.eviction_grace);
        }
        Err(e) if e.is_retryable() && handle.attempt() < retry_attempts => {
            warn!(
                transfer = %id,
                attempt = handle.attempt(),
                error = %e,
                "transfer failed, scheduling retry"
            );
            handle.reset_for_retry(&e.to_string());
            let key = delays.insert(Deadline::Retry(id.to_string()), retry_delay);
            state.retry_keys.insert(id.to_string(), key);
        }
        Err(e) => {
            let message = e.to_string();
            handle.fail(&message);
            shared.emit(TransferEvent::Failed {
                transfer_id: id.to_string(),
                error: message.clone(),
            });
            error!(transfer = %id, error = %message, "transfer failed");
            delays.insert(Deadline::Evict(id.to_string()), state.eviction_grace);
        }
    }
}

/// Cancels a transfer wherever it currently lives: running, queued, or
/// waiting on a retry deadline.
fn handle_cancel(
    shared: &Arc<QueueShared>,
    state: &mut SchedulerState,
    delays: &mut DelayQueue<Deadline>,
    id: &str,
) -> bool {
    if let Some(token) = state.running.get(id) {
        // The executor surfaces Cancelled; handle_done finishes the job.
        token.cancel();
        return true;
    }

    let queued = if let Some(pos) = state.pending.iter().position(|p| p == id) {
        state.pending.remove(pos);
        true
    } else if let Some(key) = state.retry_keys.remove(id) {
        delays.remove(&key);
        true
    } else {
        false
    };

    if queued && let Some(handle) = shared.handle(id) {
        handle.fail("cancelled");
        shared.emit(TransferEvent::Cancelled {
            transfer_id: id.to_string(),
        });
        info!(transfer = %id, "pending transfer cancelled");
        delays.insert(Deadline::Evict(id.to_string()), state.eviction_grace);
        return true;
    }
    false
}
