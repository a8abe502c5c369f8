//! Per-stream batching sender.
//!
//! A [`Sender`] owns one stream's pending list on a [`SerialTaskQueue`]
//! worker, so every mutation (enqueue, batch extraction, outcome handling,
//! persistence bookkeeping) runs on that single thread without locks.
//! Network and disk I/O run as tasks on the tokio runtime and report back
//! by submitting a job to the same queue.
//!
//! At most one batch is in flight per stream. A batch is taken from the
//! front of the pending list once the current send interval has elapsed
//! since the last attempt; retryable failures put it back at the front.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::error::TransportError;
use crate::event::format_wire_time;
use crate::queue::{SerialTaskQueue, TaskSubmitter};
use crate::store::PersistenceStore;
use crate::stream::Stream;
use crate::transport::{classify, Outcome, Transport, TransportRequest, TransportResponse};

/// Counters kept by each stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    /// Batches answered with 2xx
    pub batches_sent: u64,

    /// Items in those batches
    pub items_sent: u64,

    /// Failed attempts whose batch went back on the queue
    pub batches_requeued: u64,

    /// Batches discarded after 400, 403 or 409
    pub batches_dropped: u64,

    /// Items in those batches
    pub items_dropped: u64,

    /// Completed background queue file writes
    pub queue_writes: u64,
}

/// Snapshot of a stream, published after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    pub pending: usize,
    pub in_flight: usize,
    pub error_count: u32,
    pub send_interval: Duration,
    /// A queue file write is running or due
    pub saving: bool,
    pub stats: SenderStats,
}

impl StreamStatus {
    /// Nothing queued and nothing on the wire.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }
}

/// A batch discarded because the server refused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedBatch {
    pub stream: &'static str,
    pub status: u16,
    pub reason: &'static str,
    pub items: usize,
}

/// Callback invoked on the stream worker for every dropped batch.
pub type DropHandler = Arc<dyn Fn(&DroppedBatch) + Send + Sync>;

/// Batching and scheduling knobs for one stream.
#[derive(Clone)]
pub struct SenderOptions {
    /// URL prefix the stream path is appended to
    pub base_url: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    pub on_drop: Option<DropHandler>,
}

impl SenderOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.base_url(),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            backoff: config.backoff(),
            on_drop: None,
        }
    }
}

impl std::fmt::Debug for SenderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderOptions")
            .field("base_url", &self.base_url)
            .field("batch_size", &self.batch_size)
            .field("poll_interval", &self.poll_interval)
            .field("backoff", &self.backoff)
            .field("on_drop", &self.on_drop.is_some())
            .finish()
    }
}

/// Handle to one running stream.
pub struct Sender<S: Stream> {
    name: &'static str,
    queue: SerialTaskQueue<SenderState<S>>,
    status: watch::Receiver<StreamStatus>,
}

impl<S: Stream> Sender<S> {
    /// Load the stream's queue file and start its worker.
    ///
    /// The first send happens no sooner than one minimum interval after
    /// start, so a burst of early items goes out in full batches.
    pub fn start(
        stream: S,
        options: SenderOptions,
        transport: Arc<dyn Transport>,
        store: Arc<PersistenceStore>,
        runtime: Handle,
    ) -> std::io::Result<Self> {
        let name = stream.name();
        let recovered: Vec<S::Item> = store.load(name);
        if !recovered.is_empty() {
            info!(stream = name, count = recovered.len(), "Recovered pending items");
        }

        let send_interval = options.backoff.interval(0);
        let (status_tx, status_rx) = watch::channel(StreamStatus {
            pending: recovered.len(),
            in_flight: 0,
            error_count: 0,
            send_interval,
            saving: false,
            stats: SenderStats::default(),
        });

        let queue = SerialTaskQueue::start(name, move |submitter| {
            let mut stream = stream;
            stream.on_recover(&recovered);

            let mut state = SenderState {
                stream,
                options,
                transport,
                store,
                runtime,
                queue: submitter,
                pending: recovered.into(),
                in_flight: Vec::new(),
                is_sending: false,
                error_count: 0,
                send_interval,
                last_attempt_at: Instant::now(),
                dirty: false,
                is_saving: false,
                save_generation: 0,
                written_generation: Arc::default(),
                check_armed: false,
                stats: SenderStats::default(),
                status_tx,
            };
            state.check_and_send();
            state.publish();
            state
        })?;

        info!(stream = name, "Stream sender started");

        Ok(Self {
            name,
            queue,
            status: status_rx,
        })
    }

    /// Queue `item` for delivery. Never blocks; returns `false` once the
    /// sender is closed.
    pub fn add(&self, item: S::Item) -> bool {
        self.queue.submit(move |state| state.enqueue(item))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Latest published status.
    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    /// Watch channel carrying every status update.
    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    /// Resolve once every item added before this call has been enqueued,
    /// so the published status accounts for it.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.queue.submit(move |_| {
            let _ = tx.send(());
        }) {
            let _ = rx.await;
        }
    }

    /// Stop the worker after running already-queued jobs, then write the
    /// in-flight batch and pending items to the queue file. In-flight sends
    /// are abandoned.
    pub fn close(&mut self) {
        self.queue.close();
        info!(stream = self.name, "Stream sender closed");
    }
}

/// Everything the worker thread owns for one stream.
struct SenderState<S: Stream> {
    stream: S,
    options: SenderOptions,
    transport: Arc<dyn Transport>,
    store: Arc<PersistenceStore>,
    runtime: Handle,
    queue: TaskSubmitter<SenderState<S>>,

    pending: VecDeque<S::Item>,
    in_flight: Vec<S::Item>,
    is_sending: bool,
    error_count: u32,
    send_interval: Duration,
    last_attempt_at: Instant,

    dirty: bool,
    is_saving: bool,
    /// Bumped for every snapshot handed to a write
    save_generation: u64,
    /// Newest generation on disk; older snapshots are skipped
    written_generation: Arc<Mutex<u64>>,
    check_armed: bool,

    stats: SenderStats,
    status_tx: watch::Sender<StreamStatus>,
}

impl<S: Stream> SenderState<S> {
    fn enqueue(&mut self, mut item: S::Item) {
        self.stream.on_enqueue(&mut item);
        self.pending.push_back(item);
        self.mark_dirty();
        self.check_and_send();
        self.publish();
    }

    /// Send now if allowed, otherwise arrange to look again.
    ///
    /// An empty idle stream arms nothing; the next enqueue re-evaluates.
    /// While a batch is in flight its completion re-evaluates.
    fn check_and_send(&mut self) {
        if self.is_sending || self.pending.is_empty() {
            return;
        }

        let elapsed = self.last_attempt_at.elapsed();
        if elapsed >= self.send_interval {
            self.send_next_batch();
        } else {
            self.arm_check(self.send_interval - elapsed);
        }
    }

    fn arm_check(&mut self, remaining: Duration) {
        if self.check_armed {
            return;
        }
        self.check_armed = true;

        let delay = remaining.min(self.options.poll_interval);
        let queue = self.queue.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            queue.submit(|state: &mut SenderState<S>| state.on_check());
        });
    }

    fn on_check(&mut self) {
        self.check_armed = false;
        self.check_and_send();
        self.publish();
    }

    fn send_next_batch(&mut self) {
        let count = self.pending.len().min(self.options.batch_size.max(1));
        let batch: Vec<S::Item> = self.pending.drain(..count).collect();

        self.is_sending = true;
        self.last_attempt_at = Instant::now();

        let url = format!(
            "{}{}?current_time={}",
            self.options.base_url,
            self.stream.path(),
            format_wire_time(&Utc::now())
        );
        let encoded = self.stream.encode(&batch);
        self.in_flight = batch;

        debug!(
            stream = self.stream.name(),
            batch_size = count,
            remaining = self.pending.len(),
            url = %url,
            "Sending batch"
        );

        let queue = self.queue.clone();
        let transport = self.transport.clone();
        self.runtime.spawn(async move {
            let result = match encoded {
                Ok(body) => {
                    let request = TransportRequest::json(url, body);
                    // Run the POST as its own task so a panic still reports back
                    match tokio::spawn(async move { transport.post(request).await }).await {
                        Ok(result) => result,
                        Err(e) => Err(TransportError::Other(format!("transport task failed: {e}"))),
                    }
                }
                Err(e) => Err(TransportError::Encode(e)),
            };
            queue.submit(move |state: &mut SenderState<S>| state.complete_send(result));
        });
    }

    fn complete_send(&mut self, result: Result<TransportResponse, TransportError>) {
        let batch = std::mem::take(&mut self.in_flight);
        let name = self.stream.name();
        self.is_sending = false;

        let mut dropped = None;
        match classify(&result) {
            Outcome::Delivered => {
                self.error_count = 0;
                self.stats.batches_sent += 1;
                self.stats.items_sent += batch.len() as u64;
                debug!(stream = name, batch_size = batch.len(), "Batch delivered");
            }
            Outcome::Rejected { status, reason } => {
                self.error_count = self.error_count.saturating_add(1);
                self.stats.batches_dropped += 1;
                self.stats.items_dropped += batch.len() as u64;

                let body = result.as_ref().map(|r| r.body.as_str()).unwrap_or_default();
                error!(
                    stream = name,
                    status = status,
                    batch_size = batch.len(),
                    body = %body,
                    "Dropping batch: {}",
                    reason
                );
                dropped = Some(DroppedBatch {
                    stream: name,
                    status,
                    reason,
                    items: batch.len(),
                });
            }
            Outcome::Retry { reason } => {
                self.error_count = self.error_count.saturating_add(1);
                self.stats.batches_requeued += 1;
                warn!(
                    stream = name,
                    batch_size = batch.len(),
                    error_count = self.error_count,
                    reason = %reason,
                    "Send failed, requeueing batch"
                );
                // Back in front of anything enqueued during the attempt
                for item in batch.into_iter().rev() {
                    self.pending.push_front(item);
                }
            }
        }

        self.send_interval = self.options.backoff.interval(self.error_count);
        debug!(
            stream = name,
            error_count = self.error_count,
            interval_ms = self.send_interval.as_millis() as u64,
            "Send interval updated"
        );

        self.mark_dirty();
        self.check_and_send();
        self.publish();

        if let (Some(dropped), Some(on_drop)) = (dropped, self.options.on_drop.as_ref()) {
            on_drop(&dropped);
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.schedule_save();
    }

    /// Start a queue file write unless one is running; a write that finds
    /// the state dirty again on completion schedules exactly one more.
    fn schedule_save(&mut self) {
        if !self.dirty || self.is_saving {
            return;
        }
        self.dirty = false;
        if !self.store.is_enabled() {
            return;
        }
        self.is_saving = true;

        self.save_generation += 1;
        let generation = self.save_generation;
        let snapshot = self.snapshot();
        let store = self.store.clone();
        let written = self.written_generation.clone();
        let queue = self.queue.clone();
        let name = self.stream.name();
        self.runtime.spawn_blocking(move || {
            write_snapshot(&store, &written, name, generation, &snapshot);
            queue.submit(|state: &mut SenderState<S>| state.save_complete());
        });
    }

    fn save_complete(&mut self) {
        self.is_saving = false;
        self.stats.queue_writes += 1;
        self.schedule_save();
        self.publish();
    }

    /// The in-flight batch stays on disk until it is delivered or dropped.
    fn snapshot(&self) -> Vec<S::Item> {
        self.in_flight
            .iter()
            .chain(self.pending.iter())
            .cloned()
            .collect()
    }

    fn publish(&self) {
        self.status_tx.send_replace(StreamStatus {
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
            error_count: self.error_count,
            send_interval: self.send_interval,
            saving: self.is_saving || self.dirty,
            stats: self.stats,
        });
    }
}

impl<S: Stream> Drop for SenderState<S> {
    /// Runs on the worker as it exits, after the last queued job. A write
    /// still running in the background cannot overwrite this one.
    fn drop(&mut self) {
        if !self.store.is_enabled() || !(self.dirty || self.is_saving) {
            return;
        }
        self.save_generation += 1;
        let snapshot = self.snapshot();
        write_snapshot(
            &self.store,
            &self.written_generation,
            self.stream.name(),
            self.save_generation,
            &snapshot,
        );
        debug!(
            stream = self.stream.name(),
            count = snapshot.len(),
            "Final queue file written"
        );
    }
}

/// Write `snapshot` unless a newer generation already reached disk.
fn write_snapshot<T: serde::Serialize>(
    store: &PersistenceStore,
    written: &Mutex<u64>,
    name: &str,
    generation: u64,
    snapshot: &[T],
) {
    let mut written = written.lock().unwrap_or_else(PoisonError::into_inner);
    if generation <= *written {
        debug!(stream = name, generation, "Skipping stale queue file write");
        return;
    }
    store.save(name, snapshot);
    *written = generation;
}
