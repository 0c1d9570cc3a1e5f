//! Per-model dynamic batching scheduler.
//!
//! One scheduler task per loaded (model, version). Requests land in priority
//! FIFO queues; the task forms batches from the head of the highest
//! non-empty level, waits a bounded delay for co-batching when below the
//! smallest preferred size, and hands each batch to the backend inline, so
//! at most one batch per model is in flight at a time. Queue deadlines are
//! re-checked on every wake; an expired request completes with
//! `DeadlineExceeded` and never reaches a batch.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BatchItem};
use crate::error::Error;
use crate::model::ModelConfig;
use crate::response::InferenceResponse;
use crate::server::InflightGuard;

/// Completion channel for one scheduled request.
pub type ResponseReceiver = oneshot::Receiver<Result<InferenceResponse, Error>>;

// ─── Policy ───────────────────────────────────────────────────────────────────

/// Batching parameters snapshotted from the model configuration at load.
#[derive(Debug, Clone)]
struct Policy {
    max_batch_size: u32,
    /// Ascending; empty means "no preferred size", which disables waiting.
    preferred_sizes: Vec<u32>,
    max_queue_delay: Duration,
}

impl Policy {
    fn from_config(config: &ModelConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            preferred_sizes: config.preferred_batch_sizes(),
            max_queue_delay: config.max_queue_delay(),
        }
    }

    /// Smallest configured preferred size, if any.
    fn smallest_preferred(&self) -> Option<u32> {
        self.preferred_sizes.first().copied()
    }
}

// ─── Queued requests ──────────────────────────────────────────────────────────

/// Co-batching compatibility: per-input working shapes plus the requested
/// output set. Batched requests must agree on both.
type CompatKey = (Vec<(String, Vec<i64>)>, Vec<String>);

struct QueuedRequest {
    item: BatchItem,
    responder: oneshot::Sender<Result<InferenceResponse, Error>>,
    /// Keeps the server's in-flight gauge up until completion fires.
    _guard: Option<InflightGuard>,
    compat: CompatKey,
    priority: u32,
    deadline: Option<Instant>,
    enqueued_at: Instant,
    seq: u64,
}

impl QueuedRequest {
    fn batch_size(&self) -> u32 {
        self.item.request().batch_size()
    }

    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    fn complete(self, result: Result<InferenceResponse, Error>) {
        // The receiver may have been dropped; completion is best-effort.
        let _ = self.responder.send(result);
    }
}

fn compat_key(item: &BatchItem) -> CompatKey {
    let shapes = item
        .request()
        .inputs()
        .iter()
        .map(|i| (i.name().to_owned(), i.working_shape().to_vec()))
        .collect();
    let outputs = item.request().requested_outputs().iter().cloned().collect();
    (shapes, outputs)
}

// ─── Scheduler handle ─────────────────────────────────────────────────────────

/// Handle to one model version's batching task.
#[derive(Clone)]
pub(crate) struct Scheduler {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    seq: Arc<AtomicU64>,
}

impl Scheduler {
    /// Spawn the batching task for `backend`.
    pub fn spawn(
        model: String,
        version: i64,
        backend: Arc<dyn Backend>,
        config: &ModelConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let policy = Policy::from_config(config);

        tokio::spawn(run_loop(model, version, backend, policy, rx, shutdown_rx));

        Self {
            tx,
            shutdown_tx: Arc::new(shutdown_tx),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Hand a prepared request to the batching task.
    ///
    /// Never blocks beyond the channel send. The returned receiver resolves
    /// when the request completes (successfully or not).
    pub fn enqueue(
        &self,
        item: BatchItem,
        guard: Option<InflightGuard>,
    ) -> Result<ResponseReceiver, Error> {
        if !item.request().is_prepared() {
            return Err(Error::InvalidArg(
                "request must be prepared before enqueue".into(),
            ));
        }
        if *self.shutdown_tx.borrow() {
            return Err(Error::unavailable("model is unloading"));
        }

        let now = Instant::now();
        let timeout_us = item.request().timeout_us();
        let (responder, receiver) = oneshot::channel();
        let queued = QueuedRequest {
            compat: compat_key(&item),
            priority: item.request().priority(),
            deadline: (timeout_us > 0).then(|| now + Duration::from_micros(timeout_us)),
            enqueued_at: now,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            item,
            responder,
            _guard: guard,
        };
        self.tx
            .send(queued)
            .map_err(|_| Error::unavailable("scheduler stopped"))?;
        Ok(receiver)
    }

    /// Stop accepting requests and drain the queue; pending requests
    /// complete with `Unavailable`.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ─── Batching loop ────────────────────────────────────────────────────────────

async fn run_loop(
    model: String,
    version: i64,
    backend: Arc<dyn Backend>,
    policy: Policy,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut queues: BTreeMap<u32, VecDeque<QueuedRequest>> = BTreeMap::new();
    debug!(model, version, "scheduler started");

    'outer: loop {
        while let Ok(req) = rx.try_recv() {
            push(&mut queues, req);
        }
        expire(&mut queues, Instant::now());

        if queues.values().all(VecDeque::is_empty) {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(req) => push(&mut queues, req),
                    None => break 'outer,
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break 'outer;
                    }
                }
            }
            continue;
        }

        let (mut batch, level, mut total) = seed_batch(&mut queues, &policy);

        // Below the smallest preferred size, wait a bounded delay for more
        // arrivals; the first preferred size reached dispatches immediately.
        if let Some(preferred) = policy.smallest_preferred() {
            if total < preferred && !policy.max_queue_delay.is_zero() {
                let delay_deadline = batch[0].enqueued_at + policy.max_queue_delay;
                loop {
                    let now = Instant::now();
                    if total >= preferred || now >= delay_deadline || batch.is_empty() {
                        break;
                    }
                    // Wake at the delay deadline or the earliest request
                    // deadline, whichever comes first.
                    let wake = batch
                        .iter()
                        .filter_map(|r| r.deadline)
                        .fold(delay_deadline, Instant::min);
                    tokio::select! {
                        maybe = rx.recv() => {
                            match maybe {
                                Some(req) => push(&mut queues, req),
                                None => break,
                            }
                            total += extend_batch(&mut batch, &mut queues, level, total, &policy);
                        }
                        _ = tokio::time::sleep_until(wake) => {
                            total -= complete_expired(&mut batch, &model, version);
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                fail_batch(batch, "model is unloading");
                                break 'outer;
                            }
                        }
                    }
                }
            }
        }

        // A queued deadline may have elapsed while the batch waited.
        complete_expired(&mut batch, &model, version);
        if batch.is_empty() {
            continue;
        }

        dispatch(&model, version, &backend, batch).await;
    }

    // Drain everything left with Unavailable.
    rx.close();
    while let Ok(req) = rx.try_recv() {
        push(&mut queues, req);
    }
    let drained: usize = queues.values().map(VecDeque::len).sum();
    if drained > 0 {
        info!(model, version, drained, "scheduler draining pending requests");
    }
    for (_, queue) in queues {
        for req in queue {
            req.complete(Err(Error::unavailable("model is unloading")));
        }
    }
    debug!(model, version, "scheduler stopped");
}

fn push(queues: &mut BTreeMap<u32, VecDeque<QueuedRequest>>, req: QueuedRequest) {
    queues.entry(req.priority).or_default().push_back(req);
}

/// Complete every expired queued request with `DeadlineExceeded`.
fn expire(queues: &mut BTreeMap<u32, VecDeque<QueuedRequest>>, now: Instant) {
    for queue in queues.values_mut() {
        let mut kept = VecDeque::with_capacity(queue.len());
        while let Some(req) = queue.pop_front() {
            if req.expired(now) {
                req.complete(Err(Error::DeadlineExceeded));
            } else {
                kept.push_back(req);
            }
        }
        *queue = kept;
    }
}

/// Complete expired members of a forming batch; returns the batch size lost.
fn complete_expired(batch: &mut Vec<QueuedRequest>, model: &str, version: i64) -> u32 {
    let now = Instant::now();
    let mut lost = 0;
    let mut index = 0;
    while index < batch.len() {
        if batch[index].expired(now) {
            let req = batch.remove(index);
            lost += req.batch_size();
            info!(
                model,
                version,
                request = req.item.request().id(),
                "request timed out in queue"
            );
            req.complete(Err(Error::DeadlineExceeded));
        } else {
            index += 1;
        }
    }
    lost
}

/// Start a batch with the oldest request of the highest non-empty priority
/// level and greedily extend it from that level's head.
fn seed_batch(
    queues: &mut BTreeMap<u32, VecDeque<QueuedRequest>>,
    policy: &Policy,
) -> (Vec<QueuedRequest>, u32, u32) {
    let (&level, _) = queues
        .iter()
        .rev()
        .find(|(_, q)| !q.is_empty())
        .expect("seed_batch called with all queues empty");
    let queue = queues.get_mut(&level).expect("level exists");

    let seed = queue.pop_front().expect("queue non-empty");
    debug_assert!(queue.front().is_none_or(|next| next.seq > seed.seq));
    let mut total = seed.batch_size();
    let mut batch = vec![seed];
    total += extend_batch(&mut batch, queues, level, total, policy);
    (batch, level, total)
}

/// Append compatible head requests of `level` to `batch`; returns the added
/// batch size. Non-batching models never co-batch.
fn extend_batch(
    batch: &mut Vec<QueuedRequest>,
    queues: &mut BTreeMap<u32, VecDeque<QueuedRequest>>,
    level: u32,
    current_total: u32,
    policy: &Policy,
) -> u32 {
    if policy.max_batch_size == 0 || batch.is_empty() {
        return 0;
    }
    let Some(queue) = queues.get_mut(&level) else {
        return 0;
    };
    let compat = batch[0].compat.clone();
    let mut added = 0;
    while let Some(head) = queue.front() {
        let fits = current_total + added + head.batch_size() <= policy.max_batch_size;
        if !fits || head.compat != compat {
            break;
        }
        let req = queue.pop_front().expect("head exists");
        added += req.batch_size();
        batch.push(req);
    }
    added
}

fn fail_batch(batch: Vec<QueuedRequest>, reason: &str) {
    for req in batch {
        req.complete(Err(Error::unavailable(reason)));
    }
}

/// Run one batch on the backend and fan per-request statuses back out.
async fn dispatch(
    model: &str,
    version: i64,
    backend: &Arc<dyn Backend>,
    batch: Vec<QueuedRequest>,
) {
    let batch_size: u32 = batch.iter().map(QueuedRequest::batch_size).sum();
    debug!(model, version, requests = batch.len(), batch_size, "dispatching batch");

    let (items, completions): (Vec<BatchItem>, Vec<_>) = batch
        .into_iter()
        .map(|req| (req.item, (req.responder, req._guard)))
        .unzip();

    let mut statuses = backend.run(&items).await;
    if statuses.len() != items.len() {
        warn!(
            model,
            version,
            expected = items.len(),
            got = statuses.len(),
            "backend returned a misaligned status vector"
        );
        statuses.resize_with(items.len(), || {
            Err(Error::Unknown(
                "backend returned fewer statuses than requests".into(),
            ))
        });
    }

    for ((responder, guard), status) in completions.into_iter().zip(statuses) {
        let _ = responder.send(status);
        drop(guard);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
