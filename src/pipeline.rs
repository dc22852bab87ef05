//! Serialized request pipeline for one device.
//!
//! Requests queue with a priority and drain through a single worker task,
//! which enforces the rate-limit floor between transmissions and hands each
//! request to an injected [`RequestExecutor`]. Higher priority transmits
//! first; equal priority is FIFO. Failed requests with retries remaining
//! re-enter the queue at the same priority.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::error::TapoError;

/// Transmission priority; `Critical` preempts everything queued below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "authentication failed",
    "invalid credentials",
    "device not found",
    "permission denied",
];

/// Whether the pipeline may re-enqueue a failed request.
fn is_retryable(err: &TapoError) -> bool {
    if !err.is_retryable() {
        return false;
    }
    let message = err.to_string().to_lowercase();
    !NON_RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Executes dequeued requests against the device's active session.
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    async fn execute(&self, method: &str, params: &Value) -> Result<Value, TapoError>;

    /// Minimum spacing between transmissions; consulted before each send.
    fn min_interval(&self) -> Duration {
        Duration::from_millis(100)
    }
}

/// Submission options; defaults are `Normal` priority, no pipeline-level
/// retries, and a 10 s deadline.
#[derive(Debug, Clone, Copy)]
pub struct SubmitOptions {
    pub priority: Priority,
    pub retries: u32,
    pub deadline: Duration,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            retries: 0,
            deadline: Duration::from_secs(10),
        }
    }
}

struct QueuedRequest {
    id: u64,
    method: String,
    params: Value,
    priority: Priority,
    deadline: Instant,
    retries_left: u32,
    responder: oneshot::Sender<Result<Value, TapoError>>,
}

struct PipelineShared {
    queue: Mutex<VecDeque<QueuedRequest>>,
    notify: Notify,
    halted: AtomicBool,
    next_id: AtomicU64,
}

impl PipelineShared {
    /// Inserts behind every request of equal or higher priority.
    fn insert(&self, request: QueuedRequest) {
        let mut queue = self.queue.lock();
        let position = queue
            .iter()
            .position(|queued| queued.priority < request.priority)
            .unwrap_or(queue.len());
        queue.insert(position, request);
        drop(queue);
        self.notify.notify_one();
    }

    fn drain(&self, make_error: impl Fn() -> TapoError) {
        let drained: Vec<QueuedRequest> = self.queue.lock().drain(..).collect();
        for request in drained {
            let _ = request.responder.send(Err(make_error()));
        }
    }
}

/// Handle to a queued request, usable for cancellation.
pub struct RequestHandle {
    pub id: u64,
    receiver: oneshot::Receiver<Result<Value, TapoError>>,
}

impl RequestHandle {
    pub async fn outcome(self) -> Result<Value, TapoError> {
        self.receiver.await.unwrap_or(Err(TapoError::Cancelled))
    }
}

/// Per-device request queue and worker.
pub struct RequestPipeline {
    shared: Arc<PipelineShared>,
    worker: Option<JoinHandle<()>>,
}

impl RequestPipeline {
    pub fn new(executor: Arc<dyn RequestExecutor>) -> Self {
        let shared = Arc::new(PipelineShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            halted: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        });
        let worker = tokio::spawn(worker_loop(shared.clone(), executor));
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Queues a request and returns a cancellation handle.
    pub fn enqueue(
        &self,
        method: &str,
        params: Value,
        options: SubmitOptions,
    ) -> Result<RequestHandle, TapoError> {
        if self.shared.halted.load(Ordering::SeqCst) {
            return Err(TapoError::QueueCleared);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (responder, receiver) = oneshot::channel();
        self.shared.insert(QueuedRequest {
            id,
            method: method.to_string(),
            params,
            priority: options.priority,
            deadline: Instant::now() + options.deadline,
            retries_left: options.retries,
            responder,
        });
        Ok(RequestHandle { id, receiver })
    }

    /// Queues a request and waits for its outcome.
    pub async fn submit(
        &self,
        method: &str,
        params: Value,
        options: SubmitOptions,
    ) -> Result<Value, TapoError> {
        self.enqueue(method, params, options)?.outcome().await
    }

    /// Rejects a queued request with `Cancelled`. Has no effect on a
    /// request that already reached the executor.
    pub fn cancel(&self, id: u64) -> bool {
        let mut queue = self.shared.queue.lock();
        if let Some(position) = queue.iter().position(|queued| queued.id == id) {
            if let Some(request) = queue.remove(position) {
                let _ = request.responder.send(Err(TapoError::Cancelled));
            }
            true
        } else {
            false
        }
    }

    /// Rejects everything queued with `QueueCleared` and halts intake.
    pub fn clear(&self) {
        self.shared.halted.store(true, Ordering::SeqCst);
        self.shared.drain(|| TapoError::QueueCleared);
    }

    /// Rejects everything queued with `Cancelled` and halts intake; used
    /// by `disconnect()`.
    pub fn cancel_all(&self) {
        self.shared.halted.store(true, Ordering::SeqCst);
        self.shared.drain(|| TapoError::Cancelled);
    }

    /// Re-opens intake after `clear()` or `cancel_all()`.
    pub fn resume(&self) {
        self.shared.halted.store(false, Ordering::SeqCst);
    }

    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Drop for RequestPipeline {
    fn drop(&mut self) {
        self.cancel_all();
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

async fn worker_loop(shared: Arc<PipelineShared>, executor: Arc<dyn RequestExecutor>) {
    let mut last_transmit: Option<Instant> = None;
    loop {
        let request = shared.queue.lock().pop_front();
        let Some(mut request) = request else {
            shared.notify.notified().await;
            continue;
        };

        if Instant::now() >= request.deadline {
            let _ = request.responder.send(Err(TapoError::Timeout));
            continue;
        }

        if let Some(last) = last_transmit {
            sleep_until(last + executor.min_interval()).await;
        }
        last_transmit = Some(Instant::now());

        match executor.execute(&request.method, &request.params).await {
            Ok(value) => {
                let _ = request.responder.send(Ok(value));
            }
            Err(err) if request.retries_left > 0 && is_retryable(&err) => {
                debug!(
                    method = %request.method,
                    retries_left = request.retries_left,
                    error = %err,
                    "re-enqueueing failed request"
                );
                request.retries_left -= 1;
                shared.insert(request);
            }
            Err(err) => {
                let _ = request.responder.send(Err(err));
            }
        }
    }
}
