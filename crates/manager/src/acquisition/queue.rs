//! Serialized acquisition queue
//!
//! A single worker consumes tasks from an unbounded channel, so exactly one
//! acquisition runs at a time. Failed tasks are re-submitted by a timer task
//! after their backoff delay and may overtake or trail newer tasks.
//!
//! The queue admits at most one outstanding task per domain key and
//! registry generation: enqueueing a key that is already queued, in flight
//! or backing off is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use certherd_common::{DomainKey, DomainSet, TaskId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::pipeline::AcquisitionPipeline;
use super::retry::RetryPolicy;
use crate::errors::AcquisitionError;
use crate::registry::{DomainRegistry, RegisteredDomain};
use crate::webhook::WebhookQueue;

/// A queued unit of acquisition work
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub set: DomainSet,
    /// Registry generation the task was created for
    pub generation: u64,
    /// Failures of this task so far. Every task starts with the full retry
    /// budget; the registry entry keeps the count across tasks.
    pub retry_count: u32,
}

impl Task {
    pub fn new(entry: RegisteredDomain) -> Self {
        Self {
            id: TaskId::new(),
            set: entry.set,
            generation: entry.generation,
            retry_count: 0,
        }
    }

    pub fn key(&self) -> &DomainKey {
        &self.set.key
    }
}

/// Sending half of the acquisition queue
#[derive(Debug, Clone)]
pub struct AcquisitionQueue {
    tx: mpsc::UnboundedSender<Task>,
    /// Outstanding tasks: key -> generation
    pending: Arc<Mutex<HashMap<DomainKey, u64>>>,
}

impl AcquisitionQueue {
    /// Create the queue and the receiver for its worker
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
        };
        (queue, rx)
    }

    /// Enqueue a task.
    ///
    /// Returns `false` if a task for the same key and generation is already
    /// outstanding or the worker is gone.
    pub fn enqueue(&self, task: Task) -> bool {
        {
            let mut pending = self.pending.lock();
            if pending.get(task.key()) == Some(&task.generation) {
                trace!(domain = %task.key(), "Task already outstanding, skipping");
                return false;
            }
            pending.insert(task.key().clone(), task.generation);
        }

        let key = task.key().clone();
        let generation = task.generation;
        debug!(domain = %key, task_id = %task.id, "Enqueued acquisition task");
        if self.tx.send(task).is_err() {
            warn!(domain = %key, "Acquisition worker stopped, dropping task");
            self.release(&key, generation);
            return false;
        }
        true
    }

    /// Whether a task for `key` is queued, in flight or backing off
    pub fn is_pending(&self, key: &DomainKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Number of outstanding tasks
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Re-submit a failed task after `delay`. The key stays outstanding.
    fn schedule_retry(&self, task: Task, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(mpsc::error::SendError(task)) = tx.send(task) {
                debug!(domain = %task.key(), "Acquisition worker stopped, dropping retry");
            }
        });
    }

    /// Mark the task of `key` and `generation` as finished
    fn release(&self, key: &DomainKey, generation: u64) {
        let mut pending = self.pending.lock();
        if pending.get(key) == Some(&generation) {
            pending.remove(key);
        }
    }
}

/// The single consumer of the acquisition queue
pub struct AcquisitionWorker {
    pipeline: AcquisitionPipeline,
    registry: Arc<DomainRegistry>,
    queue: AcquisitionQueue,
    retry: RetryPolicy,
    timeout: Duration,
    webhook: Option<WebhookQueue>,
}

impl AcquisitionWorker {
    pub fn new(
        pipeline: AcquisitionPipeline,
        registry: Arc<DomainRegistry>,
        queue: AcquisitionQueue,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            registry,
            queue,
            retry,
            timeout,
            webhook: None,
        }
    }

    /// Forward acquired certificates to the webhook queue
    pub fn with_webhook(mut self, webhook: WebhookQueue) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// Process tasks one at a time until every sender is gone.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Task>) {
        info!(
            max_retries = self.retry.max_retries,
            retry_interval_secs = self.retry.base_interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "Starting acquisition worker"
        );

        while let Some(task) = rx.recv().await {
            self.process(task).await;
        }

        info!("Acquisition worker stopped");
    }

    async fn process(&self, mut task: Task) {
        let key = task.key().clone();
        let generation = task.generation;

        if !self.registry.is_current(&key, generation) {
            debug!(domain = %key, task_id = %task.id, "Dropping task of removed domain");
            self.queue.release(&key, generation);
            return;
        }

        info!(
            domain = %key,
            task_id = %task.id,
            retry_count = task.retry_count,
            "Processing acquisition task"
        );

        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.pipeline.acquire(&task.set)).await
        {
            Ok(result) => result,
            Err(_) => Err(AcquisitionError::Timeout(self.timeout)),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(record) => {
                self.queue.release(&key, generation);
                if !self.registry.record_success(&key, generation) {
                    info!(
                        domain = %key,
                        "Domain removed during acquisition, discarding certificate"
                    );
                    return;
                }

                info!(
                    domain = %key,
                    subject = %record.subject,
                    expires = %record.not_after,
                    elapsed_ms = elapsed_ms,
                    "Certificate acquired"
                );

                if let Some(webhook) = &self.webhook {
                    webhook.enqueue(record);
                }
            }
            Err(e) => {
                task.retry_count += 1;
                let retry_count = task.retry_count;

                if !self.registry.record_failure(&key, generation) {
                    info!(
                        domain = %key,
                        error = %e,
                        "Domain removed during acquisition, not retrying"
                    );
                    self.queue.release(&key, generation);
                    return;
                }

                match self.retry.next_delay(retry_count) {
                    Some(delay) => {
                        warn!(
                            domain = %key,
                            kind = e.kind(),
                            error = %e,
                            retry_count = retry_count,
                            retry_in_secs = delay.as_secs(),
                            elapsed_ms = elapsed_ms,
                            "Certificate acquisition failed, retrying"
                        );
                        self.queue.schedule_retry(task, delay);
                    }
                    None => {
                        error!(
                            domain = %key,
                            kind = e.kind(),
                            error = %e,
                            retry_count = retry_count,
                            max_retries = self.retry.max_retries,
                            "Certificate acquisition failed permanently, giving up"
                        );
                        self.queue.release(&key, generation);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for AcquisitionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionWorker")
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("webhook", &self.webhook.is_some())
            .finish()
    }
}
