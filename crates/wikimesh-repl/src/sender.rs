//! Sender queues: one FIFO per target instance, drained by a background
//! task that retries transient failures with backoff.
//!
//! A failed entry goes back to the head of its queue, so per-target order is
//! kept across retries. [`SenderQueues::purge`] bumps the queue generation;
//! an attempt that was in flight during the purge is not re-queued.
//! Removing an instance closes its queue and stops its task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ReplError, Result};
use crate::instance::Instance;
use crate::message::OutboundMessage;
use crate::message_log::{MessageLog, MessageStatus};
use crate::registry::{InstanceRegistry, RegistryListener};
use crate::signing::MessageSigner;
use crate::transport::PeerClient;

/// Backoff settings for redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Randomize each delay by up to +/-25%.
    pub jitter: bool,
    /// Use this constant delay instead of exponential backoff.
    pub fixed_delay_ms: Option<u64>,
    /// Drop an entry after this many attempts. None retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
            fixed_delay_ms: None,
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying an entry that has failed `failures` times.
    pub fn backoff(&self, failures: u32) -> Duration {
        if let Some(fixed) = self.fixed_delay_ms {
            return Duration::from_millis(fixed);
        }
        let exp = failures.saturating_sub(1).min(32) as i32;
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = base.min(self.max_backoff_ms as f64);
        let millis = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            (capped * factor).min(self.max_backoff_ms as f64)
        } else {
            capped
        };
        Duration::from_millis(millis.max(0.0) as u64)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// One queued delivery.
#[derive(Debug, Clone)]
struct QueueEntry {
    message: OutboundMessage,
    attempts: u32,
    next_retry: Instant,
}

/// Emitted after each successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Delivered message id.
    pub message_id: String,
    /// Target uri.
    pub target: String,
    /// Attempts it took, including the successful one.
    pub attempts: u32,
}

#[derive(Debug, Default)]
struct QueueStatsInner {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    purged: AtomicU64,
}

/// Counters for one target queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries currently waiting.
    pub depth: usize,
    /// Entries ever enqueued.
    pub enqueued: u64,
    /// Successful deliveries.
    pub delivered: u64,
    /// Failed attempts that were re-queued.
    pub retried: u64,
    /// Entries dropped after a permanent failure, or because the target was
    /// unregistered while they waited.
    pub dropped: u64,
    /// Entries discarded by a purge.
    pub purged: u64,
}

struct TargetQueue {
    uri: String,
    entries: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
    generation: AtomicU64,
    // Set under the `entries` lock.
    closed: AtomicBool,
    stats: QueueStatsInner,
}

impl TargetQueue {
    fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            stats: QueueStatsInner::default(),
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.entries.lock().len(),
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            purged: self.stats.purged.load(Ordering::Relaxed),
        }
    }
}

/// Everything a delivery task needs, shared by all queues.
struct Courier {
    registry: Arc<InstanceRegistry>,
    log: Arc<MessageLog>,
    client: Arc<dyn PeerClient>,
    signer: Arc<dyn MessageSigner>,
    retry: RetryConfig,
    reports: broadcast::Sender<DeliveryReport>,
}

enum Attempt {
    Delivered,
    Retry(ReplError),
    Drop,
}

impl Courier {
    fn registered_target(&self, uri: &str) -> Option<Instance> {
        self.registry
            .get_instance_by_uri(uri)
            .filter(Instance::is_registered)
    }

    async fn attempt(&self, queue: &TargetQueue, entry: &QueueEntry) -> Attempt {
        let id = entry.message.id();
        let Some(target) = self.registered_target(&queue.uri) else {
            warn!(target = %queue.uri, id, "target no longer registered, dropping message");
            return Attempt::Drop;
        };
        let signature = match self.signer.sign(target.receive_key.as_deref(), &entry.message) {
            Ok(signature) => signature,
            Err(e) => {
                warn!(target = %queue.uri, id, error = %e, "cannot sign message, dropping");
                return Attempt::Drop;
            }
        };
        match self
            .client
            .send_message(&target, &entry.message, signature.as_deref())
            .await
        {
            Ok(()) => Attempt::Delivered,
            Err(e) if e.is_retryable() => Attempt::Retry(e),
            Err(e) => {
                warn!(target = %queue.uri, id, error = %e, "permanent delivery failure, dropping");
                Attempt::Drop
            }
        }
    }

    async fn deliver(&self, queue: &TargetQueue, mut entry: QueueEntry, generation: u64) {
        entry.attempts += 1;
        match self.attempt(queue, &entry).await {
            Attempt::Delivered => {
                queue.stats.delivered.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.log.mark(entry.message.id(), MessageStatus::Sent) {
                    warn!(id = %entry.message.id(), error = %e, "failed to mark message sent");
                }
                debug!(target = %queue.uri, id = %entry.message.id(), attempts = entry.attempts, "delivered");
                let _ = self.reports.send(DeliveryReport {
                    message_id: entry.message.id().to_string(),
                    target: queue.uri.clone(),
                    attempts: entry.attempts,
                });
            }
            Attempt::Retry(e) => {
                if self.retry.exhausted(entry.attempts) {
                    queue.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(target = %queue.uri, id = %entry.message.id(), attempts = entry.attempts, error = %e, "giving up on message");
                    return;
                }
                let mut entries = queue.entries.lock();
                if queue.generation.load(Ordering::Acquire) != generation {
                    debug!(target = %queue.uri, id = %entry.message.id(), "queue purged during attempt");
                    return;
                }
                let delay = self.retry.backoff(entry.attempts);
                debug!(target = %queue.uri, id = %entry.message.id(), attempts = entry.attempts, ?delay, error = %e, "delivery failed, will retry");
                entry.next_retry = Instant::now() + delay;
                entries.push_front(entry);
                queue.stats.retried.fetch_add(1, Ordering::Relaxed);
            }
            Attempt::Drop => {
                queue.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn run(self: Arc<Self>, queue: Arc<TargetQueue>, mut shutdown: watch::Receiver<bool>) {
        debug!(target = %queue.uri, "sender queue started");
        loop {
            if *shutdown.borrow() || queue.closed.load(Ordering::Acquire) {
                break;
            }
            let head = queue.entries.lock().front().map(|e| e.next_retry);
            match head {
                None => {
                    tokio::select! {
                        _ = queue.notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Some(at) if at > Instant::now() => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = queue.notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Some(_) => {
                    let (entry, generation) = {
                        let mut entries = queue.entries.lock();
                        (entries.pop_front(), queue.generation.load(Ordering::Acquire))
                    };
                    if let Some(entry) = entry {
                        self.deliver(&queue, entry, generation).await;
                    }
                }
            }
        }
        debug!(target = %queue.uri, "sender queue stopped");
    }
}

/// All per-target queues of one node.
pub struct SenderQueues {
    courier: Arc<Courier>,
    queues: DashMap<String, Arc<TargetQueue>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl SenderQueues {
    /// New, empty set of queues.
    pub fn new(
        registry: Arc<InstanceRegistry>,
        log: Arc<MessageLog>,
        client: Arc<dyn PeerClient>,
        signer: Arc<dyn MessageSigner>,
        retry: RetryConfig,
    ) -> Self {
        let (reports, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Self {
            courier: Arc::new(Courier {
                registry,
                log,
                client,
                signer,
                retry,
                reports,
            }),
            queues: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    fn queue(&self, uri: &str) -> Arc<TargetQueue> {
        if let Some(queue) = self.queues.get(uri) {
            return queue.clone();
        }
        self.queues
            .entry(uri.to_string())
            .or_insert_with(|| {
                let queue = Arc::new(TargetQueue::new(uri));
                let task = tokio::spawn(
                    self.courier
                        .clone()
                        .run(queue.clone(), self.shutdown.subscribe()),
                );
                let mut tasks = self.tasks.lock();
                tasks.retain(|t| !t.is_finished());
                tasks.push(task);
                queue
            })
            .clone()
    }

    /// Log the message (if new) and queue it for `target`, which must be a
    /// registered instance.
    pub fn enqueue(&self, message: OutboundMessage, target: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplError::Shutdown);
        }
        let unknown = || ReplError::UnknownInstance {
            instance: target.to_string(),
        };
        if self.courier.registered_target(target).is_none() {
            return Err(unknown());
        }
        self.courier
            .log
            .save_if_absent(&message.header, MessageStatus::Stored)?;
        let queue = self.queue(target);
        {
            let mut entries = queue.entries.lock();
            if queue.closed.load(Ordering::Acquire) {
                // The target was removed after the check above.
                return Err(unknown());
            }
            entries.push_back(QueueEntry {
                message,
                attempts: 0,
                next_retry: Instant::now(),
            });
        }
        queue.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        queue.notify.notify_one();
        Ok(())
    }

    /// Drop every pending entry for `target`. Returns how many were dropped.
    pub fn purge(&self, target: &str) -> usize {
        let Some(queue) = self.queues.get(target).map(|q| q.clone()) else {
            return 0;
        };
        let dropped = {
            let mut entries = queue.entries.lock();
            queue.generation.fetch_add(1, Ordering::AcqRel);
            let n = entries.len();
            entries.clear();
            n
        };
        queue.stats.purged.fetch_add(dropped as u64, Ordering::Relaxed);
        if dropped > 0 {
            info!(target, dropped, "sender queue purged");
        }
        dropped
    }

    /// Discard the queue for `target` and stop its delivery task. Returns
    /// how many pending entries were dropped.
    pub fn close(&self, target: &str) -> usize {
        let Some((_, queue)) = self.queues.remove(target) else {
            return 0;
        };
        let dropped = {
            let mut entries = queue.entries.lock();
            queue.closed.store(true, Ordering::Release);
            queue.generation.fetch_add(1, Ordering::AcqRel);
            let n = entries.len();
            entries.clear();
            n
        };
        queue.stats.purged.fetch_add(dropped as u64, Ordering::Relaxed);
        queue.notify.notify_one();
        info!(target, dropped, "sender queue closed");
        dropped
    }

    /// Number of targets with a live queue.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Pending entries for `target`.
    pub fn depth(&self, target: &str) -> usize {
        self.queues
            .get(target)
            .map(|q| q.entries.lock().len())
            .unwrap_or(0)
    }

    /// Pending entries across all targets.
    pub fn total_depth(&self) -> usize {
        self.queues.iter().map(|q| q.entries.lock().len()).sum()
    }

    /// Counters for `target`, if a queue exists.
    pub fn stats(&self, target: &str) -> Option<QueueStats> {
        self.queues.get(target).map(|q| q.stats())
    }

    /// Subscribe to delivery reports.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryReport> {
        self.courier.reports.subscribe()
    }

    /// Stop every delivery task. Pending entries are discarded.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sender task ended abnormally");
            }
        }
        info!(queues = self.queues.len(), "sender queues stopped");
    }
}

impl RegistryListener for SenderQueues {
    fn instance_removed(&self, instance: &Instance) {
        self.close(&instance.uri);
    }
}
