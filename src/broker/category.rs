//! Category (topic)
//!
//! A `Category` is a named stream made of a fixed number of queues. It routes
//! each write to one queue:
//! - a single-queue category always writes to queue 0;
//! - a non-empty key selects `crc32(key) % queue_count`, so equal keys always
//!   land on the same queue;
//! - no key uses the category's own round-robin counter.
//!
//! Each category owns a periodic retention-cleanup task once started by the
//! broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::broker::message::{AppendResult, MessageInput};
use crate::broker::queue::{Queue, QueueCapacityConfig};
use crate::utils::error::{BrokerError, Result};
use crate::utils::tasks::PeriodicTask;

pub const DEFAULT_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Smoothing factor for the messages/sec rate.
const RATE_ALPHA: f64 = 0.3;

/// Fixed at category creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub queue_count: usize,
    pub retention_ms: i64,
    pub persistent: bool,
    pub capacity: QueueCapacityConfig,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            queue_count: 1,
            retention_ms: DEFAULT_RETENTION_MS,
            persistent: false,
            capacity: QueueCapacityConfig::unbounded(),
        }
    }
}

impl CategoryConfig {
    pub fn with_queues(queue_count: usize) -> Self {
        Self {
            queue_count,
            ..Self::default()
        }
    }

    pub fn retention_ms(mut self, retention_ms: i64) -> Self {
        self.retention_ms = retention_ms;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn capacity(mut self, capacity: QueueCapacityConfig) -> Self {
        self.capacity = capacity;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStats {
    pub name: String,
    pub queue_count: usize,
    pub message_counts: Vec<usize>,
    pub byte_counts: Vec<usize>,
    pub total_messages: usize,
    pub total_bytes: usize,
    pub messages_per_sec: f64,
}

#[derive(Debug)]
struct RateMeter {
    sampled_at: Instant,
    sampled_total: u64,
    rate: Option<f64>,
}

impl RateMeter {
    fn new() -> Self {
        Self {
            sampled_at: Instant::now(),
            sampled_total: 0,
            rate: None,
        }
    }

    fn sample(&mut self, total: u64) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.sampled_at).as_secs_f64();
        if elapsed < 0.001 {
            return self.rate.unwrap_or(0.0);
        }
        let instant = (total - self.sampled_total) as f64 / elapsed;
        let rate = match self.rate {
            Some(prev) => RATE_ALPHA * instant + (1.0 - RATE_ALPHA) * prev,
            None => instant,
        };
        self.sampled_at = now;
        self.sampled_total = total;
        self.rate = Some(rate);
        rate
    }
}

#[derive(Debug)]
pub struct Category {
    name: String,
    config: CategoryConfig,
    queues: Vec<Queue>,
    round_robin: AtomicUsize,
    appended: AtomicU64,
    rate: Mutex<RateMeter>,
    cleanup_task: Mutex<Option<PeriodicTask>>,
}

impl Category {
    pub fn new(name: impl Into<String>, config: CategoryConfig) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(BrokerError::InvalidInput(
                "category name must not be empty".to_string(),
            ));
        }
        if config.queue_count == 0 {
            return Err(BrokerError::InvalidInput(format!(
                "category '{name}' needs at least one queue"
            )));
        }

        let queues = (0..config.queue_count)
            .map(|i| Queue::new(name.clone(), i, config.retention_ms, config.capacity))
            .collect();

        Ok(Self {
            name,
            config,
            queues,
            round_robin: AtomicUsize::new(0),
            appended: AtomicU64::new(0),
            rate: Mutex::new(RateMeter::new()),
            cleanup_task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CategoryConfig {
        &self.config
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn queue(&self, index: usize) -> Result<&Queue> {
        self.queues.get(index).ok_or_else(|| BrokerError::QueueNotFound {
            category: self.name.clone(),
            queue: index,
        })
    }

    pub fn append(&self, payload: Bytes, input: &MessageInput) -> Result<AppendResult> {
        if input.category != self.name {
            return Err(BrokerError::CategoryMismatch {
                expected: self.name.clone(),
                actual: input.category.clone(),
            });
        }
        // checked here too so a rejected write never takes a round-robin slot
        if payload.is_empty() {
            return Err(BrokerError::InvalidInput(
                "message payload must not be empty".to_string(),
            ));
        }

        let index = self.select_queue(input);
        let metadata = self.queues[index].append(payload, input)?;
        self.appended.fetch_add(1, Ordering::Relaxed);

        Ok(AppendResult {
            id: metadata.id,
            queue: index,
            offset: metadata.offset,
            timestamp: metadata.timestamp,
        })
    }

    /// Pick the queue a message is written to.
    pub fn select_queue(&self, input: &MessageInput) -> usize {
        let n = self.queues.len();
        if n == 1 {
            return 0;
        }
        match input.routing_key() {
            Some(key) => crc32fast::hash(key.as_bytes()) as usize % n,
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % n,
        }
    }

    /// Apply the retention policy to every queue. Returns the number of
    /// messages removed.
    pub fn cleanup_expired(&self) -> usize {
        let removed: usize = self.queues.iter().map(Queue::cleanup).sum();
        if removed > 0 {
            debug!(category = %self.name, removed, "retention cleanup");
        }
        removed
    }

    /// Remove messages every consuming group has committed past.
    ///
    /// `offsets_by_group` maps group id to that group's committed offsets per
    /// queue. Per queue, only groups with a commit for that queue take part
    /// in the minimum; a queue nobody has committed on is left alone.
    pub fn cleanup_consumed_messages(
        &self,
        offsets_by_group: &HashMap<String, HashMap<usize, u64>>,
    ) -> usize {
        let mut removed = 0;
        for queue in &self.queues {
            let min_committed = offsets_by_group
                .values()
                .filter_map(|offsets| offsets.get(&queue.index()).copied())
                .min();
            if let Some(min) = min_committed {
                removed += queue.remove_consumed_messages(min);
            }
        }
        if removed > 0 {
            debug!(category = %self.name, removed, "removed consumed messages");
        }
        removed
    }

    pub fn stats(&self) -> CategoryStats {
        let message_counts: Vec<usize> = self.queues.iter().map(Queue::message_count).collect();
        let byte_counts: Vec<usize> = self.queues.iter().map(Queue::size_bytes).collect();
        let messages_per_sec = self
            .rate
            .lock()
            .sample(self.appended.load(Ordering::Relaxed));

        CategoryStats {
            name: self.name.clone(),
            queue_count: self.queues.len(),
            total_messages: message_counts.iter().sum(),
            total_bytes: byte_counts.iter().sum(),
            message_counts,
            byte_counts,
            messages_per_sec,
        }
    }

    /// Start the periodic retention cleanup. No-op outside a tokio runtime or
    /// if already started.
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) {
        let mut slot = self.cleanup_task.lock();
        if slot.is_some() {
            return;
        }
        let category: Weak<Category> = Arc::downgrade(self);
        *slot = PeriodicTask::spawn(format!("cleanup:{}", self.name), interval, move || {
            if let Some(category) = category.upgrade() {
                category.cleanup_expired();
            }
        });
        if slot.is_some() {
            info!(category = %self.name, ?interval, "retention cleanup scheduled");
        }
    }

    /// Cancel the retention cleanup task without waiting for it.
    pub fn stop_cleanup(&self) {
        drop(self.cleanup_task.lock().take());
    }

    /// Stop the retention cleanup task, waiting up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let task = self.cleanup_task.lock().take();
        if let Some(task) = task {
            task.stop(timeout).await;
        }
    }
}
