//! Consumer
//!
//! A `Consumer` joins one consumer group per subscribed category and runs a
//! background poll loop:
//! - every `poll_interval` it heartbeats its groups and looks up which
//!   queues it currently owns;
//! - for each owned queue with nothing in flight, it fetches up to
//!   `max_poll_records` messages from its in-memory position (or, the first
//!   time, from the group's committed offset) and hands the batch to a
//!   dispatch task;
//! - a dispatch task deserializes and runs the handler one message at a
//!   time, advancing the position only after the handler succeeds.
//!
//! Queues progress independently; a failing or slow handler stalls only its
//! own queue. A failed message is not skipped, so it is delivered again on
//! the next poll (at-least-once). Dispatch tasks share a fixed number of
//! permits, bounding how many handlers run at once.
//!
//! With auto-commit enabled, positions are pushed to the broker every
//! `auto_commit_interval`, on unsubscribe and on close. Commits never move a
//! group's offset backwards.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::broker::message::{Headers, MessageId, MessageMetadata, StoredMessage};
use crate::client::serializer::Deserializer;
use crate::utils::error::{BrokerError, Result};
use crate::utils::tasks::PeriodicTask;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler<T> = Arc<
    dyn Fn(Message<T>) -> BoxFuture<'static, std::result::Result<(), HandlerError>> + Send + Sync,
>;

/// (category, queue index)
type QueueKey = (String, usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub client_id: String,
    pub group_id: String,
    pub auto_commit: bool,
    pub auto_commit_interval: Duration,
    pub max_poll_records: usize,
    pub poll_interval: Duration,
    pub max_concurrent_handlers: usize,
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client_id: format!("consumer-{}", Uuid::new_v4()),
            group_id: "default".to_string(),
            auto_commit: true,
            auto_commit_interval: Duration::from_secs(5),
            max_poll_records: 500,
            poll_interval: Duration::from_millis(100),
            max_concurrent_handlers: 8,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ConsumerConfig {
    pub fn new(client_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            group_id: group_id.into(),
            ..Self::default()
        }
    }

    pub fn auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    pub fn auto_commit_interval(mut self, interval: Duration) -> Self {
        self.auto_commit_interval = interval;
        self
    }

    pub fn max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = max;
        self
    }
}

/// A deserialized message as seen by a handler.
#[derive(Debug, Clone)]
pub struct Message<T> {
    pub value: T,
    pub metadata: MessageMetadata,
}

impl<T> Message<T> {
    pub fn id(&self) -> MessageId {
        self.metadata.id
    }

    pub fn category(&self) -> &str {
        &self.metadata.category
    }

    pub fn key(&self) -> Option<&str> {
        self.metadata.key.as_deref()
    }

    pub fn queue(&self) -> usize {
        self.metadata.queue
    }

    pub fn offset(&self) -> u64 {
        self.metadata.offset
    }

    pub fn timestamp(&self) -> i64 {
        self.metadata.timestamp
    }

    pub fn headers(&self) -> &Headers {
        &self.metadata.headers
    }
}

struct ConsumerInner<T> {
    broker: Arc<Broker>,
    config: ConsumerConfig,
    deserializer: Arc<dyn Deserializer<T>>,
    handlers: RwLock<HashMap<String, Handler<T>>>,
    positions: Mutex<HashMap<QueueKey, u64>>,
    in_flight: Mutex<HashSet<QueueKey>>,
    permits: Arc<Semaphore>,
    dispatches: Mutex<JoinSet<()>>,
    paused: AtomicBool,
    closed: AtomicBool,
    poll_task: Mutex<Option<PeriodicTask>>,
    commit_task: Mutex<Option<PeriodicTask>>,
}

pub struct Consumer<T> {
    inner: Arc<ConsumerInner<T>>,
}

impl<T> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("config", &self.inner.config)
            .field("paused", &self.inner.paused)
            .field("closed", &self.inner.closed)
            .finish()
    }
}

impl<T: Send + 'static> Consumer<T> {
    /// Build a consumer. Inside a tokio runtime with auto-commit enabled the
    /// commit task starts right away; polling starts on first subscribe.
    pub fn new(
        broker: Arc<Broker>,
        config: ConsumerConfig,
        deserializer: impl Deserializer<T> + 'static,
    ) -> Self {
        let inner = Arc::new(ConsumerInner {
            broker,
            permits: Arc::new(Semaphore::new(config.max_concurrent_handlers.max(1))),
            config,
            deserializer: Arc::new(deserializer),
            handlers: RwLock::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            dispatches: Mutex::new(JoinSet::new()),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            poll_task: Mutex::new(None),
            commit_task: Mutex::new(None),
        });

        if inner.config.auto_commit {
            let weak: Weak<ConsumerInner<T>> = Arc::downgrade(&inner);
            *inner.commit_task.lock() = PeriodicTask::spawn(
                format!("commit:{}", inner.config.client_id),
                inner.config.auto_commit_interval,
                move || {
                    if let Some(inner) = weak.upgrade() {
                        // failures are logged per queue
                        let _ = inner.commit_positions();
                    }
                },
            );
        }

        Self { inner }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn group_id(&self) -> &str {
        &self.inner.config.group_id
    }

    /// Subscribe to one category with `handler`.
    pub fn subscribe<F, Fut>(&self, category: &str, handler: F) -> Result<()>
    where
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe_many(&[category], handler)
    }

    /// Subscribe to several categories sharing one handler.
    pub fn subscribe_many<F, Fut>(&self, categories: &[&str], handler: F) -> Result<()>
    where
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let handler: Handler<T> = Arc::new(move |msg: Message<T>| handler(msg).boxed());
        for category in categories {
            self.inner.subscribe(category, handler.clone())?;
        }
        Ok(())
    }

    /// Leave the group for `category`, committing its positions first when
    /// auto-commit is on. Polling stops once nothing is subscribed.
    pub fn unsubscribe(&self, category: &str) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.unsubscribe(category);
        Ok(())
    }

    pub fn unsubscribe_all(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.unsubscribe_all();
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Push every in-memory position to the broker now.
    pub async fn commit_sync(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.commit_positions()
    }

    /// In-memory position (next offset to deliver) for one queue.
    pub fn position(&self, category: &str, queue: usize) -> Option<u64> {
        self.inner
            .positions
            .lock()
            .get(&(category.to_string(), queue))
            .copied()
    }

    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::AcqRel) {
            info!(consumer = %self.inner.config.client_id, "consumer paused");
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::AcqRel) {
            info!(consumer = %self.inner.config.client_id, "consumer resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop polling and dispatch, commit (when auto-commit is on), leave
    /// every group and stop the commit task. Each wait is bounded by
    /// `shutdown_timeout`. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let timeout = inner.config.shutdown_timeout;

        let poll = inner.poll_task.lock().take();
        if let Some(task) = poll {
            task.stop(timeout).await;
        }

        let mut dispatches = std::mem::take(&mut *inner.dispatches.lock());
        let drained = tokio::time::timeout(timeout, async {
            while dispatches.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                consumer = %inner.config.client_id,
                "handlers still running after {timeout:?}, aborting"
            );
            dispatches.abort_all();
        }

        inner.unsubscribe_all();

        let commit = inner.commit_task.lock().take();
        if let Some(task) = commit {
            task.stop(timeout).await;
        }
        info!(consumer = %inner.config.client_id, "consumer closed");
    }
}

impl<T: Send + 'static> ConsumerInner<T> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(BrokerError::ConsumerClosed(self.config.client_id.clone()))
        } else {
            Ok(())
        }
    }

    fn subscribe(self: &Arc<Self>, category: &str, handler: Handler<T>) -> Result<()> {
        self.ensure_open()?;
        self.broker.subscribe(
            category,
            &self.config.group_id,
            &self.config.client_id,
            &self.config,
        )?;
        self.handlers.write().insert(category.to_string(), handler);
        info!(
            consumer = %self.config.client_id,
            group = %self.config.group_id,
            category,
            "subscribed"
        );
        self.ensure_polling();
        Ok(())
    }

    fn ensure_polling(self: &Arc<Self>) {
        let mut slot = self.poll_task.lock();
        if slot.is_some() {
            return;
        }
        let weak: Weak<ConsumerInner<T>> = Arc::downgrade(self);
        *slot = PeriodicTask::spawn(
            format!("poll:{}", self.config.client_id),
            self.config.poll_interval,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.poll();
                }
            },
        );
        if slot.is_none() {
            warn!(consumer = %self.config.client_id, "no tokio runtime, polling not started");
        }
    }

    fn unsubscribe(&self, category: &str) {
        if self.handlers.write().remove(category).is_none() {
            return;
        }
        if self.config.auto_commit {
            if let Err(e) = self.commit_category(category) {
                error!(
                    consumer = %self.config.client_id,
                    category,
                    "commit on unsubscribe failed: {e}"
                );
            }
        }
        self.positions.lock().retain(|(c, _), _| c != category);
        self.broker
            .unsubscribe(category, &self.config.group_id, &self.config.client_id);
        info!(consumer = %self.config.client_id, category, "unsubscribed");

        if self.handlers.read().is_empty() {
            // Dropping the task cancels it.
            drop(self.poll_task.lock().take());
        }
    }

    fn unsubscribe_all(&self) {
        let categories: Vec<String> = self.handlers.read().keys().cloned().collect();
        for category in categories {
            self.unsubscribe(&category);
        }
    }

    fn is_subscribed(&self, category: &str) -> bool {
        self.handlers.read().contains_key(category)
    }

    /// One tick of the poll loop.
    fn poll(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut dispatches = self.dispatches.lock();
            while dispatches.try_join_next().is_some() {}
        }

        let subscriptions: Vec<(String, Handler<T>)> = self
            .handlers
            .read()
            .iter()
            .map(|(c, h)| (c.clone(), h.clone()))
            .collect();

        for (category, handler) in subscriptions {
            self.keep_alive(&category);
            let assigned = self
                .broker
                .assignment(&category, &self.config.group_id, &self.config.client_id);
            self.release_revoked(&category, &assigned);

            if self.paused.load(Ordering::Acquire) {
                continue;
            }
            for queue in assigned {
                self.dispatch_queue(&category, queue, &handler);
            }
        }
    }

    /// Heartbeat the group, rejoining it if this consumer was evicted.
    fn keep_alive(&self, category: &str) {
        let group = &self.config.group_id;
        let id = &self.config.client_id;
        match self.broker.heartbeat(category, group, id) {
            Ok(()) => {}
            Err(BrokerError::UnknownConsumer { .. }) | Err(BrokerError::GroupNotFound { .. }) => {
                warn!(consumer = %id, category, "not a group member, rejoining");
                if let Err(e) = self.broker.subscribe(category, group, id, &self.config) {
                    error!(consumer = %id, category, "rejoin failed: {e}");
                }
            }
            Err(e) => debug!(consumer = %id, category, "heartbeat failed: {e}"),
        }
    }

    /// Commit and forget positions for queues no longer assigned here.
    fn release_revoked(&self, category: &str, assigned: &[usize]) {
        let revoked: Vec<QueueKey> = {
            let in_flight = self.in_flight.lock();
            self.positions
                .lock()
                .keys()
                .filter(|key| key.0 == category && !assigned.contains(&key.1))
                .filter(|key| !in_flight.contains(*key))
                .cloned()
                .collect()
        };
        for key in revoked {
            let position = self.positions.lock().remove(&key);
            if let Some(offset) = position {
                if self.config.auto_commit {
                    if let Err(e) = self.commit_one(&key, offset) {
                        error!(
                            consumer = %self.config.client_id,
                            category,
                            queue = key.1,
                            "commit on revoke failed: {e}"
                        );
                    }
                }
                debug!(consumer = %self.config.client_id, category, queue = key.1, "queue revoked");
            }
        }
    }

    fn dispatch_queue(self: &Arc<Self>, category: &str, queue: usize, handler: &Handler<T>) {
        let key: QueueKey = (category.to_string(), queue);
        if self.in_flight.lock().contains(&key) {
            return;
        }

        let position = self.positions.lock().get(&key).copied();
        let from = match position {
            Some(offset) => offset,
            None => match self
                .broker
                .get_committed_offset(category, &self.config.group_id, queue)
            {
                Ok(committed) => {
                    let start = committed.unwrap_or(0);
                    self.positions.lock().insert(key.clone(), start);
                    start
                }
                Err(e) => {
                    debug!(
                        consumer = %self.config.client_id,
                        category,
                        queue,
                        "no start offset: {e}"
                    );
                    return;
                }
            },
        };

        let batch = match self
            .broker
            .fetch_messages(category, queue, from, self.config.max_poll_records)
        {
            Ok(batch) if batch.is_empty() => return,
            Ok(batch) => batch,
            Err(e) => {
                debug!(consumer = %self.config.client_id, category, queue, "fetch failed: {e}");
                return;
            }
        };

        self.in_flight.lock().insert(key.clone());
        let inner = self.clone();
        let handler = handler.clone();
        self.dispatches
            .lock()
            .spawn(async move { inner.deliver(key, batch, handler).await });
    }

    /// Run the handler over `batch` in offset order, stopping at the first
    /// failure.
    async fn deliver(
        self: Arc<Self>,
        key: QueueKey,
        batch: Vec<StoredMessage>,
        handler: Handler<T>,
    ) {
        let permit = self.permits.clone().acquire_owned().await;
        if permit.is_ok() {
            for stored in batch {
                if self.closed.load(Ordering::Acquire)
                    || self.paused.load(Ordering::Acquire)
                    || !self.is_subscribed(&key.0)
                {
                    break;
                }
                let offset = stored.offset;
                let value = match self.deserializer.deserialize(&stored.payload) {
                    Ok(value) => value,
                    Err(e) => {
                        error!(
                            consumer = %self.config.client_id,
                            category = %key.0,
                            queue = key.1,
                            offset,
                            "cannot deserialize message: {e}"
                        );
                        break;
                    }
                };
                let message = Message {
                    value,
                    metadata: stored.metadata,
                };
                let outcome = AssertUnwindSafe(handler(message)).catch_unwind().await;
                match outcome {
                    Ok(Ok(())) => {
                        if self.is_subscribed(&key.0) {
                            self.positions.lock().insert(key.clone(), offset + 1);
                        }
                    }
                    Ok(Err(e)) => {
                        error!(
                            consumer = %self.config.client_id,
                            category = %key.0,
                            queue = key.1,
                            offset,
                            "handler failed, will redeliver: {e}"
                        );
                        break;
                    }
                    Err(_) => {
                        error!(
                            consumer = %self.config.client_id,
                            category = %key.0,
                            queue = key.1,
                            offset,
                            "handler panicked, will redeliver"
                        );
                        break;
                    }
                }
            }
        }
        self.in_flight.lock().remove(&key);
    }

    fn commit_one(&self, key: &QueueKey, offset: u64) -> Result<()> {
        self.broker
            .advance_offset(&key.0, &self.config.group_id, key.1, offset)
            .map(|_| ())
    }

    fn commit_category(&self, category: &str) -> Result<()> {
        let positions: Vec<(QueueKey, u64)> = self
            .positions
            .lock()
            .iter()
            .filter(|(k, _)| k.0 == category)
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let mut result = Ok(());
        for (key, offset) in positions {
            if let Err(e) = self.commit_one(&key, offset) {
                result = Err(e);
            }
        }
        result
    }

    /// Commit every known position. Failures are logged; the last one is
    /// returned.
    fn commit_positions(&self) -> Result<()> {
        let positions: Vec<(QueueKey, u64)> = self
            .positions
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let mut result = Ok(());
        for (key, offset) in positions {
            if let Err(e) = self.commit_one(&key, offset) {
                error!(
                    consumer = %self.config.client_id,
                    category = %key.0,
                    queue = key.1,
                    "commit failed: {e}"
                );
                result = Err(e);
            }
        }
        result
    }
}
