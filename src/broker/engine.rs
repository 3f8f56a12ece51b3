//! Broker engine
//!
//! The `Broker` is the registry every other component goes through:
//! - categories, created lazily by name with a supplied or configured config;
//! - consumer groups, created lazily per (category, group id) on subscribe;
//! - the publish, fetch and commit paths used by producers and consumers;
//! - a periodic maintenance pass that evicts silent consumers and drops
//!   messages every group has committed past.
//!
//! A broker is built with `Broker::new` and shared as `Arc<Broker>`; several
//! independent brokers can live in one process. Background tasks are only
//! started when a tokio runtime is available and are stopped by `shutdown`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::broker::category::{Category, CategoryConfig, CategoryStats};
use crate::broker::consumer_group::ConsumerGroup;
use crate::broker::message::{MessageInput, PublishResult, StoredMessage};
use crate::client::consumer::{Consumer, ConsumerConfig};
use crate::client::producer::{Producer, ProducerConfig};
use crate::client::serializer::{Deserializer, Serializer};
use crate::config::Settings;
use crate::protocol::{Command, WireMessage};
use crate::utils::error::{BrokerError, Result};
use crate::utils::tasks::PeriodicTask;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub maintenance_interval: Duration,
    pub consumer_timeout: Duration,
    pub rebalance_debounce: Duration,
    pub cleanup_interval: Duration,
    pub shutdown_timeout: Duration,
    pub default_category: CategoryConfig,
    pub category_overrides: HashMap<String, CategoryConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(30),
            consumer_timeout: Duration::from_secs(30),
            rebalance_debounce: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            default_category: CategoryConfig::default(),
            category_overrides: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    /// Config used when `name` is created implicitly.
    pub fn category_config(&self, name: &str) -> CategoryConfig {
        self.category_overrides
            .get(name)
            .copied()
            .unwrap_or(self.default_category)
    }
}

impl From<&Settings> for BrokerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            maintenance_interval: Duration::from_millis(settings.broker.maintenance_interval_ms),
            consumer_timeout: Duration::from_millis(settings.broker.consumer_timeout_ms),
            rebalance_debounce: Duration::from_millis(settings.broker.rebalance_debounce_ms),
            cleanup_interval: Duration::from_millis(settings.broker.cleanup_interval_ms),
            shutdown_timeout: Duration::from_millis(settings.broker.shutdown_timeout_ms),
            default_category: settings.category.to_config(),
            category_overrides: settings
                .categories
                .iter()
                .map(|(name, c)| (name.clone(), c.to_config()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerStats {
    pub category_count: usize,
    pub total_messages: usize,
    pub total_bytes: usize,
    pub total_consumers: usize,
    pub per_category: HashMap<String, CategoryStats>,
}

/// Consumption progress of one group on one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueLag {
    pub queue: usize,
    pub next_offset: u64,
    pub committed_offset: Option<u64>,
    pub lag: u64,
}

type GroupKey = (String, String);

#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    categories: RwLock<HashMap<String, Arc<Category>>>,
    groups: RwLock<HashMap<GroupKey, Arc<ConsumerGroup>>>,
    maintenance: Mutex<Option<PeriodicTask>>,
    shut_down: AtomicBool,
}

impl Broker {
    /// Create a broker and, inside a tokio runtime, start its maintenance
    /// loop.
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let broker = Arc::new(Self {
            config,
            categories: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            maintenance: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let weak: Weak<Broker> = Arc::downgrade(&broker);
        let task = PeriodicTask::spawn("maintenance", broker.config.maintenance_interval, move || {
            if let Some(broker) = weak.upgrade() {
                broker.run_maintenance();
            }
        });
        *broker.maintenance.lock() = task;
        broker
    }

    pub fn from_settings(settings: &Settings) -> Arc<Self> {
        Self::new(BrokerConfig::from(settings))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(BrokerError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Return the category called `name`, creating it with `config` if it
    /// does not exist yet. An existing category keeps its original config.
    pub fn get_or_create_category(&self, name: &str, config: CategoryConfig) -> Result<Arc<Category>> {
        self.ensure_running()?;
        if let Some(category) = self.categories.read().get(name) {
            if category.config() != &config {
                debug!(category = name, "category exists, ignoring new config");
            }
            return Ok(category.clone());
        }

        let mut categories = self.categories.write();
        if let Some(category) = categories.get(name) {
            return Ok(category.clone());
        }
        let category = Arc::new(Category::new(name, config)?);
        category.start_cleanup(self.config.cleanup_interval);
        categories.insert(name.to_string(), category.clone());
        info!(
            category = name,
            queues = config.queue_count,
            retention_ms = config.retention_ms,
            "category created"
        );
        Ok(category)
    }

    /// Resolve `name`, creating it from the broker's configured defaults.
    fn resolve_category(&self, name: &str) -> Result<Arc<Category>> {
        if let Some(category) = self.categories.read().get(name) {
            return Ok(category.clone());
        }
        self.get_or_create_category(name, self.config.category_config(name))
    }

    pub fn category(&self, name: &str) -> Option<Arc<Category>> {
        self.categories.read().get(name).cloned()
    }

    fn existing_category(&self, name: &str) -> Result<Arc<Category>> {
        self.category(name)
            .ok_or_else(|| BrokerError::CategoryNotFound(name.to_string()))
    }

    /// Delete a category together with every consumer group on it. Returns
    /// whether the category existed.
    pub fn delete_category(&self, name: &str) -> bool {
        let Some(category) = self.categories.write().remove(name) else {
            return false;
        };
        category.stop_cleanup();

        let removed: Vec<Arc<ConsumerGroup>> = {
            let mut groups = self.groups.write();
            let keys: Vec<GroupKey> = groups.keys().filter(|(c, _)| c == name).cloned().collect();
            keys.iter().filter_map(|k| groups.remove(k)).collect()
        };
        for group in &removed {
            group.stop_rebalancer();
        }
        info!(category = name, groups = removed.len(), "category deleted");
        true
    }

    pub fn list_categories(&self) -> Vec<String> {
        let mut names: Vec<String> = self.categories.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create_producer<T>(
        self: &Arc<Self>,
        config: ProducerConfig,
        serializer: impl Serializer<T> + 'static,
    ) -> Producer<T> {
        Producer::new(self.clone(), config, serializer)
    }

    pub fn create_consumer<T: Send + 'static>(
        self: &Arc<Self>,
        config: ConsumerConfig,
        deserializer: impl Deserializer<T> + 'static,
    ) -> Consumer<T> {
        Consumer::new(self.clone(), config, deserializer)
    }

    /// Append `payload` to the category named in `input`, creating the
    /// category if needed.
    pub fn publish(&self, payload: Bytes, input: MessageInput) -> Result<PublishResult> {
        self.ensure_running()?;
        if input.category.is_empty() {
            return Err(BrokerError::InvalidInput(
                "category name must not be empty".to_string(),
            ));
        }
        let category = self.resolve_category(&input.category)?;
        let appended = category.append(payload, &input)?;
        Ok(PublishResult {
            message_id: appended.id,
            category: input.category,
            queue: appended.queue,
            offset: appended.offset,
            timestamp: appended.timestamp,
        })
    }

    /// Decode a `Publish` frame and publish its payload.
    pub fn publish_frame(&self, frame: &[u8]) -> Result<PublishResult> {
        let message = WireMessage::decode_versioned(frame)?;
        if message.command != Command::Publish {
            return Err(BrokerError::InvalidInput(format!(
                "expected a publish frame, got {:?}",
                message.command
            )));
        }
        let input = message.to_input();
        self.publish(message.payload, input)
    }

    fn get_or_create_group(&self, category: &Category, group_id: &str) -> Arc<ConsumerGroup> {
        let key = (category.name().to_string(), group_id.to_string());
        if let Some(group) = self.groups.read().get(&key) {
            return group.clone();
        }
        let mut groups = self.groups.write();
        groups
            .entry(key)
            .or_insert_with(|| {
                let group = Arc::new(ConsumerGroup::new(
                    category.name(),
                    group_id,
                    category.queue_count(),
                ));
                group.start_rebalancer(self.config.rebalance_debounce);
                debug!(category = category.name(), group = group_id, "consumer group created");
                group
            })
            .clone()
    }

    pub fn consumer_group(&self, category: &str, group_id: &str) -> Option<Arc<ConsumerGroup>> {
        self.groups
            .read()
            .get(&(category.to_string(), group_id.to_string()))
            .cloned()
    }

    fn existing_group(&self, category: &str, group_id: &str) -> Result<Arc<ConsumerGroup>> {
        self.consumer_group(category, group_id)
            .ok_or_else(|| BrokerError::GroupNotFound {
                category: category.to_string(),
                group: group_id.to_string(),
            })
    }

    fn groups_of(&self, category: &str) -> Vec<Arc<ConsumerGroup>> {
        self.groups
            .read()
            .iter()
            .filter(|((c, _), _)| c == category)
            .map(|(_, g)| g.clone())
            .collect()
    }

    /// Register `consumer_id` in the group for `category`. The queue
    /// assignment shows up after the group's next rebalance.
    pub fn subscribe(
        &self,
        category: &str,
        group_id: &str,
        consumer_id: &str,
        config: &ConsumerConfig,
    ) -> Result<()> {
        self.ensure_running()?;
        let category = self.resolve_category(category)?;
        let group = self.get_or_create_group(&category, group_id);
        group.register_consumer(consumer_id, config);
        Ok(())
    }

    /// Remove `consumer_id` from its group. Returns whether it was a member.
    pub fn unsubscribe(&self, category: &str, group_id: &str, consumer_id: &str) -> bool {
        self.consumer_group(category, group_id)
            .is_some_and(|g| g.unregister_consumer(consumer_id))
    }

    pub fn heartbeat(&self, category: &str, group_id: &str, consumer_id: &str) -> Result<()> {
        self.existing_group(category, group_id)?.heartbeat(consumer_id)
    }

    /// Queues currently assigned to `consumer_id`.
    pub fn assignment(&self, category: &str, group_id: &str, consumer_id: &str) -> Vec<usize> {
        self.consumer_group(category, group_id)
            .map(|g| g.assignment(consumer_id))
            .unwrap_or_default()
    }

    pub fn fetch_messages(
        &self,
        category: &str,
        queue: usize,
        from_offset: u64,
        max_messages: usize,
    ) -> Result<Vec<StoredMessage>> {
        self.ensure_running()?;
        let category = self.existing_category(category)?;
        Ok(category.queue(queue)?.read(from_offset, max_messages))
    }

    /// Like `fetch_messages`, encoding each message as a `Fetch` frame. The
    /// category's persistence setting becomes the `PERSISTENT` flag.
    pub fn fetch_frames(
        &self,
        category: &str,
        queue: usize,
        from_offset: u64,
        max_messages: usize,
    ) -> Result<Vec<Bytes>> {
        self.ensure_running()?;
        let cat = self.existing_category(category)?;
        let persistent = cat.config().persistent;
        cat.queue(queue)?
            .read(from_offset, max_messages)
            .iter()
            .map(|stored| {
                WireMessage::from_stored(stored, Command::Fetch, persistent)
                    .encode()
                    .map_err(BrokerError::from)
            })
            .collect()
    }

    pub fn commit_offset(&self, category: &str, group_id: &str, queue: usize, offset: u64) -> Result<()> {
        self.existing_group(category, group_id)?
            .commit_offset(queue, offset)
    }

    /// Forward-only commit, used by consumers so concurrent commits from
    /// different members never rewind a queue.
    pub fn advance_offset(&self, category: &str, group_id: &str, queue: usize, offset: u64) -> Result<u64> {
        self.existing_group(category, group_id)?
            .advance_offset(queue, offset)
    }

    pub fn get_committed_offset(&self, category: &str, group_id: &str, queue: usize) -> Result<Option<u64>> {
        let group = self.existing_group(category, group_id)?;
        if queue >= group.queue_count() {
            return Err(BrokerError::QueueNotFound {
                category: category.to_string(),
                queue,
            });
        }
        Ok(group.get_committed_offset(queue))
    }

    /// Per-queue progress of `group_id` on `category`.
    pub fn consumer_lag(&self, category: &str, group_id: &str) -> Result<Vec<QueueLag>> {
        let cat = self.existing_category(category)?;
        let group = self.existing_group(category, group_id)?;
        Ok(cat
            .queues()
            .iter()
            .map(|queue| {
                let next_offset = queue.next_offset();
                let committed_offset = group.get_committed_offset(queue.index());
                QueueLag {
                    queue: queue.index(),
                    next_offset,
                    committed_offset,
                    lag: next_offset.saturating_sub(committed_offset.unwrap_or(0)),
                }
            })
            .collect())
    }

    pub fn get_stats(&self) -> BrokerStats {
        let categories: Vec<Arc<Category>> = self.categories.read().values().cloned().collect();
        let per_category: HashMap<String, CategoryStats> = categories
            .iter()
            .map(|c| (c.name().to_string(), c.stats()))
            .collect();
        let total_consumers = self.groups.read().values().map(|g| g.member_count()).sum();

        BrokerStats {
            category_count: per_category.len(),
            total_messages: per_category.values().map(|s| s.total_messages).sum(),
            total_bytes: per_category.values().map(|s| s.total_bytes).sum(),
            total_consumers,
            per_category,
        }
    }

    /// One maintenance pass over every category and each of its groups. A
    /// failing group is logged and skipped; consumed-message cleanup for its
    /// category then waits for a later pass.
    pub fn run_maintenance(&self) {
        if self.is_shut_down() {
            return;
        }
        for name in self.list_categories() {
            let Ok(category) = self.existing_category(&name) else {
                continue;
            };
            let mut offsets_by_group = HashMap::new();
            let mut failed = false;
            for group in self.groups_of(&name) {
                match self.maintain_group(&category, &group) {
                    Ok(offsets) => {
                        offsets_by_group.insert(group.group_id().to_string(), offsets);
                    }
                    Err(e) => {
                        error!(category = %name, group = %group.group_id(), "maintenance failed: {e}");
                        failed = true;
                    }
                }
            }
            if failed {
                continue;
            }
            let removed = category.cleanup_consumed_messages(&offsets_by_group);
            if removed > 0 {
                debug!(category = %name, removed, "maintenance removed consumed messages");
            }
        }
    }

    fn maintain_group(&self, category: &Category, group: &ConsumerGroup) -> Result<HashMap<usize, u64>> {
        if group.queue_count() != category.queue_count() {
            return Err(BrokerError::InvalidInput(format!(
                "group '{}' tracks {} queues, category '{}' has {}",
                group.group_id(),
                group.queue_count(),
                category.name(),
                category.queue_count()
            )));
        }
        group.remove_inactive_consumers(self.config.consumer_timeout);
        Ok(group.committed_offsets())
    }

    /// Stop maintenance, category cleanup and group rebalancing. Later
    /// publish, fetch and subscribe calls fail with `ShutDown`. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("broker shutting down");
        let timeout = self.config.shutdown_timeout;

        let maintenance = self.maintenance.lock().take();
        if let Some(task) = maintenance {
            task.stop(timeout).await;
        }

        let categories: Vec<Arc<Category>> = self.categories.read().values().cloned().collect();
        for category in categories {
            category.shutdown(timeout).await;
        }
        let groups: Vec<Arc<ConsumerGroup>> = self.groups.read().values().cloned().collect();
        for group in groups {
            group.shutdown(timeout).await;
        }
        info!("broker shut down");
    }
}
