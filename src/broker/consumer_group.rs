//! Consumer groups for load-balanced consumption
//!
//! A `ConsumerGroup` tracks the members of one (category, group id) pair,
//! decides which member owns which queue, and stores the group's committed
//! offsets. A committed offset is the next offset the group will read from
//! that queue.
//!
//! Assignment is deterministic: member ids sorted lexicographically, queue
//! `i` goes to member `i % member_count`. Membership changes schedule a
//! debounced rebalance so a burst of joins/leaves produces a single pass;
//! outside a tokio runtime the rebalance happens immediately.
//!
//! Membership and offsets have their own locks, independent of queue locks,
//! so a rebalance never blocks appends or reads.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::client::consumer::ConsumerConfig;
use crate::utils::error::{BrokerError, Result};
use crate::utils::tasks::DebouncedTask;

#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub consumer_id: String,
    pub joined_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub config: ConsumerConfig,
}

#[derive(Debug, Default)]
struct GroupState {
    members: BTreeMap<String, MemberInfo>,
    assignments: HashMap<String, Vec<usize>>,
    generation: u64,
}

#[derive(Debug)]
pub struct ConsumerGroup {
    category: String,
    group_id: String,
    queue_count: usize,
    state: RwLock<GroupState>,
    offsets: RwLock<HashMap<usize, u64>>,
    rebalancer: Mutex<Option<DebouncedTask>>,
}

impl ConsumerGroup {
    pub fn new(category: impl Into<String>, group_id: impl Into<String>, queue_count: usize) -> Self {
        Self {
            category: category.into(),
            group_id: group_id.into(),
            queue_count,
            state: RwLock::new(GroupState::default()),
            offsets: RwLock::new(HashMap::new()),
            rebalancer: Mutex::new(None),
        }
    }

    /// Run rebalances on a debounced background task with the given window.
    /// Without a tokio runtime the group keeps rebalancing inline.
    pub fn start_rebalancer(self: &Arc<Self>, window: Duration) {
        let mut slot = self.rebalancer.lock();
        if slot.is_some() {
            return;
        }
        let group: Weak<ConsumerGroup> = Arc::downgrade(self);
        *slot = DebouncedTask::spawn(
            format!("rebalance:{}:{}", self.category, self.group_id),
            window,
            move || {
                if let Some(group) = group.upgrade() {
                    group.rebalance(group.queue_count);
                }
            },
        );
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn queue_count(&self) -> usize {
        self.queue_count
    }

    /// Add or refresh a member and schedule a rebalance.
    pub fn register_consumer(&self, consumer_id: &str, config: &ConsumerConfig) {
        let now = Utc::now();
        {
            let mut state = self.state.write();
            state
                .members
                .entry(consumer_id.to_string())
                .and_modify(|m| {
                    m.last_heartbeat = now;
                    m.config = config.clone();
                })
                .or_insert_with(|| MemberInfo {
                    consumer_id: consumer_id.to_string(),
                    joined_at: now,
                    last_heartbeat: now,
                    config: config.clone(),
                });
        }
        info!(
            category = %self.category,
            group = %self.group_id,
            consumer = consumer_id,
            "consumer registered"
        );
        self.schedule_rebalance();
    }

    /// Remove a member and its assignment. Returns whether it was a member.
    pub fn unregister_consumer(&self, consumer_id: &str) -> bool {
        let remaining = {
            let mut state = self.state.write();
            if state.members.remove(consumer_id).is_none() {
                return false;
            }
            state.assignments.remove(consumer_id);
            state.members.len()
        };
        info!(
            category = %self.category,
            group = %self.group_id,
            consumer = consumer_id,
            remaining,
            "consumer unregistered"
        );
        if remaining > 0 {
            self.schedule_rebalance();
        }
        true
    }

    /// Record liveness. Never rebalances.
    pub fn heartbeat(&self, consumer_id: &str) -> Result<()> {
        let mut state = self.state.write();
        match state.members.get_mut(consumer_id) {
            Some(member) => {
                member.last_heartbeat = Utc::now();
                Ok(())
            }
            None => Err(BrokerError::UnknownConsumer {
                group: self.group_id.clone(),
                consumer: consumer_id.to_string(),
            }),
        }
    }

    /// Evict members whose last heartbeat is older than `timeout`, then
    /// rebalance once for the whole batch. Returns the evicted ids.
    pub fn remove_inactive_consumers(&self, timeout: Duration) -> Vec<String> {
        let Some(cutoff) = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| Utc::now().checked_sub_signed(t))
        else {
            return Vec::new();
        };
        let evicted: Vec<String> = {
            let mut state = self.state.write();
            let stale: Vec<String> = state
                .members
                .values()
                .filter(|m| m.last_heartbeat < cutoff)
                .map(|m| m.consumer_id.clone())
                .collect();
            for id in &stale {
                state.members.remove(id);
                state.assignments.remove(id);
            }
            stale
        };
        if !evicted.is_empty() {
            info!(
                category = %self.category,
                group = %self.group_id,
                ?evicted,
                "evicted inactive consumers"
            );
            self.schedule_rebalance();
        }
        evicted
    }

    /// Recompute the queue assignment from the current membership.
    pub fn rebalance(&self, total_queues: usize) -> HashMap<String, Vec<usize>> {
        let mut state = self.state.write();
        let member_ids: Vec<String> = state.members.keys().cloned().collect();
        let mut assignments: HashMap<String, Vec<usize>> = member_ids
            .iter()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        if !member_ids.is_empty() {
            for queue in 0..total_queues {
                let owner = &member_ids[queue % member_ids.len()];
                if let Some(queues) = assignments.get_mut(owner) {
                    queues.push(queue);
                }
            }
        }
        state.assignments = assignments.clone();
        state.generation += 1;
        info!(
            category = %self.category,
            group = %self.group_id,
            generation = state.generation,
            members = member_ids.len(),
            ?assignments,
            "rebalanced"
        );
        assignments
    }

    fn schedule_rebalance(&self) {
        let rebalancer = self.rebalancer.lock();
        match rebalancer.as_ref() {
            Some(task) => task.trigger(),
            None => {
                drop(rebalancer);
                self.rebalance(self.queue_count);
            }
        }
    }

    /// Queues currently owned by `consumer_id`, empty if none or unknown.
    pub fn assignment(&self, consumer_id: &str) -> Vec<usize> {
        self.state
            .read()
            .assignments
            .get(consumer_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn assignments(&self) -> HashMap<String, Vec<usize>> {
        self.state.read().assignments.clone()
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.state.read().members.values().cloned().collect()
    }

    pub fn is_member(&self, consumer_id: &str) -> bool {
        self.state.read().members.contains_key(consumer_id)
    }

    pub fn member_count(&self) -> usize {
        self.state.read().members.len()
    }

    /// Number of completed rebalance passes.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    pub fn commit_offset(&self, queue: usize, offset: u64) -> Result<()> {
        if queue >= self.queue_count {
            return Err(BrokerError::QueueNotFound {
                category: self.category.clone(),
                queue,
            });
        }
        let previous = self.offsets.write().insert(queue, offset);
        if previous.is_some_and(|p| p > offset) {
            debug!(
                category = %self.category,
                group = %self.group_id,
                queue,
                offset,
                "committed offset moved backwards"
            );
        }
        Ok(())
    }

    /// Commit `offset` only if it moves the queue forward. The comparison and
    /// the write happen under one lock. Returns the committed offset after
    /// the call.
    pub fn advance_offset(&self, queue: usize, offset: u64) -> Result<u64> {
        if queue >= self.queue_count {
            return Err(BrokerError::QueueNotFound {
                category: self.category.clone(),
                queue,
            });
        }
        let mut offsets = self.offsets.write();
        let committed = offsets
            .entry(queue)
            .and_modify(|o| *o = (*o).max(offset))
            .or_insert(offset);
        Ok(*committed)
    }

    pub fn get_committed_offset(&self, queue: usize) -> Option<u64> {
        self.offsets.read().get(&queue).copied()
    }

    pub fn committed_offsets(&self) -> HashMap<usize, u64> {
        self.offsets.read().clone()
    }

    /// Cancel the rebalance task without waiting for it. Later membership
    /// changes rebalance inline.
    pub fn stop_rebalancer(&self) {
        drop(self.rebalancer.lock().take());
    }

    /// Stop the rebalance task, waiting up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let task = self.rebalancer.lock().take();
        if let Some(task) = task {
            task.stop(timeout).await;
        }
    }
}
