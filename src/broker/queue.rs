//! Queue (partition)
//!
//! A `Queue` is one ordered, append-only log of a category, addressed by
//! 0-based offsets. Offsets are contiguous: the log only ever loses a prefix
//! (retention cleanup or consumed-message removal), so the message at offset
//! `o` sits at index `o - first_offset` of the backing deque.
//!
//! Concurrency: `append`, `cleanup` and `remove_consumed_messages` take the
//! write side of the log lock; `read` takes the read side and may run
//! alongside other reads.

use std::collections::VecDeque;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::broker::message::{MessageId, MessageInput, MessageMetadata, StoredMessage};
use crate::utils::error::{BrokerError, Result};

/// Per-queue write ceilings. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCapacityConfig {
    pub max_messages: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl QueueCapacityConfig {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = Some(max);
        self
    }

    pub fn with_max_bytes(mut self, max: usize) -> Self {
        self.max_bytes = Some(max);
        self
    }
}

#[derive(Debug, Default)]
struct QueueLog {
    messages: VecDeque<StoredMessage>,
    next_offset: u64,
    total_bytes: usize,
    last_timestamp: i64,
}

impl QueueLog {
    fn pop_front(&mut self) {
        if let Some(msg) = self.messages.pop_front() {
            self.total_bytes -= msg.size();
        }
    }
}

#[derive(Debug)]
pub struct Queue {
    category: String,
    index: usize,
    retention_ms: i64,
    capacity: QueueCapacityConfig,
    log: RwLock<QueueLog>,
}

impl Queue {
    pub fn new(
        category: impl Into<String>,
        index: usize,
        retention_ms: i64,
        capacity: QueueCapacityConfig,
    ) -> Self {
        Self {
            category: category.into(),
            index,
            retention_ms,
            capacity,
            log: RwLock::new(QueueLog::default()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> QueueCapacityConfig {
        self.capacity
    }

    /// Append a payload, assigning it the next offset.
    ///
    /// Capacity is checked before an offset is allocated, so a rejected
    /// append leaves the offset sequence untouched.
    pub fn append(&self, payload: Bytes, input: &MessageInput) -> Result<MessageMetadata> {
        if payload.is_empty() {
            return Err(BrokerError::InvalidInput(
                "message payload must not be empty".to_string(),
            ));
        }

        let mut log = self.log.write();

        if let Some(max) = self.capacity.max_messages {
            if log.messages.len() >= max {
                return Err(self.capacity_error(format!("message count limit {max} reached")));
            }
        }
        if let Some(max) = self.capacity.max_bytes {
            if log.total_bytes + payload.len() > max {
                return Err(self.capacity_error(format!(
                    "{} + {} bytes exceeds limit {max}",
                    log.total_bytes,
                    payload.len()
                )));
            }
        }

        let offset = log.next_offset;
        // Wall clocks can step backwards; keep timestamps ordered with offsets.
        let timestamp = Utc::now().timestamp_millis().max(log.last_timestamp);

        let metadata = MessageMetadata {
            id: MessageId::new(),
            category: self.category.clone(),
            key: input.key.clone(),
            timestamp,
            queue: self.index,
            offset,
            headers: input.headers.clone(),
        };

        log.next_offset += 1;
        log.last_timestamp = timestamp;
        log.total_bytes += payload.len();
        log.messages.push_back(StoredMessage {
            offset,
            metadata: metadata.clone(),
            payload,
            timestamp,
        });

        Ok(metadata)
    }

    /// Messages with offset >= `from_offset` in ascending order, at most
    /// `max_messages` of them.
    pub fn read(&self, from_offset: u64, max_messages: usize) -> Vec<StoredMessage> {
        if max_messages == 0 {
            return Vec::new();
        }
        let log = self.log.read();
        let Some(first) = log.messages.front().map(|m| m.offset) else {
            return Vec::new();
        };
        let skip = usize::try_from(from_offset.saturating_sub(first)).unwrap_or(usize::MAX);
        log.messages
            .iter()
            .skip(skip)
            .take(max_messages)
            .cloned()
            .collect()
    }

    /// Drop messages older than the retention period. Returns the number
    /// removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_before(Utc::now().timestamp_millis().saturating_sub(self.retention_ms))
    }

    /// Drop the leading run of messages with a timestamp before `cutoff`.
    pub(crate) fn cleanup_before(&self, cutoff: i64) -> usize {
        let mut log = self.log.write();
        let mut removed = 0;
        while log.messages.front().is_some_and(|m| m.timestamp < cutoff) {
            log.pop_front();
            removed += 1;
        }
        removed
    }

    /// Drop every message with offset below `min_committed_offset`. Returns
    /// the number removed.
    pub fn remove_consumed_messages(&self, min_committed_offset: u64) -> usize {
        let mut log = self.log.write();
        let mut removed = 0;
        while log
            .messages
            .front()
            .is_some_and(|m| m.offset < min_committed_offset)
        {
            log.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn message_count(&self) -> usize {
        self.log.read().messages.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.log.read().total_bytes
    }

    /// The offset the next successful append will receive.
    pub fn next_offset(&self) -> u64 {
        self.log.read().next_offset
    }

    /// Offset of the oldest retained message, if any.
    pub fn first_offset(&self) -> Option<u64> {
        self.log.read().messages.front().map(|m| m.offset)
    }

    fn capacity_error(&self, reason: String) -> BrokerError {
        BrokerError::CapacityExceeded {
            category: self.category.clone(),
            queue: self.index,
            reason,
        }
    }
}
