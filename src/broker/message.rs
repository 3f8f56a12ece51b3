//! Message definitions for the broker
//!
//! - `MessageInput`: what a producer supplies before a write (category, key,
//!   headers). It never carries a queue or offset.
//! - `MessageMetadata`: built by `Queue::append` once the queue and offset are
//!   known. Immutable afterwards.
//! - `StoredMessage`: the unit a queue holds: metadata plus the raw payload.
//! - `AppendResult` / `PublishResult`: what a successful write reports back.
//!
//! Timestamps are milliseconds since the UNIX epoch.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message headers. Ordered so encodings are deterministic.
pub type Headers = BTreeMap<String, String>;

/// Opaque 128-bit message identifier generated at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInput {
    pub category: String,
    pub key: Option<String>,
    pub headers: Headers,
}

impl MessageInput {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            key: None,
            headers: Headers::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The routing key, treating an empty key as absent.
    pub fn routing_key(&self) -> Option<&str> {
        self.key.as_deref().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub id: MessageId,
    pub category: String,
    pub key: Option<String>,
    pub timestamp: i64,
    pub queue: usize,
    pub offset: u64,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub offset: u64,
    pub metadata: MessageMetadata,
    pub payload: Bytes,
    pub timestamp: i64,
}

impl StoredMessage {
    /// Bytes this message counts against its queue's size ceiling.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendResult {
    pub id: MessageId,
    pub queue: usize,
    pub offset: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishResult {
    pub message_id: MessageId,
    pub category: String,
    pub queue: usize,
    pub offset: u64,
    pub timestamp: i64,
}
