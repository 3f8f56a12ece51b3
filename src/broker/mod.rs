//! The broker: in-memory, partitioned, append-only logs.
//!
//! - `message`: identifiers, metadata and the stored record.
//! - `queue`: one ordered log (partition) with capacity ceilings.
//! - `category`: a named stream of queues and its write routing.
//! - `consumer_group`: membership, queue assignment and committed offsets.
//! - `engine`: the `Broker` registry tying them together.

pub mod category;
pub mod consumer_group;
pub mod engine;
pub mod message;
pub mod queue;

pub use category::{Category, CategoryConfig, CategoryStats};
pub use consumer_group::{ConsumerGroup, MemberInfo};
pub use engine::{Broker, BrokerConfig, BrokerStats, QueueLag};
pub use message::{
    AppendResult, Headers, MessageId, MessageInput, MessageMetadata, PublishResult, StoredMessage,
};
pub use queue::{Queue, QueueCapacityConfig};
