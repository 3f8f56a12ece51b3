//! # nqueue
//!
//! `nqueue` is an embedded, in-memory message broker. Messages are written to
//! named categories, each split into a fixed number of ordered queues, and
//! read back by consumer groups that divide the queues among their members
//! and remember how far they got.
//!
//! ## Core Modules
//!
//! - `broker`: categories, queues, consumer groups and the `Broker` registry.
//! - `client`: typed producers and consumers plus their payload codecs.
//! - `config`: layered settings from `config/default.toml` and `NQ__*`
//!   environment variables.
//! - `protocol`: the versioned binary wire format for messages.
//! - `utils`: error types, logging setup and background task helpers.
//!
//! ```no_run
//! use bytes::Bytes;
//! use nqueue::broker::{Broker, BrokerConfig, MessageInput};
//!
//! # fn main() -> nqueue::utils::error::Result<()> {
//! let broker = Broker::new(BrokerConfig::default());
//! let result = broker.publish(Bytes::from_static(b"hello"), MessageInput::new("greetings"))?;
//! assert_eq!(result.offset, 0);
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod protocol;
pub mod utils;

pub use broker::{Broker, BrokerConfig};
pub use client::{Consumer, ConsumerConfig, Producer, ProducerConfig};
pub use utils::error::{BrokerError, Result};

#[cfg(test)]
mod tests;
