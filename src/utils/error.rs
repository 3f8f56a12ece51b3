//! The `error` module defines the error types used within `nqueue`.
//!
//! `BrokerError` is returned by every fallible broker, category, queue and
//! client operation. `ProtocolError` is returned by the wire codec and can be
//! lifted into a `BrokerError` with `?`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("queue {queue} of category '{category}' is full: {reason}")]
    CapacityExceeded {
        category: String,
        queue: usize,
        reason: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("message for category '{actual}' was routed to category '{expected}'")]
    CategoryMismatch { expected: String, actual: String },

    #[error("category not found: {0}")]
    CategoryNotFound(String),

    #[error("queue {queue} does not exist in category '{category}'")]
    QueueNotFound { category: String, queue: usize },

    #[error("consumer group '{group}' does not exist for category '{category}'")]
    GroupNotFound { category: String, group: String },

    #[error("consumer '{consumer}' is not a member of group '{group}'")]
    UnknownConsumer { group: String, consumer: String },

    #[error("producer '{0}' is closed")]
    ProducerClosed(String),

    #[error("consumer '{0}' is closed")]
    ConsumerClosed(String),

    #[error("broker is shut down")]
    ShutDown,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl BrokerError {
    /// Whether retrying the same write later could succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BrokerError::CapacityExceeded { .. })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid magic number 0x{0:04X}")]
    InvalidMagic(u16),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown command 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("buffer truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("{field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{0} headers exceed the limit of 65535")]
    TooManyHeaders(usize),

    #[error("payload is {len} bytes, limit is {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
