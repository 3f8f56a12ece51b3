//! The `client` module is the application-facing side of the broker.
//!
//! - `producer`: serializes values and publishes them.
//! - `consumer`: joins consumer groups and drives handlers from a poll loop.
//! - `serializer`: the payload codecs both sides are constructed with.

pub mod consumer;
pub mod producer;
pub mod serializer;

pub use consumer::{Consumer, ConsumerConfig, HandlerError, Message};
pub use producer::{Producer, ProducerConfig};
pub use serializer::{BytesCodec, Deserializer, JsonCodec, Serializer, StringCodec};
