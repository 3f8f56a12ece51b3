//! Payload codecs
//!
//! Producers and consumers are handed their codec explicitly at
//! construction. `BytesCodec` passes raw bytes through untouched and is the
//! default; `StringCodec` and `JsonCodec` cover the common typed cases.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::utils::error::{BrokerError, Result};

pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Bytes>;
}

pub trait Deserializer<T>: Send + Sync {
    fn deserialize(&self, payload: &Bytes) -> Result<T>;
}

/// Raw bytes, no transformation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Serializer<Bytes> for BytesCodec {
    fn serialize(&self, value: &Bytes) -> Result<Bytes> {
        Ok(value.clone())
    }
}

impl Deserializer<Bytes> for BytesCodec {
    fn deserialize(&self, payload: &Bytes) -> Result<Bytes> {
        Ok(payload.clone())
    }
}

impl Serializer<Vec<u8>> for BytesCodec {
    fn serialize(&self, value: &Vec<u8>) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(value))
    }
}

impl Deserializer<Vec<u8>> for BytesCodec {
    fn deserialize(&self, payload: &Bytes) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }
}

/// UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Serializer<String> for StringCodec {
    fn serialize(&self, value: &String) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl Deserializer<String> for StringCodec {
    fn deserialize(&self, payload: &Bytes) -> Result<String> {
        String::from_utf8(payload.to_vec())
            .map_err(|e| BrokerError::Serialization(format!("payload is not UTF-8: {e}")))
    }
}

/// JSON via `serde_json`.
#[derive(Debug)]
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize> Serializer<T> for JsonCodec<T> {
    fn serialize(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| BrokerError::Serialization(e.to_string()))
    }
}

impl<T: DeserializeOwned> Deserializer<T> for JsonCodec<T> {
    fn deserialize(&self, payload: &Bytes) -> Result<T> {
        serde_json::from_slice(payload).map_err(|e| BrokerError::Serialization(e.to_string()))
    }
}
