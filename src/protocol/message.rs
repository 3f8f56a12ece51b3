//! Wire message definitions
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! magic u16 (0x4E51) | version u8 | command u8 | flags u32 | message id 16B | timestamp i64 (ms)
//! topic   : u16 length + UTF-8 (<= 255 bytes)
//! key     : u16 length + UTF-8 (0 = no key)
//! headers : u16 count, then per header u16 length + name, u16 length + value
//! payload : u32 length + raw bytes (<= 10 MiB)
//! ```

use std::fmt;
use std::ops::BitOr;

use bytes::Bytes;

use crate::broker::message::{Headers, MessageId, MessageInput, StoredMessage};
use crate::utils::error::ProtocolError;

pub const MAGIC: u16 = 0x4E51;
pub const VERSION_1: u8 = 1;
pub const CURRENT_VERSION: u8 = VERSION_1;

/// Bytes before the first variable-length section.
pub const FIXED_HEADER_LEN: usize = 2 + 1 + 1 + 4 + 16 + 8;

pub const MAX_TOPIC_LEN: usize = 255;
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;
pub const MAX_HEADERS: usize = u16::MAX as usize;
pub const MAX_PAYLOAD_LEN: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Publish = 0x01,
    Subscribe = 0x02,
    Unsubscribe = 0x03,
    Ack = 0x04,
    Nack = 0x05,
    Fetch = 0x06,
    CommitOffset = 0x07,
    Heartbeat = 0x08,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Command::Publish,
            0x02 => Command::Subscribe,
            0x03 => Command::Unsubscribe,
            0x04 => Command::Ack,
            0x05 => Command::Nack,
            0x06 => Command::Fetch,
            0x07 => Command::CommitOffset,
            0x08 => Command::Heartbeat,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        command as u8
    }
}

/// Frame flag bitmask. Unknown bits are carried through untouched.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const COMPRESSED: Flags = Flags(0x01);
    pub const PERSISTENT: Flags = Flags(0x02);
    pub const PRIORITY_HIGH: Flags = Flags(0x04);
    pub const REQUIRES_ACK: Flags = Flags(0x08);

    pub const fn from_bits(bits: u32) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 4] = [
            (Flags::COMPRESSED, "COMPRESSED"),
            (Flags::PERSISTENT, "PERSISTENT"),
            (Flags::PRIORITY_HIGH, "PRIORITY_HIGH"),
            (Flags::REQUIRES_ACK, "REQUIRES_ACK"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Flags({:#x}: {})", self.0, set.join(" | "))
    }
}

/// One message as it travels on the wire.
///
/// An empty key is the same as no key: both encode as length 0 and decode
/// as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub version: u8,
    pub command: Command,
    pub flags: Flags,
    pub message_id: MessageId,
    pub timestamp: i64,
    pub topic: String,
    pub key: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
}

impl WireMessage {
    pub fn new(command: Command, topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            version: CURRENT_VERSION,
            command,
            flags: Flags::NONE,
            message_id: MessageId::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            topic: topic.into(),
            key: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Frame a stored message, keeping its id, timestamp, routing key and
    /// headers. `persistent` sets the `PERSISTENT` flag.
    pub fn from_stored(stored: &StoredMessage, command: Command, persistent: bool) -> Self {
        let mut flags = Flags::NONE;
        if persistent {
            flags.insert(Flags::PERSISTENT);
        }
        Self {
            version: CURRENT_VERSION,
            command,
            flags,
            message_id: stored.metadata.id,
            timestamp: stored.timestamp,
            topic: stored.metadata.category.clone(),
            key: stored.metadata.key.clone().filter(|k| !k.is_empty()),
            headers: stored.metadata.headers.clone(),
            payload: stored.payload.clone(),
        }
    }

    /// The producer-side input this frame describes.
    pub fn to_input(&self) -> MessageInput {
        MessageInput {
            category: self.topic.clone(),
            key: self.key.clone(),
            headers: self.headers.clone(),
        }
    }
}
