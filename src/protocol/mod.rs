//! Binary wire protocol
//!
//! A fixed 32-byte header followed by length-prefixed topic, key, headers and
//! payload. Frames carry a version byte so older decoders can refuse newer
//! frames instead of misreading them. See [`message`] for the exact layout.

pub mod codec;
pub mod message;

pub use message::{Command, Flags, WireMessage};

#[cfg(test)]
mod tests;
