//! Binary encoding and decoding of [`WireMessage`] frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::broker::message::{Headers, MessageId};
use crate::protocol::message::{
    Command, FIXED_HEADER_LEN, Flags, MAGIC, MAX_FIELD_LEN, MAX_HEADERS, MAX_PAYLOAD_LEN,
    MAX_TOPIC_LEN, VERSION_1, WireMessage,
};
use crate::utils::error::ProtocolError;

type Result<T> = std::result::Result<T, ProtocolError>;

impl WireMessage {
    /// Exact length of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| 2 + k.len() + 2 + v.len())
            .sum();
        FIXED_HEADER_LEN
            + 2
            + self.topic.len()
            + 2
            + self.key.as_ref().map_or(0, String::len)
            + 2
            + headers
            + 4
            + self.payload.len()
    }

    /// Encode into a fresh buffer. Fails without writing anything if a field
    /// does not fit its length prefix.
    pub fn encode(&self) -> Result<Bytes> {
        self.validate()?;
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        buf.put_u16(MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.command.into());
        buf.put_u32(self.flags.bits());
        buf.put_u128(self.message_id.as_u128());
        buf.put_i64(self.timestamp);

        put_str16(&mut buf, &self.topic);
        put_str16(&mut buf, self.key.as_deref().unwrap_or(""));

        buf.put_u16(self.headers.len() as u16);
        for (name, value) in &self.headers {
            put_str16(&mut buf, name);
            put_str16(&mut buf, value);
        }

        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    fn validate(&self) -> Result<()> {
        if self.version != VERSION_1 {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }
        check_len("topic", self.topic.len(), MAX_TOPIC_LEN)?;
        if let Some(key) = &self.key {
            check_len("key", key.len(), MAX_FIELD_LEN)?;
        }
        if self.headers.len() > MAX_HEADERS {
            return Err(ProtocolError::TooManyHeaders(self.headers.len()));
        }
        for (name, value) in &self.headers {
            check_len("header name", name.len(), MAX_FIELD_LEN)?;
            check_len("header value", value.len(), MAX_FIELD_LEN)?;
        }
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(())
    }

    /// Decode a frame in the current format.
    ///
    /// The magic number is checked before the version, so foreign data is
    /// reported as `InvalidMagic` rather than a version mismatch.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Self::decode_v1(buf)
    }

    /// Decode a frame of any supported version, choosing the decoder from
    /// the version byte.
    pub fn decode_versioned(buf: &[u8]) -> Result<Self> {
        if buf.len() < 3 {
            return Err(ProtocolError::Truncated {
                needed: 3,
                remaining: buf.len(),
            });
        }
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }
        match buf[2] {
            VERSION_1 => Self::decode_v1(buf),
            other => Err(ProtocolError::UnsupportedVersion(other)),
        }
    }

    fn decode_v1(buf: &[u8]) -> Result<Self> {
        let mut r = Reader { buf };

        let magic = r.u16()?;
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }
        let version = r.u8()?;
        if version != VERSION_1 {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let command = Command::try_from(r.u8()?)?;
        let flags = Flags::from_bits(r.u32()?);
        let message_id = MessageId::from_u128(r.u128()?);
        let timestamp = r.i64()?;

        let topic_len = r.u16()? as usize;
        check_len("topic", topic_len, MAX_TOPIC_LEN)?;
        let topic = r.string(topic_len, "topic")?;

        let key_len = r.u16()? as usize;
        let key = match key_len {
            0 => None,
            len => Some(r.string(len, "key")?),
        };

        let header_count = r.u16()? as usize;
        let mut headers = Headers::new();
        for _ in 0..header_count {
            let name_len = r.u16()? as usize;
            let name = r.string(name_len, "header name")?;
            let value_len = r.u16()? as usize;
            let value = r.string(value_len, "header value")?;
            headers.insert(name, value);
        }

        let payload_len = r.u32()? as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        let payload = Bytes::copy_from_slice(r.take(payload_len)?);

        Ok(WireMessage {
            version,
            command,
            flags,
            message_id,
            timestamp,
            topic,
            key,
            headers,
            payload,
        })
    }
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(ProtocolError::FieldTooLong { field, len, max });
    }
    Ok(())
}

// Caller has validated the length.
fn put_str16(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Bounds-checked cursor; `Buf` getters panic on short input.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn need(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u128(&mut self) -> Result<u128> {
        self.need(16)?;
        Ok(self.buf.get_u128())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self, len: usize, field: &'static str) -> Result<String> {
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
    }
}
