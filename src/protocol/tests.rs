use bytes::{BufMut, Bytes, BytesMut};

use super::message::{
    Command, FIXED_HEADER_LEN, Flags, MAGIC, MAX_PAYLOAD_LEN, MAX_TOPIC_LEN, WireMessage,
};
use crate::broker::message::{MessageId, MessageInput};
use crate::broker::queue::{Queue, QueueCapacityConfig};
use crate::utils::error::ProtocolError;

fn sample() -> WireMessage {
    WireMessage::new(Command::Publish, "orders", Bytes::from_static(b"{\"id\":7}"))
        .with_key("customer-42")
        .with_header("content-type", "application/json")
        .with_header("trace", "abc")
        .with_flags(Flags::PERSISTENT | Flags::REQUIRES_ACK)
}

#[test]
fn encode_decode_preserves_every_field() {
    let msg = sample();
    let frame = msg.encode().unwrap();
    assert_eq!(frame.len(), msg.encoded_len());

    let decoded = WireMessage::decode(&frame).unwrap();
    assert_eq!(decoded, msg);
    assert_eq!(WireMessage::decode_versioned(&frame).unwrap(), msg);
}

#[test]
fn header_is_big_endian() {
    let mut msg = sample();
    msg.message_id = MessageId::from_u128(1);
    msg.timestamp = 0x0102;
    let frame = msg.encode().unwrap();

    assert_eq!(&frame[0..2], &[0x4E, 0x51]);
    assert_eq!(frame[2], 1);
    assert_eq!(frame[3], 0x01);
    assert_eq!(&frame[4..8], &[0, 0, 0, 0x0A]);
    assert_eq!(frame[23], 1);
    assert_eq!(&frame[24..32], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
    // topic length prefix follows the fixed header
    assert_eq!(&frame[FIXED_HEADER_LEN..FIXED_HEADER_LEN + 2], &[0, 6]);
}

#[test]
fn message_without_key_or_headers_decodes_to_none() {
    let msg = WireMessage::new(Command::Heartbeat, "t", Bytes::new());
    let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
    assert_eq!(decoded.key, None);
    assert!(decoded.headers.is_empty());
    assert!(decoded.payload.is_empty());

    let empty_key = WireMessage::new(Command::Publish, "t", Bytes::from_static(b"x")).with_key("");
    assert_eq!(empty_key.key, None);
}

#[test]
fn wrong_magic_is_rejected_before_version() {
    let mut frame = BytesMut::from(&sample().encode().unwrap()[..]);
    frame[0] = 0xFF;
    frame[2] = 9;
    let expected = ProtocolError::InvalidMagic(u16::from_be_bytes([0xFF, 0x51]));
    assert_eq!(WireMessage::decode(&frame).unwrap_err(), expected);
    assert_eq!(WireMessage::decode_versioned(&frame).unwrap_err(), expected);
}

#[test]
fn unsupported_version_is_rejected() {
    let mut frame = BytesMut::from(&sample().encode().unwrap()[..]);
    frame[2] = 2;
    assert_eq!(
        WireMessage::decode(&frame).unwrap_err(),
        ProtocolError::UnsupportedVersion(2)
    );
    assert_eq!(
        WireMessage::decode_versioned(&frame).unwrap_err(),
        ProtocolError::UnsupportedVersion(2)
    );
}

#[test]
fn unsupported_version_fails_to_encode() {
    let mut msg = sample();
    msg.version = 9;
    assert_eq!(msg.encode().unwrap_err(), ProtocolError::UnsupportedVersion(9));
}

#[test]
fn unknown_command_is_rejected() {
    let mut frame = BytesMut::from(&sample().encode().unwrap()[..]);
    frame[3] = 0x42;
    assert_eq!(
        WireMessage::decode(&frame).unwrap_err(),
        ProtocolError::UnknownCommand(0x42)
    );
}

#[test]
fn every_truncation_is_reported() {
    let frame = sample().encode().unwrap();
    for len in 0..frame.len() {
        let err = WireMessage::decode(&frame[..len]).unwrap_err();
        assert!(
            matches!(err, ProtocolError::Truncated { .. }),
            "length {len} gave {err:?}"
        );
    }
}

#[test]
fn short_buffer_for_versioned_decode() {
    assert_eq!(
        WireMessage::decode_versioned(&[0x4E]).unwrap_err(),
        ProtocolError::Truncated {
            needed: 3,
            remaining: 1
        }
    );
}

#[test]
fn oversize_fields_fail_to_encode() {
    let topic = "t".repeat(MAX_TOPIC_LEN + 1);
    let err = WireMessage::new(Command::Publish, topic, Bytes::from_static(b"x"))
        .encode()
        .unwrap_err();
    assert!(matches!(err, ProtocolError::FieldTooLong { field: "topic", .. }));

    let key = "k".repeat(u16::MAX as usize + 1);
    let err = WireMessage::new(Command::Publish, "t", Bytes::from_static(b"x"))
        .with_key(key)
        .encode()
        .unwrap_err();
    assert!(matches!(err, ProtocolError::FieldTooLong { field: "key", .. }));

    let payload = Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]);
    let err = WireMessage::new(Command::Publish, "t", payload)
        .encode()
        .unwrap_err();
    assert_eq!(
        err,
        ProtocolError::PayloadTooLarge {
            len: MAX_PAYLOAD_LEN + 1,
            max: MAX_PAYLOAD_LEN
        }
    );
}

#[test]
fn oversize_lengths_fail_to_decode() {
    // hand-built frame claiming a 300 byte topic
    let mut buf = BytesMut::new();
    buf.put_u16(MAGIC);
    buf.put_u8(1);
    buf.put_u8(Command::Publish.into());
    buf.put_u32(0);
    buf.put_u128(0);
    buf.put_i64(0);
    buf.put_u16(300);
    buf.put_slice(&[b'a'; 300]);
    assert!(matches!(
        WireMessage::decode(&buf).unwrap_err(),
        ProtocolError::FieldTooLong { field: "topic", len: 300, .. }
    ));

    let mut buf = BytesMut::new();
    buf.put_u16(MAGIC);
    buf.put_u8(1);
    buf.put_u8(Command::Publish.into());
    buf.put_u32(0);
    buf.put_u128(0);
    buf.put_i64(0);
    buf.put_u16(1);
    buf.put_u8(b't');
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u32((MAX_PAYLOAD_LEN + 1) as u32);
    assert!(matches!(
        WireMessage::decode(&buf).unwrap_err(),
        ProtocolError::PayloadTooLarge { .. }
    ));
}

#[test]
fn invalid_utf8_topic_is_rejected() {
    let mut frame = BytesMut::from(&sample().encode().unwrap()[..]);
    frame[FIXED_HEADER_LEN + 2] = 0xFF;
    assert_eq!(
        WireMessage::decode(&frame).unwrap_err(),
        ProtocolError::InvalidUtf8("topic")
    );
}

#[test]
fn command_codes_round_trip() {
    for code in 0x01..=0x08u8 {
        let command = Command::try_from(code).unwrap();
        assert_eq!(u8::from(command), code);
    }
    assert_eq!(Command::try_from(0), Err(ProtocolError::UnknownCommand(0)));
    assert_eq!(Command::try_from(0x09), Err(ProtocolError::UnknownCommand(0x09)));
}

#[test]
fn flags_bit_operations() {
    let mut flags = Flags::COMPRESSED;
    assert!(flags.contains(Flags::COMPRESSED));
    assert!(!flags.contains(Flags::PERSISTENT));

    flags.insert(Flags::PRIORITY_HIGH);
    assert_eq!(flags.bits(), 0x05);
    flags.remove(Flags::COMPRESSED);
    assert_eq!(flags, Flags::PRIORITY_HIGH);

    // unknown bits survive a round trip
    let msg = WireMessage::new(Command::Ack, "t", Bytes::new()).with_flags(Flags::from_bits(0x80));
    let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
    assert_eq!(decoded.flags.bits(), 0x80);
}

#[test]
fn from_stored_carries_message_identity() {
    let queue = Queue::new("orders", 2, i64::MAX, QueueCapacityConfig::unbounded());
    let input = MessageInput::new("orders")
        .with_key("k1")
        .with_header("h", "v");
    let meta = queue.append(Bytes::from_static(b"payload"), &input).unwrap();
    let stored = queue.read(0, 1).remove(0);

    let wire = WireMessage::from_stored(&stored, Command::Fetch, true);
    assert_eq!(wire.command, Command::Fetch);
    assert_eq!(wire.message_id, meta.id);
    assert_eq!(wire.timestamp, meta.timestamp);
    assert_eq!(wire.topic, "orders");
    assert_eq!(wire.key.as_deref(), Some("k1"));
    assert_eq!(wire.payload, Bytes::from_static(b"payload"));
    assert!(wire.flags.contains(Flags::PERSISTENT));

    assert_eq!(wire.to_input(), input);

    let plain = WireMessage::from_stored(&stored, Command::Fetch, false);
    assert!(!plain.flags.contains(Flags::PERSISTENT));
}
