//! Wire codec for SDS messages.
//!
//! A hand-rolled, deterministic, length-prefixed tag-ordered scheme in the
//! protobuf varint style. Fields are written in ascending tag order, absent
//! optionals are omitted rather than zero-filled, and decoders skip unknown
//! fields so the format can grow.
//!
//! There is no explicit variant discriminator byte; the kind is recovered
//! from structural cues, matching deployed frames of the same shape:
//!
//! - no lamport stamp and a payload: ephemeral
//! - lamport stamp with an empty or absent payload: sync
//! - lamport stamp with a payload: content
//!
//! A frame with neither a lamport stamp nor a payload matches no kind and is
//! rejected.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::message::{ContentMessage, EphemeralMessage, HistoryEntry, SdsMessage, SyncMessage};
use crate::types::{ChannelId, MessageId, SenderId};

/// Field numbers on the message frame.
mod field {
    pub const MESSAGE_ID: u32 = 2;
    pub const CHANNEL_ID: u32 = 3;
    pub const SENDER_ID: u32 = 4;
    pub const LAMPORT: u32 = 10;
    pub const CAUSAL_HISTORY: u32 = 11;
    pub const BLOOM_FILTER: u32 = 12;
    pub const CONTENT: u32 = 20;
    pub const RETRIEVAL_HINT: u32 = 21;

    // Nested history entry.
    pub const ENTRY_MESSAGE_ID: u32 = 1;
    pub const ENTRY_RETRIEVAL_HINT: u32 = 2;
}

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Encode a message to its wire form.
pub fn encode(message: &SdsMessage) -> Bytes {
    let mut buf = BytesMut::new();
    match message {
        SdsMessage::Content(m) => {
            put_str(&mut buf, field::MESSAGE_ID, m.message_id.as_str());
            put_str(&mut buf, field::CHANNEL_ID, m.channel_id.as_str());
            put_str(&mut buf, field::SENDER_ID, m.sender_id.as_str());
            put_varint_field(&mut buf, field::LAMPORT, m.lamport_timestamp as u64);
            for entry in &m.causal_history {
                put_bytes(&mut buf, field::CAUSAL_HISTORY, &encode_entry(entry));
            }
            if let Some(bloom) = &m.bloom_filter {
                put_bytes(&mut buf, field::BLOOM_FILTER, bloom);
            }
            put_bytes(&mut buf, field::CONTENT, &m.payload);
            if let Some(hint) = &m.retrieval_hint {
                put_bytes(&mut buf, field::RETRIEVAL_HINT, hint);
            }
        }
        SdsMessage::Sync(m) => {
            put_str(&mut buf, field::MESSAGE_ID, m.message_id.as_str());
            put_str(&mut buf, field::CHANNEL_ID, m.channel_id.as_str());
            put_str(&mut buf, field::SENDER_ID, m.sender_id.as_str());
            put_varint_field(&mut buf, field::LAMPORT, m.lamport_timestamp as u64);
            for entry in &m.causal_history {
                put_bytes(&mut buf, field::CAUSAL_HISTORY, &encode_entry(entry));
            }
            if let Some(bloom) = &m.bloom_filter {
                put_bytes(&mut buf, field::BLOOM_FILTER, bloom);
            }
        }
        SdsMessage::Ephemeral(m) => {
            put_str(&mut buf, field::MESSAGE_ID, m.message_id.as_str());
            put_str(&mut buf, field::CHANNEL_ID, m.channel_id.as_str());
            put_bytes(&mut buf, field::CONTENT, &m.payload);
        }
    }
    buf.freeze()
}

/// Decode a wire frame into a message.
pub fn decode(bytes: &[u8]) -> Result<SdsMessage, WireError> {
    let mut buf = bytes;

    let mut message_id: Option<String> = None;
    let mut channel_id: Option<String> = None;
    let mut sender_id: Option<String> = None;
    let mut lamport: Option<i64> = None;
    let mut causal_history: Vec<HistoryEntry> = Vec::new();
    let mut bloom_filter: Option<Bytes> = None;
    let mut content: Option<Bytes> = None;
    let mut retrieval_hint: Option<Bytes> = None;

    while buf.has_remaining() {
        let tag = read_varint(&mut buf)?;
        let field_num = (tag >> 3) as u32;
        let wire_type = (tag & 0x7) as u8;

        match field_num {
            field::MESSAGE_ID => {
                message_id = Some(read_string(&mut buf, wire_type, field_num, "message_id")?)
            }
            field::CHANNEL_ID => {
                channel_id = Some(read_string(&mut buf, wire_type, field_num, "channel_id")?)
            }
            field::SENDER_ID => {
                sender_id = Some(read_string(&mut buf, wire_type, field_num, "sender_id")?)
            }
            field::LAMPORT => {
                expect_wire_type(field_num, wire_type, WIRE_VARINT)?;
                lamport = Some(read_varint(&mut buf)? as i64);
            }
            field::CAUSAL_HISTORY => {
                let nested = read_len_delimited(&mut buf, wire_type, field_num)?;
                causal_history.push(decode_entry(&nested)?);
            }
            field::BLOOM_FILTER => {
                bloom_filter = Some(read_len_delimited(&mut buf, wire_type, field_num)?);
            }
            field::CONTENT => {
                content = Some(read_len_delimited(&mut buf, wire_type, field_num)?);
            }
            field::RETRIEVAL_HINT => {
                retrieval_hint = Some(read_len_delimited(&mut buf, wire_type, field_num)?);
            }
            _ => skip_field(&mut buf, field_num, wire_type)?,
        }
    }

    let message_id = MessageId::new(message_id.ok_or(WireError::MissingField("message_id"))?);
    let channel_id = ChannelId::new(channel_id.ok_or(WireError::MissingField("channel_id"))?);
    let sender_id = SenderId::new(sender_id.unwrap_or_default());

    match lamport {
        None => {
            let payload = content.ok_or(WireError::AmbiguousVariant(
                "frame carries neither lamport stamp nor payload",
            ))?;
            Ok(SdsMessage::Ephemeral(EphemeralMessage {
                message_id,
                channel_id,
                payload,
            }))
        }
        Some(lamport_timestamp) => match content {
            Some(payload) if !payload.is_empty() => Ok(SdsMessage::Content(ContentMessage {
                message_id,
                channel_id,
                sender_id,
                lamport_timestamp,
                causal_history,
                bloom_filter,
                payload,
                retrieval_hint,
            })),
            _ => Ok(SdsMessage::Sync(SyncMessage {
                message_id,
                channel_id,
                sender_id,
                lamport_timestamp,
                causal_history,
                bloom_filter,
            })),
        },
    }
}

fn encode_entry(entry: &HistoryEntry) -> Bytes {
    let mut buf = BytesMut::new();
    put_str(&mut buf, field::ENTRY_MESSAGE_ID, entry.message_id.as_str());
    if let Some(hint) = &entry.retrieval_hint {
        put_bytes(&mut buf, field::ENTRY_RETRIEVAL_HINT, hint);
    }
    buf.freeze()
}

fn decode_entry(bytes: &[u8]) -> Result<HistoryEntry, WireError> {
    let mut buf = bytes;
    let mut message_id: Option<String> = None;
    let mut retrieval_hint: Option<Bytes> = None;

    while buf.has_remaining() {
        let tag = read_varint(&mut buf)?;
        let field_num = (tag >> 3) as u32;
        let wire_type = (tag & 0x7) as u8;

        match field_num {
            field::ENTRY_MESSAGE_ID => {
                message_id = Some(read_string(&mut buf, wire_type, field_num, "history message_id")?)
            }
            field::ENTRY_RETRIEVAL_HINT => {
                retrieval_hint = Some(read_len_delimited(&mut buf, wire_type, field_num)?)
            }
            _ => skip_field(&mut buf, field_num, wire_type)?,
        }
    }

    Ok(HistoryEntry {
        message_id: MessageId::new(message_id.ok_or(WireError::MissingField("history message_id"))?),
        retrieval_hint,
    })
}

// ── Low-level varint plumbing ──────────────────────────────────────────

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn put_tag(buf: &mut BytesMut, field: u32, wire_type: u8) {
    put_varint(buf, (u64::from(field) << 3) | u64::from(wire_type));
}

fn put_varint_field(buf: &mut BytesMut, field: u32, value: u64) {
    put_tag(buf, field, WIRE_VARINT);
    put_varint(buf, value);
}

fn put_bytes(buf: &mut BytesMut, field: u32, value: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, value.len() as u64);
    buf.put_slice(value);
}

fn put_str(buf: &mut BytesMut, field: u32, value: &str) {
    put_bytes(buf, field, value.as_bytes());
}

fn read_varint(buf: &mut &[u8]) -> Result<u64, WireError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(WireError::Truncated { needed: 1 });
        }
        if shift >= 64 {
            return Err(WireError::VarintOverflow);
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn expect_wire_type(field: u32, got: u8, want: u8) -> Result<(), WireError> {
    if got != want {
        return Err(WireError::InvalidWireType {
            field,
            wire_type: got,
        });
    }
    Ok(())
}

fn read_len_delimited(buf: &mut &[u8], wire_type: u8, field: u32) -> Result<Bytes, WireError> {
    expect_wire_type(field, wire_type, WIRE_LEN)?;
    let len = read_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    let out = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(out)
}

fn read_string(
    buf: &mut &[u8],
    wire_type: u8,
    field: u32,
    name: &'static str,
) -> Result<String, WireError> {
    let bytes = read_len_delimited(buf, wire_type, field)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8(name))
}

fn skip_field(buf: &mut &[u8], field: u32, wire_type: u8) -> Result<(), WireError> {
    match wire_type {
        WIRE_VARINT => {
            read_varint(buf)?;
        }
        WIRE_LEN => {
            read_len_delimited(buf, wire_type, field)?;
        }
        WIRE_FIXED64 => {
            if buf.remaining() < 8 {
                return Err(WireError::Truncated {
                    needed: 8 - buf.remaining(),
                });
            }
            buf.advance(8);
        }
        WIRE_FIXED32 => {
            if buf.remaining() < 4 {
                return Err(WireError::Truncated {
                    needed: 4 - buf.remaining(),
                });
            }
            buf.advance(4);
        }
        other => {
            return Err(WireError::InvalidWireType {
                field,
                wire_type: other,
            })
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn content_message() -> ContentMessage {
        ContentMessage {
            message_id: MessageId::derive(b"hello"),
            channel_id: ChannelId::new("room"),
            sender_id: SenderId::new("alice"),
            lamport_timestamp: 42,
            causal_history: vec![
                HistoryEntry::new(MessageId::new("dep-1")),
                HistoryEntry::with_hint(MessageId::new("dep-2"), Bytes::from_static(b"hint")),
            ],
            bloom_filter: Some(Bytes::from_static(b"\x00\x01\x02")),
            payload: Bytes::from_static(b"hello"),
            retrieval_hint: Some(Bytes::from_static(b"ptr")),
        }
    }

    #[test]
    fn test_content_roundtrip() {
        let msg = SdsMessage::Content(content_message());
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_sync_roundtrip() {
        let msg = SdsMessage::Sync(SyncMessage {
            message_id: MessageId::new("sync-1"),
            channel_id: ChannelId::new("room"),
            sender_id: SenderId::new("bob"),
            lamport_timestamp: 7,
            causal_history: vec![HistoryEntry::new(MessageId::new("dep"))],
            bloom_filter: Some(Bytes::from_static(b"filter")),
        });
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ephemeral_roundtrip() {
        let msg = SdsMessage::Ephemeral(EphemeralMessage {
            message_id: MessageId::new("eph"),
            channel_id: ChannelId::new("room"),
            payload: Bytes::from_static(b"fire and forget"),
        });
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_absent_optionals_are_omitted() {
        let mut msg = content_message();
        msg.bloom_filter = None;
        msg.retrieval_hint = None;
        msg.causal_history.clear();
        let with = encode(&SdsMessage::Content(content_message()));
        let without = encode(&SdsMessage::Content(msg.clone()));
        assert!(without.len() < with.len());
        assert_eq!(decode(&without).unwrap(), SdsMessage::Content(msg));
    }

    #[test]
    fn test_missing_required_field() {
        // A frame with only a channel id has no message id.
        let mut buf = BytesMut::new();
        put_str(&mut buf, field::CHANNEL_ID, "room");
        assert!(matches!(
            decode(&buf.freeze()),
            Err(WireError::MissingField("message_id"))
        ));
    }

    #[test]
    fn test_no_lamport_no_payload_is_rejected() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, field::MESSAGE_ID, "m");
        put_str(&mut buf, field::CHANNEL_ID, "room");
        assert!(matches!(
            decode(&buf.freeze()),
            Err(WireError::AmbiguousVariant(_))
        ));
    }

    #[test]
    fn test_empty_payload_with_lamport_is_sync() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, field::MESSAGE_ID, "m");
        put_str(&mut buf, field::CHANNEL_ID, "room");
        put_varint_field(&mut buf, field::LAMPORT, 3);
        put_bytes(&mut buf, field::CONTENT, b"");
        let decoded = decode(&buf.freeze()).unwrap();
        assert!(decoded.is_sync());
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let msg = SdsMessage::Content(content_message());
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&msg));
        put_varint_field(&mut buf, 99, 1234);
        put_bytes(&mut buf, 100, b"future extension");
        assert_eq!(decode(&buf.freeze()).unwrap(), msg);
    }

    #[test]
    fn test_truncated_frame() {
        let bytes = encode(&SdsMessage::Content(content_message()));
        assert!(decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_negative_lamport_roundtrip() {
        let mut msg = content_message();
        msg.lamport_timestamp = -1;
        let decoded = decode(&encode(&SdsMessage::Content(msg.clone()))).unwrap();
        assert_eq!(decoded, SdsMessage::Content(msg));
    }

    proptest! {
        #[test]
        fn prop_content_roundtrip(
            payload in proptest::collection::vec(any::<u8>(), 1..200),
            lamport in 0i64..1_000_000,
            sender in "[a-z]{1,16}",
            deps in proptest::collection::vec("[a-f0-9]{8}", 0..5),
        ) {
            let msg = SdsMessage::Content(ContentMessage {
                message_id: MessageId::derive(&payload),
                channel_id: ChannelId::new("prop"),
                sender_id: SenderId::new(sender),
                lamport_timestamp: lamport,
                causal_history: deps
                    .into_iter()
                    .map(|d| HistoryEntry::new(MessageId::new(d)))
                    .collect(),
                bloom_filter: None,
                payload: Bytes::from(payload),
                retrieval_hint: None,
            });
            prop_assert_eq!(decode(&encode(&msg)).unwrap(), msg);
        }

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&bytes);
        }
    }
}
