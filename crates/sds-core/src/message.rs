//! The SDS message model.
//!
//! Three message kinds share a channel: content messages carry application
//! payloads plus causal metadata, sync messages carry causal metadata only
//! (heartbeats), and ephemeral messages carry a payload with no reliability
//! state at all. The kinds form a closed sum type ([`SdsMessage`]) with an
//! explicit discriminator in memory; on the wire the discriminator is
//! structural (see [`crate::wire`]).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, MessageId, SenderId};

/// A lightweight causal-dependency pointer: the id of a message this one
/// depends on, optionally with an out-of-band fetch hint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub message_id: MessageId,
    /// Transport-specific pointer letting a peer fetch this exact message
    /// out-of-band, e.g. from a store node.
    pub retrieval_hint: Option<Bytes>,
}

impl HistoryEntry {
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            retrieval_hint: None,
        }
    }

    pub fn with_hint(message_id: MessageId, hint: Bytes) -> Self {
        Self {
            message_id,
            retrieval_hint: Some(hint),
        }
    }
}

/// A payload-carrying message with full causal metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: SenderId,
    /// Logical clock value; monotonically non-decreasing per sender. Used
    /// for tie-breaking and visualization, never for delivery gating.
    pub lamport_timestamp: i64,
    /// Causal dependencies, oldest first, bounded length.
    pub causal_history: Vec<HistoryEntry>,
    /// Serialized [`crate::bloom::BloomFilter`] of recently seen ids.
    pub bloom_filter: Option<Bytes>,
    pub payload: Bytes,
    pub retrieval_hint: Option<Bytes>,
}

impl ContentMessage {
    /// Total-order sort key: lamport timestamp, then message id.
    pub fn sort_key(&self) -> (i64, &MessageId) {
        (self.lamport_timestamp, &self.message_id)
    }

    /// The causal entry other messages use to depend on this one.
    pub fn history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            message_id: self.message_id.clone(),
            retrieval_hint: self.retrieval_hint.clone(),
        }
    }
}

/// A content-free heartbeat carrying only causal/bloom state.
///
/// Never delivered to the application and never enters causal history; used
/// to propagate delivery knowledge when there is nothing new to say.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: SenderId,
    pub lamport_timestamp: i64,
    pub causal_history: Vec<HistoryEntry>,
    pub bloom_filter: Option<Bytes>,
}

/// A fire-and-forget payload: no causal history, no acknowledgement, no
/// lamport stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub payload: Bytes,
}

/// The closed set of SDS message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdsMessage {
    Content(ContentMessage),
    Sync(SyncMessage),
    Ephemeral(EphemeralMessage),
}

impl SdsMessage {
    pub fn message_id(&self) -> &MessageId {
        match self {
            SdsMessage::Content(m) => &m.message_id,
            SdsMessage::Sync(m) => &m.message_id,
            SdsMessage::Ephemeral(m) => &m.message_id,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        match self {
            SdsMessage::Content(m) => &m.channel_id,
            SdsMessage::Sync(m) => &m.channel_id,
            SdsMessage::Ephemeral(m) => &m.channel_id,
        }
    }

    /// Lamport stamp, absent on ephemeral messages.
    pub fn lamport_timestamp(&self) -> Option<i64> {
        match self {
            SdsMessage::Content(m) => Some(m.lamport_timestamp),
            SdsMessage::Sync(m) => Some(m.lamport_timestamp),
            SdsMessage::Ephemeral(_) => None,
        }
    }

    pub fn causal_history(&self) -> &[HistoryEntry] {
        match self {
            SdsMessage::Content(m) => &m.causal_history,
            SdsMessage::Sync(m) => &m.causal_history,
            SdsMessage::Ephemeral(_) => &[],
        }
    }

    pub fn bloom_filter(&self) -> Option<&Bytes> {
        match self {
            SdsMessage::Content(m) => m.bloom_filter.as_ref(),
            SdsMessage::Sync(m) => m.bloom_filter.as_ref(),
            SdsMessage::Ephemeral(_) => None,
        }
    }

    pub fn is_content(&self) -> bool {
        matches!(self, SdsMessage::Content(_))
    }

    pub fn is_sync(&self) -> bool {
        matches!(self, SdsMessage::Sync(_))
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, SdsMessage::Ephemeral(_))
    }
}

impl From<ContentMessage> for SdsMessage {
    fn from(m: ContentMessage) -> Self {
        SdsMessage::Content(m)
    }
}

impl From<SyncMessage> for SdsMessage {
    fn from(m: SyncMessage) -> Self {
        SdsMessage::Sync(m)
    }
}

impl From<EphemeralMessage> for SdsMessage {
    fn from(m: EphemeralMessage) -> Self {
        SdsMessage::Ephemeral(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(id: &str, lamport: i64) -> ContentMessage {
        ContentMessage {
            message_id: MessageId::new(id),
            channel_id: ChannelId::new("test"),
            sender_id: SenderId::new("alice"),
            lamport_timestamp: lamport,
            causal_history: Vec::new(),
            bloom_filter: None,
            payload: Bytes::from_static(b"payload"),
            retrieval_hint: None,
        }
    }

    #[test]
    fn test_sort_key_orders_by_lamport_then_id() {
        let a = content("a", 2);
        let b = content("b", 1);
        let c = content("a2", 1);
        let mut msgs = vec![a.clone(), b.clone(), c.clone()];
        msgs.sort_by(|x, y| x.sort_key().cmp(&y.sort_key()));
        assert_eq!(msgs[0].message_id, MessageId::new("a2"));
        assert_eq!(msgs[1].message_id, MessageId::new("b"));
        assert_eq!(msgs[2].message_id, MessageId::new("a"));
    }

    #[test]
    fn test_history_entry_carries_hint() {
        let mut m = content("a", 1);
        m.retrieval_hint = Some(Bytes::from_static(b"hint"));
        let entry = m.history_entry();
        assert_eq!(entry.message_id, m.message_id);
        assert_eq!(entry.retrieval_hint, m.retrieval_hint);
    }

    #[test]
    fn test_enum_accessors() {
        let msg: SdsMessage = content("a", 7).into();
        assert_eq!(msg.lamport_timestamp(), Some(7));
        assert!(msg.is_content());

        let eph: SdsMessage = EphemeralMessage {
            message_id: MessageId::new("e"),
            channel_id: ChannelId::new("test"),
            payload: Bytes::from_static(b"x"),
        }
        .into();
        assert_eq!(eph.lamport_timestamp(), None);
        assert!(eph.causal_history().is_empty());
    }
}
