//! Channel events: the externally observable state of a channel beyond
//! delivered payloads.
//!
//! Subscribers receive events over unbounded `tokio::sync::mpsc` channels;
//! a dropped receiver simply stops getting events and is pruned on the next
//! emit. `Synced`/`Syncing` fire only when the summarized status changes.

use sds_core::{ContentMessage, EphemeralMessage, HistoryEntry, MessageId, SyncMessage};

/// Whether a delivery was of a locally sent or remotely received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDirection {
    Sent,
    Received,
}

/// Summary of the channel's view of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStatus {
    /// Content messages delivered from remote peers.
    pub received: usize,
    /// Outstanding causal dependencies not yet resolved.
    pub missing: usize,
    /// Dependencies judged unlikely to ever arrive.
    pub lost: usize,
}

/// Events emitted by a [`crate::MessageChannel`].
#[derive(Debug, Clone)]
pub enum MessageChannelEvent {
    /// A locally sent content message was handed to the transport.
    MessageSent { message: ContentMessage },

    /// A content message was delivered (appended to history).
    MessageDelivered {
        message_id: MessageId,
        direction: DeliveryDirection,
    },

    /// A remote content message arrived (before dependency evaluation).
    MessageReceived { message: ContentMessage },

    /// An ephemeral message arrived; delivered immediately, no state kept.
    EphemeralDelivered { message: EphemeralMessage },

    /// A sync heartbeat was handed to the transport.
    SyncSent { message: SyncMessage },

    /// A sync heartbeat arrived from a peer.
    SyncReceived { message: SyncMessage },

    /// An outgoing message was certainly acknowledged (its id appeared in a
    /// peer's causal history) or crossed the probabilistic threshold.
    MessageAcknowledged { message_id: MessageId },

    /// An outgoing message matched a peer bloom filter but has not yet
    /// crossed the acknowledgement threshold.
    PartialAcknowledgement { message_id: MessageId, count: usize },

    /// Dependencies still missing after an incoming-buffer sweep.
    MissedMessages { entries: Vec<HistoryEntry> },

    /// A queued task failed; processing continued with the next task.
    TaskError { command: &'static str, error: String },

    /// Every known dependency is resolved.
    Synced(SyncStatus),

    /// Dependencies are outstanding.
    Syncing(SyncStatus),
}
