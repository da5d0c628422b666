//! # Scalable Data Sync
//!
//! A causal-broadcast reliability layer over an unreliable, best-effort
//! pub/sub transport. Each logical conversation is a channel that tracks
//! causal dependencies between messages, advertises a bloom-filter digest of
//! recently seen message ids, and detects messages that were sent but never
//! received, with no per-message acknowledgement handshake.
//!
//! ## Overview
//!
//! - **Channel**: the per-conversation state machine. Stamps outgoing
//!   messages with a lamport timestamp, a causal-history tail, and a bloom
//!   filter; classifies incoming messages as duplicate, deliverable, or
//!   causally blocked.
//! - **History**: a bounded log of sent and delivered messages, in memory
//!   or persisted through a storage backend and rehydrated on restart.
//! - **Repair**: cooperative recovery of missing messages, with jittered
//!   request timing and response-group load spreading.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use sds::{ChannelId, MemoryHistory, MessageChannel, MessageChannelConfig, SenderId};
//!
//! async fn example() {
//!     let mut channel = MessageChannel::new(
//!         ChannelId::new("my-channel"),
//!         SenderId::new("my-node"),
//!         MemoryHistory::default(),
//!         MessageChannelConfig::default(),
//!     )
//!     .unwrap();
//!
//!     let mut events = channel.subscribe();
//!
//!     // Queue a send; the callback hands the encoded frame to the
//!     // transport.
//!     channel.send_message(Bytes::from_static(b"hello"), None);
//!     channel.process_tasks().await;
//!
//!     while let Ok(event) = events.try_recv() {
//!         println!("{event:?}");
//!     }
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `sds::core` - Message model, wire codec, bloom filter
//! - `sds::store` - History and storage backends
//! - `sds::channel` - The channel state machine and repair scheduling

// Re-export component crates
pub use sds_channel as channel;
pub use sds_core as core;
pub use sds_store as store;

// Re-export main types for convenience
pub use sds_channel::{
    ChannelError, DeliveryDirection, MessageChannel, MessageChannelConfig, MessageChannelEvent,
    OutgoingSweep, RepairConfig, RepairManager, RepairRequest, Result, SendCallback, SendOutcome,
    SyncStatus,
};
pub use sds_core::{
    BloomFilter, BloomFilterOptions, ChannelId, ContentMessage, EphemeralMessage, HistoryEntry,
    MessageId, SdsMessage, SenderId, SyncMessage,
};
pub use sds_store::{
    LocalHistory, MemoryHistory, MemoryStorage, PersistentHistory, SqliteStorage, Storage,
};
