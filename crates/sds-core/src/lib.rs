//! # SDS Core
//!
//! Pure primitives for Scalable Data Sync channels: the message model, the
//! wire codec, and the bloom filter digest.
//!
//! This crate contains no I/O, no storage, no networking. It is pure
//! computation over protocol data structures.
//!
//! ## Key Types
//!
//! - [`SdsMessage`] - The closed set of message kinds (content / sync / ephemeral)
//! - [`MessageId`] - Message identifier, optionally content-derived (SHA-256)
//! - [`HistoryEntry`] - A causal-dependency pointer
//! - [`BloomFilter`] - Digest of recently seen message ids
//!
//! ## Wire format
//!
//! Frames use a length-prefixed, tag-ordered varint scheme. See [`wire`].

pub mod bloom;
pub mod error;
pub mod message;
pub mod probabilities;
pub mod types;
pub mod wire;

pub use bloom::{BloomFilter, BloomFilterOptions};
pub use error::{ProbabilityError, WireError};
pub use message::{ContentMessage, EphemeralMessage, HistoryEntry, SdsMessage, SyncMessage};
pub use probabilities::{bits_per_element, MAX_HASH_COUNT};
pub use types::{ChannelId, MessageId, SenderId};
