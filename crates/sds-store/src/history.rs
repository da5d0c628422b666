//! Bounded local history of sent and delivered content messages.
//!
//! The history is the channel's memory: causal-history tails for outgoing
//! messages come from here, and dependency checks on incoming messages look
//! ids up here. Two interchangeable variants share one trait: pure in-memory
//! and persisted (same capacity semantics, backed by a [`Storage`] backend,
//! rehydrated on construction).
//!
//! Capacity is FIFO: appending past `max_size` evicts the oldest entries,
//! and the retained suffix keeps its original relative order. A message
//! already present by id is never duplicated.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use sds_core::{ChannelId, ContentMessage, HistoryEntry, MessageId};

use crate::error::StoreError;
use crate::traits::Storage;

/// Default capacity of a channel's local history.
pub const DEFAULT_MAX_SIZE: usize = 1000;

/// Ordered, bounded collection of content messages.
pub trait LocalHistory: Send {
    /// Append a batch, skipping ids already present (including duplicates
    /// within the batch) and evicting from the front past capacity.
    /// Returns the resulting length.
    fn push(&mut self, batch: Vec<ContentMessage>) -> usize;

    /// Number of retained messages.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone of the retained messages from `start` onward.
    fn slice(&self, start: usize) -> Vec<ContentMessage>;

    /// Index of the first message matching `predicate`, if any.
    fn find_index(&self, predicate: &dyn Fn(&ContentMessage) -> bool) -> Option<usize>;

    /// Whether a message with this id is retained.
    fn contains(&self, id: &MessageId) -> bool;

    /// The most recent `n` messages as causal-dependency entries, oldest
    /// first.
    fn tail_entries(&self, n: usize) -> Vec<HistoryEntry>;

    /// All retained message ids, oldest first.
    fn message_ids(&self) -> Vec<MessageId>;

    /// Attach a retrieval hint to a retained message. Returns false if the
    /// id is not retained.
    fn set_retrieval_hint(&mut self, id: &MessageId, hint: Bytes) -> bool;
}

/// In-memory history. State lives only for the process lifetime.
pub struct MemoryHistory {
    messages: VecDeque<ContentMessage>,
    ids: HashSet<MessageId>,
    max_size: usize,
}

impl MemoryHistory {
    pub fn new(max_size: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            ids: HashSet::new(),
            max_size,
        }
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl LocalHistory for MemoryHistory {
    fn push(&mut self, batch: Vec<ContentMessage>) -> usize {
        for message in batch {
            if self.ids.contains(&message.message_id) {
                continue;
            }
            self.ids.insert(message.message_id.clone());
            self.messages.push_back(message);
        }
        while self.messages.len() > self.max_size {
            if let Some(evicted) = self.messages.pop_front() {
                self.ids.remove(&evicted.message_id);
            }
        }
        self.messages.len()
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn slice(&self, start: usize) -> Vec<ContentMessage> {
        self.messages.iter().skip(start).cloned().collect()
    }

    fn find_index(&self, predicate: &dyn Fn(&ContentMessage) -> bool) -> Option<usize> {
        self.messages.iter().position(predicate)
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    fn tail_entries(&self, n: usize) -> Vec<HistoryEntry> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages
            .iter()
            .skip(skip)
            .map(|m| m.history_entry())
            .collect()
    }

    fn message_ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|m| m.message_id.clone()).collect()
    }

    fn set_retrieval_hint(&mut self, id: &MessageId, hint: Bytes) -> bool {
        for message in self.messages.iter_mut() {
            if &message.message_id == id {
                message.retrieval_hint = Some(hint);
                return true;
            }
        }
        false
    }
}

/// History persisted through a [`Storage`] backend under a channel-scoped
/// key.
///
/// Rehydrates on construction; every mutation persists the full list
/// synchronously. A failing backend degrades to in-memory behavior for that
/// call (availability over durability); a corrupt snapshot is cleared.
pub struct PersistentHistory<S: Storage> {
    inner: MemoryHistory,
    storage: Arc<S>,
    key: String,
}

impl<S: Storage> PersistentHistory<S> {
    pub fn new(channel_id: &ChannelId, storage: Arc<S>, max_size: usize) -> Self {
        let key = format!("sds:history:{}", channel_id);
        let mut inner = MemoryHistory::new(max_size);

        match storage.get_item(&key) {
            Ok(Some(snapshot)) => match decode_snapshot(&snapshot) {
                Ok(messages) => {
                    inner.push(messages);
                }
                Err(reason) => {
                    warn!(channel = %channel_id, %reason, "corrupt history snapshot, clearing");
                    if let Err(e) = storage.remove_item(&key) {
                        warn!(channel = %channel_id, error = %e, "failed to clear snapshot");
                    }
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(channel = %channel_id, error = %e, "history storage unavailable, starting empty");
            }
        }

        Self {
            inner,
            storage,
            key,
        }
    }

    fn persist(&self) {
        let snapshot = match encode_snapshot(&self.inner.slice(0)) {
            Ok(s) => s,
            Err(reason) => {
                warn!(key = %self.key, %reason, "failed to encode history snapshot");
                return;
            }
        };
        if let Err(e) = self.storage.set_item(&self.key, &snapshot) {
            warn!(key = %self.key, error = %e, "failed to persist history");
        }
    }
}

impl<S: Storage> LocalHistory for PersistentHistory<S> {
    fn push(&mut self, batch: Vec<ContentMessage>) -> usize {
        let len = self.inner.push(batch);
        self.persist();
        len
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn slice(&self, start: usize) -> Vec<ContentMessage> {
        self.inner.slice(start)
    }

    fn find_index(&self, predicate: &dyn Fn(&ContentMessage) -> bool) -> Option<usize> {
        self.inner.find_index(predicate)
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.inner.contains(id)
    }

    fn tail_entries(&self, n: usize) -> Vec<HistoryEntry> {
        self.inner.tail_entries(n)
    }

    fn message_ids(&self) -> Vec<MessageId> {
        self.inner.message_ids()
    }

    fn set_retrieval_hint(&mut self, id: &MessageId, hint: Bytes) -> bool {
        let updated = self.inner.set_retrieval_hint(id, hint);
        if updated {
            self.persist();
        }
        updated
    }
}

/// Snapshot encoding: CBOR, hex-armored for the string-valued storage
/// contract.
fn encode_snapshot(messages: &[ContentMessage]) -> crate::error::Result<String> {
    let mut buf = Vec::new();
    ciborium::into_writer(messages, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(hex::encode(buf))
}

fn decode_snapshot(snapshot: &str) -> crate::error::Result<Vec<ContentMessage>> {
    let bytes = hex::decode(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
    ciborium::from_reader(bytes.as_slice()).map_err(|e| StoreError::Serialization(e.to_string()))
}
