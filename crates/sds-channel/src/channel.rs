//! The message channel state machine.
//!
//! A channel owns its history, lamport clock, and buffers; all mutation runs
//! on a single sequential path (the task queue), because causal-history
//! stamping and clock advancement are not commutative. Distinct channels are
//! fully independent.
//!
//! ## Overview
//!
//! Sending stamps the payload with a lamport timestamp, the causal tail of
//! local history, and a fresh bloom filter of everything retained locally
//! (including the message itself), then hands the encoded frame to the
//! caller's transport callback. Receiving classifies each content message as
//! duplicate, causally ready (delivered), or causally blocked (buffered),
//! and reviews acknowledgement state for our own unacked sends. Externally
//! driven sweeps re-deliver unblocked messages, report still-missing
//! dependencies, and classify long-outstanding ones as lost.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sds_core::{
    wire, BloomFilter, BloomFilterOptions, ChannelId, ContentMessage, HistoryEntry, MessageId,
    SdsMessage, SenderId, SyncMessage,
};
use sds_store::LocalHistory;

use crate::command::{EphemeralCallback, SendCallback, SyncCallback, Task};
use crate::error::Result;
use crate::events::{DeliveryDirection, MessageChannelEvent, SyncStatus};

/// Causal-history entries attached to each outgoing message.
pub const DEFAULT_CAUSAL_HISTORY_SIZE: usize = 2;

/// Peer bloom filter matches required before an unacked send counts as
/// acknowledged on probabilistic grounds.
pub const DEFAULT_ACKNOWLEDGEMENT_COUNT: usize = 2;

/// Retention window after which an unresolved dependency absent from all
/// peer filters is classified lost.
pub const DEFAULT_LOST_AFTER: Duration = Duration::from_secs(5 * 60);

/// Recent peer bloom filters retained for loss classification.
pub const DEFAULT_MAX_PEER_FILTERS: usize = 8;

/// Tuning knobs for a [`MessageChannel`].
#[derive(Debug, Clone)]
pub struct MessageChannelConfig {
    pub causal_history_size: usize,
    pub bloom: BloomFilterOptions,
    pub acknowledgement_count: usize,
    /// When set, buffered messages whose dependencies stay missing longer
    /// than this are dropped on sweep.
    pub received_message_timeout: Option<Duration>,
    pub lost_after: Duration,
    pub max_peer_filters: usize,
}

impl Default for MessageChannelConfig {
    fn default() -> Self {
        Self {
            causal_history_size: DEFAULT_CAUSAL_HISTORY_SIZE,
            bloom: BloomFilterOptions::default(),
            acknowledgement_count: DEFAULT_ACKNOWLEDGEMENT_COUNT,
            received_message_timeout: None,
            lost_after: DEFAULT_LOST_AFTER,
            max_peer_filters: DEFAULT_MAX_PEER_FILTERS,
        }
    }
}

/// Partition of the outgoing buffer by acknowledgement evidence.
#[derive(Debug, Default)]
pub struct OutgoingSweep {
    /// No acknowledgement evidence at all; retransmission candidates.
    pub unacknowledged: Vec<ContentMessage>,
    /// Matched at least one peer filter but below the threshold.
    pub possibly_acknowledged: Vec<ContentMessage>,
}

/// A causal-broadcast channel over an unreliable transport.
pub struct MessageChannel<H: LocalHistory> {
    channel_id: ChannelId,
    sender_id: SenderId,
    config: MessageChannelConfig,
    lamport_timestamp: i64,
    /// Ids sent or delivered by this channel. Outlives history eviction,
    /// so dependencies on (and duplicates of) old messages still resolve.
    /// Buffered-but-undelivered ids are deliberately absent: a dependency
    /// is met only once it has actually been delivered.
    observed: BloomFilter,
    history: H,
    outgoing_buffer: Vec<ContentMessage>,
    /// Partial (bloom filter) acknowledgement counts per outgoing id.
    acknowledgements: HashMap<MessageId, usize>,
    incoming_buffer: Vec<ContentMessage>,
    time_received: HashMap<MessageId, Instant>,
    /// Unresolved dependency ids and when they were first found missing.
    outstanding: HashMap<MessageId, Instant>,
    lost: HashSet<MessageId>,
    peer_filters: VecDeque<BloomFilter>,
    received_count: usize,
    last_status: Option<SyncStatus>,
    tasks: VecDeque<Task>,
    subscribers: Vec<mpsc::UnboundedSender<MessageChannelEvent>>,
}

impl<H: LocalHistory> MessageChannel<H> {
    /// Create a channel over the given history store.
    ///
    /// A rehydrated persistent history seeds the observed-id filter, so
    /// dependency resolution survives restarts.
    pub fn new(
        channel_id: ChannelId,
        sender_id: SenderId,
        history: H,
        config: MessageChannelConfig,
    ) -> Result<Self> {
        let mut observed = BloomFilter::new(&config.bloom)?;
        for id in history.message_ids() {
            observed.insert(id.as_str());
        }
        Ok(Self {
            channel_id,
            sender_id,
            config,
            lamport_timestamp: 0,
            observed,
            history,
            outgoing_buffer: Vec::new(),
            acknowledgements: HashMap::new(),
            incoming_buffer: Vec::new(),
            time_received: HashMap::new(),
            outstanding: HashMap::new(),
            lost: HashSet::new(),
            peer_filters: VecDeque::new(),
            received_count: 0,
            last_status: None,
            tasks: VecDeque::new(),
            subscribers: Vec::new(),
        })
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn sender_id(&self) -> &SenderId {
        &self.sender_id
    }

    pub fn lamport_timestamp(&self) -> i64 {
        self.lamport_timestamp
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    /// Subscribe to channel events. Dropped receivers are pruned lazily.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<MessageChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    // ── Public command surface ─────────────────────────────────────────

    /// Queue a payload to be sent. Processed by [`Self::process_tasks`].
    pub fn send_message(&mut self, payload: Bytes, callback: Option<SendCallback>) {
        self.tasks.push_back(Task::Send { payload, callback });
    }

    /// Queue a fire-and-forget payload: no timestamp, causal history, or
    /// bloom filter, and no channel state on either end.
    pub fn send_ephemeral_message(&mut self, payload: Bytes, callback: Option<EphemeralCallback>) {
        self.tasks.push_back(Task::SendEphemeral { payload, callback });
    }

    /// Decode an inbound frame and queue it for processing.
    ///
    /// Decode failures are returned here; the frame is dropped and channel
    /// state is untouched.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<()> {
        let message = wire::decode(bytes)?;
        self.receive_message(message);
        Ok(())
    }

    /// Queue an already-decoded message for processing.
    pub fn receive_message(&mut self, message: SdsMessage) {
        self.tasks.push_back(Task::Receive { message });
    }

    /// Execute queued tasks sequentially, in arrival order.
    ///
    /// A failing task emits [`MessageChannelEvent::TaskError`] and
    /// processing continues with the next task.
    pub async fn process_tasks(&mut self) {
        while let Some(task) = self.tasks.pop_front() {
            let command = task.command();
            if let Err(error) = self.execute_task(task).await {
                warn!(channel = %self.channel_id, command, %error, "task failed");
                self.emit(MessageChannelEvent::TaskError {
                    command,
                    error: error.to_string(),
                });
            }
        }
    }

    /// Send a content-free heartbeat carrying the causal tail and current
    /// filter. Skips the outgoing buffer, observed filter, and history.
    ///
    /// Returns whether the heartbeat was handed to the transport.
    pub async fn send_sync_message(&mut self, callback: Option<SyncCallback>) -> Result<bool> {
        self.lamport_timestamp = self.lamport_timestamp.max(0) + 1;

        let filter = self.build_attached_filter(None)?;
        let message = SyncMessage {
            message_id: MessageId::derive(&[]),
            channel_id: self.channel_id.clone(),
            sender_id: self.sender_id.clone(),
            lamport_timestamp: self.lamport_timestamp,
            causal_history: self.history.tail_entries(self.config.causal_history_size),
            bloom_filter: Some(filter.to_bytes()),
        };
        let encoded = wire::encode(&SdsMessage::Sync(message.clone()));

        match callback {
            Some(cb) => {
                let sent = cb(message.clone(), encoded).await?;
                if sent {
                    self.emit(MessageChannelEvent::SyncSent { message });
                }
                Ok(sent)
            }
            None => Ok(false),
        }
    }

    // ── Periodic review (externally driven) ────────────────────────────

    /// Deliver buffered messages whose dependencies are now met, drop
    /// timed-out ones, and report the dependencies still missing.
    pub fn sweep_incoming_buffer(&mut self) -> Vec<HistoryEntry> {
        // Deliver to fixpoint: each delivery may unblock later arrivals.
        loop {
            let mut progressed = false;
            let mut idx = 0;
            while idx < self.incoming_buffer.len() {
                if self
                    .missing_dependencies(&self.incoming_buffer[idx].causal_history)
                    .is_empty()
                {
                    let message = self.incoming_buffer.remove(idx);
                    self.deliver_content(message, DeliveryDirection::Received);
                    progressed = true;
                } else {
                    idx += 1;
                }
            }
            if !progressed {
                break;
            }
        }

        if let Some(timeout) = self.config.received_message_timeout {
            let now = Instant::now();
            let time_received = &self.time_received;
            self.incoming_buffer.retain(|message| {
                match time_received.get(&message.message_id) {
                    Some(at) if now.duration_since(*at) > timeout => {
                        debug!(message_id = %message.message_id, "dropping timed-out buffered message");
                        false
                    }
                    _ => true,
                }
            });
        }

        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for message in &self.incoming_buffer {
            for dep in message.causal_history.iter() {
                if self.dependency_met(&dep.message_id) {
                    continue;
                }
                if seen.insert(dep.message_id.clone()) {
                    missing.push(dep.clone());
                }
            }
        }

        let now = Instant::now();
        for dep in &missing {
            self.outstanding.entry(dep.message_id.clone()).or_insert(now);
        }

        self.emit(MessageChannelEvent::MissedMessages {
            entries: missing.clone(),
        });
        missing
    }

    /// Partition unacked sends for caller-driven retransmission.
    pub fn sweep_outgoing_buffer(&self) -> OutgoingSweep {
        let mut sweep = OutgoingSweep::default();
        for message in &self.outgoing_buffer {
            if self.acknowledgements.contains_key(&message.message_id) {
                sweep.possibly_acknowledged.push(message.clone());
            } else {
                sweep.unacknowledged.push(message.clone());
            }
        }
        sweep
    }

    /// Classify outstanding dependencies and summarize the channel state.
    ///
    /// An outstanding id present in a recent peer filter is missing but
    /// recoverable; one absent from all filters for longer than the
    /// retention window is lost. Emits `Synced`/`Syncing` on change only.
    pub fn review_status(&mut self) -> SyncStatus {
        let now = Instant::now();

        let history = &self.history;
        self.outstanding.retain(|id, _| !history.contains(id));

        let mut newly_lost = Vec::new();
        let mut missing = 0usize;
        for (id, since) in &self.outstanding {
            let in_peer_filter = self.peer_filters.iter().any(|f| f.lookup(id.as_str()));
            if in_peer_filter {
                missing += 1;
            } else if now.duration_since(*since) > self.config.lost_after {
                newly_lost.push(id.clone());
            } else {
                missing += 1;
            }
        }
        for id in newly_lost {
            debug!(channel = %self.channel_id, message_id = %id, "dependency classified lost");
            self.outstanding.remove(&id);
            self.lost.insert(id);
        }

        let status = SyncStatus {
            received: self.received_count,
            missing,
            lost: self.lost.len(),
        };
        if self.last_status != Some(status) {
            self.last_status = Some(status);
            if status.missing == 0 {
                self.emit(MessageChannelEvent::Synced(status));
            } else {
                self.emit(MessageChannelEvent::Syncing(status));
            }
        }
        status
    }

    // ── Task execution ─────────────────────────────────────────────────

    async fn execute_task(&mut self, task: Task) -> Result<()> {
        match task {
            Task::Send { payload, callback } => self.handle_send(payload, callback).await,
            Task::Receive { message } => {
                self.handle_receive(message);
                Ok(())
            }
            Task::SendEphemeral { payload, callback } => {
                self.handle_send_ephemeral(payload, callback).await
            }
        }
    }

    async fn handle_send(&mut self, payload: Bytes, callback: Option<SendCallback>) -> Result<()> {
        self.lamport_timestamp = self.lamport_timestamp.max(0) + 1;

        let message_id = MessageId::derive(&payload);
        let causal_history = self.history.tail_entries(self.config.causal_history_size);
        let filter = self.build_attached_filter(Some(&message_id))?;

        let message = ContentMessage {
            message_id: message_id.clone(),
            channel_id: self.channel_id.clone(),
            sender_id: self.sender_id.clone(),
            lamport_timestamp: self.lamport_timestamp,
            causal_history,
            bloom_filter: Some(filter.to_bytes()),
            payload,
            retrieval_hint: None,
        };

        // State first: history entries stay appended regardless of callback
        // outcome.
        self.observed.insert(message_id.as_str());
        self.time_received.insert(message_id.clone(), Instant::now());
        let before = self.history.len();
        let after = self.history.push(vec![message.clone()]);
        if after <= before {
            self.prune_time_received();
        }
        self.outgoing_buffer.push(message.clone());

        let encoded = wire::encode(&SdsMessage::Content(message.clone()));

        match callback {
            Some(cb) => {
                let outcome = cb(message.clone(), encoded).await?;
                if outcome.success {
                    if let Some(hint) = outcome.retrieval_hint {
                        self.history.set_retrieval_hint(&message_id, hint.clone());
                        if let Some(buffered) = self
                            .outgoing_buffer
                            .iter_mut()
                            .find(|m| m.message_id == message_id)
                        {
                            buffered.retrieval_hint = Some(hint);
                        }
                    }
                    self.emit(MessageChannelEvent::MessageSent { message });
                    self.emit(MessageChannelEvent::MessageDelivered {
                        message_id,
                        direction: DeliveryDirection::Sent,
                    });
                } else {
                    // Stays in the outgoing buffer as a retransmission
                    // candidate.
                    debug!(channel = %self.channel_id, message_id = %message_id, "transport declined send");
                }
            }
            None => {
                self.emit(MessageChannelEvent::MessageSent { message });
                self.emit(MessageChannelEvent::MessageDelivered {
                    message_id,
                    direction: DeliveryDirection::Sent,
                });
            }
        }
        Ok(())
    }

    async fn handle_send_ephemeral(
        &mut self,
        payload: Bytes,
        callback: Option<EphemeralCallback>,
    ) -> Result<()> {
        let message = sds_core::EphemeralMessage {
            message_id: MessageId::derive(&payload),
            channel_id: self.channel_id.clone(),
            payload,
        };
        let encoded = wire::encode(&SdsMessage::Ephemeral(message.clone()));
        if let Some(cb) = callback {
            cb(message, encoded).await?;
        }
        Ok(())
    }

    fn handle_receive(&mut self, message: SdsMessage) {
        match message {
            SdsMessage::Ephemeral(m) => {
                // Delivered immediately; bypasses all channel state.
                self.emit(MessageChannelEvent::EphemeralDelivered { message: m });
            }
            SdsMessage::Sync(m) => {
                self.lamport_timestamp = self.lamport_timestamp.max(m.lamport_timestamp);
                self.emit(MessageChannelEvent::SyncReceived { message: m.clone() });
                self.review_ack_status(&m.causal_history, m.bloom_filter.as_ref());
                self.record_peer_filter(m.bloom_filter.as_ref());
                self.note_missing(&m.causal_history);
            }
            SdsMessage::Content(m) => {
                // Duplicates (including echoes of our own sends and ids
                // already evicted from history) are idempotent for
                // delivery, but the clock still advances.
                if self.time_received.contains_key(&m.message_id)
                    || self.history.contains(&m.message_id)
                    || self.observed.lookup(m.message_id.as_str())
                {
                    self.lamport_timestamp = self.lamport_timestamp.max(m.lamport_timestamp);
                    return;
                }

                self.emit(MessageChannelEvent::MessageReceived { message: m.clone() });
                self.review_ack_status(&m.causal_history, m.bloom_filter.as_ref());
                self.record_peer_filter(m.bloom_filter.as_ref());

                let missing = self.missing_dependencies(&m.causal_history);
                if missing.is_empty() {
                    self.deliver_content(m, DeliveryDirection::Received);
                } else {
                    let now = Instant::now();
                    self.time_received.insert(m.message_id.clone(), now);
                    for dep in &missing {
                        self.outstanding.entry(dep.message_id.clone()).or_insert(now);
                    }
                    self.incoming_buffer.push(m);
                }
            }
        }
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn deliver_content(&mut self, message: ContentMessage, direction: DeliveryDirection) {
        self.lamport_timestamp = self.lamport_timestamp.max(message.lamport_timestamp);
        let message_id = message.message_id.clone();
        self.observed.insert(message_id.as_str());
        self.time_received.insert(message_id.clone(), Instant::now());
        let before = self.history.len();
        let after = self.history.push(vec![message]);
        if after <= before {
            self.prune_time_received();
        }
        self.outstanding.remove(&message_id);
        self.lost.remove(&message_id);
        if direction == DeliveryDirection::Received {
            self.received_count += 1;
        }
        self.emit(MessageChannelEvent::MessageDelivered {
            message_id,
            direction,
        });
    }

    /// History eviction triggers this: exact receive-time bookkeeping is
    /// kept only for retained and still-buffered messages, with the
    /// observed filter covering evicted ids.
    fn prune_time_received(&mut self) {
        let history = &self.history;
        let buffered = &self.incoming_buffer;
        self.time_received.retain(|id, _| {
            history.contains(id) || buffered.iter().any(|m| &m.message_id == id)
        });
    }

    fn dependency_met(&self, id: &MessageId) -> bool {
        self.history.contains(id) || self.observed.lookup(id.as_str())
    }

    fn missing_dependencies(&self, causal_history: &[HistoryEntry]) -> Vec<HistoryEntry> {
        causal_history
            .iter()
            .filter(|entry| !self.dependency_met(&entry.message_id))
            .cloned()
            .collect()
    }

    fn note_missing(&mut self, causal_history: &[HistoryEntry]) {
        let missing = self.missing_dependencies(causal_history);
        let now = Instant::now();
        for dep in missing {
            self.outstanding.entry(dep.message_id).or_insert(now);
        }
    }

    /// Acknowledgement review over a received message's causal history
    /// (certain) and bloom filter (probabilistic).
    fn review_ack_status(&mut self, causal_history: &[HistoryEntry], bloom: Option<&Bytes>) {
        for entry in causal_history {
            let id = &entry.message_id;
            let before = self.outgoing_buffer.len();
            self.outgoing_buffer.retain(|m| &m.message_id != id);
            if self.outgoing_buffer.len() < before {
                self.emit(MessageChannelEvent::MessageAcknowledged {
                    message_id: id.clone(),
                });
            }
            self.acknowledgements.remove(id);
        }

        let Some(bytes) = bloom else {
            return;
        };
        let peer_filter = match BloomFilter::from_bytes(bytes) {
            Ok(f) => f,
            Err(e) => {
                warn!(channel = %self.channel_id, error = %e, "undecodable peer bloom filter");
                return;
            }
        };

        let mut remaining = Vec::with_capacity(self.outgoing_buffer.len());
        for message in std::mem::take(&mut self.outgoing_buffer) {
            if !peer_filter.lookup(message.message_id.as_str()) {
                remaining.push(message);
                continue;
            }
            let count = self
                .acknowledgements
                .get(&message.message_id)
                .copied()
                .unwrap_or(0)
                + 1;
            if count < self.config.acknowledgement_count {
                self.acknowledgements
                    .insert(message.message_id.clone(), count);
                self.emit(MessageChannelEvent::PartialAcknowledgement {
                    message_id: message.message_id.clone(),
                    count,
                });
                remaining.push(message);
            } else {
                self.acknowledgements.remove(&message.message_id);
                self.emit(MessageChannelEvent::MessageAcknowledged {
                    message_id: message.message_id.clone(),
                });
            }
        }
        self.outgoing_buffer = remaining;
    }

    fn record_peer_filter(&mut self, bloom: Option<&Bytes>) {
        let Some(bytes) = bloom else {
            return;
        };
        if let Ok(filter) = BloomFilter::from_bytes(bytes) {
            self.peer_filters.push_back(filter);
            while self.peer_filters.len() > self.config.max_peer_filters {
                self.peer_filters.pop_front();
            }
        }
    }

    /// Fresh filter over the retained history snapshot plus, when sending,
    /// the message the filter travels with.
    fn build_attached_filter(&self, extra: Option<&MessageId>) -> Result<BloomFilter> {
        let mut filter = BloomFilter::new(&self.config.bloom)?;
        for id in self.history.message_ids() {
            filter.insert(id.as_str());
        }
        if let Some(id) = extra {
            filter.insert(id.as_str());
        }
        Ok(filter)
    }

    fn emit(&mut self, event: MessageChannelEvent) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
