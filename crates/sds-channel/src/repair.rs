//! Cooperative repair scheduling for missing messages.
//!
//! When a causal dependency goes missing, every participant that noticed the
//! gap could ask for it at once, and every participant that holds it could
//! answer at once. Repair timing spreads both out: request times are jittered
//! per participant, response duty is split into groups keyed on the message
//! id, and within a group the responder closest (by xor distance) to the
//! requester fires first. A repair arriving before a node's own timer fires
//! cancels its pending request or response.
//!
//! All times are unix milliseconds supplied by the caller, so tests control
//! the clock directly.

use std::collections::VecDeque;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use sds_core::{ContentMessage, HistoryEntry, MessageId, SenderId};
use sds_store::LocalHistory;

/// One response group per this many participants.
pub const PARTICIPANTS_PER_RESPONSE_GROUP: usize = 128;

/// Repair requests handed out per sweep.
pub const DEFAULT_MAX_REPAIR_REQUESTS: usize = 3;

/// Timing and capacity knobs for the repair scheduler.
#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Minimum wait before requesting a repair, in milliseconds.
    pub t_min: u64,
    /// Upper bound of the repair window, in milliseconds.
    pub t_max: u64,
    /// Response groups for load distribution.
    pub num_response_groups: u64,
    /// Capacity of each repair buffer.
    pub buffer_size: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            t_min: 30_000,
            t_max: 120_000,
            num_response_groups: 1,
            buffer_size: 1000,
        }
    }
}

/// A repair request as it travels between participants: the missing entry
/// plus the requester's id, which picks the response group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    pub entry: HistoryEntry,
    pub sender_id: SenderId,
}

#[derive(Debug, Clone)]
struct OutgoingEntry {
    entry: HistoryEntry,
    t_req: u64,
    requested: bool,
}

#[derive(Debug, Clone)]
struct IncomingEntry {
    entry: HistoryEntry,
    t_resp: u64,
}

/// Missing messages we intend to request, sorted ascending by request time.
#[derive(Debug)]
pub struct OutgoingRepairBuffer {
    items: VecDeque<OutgoingEntry>,
    max_size: usize,
}

impl OutgoingRepairBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Queue a missing entry. A duplicate id keeps its original request
    /// time and returns `false`. A full buffer evicts the furthest-due
    /// entry, preserving the repairs due soonest.
    pub fn add(&mut self, entry: HistoryEntry, t_req: u64) -> bool {
        if self.has(&entry.message_id) {
            return false;
        }
        if self.items.len() >= self.max_size {
            if let Some(evicted) = self.items.pop_back() {
                warn!(message_id = %evicted.entry.message_id, t_req = evicted.t_req, "repair buffer full, evicted furthest entry");
            }
        }
        let pos = self
            .items
            .partition_point(|item| item.t_req <= t_req);
        self.items.insert(
            pos,
            OutgoingEntry {
                entry,
                t_req,
                requested: false,
            },
        );
        true
    }

    pub fn remove(&mut self, message_id: &MessageId) {
        self.items.retain(|item| &item.entry.message_id != message_id);
    }

    /// Entries due at `now` that were not yet requested, up to
    /// `max_requests`. Returned entries are marked requested but stay
    /// buffered until the message actually arrives.
    pub fn get_eligible(&mut self, now: u64, max_requests: usize) -> Vec<HistoryEntry> {
        let mut eligible = Vec::new();
        for item in self.items.iter_mut() {
            if item.t_req > now || eligible.len() >= max_requests {
                break;
            }
            if !item.requested {
                item.requested = true;
                eligible.push(item.entry.clone());
            }
        }
        eligible
    }

    pub fn has(&self, message_id: &MessageId) -> bool {
        self.items
            .iter()
            .any(|item| &item.entry.message_id == message_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Earliest pending request time.
    pub fn next_request_time(&self) -> Option<u64> {
        self.items.front().map(|item| item.t_req)
    }
}

/// Repairs we owe to others, sorted ascending by response time.
#[derive(Debug)]
pub struct IncomingRepairBuffer {
    items: VecDeque<IncomingEntry>,
    max_size: usize,
}

impl IncomingRepairBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Queue a repair we can fulfil. Duplicate ids are ignored; a full
    /// buffer evicts the furthest-due entry.
    pub fn add(&mut self, entry: HistoryEntry, t_resp: u64) -> bool {
        if self.has(&entry.message_id) {
            return false;
        }
        if self.items.len() >= self.max_size {
            if let Some(evicted) = self.items.pop_back() {
                warn!(message_id = %evicted.entry.message_id, t_resp = evicted.t_resp, "repair buffer full, evicted furthest entry");
            }
        }
        let pos = self
            .items
            .partition_point(|item| item.t_resp <= t_resp);
        self.items.insert(pos, IncomingEntry { entry, t_resp });
        true
    }

    pub fn remove(&mut self, message_id: &MessageId) {
        self.items.retain(|item| &item.entry.message_id != message_id);
    }

    /// Remove and return entries due at `now`.
    pub fn get_ready(&mut self, now: u64) -> Vec<HistoryEntry> {
        let cutoff = self.items.partition_point(|item| item.t_resp <= now);
        self.items.drain(..cutoff).map(|item| item.entry).collect()
    }

    pub fn has(&self, message_id: &MessageId) -> bool {
        self.items
            .iter()
            .any(|item| &item.entry.message_id == message_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Earliest pending response time.
    pub fn next_response_time(&self) -> Option<u64> {
        self.items.front().map(|item| item.t_resp)
    }
}

/// Schedules repair requests and responses for one participant.
pub struct RepairManager {
    participant_id: SenderId,
    config: RepairConfig,
    outgoing: OutgoingRepairBuffer,
    incoming: IncomingRepairBuffer,
}

impl RepairManager {
    pub fn new(participant_id: SenderId, config: RepairConfig) -> Self {
        let outgoing = OutgoingRepairBuffer::new(config.buffer_size);
        let incoming = IncomingRepairBuffer::new(config.buffer_size);
        Self {
            participant_id,
            config,
            outgoing,
            incoming,
        }
    }

    /// When to request a missing message:
    /// `now + hash(participant, message) % (t_max - t_min) + t_min`.
    /// The per-participant hash staggers requesters across the window.
    pub fn request_time(&self, message_id: &MessageId, now: u64) -> u64 {
        let hash = combined_hash(self.participant_id.as_str(), message_id.as_str());
        let range = self.config.t_max.saturating_sub(self.config.t_min).max(1);
        now + hash % range + self.config.t_min
    }

    /// When to answer a repair request:
    /// `now + (xor_distance(participant, requester) * hash(message)) % t_max`.
    /// Responders closer to the requester fire earlier.
    pub fn response_time(&self, requester: &SenderId, message_id: &MessageId, now: u64) -> u64 {
        let distance = xor_distance(self.participant_id.as_str(), requester.as_str());
        let product = u128::from(distance) * u128::from(hash_string(message_id.as_str()));
        let offset = product % u128::from(self.config.t_max.max(1));
        now + offset as u64
    }

    /// Whether this participant shares a response group with the requester
    /// for the given message. A single group contains everyone.
    pub fn is_in_response_group(&self, requester: &SenderId, message_id: &MessageId) -> bool {
        if requester.as_str().is_empty() {
            return false;
        }
        let groups = self.config.num_response_groups;
        if groups <= 1 {
            return true;
        }
        let ours = combined_hash(self.participant_id.as_str(), message_id.as_str()) % groups;
        let theirs = combined_hash(requester.as_str(), message_id.as_str()) % groups;
        ours == theirs
    }

    /// Queue missing dependencies for later repair requests.
    pub fn mark_dependencies_missing(&mut self, missing: &[HistoryEntry], now: u64) {
        for entry in missing {
            let t_req = self.request_time(&entry.message_id, now);
            if self.outgoing.add(entry.clone(), t_req) {
                debug!(message_id = %entry.message_id, t_req, "queued repair request");
            }
        }
    }

    /// The message arrived; nothing left to request or answer for it.
    pub fn mark_message_received(&mut self, message_id: &MessageId) {
        self.outgoing.remove(message_id);
        self.incoming.remove(message_id);
    }

    /// Repair requests due to be broadcast.
    pub fn sweep_outgoing(&mut self, now: u64, max_requests: usize) -> Vec<HistoryEntry> {
        self.outgoing.get_eligible(now, max_requests)
    }

    /// Process repair requests heard from peers.
    ///
    /// Another participant requesting an id we were also waiting on cancels
    /// our own pending request. We queue a response only for messages held
    /// in local history whose requester shares our response group.
    pub fn process_incoming_requests<H: LocalHistory>(
        &mut self,
        requests: &[RepairRequest],
        history: &H,
        now: u64,
    ) {
        for request in requests {
            let message_id = &request.entry.message_id;
            self.outgoing.remove(message_id);

            if !history.contains(message_id) {
                debug!(message_id = %message_id, "cannot fulfil repair, not in local history");
                continue;
            }
            if request.sender_id.as_str().is_empty() {
                warn!(message_id = %message_id, "repair request without sender id");
                continue;
            }
            if !self.is_in_response_group(&request.sender_id, message_id) {
                continue;
            }

            let t_resp = self.response_time(&request.sender_id, message_id, now);
            if self.incoming.add(request.entry.clone(), t_resp) {
                debug!(message_id = %message_id, t_resp, "queued repair response");
            }
        }
    }

    /// Messages due to be rebroadcast as repairs, resolved against history.
    pub fn sweep_incoming<H: LocalHistory>(&mut self, history: &H, now: u64) -> Vec<ContentMessage> {
        let mut messages = Vec::new();
        for entry in self.incoming.get_ready(now) {
            let id = entry.message_id.clone();
            match history.find_index(&|m: &ContentMessage| m.message_id == id) {
                Some(idx) => {
                    if let Some(message) = history.slice(idx).into_iter().next() {
                        messages.push(message);
                    }
                }
                None => {
                    warn!(message_id = %entry.message_id, "repair target no longer in local history");
                }
            }
        }
        messages
    }

    /// Re-derive the group count from the participant count: one group per
    /// 128 participants, at least one.
    pub fn update_response_groups(&mut self, num_participants: usize) {
        self.config.num_response_groups =
            ((num_participants / PARTICIPANTS_PER_RESPONSE_GROUP).max(1)) as u64;
    }

    pub fn pending_requests(&self) -> usize {
        self.outgoing.len()
    }

    pub fn pending_responses(&self) -> usize {
        self.incoming.len()
    }

    pub fn next_request_time(&self) -> Option<u64> {
        self.outgoing.next_request_time()
    }

    pub fn next_response_time(&self) -> Option<u64> {
        self.incoming.next_response_time()
    }

    pub fn is_pending_request(&self, message_id: &MessageId) -> bool {
        self.outgoing.has(message_id)
    }

    pub fn is_pending_response(&self, message_id: &MessageId) -> bool {
        self.incoming.has(message_id)
    }

    pub fn clear(&mut self) {
        self.outgoing.clear();
        self.incoming.clear();
    }
}

/// First eight big-endian bytes of sha256 as a u64.
fn hash_string(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
}

/// Hash over both inputs, domain-separated so `("ab","c")` and `("a","bc")`
/// differ.
fn combined_hash(a: &str, b: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update((a.len() as u64).to_be_bytes());
    hasher.update(a.as_bytes());
    hasher.update(b.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
}

/// Distance metric between two participant ids.
fn xor_distance(a: &str, b: &str) -> u64 {
    hash_string(a) ^ hash_string(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sds_core::ChannelId;
    use sds_store::MemoryHistory;

    fn entry(id: &str) -> HistoryEntry {
        HistoryEntry::new(MessageId::new(id))
    }

    fn manager(name: &str) -> RepairManager {
        RepairManager::new(SenderId::new(name), RepairConfig::default())
    }

    fn content(id: &str) -> ContentMessage {
        ContentMessage {
            message_id: MessageId::new(id),
            channel_id: ChannelId::new("room"),
            sender_id: SenderId::new("alice"),
            lamport_timestamp: 1,
            causal_history: Vec::new(),
            bloom_filter: None,
            payload: Bytes::from_static(b"payload"),
            retrieval_hint: None,
        }
    }

    #[test]
    fn test_request_time_within_window() {
        let m = manager("alice");
        let now = 1_000_000;
        let t_req = m.request_time(&MessageId::new("m1"), now);
        assert!(t_req >= now + 30_000);
        assert!(t_req < now + 120_000);
    }

    #[test]
    fn test_request_time_deterministic_and_jittered() {
        let alice = manager("alice");
        let bob = manager("bob");
        let id = MessageId::new("m1");
        assert_eq!(alice.request_time(&id, 0), alice.request_time(&id, 0));
        // Different participants land on different offsets for the same
        // message (with overwhelming probability for these fixed inputs).
        assert_ne!(alice.request_time(&id, 0), bob.request_time(&id, 0));
    }

    #[test]
    fn test_response_time_within_window() {
        let m = manager("alice");
        let now = 5_000;
        let t_resp = m.response_time(&SenderId::new("bob"), &MessageId::new("m1"), now);
        assert!(t_resp >= now);
        assert!(t_resp < now + 120_000);
    }

    #[test]
    fn test_response_group_single_group_contains_everyone() {
        let m = manager("alice");
        assert!(m.is_in_response_group(&SenderId::new("bob"), &MessageId::new("m1")));
    }

    #[test]
    fn test_response_group_rejects_empty_sender() {
        let m = manager("alice");
        assert!(!m.is_in_response_group(&SenderId::new(""), &MessageId::new("m1")));
    }

    #[test]
    fn test_response_group_self_always_matches() {
        let mut m = manager("alice");
        m.update_response_groups(1024);
        // Sender and participant hash identically, so the groups coincide.
        assert!(m.is_in_response_group(&SenderId::new("alice"), &MessageId::new("m1")));
    }

    #[test]
    fn test_update_response_groups_scaling() {
        let mut m = manager("alice");
        m.update_response_groups(0);
        assert!(m.is_in_response_group(&SenderId::new("bob"), &MessageId::new("m1")));
        m.update_response_groups(127);
        // Still a single group below the threshold.
        assert!(m.is_in_response_group(&SenderId::new("bob"), &MessageId::new("m1")));
    }

    #[test]
    fn test_outgoing_buffer_sorted_and_deduplicated() {
        let mut buf = OutgoingRepairBuffer::new(10);
        assert!(buf.add(entry("b"), 200));
        assert!(buf.add(entry("a"), 100));
        assert!(buf.add(entry("c"), 300));
        // Duplicate keeps its original timing.
        assert!(!buf.add(entry("a"), 1));
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.next_request_time(), Some(100));
    }

    #[test]
    fn test_outgoing_buffer_eviction_keeps_soonest() {
        let mut buf = OutgoingRepairBuffer::new(2);
        buf.add(entry("a"), 100);
        buf.add(entry("b"), 200);
        buf.add(entry("c"), 50);
        assert_eq!(buf.len(), 2);
        assert!(buf.has(&MessageId::new("a")));
        assert!(buf.has(&MessageId::new("c")));
        assert!(!buf.has(&MessageId::new("b")));
    }

    #[test]
    fn test_outgoing_eligible_marks_requested_but_keeps() {
        let mut buf = OutgoingRepairBuffer::new(10);
        buf.add(entry("a"), 100);
        buf.add(entry("b"), 200);

        assert!(buf.get_eligible(50, 3).is_empty());

        let eligible = buf.get_eligible(150, 3);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].message_id, MessageId::new("a"));
        // Stays buffered, but not re-requested.
        assert_eq!(buf.len(), 2);
        assert!(buf.get_eligible(150, 3).is_empty());

        // Later the second becomes due.
        let eligible = buf.get_eligible(250, 3);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].message_id, MessageId::new("b"));
    }

    #[test]
    fn test_outgoing_eligible_respects_max() {
        let mut buf = OutgoingRepairBuffer::new(10);
        for i in 0..5 {
            buf.add(entry(&format!("m{i}")), i * 10);
        }
        assert_eq!(buf.get_eligible(1_000, 3).len(), 3);
        assert_eq!(buf.get_eligible(1_000, 3).len(), 2);
    }

    #[test]
    fn test_incoming_ready_removes_entries() {
        let mut buf = IncomingRepairBuffer::new(10);
        buf.add(entry("a"), 100);
        buf.add(entry("b"), 200);

        let ready = buf.get_ready(150);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].message_id, MessageId::new("a"));
        assert_eq!(buf.len(), 1);

        let ready = buf.get_ready(500);
        assert_eq!(ready.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_mark_message_received_clears_both_buffers() {
        let mut m = manager("alice");
        m.mark_dependencies_missing(&[entry("m1")], 0);
        assert!(m.is_pending_request(&MessageId::new("m1")));

        m.mark_message_received(&MessageId::new("m1"));
        assert!(!m.is_pending_request(&MessageId::new("m1")));
        assert_eq!(m.pending_requests(), 0);
    }

    #[test]
    fn test_peer_request_cancels_own_request() {
        let mut m = manager("alice");
        let history = MemoryHistory::default();
        m.mark_dependencies_missing(&[entry("m1")], 0);

        // A peer requests m1: our own request is redundant, and we cannot
        // fulfil the repair because the message is not in our history.
        m.process_incoming_requests(
            &[RepairRequest {
                entry: entry("m1"),
                sender_id: SenderId::new("bob"),
            }],
            &history,
            0,
        );
        assert_eq!(m.pending_requests(), 0);
        assert_eq!(m.pending_responses(), 0);
    }

    #[test]
    fn test_incoming_request_queued_when_fulfillable() {
        let mut m = manager("alice");
        let mut history = MemoryHistory::default();
        history.push(vec![content("m1")]);

        m.process_incoming_requests(
            &[RepairRequest {
                entry: entry("m1"),
                sender_id: SenderId::new("bob"),
            }],
            &history,
            1_000,
        );
        assert_eq!(m.pending_responses(), 1);
        assert!(m.next_response_time().is_some());

        // Once due, the sweep resolves the full message from history.
        let due = m.next_response_time().unwrap();
        let repairs = m.sweep_incoming(&history, due);
        assert_eq!(repairs.len(), 1);
        assert_eq!(repairs[0].message_id, MessageId::new("m1"));
        assert_eq!(m.pending_responses(), 0);
    }

    #[test]
    fn test_incoming_request_without_sender_skipped() {
        let mut m = manager("alice");
        let mut history = MemoryHistory::default();
        history.push(vec![content("m1")]);

        m.process_incoming_requests(
            &[RepairRequest {
                entry: entry("m1"),
                sender_id: SenderId::new(""),
            }],
            &history,
            0,
        );
        assert_eq!(m.pending_responses(), 0);
    }

    proptest::proptest! {
        #[test]
        fn prop_outgoing_buffer_bounded_and_sorted(
            entries in proptest::collection::vec((0u32..500, 0u64..10_000), 0..200)
        ) {
            let mut buf = OutgoingRepairBuffer::new(64);
            for (id, t_req) in entries {
                buf.add(entry(&format!("m{id}")), t_req);
            }
            proptest::prop_assert!(buf.len() <= 64);
            let times: Vec<u64> = buf.items.iter().map(|item| item.t_req).collect();
            proptest::prop_assert!(times.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_sweep_outgoing_batches_due_requests() {
        let mut m = RepairManager::new(
            SenderId::new("alice"),
            RepairConfig {
                t_min: 0,
                t_max: 1,
                ..RepairConfig::default()
            },
        );
        // t_max - t_min collapses the jitter window, so everything is due
        // immediately.
        m.mark_dependencies_missing(&[entry("m1"), entry("m2"), entry("m3"), entry("m4")], 0);
        assert_eq!(m.sweep_outgoing(10, DEFAULT_MAX_REPAIR_REQUESTS).len(), 3);
        assert_eq!(m.sweep_outgoing(10, DEFAULT_MAX_REPAIR_REQUESTS).len(), 1);
    }
}
