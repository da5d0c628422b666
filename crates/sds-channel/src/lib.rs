//! Causal-broadcast channel machinery: the message channel state machine,
//! its command queue and event surface, and repair scheduling for missing
//! messages.

pub mod channel;
pub mod command;
pub mod error;
pub mod events;
pub mod repair;

pub use channel::{
    MessageChannel, MessageChannelConfig, OutgoingSweep, DEFAULT_ACKNOWLEDGEMENT_COUNT,
    DEFAULT_CAUSAL_HISTORY_SIZE, DEFAULT_LOST_AFTER, DEFAULT_MAX_PEER_FILTERS,
};
pub use command::{EphemeralCallback, SendCallback, SendOutcome, SyncCallback, Task};
pub use error::{ChannelError, Result};
pub use events::{DeliveryDirection, MessageChannelEvent, SyncStatus};
pub use repair::{
    IncomingRepairBuffer, OutgoingRepairBuffer, RepairConfig, RepairManager, RepairRequest,
    DEFAULT_MAX_REPAIR_REQUESTS, PARTICIPANTS_PER_RESPONSE_GROUP,
};
