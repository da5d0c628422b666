//! Error types for the message channel.

use thiserror::Error;

use sds_core::{ProbabilityError, WireError};

/// Errors surfaced by channel operations.
///
/// Causal gap conditions (missing/lost) are not errors; they are protocol
/// states carried by status events.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// An inbound frame failed to decode. Local to that frame; channel
    /// state is untouched.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Bloom filter misconfiguration.
    #[error("bloom filter configuration: {0}")]
    Probability(#[from] ProbabilityError),

    /// A transport callback reported failure.
    #[error("transport callback failed: {0}")]
    Callback(String),
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
