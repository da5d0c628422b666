//! Error types for the SDS core primitives.

use thiserror::Error;

/// Errors from bloom filter parameter selection.
///
/// These are configuration errors: fatal to the configuration choice, fixed
/// by the caller, never retried automatically.
#[derive(Debug, Error)]
pub enum ProbabilityError {
    #[error("number of hash functions must be <= 12, got {0}")]
    KTooLarge(u32),

    #[error("no ratio under 4 bytes/element achieves error rate {target_error} with k={k}")]
    NoSuitableRatio { k: u32, target_error: f64 },

    #[error("target error rate must be in (0, 1), got {0}")]
    TargetOutOfRange(f64),
}

/// Errors from the wire codec.
///
/// A decode failure is local to one inbound frame: the frame is dropped and
/// reported, channel state is untouched.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated frame: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    #[error("invalid wire type {wire_type} for field {field}")]
    InvalidWireType { field: u32, wire_type: u8 },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid utf-8 in field {0}")]
    InvalidUtf8(&'static str),

    #[error("frame matches no message variant: {0}")]
    AmbiguousVariant(&'static str),

    #[error("malformed bloom filter: {0}")]
    MalformedFilter(&'static str),
}
