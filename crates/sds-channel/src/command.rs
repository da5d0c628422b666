//! The channel's command queue: a closed set of commands with per-command
//! parameter shapes.
//!
//! This is a dispatch contract, not a scheduler. Tasks are queued by the
//! public API and executed in arrival order by
//! [`crate::MessageChannel::process_tasks`], which keeps lamport stamping
//! and causal-history attachment on a single sequential path.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use sds_core::{ContentMessage, EphemeralMessage, SdsMessage, SyncMessage};

use crate::error::Result;

/// Boxed future returned by user callbacks.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Outcome reported by a send callback once bytes were handed to the
/// transport.
#[derive(Debug, Clone, Default)]
pub struct SendOutcome {
    pub success: bool,
    /// Pointer letting peers fetch this message out-of-band; recorded
    /// against the message's history entry when present.
    pub retrieval_hint: Option<Bytes>,
}

/// Callback invoked with the stamped message and its encoded frame.
pub type SendCallback =
    Box<dyn FnOnce(ContentMessage, Bytes) -> BoxFuture<Result<SendOutcome>> + Send>;

/// Callback for ephemeral sends; reports transport success only.
pub type EphemeralCallback =
    Box<dyn FnOnce(EphemeralMessage, Bytes) -> BoxFuture<Result<bool>> + Send>;

/// Callback for sync heartbeats; reports transport success only.
pub type SyncCallback = Box<dyn FnOnce(SyncMessage, Bytes) -> BoxFuture<Result<bool>> + Send>;

/// A queued command with its parameters.
pub enum Task {
    Send {
        payload: Bytes,
        callback: Option<SendCallback>,
    },
    Receive {
        message: SdsMessage,
    },
    SendEphemeral {
        payload: Bytes,
        callback: Option<EphemeralCallback>,
    },
}

impl Task {
    /// Command name, used in task-error reporting.
    pub fn command(&self) -> &'static str {
        match self {
            Task::Send { .. } => "send",
            Task::Receive { .. } => "receive",
            Task::SendEphemeral { .. } => "send-ephemeral",
        }
    }
}
