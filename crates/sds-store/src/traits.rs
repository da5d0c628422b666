//! Storage trait: the abstract key-value interface consumed by the
//! persisted history variant.
//!
//! Any string-keyed store (browser local storage behind FFI, a file, an
//! embedded KV) can satisfy this. Implementations here are in-memory (for
//! tests and ephemeral channels) and SQLite (primary durable backend).
//!
//! The contract is synchronous: the channel relies on storage writes
//! completing before the mutating call returns, so no partial-write state is
//! ever observable. A failing backend is not fatal to the caller — the
//! persisted history degrades to in-memory behavior for that call.

use crate::error::Result;

/// A string-keyed, string-valued storage backend.
///
/// Methods take `&self`; implementations provide interior mutability and
/// must be safe to share across channels as long as keys are namespaced per
/// channel (which the history layer guarantees).
pub trait Storage: Send + Sync {
    /// Fetch the value under `key`, or `None` if absent.
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Remove the value under `key`. Removing an absent key is not an error.
    fn remove_item(&self, key: &str) -> Result<()>;
}
