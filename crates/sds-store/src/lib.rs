//! # SDS Store
//!
//! Storage abstraction for SDS channels: a string-keyed [`Storage`] trait
//! with in-memory and SQLite backends, and the bounded [`LocalHistory`] of
//! content messages (in-memory or persisted through any backend).
//!
//! ## Key Types
//!
//! - [`Storage`] - The `get_item`/`set_item`/`remove_item` contract
//! - [`MemoryStorage`] / [`SqliteStorage`] - Backends
//! - [`LocalHistory`] - Bounded FIFO history contract
//! - [`MemoryHistory`] / [`PersistentHistory`] - History variants

pub mod error;
pub mod history;
pub mod memory;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use history::{LocalHistory, MemoryHistory, PersistentHistory, DEFAULT_MAX_SIZE};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use traits::Storage;
