//! # tandem-store — durable, observable key-value state for a two-party session
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  DataChanged   ┌──────────────┐
//! │ ReplicatedStore  │ ─────────────► │ subscribers  │
//! │ (version guard)  │   broadcast    │ (sync, UI)   │
//! └────────┬─────────┘                └──────────────┘
//!          │ {value, version}
//!          ▼
//! ┌──────────────────┐
//! │ PersistentMap    │  CF "entries" — LZ4-compressed JSON records
//! │ (RocksDB)        │
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`map`] — dumb durable dictionary, no versioning logic
//! - [`version`] — opaque per-write version tokens
//! - [`observable`] — version assignment, echo suppression, change events

pub mod map;
pub mod observable;
pub mod version;

pub use map::{Entry, PersistentMap, StoreConfig, StoreError};
pub use observable::{DataChanged, ReplicatedStore};
pub use version::Version;
