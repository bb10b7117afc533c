//! Persistence: encrypted node credentials, plain-JSON settings, the
//! in-memory history ring, and the sealed config export bundle.
//!
//! Everything on disk lives under one data directory (spec layout:
//! `nodes.enc`, `.encryption.key`, `system.json`, `thresholds.json`,
//! `overrides.json`, `webhooks.json`). Writes are atomic: tmp file,
//! fsync, rename.

pub mod crypto;
pub mod error;
pub mod export;
pub mod history;
pub mod nodes;
pub mod system;

pub use error::{StoreError, StoreResult};
pub use history::HistoryRing;
pub use nodes::{NodeStore, NodeView};
