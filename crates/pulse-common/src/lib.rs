//! Shared data model for the pulse monitoring aggregator.
//!
//! Everything that crosses a crate boundary lives here: the merged
//! [`types::Snapshot`], the per-node configuration record, alert types,
//! and the lenient decoders that absorb Proxmox API shape drift.

pub mod id;
pub mod lenient;
pub mod types;
