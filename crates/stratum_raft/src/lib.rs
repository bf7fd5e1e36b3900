//! Multi-group raft consensus crate.
//!
//! This crate provides the consensus layer used by stratum_store. The API
//! surface is intentionally small: higher layers supply a `Storage`, a
//! `Transport`, and optionally a `CommandApplier`, then drive proposals
//! through the `MultiRaft` handle.

pub mod raft;
