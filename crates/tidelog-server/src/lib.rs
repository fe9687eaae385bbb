//! The Tidelog transaction log server.
//!
//! This crate provides the TLog storage engine and its commit/peek/pop
//! state machines:
//! - per-generation in-memory team indexes over shared message blocks
//! - per-group persistence (framed disk queue + KV store) with the
//!   queue-commit loop and cross-generation pop/spill ordering
//! - the process shell accepting generation recruitments
//! - the wire protocol and its TCP hosting

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod generation;
pub mod group;
pub mod net;
pub mod notify;
pub mod protocol;
pub mod server;

pub use generation::GenerationData;
pub use group::{GroupData, QueueEntry};
pub use protocol::{InitializeTLogRequest, TLogGroupRecruitment, TLogInterface};
pub use server::{ClusterInfo, RecoveryState, ServerData, ServerHandle};
