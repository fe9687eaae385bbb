//! Core types and utilities for the Tidelog transaction log.
//!
//! This crate provides the building blocks shared by all Tidelog components:
//! - Configuration management
//! - The error taxonomy used across the commit/peek/pop state machines
//! - Common data types (versions, team and group ids, spill modes)
//! - The packed message codec carried inside commit payloads

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod message;
pub mod types;

pub use config::{Config, LogConfig, ServerConfig, StorageConfig};
pub use error::{Error, Result};
pub use types::{
    Epoch, LogId, SpillType, StorageTeamId, Subsequence, Tag, TLogGroupId, Version, TXS_TEAM,
};
