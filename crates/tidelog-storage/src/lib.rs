//! Storage engines for the Tidelog transaction log.
//!
//! This crate provides:
//! - An append-only, crash-safe byte queue over two physical files
//! - Record framing with atomic append/commit semantics on top of it
//! - A redb-backed ordered key/value store for metadata and spilled messages
//! - The persistent key families shared by the log server

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod disk_queue;
pub mod framed;
pub mod keys;
pub mod kv;

#[cfg(test)]
mod durability_tests;

pub use disk_queue::{DiskQueue, Location};
pub use framed::{FramedQueue, FramedRecord};
pub use kv::KeyValueStore;
