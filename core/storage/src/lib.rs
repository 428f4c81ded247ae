//! Durable key-value storage for Lifetrack.
//!
//! The sync engine only needs "a place to put bytes under a key that
//! survives a restart". This crate provides that capability as a trait with
//! an in-memory implementation for tests and a filesystem implementation
//! for real use.

pub mod provider;
pub mod memory;
pub mod local;

pub use provider::{load_json, save_json, KeyValueStore};
pub use memory::MemoryStore;
pub use local::FileStore;
