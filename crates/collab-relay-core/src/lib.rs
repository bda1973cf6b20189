//! Core types, config, errors, wire protocol and shared-store backends for Collab Relay.

pub mod bucket;
pub mod config;
pub mod error;
pub mod memory_store;
pub mod protocol;
pub mod redis_store;
pub mod store;
