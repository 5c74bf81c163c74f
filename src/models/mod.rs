//! Data models for db-keepalive.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;

// Re-export commonly used types
pub use connection::{BackendKind, ConnectionKey, ConnectionMode, ConnectionParams};
