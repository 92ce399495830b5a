//! Shared foundation for the tunesync services
//!
//! Provides the common error type, configuration loading, the TTL cache
//! abstraction, and SQLite pool initialization used by the callback
//! ingestion service.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;

pub use crate::error::{Error, Result};
