//! # Ephys Common Library
//!
//! Shared code for the spike-sorting orchestration crates:
//! - Error type shared by database and configuration helpers
//! - Configuration loading (TOML, environment, compiled defaults)
//! - SQLite initialization, schema and migrations
//! - Canonical JSON hashing used for content addressing
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod hash;
pub mod time;

pub use error::{Error, Result};
