//! ephys-sort library interface
//!
//! Spike-sorting job orchestration: content-addressed job identities,
//! memoized and resumable sorter runs, result ingestion and quality metrics.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod utils;

pub use crate::error::{FailureKind, Result, SortError};
pub use crate::pipeline::{BatchReport, JobOutcome, Pipeline};
