//! Orchestration services, leaves first
//!
//! parameter registry / recording catalog → identity resolver → job store →
//! sorter trigger → result ingestor → quality metrics

pub mod identity_resolver;
pub mod job_store;
pub mod name_adapter;
pub mod parameter_registry;
pub mod quality_metrics;
pub mod recording_catalog;
pub mod result_ingestor;
pub mod sorter_catalog;
pub mod sorter_trigger;

pub use identity_resolver::{compute_identity, IdentityResolver, ResolvedIdentity};
pub use job_store::{JobStore, StaleRecovery};
pub use name_adapter::{AdapterConfig, AdapterRegistry, NameAdapter};
pub use parameter_registry::ParameterRegistry;
pub use quality_metrics::{MetricParams, MetricSet, QualityMetricsEngine, UnitMetric};
pub use recording_catalog::RecordingCatalog;
pub use result_ingestor::ResultIngestor;
pub use sorter_catalog::{SorterCatalog, SorterTool};
pub use sorter_trigger::{SorterTrigger, TriggerOutcome, TriggerSettings};
