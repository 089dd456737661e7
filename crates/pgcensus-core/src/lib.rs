//! pgcensus-core: connection census collector for PostgreSQL exporters.
//!
//! Provides:
//! - `collector`: the census collector, its query executors and the scraper interface
//! - `metrics`: observations, sinks and Prometheus exposition

pub mod collector;
pub mod metrics;
