//! Connection census collector.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ConnectionCensus                      │
//! │   (Scraper: name / help / minimum_version / scrape)      │
//! │                                                          │
//! │   rows ──► sanitize / normalize ──► by_user              │
//! │                                     by_host    ──► sink  │
//! │                                     by_database          │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │
//!                     ┌────────▼────────┐
//!                     │  CensusSource   │ (trait)
//!                     └────────┬────────┘
//!                              │
//!                  ┌───────────┴───────────┐
//!           ┌──────▼───────┐        ┌──────▼──────┐
//!           │PostgresSource│        │ MockSource  │
//!           │ (postgres)   │        │ (Testing)   │
//!           └──────────────┘        └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use pgcensus_core::collector::{ConnectionCensus, MockSource, Scraper};
//! use pgcensus_core::metrics::MetricObservation;
//!
//! let mut source = MockSource::typical_cluster();
//! let mut observations: Vec<MetricObservation> = Vec::new();
//! ConnectionCensus.scrape(&mut source, &mut observations).unwrap();
//! assert!(!observations.is_empty());
//! ```

pub mod census;
pub mod mock;
mod scraper;
mod source;

pub use census::{Census, ConnectionCensus, ConnectionCounts, GroupTally};
pub use mock::MockSource;
pub use scraper::{ScrapeError, Scraper};
pub use source::{
    CENSUS_COLUMNS, CensusCursor, CensusSource, ConnectionRecord, PostgresSource, SourceError,
    version_from_num,
};
