//! Scraper interface shared by every collector an exporter host can schedule.

use super::source::CensusSource;
use crate::metrics::ObservationSink;

/// Error type for a single scrape cycle.
///
/// Both variants are terminal for the cycle: nothing is emitted and the
/// caller decides whether to log, count or retry on the next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeError {
    /// The census query could not be executed or its rows could not be fetched.
    Query(String),
    /// A returned row did not match the expected column shape or types.
    Decode {
        /// 1-based position of the offending row in the result set.
        row: usize,
        message: String,
    },
}

impl std::fmt::Display for ScrapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScrapeError::Query(msg) => write!(f, "census query error: {}", msg),
            ScrapeError::Decode { row, message } => {
                write!(f, "census decode error at row {}: {}", row, message)
            }
        }
    }
}

impl std::error::Error for ScrapeError {}

/// A named, versioned collector.
///
/// Object-safe so a host can keep a `Vec<Box<dyn Scraper>>` and invoke each
/// collector against its own source once per scrape cycle.
pub trait Scraper: Send + Sync {
    /// Stable identifier, used as the `collector` label on scrape errors.
    fn name(&self) -> &'static str;

    /// Human-readable description.
    fn help(&self) -> &'static str;

    /// Lowest server version (`major.minor`) this collector supports.
    fn minimum_version(&self) -> f64;

    /// Returns true if the collector can run against a server of the given version.
    fn supports(&self, server_version: f64) -> bool {
        server_version >= self.minimum_version()
    }

    /// Runs one scrape cycle, handing every observation to `sink`.
    ///
    /// On error no observation reaches the sink.
    fn scrape(
        &self,
        source: &mut dyn CensusSource,
        sink: &mut dyn ObservationSink,
    ) -> Result<(), ScrapeError>;
}
