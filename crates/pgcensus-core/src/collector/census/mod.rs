//! Connection census: sessions per user, client host and database.
//!
//! Each scrape runs one query over `pg_stat_activity` and folds the rows into
//! three independent tallies. Every key carries a `total` counter and an
//! `active` counter (sessions whose state maps to `query`). Nothing is kept
//! between scrapes.
//!
//! A row that fails to fetch or decode aborts the whole scrape before any
//! observation is emitted; a partial census would undercount.

mod queries;
mod sanitize;

use std::collections::HashMap;

use tracing::debug;

use super::scraper::{ScrapeError, Scraper};
use super::source::{CensusCursor, CensusSource, ConnectionRecord};
use crate::metrics::{GroupType, MetricObservation, ObservationSink, Sign};

pub use queries::build_census_query as census_query;
pub use sanitize::{UNKNOWN, normalize_database, normalize_host, sanitize_label};

/// Sanitized command of a session that is running a query.
const ACTIVE_COMMAND: &str = "query";

/// Counters for one group key. `active <= total` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionCounts {
    pub total: u64,
    pub active: u64,
}

/// Counters per group key for one dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupTally {
    counts: HashMap<String, ConnectionCounts>,
}

impl GroupTally {
    fn record(&mut self, key: &str, active: bool) {
        let counts = self.counts.entry(key.to_string()).or_default();
        counts.total += 1;
        if active {
            counts.active += 1;
        }
    }

    pub fn get(&self, key: &str) -> Option<ConnectionCounts> {
        self.counts.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterates keys in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ConnectionCounts)> {
        self.counts.iter().map(|(key, counts)| (key.as_str(), *counts))
    }
}

/// Result of one census pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Census {
    pub by_user: GroupTally,
    pub by_host: GroupTally,
    pub by_database: GroupTally,
}

impl Census {
    /// Normalizes a row and counts it in all three tallies.
    pub fn record(&mut self, record: &ConnectionRecord) {
        let active = sanitize_label(&record.command) == ACTIVE_COMMAND;

        self.by_user.record(&record.user, active);
        self.by_host.record(normalize_host(&record.host), active);
        self.by_database
            .record(normalize_database(record.database.as_deref()), active);
    }

    pub fn tally(&self, group: GroupType) -> &GroupTally {
        match group {
            GroupType::User => &self.by_user,
            GroupType::Host => &self.by_host,
            GroupType::Db => &self.by_database,
        }
    }

    /// Two observations (total, active) per key of every tally.
    pub fn observations(&self) -> impl Iterator<Item = MetricObservation> + '_ {
        GroupType::ALL.into_iter().flat_map(move |group| {
            self.tally(group).iter().flat_map(move |(key, counts)| {
                [
                    MetricObservation::new(group, key, Sign::Total, counts.total as f64),
                    MetricObservation::new(group, key, Sign::Active, counts.active as f64),
                ]
            })
        })
    }

    /// Hands every observation to `sink`, returning how many were emitted.
    pub fn emit(&self, sink: &mut dyn ObservationSink) -> usize {
        let mut emitted = 0;
        for observation in self.observations() {
            sink.observe(observation);
            emitted += 1;
        }
        emitted
    }
}

/// Collector counting sessions per user, client host and database.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionCensus;

impl ConnectionCensus {
    /// Runs the census query and aggregates every row.
    ///
    /// The cursor is closed on every return path.
    pub fn collect(&self, source: &mut dyn CensusSource) -> Result<Census, ScrapeError> {
        let query = census_query(source.server_version());
        let mut cursor = source.open_cursor(&query)?;

        let mut census = Census::default();
        let result = fold_rows(cursor.as_mut(), &mut census);
        cursor.close();
        result?;

        Ok(census)
    }
}

fn fold_rows(
    cursor: &mut (dyn CensusCursor + '_),
    census: &mut Census,
) -> Result<(), ScrapeError> {
    while let Some(record) = cursor.next_record()? {
        census.record(&record);
    }
    Ok(())
}

impl Scraper for ConnectionCensus {
    fn name(&self) -> &'static str {
        "processlist"
    }

    fn help(&self) -> &'static str {
        "Collect connection counts per user, client host and database from pg_stat_activity"
    }

    fn minimum_version(&self) -> f64 {
        // pg_stat_activity.state appeared in 9.2.
        9.2
    }

    fn scrape(
        &self,
        source: &mut dyn CensusSource,
        sink: &mut dyn ObservationSink,
    ) -> Result<(), ScrapeError> {
        let census = self.collect(source)?;
        let emitted = census.emit(sink);
        debug!(
            users = census.by_user.len(),
            hosts = census.by_host.len(),
            databases = census.by_database.len(),
            observations = emitted,
            "connection census scraped"
        );
        Ok(())
    }
}
