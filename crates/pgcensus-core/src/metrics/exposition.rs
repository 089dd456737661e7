//! Prometheus gauges for the connection census.

use std::time::Duration;

use prometheus::{Encoder, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

use super::MetricObservation;

pub const NAMESPACE: &str = "pg";
pub const SUBSYSTEM: &str = "cluster";
pub const NAME: &str = "processlist_info";
/// Fully-qualified name, `NAMESPACE_SUBSYSTEM_NAME`.
pub const METRIC_NAME: &str = "pg_cluster_processlist_info";
pub const LABELS: [&str; 3] = ["type", "category", "sign"];

const HELP: &str = "Connections grouped by user, client host and database; \
                    sign=total counts every session, sign=active only those running a query.";

/// Metric descriptors, built once at startup and shared by reference.
#[derive(Clone)]
pub struct CensusMetrics {
    registry: Registry,
    connections: GaugeVec,
    last_scrape_error: Gauge,
    last_scrape_duration: Gauge,
    scrape_errors: IntCounterVec,
}

impl CensusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let connections = GaugeVec::new(
            Opts::new(NAME, HELP).namespace(NAMESPACE).subsystem(SUBSYSTEM),
            &LABELS,
        )?;
        let last_scrape_error = Gauge::with_opts(
            Opts::new(
                "last_scrape_error",
                "Whether the last scrape of metrics from PostgreSQL resulted in an error (1 for error, 0 for success).",
            )
            .namespace(NAMESPACE)
            .subsystem("exporter"),
        )?;
        let last_scrape_duration = Gauge::with_opts(
            Opts::new(
                "last_scrape_duration_seconds",
                "Duration of the last scrape of metrics from PostgreSQL.",
            )
            .namespace(NAMESPACE)
            .subsystem("exporter"),
        )?;
        let scrape_errors = IntCounterVec::new(
            Opts::new(
                "scrape_errors_total",
                "Total number of times an error occurred scraping a PostgreSQL collector.",
            )
            .namespace(NAMESPACE)
            .subsystem("exporter"),
            &["collector"],
        )?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(last_scrape_error.clone()))?;
        registry.register(Box::new(last_scrape_duration.clone()))?;
        registry.register(Box::new(scrape_errors.clone()))?;

        Ok(Self {
            registry,
            connections,
            last_scrape_error,
            last_scrape_duration,
            scrape_errors,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Replaces the census gauges with the observations of one successful scrape.
    pub fn publish(&self, observations: &[MetricObservation]) {
        self.connections.reset();
        for observation in observations {
            self.connections
                .with_label_values(&observation.label_values())
                .set(observation.value);
        }
        self.last_scrape_error.set(0.0);
    }

    /// Records a failed scrape. Census gauges are cleared so no stale series survives.
    pub fn record_failure(&self, collector: &str) {
        self.connections.reset();
        self.last_scrape_error.set(1.0);
        self.scrape_errors.with_label_values(&[collector]).inc();
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.last_scrape_duration.set(elapsed.as_secs_f64());
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
