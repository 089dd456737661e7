//! Observations produced by collectors and the sinks that receive them.
//!
//! A collector emits [`MetricObservation`]s into an [`ObservationSink`]. The
//! daemon buffers them in a `Vec` and, once a scrape succeeded, publishes
//! them through [`CensusMetrics`] as Prometheus gauges.

mod exposition;

use std::sync::mpsc::Sender;

use tracing::debug;

pub use exposition::{CensusMetrics, LABELS, METRIC_NAME, NAMESPACE, NAME, SUBSYSTEM};

/// Dimension a connection was grouped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupType {
    User,
    Host,
    Db,
}

impl GroupType {
    pub const ALL: [GroupType; 3] = [GroupType::User, GroupType::Host, GroupType::Db];

    /// Value of the `type` label.
    pub fn label(self) -> &'static str {
        match self {
            GroupType::User => "user",
            GroupType::Host => "host",
            GroupType::Db => "db",
        }
    }
}

/// Which counter of a group an observation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sign {
    Total,
    Active,
}

impl Sign {
    /// Value of the `sign` label.
    pub fn label(self) -> &'static str {
        match self {
            Sign::Total => "total",
            Sign::Active => "active",
        }
    }
}

/// One gauge sample: `(type, category, sign) = value`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricObservation {
    pub group: GroupType,
    /// Group key, exported as the `category` label.
    pub key: String,
    pub sign: Sign,
    pub value: f64,
}

impl MetricObservation {
    pub fn new(group: GroupType, key: impl Into<String>, sign: Sign, value: f64) -> Self {
        Self {
            group,
            key: key.into(),
            sign,
            value,
        }
    }

    /// Label values in `LABELS` order.
    pub fn label_values(&self) -> [&str; 3] {
        [self.group.label(), self.key.as_str(), self.sign.label()]
    }
}

/// Write-only destination for observations.
pub trait ObservationSink {
    fn observe(&mut self, observation: MetricObservation);
}

impl ObservationSink for Vec<MetricObservation> {
    fn observe(&mut self, observation: MetricObservation) {
        self.push(observation);
    }
}

impl ObservationSink for Sender<MetricObservation> {
    fn observe(&mut self, observation: MetricObservation) {
        if self.send(observation).is_err() {
            debug!("observation receiver dropped, discarding sample");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn labels_match_exported_values() {
        let labels: Vec<&str> = GroupType::ALL.iter().map(|g| g.label()).collect();
        assert_eq!(labels, ["user", "host", "db"]);
        assert_eq!(Sign::Total.label(), "total");
        assert_eq!(Sign::Active.label(), "active");
    }

    #[test]
    fn label_values_follow_label_order() {
        let obs = MetricObservation::new(GroupType::Host, "10.0.0.5", Sign::Active, 3.0);
        assert_eq!(obs.label_values(), ["host", "10.0.0.5", "active"]);
    }

    #[test]
    fn vec_sink_collects_in_order() {
        let mut sink: Vec<MetricObservation> = Vec::new();
        sink.observe(MetricObservation::new(GroupType::User, "a", Sign::Total, 1.0));
        sink.observe(MetricObservation::new(GroupType::User, "a", Sign::Active, 0.0));
        assert_eq!(sink.len(), 2);
        assert_eq!(sink[1].sign, Sign::Active);
    }

    #[test]
    fn channel_sink_forwards_observations() {
        let (mut tx, rx) = mpsc::channel();
        tx.observe(MetricObservation::new(GroupType::Db, "shop", Sign::Total, 4.0));
        drop(tx);
        let received: Vec<MetricObservation> = rx.iter().collect();
        assert_eq!(
            received,
            vec![MetricObservation::new(GroupType::Db, "shop", Sign::Total, 4.0)]
        );
    }

    #[test]
    fn channel_sink_tolerates_dropped_receiver() {
        let (mut tx, rx) = mpsc::channel::<MetricObservation>();
        drop(rx);
        tx.observe(MetricObservation::new(GroupType::Db, "shop", Sign::Total, 4.0));
    }
}
