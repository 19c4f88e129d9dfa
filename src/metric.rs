use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// The kind of a metric, fixed the first time the metric is registered.
///
/// - `Trend`: a distribution of real-valued samples (latencies in milliseconds).
/// - `Counter`: a monotonic sum, with the number of additions tracked next to it.
/// - `Gauge`: the last written value wins; min and max are kept alongside.
/// - `Rate`: the fraction of recorded samples that were non-zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Trend,
    Counter,
    Gauge,
    Rate,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Trend => "trend",
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Rate => "rate",
        };
        f.write_str(s)
    }
}

/// Metrics every run registers before the first virtual user starts.
pub mod builtin {
    use super::MetricKind;

    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const ERRORS: &str = "errors";
    pub const CHECKS: &str = "checks";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const INTERRUPTED_ITERATIONS: &str = "interrupted_iterations";
    pub const GROUP_DURATION: &str = "group_duration";
    pub const VUS: &str = "vus";
    pub const VUS_MAX: &str = "vus_max";

    pub const ALL: [(&str, MetricKind); 11] = [
        (HTTP_REQS, MetricKind::Counter),
        (HTTP_REQ_DURATION, MetricKind::Trend),
        (HTTP_REQ_FAILED, MetricKind::Rate),
        (ERRORS, MetricKind::Counter),
        (CHECKS, MetricKind::Rate),
        (ITERATIONS, MetricKind::Counter),
        (ITERATION_DURATION, MetricKind::Trend),
        (INTERRUPTED_ITERATIONS, MetricKind::Counter),
        (GROUP_DURATION, MetricKind::Trend),
        (VUS, MetricKind::Gauge),
        (VUS_MAX, MetricKind::Gauge),
    ];

    pub fn kind_of(name: &str) -> Option<MetricKind> {
        ALL.iter().find(|(n, _)| *n == name).map(|(_, k)| *k)
    }

    /// Per-group trend, e.g. `group_duration{group:checkout}`.
    pub fn group_duration(group: &str) -> String {
        format!("{GROUP_DURATION}{{group:{group}}}")
    }
}

/// Percentiles every trend summary carries, whatever the thresholds ask for.
pub const DEFAULT_PERCENTILES: [f64; 4] = [50.0, 90.0, 95.0, 99.0];

/// Key under which a percentile is stored in [`TrendSummary::percentiles`], e.g. `p(95)`.
pub fn percentile_key(q: f64) -> String {
    if q.fract() == 0.0 {
        format!("p({q:.0})")
    } else {
        format!("p({q})")
    }
}

/// Point-in-time summary of a single metric.
///
/// This is what thresholds are evaluated against; the raw samples never leave the
/// collector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricSummary {
    Trend(TrendSummary),
    Counter(CounterSummary),
    Gauge(GaugeSummary),
    Rate(RateSummary),
}

impl MetricSummary {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSummary::Trend(_) => MetricKind::Trend,
            MetricSummary::Counter(_) => MetricKind::Counter,
            MetricSummary::Gauge(_) => MetricKind::Gauge,
            MetricSummary::Rate(_) => MetricKind::Rate,
        }
    }

    /// Number of times the metric was written to.
    pub fn samples(&self) -> u64 {
        match self {
            MetricSummary::Trend(t) => t.count,
            MetricSummary::Counter(c) => c.count,
            MetricSummary::Gauge(g) => g.count,
            MetricSummary::Rate(r) => r.total,
        }
    }

    /// Whether there is a value to evaluate. A counter starts at zero and always has
    /// one; the other kinds need at least one sample.
    pub fn has_value(&self) -> bool {
        matches!(self, MetricSummary::Counter(_)) || self.samples() > 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub med: f64,
    /// Percentile values keyed by [`percentile_key`].
    pub percentiles: BTreeMap<String, f64>,
    /// `false` once the sample count went over the exact-sample limit and percentiles
    /// come from the histogram.
    pub exact: bool,
}

impl TrendSummary {
    pub fn percentile(&self, q: f64) -> Option<f64> {
        self.percentiles.get(&percentile_key(q)).copied()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterSummary {
    /// Number of `record` calls.
    pub count: u64,
    /// Sum of every recorded value.
    pub total: f64,
    /// `total` per second of run time.
    pub rate: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GaugeSummary {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RateSummary {
    pub total: u64,
    pub passes: u64,
    /// `passes / total`, `0` when nothing was recorded.
    pub rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_keys() {
        assert_eq!(percentile_key(95.0), "p(95)");
        assert_eq!(percentile_key(99.9), "p(99.9)");
        assert_eq!(percentile_key(0.0), "p(0)");
    }

    #[test]
    fn summary_serializes_with_kind_tag() {
        let summary = MetricSummary::Rate(RateSummary {
            total: 4,
            passes: 1,
            rate: 0.25,
        });
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["kind"], "rate");
        assert_eq!(json["rate"], 0.25);
    }
}
