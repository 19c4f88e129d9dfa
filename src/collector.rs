use std::{collections::BTreeMap, collections::HashMap, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    aggregate::{AnyAggregate, SummaryContext},
    error::{Error, Result},
    metric::{MetricKind, MetricSummary},
};

/// Default number of exact samples a trend keeps before switching to a histogram.
pub const DEFAULT_EXACT_SAMPLES: usize = 1_000_000;

#[derive(Debug)]
struct Entry {
    kind: MetricKind,
    aggregate: Mutex<AnyAggregate>,
}

/// Thread-safe registry of named metrics for a single run.
///
/// Every metric has its own lock; the registry lock is only taken for writing when a
/// metric is registered. Recording from many virtual users therefore only contends
/// when they write to the *same* metric, and even then only for the few instructions
/// it takes to fold one sample into the aggregate.
#[derive(Debug)]
pub struct Collector {
    metrics: RwLock<HashMap<String, Arc<Entry>>>,
    exact_limit: usize,
    started: Mutex<Instant>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self::with_exact_limit(DEFAULT_EXACT_SAMPLES)
    }

    /// Collector whose trends keep at most `exact_limit` raw samples.
    pub fn with_exact_limit(exact_limit: usize) -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            exact_limit,
            started: Mutex::new(Instant::now()),
        }
    }

    /// Registers `name` as a metric of `kind`.
    ///
    /// Registering the same name with the same kind again is a no-op.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<()> {
        if let Some(entry) = self.metrics.read().get(name) {
            return check_kind(name, entry.kind, kind);
        }

        let mut metrics = self.metrics.write();
        // Another writer may have won the race between the two locks.
        if let Some(entry) = metrics.get(name) {
            return check_kind(name, entry.kind, kind);
        }
        metrics.insert(
            name.to_owned(),
            Arc::new(Entry {
                kind,
                aggregate: Mutex::new(AnyAggregate::new(kind, self.exact_limit)),
            }),
        );
        tracing::debug!("Registered {kind} metric `{name}`");
        Ok(())
    }

    /// Records one sample into an already registered metric.
    ///
    /// Trends append the sample, counters add it, gauges overwrite with it and rates
    /// count it as a pass when it is non-zero.
    pub fn record(&self, name: &str, value: f64) -> Result<()> {
        let entry = self
            .entry(name)
            .ok_or_else(|| Error::UnknownMetric(name.to_owned()))?;
        validate_sample(name, entry.kind, value)?;
        entry.aggregate.lock().consume(value);
        Ok(())
    }

    /// Records into `name`, registering it as `kind` first if needed.
    ///
    /// Fails with [`Error::KindMismatch`] when `name` exists with another kind.
    pub fn record_as(&self, name: &str, kind: MetricKind, value: f64) -> Result<()> {
        let entry = match self.entry(name) {
            Some(entry) => entry,
            None => {
                self.register(name, kind)?;
                self.entry(name)
                    .ok_or_else(|| Error::UnknownMetric(name.to_owned()))?
            }
        };
        check_kind(name, entry.kind, kind)?;
        validate_sample(name, kind, value)?;
        entry.aggregate.lock().consume(value);
        Ok(())
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.metrics.read().get(name).map(|e| e.kind)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.read().contains_key(name)
    }

    /// Drops every recorded sample and restarts the run clock. Registrations are kept.
    pub fn reset(&self) {
        let metrics = self.metrics.read();
        for entry in metrics.values() {
            *entry.aggregate.lock() = AnyAggregate::new(entry.kind, self.exact_limit);
        }
        *self.started.lock() = Instant::now();
    }

    /// Time since the collector was created or last reset.
    pub fn elapsed(&self) -> Duration {
        self.started.lock().elapsed()
    }

    /// Summaries of every metric with the default percentiles.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_with(&[])
    }

    /// Summaries of every metric, computing `percentiles` for trends on top of the
    /// defaults.
    ///
    /// Each metric is copied under its own lock, so every summary is internally
    /// consistent. Once the run has completed and no virtual user is left, the whole
    /// snapshot is.
    pub fn snapshot_with(&self, percentiles: &[f64]) -> Snapshot {
        let elapsed = self.elapsed();
        let ctx = SummaryContext {
            elapsed,
            percentiles,
        };

        let entries: Vec<(String, Arc<Entry>)> = self
            .metrics
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect();

        let metrics = entries
            .into_iter()
            .map(|(name, entry)| {
                let aggregate = entry.aggregate.lock().clone();
                (name, aggregate.summarize(&ctx))
            })
            .collect();

        Snapshot { elapsed, metrics }
    }

    fn entry(&self, name: &str) -> Option<Arc<Entry>> {
        self.metrics.read().get(name).cloned()
    }
}

fn check_kind(name: &str, registered: MetricKind, requested: MetricKind) -> Result<()> {
    if registered == requested {
        Ok(())
    } else {
        Err(Error::KindMismatch {
            name: name.to_owned(),
            registered,
            requested,
        })
    }
}

fn validate_sample(name: &str, kind: MetricKind, value: f64) -> Result<()> {
    let valid = value.is_finite() && (kind != MetricKind::Trend || value >= 0.0);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidSample {
            name: name.to_owned(),
            value,
        })
    }
}

/// Point-in-time copy of every metric of a [`Collector`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Run time covered by the snapshot.
    pub elapsed: Duration,
    pub metrics: BTreeMap<String, MetricSummary>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.get(name)
    }
}
