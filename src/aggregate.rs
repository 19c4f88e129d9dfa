use std::{fmt::Debug, time::Duration};

use hdrhistogram::Histogram;

use crate::metric::{
    percentile_key, CounterSummary, GaugeSummary, MetricKind, MetricSummary, RateSummary,
    TrendSummary, DEFAULT_PERCENTILES,
};

/// The `Aggregate` trait defines how raw samples of one metric are folded into a
/// compact representation.
///
/// Aggregates store what is needed to derive final statistics later (counts, sums,
/// retained samples, histograms). Deriving those statistics is done once, in
/// [`Aggregate::summarize`], which produces the serializable summary that thresholds
/// and reports work from.
///
/// # Implementor notes
/// - The summary must not depend on the order samples were consumed in.
/// - `consume` sits on the hot path of every virtual user. Keep it allocation-light.
pub trait Aggregate
where
    Self: Send + Sync + Debug + Clone,
{
    /// Summary type derived from this aggregate.
    type Summary;

    /// Incorporate a single sample.
    fn consume(&mut self, sample: f64);

    /// Derive the final statistics.
    fn summarize(&self, ctx: &SummaryContext<'_>) -> Self::Summary;
}

/// Inputs a summary may need besides the aggregate itself.
#[derive(Clone, Copy, Debug)]
pub struct SummaryContext<'a> {
    /// Time elapsed since the run started, used for per-second rates.
    pub elapsed: Duration,
    /// Percentiles to compute on top of [`DEFAULT_PERCENTILES`].
    pub percentiles: &'a [f64],
}

/// Largest latency the histogram tracks, in microseconds (one day).
const HISTOGRAM_MAX_MICROS: u64 = 86_400_000_000;
const HISTOGRAM_SIGFIG: u8 = 3;

/// Distribution of non-negative samples, in milliseconds by convention.
///
/// Samples are retained exactly up to `exact_limit`; percentiles are then computed by
/// sorting. Past the limit the retained samples are folded into an HDR histogram
/// (3 significant digits) and dropped, which bounds memory for very long runs.
#[derive(Clone, Debug)]
pub struct TrendAggregate {
    samples: Option<Vec<f64>>,
    histogram: Option<Histogram<u64>>,
    exact_limit: usize,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendAggregate {
    pub fn new(exact_limit: usize) -> Self {
        Self {
            samples: Some(Vec::new()),
            histogram: None,
            exact_limit,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.histogram.is_none()
    }

    fn to_micros(sample: f64) -> u64 {
        ((sample * 1000.0).round() as u64).clamp(1, HISTOGRAM_MAX_MICROS)
    }

    /// Moves retained samples into a histogram. Keeps the exact samples if the
    /// histogram cannot be built.
    fn spill(&mut self) {
        let mut histogram =
            match Histogram::<u64>::new_with_bounds(1, HISTOGRAM_MAX_MICROS, HISTOGRAM_SIGFIG) {
                Ok(h) => h,
                Err(e) => {
                    tracing::error!("Cannot build trend histogram, keeping exact samples: {e}");
                    return;
                }
            };
        for s in self.samples.take().unwrap_or_default() {
            histogram.saturating_record(Self::to_micros(s));
        }
        self.histogram = Some(histogram);
    }

    fn quantile(&self, sorted: Option<&[f64]>, q: f64) -> f64 {
        match (sorted, &self.histogram) {
            (Some(sorted), _) => exact_percentile(sorted, q),
            (None, Some(h)) => h.value_at_quantile(q / 100.0) as f64 / 1000.0,
            (None, None) => 0.0,
        }
    }
}

/// Linear interpolation between the closest ranks. `sorted` must be ascending.
pub fn exact_percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (q.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

impl Aggregate for TrendAggregate {
    type Summary = TrendSummary;

    fn consume(&mut self, sample: f64) {
        self.count += 1;
        self.sum += sample;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);

        if let Some(h) = self.histogram.as_mut() {
            h.saturating_record(Self::to_micros(sample));
            return;
        }
        if let Some(samples) = self.samples.as_mut() {
            samples.push(sample);
            if samples.len() > self.exact_limit {
                tracing::debug!(
                    "Trend went over {} exact samples, switching to histogram",
                    self.exact_limit
                );
                self.spill();
            }
        }
    }

    fn summarize(&self, ctx: &SummaryContext<'_>) -> TrendSummary {
        if self.count == 0 {
            return TrendSummary {
                exact: self.is_exact(),
                ..TrendSummary::default()
            };
        }

        let sorted = self.samples.as_ref().filter(|_| self.is_exact()).map(|s| {
            let mut sorted = s.clone();
            sorted.sort_by(f64::total_cmp);
            sorted
        });

        let percentiles = DEFAULT_PERCENTILES
            .iter()
            .chain(ctx.percentiles)
            .map(|q| (percentile_key(*q), self.quantile(sorted.as_deref(), *q)))
            .collect();

        TrendSummary {
            count: self.count,
            min: self.min,
            max: self.max,
            avg: self.sum / self.count as f64,
            med: self.quantile(sorted.as_deref(), 50.0),
            percentiles,
            exact: self.is_exact(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CounterAggregate {
    count: u64,
    total: f64,
}

impl Aggregate for CounterAggregate {
    type Summary = CounterSummary;

    fn consume(&mut self, sample: f64) {
        self.count += 1;
        self.total += sample;
    }

    fn summarize(&self, ctx: &SummaryContext<'_>) -> CounterSummary {
        let secs = ctx.elapsed.as_secs_f64();
        CounterSummary {
            count: self.count,
            total: self.total,
            rate: if secs > 0.0 { self.total / secs } else { 0.0 },
        }
    }
}

/// Last-writer-wins value.
#[derive(Clone, Debug, Default)]
pub struct GaugeAggregate {
    value: f64,
    min: Option<f64>,
    max: Option<f64>,
    count: u64,
}

impl Aggregate for GaugeAggregate {
    type Summary = GaugeSummary;

    fn consume(&mut self, sample: f64) {
        self.value = sample;
        self.min = Some(self.min.map_or(sample, |m| m.min(sample)));
        self.max = Some(self.max.map_or(sample, |m| m.max(sample)));
        self.count += 1;
    }

    fn summarize(&self, _: &SummaryContext<'_>) -> GaugeSummary {
        GaugeSummary {
            value: self.value,
            min: self.min.unwrap_or_default(),
            max: self.max.unwrap_or_default(),
            count: self.count,
        }
    }
}

/// Fraction of non-zero samples.
#[derive(Clone, Debug, Default)]
pub struct RateAggregate {
    total: u64,
    passes: u64,
}

impl Aggregate for RateAggregate {
    type Summary = RateSummary;

    fn consume(&mut self, sample: f64) {
        self.total += 1;
        if sample != 0.0 {
            self.passes += 1;
        }
    }

    fn summarize(&self, _: &SummaryContext<'_>) -> RateSummary {
        RateSummary {
            total: self.total,
            passes: self.passes,
            rate: if self.total > 0 {
                self.passes as f64 / self.total as f64
            } else {
                0.0
            },
        }
    }
}

/// One aggregate of any kind, as stored by the collector.
#[derive(Clone, Debug)]
pub(crate) enum AnyAggregate {
    Trend(TrendAggregate),
    Counter(CounterAggregate),
    Gauge(GaugeAggregate),
    Rate(RateAggregate),
}

impl AnyAggregate {
    pub(crate) fn new(kind: MetricKind, exact_limit: usize) -> Self {
        match kind {
            MetricKind::Trend => AnyAggregate::Trend(TrendAggregate::new(exact_limit)),
            MetricKind::Counter => AnyAggregate::Counter(CounterAggregate::default()),
            MetricKind::Gauge => AnyAggregate::Gauge(GaugeAggregate::default()),
            MetricKind::Rate => AnyAggregate::Rate(RateAggregate::default()),
        }
    }

    pub(crate) fn consume(&mut self, sample: f64) {
        match self {
            AnyAggregate::Trend(a) => a.consume(sample),
            AnyAggregate::Counter(a) => a.consume(sample),
            AnyAggregate::Gauge(a) => a.consume(sample),
            AnyAggregate::Rate(a) => a.consume(sample),
        }
    }

    pub(crate) fn summarize(&self, ctx: &SummaryContext<'_>) -> MetricSummary {
        match self {
            AnyAggregate::Trend(a) => MetricSummary::Trend(a.summarize(ctx)),
            AnyAggregate::Counter(a) => MetricSummary::Counter(a.summarize(ctx)),
            AnyAggregate::Gauge(a) => MetricSummary::Gauge(a.summarize(ctx)),
            AnyAggregate::Rate(a) => MetricSummary::Rate(a.summarize(ctx)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    fn fill<A: Aggregate>(aggregate: &mut A, samples: &[f64]) {
        samples.iter().for_each(|s| aggregate.consume(*s));
    }

    fn ctx(elapsed: Duration) -> SummaryContext<'static> {
        SummaryContext {
            elapsed,
            percentiles: &[],
        }
    }

    #[test]
    fn trend_exact_statistics() {
        let mut trend = TrendAggregate::new(1_000);
        fill(&mut trend, &[100.0, 200.0, 300.0]);
        let s = trend.summarize(&ctx(Duration::from_secs(1)));

        assert_eq!(s.count, 3);
        assert_eq!(s.avg, 200.0);
        assert_eq!(s.min, 100.0);
        assert_eq!(s.max, 300.0);
        assert_eq!(s.med, 200.0);
        assert!((s.percentile(95.0).unwrap() - 290.0).abs() < 1e-9);
        assert!(s.exact);
    }

    #[test]
    fn trend_requested_percentiles_are_computed() {
        let mut trend = TrendAggregate::new(1_000);
        fill(&mut trend, &(1..=1000).map(f64::from).collect::<Vec<_>>());
        let s = trend.summarize(&SummaryContext {
            elapsed: Duration::ZERO,
            percentiles: &[99.9],
        });
        let p999 = s.percentile(99.9).unwrap();
        assert!((p999 - 999.001).abs() < 1e-6, "{p999}");
    }

    #[test]
    fn trend_spills_into_histogram_past_the_limit() {
        let mut trend = TrendAggregate::new(10);
        fill(&mut trend, &(1..=100).map(f64::from).collect::<Vec<_>>());
        assert!(!trend.is_exact());

        let s = trend.summarize(&ctx(Duration::ZERO));
        assert_eq!(s.count, 100);
        assert_eq!(s.avg, 50.5);
        // 3 significant digits
        assert!((s.med - 50.0).abs() <= 1.0, "{}", s.med);
        assert!((s.percentile(95.0).unwrap() - 95.0).abs() <= 1.0);
        assert!(!s.exact);
    }

    #[test]
    fn empty_trend_summarizes_to_zero() {
        let s = TrendAggregate::new(10).summarize(&ctx(Duration::ZERO));
        assert_eq!(s.count, 0);
        assert_eq!(s.avg, 0.0);
    }

    #[test]
    fn counter_rate_is_per_second() {
        let mut counter = CounterAggregate::default();
        fill(&mut counter, &[1.0; 10]);
        let s = counter.summarize(&ctx(Duration::from_secs(5)));
        assert_eq!(s.count, 10);
        assert_eq!(s.total, 10.0);
        assert_eq!(s.rate, 2.0);
    }

    #[test]
    fn counter_rate_with_no_elapsed_time() {
        let mut counter = CounterAggregate::default();
        counter.consume(3.0);
        assert_eq!(counter.summarize(&ctx(Duration::ZERO)).rate, 0.0);
    }

    #[test]
    fn gauge_keeps_last_value() {
        let mut gauge = GaugeAggregate::default();
        fill(&mut gauge, &[5.0, 1.0, 3.0]);
        let s = gauge.summarize(&ctx(Duration::ZERO));
        assert_eq!(s.value, 3.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 5.0);
    }

    #[test]
    fn rate_counts_non_zero_samples() {
        let mut rate = RateAggregate::default();
        fill(&mut rate, &[1.0, 0.0, 0.0, 1.0]);
        let s = rate.summarize(&ctx(Duration::ZERO));
        assert_eq!(s.passes, 2);
        assert_eq!(s.rate, 0.5);
    }

    proptest! {
        #[test]
        fn percentiles_are_ordered(samples in prop::collection::vec(0.0f64..10_000.0, 1..500)) {
            let mut trend = TrendAggregate::new(1_000);
            fill(&mut trend, &samples);
            let s = trend.summarize(&ctx(Duration::ZERO));
            let p50 = s.percentile(50.0).unwrap();
            let p95 = s.percentile(95.0).unwrap();
            prop_assert!(p50 >= 0.0);
            prop_assert!(p95 >= p50);
        }

        #[test]
        fn summary_ignores_recording_order(
            samples in prop::collection::vec(0.0f64..10_000.0, 1..300),
            seed in any::<u64>(),
        ) {
            let mut forward = TrendAggregate::new(1_000);
            fill(&mut forward, &samples);

            let mut reversed: Vec<f64> = samples.clone();
            reversed.reverse();
            let mut backward = TrendAggregate::new(1_000);
            fill(&mut backward, &reversed);

            let mut shuffled = samples.clone();
            shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
            let mut mixed = TrendAggregate::new(1_000);
            fill(&mut mixed, &shuffled);

            let a = forward.summarize(&ctx(Duration::ZERO));
            let b = backward.summarize(&ctx(Duration::ZERO));
            let c = mixed.summarize(&ctx(Duration::ZERO));
            prop_assert_eq!(&a.percentiles, &b.percentiles);
            prop_assert_eq!(&a.percentiles, &c.percentiles);
            prop_assert_eq!(a.min, c.min);
            prop_assert_eq!(a.max, c.max);
        }
    }
}
