//! Pass/fail assertions over metric summaries.
//!
//! A [`Threshold`] binds a metric name to one or more assertions written as
//! `<stat> <op> <number>`, e.g. `p(95)<500`, `avg<=200`, `rate<0.01`, `count>10`.
//! Evaluation is a pure function of a [`Snapshot`]: raw samples are never touched.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    collector::Snapshot,
    error::{Error, Result},
    metric::{MetricKind, MetricSummary},
};

/// Statistic an assertion reads from a metric summary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Stat {
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
    Value,
    Percentile(f64),
}

impl Stat {
    pub fn applies_to(self, kind: MetricKind) -> bool {
        use Stat::*;
        match kind {
            MetricKind::Trend => matches!(self, Avg | Min | Max | Med | Count | Percentile(_)),
            MetricKind::Counter => matches!(self, Count | Rate),
            MetricKind::Rate => matches!(self, Rate | Count),
            MetricKind::Gauge => matches!(self, Value | Min | Max),
        }
    }

    /// Reads the statistic, `None` when it does not apply to this kind of metric or
    /// the percentile was not computed.
    pub fn read(self, summary: &MetricSummary) -> Option<f64> {
        match (self, summary) {
            (Stat::Avg, MetricSummary::Trend(t)) => Some(t.avg),
            (Stat::Min, MetricSummary::Trend(t)) => Some(t.min),
            (Stat::Max, MetricSummary::Trend(t)) => Some(t.max),
            (Stat::Med, MetricSummary::Trend(t)) => Some(t.med),
            (Stat::Count, MetricSummary::Trend(t)) => Some(t.count as f64),
            (Stat::Percentile(q), MetricSummary::Trend(t)) => t.percentile(q),
            (Stat::Count, MetricSummary::Counter(c)) => Some(c.total),
            (Stat::Rate, MetricSummary::Counter(c)) => Some(c.rate),
            (Stat::Rate, MetricSummary::Rate(r)) => Some(r.rate),
            (Stat::Count, MetricSummary::Rate(r)) => Some(r.total as f64),
            (Stat::Value, MetricSummary::Gauge(g)) => Some(g.value),
            (Stat::Min, MetricSummary::Gauge(g)) => Some(g.min),
            (Stat::Max, MetricSummary::Gauge(g)) => Some(g.max),
            _ => None,
        }
    }
}

impl FromStr for Stat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" => Ok(Stat::Avg),
            "min" => Ok(Stat::Min),
            "max" => Ok(Stat::Max),
            "med" => Ok(Stat::Med),
            "count" => Ok(Stat::Count),
            "rate" => Ok(Stat::Rate),
            "value" => Ok(Stat::Value),
            _ => {
                let q = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown statistic `{s}`"))?;
                let q: f64 = q
                    .parse()
                    .map_err(|_| format!("invalid percentile `{q}`"))?;
                if !(0.0..=100.0).contains(&q) {
                    return Err(format!("percentile {q} is outside 0..=100"));
                }
                Ok(Stat::Percentile(q))
            }
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stat::Avg => f.write_str("avg"),
            Stat::Min => f.write_str("min"),
            Stat::Max => f.write_str("max"),
            Stat::Med => f.write_str("med"),
            Stat::Count => f.write_str("count"),
            Stat::Rate => f.write_str("rate"),
            Stat::Value => f.write_str("value"),
            Stat::Percentile(q) => write!(f, "p({q})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    pub fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Op::Lt => observed < bound,
            Op::Le => observed <= bound,
            Op::Gt => observed > bound,
            Op::Ge => observed >= bound,
            Op::Eq => observed == bound,
            Op::Ne => observed != bound,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Eq => "==",
            Op::Ne => "!=",
        }
    }
}

/// One parsed `<stat> <op> <number>` expression.
#[derive(Clone, Debug, PartialEq)]
pub struct Assertion {
    pub stat: Stat,
    pub op: Op,
    pub bound: f64,
}

impl FromStr for Assertion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let at = compact
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| "missing comparison operator".to_string())?;
        let (stat, rest) = compact.split_at(at);

        // Two-character operators first.
        let (op, bound) = [
            ("<=", Op::Le),
            (">=", Op::Ge),
            ("==", Op::Eq),
            ("!=", Op::Ne),
            ("<", Op::Lt),
            (">", Op::Gt),
        ]
        .into_iter()
        .find_map(|(sym, op)| rest.strip_prefix(sym).map(|bound| (op, bound)))
        .ok_or_else(|| format!("invalid operator in `{rest}`"))?;

        let bound: f64 = bound
            .parse()
            .map_err(|_| format!("invalid number `{bound}`"))?;
        if !bound.is_finite() {
            return Err(format!("invalid number `{bound}`"));
        }

        Ok(Assertion {
            stat: stat.parse()?,
            op,
            bound,
        })
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.stat, self.op.symbol(), self.bound)
    }
}

/// Assertions that must all hold for one metric.
#[derive(Clone, Debug, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub assertions: Vec<Assertion>,
}

impl Threshold {
    pub fn parse<S: AsRef<str>>(metric: impl Into<String>, expressions: &[S]) -> Result<Self> {
        let metric = metric.into();
        if expressions.is_empty() {
            return Err(Error::InvalidThreshold {
                metric,
                expression: String::new(),
                reason: "no assertion given".into(),
            });
        }
        let assertions = expressions
            .iter()
            .map(|e| {
                e.as_ref().parse().map_err(|reason| Error::InvalidThreshold {
                    metric: metric.clone(),
                    expression: e.as_ref().to_owned(),
                    reason,
                })
            })
            .collect::<Result<Vec<Assertion>>>()?;
        Ok(Self { metric, assertions })
    }

    /// Name the metric was registered under, without a `{tag:value}` suffix.
    pub fn base_metric(&self) -> &str {
        self.metric
            .split_once('{')
            .map_or(self.metric.as_str(), |(base, _)| base)
    }

    /// Checks the threshold against the metric kinds known at run start.
    pub fn validate<K>(&self, kind_of: K) -> Result<()>
    where
        K: Fn(&str) -> Option<MetricKind>,
    {
        let kind = kind_of(&self.metric)
            .or_else(|| kind_of(self.base_metric()))
            .ok_or_else(|| Error::InvalidThreshold {
                metric: self.metric.clone(),
                expression: String::new(),
                reason: "unknown metric".into(),
            })?;
        for assertion in &self.assertions {
            if !assertion.stat.applies_to(kind) {
                return Err(Error::InvalidThreshold {
                    metric: self.metric.clone(),
                    expression: assertion.to_string(),
                    reason: format!("`{}` does not apply to a {kind}", assertion.stat),
                });
            }
        }
        Ok(())
    }
}

/// Percentiles the thresholds need computed on top of the defaults.
pub fn required_percentiles(thresholds: &[Threshold]) -> Vec<f64> {
    thresholds
        .iter()
        .flat_map(|t| &t.assertions)
        .filter_map(|a| match a.stat {
            Stat::Percentile(q) => Some(q),
            _ => None,
        })
        .collect()
}

/// What a threshold on a metric without a value evaluates to.
///
/// A metric has no value when it is not in the snapshot, or when it is a trend, gauge or
/// rate that never received a sample. Counters hold zero until written to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbsentMetric {
    /// A missing metric usually means the code writing it never ran.
    #[default]
    Fail,
    Pass,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub expression: String,
    /// `None` when the metric had no value.
    pub observed: Option<f64>,
    pub passed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    /// The metric had no value to evaluate, see [`AbsentMetric`].
    pub absent: bool,
    pub passed: bool,
    pub assertions: Vec<AssertionResult>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub passed: bool,
    pub thresholds: Vec<ThresholdResult>,
}

/// Evaluates every threshold against `snapshot`.
///
/// The run passes when every assertion of every threshold holds. With no thresholds
/// the run passes.
pub fn evaluate(snapshot: &Snapshot, thresholds: &[Threshold], absent: AbsentMetric) -> Evaluation {
    let thresholds: Vec<ThresholdResult> = thresholds
        .iter()
        .map(|threshold| evaluate_one(snapshot, threshold, absent))
        .collect();
    Evaluation {
        passed: thresholds.iter().all(|t| t.passed),
        thresholds,
    }
}

fn evaluate_one(
    snapshot: &Snapshot,
    threshold: &Threshold,
    policy: AbsentMetric,
) -> ThresholdResult {
    let summary = snapshot
        .get(&threshold.metric)
        .filter(|summary| summary.has_value());

    let assertions: Vec<AssertionResult> = threshold
        .assertions
        .iter()
        .map(|assertion| {
            let (observed, passed) = match summary {
                Some(summary) => {
                    let observed = assertion.stat.read(summary);
                    let passed = observed.is_some_and(|v| assertion.op.holds(v, assertion.bound));
                    (observed, passed)
                }
                None => (None, policy == AbsentMetric::Pass),
            };
            AssertionResult {
                expression: assertion.to_string(),
                observed,
                passed,
            }
        })
        .collect();

    ThresholdResult {
        metric: threshold.metric.clone(),
        absent: summary.is_none(),
        passed: assertions.iter().all(|a| a.passed),
        assertions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;

    fn trend_snapshot(name: &str, samples: &[f64], percentiles: &[f64]) -> Snapshot {
        let collector = Collector::new();
        collector.register(name, MetricKind::Trend).unwrap();
        for s in samples {
            collector.record(name, *s).unwrap();
        }
        collector.snapshot_with(percentiles)
    }

    #[test]
    fn parses_expressions() {
        let a: Assertion = "p(95) < 500".parse().unwrap();
        assert_eq!(a.stat, Stat::Percentile(95.0));
        assert_eq!(a.op, Op::Lt);
        assert_eq!(a.bound, 500.0);

        let a: Assertion = "rate<=0.01".parse().unwrap();
        assert_eq!((a.stat, a.op, a.bound), (Stat::Rate, Op::Le, 0.01));

        let a: Assertion = "count!=3".parse().unwrap();
        assert_eq!(a.op, Op::Ne);

        let a: Assertion = "p(99.9)>=1".parse().unwrap();
        assert_eq!(a.stat, Stat::Percentile(99.9));
        assert_eq!(a.op, Op::Ge);
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["avg", "avg<", "avg<abc", "p95<1", "p(101)<1", "mean<3", "avg=<3", "avg<inf"] {
            assert!(bad.parse::<Assertion>().is_err(), "{bad}");
        }
    }

    #[test]
    fn display_round_trips() {
        let a: Assertion = "p(99.9) <= 250".parse().unwrap();
        assert_eq!(a.to_string(), "p(99.9)<=250");
        assert_eq!(a.to_string().parse::<Assertion>().unwrap(), a);
    }

    #[test]
    fn avg_below_bound_passes() {
        let snapshot = trend_snapshot("latency", &[100.0, 200.0, 300.0], &[]);
        let threshold = Threshold::parse("latency", &["avg<1000"]).unwrap();
        let eval = evaluate(&snapshot, &[threshold], AbsentMetric::Fail);
        assert!(eval.passed);
        assert_eq!(eval.thresholds[0].assertions[0].observed, Some(200.0));
    }

    #[test]
    fn avg_above_bound_fails() {
        let snapshot = trend_snapshot("latency", &[2000.0, 2000.0], &[]);
        let threshold = Threshold::parse("latency", &["avg<1000"]).unwrap();
        let eval = evaluate(&snapshot, &[threshold], AbsentMetric::Fail);
        assert!(!eval.passed);
        assert!(!eval.thresholds[0].passed);
    }

    #[test]
    fn one_failing_assertion_fails_the_run() {
        let snapshot = trend_snapshot("latency", &[100.0, 200.0, 300.0], &[]);
        let ok = Threshold::parse("latency", &["avg<1000", "max<=300"]).unwrap();
        let breached = Threshold::parse("latency", &["p(95)<100"]).unwrap();
        let eval = evaluate(&snapshot, &[ok, breached], AbsentMetric::Fail);
        assert!(eval.thresholds[0].passed);
        assert!(!eval.thresholds[1].passed);
        assert!(!eval.passed);
    }

    #[test]
    fn custom_percentiles_are_evaluated() {
        let samples: Vec<f64> = (1..=1000).map(f64::from).collect();
        let threshold = Threshold::parse("latency", &["p(99.9)<1000"]).unwrap();
        let percentiles = required_percentiles(&[threshold.clone()]);
        let snapshot = trend_snapshot("latency", &samples, &percentiles);
        assert!(evaluate(&snapshot, &[threshold], AbsentMetric::Fail).passed);
    }

    #[test]
    fn missing_percentile_fails() {
        let snapshot = trend_snapshot("latency", &[1.0], &[]);
        let threshold = Threshold::parse("latency", &["p(12)<10"]).unwrap();
        let eval = evaluate(&snapshot, &[threshold], AbsentMetric::Fail);
        assert!(!eval.passed);
        assert_eq!(eval.thresholds[0].assertions[0].observed, None);
    }

    #[test]
    fn absent_metric_policy() {
        let snapshot = trend_snapshot("latency", &[], &[]);
        let thresholds = [
            Threshold::parse("latency", &["avg<1"]).unwrap(),
            Threshold::parse("never_registered", &["count>0"]).unwrap(),
        ];

        let eval = evaluate(&snapshot, &thresholds, AbsentMetric::Fail);
        assert!(!eval.passed);
        assert!(eval.thresholds.iter().all(|t| t.absent && !t.passed));

        let eval = evaluate(&snapshot, &thresholds, AbsentMetric::Pass);
        assert!(eval.passed);
    }

    #[test]
    fn untouched_counter_evaluates_as_zero() {
        let collector = Collector::new();
        collector.register("errors", MetricKind::Counter).unwrap();
        collector.register("checks", MetricKind::Rate).unwrap();
        let snapshot = collector.snapshot();
        let thresholds = [
            Threshold::parse("errors", &["count<10", "rate==0"]).unwrap(),
            Threshold::parse("checks", &["rate>0.9"]).unwrap(),
        ];

        let eval = evaluate(&snapshot, &thresholds, AbsentMetric::Fail);
        let errors = &eval.thresholds[0];
        assert!(errors.passed && !errors.absent);
        assert_eq!(errors.assertions[0].observed, Some(0.0));
        // a rate without samples has nothing to evaluate
        assert!(eval.thresholds[1].absent);
        assert!(!eval.thresholds[1].passed);
    }

    #[test]
    fn no_thresholds_pass() {
        assert!(evaluate(&Snapshot::default(), &[], AbsentMetric::Fail).passed);
    }

    #[test]
    fn counter_and_rate_statistics() {
        let collector = Collector::new();
        collector.register("errors", MetricKind::Counter).unwrap();
        collector.register("failed", MetricKind::Rate).unwrap();
        for i in 0..10 {
            collector.record("errors", 1.0).unwrap();
            collector.record("failed", if i == 0 { 1.0 } else { 0.0 }).unwrap();
        }
        let snapshot = collector.snapshot();
        let thresholds = [
            Threshold::parse("errors", &["count<=10"]).unwrap(),
            Threshold::parse("failed", &["rate<0.2", "count==10"]).unwrap(),
        ];
        assert!(evaluate(&snapshot, &thresholds, AbsentMetric::Fail).passed);
    }

    #[test]
    fn validation_checks_metric_and_statistic() {
        let kind_of = |name: &str| match name {
            "latency" => Some(MetricKind::Trend),
            "group_duration" => Some(MetricKind::Trend),
            "errors" => Some(MetricKind::Counter),
            _ => None,
        };
        assert!(Threshold::parse("latency", &["p(95)<1"]).unwrap().validate(kind_of).is_ok());
        assert!(Threshold::parse("group_duration{group:login}", &["avg<1"])
            .unwrap()
            .validate(kind_of)
            .is_ok());
        assert!(Threshold::parse("errors", &["p(95)<1"]).unwrap().validate(kind_of).is_err());
        assert!(Threshold::parse("nope", &["avg<1"]).unwrap().validate(kind_of).is_err());
    }

    #[test]
    fn empty_assertion_list_is_rejected() {
        let empty: [&str; 0] = [];
        assert!(Threshold::parse("latency", &empty).is_err());
    }
}
