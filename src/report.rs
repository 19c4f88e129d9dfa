use std::{collections::BTreeMap, fmt::Write as _, future::Future, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::{
    collector::Snapshot,
    error::{Error, Result},
    executor::ExecOutcome,
    metric::MetricSummary,
    threshold::{Evaluation, ThresholdResult},
};

/// The final, immutable result of a run.
///
/// A [`RunReport`] is pure data: every metric summary, every threshold verdict and the
/// overall verdict. It can be serialized, compared and handed to any number of
/// [`Reporter`]s.
///
/// `complete` is `false` when the run was cancelled before the end of its last stage.
/// The metrics of an incomplete run are still consistent: they cover everything that
/// was recorded up to the cancellation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "crate::config::duration_str")]
    pub duration: Duration,
    pub complete: bool,
    /// Every threshold held.
    pub passed: bool,
    pub iterations: u64,
    pub interrupted_iterations: u64,
    pub max_vus: u64,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Vec<ThresholdResult>,
}

impl RunReport {
    pub fn new(
        scenario: impl Into<String>,
        started_at: DateTime<Utc>,
        outcome: &ExecOutcome,
        snapshot: Snapshot,
        evaluation: Evaluation,
    ) -> Self {
        Self {
            scenario: scenario.into(),
            started_at,
            finished_at: Utc::now(),
            duration: outcome.elapsed,
            complete: !outcome.cancelled,
            passed: evaluation.passed,
            iterations: outcome.iterations,
            interrupted_iterations: outcome.interrupted,
            max_vus: outcome.max_vus,
            metrics: snapshot.metrics,
            thresholds: evaluation.thresholds,
        }
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.iter().filter(|t| !t.passed)
    }
}

/// A [`Reporter`] consumes a [`RunReport`] and performs side effects: displaying it,
/// sending it to a service, or persisting it somewhere.
///
/// Reporters are the I/O boundary of a run. The computation layer (samples, summaries,
/// thresholds) stays pure and deterministic, reporters handle presentation and export.
///
/// # Example
/// ```rust
/// use loadstage::{Reporter, RunReport};
///
/// struct Verdict;
///
/// impl Reporter for Verdict {
///     async fn report(&self, report: &RunReport) -> loadstage::Result<()> {
///         println!("{}: {}", report.scenario, if report.passed { "ok" } else { "failed" });
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter {
    fn report(&self, report: &RunReport) -> impl Future<Output = Result<()>> + Send;
}

/// Prints a human-readable summary to stdout.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutReporter;

impl StdoutReporter {
    pub fn render(report: &RunReport) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = render_into(&mut out, report);
        out
    }
}

impl Reporter for StdoutReporter {
    async fn report(&self, report: &RunReport) -> Result<()> {
        let text = Self::render(report);
        let mut stdout = tokio::io::stdout();
        stdout.write_all(text.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

fn render_into(out: &mut String, report: &RunReport) -> std::fmt::Result {
    writeln!(out)?;
    writeln!(
        out,
        "  scenario: {} ({})",
        report.scenario,
        if report.complete { "complete" } else { "interrupted" }
    )?;
    writeln!(
        out,
        "  duration: {}, {} iteration(s), {} interrupted, max {} VU(s)",
        humantime::format_duration(Duration::from_millis(report.duration.as_millis() as u64)),
        report.iterations,
        report.interrupted_iterations,
        report.max_vus
    )?;
    writeln!(out)?;

    for (name, summary) in &report.metrics {
        let line = match summary {
            MetricSummary::Trend(t) => {
                let mut line = format!(
                    "avg={:.2} min={:.2} med={:.2} max={:.2}",
                    t.avg, t.min, t.med, t.max
                );
                for (key, value) in &t.percentiles {
                    let _ = write!(line, " {key}={value:.2}");
                }
                if !t.exact {
                    line.push_str(" (approx.)");
                }
                line
            }
            MetricSummary::Counter(c) => format!("{} {:.2}/s", c.total, c.rate),
            MetricSummary::Gauge(g) => format!("{} min={} max={}", g.value, g.min, g.max),
            MetricSummary::Rate(r) => format!(
                "{:.2}% ✓ {} ✗ {}",
                r.rate * 100.0,
                r.passes,
                r.total - r.passes
            ),
        };
        writeln!(out, "  {:.<36}: {line}", format!("{name} "))?;
    }

    if !report.thresholds.is_empty() {
        writeln!(out)?;
        writeln!(out, "  thresholds")?;
        for threshold in &report.thresholds {
            for assertion in &threshold.assertions {
                let observed = match assertion.observed {
                    Some(value) => format!("{value:.2}"),
                    None => "no samples".into(),
                };
                writeln!(
                    out,
                    "    {} {} {} ({observed})",
                    if assertion.passed { "✓" } else { "✗" },
                    threshold.metric,
                    assertion.expression
                )?;
            }
        }
    }

    writeln!(out)?;
    writeln!(out, "  {}", if report.passed { "PASSED" } else { "FAILED" })
}

/// Writes the report as pretty-printed JSON to a file, or to stdout.
#[derive(Clone, Debug, Default)]
pub struct JsonReporter {
    path: Option<PathBuf>,
}

impl JsonReporter {
    pub fn stdout() -> Self {
        Self { path: None }
    }

    pub fn to_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

impl Reporter for JsonReporter {
    async fn report(&self, report: &RunReport) -> Result<()> {
        let mut json = serde_json::to_vec_pretty(report)?;
        json.push(b'\n');
        match &self.path {
            Some(path) => {
                tokio::fs::write(path, &json)
                    .await
                    .map_err(|e| Error::Report(format!("cannot write `{}`: {e}", path.display())))?;
                tracing::info!("Report written to {}", path.display());
            }
            None => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&json).await?;
                stdout.flush().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collector::Collector,
        metric::MetricKind,
        threshold::{evaluate, AbsentMetric, Threshold},
    };

    fn report(cancelled: bool) -> RunReport {
        let collector = Collector::new();
        collector.register("latency", MetricKind::Trend).unwrap();
        collector.register("checks", MetricKind::Rate).unwrap();
        for v in [100.0, 200.0, 300.0] {
            collector.record("latency", v).unwrap();
        }
        collector.record("checks", 1.0).unwrap();
        collector.record("checks", 0.0).unwrap();

        let snapshot = collector.snapshot();
        let thresholds = [
            Threshold::parse("latency", &["avg<1000"]).unwrap(),
            Threshold::parse("checks", &["rate>0.9"]).unwrap(),
        ];
        let evaluation = evaluate(&snapshot, &thresholds, AbsentMetric::Fail);
        let outcome = ExecOutcome {
            cancelled,
            iterations: 3,
            max_vus: 2,
            elapsed: Duration::from_secs(5),
            ..Default::default()
        };
        RunReport::new("browse", Utc::now(), &outcome, snapshot, evaluation)
    }

    #[test]
    fn verdict_follows_the_thresholds() {
        let report = report(false);
        assert!(report.complete);
        assert!(!report.passed);
        let failed: Vec<_> = report.failed_thresholds().map(|t| t.metric.as_str()).collect();
        assert_eq!(failed, ["checks"]);
    }

    #[test]
    fn cancelled_runs_are_incomplete() {
        assert!(!report(true).complete);
    }

    #[test]
    fn json_round_trip() {
        let report = report(false);
        let json = serde_json::to_string(&report).unwrap();
        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.thresholds, report.thresholds);
        assert_eq!(back.metrics.len(), 2);
        assert_eq!(back.duration, Duration::from_secs(5));
    }

    #[test]
    fn human_summary() {
        let text = StdoutReporter::render(&report(false));
        assert!(text.contains("scenario: browse (complete)"));
        assert!(text.contains("✓ latency avg<1000 (200.00)"));
        assert!(text.contains("✗ checks rate>0.9 (0.50)"));
        assert!(text.contains("50.00% ✓ 1 ✗ 1"));
        assert!(text.trim_end().ends_with("FAILED"));
    }

    #[tokio::test]
    async fn json_reporter_writes_to_a_file() {
        let path =
            std::env::temp_dir().join(format!("loadstage-report-{}.json", std::process::id()));
        JsonReporter::to_path(&path).report(&report(true)).await.unwrap();
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let back: RunReport = serde_json::from_str(&text).unwrap();
        assert!(!back.complete);
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
