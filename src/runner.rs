use std::{future::Future, sync::Arc};

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    collector::Collector,
    config::RunConfig,
    error::{Error, Result},
    executor::{ExecutionContext, Executor, RunState},
    http::HttpClient,
    metric::builtin,
    pool::SharedPool,
    report::RunReport,
    scenario::{RunContext, Scenario, Vu},
    threshold::{evaluate, required_percentiles},
};

/// Captured ids kept for `{id}` placeholders; older ones are overwritten.
const ID_POOL_CAPACITY: usize = 10_000;

/// Drives one run from configuration to [`RunReport`].
///
/// Everything that can be rejected is rejected before the first VU starts: stages,
/// thresholds and the metrics they reference, the base URL. After that, the only way
/// to stop the run early is [`Runner::cancel_token`].
#[derive(Debug)]
pub struct Runner {
    config: RunConfig,
    cancel: CancellationToken,
    state: Arc<watch::Sender<RunState>>,
}

impl Runner {
    pub fn new(config: RunConfig) -> Self {
        let (state, _) = watch::channel(RunState::NotStarted);
        Self {
            config,
            cancel: CancellationToken::new(),
            state: Arc::new(state),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Follows the run through its stages.
    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Cancelling the token stops the run early. VUs still get `graceful_stop` to finish
    /// their iteration and the report is marked incomplete.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the script of the configuration.
    pub async fn run_script(&self) -> Result<RunReport> {
        let script = self
            .config
            .script
            .clone()
            .ok_or_else(|| Error::Config("the configuration has no `script`".into()))?;
        self.run(script.into_scenario()).await
    }

    pub async fn run<F, Fut>(&self, scenario: Scenario<F>) -> Result<RunReport>
    where
        F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let config = &self.config;
        let thresholds = config.validate(&scenario.metrics)?;

        let collector = Arc::new(Collector::with_exact_limit(config.exact_samples));
        for (name, kind) in builtin::ALL {
            collector.register(name, kind)?;
        }
        for (name, kind) in &scenario.metrics {
            collector.register(name, *kind)?;
        }

        let http = config
            .http_config()
            .map(|http| HttpClient::new(&http))
            .transpose()?;
        let run = Arc::new(RunContext {
            collector: Arc::clone(&collector),
            http,
            pool: SharedPool::with_capacity(ID_POOL_CAPACITY),
            params: config.params.clone(),
            organization: config.organization.clone(),
            seed: config.seed,
        });
        let ctx = ExecutionContext {
            run,
            cancel: self.cancel.clone(),
            state: Arc::clone(&self.state),
        };

        let executor = config.executor();
        let started_at = Utc::now();
        collector.reset();
        let outcome = executor.exec(&scenario, ctx).await?;

        let snapshot = collector.snapshot_with(&required_percentiles(&thresholds));
        let evaluation = evaluate(&snapshot, &thresholds, config.absent_metric);

        let report = RunReport::new(
            scenario.name.as_str(),
            started_at,
            &outcome,
            snapshot,
            evaluation,
        );
        if report.passed {
            tracing::info!("Scenario `{}` passed all thresholds", report.scenario);
        } else {
            for threshold in report.failed_thresholds() {
                tracing::warn!("Threshold on `{}` breached", threshold.metric);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{future::BoxFuture, FutureExt};

    use super::*;
    use crate::{
        executor::Stage,
        http::{Body, OperationResult},
        metric::{MetricKind, MetricSummary},
    };

    fn config() -> RunConfig {
        let mut config = RunConfig::new(vec![
            Stage::new(Duration::from_secs(3), 2),
            Stage::new(Duration::from_secs(2), 0),
        ]);
        config.graceful_stop = Duration::from_secs(1);
        config
    }

    fn scenario(
    ) -> Scenario<impl Fn(Vu) -> BoxFuture<'static, ()> + Send + Sync + Clone + 'static> {
        Scenario::builder()
            .name("sleepy")
            .metrics(vec![("work".to_string(), MetricKind::Trend)])
            .action(|vu: Vu| {
                async move {
                    vu.sleep(Duration::from_millis(100)).await;
                    vu.trend("work", 100.0);
                }
                .boxed()
            })
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn passing_run() {
        let config = config().with_threshold("work", &["avg<=100", "count>0"]);
        let runner = Runner::new(config);
        let mut state = runner.state();

        let report = runner.run(scenario()).await.unwrap();
        assert!(report.complete);
        assert!(report.passed);
        assert!(report.iterations > 0);
        assert_eq!(report.max_vus, 2);
        assert!(report.metrics.contains_key(builtin::HTTP_REQS));
        assert_eq!(*state.borrow_and_update(), RunState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn breached_threshold_fails_the_run() {
        let config = config().with_threshold("work", &["avg<50"]);
        let report = Runner::new(config).run(scenario()).await.unwrap();
        assert!(report.complete);
        assert!(!report.passed);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_metric_fails_by_default() {
        let config = config().with_threshold(builtin::HTTP_REQ_DURATION, &["p(95)<500"]);
        let report = Runner::new(config).run(scenario()).await.unwrap();
        assert!(!report.passed);
        assert!(report.thresholds[0].absent);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_run_passes_error_budgets() {
        let config = RunConfig::new(vec![Stage::new(Duration::from_secs(2), 1)])
            .with_threshold(builtin::ERRORS, &["count<10"])
            .with_threshold(builtin::INTERRUPTED_ITERATIONS, &["count<1"])
            .with_threshold(builtin::CHECKS, &["rate==1"]);
        let scenario = Scenario::builder()
            .name("healthy")
            .action(|vu: Vu| async move {
                let res = OperationResult::synthetic("ping", 200, Duration::ZERO, Body::Empty);
                vu.check(&res, "status is 200", |r| r.status == Some(200));
                vu.sleep(Duration::from_millis(200)).await;
            })
            .build();

        let report = Runner::new(config).run(scenario).await.unwrap();
        assert!(report.iterations > 0);
        assert!(report.passed, "{:#?}", report.thresholds);
        assert!(report.thresholds.iter().all(|t| !t.absent));
        match report.metrics.get(builtin::ERRORS) {
            Some(MetricSummary::Counter(c)) => assert_eq!(c.total, 0.0),
            other => panic!("unexpected summary {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_configuration_is_rejected_before_running() {
        let config = config().with_threshold("undeclared", &["avg<50"]);
        let runner = Runner::new(config);
        assert!(matches!(
            runner.run(scenario()).await,
            Err(Error::InvalidThreshold { .. })
        ));
        assert_eq!(*runner.state().borrow(), RunState::NotStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_is_incomplete() {
        let runner = Runner::new(config());
        let cancel = runner.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            cancel.cancel();
        });

        let report = runner.run(scenario()).await.unwrap();
        assert!(!report.complete);
        assert!(report.duration < Duration::from_secs(5));
        match report.metrics.get(builtin::ITERATIONS) {
            Some(MetricSummary::Counter(c)) => {
                assert_eq!(c.total, report.iterations as f64)
            }
            other => panic!("unexpected summary {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_script_requires_a_script() {
        let runner = Runner::new(config());
        assert!(matches!(runner.run_script().await, Err(Error::Config(_))));
    }
}
