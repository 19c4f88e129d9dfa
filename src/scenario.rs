use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::Instrument;
use typed_builder::TypedBuilder;

use crate::{
    collector::Collector,
    data::DataGen,
    http::{HttpClient, OperationResult, Request},
    metric::{builtin, MetricKind},
    pool::SharedPool,
};

/// A named, repeatable virtual-user iteration.
///
/// `action` is called once per iteration with a fresh [`Vu`] handle and must drive one
/// complete pass through the user flow. Iterations of one VU run strictly one after the
/// other; iterations of different VUs run concurrently.
///
/// # Example
/// ```rust,no_run
/// use loadstage::{Scenario, http::Request, metric::MetricKind};
///
/// let scenario = Scenario::builder()
///     .name("browse")
///     .metrics(vec![("list_jobs".to_string(), MetricKind::Trend)])
///     .action(|vu: loadstage::Vu| async move {
///         vu.group("jobs", async {
///             let res = vu.send(&Request::get("list_jobs", "/api/jobs")).await;
///             vu.check(&res, "status is 200", |r| r.status == Some(200));
///         })
///         .await;
///         vu.think(std::time::Duration::from_millis(500), std::time::Duration::from_secs(2))
///             .await;
///     })
///     .build();
/// ```
#[derive(Clone, Debug, TypedBuilder)]
pub struct Scenario<F> {
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    /// Custom metrics the action writes to. They are registered at run start so that
    /// thresholds can reference them.
    #[builder(default)]
    pub metrics: Vec<(String, MetricKind)>,
}

impl<F, Fut> Scenario<F>
where
    F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    /// Runs a single iteration outside of any executor.
    pub async fn iterate(&self, vu: Vu) {
        (self.action)(vu).await
    }
}

/// State shared by every virtual user of one run.
#[derive(Debug)]
pub struct RunContext {
    pub collector: Arc<Collector>,
    /// `None` for scenarios that never touch HTTP.
    pub http: Option<HttpClient>,
    pub pool: SharedPool<String>,
    pub params: BTreeMap<String, Vec<String>>,
    pub organization: Option<String>,
    pub seed: Option<u64>,
}

impl RunContext {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self {
            collector,
            http: None,
            pool: SharedPool::new(),
            params: BTreeMap::new(),
            organization: None,
            seed: None,
        }
    }
}

/// Handle a scenario iteration uses to talk to the outside world.
///
/// Cheap to clone. Every write goes through the run's [`Collector`]; failures to write
/// a metric (wrong kind, invalid value) are logged and never interrupt the iteration.
#[derive(Clone, Debug)]
pub struct Vu {
    id: u64,
    iteration: u64,
    run: Arc<RunContext>,
    data: Arc<DataGen>,
}

impl Vu {
    pub fn new(id: u64, iteration: u64, run: Arc<RunContext>, data: Arc<DataGen>) -> Self {
        Self {
            id,
            iteration,
            run,
            data,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Zero-based iteration counter of this VU.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn data(&self) -> &DataGen {
        &self.data
    }

    pub fn pool(&self) -> &SharedPool<String> {
        &self.run.pool
    }

    pub fn organization(&self) -> Option<&str> {
        self.run.organization.as_deref()
    }

    pub fn params(&self, name: &str) -> Option<&[String]> {
        self.run.params.get(name).map(Vec::as_slice)
    }

    /// Random entry of the named parameter list.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params(name)
            .and_then(|values| self.data.choose(values))
            .map(String::as_str)
    }

    pub fn collector(&self) -> &Collector {
        &self.run.collector
    }

    /// Issues `request` and records its outcome.
    ///
    /// Always counts into `http_reqs` and `http_req_failed`. When a response arrived,
    /// its latency goes into `http_req_duration` and into a trend named after the
    /// request. A failed operation also increments `errors`.
    pub async fn send(&self, request: &Request) -> OperationResult {
        let result = match &self.run.http {
            Some(http) => http.send(request).await,
            None => OperationResult::synthetic_failure(request, "no HTTP client configured"),
        };

        self.count(builtin::HTTP_REQS, 1.0);
        if result.responded() {
            let ms = millis(result.duration);
            self.trend(builtin::HTTP_REQ_DURATION, ms);
            self.trend(&request.name, ms);
        }
        let failed = !result.is_success();
        self.rate(builtin::HTTP_REQ_FAILED, failed);
        if failed {
            self.count(builtin::ERRORS, 1.0);
            tracing::debug!(
                vu = self.id,
                operation = %request.name,
                status = ?result.status,
                error = ?result.error,
                "Operation failed"
            );
        }
        result
    }

    /// Evaluates a check against `result`. A failing check increments `errors`.
    pub fn check<P>(&self, result: &OperationResult, name: &str, predicate: P) -> bool
    where
        P: FnOnce(&OperationResult) -> bool,
    {
        self.check_counting(result, name, builtin::ERRORS, predicate)
    }

    /// Like [`Vu::check`], with failures counted into `counter`.
    pub fn check_counting<P>(
        &self,
        result: &OperationResult,
        name: &str,
        counter: &str,
        predicate: P,
    ) -> bool
    where
        P: FnOnce(&OperationResult) -> bool,
    {
        let passed = predicate(result);
        self.rate(builtin::CHECKS, passed);
        if !passed {
            self.count(counter, 1.0);
            tracing::debug!(vu = self.id, check = name, operation = %result.name, "Check failed");
        }
        passed
    }

    /// Runs `body` as a named group, recording its duration into `group_duration` and
    /// `group_duration{group:<name>}`.
    pub async fn group<T, Fut>(&self, name: &str, body: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let start = Instant::now();
        let out = body
            .instrument(tracing::debug_span!("group", vu = self.id, group = name))
            .await;
        let ms = millis(start.elapsed());
        self.trend(builtin::GROUP_DURATION, ms);
        self.trend(&builtin::group_duration(name), ms);
        out
    }

    /// Think time. Only suspends this VU.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }

    /// Randomized think time in `[min, max)`.
    pub async fn think(&self, min: Duration, max: Duration) {
        self.sleep(self.data.duration(min, max)).await
    }

    pub fn trend(&self, name: &str, value: f64) {
        self.write(name, MetricKind::Trend, value)
    }

    pub fn count(&self, name: &str, value: f64) {
        self.write(name, MetricKind::Counter, value)
    }

    pub fn gauge(&self, name: &str, value: f64) {
        self.write(name, MetricKind::Gauge, value)
    }

    pub fn rate(&self, name: &str, pass: bool) {
        self.write(name, MetricKind::Rate, if pass { 1.0 } else { 0.0 })
    }

    fn write(&self, name: &str, kind: MetricKind, value: f64) {
        if let Err(e) = self.run.collector.record_as(name, kind, value) {
            tracing::warn!(vu = self.id, "Dropping sample: {e}");
        }
    }
}

pub(crate) fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{http::Body, metric::MetricSummary};

    fn vu() -> Vu {
        let collector = Arc::new(Collector::new());
        for (name, kind) in builtin::ALL {
            collector.register(name, kind).unwrap();
        }
        Vu::new(
            1,
            0,
            Arc::new(RunContext::new(collector)),
            Arc::new(DataGen::seeded(1)),
        )
    }

    fn counter(vu: &Vu, name: &str) -> f64 {
        match vu.collector().snapshot().get(name) {
            Some(MetricSummary::Counter(c)) => c.total,
            other => panic!("unexpected summary {other:?}"),
        }
    }

    #[test]
    fn failing_check_counts_an_error() {
        let vu = vu();
        let res = OperationResult::synthetic("op", 200, Duration::ZERO, Body::Empty);

        assert!(vu.check(&res, "ok", |r| r.status == Some(200)));
        assert!(!vu.check(&res, "created", |r| r.status == Some(201)));
        assert_eq!(counter(&vu, builtin::ERRORS), 1.0);

        match vu.collector().snapshot().get(builtin::CHECKS) {
            Some(MetricSummary::Rate(r)) => {
                assert_eq!(r.total, 2);
                assert_eq!(r.passes, 1);
            }
            other => panic!("unexpected summary {other:?}"),
        }
    }

    #[test]
    fn check_on_missing_field_fails_gracefully() {
        let vu = vu();
        let res = OperationResult::synthetic("op", 200, Duration::ZERO, Body::Text("oops".into()));
        let passed = vu.check_counting(&res, "has id", "missing_ids", |r| {
            r.json("data.id").and_then(|v| v.as_str()).is_some()
        });
        assert!(!passed);
        assert_eq!(counter(&vu, "missing_ids"), 1.0);
    }

    #[tokio::test]
    async fn send_without_client_records_a_failure() {
        let vu = vu();
        let res = vu.send(&Request::get("list", "/jobs")).await;
        assert!(!res.is_success());
        assert_eq!(counter(&vu, builtin::HTTP_REQS), 1.0);
        assert_eq!(counter(&vu, builtin::ERRORS), 1.0);
        // no response, no latency sample
        assert!(vu.collector().snapshot().get("list").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn group_records_its_duration() {
        let vu = vu();
        let out = vu
            .group("browse", async {
                vu.sleep(Duration::from_millis(250)).await;
                7
            })
            .await;
        assert_eq!(out, 7);

        let snapshot = vu.collector().snapshot();
        match snapshot.get(&builtin::group_duration("browse")) {
            Some(MetricSummary::Trend(t)) => {
                assert_eq!(t.count, 1);
                assert!(t.avg >= 250.0);
            }
            other => panic!("unexpected summary {other:?}"),
        }
    }

    #[test]
    fn wrong_kind_write_is_dropped() {
        let vu = vu();
        vu.trend(builtin::ERRORS, 3.0);
        assert_eq!(counter(&vu, builtin::ERRORS), 0.0);
    }

    #[test]
    fn params_are_picked_from_config() {
        let collector = Arc::new(Collector::new());
        let mut run = RunContext::new(collector);
        run.params
            .insert("queues".into(), vec!["a".into(), "b".into()]);
        let vu = Vu::new(1, 0, Arc::new(run), Arc::new(DataGen::seeded(3)));
        let picked = vu.param("queues").unwrap();
        assert!(picked == "a" || picked == "b");
        assert_eq!(vu.param("missing"), None);
    }
}
