//! Declarative scenarios.
//!
//! A [`Script`] describes a user flow as data: named groups of HTTP requests, the
//! checks to run against each response, and the think time between groups. It turns
//! into a regular [`Scenario`] with [`Script::into_scenario`].
//!
//! Strings in paths, headers and bodies may contain placeholders:
//!
//! | placeholder | replaced with |
//! |---|---|
//! | `{org}` | the configured organization |
//! | `{id}` | an id previously captured into the shared pool |
//! | `{param:NAME}` | a random entry of the `NAME` parameter list |
//! | `{rand:N}` | `N` random alphanumeric characters |
//! | `{vu}` | the VU id |
//! | `{iter}` | the VU iteration number |
//!
//! A request whose placeholders cannot be resolved (no id captured yet, unknown
//! parameter) is skipped for this iteration.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::duration_str,
    error::{Error, Result},
    http::{OperationResult, Request},
    metric::{builtin, MetricKind},
    scenario::{Scenario, Vu},
};

mod method {
    use reqwest::Method;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(method.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Method, D::Error> {
        let text = String::deserialize(deserializer)?;
        Method::from_bytes(text.to_ascii_uppercase().as_bytes())
            .map_err(|_| D::Error::custom(format!("invalid HTTP method `{text}`")))
    }
}

/// How groups are picked each iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Every group, in order.
    #[default]
    Sequence,
    /// One group, picked by weight.
    Weighted,
}

/// Pause drawn uniformly from `[min, max)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThinkTime {
    #[serde(with = "duration_str")]
    pub min: Duration,
    #[serde(with = "duration_str")]
    pub max: Duration,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    pub name: String,
    #[serde(default)]
    pub mode: Mode,
    /// Pause after every group, unless the group has its own.
    #[serde(default)]
    pub think_time: Option<ThinkTime>,
    pub groups: Vec<Group>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_method() -> Method {
    Method::GET
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Group {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub think_time: Option<ThinkTime>,
    pub requests: Vec<Step>,
}

/// One request of a group.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub name: String,
    #[serde(default = "default_method", with = "method")]
    pub method: Method,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Statuses counted as success, any 2xx or 3xx when absent.
    #[serde(default)]
    pub expect_status: Option<Vec<u16>>,
    #[serde(default)]
    pub checks: Vec<Check>,
    /// JSON path of a value to push into the shared id pool.
    #[serde(default)]
    pub capture: Option<String>,
}

/// Assertion on the JSON body of a response.
///
/// With `equals`, the value at `path` must be equal to it. Otherwise the value must
/// exist, or be missing when `exists: false`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Check {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub exists: Option<bool>,
    #[serde(default)]
    pub equals: Option<Value>,
}

impl Check {
    pub fn holds(&self, result: &OperationResult) -> bool {
        let found = result.json(&self.path);
        match (&self.equals, self.exists) {
            (Some(expected), _) => found == Some(expected),
            (None, Some(false)) => found.is_none(),
            (None, _) => found.is_some(),
        }
    }
}

impl Script {
    pub fn validate(&self) -> Result<()> {
        let invalid =
            |reason: String| Err(Error::Config(format!("script `{}`: {reason}", self.name)));

        if self.groups.is_empty() {
            return invalid("at least one group is required".into());
        }
        if let Some(think) = &self.think_time {
            if think.min > think.max {
                return invalid("think_time.min is greater than think_time.max".into());
            }
        }
        for group in &self.groups {
            if group.requests.is_empty() {
                return invalid(format!("group `{}` has no request", group.name));
            }
            if !(group.weight.is_finite() && group.weight > 0.0) {
                return invalid(format!("group `{}` needs a positive weight", group.name));
            }
            if let Some(think) = &group.think_time {
                if think.min > think.max {
                    return invalid(format!(
                        "group `{}`: think_time.min is greater than think_time.max",
                        group.name
                    ));
                }
            }
            for step in &group.requests {
                if step.checks.iter().any(|c| c.exists == Some(false) && c.equals.is_some()) {
                    return invalid(format!(
                        "request `{}`: a check cannot both forbid and compare a value",
                        step.name
                    ));
                }
            }
        }
        Ok(())
    }

    /// Metrics the script writes to besides the builtin ones.
    pub fn metrics(&self) -> Vec<(String, MetricKind)> {
        self.groups
            .iter()
            .flat_map(|group| {
                std::iter::once(builtin::group_duration(&group.name))
                    .chain(group.requests.iter().map(|step| step.name.clone()))
            })
            .map(|name| (name, MetricKind::Trend))
            .collect()
    }

    pub fn into_scenario(
        self,
    ) -> Scenario<impl Fn(Vu) -> BoxFuture<'static, ()> + Send + Sync + Clone + 'static> {
        let name = self.name.clone();
        let metrics = self.metrics();
        let script = Arc::new(self);
        let action = move |vu: Vu| {
            let script = Arc::clone(&script);
            async move { script.iterate(&vu).await }.boxed()
        };
        Scenario::builder()
            .name(name)
            .metrics(metrics)
            .action(action)
            .build()
    }

    /// One pass through the script.
    pub async fn iterate(&self, vu: &Vu) {
        match self.mode {
            Mode::Sequence => {
                for group in &self.groups {
                    self.run_group(vu, group).await;
                }
            }
            Mode::Weighted => {
                let weights: Vec<f64> = self.groups.iter().map(|g| g.weight).collect();
                if let Some(i) = vu.data().weighted(&weights) {
                    self.run_group(vu, &self.groups[i]).await;
                }
            }
        }
    }

    async fn run_group(&self, vu: &Vu, group: &Group) {
        vu.group(&group.name, async {
            for step in &group.requests {
                step.run(vu).await;
            }
        })
        .await;

        if let Some(think) = group.think_time.as_ref().or(self.think_time.as_ref()) {
            vu.think(think.min, think.max).await;
        }
    }
}

impl Step {
    async fn run(&self, vu: &Vu) {
        let request = match self.render(vu) {
            Some(request) => request,
            None => {
                tracing::debug!(
                    vu = vu.id(),
                    request = %self.name,
                    "Skipping request, unresolved placeholder"
                );
                return;
            }
        };

        let result = vu.send(&request).await;
        for check in &self.checks {
            vu.check(&result, &check.name, |r| check.holds(r));
        }

        if let Some(path) = &self.capture {
            if !result.is_success() {
                return;
            }
            match result.json(path) {
                Some(Value::String(id)) => vu.pool().push(id.clone()),
                Some(value @ Value::Number(_)) => vu.pool().push(value.to_string()),
                _ => tracing::debug!(
                    vu = vu.id(),
                    request = %self.name,
                    "Nothing to capture at `{path}`"
                ),
            }
        }
    }

    /// The request with every placeholder resolved, `None` if one cannot be.
    pub fn render(&self, vu: &Vu) -> Option<Request> {
        let mut placeholders = Placeholders::new(vu);
        let mut request = Request::new(
            self.method.clone(),
            self.name.clone(),
            placeholders.render(&self.path)?,
        );
        for (name, value) in &self.headers {
            request = request.header(name.clone(), placeholders.render(value)?);
        }
        if let Some(body) = &self.body {
            request = request.json(placeholders.render_value(body)?);
        }
        request.expect_status = self.expect_status.clone();
        Some(request)
    }
}

/// Resolves placeholders for one request. `{id}` resolves to the same id everywhere
/// in the request.
struct Placeholders<'a> {
    vu: &'a Vu,
    id: Option<String>,
}

impl<'a> Placeholders<'a> {
    fn new(vu: &'a Vu) -> Self {
        Self { vu, id: None }
    }

    fn render(&mut self, template: &str) -> Option<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                return Some(out);
            };
            let token = &after[..close];
            match self.resolve(token) {
                Resolved::Value(value) => out.push_str(&value),
                Resolved::Literal => {
                    out.push('{');
                    out.push_str(token);
                    out.push('}');
                }
                Resolved::Missing => return None,
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Some(out)
    }

    fn render_value(&mut self, value: &Value) -> Option<Value> {
        Some(match value {
            Value::String(text) => Value::String(self.render(text)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.render_value(item))
                    .collect::<Option<_>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Some((k.clone(), self.render_value(v)?)))
                    .collect::<Option<_>>()?,
            ),
            other => other.clone(),
        })
    }

    fn resolve(&mut self, token: &str) -> Resolved {
        let vu = self.vu;
        match token {
            "org" => vu.organization().map(str::to_owned).into(),
            "vu" => Resolved::Value(vu.id().to_string()),
            "iter" => Resolved::Value(vu.iteration().to_string()),
            "id" => {
                if self.id.is_none() {
                    self.id = vu.pool().random(vu.data());
                }
                self.id.clone().into()
            }
            _ => {
                if let Some(name) = token.strip_prefix("param:") {
                    vu.param(name).map(str::to_owned).into()
                } else if let Some(len) = token.strip_prefix("rand:") {
                    match len.parse() {
                        Ok(len) => Resolved::Value(vu.data().alphanumeric(len)),
                        Err(_) => Resolved::Literal,
                    }
                } else {
                    Resolved::Literal
                }
            }
        }
    }
}

enum Resolved {
    Value(String),
    /// Not a placeholder, kept as written.
    Literal,
    Missing,
}

impl From<Option<String>> for Resolved {
    fn from(value: Option<String>) -> Self {
        value.map_or(Resolved::Missing, Resolved::Value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collector::Collector,
        data::DataGen,
        http::Body,
        metric::MetricSummary,
        scenario::RunContext,
    };
    use serde_json::json;

    const SCRIPT: &str = r#"
name: jobs
mode: weighted
think_time: { min: 1s, max: 2s }
groups:
  - name: browse
    weight: 3
    requests:
      - name: list_jobs
        path: /orgs/{org}/jobs?queue={param:queue}
        checks:
          - { name: has items, path: data.items }
        capture: data.items.0.id
  - name: submit
    requests:
      - name: create_job
        method: post
        path: /jobs
        expect_status: [201]
        body: { name: "job-{rand:8}", owner: "vu-{vu}" }
      - name: get_job
        path: /jobs/{id}
"#;

    fn script() -> Script {
        serde_yaml::from_str(SCRIPT).unwrap()
    }

    fn vu(organization: Option<&str>) -> Vu {
        let collector = Arc::new(Collector::new());
        for (name, kind) in builtin::ALL {
            collector.register(name, kind).unwrap();
        }
        let mut run = RunContext::new(collector);
        run.organization = organization.map(str::to_owned);
        run.params.insert("queue".into(), vec!["default".into()]);
        Vu::new(4, 2, Arc::new(run), Arc::new(DataGen::seeded(9)))
    }

    #[test]
    fn parses_and_validates() {
        let script = script();
        script.validate().unwrap();
        assert_eq!(script.mode, Mode::Weighted);
        assert_eq!(script.groups[0].weight, 3.0);
        assert_eq!(script.groups[1].weight, 1.0);
        assert_eq!(script.groups[1].requests[0].method, Method::POST);
        assert_eq!(script.groups[0].requests[0].method, Method::GET);
    }

    #[test]
    fn declares_request_and_group_metrics() {
        let metrics = script().metrics();
        for name in ["list_jobs", "create_job", "get_job", "group_duration{group:browse}"] {
            assert!(metrics.contains(&(name.to_string(), MetricKind::Trend)), "{name}");
        }
    }

    #[test]
    fn rejects_invalid_scripts() {
        let mut empty = script();
        empty.groups.clear();
        assert!(empty.validate().is_err());

        let mut weightless = script();
        weightless.groups[0].weight = 0.0;
        assert!(weightless.validate().is_err());

        let mut no_requests = script();
        no_requests.groups[1].requests.clear();
        assert!(no_requests.validate().is_err());

        assert!(serde_yaml::from_str::<Script>("name: x\ngroups: []\nloop: true").is_err());
    }

    #[test]
    fn renders_placeholders() {
        let script = script();
        let vu = vu(Some("acme"));

        let list = script.groups[0].requests[0].render(&vu).unwrap();
        assert_eq!(list.path, "/orgs/acme/jobs?queue=default");

        let create = script.groups[1].requests[0].render(&vu).unwrap();
        let body = create.body.unwrap();
        assert_eq!(body["owner"], "vu-4");
        let name = body["name"].as_str().unwrap();
        assert_eq!(name.len(), "job-".len() + 8);
        assert_eq!(create.expect_status, Some(vec![201]));
    }

    #[test]
    fn unresolved_placeholders_skip_the_request() {
        let script = script();
        let vu = vu(None);
        // no organization
        assert!(script.groups[0].requests[0].render(&vu).is_none());
        // nothing captured yet
        assert!(script.groups[1].requests[1].render(&vu).is_none());

        vu.pool().push("42".into());
        let get = script.groups[1].requests[1].render(&vu).unwrap();
        assert_eq!(get.path, "/jobs/42");
    }

    #[test]
    fn unknown_braces_are_kept() {
        let vu = vu(None);
        let mut placeholders = Placeholders::new(&vu);
        assert_eq!(placeholders.render("{x}/{iter}/{").unwrap(), "{x}/2/{");
    }

    #[test]
    fn checks() {
        let result = OperationResult::synthetic(
            "op",
            200,
            Duration::ZERO,
            Body::Json(json!({"data": {"state": "done"}})),
        );
        let check = |path: &str, exists, equals| Check {
            name: "c".into(),
            path: path.into(),
            exists,
            equals,
        };
        assert!(check("data.state", None, None).holds(&result));
        assert!(!check("data.missing", None, None).holds(&result));
        assert!(check("data.missing", Some(false), None).holds(&result));
        assert!(check("data.state", None, Some(json!("done"))).holds(&result));
        assert!(!check("data.state", None, Some(json!("failed"))).holds(&result));
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_without_server_records_failures() {
        let mut script = script();
        script.mode = Mode::Sequence;
        let vu = vu(Some("acme"));
        script.iterate(&vu).await;

        let snapshot = vu.collector().snapshot();
        // get_job is skipped: nothing was captured
        match snapshot.get(builtin::HTTP_REQS) {
            Some(MetricSummary::Counter(c)) => assert_eq!(c.total, 2.0),
            other => panic!("unexpected summary {other:?}"),
        }
        match snapshot.get(builtin::CHECKS) {
            Some(MetricSummary::Rate(r)) => assert_eq!((r.total, r.passes), (1, 0)),
            other => panic!("unexpected summary {other:?}"),
        }
        assert!(vu.pool().is_empty());
    }
}
