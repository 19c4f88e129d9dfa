//! Run configuration loaded from JSON or YAML.
//!
//! ```yaml
//! base_url: http://localhost:8080/api
//! organization: acme
//! stages:
//!   - { duration: 30s, target: 20 }
//!   - { duration: 1m, target: 20 }
//!   - { duration: 10s, target: 0 }
//! thresholds:
//!   http_req_duration: ["p(95)<500", "avg<200"]
//!   http_req_failed: rate<0.01
//! script:
//!   name: browse
//!   groups:
//!     - name: jobs
//!       requests:
//!         - { name: list_jobs, path: /jobs }
//! ```

use std::{collections::BTreeMap, path::Path, time::Duration};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{
    collector::DEFAULT_EXACT_SAMPLES,
    error::{Error, Result},
    executor::{stage::validate_stages, Stage, StageExecutor},
    http::HttpConfig,
    metric::{builtin, MetricKind},
    script::Script,
    threshold::{AbsentMetric, Threshold},
};

/// Serde helpers for durations written as `"30s"`, `"1m 30s"` or a number of seconds.
pub(crate) mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Secs(u64),
    }

    fn parse<E: serde::de::Error>(repr: Repr) -> Result<Duration, E> {
        match repr {
            Repr::Text(text) => humantime::parse_duration(text.trim())
                .map_err(|e| E::custom(format!("invalid duration `{text}`: {e}"))),
            Repr::Secs(secs) => Ok(Duration::from_secs(secs)),
        }
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        parse::<D::Error>(Repr::deserialize(deserializer)?)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<Repr>::deserialize(deserializer)?
                .map(parse::<D::Error>)
                .transpose()
        }
    }
}

/// A single assertion or a list of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expressions {
    One(String),
    Many(Vec<String>),
}

impl Expressions {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Expressions::One(expr) => std::slice::from_ref(expr),
            Expressions::Many(exprs) => exprs,
        }
    }
}

fn default_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_graceful_stop() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_exact_samples() -> usize {
    DEFAULT_EXACT_SAMPLES
}

/// Everything a run needs besides the scenario itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Root every request path is resolved against. Required by scripts.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Sent as a bearer token on every request.
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
    /// Tenant identifier, sent as `X-Organization-Id` and available as `{org}`.
    #[serde(default)]
    pub organization: Option<String>,
    /// Named value lists available to scenarios as `{param:NAME}`.
    #[serde(default)]
    pub params: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub start_vus: u64,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Expressions>,
    #[serde(default)]
    pub absent_metric: AbsentMetric,
    #[serde(default = "default_tick", with = "duration_str")]
    pub tick: Duration,
    #[serde(default = "default_graceful_stop", with = "duration_str")]
    pub graceful_stop: Duration,
    /// Defaults to `graceful_stop`.
    #[serde(default, with = "duration_str::option")]
    pub graceful_ramp_down: Option<Duration>,
    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub max_vus: Option<u64>,
    /// Makes every random choice of the run reproducible.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Raw samples a trend keeps before falling back to a histogram.
    #[serde(default = "default_exact_samples")]
    pub exact_samples: usize,
    #[serde(default)]
    pub script: Option<Script>,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl RunConfig {
    /// Configuration with every optional field at its default.
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            base_url: None,
            auth_token: None,
            organization: None,
            params: BTreeMap::new(),
            start_vus: 0,
            stages,
            thresholds: BTreeMap::new(),
            absent_metric: AbsentMetric::default(),
            tick: default_tick(),
            graceful_stop: default_graceful_stop(),
            graceful_ramp_down: None,
            request_timeout: default_request_timeout(),
            max_vus: None,
            seed: None,
            exact_samples: DEFAULT_EXACT_SAMPLES,
            script: None,
            headers: BTreeMap::new(),
        }
    }

    /// Loads a `.json`, `.yaml` or `.yml` file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&text)?,
            Some("yaml" | "yml") => Self::from_yaml(&text)?,
            _ => {
                return Err(Error::Config(format!(
                    "`{}`: expected a .json, .yaml or .yml file",
                    path.display()
                )))
            }
        };
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_threshold<S: AsRef<str>>(mut self, metric: impl Into<String>, exprs: &[S]) -> Self {
        let exprs = exprs.iter().map(|e| e.as_ref().to_owned()).collect();
        self.thresholds.insert(metric.into(), Expressions::Many(exprs));
        self
    }

    /// Parses the thresholds without checking which metrics exist.
    pub fn thresholds(&self) -> Result<Vec<Threshold>> {
        self.thresholds
            .iter()
            .map(|(metric, exprs)| Threshold::parse(metric.as_str(), exprs.as_slice()))
            .collect()
    }

    /// Checks everything that can be checked before a single VU starts and returns the
    /// parsed thresholds.
    ///
    /// `declared` lists the custom metrics the scenario writes to, on top of the
    /// builtin ones and the ones a script declares.
    pub fn validate(&self, declared: &[(String, MetricKind)]) -> Result<Vec<Threshold>> {
        validate_stages(&self.stages)?;
        if self.tick.is_zero() {
            return Err(Error::Config("`tick` must be greater than zero".into()));
        }
        if let Some(base_url) = &self.base_url {
            Url::parse(base_url)
                .map_err(|e| Error::Config(format!("invalid base URL `{base_url}`: {e}")))?;
        }

        let mut metrics: BTreeMap<String, MetricKind> = builtin::ALL
            .iter()
            .map(|(name, kind)| (name.to_string(), *kind))
            .collect();
        if let Some(script) = &self.script {
            if self.base_url.is_none() {
                return Err(Error::Config("a script needs a `base_url`".into()));
            }
            script.validate()?;
            metrics.extend(script.metrics());
        }
        metrics.extend(declared.iter().cloned());

        let thresholds = self.thresholds()?;
        for threshold in &thresholds {
            threshold.validate(|name| metrics.get(name).copied())?;
        }
        Ok(thresholds)
    }

    /// HTTP settings, `None` when no base URL is configured.
    pub fn http_config(&self) -> Option<HttpConfig> {
        self.base_url.as_ref().map(|base_url| HttpConfig {
            base_url: base_url.clone(),
            auth_token: self.auth_token.clone(),
            organization: self.organization.clone(),
            timeout: self.request_timeout,
            headers: self.headers.clone(),
        })
    }

    pub fn executor(&self) -> StageExecutor {
        StageExecutor {
            stages: self.stages.clone(),
            start_vus: self.start_vus,
            tick: self.tick,
            graceful_stop: self.graceful_stop,
            graceful_ramp_down: self.graceful_ramp_down.unwrap_or(self.graceful_stop),
            max_vus: self.max_vus,
        }
    }
}
