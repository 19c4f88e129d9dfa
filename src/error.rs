use crate::metric::MetricKind;

/// Errors raised while configuring or driving a run.
///
/// Failed HTTP operations and failed checks are *not* errors: they are recorded into
/// metrics and the virtual user keeps going. Threshold breaches are not errors either,
/// they only flip the verdict of the final [`crate::RunReport`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("metric `{name}` is registered as {registered}, cannot use it as {requested}")]
    KindMismatch {
        name: String,
        registered: MetricKind,
        requested: MetricKind,
    },

    #[error("metric `{0}` is not registered")]
    UnknownMetric(String),

    #[error("invalid sample {value} for metric `{name}`")]
    InvalidSample { name: String, value: f64 },

    #[error("invalid stages: {0}")]
    InvalidStages(String),

    #[error("invalid threshold `{expression}` on `{metric}`: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not spawn virtual user: {0}")]
    Spawn(String),

    #[error("report error: {0}")]
    Report(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
