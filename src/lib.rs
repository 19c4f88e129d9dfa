//! Loadstage: staged virtual-user load generation with pass/fail thresholds.
//!
//! A run drives a population of virtual users (VUs) through a list of stages. Each VU
//! repeats a scenario iteration in a loop while the scheduler grows and shrinks the
//! population along a piecewise-linear ramp. Every operation a VU performs is recorded
//! into named metrics; at the end of the run, thresholds over those metrics decide
//! whether the run passed.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: a named action run once per VU iteration. It talks to the outside
//!   world through a [`Vu`] handle (HTTP requests, checks, groups, custom metrics).
//!   Declarative scenarios can be written as a [`Script`] instead of Rust code.
//! - [`Collector`]: thread-safe registry of named metrics (trend, counter, gauge, rate)
//!   that every VU writes to concurrently.
//! - [`Executor`]: responsible for actually running the scenario. The built-in
//!   [`StageExecutor`] ramps the VU population through [`Stage`]s, but executors are
//!   replaceable.
//! - [`Threshold`]: assertions such as `p(95)<500` evaluated against the final metric
//!   summaries.
//! - [`RunReport`] and [`Reporter`]: the immutable result of a run and the I/O boundary
//!   that displays or exports it.
//! - [`Runner`]: glues everything together from a [`RunConfig`].
//!
//! # Example
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use loadstage::{
//!     http::Request, Reporter, RunConfig, Runner, Scenario, Stage, StdoutReporter, Vu,
//! };
//!
//! # async fn run() -> loadstage::Result<()> {
//! let config = RunConfig::new(vec![
//!     Stage::new(Duration::from_secs(30), 20),
//!     Stage::new(Duration::from_secs(60), 20),
//!     Stage::new(Duration::from_secs(10), 0),
//! ])
//! .with_base_url("http://localhost:8080/api")
//! .with_threshold("http_req_duration", &["p(95)<500"]);
//!
//! let scenario = Scenario::builder()
//!     .name("browse")
//!     .action(|vu: Vu| async move {
//!         let res = vu.send(&Request::get("list_jobs", "/jobs")).await;
//!         vu.check(&res, "status is 200", |r| r.status == Some(200));
//!     })
//!     .build();
//!
//! let report = Runner::new(config).run(scenario).await?;
//! StdoutReporter.report(&report).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Feature flags
//! - `internals`: enable access to internal (and unstable) functions of the scheduler

/// Metric aggregators
pub mod aggregate;
/// Thread-safe metric registry
pub mod collector;
/// Run configuration
pub mod config;
/// Random test data
pub mod data;
pub mod error;
/// Orchestrators that define how things will actually run
pub mod executor;
/// HTTP transport
pub mod http;
/// Metric kinds and summaries
pub mod metric;
/// Shared pool of captured ids
pub mod pool;
/// Reports and Reporters
pub mod report;
/// Glue between configuration, executor and report
pub mod runner;
/// User-defined scenarios and the VU handle
pub mod scenario;
/// Declarative scenarios
pub mod script;
/// Pass/fail assertions over metrics
pub mod threshold;

pub use aggregate::Aggregate;
pub use collector::{Collector, Snapshot};
pub use config::RunConfig;
pub use error::{Error, Result};
pub use executor::{Executor, RunState, Stage, StageExecutor};
pub use metric::{MetricKind, MetricSummary};
pub use report::{JsonReporter, Reporter, RunReport, StdoutReporter};
pub use runner::Runner;
pub use scenario::{Scenario, Vu};
pub use script::Script;
pub use threshold::{AbsentMetric, Threshold};
