use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use loadstage::{JsonReporter, Reporter, RunConfig, Runner, StdoutReporter};
use tracing_subscriber::EnvFilter;

/// Staged virtual-user load generation with pass/fail thresholds.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Log filter, e.g. `info` or `loadstage=debug`. `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the script of a configuration file.
    Run(RunArgs),
    /// Check a configuration file without running it.
    Validate {
        /// Path to a .json, .yaml or .yml configuration.
        config: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Path to a .json, .yaml or .yml configuration.
    config: PathBuf,

    #[arg(long, env = "LOADSTAGE_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "LOADSTAGE_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Seed for every random choice of the run.
    #[arg(long)]
    seed: Option<u64>,

    /// Also write the JSON report to this file.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Print the JSON report on stdout instead of the summary.
    #[arg(long)]
    json: bool,
}

const EXIT_BREACHED: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_INTERRUPTED: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Validate { config } => validate(config).await,
        Command::Run(args) => run(args).await,
    }
}

async fn validate(path: PathBuf) -> ExitCode {
    let result = async {
        let config = RunConfig::load(&path).await?;
        let declared = config.script.as_ref().map(|s| s.metrics()).unwrap_or_default();
        let thresholds = config.validate(&declared)?;
        Ok::<_, loadstage::Error>((config.stages.len(), thresholds.len()))
    }
    .await;

    match result {
        Ok((stages, thresholds)) => {
            tracing::info!(
                "{} is valid: {stages} stage(s), {thresholds} threshold(s)",
                path.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{}: {e}", path.display());
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(args: RunArgs) -> ExitCode {
    let mut config = match RunConfig::load(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}: {e}", args.config.display());
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Some(base_url) = args.base_url {
        config.base_url = Some(base_url);
    }
    if let Some(token) = args.auth_token {
        config.auth_token = Some(token);
    }
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }

    let runner = Runner::new(config);
    let cancel = runner.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping virtual users...");
            cancel.cancel();
        }
    });

    let report = match runner.run_script().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Run failed: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let printed = if args.json {
        JsonReporter::stdout().report(&report).await
    } else {
        StdoutReporter.report(&report).await
    };
    if let Err(e) = printed {
        tracing::error!("Could not print the report: {e}");
    }
    if let Some(out) = args.out {
        if let Err(e) = JsonReporter::to_path(out).report(&report).await {
            tracing::error!("{e}");
        }
    }

    if !report.passed {
        ExitCode::from(EXIT_BREACHED)
    } else if !report.complete {
        ExitCode::from(EXIT_INTERRUPTED)
    } else {
        ExitCode::SUCCESS
    }
}
