use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use barrage::cli::config::TestDefinition;
use barrage::cli::scenario::ScenarioWorkUnit;
use barrage::cli::{Cli, Commands};
use barrage::engine::http_client::HttpClient;
use barrage::engine::{RunResult, Scheduler};
use barrage::stats::output::{OutputConfig, OutputParams};
use barrage::stats::summary::{render_text, RunSummary};

/// Process exit code when at least one threshold failed.
const EXIT_THRESHOLDS_FAILED: i32 = 99;
const EXIT_ERROR: i32 = 1;

fn init_logging(verbose: bool) {
    let default = if verbose { "barrage=debug" } else { "barrage=info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .try_init();
}

struct RunArgs {
    definition: PathBuf,
    vus: Option<usize>,
    duration: Option<String>,
    out: Vec<String>,
    json: bool,
    summary_export: Option<PathBuf>,
}

fn run_test(args: RunArgs) -> Result<RunResult> {
    let mut definition = TestDefinition::load(&args.definition)?;
    definition.options.apply_overrides(args.vus, args.duration);

    let profile = definition.options.into_profile()?;
    let timeout = definition.options.request_timeout()?;
    let work = ScenarioWorkUnit::from_definition(&definition)?;
    let params = OutputParams {
        elasticsearch: definition.options.elasticsearch.clone(),
        env: std::env::vars().collect(),
    };
    let outputs = args
        .out
        .iter()
        .map(|arg| Ok(OutputConfig::parse(arg)?.build(&params)?))
        .collect::<Result<Vec<_>>>()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let result = runtime.block_on(async move {
        let transport = HttpClient::with_pool_and_workers(profile.vus.max(10), profile.vus).with_timeout(timeout);
        let mut scheduler = Scheduler::new(profile, work, Arc::new(transport));
        for output in outputs {
            scheduler = scheduler.with_output(output);
        }

        let handle = scheduler.start()?;
        let control = handle.control();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() && control.stop(barrage::engine::StopReason::Operator) {
                warn!("Interrupted, stopping VUs");
            }
        });
        handle.wait().await
    })?;

    let summary = RunSummary::from_result(&result);
    if args.json {
        println!("{}", summary.to_json()?);
    } else {
        println!("{}", render_text(&result));
    }
    if let Some(path) = &args.summary_export {
        summary
            .export(path)
            .with_context(|| format!("Failed to export summary to {}", path.display()))?;
        info!("Summary written to {}", path.display());
    }
    Ok(result)
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match cli.command {
        Commands::Run {
            definition,
            vus,
            duration,
            out,
            json,
            summary_export,
        } => match run_test(RunArgs {
            definition,
            vus,
            duration,
            out,
            json,
            summary_export,
        }) {
            Ok(result) if result.passed() => 0,
            Ok(result) => {
                error!("{} threshold(s) failed", result.thresholds.iter().filter(|t| !t.passed()).count());
                EXIT_THRESHOLDS_FAILED
            }
            Err(e) => {
                error!("{:#}", e);
                EXIT_ERROR
            }
        },
        Commands::Validate { definition } => match barrage::cli::validate::run_validate(&definition) {
            Ok(()) => 0,
            Err(_) => EXIT_ERROR,
        },
        Commands::Schema => {
            let schema = schemars::schema_for!(TestDefinition);
            match serde_json::to_string_pretty(&schema) {
                Ok(json) => {
                    println!("{}", json);
                    0
                }
                Err(e) => {
                    error!("{}", e);
                    EXIT_ERROR
                }
            }
        }
    };
    std::process::exit(code);
}
