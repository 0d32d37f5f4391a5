//! tflife - provisioning lifecycle harness
//!
//! Runs one lifecycle (or a plan / validate pass) against a configuration
//! directory and exits with the run status.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Args, Parser, Subcommand};
use eyre::{eyre, Result, WrapErr};
use std::path::{Path, PathBuf};
use tflife::lifecycle::{Assertion, RunMode, RunReport};
use tflife::{expect_contains_key, expect_non_empty, Harness};
use tflife_core::{parse_var_binding, Config, Phase, RunConfig, RunStatus};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Drive a provisioning tool through init, apply, assertions and destroy.
#[derive(Parser)]
#[command(name = "tflife", about = "Provisioning lifecycle harness", version)]
struct Cli {
    /// Config file (merged over <dir>/.tflife/config)
    #[arg(long, global = true, env = "TFLIFE_CONFIG")]
    config: Option<PathBuf>,

    /// Provisioning tool binary (overrides tool_bin)
    #[arg(long, global = true, env = "TFLIFE_TOOL_BIN")]
    tool_bin: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Target {
    /// Configuration directory
    dir: PathBuf,

    /// Input variable, NAME=VALUE (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    vars: Vec<(String, String)>,

    /// Variable definitions file (repeatable)
    #[arg(long = "var-file")]
    var_files: Vec<PathBuf>,

    /// Keep colour codes in tool output
    #[arg(long)]
    color: bool,
}

#[derive(Subcommand)]
enum Command {
    /// init, apply, check outputs, destroy
    Run {
        #[command(flatten)]
        target: Target,

        /// Plan to this file before applying
        #[arg(long)]
        plan_out: Option<PathBuf>,

        /// Output key that must be present and non-empty (repeatable)
        #[arg(long = "expect-output", value_name = "KEY")]
        expect_output: Vec<String>,

        /// Output object that must contain a key, as KEY.NESTED (repeatable)
        #[arg(long = "expect-key", value_name = "KEY.NESTED")]
        expect_key: Vec<String>,

        /// Run against a private copy of the directory
        #[arg(long)]
        private_copy: bool,

        /// Print captured outputs as JSON
        #[arg(long)]
        json: bool,
    },
    /// init and plan, without provisioning
    Plan {
        #[command(flatten)]
        target: Target,

        /// Persist the plan to this file
        #[arg(long)]
        plan_out: Option<PathBuf>,
    },
    /// init and validate, without provisioning
    Validate {
        #[command(flatten)]
        target: Target,
    },
}

impl Command {
    fn target(&self) -> &Target {
        match self {
            Self::Run { target, .. } | Self::Plan { target, .. } | Self::Validate { target } => {
                target
            }
        }
    }
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    parse_var_binding(s).ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    let code = runtime.block_on(execute(cli))?;
    drop(runtime);
    std::process::exit(code);
}

async fn execute(cli: Cli) -> Result<i32> {
    let target = cli.command.target();
    let config = load_config(cli.config.as_deref(), &target.dir, cli.tool_bin)?;
    let run_config = run_config(target, &config);

    let cancel_token = CancellationToken::new();
    watch_signals(cancel_token.clone())?;

    let harness = Harness::from_config(&config)?;

    match cli.command {
        Command::Run {
            plan_out,
            expect_output,
            expect_key,
            private_copy,
            json,
            ..
        } => {
            let mut assertions: Vec<Assertion> =
                expect_output.iter().map(|key| expect_non_empty(key)).collect();
            for pair in &expect_key {
                let (key, nested) = pair
                    .split_once('.')
                    .ok_or_else(|| eyre!("--expect-key must be KEY.NESTED, got '{pair}'"))?;
                assertions.push(expect_contains_key(key, nested));
            }

            let run_config = match plan_out {
                Some(path) => run_config.with_plan_file(path),
                None => run_config,
            };
            let harness = harness.with_private_copies(private_copy || config.copy_to_work_root);
            let report = harness
                .run(run_config, RunMode::Lifecycle, &assertions, &cancel_token)
                .await?;

            print_summary(&report);
            if json {
                if let Some(output) = &report.output {
                    println!("{}", serde_json::to_string_pretty(&output.to_json())?);
                }
            }
            Ok(report.status().exit_code())
        }
        Command::Plan { plan_out, .. } => {
            let run_config = match plan_out {
                Some(path) => run_config.with_plan_file(path),
                None => run_config,
            };
            let report = harness
                .run(run_config, RunMode::PlanOnly, &[], &cancel_token)
                .await?;
            print_summary(&report);
            if let Some(outcome) = report.phase_outcome(Phase::Plan) {
                if outcome.is_success() {
                    let changes = outcome.result().exit_code == 2;
                    println!(
                        "plan: {}",
                        if changes { "changes pending" } else { "no changes" }
                    );
                }
            }
            Ok(report.status().exit_code())
        }
        Command::Validate { .. } => {
            let report = harness
                .run(run_config, RunMode::ValidateOnly, &[], &cancel_token)
                .await?;
            print_summary(&report);
            if let Some(outcome) = report.phase_outcome(Phase::Validate) {
                println!(
                    "validate: {}",
                    if outcome.is_success() { "valid" } else { "invalid" }
                );
            }
            Ok(report.status().exit_code())
        }
    }
}

/// Defaults, then `<dir>/.tflife/config`, then `--config`, then flags.
fn load_config(path: Option<&Path>, dir: &Path, tool_bin: Option<PathBuf>) -> Result<Config> {
    let mut config = Config::discover(dir)
        .wrap_err_with(|| format!("failed to load config from {}", dir.display()))?;
    if let Some(path) = path {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
    }
    if let Some(tool_bin) = tool_bin {
        config.tool_bin = tool_bin;
    }
    config.resolve_paths(dir);
    Ok(config)
}

fn run_config(target: &Target, config: &Config) -> RunConfig {
    let mut run_config = RunConfig::new(&target.dir).with_no_color(config.no_color && !target.color);
    for (name, value) in &target.vars {
        run_config = run_config.with_var(name, value);
    }
    for file in &target.var_files {
        run_config = run_config.with_var_file(file);
    }
    if let Some(plan_file) = &config.plan_file {
        run_config = run_config.with_plan_file(plan_file);
    }
    run_config
}

/// Cancel the run on SIGINT/SIGTERM; teardown still runs.
fn watch_signals(cancel_token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, cancelling run"),
                _ = sigterm.recv() => info!("received SIGTERM, cancelling run"),
            }
            cancel_token.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received SIGINT, cancelling run");
                cancel_token.cancel();
            }
        });
    }

    Ok(())
}

fn print_summary(report: &RunReport) {
    println!("run {} in {}", report.run_id, report.working_dir.display());
    for record in &report.records {
        let result = record.outcome.result();
        println!(
            "  {:<9} {:<18} attempts={} exit={} {}ms",
            record.phase.as_str(),
            record.outcome.as_str(),
            record.outcome.attempts(),
            result.exit_code,
            result.duration.as_millis()
        );
    }
    for err in &report.errors {
        println!("  error: {err}");
    }
    if let Some(leak) = &report.leak {
        eprintln!("!!! {leak}");
    }
    let status = report.status();
    if status == RunStatus::Passed {
        println!("{}", status.as_str());
    } else {
        eprintln!("{}", status.as_str());
    }
}
