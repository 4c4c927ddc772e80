pub mod config;
pub mod devices;
pub mod errors;
pub mod ledger;
pub mod logging;
pub mod runner;
pub mod runtime;
pub mod session;
pub mod signal;
pub mod stats;
pub mod types;

use clap::{error::ErrorKind, Args, Parser, Subcommand};
use config::{load_config, AppConfig, CliOverrides};
use devices::move_through;
use devices::sim::{FileRecorder, SimulatedStage};
use errors::RigError;
use ledger::Ledger;
use logging::{append_run_log, install_run_log, JsonlLogger};
use runner::TrialRunner;
use runtime::ProductionRuntime;
use serde_json::json;
use signal::install_ctrl_c_handler;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "trialrig")]
#[command(about = "Repeat a stage motion while recording rolling-buffer movies of every trial")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create the ledger file with its header line.
    Init {
        #[arg(long)]
        ledger: Option<PathBuf>,
    },
    /// Run trials against the simulated stage and file recorder.
    Run(RunArgs),
    /// Summarize the ledger.
    Stats {
        #[arg(long)]
        ledger: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[arg(long)]
    pub ledger: Option<PathBuf>,
    #[arg(long)]
    pub count: Option<u32>,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub buffer_length: Option<u32>,
    /// Remove the run's movies when every trial succeeds.
    #[arg(long, default_value_t = false)]
    pub cleanup: bool,
    #[arg(long)]
    pub log: Option<PathBuf>,
}

pub fn run() -> Result<i32, RigError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| RigError::Io(e.to_string()))?;
    let mut runtime = ProductionRuntime::new();
    runtime.cancel = install_ctrl_c_handler()?;
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &std::path::Path,
    runtime: &ProductionRuntime,
) -> Result<i32, RigError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(RigError::Cli(error.to_string())),
        },
    };

    let overrides = overrides_for(&cli);
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    if let Some(path) = &cfg.logging.path {
        let mut logger = JsonlLogger::new(path);
        logger.max_payload_bytes = cfg.logging.max_payload_bytes;
        logger.max_file_bytes = cfg.logging.max_file_bytes;
        install_run_log(logger);
    }

    match cli.command {
        Command::Init { .. } => init_ledger(&cfg, runtime),
        Command::Run(_) => run_trials(&cfg, runtime),
        Command::Stats { json, .. } => print_stats(&cfg, runtime, json),
    }
}

fn overrides_for(cli: &Cli) -> CliOverrides {
    let mut overrides = CliOverrides {
        config_path: cli.config.clone(),
        ..CliOverrides::default()
    };
    match &cli.command {
        Command::Init { ledger } | Command::Stats { ledger, .. } => {
            overrides.ledger_path = ledger.clone();
        }
        Command::Run(args) => {
            overrides.ledger_path = args.ledger.clone();
            overrides.count = args.count;
            overrides.name = args.name.clone();
            overrides.buffer_length = args.buffer_length;
            overrides.cleanup = args.cleanup;
            overrides.log_path = args.log.clone();
        }
    }
    overrides
}

fn init_ledger(cfg: &AppConfig, runtime: &ProductionRuntime) -> Result<i32, RigError> {
    let ledger = Ledger::new(&cfg.ledger.path);
    let created = ledger.initialize(runtime.file_system.as_ref())?;
    let verb = if created { "created" } else { "kept existing" };
    runtime
        .terminal
        .write_line(&format!("{verb} ledger {}", ledger.path().display()))?;
    Ok(0)
}

fn run_trials(cfg: &AppConfig, runtime: &ProductionRuntime) -> Result<i32, RigError> {
    let request = cfg.trial_request()?;
    let stage = SimulatedStage::new(
        cfg.stage.name.clone(),
        cfg.stage_limits(),
        runtime.clock.clone(),
        runtime.cancel.clone(),
    );
    let mut recorder = FileRecorder::new(
        runtime.file_system.clone(),
        runtime.clock.clone(),
        cfg.recorder.frame_rate_hz,
        cfg.recorder.max_frames_per_session,
    );
    let setpoints = cfg.stage.setpoints.clone();

    append_run_log(
        "info",
        "cli.run.started",
        json!({
            "ledger": cfg.ledger.path.display().to_string(),
            "count": request.count,
            "stage": cfg.stage.name,
            "setpoints": &setpoints
        }),
    );
    let report = TrialRunner::from_runtime(runtime)
        .with_settle(cfg.settle_policy())
        .run(&mut recorder, &request, || move_through(&stage, &setpoints))?;
    Ok(if report.failed() { 1 } else { 0 })
}

fn print_stats(cfg: &AppConfig, runtime: &ProductionRuntime, as_json: bool) -> Result<i32, RigError> {
    let entries = Ledger::new(&cfg.ledger.path).read(runtime.file_system.as_ref())?;
    let summary = stats::summarize(&entries);
    if as_json {
        let text = serde_json::to_string_pretty(&summary)
            .map_err(|e| RigError::Io(e.to_string()))?;
        runtime.terminal.write_line(&text)?;
    } else {
        for line in stats::render_summary(&summary) {
            runtime.terminal.write_line(&line)?;
        }
    }
    Ok(0)
}
