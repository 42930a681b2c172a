//! testrunner-lite-cli - entry point for the test execution engine.
//!
//! Parses a plan file plus the Section 6 options, builds an `EngineConfig`,
//! wires a `YamlPlanReader` and `JsonResultWriter` together, and hands both to
//! the Run Driver.

use std::path::PathBuf;

use clap::Parser;
use tlr_core::{EngineConfig, ResumeMode, YamlPlanReader};
use tlr_engine::{run, JsonResultWriter};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

/// Run a YAML test plan through the execution engine.
#[derive(Parser)]
#[command(name = "testrunner-lite-cli")]
#[command(about = "Drives a YAML test plan through the execution engine")]
#[command(version)]
struct Cli {
    /// Path to the YAML test plan
    plan: PathBuf,

    /// Config file to load before applying the flags below (key=value lines)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory `get`-ed files are copied into
    #[arg(long)]
    output_folder: Option<PathBuf>,

    /// Run environment matched against each Set's environment list
    #[arg(long)]
    environment: Option<String>,

    /// Comma-separated hardware id whitelist override (matched per Set)
    #[arg(long)]
    hwid: Option<String>,

    /// Enable crash-report collection
    #[arg(long)]
    dump_cores: bool,

    /// Directory scanned for rich core dumps and the marker file
    #[arg(long)]
    rich_core_dir: Option<PathBuf>,

    /// Seconds to wait for the uploader to reconcile telemetry URLs
    #[arg(long)]
    core_upload_timeout: Option<u64>,

    /// Default soft timeout for steps that don't set one explicitly
    #[arg(long)]
    soft_timeout: Option<u32>,

    /// Default hard timeout for the Executor's SIGKILL stage
    #[arg(long)]
    hard_timeout: Option<u32>,

    /// Chroot prefix applied to remote source paths
    #[arg(long)]
    chroot: Option<PathBuf>,

    /// Skip manual cases
    #[arg(long)]
    no_manual: bool,

    /// Skip automatic cases
    #[arg(long)]
    no_automatic: bool,

    /// Only run the Case with this exact name
    #[arg(long)]
    case_filter: Option<String>,

    /// Only run the Set with this exact name
    #[arg(long)]
    set_filter: Option<String>,

    /// How a Set Runner behaves at its resume checkpoint: wait or exit
    #[arg(long, value_parser = parse_resume_mode)]
    resume: Option<ResumeMode>,
}

fn parse_resume_mode(value: &str) -> Result<ResumeMode, String> {
    match value {
        "wait" => Ok(ResumeMode::WaitForSignal),
        "exit" => Ok(ResumeMode::ExitAfter),
        other => Err(format!("unknown resume mode '{other}', expected 'wait' or 'exit'")),
    }
}

fn build_config(cli: &Cli) -> Result<EngineConfig, tlr_core::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    if let Some(v) = &cli.output_folder {
        config.output_folder = v.clone();
    }
    if let Some(v) = &cli.environment {
        config.environment = v.clone();
    }
    if let Some(v) = &cli.hwid {
        config.forced_hwid = Some(v.clone());
    }
    if cli.dump_cores {
        config.dump_cores = true;
    }
    if let Some(v) = &cli.rich_core_dir {
        config.rich_core_dir = v.clone();
    }
    if let Some(v) = cli.core_upload_timeout {
        config.core_upload_timeout_sec = v;
    }
    if let Some(v) = cli.soft_timeout {
        config.common_soft_timeout_sec = v;
    }
    if let Some(v) = cli.hard_timeout {
        config.common_hard_timeout_sec = v;
    }
    if let Some(v) = &cli.chroot {
        config.chroot_folder = Some(v.clone());
    }
    if cli.no_manual {
        config.run_manual = false;
    }
    if cli.no_automatic {
        config.run_automatic = false;
    }
    if let Some(v) = &cli.case_filter {
        config.case_filter = Some(v.clone());
    }
    if let Some(v) = &cli.set_filter {
        config.set_filter = Some(v.clone());
    }
    if let Some(v) = cli.resume {
        config.resume_mode = Some(v);
    }

    Ok(config)
}

fn main() {
    fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let mut reader = match YamlPlanReader::from_path(&cli.plan) {
        Ok(reader) => reader,
        Err(e) => {
            error!("failed to open plan {}: {e}", cli.plan.display());
            std::process::exit(1);
        }
    };

    let output_path = config.output_folder.join("result.json");
    let writer = Box::new(JsonResultWriter::new(&output_path));

    match run(&mut reader, &config, writer) {
        Ok(_) => {}
        Err(e) => {
            error!("run terminated: {e}");
            std::process::exit(1);
        }
    }
}
