use clap::{Args, Subcommand};
use std::path::PathBuf;

use bampipe_backend::sim::SimPlatform;
use bampipe_config::PipeTable;
use bampipe_manager::{BamManager, ManagerConfig};

use crate::exit::{bam_error, config_error, CliError, CliResult, INTERNAL};
use crate::output::OutputFormat;

pub mod check;
pub mod simulate;
pub mod timers;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and validate a pipe table.
    Check(CheckArgs),
    /// Show or change inactivity timers on the simulated platform.
    Timers(TimersArgs),
    /// Connect and disconnect every pipe on the simulated platform.
    Simulate(SimulateArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Check(args) => check::run(args, format),
        Command::Timers(args) => timers::run(args, format),
        Command::Simulate(args) => simulate::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Pipe table (JSON).
    pub config: PathBuf,
}

#[derive(Args, Debug)]
pub struct TimersArgs {
    /// Pipe table (JSON).
    pub config: PathBuf,
    /// Control string, e.g. "hsusb 100,hsic 0", or "help".
    #[arg(long, value_name = "SETTINGS")]
    pub set: Option<String>,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Pipe table (JSON).
    pub config: PathBuf,
    /// Run the plug/unplug handshake around the connect cycle.
    #[arg(long)]
    pub handshake: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Current-thread runtime for commands that drive a manager.
pub(crate) fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("failed to start runtime: {err}")))
}

pub(crate) fn load_table(path: &std::path::Path) -> CliResult<PipeTable> {
    PipeTable::from_file(path)
        .map_err(|err| config_error(&format!("failed to load {}", path.display()), err))
}

/// Start a manager for `table` on a fresh simulated platform. Must run
/// inside a runtime.
pub(crate) fn start_simulated(
    table: PipeTable,
) -> CliResult<(std::sync::Arc<SimPlatform>, BamManager)> {
    let sim = SimPlatform::new();
    let manager = BamManager::start(table, sim.platform(), ManagerConfig::default())
        .map_err(|err| bam_error("failed to start manager", err))?;
    Ok((sim, manager))
}
