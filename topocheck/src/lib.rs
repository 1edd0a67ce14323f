mod check;
mod config;
mod scenario;

pub use crate::check::check_topology;
pub use crate::config::{CONFIG_FILE_NAME, Config, ConfigError};
pub use crate::scenario::{Scenario, ScenarioError, ScenarioSpec, ScenarioState};

use clap::{Parser, Subcommand};
use std::{env, io, path::PathBuf};
use thiserror::Error;
use tokio::fs::read_to_string;
use topocheck_api::{ApiError, HttpApiSession};
use topocheck_ssh::SshTransport;
use topocheck_tap::{IpTapProvisioner, TapProvisioner};
use topocheck_topology::{
    ExpectedTopology, LscpuParser, MachineConfig, MachineConfigError, VerifyError, verify_report,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "topocheck",
    version,
    about = "Boot a guest with a requested CPU shape and check the topology it reports"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Scenario file, or a directory holding `topocheck.toml`.
    #[arg(long = "config", global = true, env = "TOPOCHECK_CONFIG")]
    pub config_path: Option<PathBuf>,

    #[arg(long = "log", global = true, default_value = "info")]
    pub log: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Configure, boot and check one instance
    Run,
    /// Verify a saved `lscpu` report against the configured expectation
    Check {
        /// Report file
        report: PathBuf,
    },
    /// Print the topology a guest should report for a machine shape
    Expected {
        #[arg(long = "vcpus")]
        vcpu_count: u16,

        #[arg(long = "ht")]
        ht_enabled: bool,
    },
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Machine(#[from] MachineConfigError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Scenario(#[from] ScenarioError),

    #[error("failed to read report {path}: {source}")]
    ReadReport {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("report {path} failed verification: {source}")]
    Verify {
        path: PathBuf,
        #[source]
        source: VerifyError,
    },
}

pub async fn get_config(cli: &Cli) -> Result<Config, AppError> {
    let config_path = cli
        .config_path
        .clone()
        .or_else(|| env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let config = Config::load(&config_path).await?;
    Ok(config)
}

pub async fn run(cli: Cli) -> Result<(), AppError> {
    match &cli.command {
        Command::Run => cmd_run(get_config(&cli).await?).await,
        Command::Check { report } => cmd_check(get_config(&cli).await?, report.clone()).await,
        Command::Expected {
            vcpu_count,
            ht_enabled,
        } => cmd_expected(*vcpu_count, *ht_enabled),
    }
}

async fn cmd_run(config: Config) -> Result<(), AppError> {
    let spec = config.scenario()?;
    let api = HttpApiSession::new(&config.api_url)?;
    let transport = SshTransport::new(config.ssh.connect_timeout);
    let provisioner = IpTapProvisioner::new(config.network.sudo);
    let tap = spec
        .tap_name
        .is_some()
        .then_some(&provisioner as &dyn TapProvisioner);

    let mut scenario = Scenario::new(&api, &transport, tap, &LscpuParser);
    let record = scenario.run(&spec).await?;
    print!("{record}");
    Ok(())
}

async fn cmd_check(config: Config, path: PathBuf) -> Result<(), AppError> {
    let report = match read_to_string(&path).await {
        Ok(report) => report,
        Err(source) => return Err(AppError::ReadReport { path, source }),
    };

    let expected = config.expected();
    match verify_report("", &mut report.as_bytes(), &LscpuParser, &expected) {
        Ok(record) => {
            info!(path = %path.display(), attributes = record.len(), "Report verified");
            Ok(())
        }
        Err(source) => Err(AppError::Verify { path, source }),
    }
}

fn cmd_expected(vcpu_count: u16, ht_enabled: bool) -> Result<(), AppError> {
    let machine = MachineConfig::new(vcpu_count, ht_enabled)?;
    let expected = ExpectedTopology::for_machine(&machine);
    for (key, value) in expected.iter() {
        println!("{key}: {value}");
    }
    Ok(())
}
