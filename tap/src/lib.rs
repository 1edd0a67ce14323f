mod command;

pub use crate::command::{Command, CommandError};

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use topocheck_api::TapSubnet;
use tracing::{info, instrument, warn};

#[derive(Error, Debug)]
pub enum TapError {
    #[error("failed to provision tap device {name}: {source}")]
    Provision {
        name: String,
        #[source]
        source: CommandError,
    },

    #[error("failed to remove tap device {name}: {source}")]
    Teardown {
        name: String,
        #[source]
        source: CommandError,
    },
}

/// Creates and removes the host side of a guest network interface.
#[async_trait]
pub trait TapProvisioner: Send + Sync {
    /// Create and bring up the device. On failure nothing is left behind.
    async fn provision(&self, name: &str, subnet: &TapSubnet) -> Result<(), TapError>;

    async fn teardown(&self, name: &str) -> Result<(), TapError>;
}

/// Manages tap devices with iproute2.
#[derive(Debug, Clone)]
pub struct IpTapProvisioner {
    program: PathBuf,
    sudo: bool,
}

impl Default for IpTapProvisioner {
    fn default() -> Self {
        Self::new(false)
    }
}

impl IpTapProvisioner {
    pub fn new(sudo: bool) -> Self {
        Self {
            program: PathBuf::from("ip"),
            sudo,
        }
    }

    /// Use another `ip` binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn ip<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if self.sudo { cmd.sudo() } else { cmd }
    }

    pub fn provision_commands(&self, name: &str, subnet: &TapSubnet) -> Vec<Command> {
        let cidr = subnet.to_string();
        vec![
            self.ip(["tuntap", "add", "dev", name, "mode", "tap"]),
            self.ip(["addr", "add", cidr.as_str(), "dev", name]),
            self.ip(["link", "set", name, "up"]),
        ]
    }

    pub fn teardown_command(&self, name: &str) -> Command {
        self.ip(["link", "del", name])
    }
}

#[async_trait]
impl TapProvisioner for IpTapProvisioner {
    #[instrument(skip(self))]
    async fn provision(&self, name: &str, subnet: &TapSubnet) -> Result<(), TapError> {
        let mut commands = self.provision_commands(name, subnet).into_iter();
        let provision_error = |source| TapError::Provision {
            name: name.to_owned(),
            source,
        };

        // Creating the device; nothing to undo if this fails.
        if let Some(mut create) = commands.next() {
            create.run().await.map_err(provision_error)?;
        }

        for mut cmd in commands {
            if let Err(source) = cmd.run().await {
                if let Err(teardown_error) = self.teardown_command(name).run().await {
                    warn!(%teardown_error, "Failed to remove partially provisioned tap device");
                }
                return Err(provision_error(source));
            }
        }
        info!(%subnet, "Tap device ready");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn teardown(&self, name: &str) -> Result<(), TapError> {
        self.teardown_command(name)
            .run()
            .await
            .map_err(|source| TapError::Teardown {
                name: name.to_owned(),
                source,
            })?;
        info!("Tap device removed");
        Ok(())
    }
}
