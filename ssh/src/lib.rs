mod command;
mod connect;
mod keypair;
mod remote;

pub use crate::command::SshCommandError;
pub use crate::connect::{SshConnectError, SshConnectOptions};
pub use crate::keypair::{SshKeypairError, load_private_key};
pub use crate::remote::{
    CommandChannel, CommandOutput, OutputStream, RemoteEndpoint, RemoteError, RemoteTransport,
};

use async_trait::async_trait;
use russh::client::{Config, Handle};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::net::ToSocketAddrs;
use tracing::info;

use crate::connect::{NoCheckHandler, connect_with_retry};

#[derive(Error, Debug)]
pub enum SshError {
    #[error(transparent)]
    Connect(#[from] SshConnectError),

    #[error(transparent)]
    Command(#[from] SshCommandError),

    #[error(transparent)]
    Keypair(#[from] SshKeypairError),

    #[error("failed to disconnect: {error}")]
    Disconnect {
        #[source]
        error: russh::Error,
    },
}

/// An authenticated SSH connection to one guest.
pub struct Ssh {
    handle: Handle<NoCheckHandler>,
}

impl Ssh {
    /// Connect to the SSH server with retry and public key auth.
    #[tracing::instrument(skip(options))]
    pub async fn connect<Addrs>(options: SshConnectOptions<Addrs>) -> Result<Self, SshError>
    where
        Addrs: ToSocketAddrs + Clone + Send,
    {
        let handle = connect_with_retry(options).await?;
        Ok(Self { handle })
    }

    /// Execute a remote command and collect its output.
    #[tracing::instrument(skip(self))]
    pub async fn command(&mut self, command: &str) -> Result<CommandOutput, SshError> {
        command::ssh_command(&self.handle, command)
            .await
            .map_err(SshError::Command)
    }

    #[tracing::instrument(skip(self))]
    pub async fn disconnect(self) -> Result<(), SshError> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
            .map_err(|error| SshError::Disconnect { error })
    }
}

/// Opens SSH command channels to guests.
#[derive(Debug, Clone)]
pub struct SshTransport {
    config: Arc<Config>,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            config: Arc::new(Config::default()),
            connect_timeout,
        }
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    type Channel = Ssh;

    async fn open(&self, endpoint: &RemoteEndpoint) -> Result<Ssh, RemoteError> {
        let connect_error = |source: SshError| RemoteError::Connect {
            endpoint: endpoint.to_string(),
            source: Box::new(source),
        };

        let private_key = load_private_key(&endpoint.private_key_path)
            .await
            .map_err(|error| connect_error(error.into()))?;

        let options = SshConnectOptions {
            private_key,
            addrs: (endpoint.hostname.as_str(), endpoint.port),
            username: endpoint.username.clone(),
            config: self.config.clone(),
            timeout: self.connect_timeout,
        };
        let ssh = Ssh::connect(options).await.map_err(connect_error)?;

        info!(%endpoint, "Opened command channel");
        Ok(ssh)
    }
}

#[async_trait]
impl CommandChannel for Ssh {
    async fn execute(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.command(command)
            .await
            .map_err(|error| RemoteError::Execute {
                command: command.to_owned(),
                source: Box::new(error),
            })
    }

    async fn close(self) -> Result<(), RemoteError> {
        self.disconnect().await.map_err(|error| RemoteError::Close {
            source: Box::new(error),
        })
    }
}
