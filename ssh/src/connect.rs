use russh::{
    client::{Config, Handle, Handler, connect_stream},
    keys::{PrivateKey, PrivateKeyWithHashAlg},
};
use std::{io::ErrorKind, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    net::{TcpStream, ToSocketAddrs},
    time::{Instant, sleep},
};
use tracing::{debug, trace};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SshConnectError {
    #[error("timed out after {0:?} connecting to guest via SSH")]
    Timeout(Duration),

    #[error("I/O error while connecting: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    Russh(#[from] russh::Error),

    #[error("SSH authentication (public key) failed for user {username}")]
    AuthFailed { username: String },
}

#[derive(Debug, Clone)]
pub struct SshConnectOptions<Addrs>
where
    Addrs: ToSocketAddrs + Clone + Send,
{
    pub private_key: PrivateKey,
    pub addrs: Addrs,
    pub username: String,
    pub config: Arc<Config>,
    pub timeout: Duration,
}

// Test guests are throwaway, so any host key is accepted.
#[derive(Debug, Clone)]
pub(crate) struct NoCheckHandler;

impl Handler for NoCheckHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn is_retryable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::NotFound
    )
}

/// Connect while the guest's SSH server comes up, then authenticate.
///
/// Only connection-level errors are retried, and only until `timeout`.
/// Authentication failure is returned immediately.
pub(crate) async fn connect_with_retry<Addrs>(
    options: SshConnectOptions<Addrs>,
) -> Result<Handle<NoCheckHandler>, SshConnectError>
where
    Addrs: ToSocketAddrs + Clone + Send,
{
    let SshConnectOptions {
        private_key,
        addrs,
        username,
        config,
        timeout,
    } = options;

    let start = Instant::now();
    let mut attempt: u32 = 0;

    let mut handle = loop {
        attempt += 1;
        trace!(attempt, "Connecting");

        match TcpStream::connect(addrs.clone()).await {
            Ok(stream) => match connect_stream(config.clone(), stream, NoCheckHandler).await {
                Ok(handle) => break handle,
                Err(russh::Error::IO(ref error)) if is_retryable(error.kind()) => {
                    debug!(attempt, %error, "SSH handshake failed, retrying");
                }
                Err(error) => return Err(SshConnectError::from(error)),
            },
            Err(ref error) if is_retryable(error.kind()) => {
                debug!(attempt, %error, "TCP connect failed, retrying");
            }
            Err(error) => return Err(SshConnectError::from(error)),
        }

        if start.elapsed() > timeout {
            return Err(SshConnectError::Timeout(timeout));
        }
        sleep(RETRY_INTERVAL).await;
    };

    let auth = handle
        .authenticate_publickey(
            &username,
            PrivateKeyWithHashAlg::new(Arc::new(private_key), None),
        )
        .await?;

    if !auth.success() {
        return Err(SshConnectError::AuthFailed { username });
    }

    debug!(attempt, elapsed = ?start.elapsed(), "Connected and authenticated");
    Ok(handle)
}
