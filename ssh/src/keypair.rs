use russh::keys::PrivateKey;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SshKeypairError {
    #[error("failed to read SSH private key {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode SSH private key {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: russh::keys::ssh_key::Error,
    },
}

/// Load an unencrypted private key in OpenSSH format.
#[tracing::instrument]
pub async fn load_private_key(path: &Path) -> Result<PrivateKey, SshKeypairError> {
    let string = fs::read_to_string(path)
        .await
        .map_err(|source| SshKeypairError::Read {
            path: path.to_owned(),
            source,
        })?;

    let private_key = PrivateKey::from_openssh(&string).map_err(|source| SshKeypairError::Decode {
        path: path.to_owned(),
        source,
    })?;

    debug!(algorithm = %private_key.algorithm(), "Loaded SSH private key");
    Ok(private_key)
}
