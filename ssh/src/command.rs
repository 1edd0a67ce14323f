use russh::{ChannelMsg, client::Handle};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::{
    connect::NoCheckHandler,
    remote::{CommandOutput, OutputStream},
};

// SSH extended data type code for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

#[derive(Error, Debug)]
pub enum SshCommandError {
    #[error("failed to open SSH session channel: {0}")]
    ChannelOpen(#[source] russh::Error),

    #[error("failed to execute remote command `{command}`: {source}")]
    Exec {
        command: String,
        #[source]
        source: russh::Error,
    },
}

/// Run one command on a fresh session channel and collect stdout, stderr
/// and the exit status until the server closes the channel.
#[instrument(skip(handle))]
pub(crate) async fn ssh_command(
    handle: &Handle<NoCheckHandler>,
    command: &str,
) -> Result<CommandOutput, SshCommandError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(SshCommandError::ChannelOpen)?;

    info!("Executing remote command");

    channel
        .exec(true, command)
        .await
        .map_err(|source| SshCommandError::Exec {
            command: command.to_owned(),
            source,
        })?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;

    // The exit status may arrive after EOF, so read until the channel closes.
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                stderr.extend_from_slice(&data)
            }
            ChannelMsg::ExitStatus { exit_status: status } => {
                debug!(status, "Remote process reported exit status");
                exit_status = Some(status);
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    info!(
        ?exit_status,
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        "Remote command completed"
    );

    Ok(CommandOutput {
        stdout: OutputStream::new(stdout),
        stderr: OutputStream::new(stderr),
        exit_status,
    })
}
