use std::ffi::OsStr;
use std::fmt::Display;
use std::process::{Output, Stdio};
use thiserror::Error;
use tokio::process::Command as BaseCommand;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn command: {command}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },

    #[error("command failed: {command}\n{stderr}")]
    Failure { command: String, stderr: String },
}

/// A host command whose failure carries its full command line and stderr.
#[derive(Debug)]
pub struct Command {
    cmd: BaseCommand,
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cmd = self.cmd.as_std();
        write!(f, "{}", cmd.get_program().to_string_lossy())?;
        for arg in cmd.get_args() {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            cmd: BaseCommand::new(program),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.cmd.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.cmd.args(args);
        self
    }

    /// The same command, run non-interactively through `sudo`.
    pub fn sudo(self) -> Self {
        let mut privileged_cmd = Command::new("sudo");
        let cmd = self.cmd.as_std();
        privileged_cmd
            .arg("-n") // non-interactive
            .arg(cmd.get_program())
            .args(cmd.get_args());
        privileged_cmd
    }

    pub async fn output(&mut self) -> Result<Output, CommandError> {
        self.cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|error| CommandError::Spawn {
                command: self.to_string(),
                error,
            })
    }

    /// Run to completion, failing on a non-zero exit status.
    pub async fn run(&mut self) -> Result<Output, CommandError> {
        let output = self.output().await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(CommandError::Failure {
                command: self.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_owned(),
            })
        }
    }
}
