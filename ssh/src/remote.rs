use async_trait::async_trait;
use std::{
    fmt::{self, Display, Formatter},
    io::{self, BufRead, Cursor, Read},
    path::PathBuf,
};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("failed to open command channel to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to execute remote command `{command}`: {source}")]
    Execute {
        command: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to close command channel: {source}")]
    Close {
        #[source]
        source: BoxError,
    },
}

/// Where and as whom to open a command channel.
///
/// Starts out with a placeholder hostname; the real address is only known
/// once the guest network interface has been configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub private_key_path: PathBuf,
}

impl RemoteEndpoint {
    pub const PLACEHOLDER_HOSTNAME: &'static str = "unknown";

    pub fn new(username: impl Into<String>, port: u16, private_key_path: PathBuf) -> Self {
        Self {
            hostname: Self::PLACEHOLDER_HOSTNAME.to_owned(),
            port,
            username: username.into(),
            private_key_path,
        }
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = hostname.into();
    }

    pub fn has_placeholder_hostname(&self) -> bool {
        self.hostname == Self::PLACEHOLDER_HOSTNAME
    }
}

impl Display for RemoteEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.port)
    }
}

/// One output stream of a remote command. Read it once, front to back.
#[derive(Debug, Default)]
pub struct OutputStream(Cursor<Vec<u8>>);

impl OutputStream {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Cursor::new(bytes))
    }

    /// Lazily yields the remaining lines.
    pub fn lines(self) -> io::Lines<Self> {
        BufRead::lines(self)
    }

    /// The remaining bytes, decoded lossily.
    pub fn into_string(self) -> String {
        let position = self.0.position() as usize;
        let bytes = self.0.into_inner();
        String::from_utf8_lossy(bytes.get(position..).unwrap_or_default()).into_owned()
    }
}

impl From<&str> for OutputStream {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl Read for OutputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl BufRead for OutputStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.0.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.0.consume(amt)
    }
}

/// Output of one remote command.
#[derive(Debug, Default)]
pub struct CommandOutput {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub exit_status: Option<u32>,
}

/// Opens command channels.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    type Channel: CommandChannel;

    async fn open(&self, endpoint: &RemoteEndpoint) -> Result<Self::Channel, RemoteError>;
}

/// An open command channel into a guest. `close` consumes the channel, so
/// it can only happen once.
#[async_trait]
pub trait CommandChannel: Send + Sized {
    async fn execute(&mut self, command: &str) -> Result<CommandOutput, RemoteError>;

    async fn close(self) -> Result<(), RemoteError>;
}
