use tokio::time::{Instant, timeout_at};
use topocheck_ssh::{CommandChannel, CommandOutput, RemoteEndpoint, RemoteTransport};
use topocheck_topology::{ExpectedTopology, ReportParser, TopologyRecord, verify_report};
use tracing::{info, instrument, warn};

use crate::scenario::ScenarioError;

/// Run the diagnostic command in the guest and verify its report.
///
/// Opening the channel and running the diagnostic must finish by
/// `deadline`. Once opened, the channel is closed on every path, including
/// when the deadline passes. A failure to close is only reported when the
/// check itself succeeded.
#[instrument(skip_all, fields(%endpoint))]
pub async fn check_topology<T: RemoteTransport>(
    transport: &T,
    endpoint: &RemoteEndpoint,
    parser: &dyn ReportParser,
    expected: &ExpectedTopology,
    deadline: Instant,
) -> Result<TopologyRecord, ScenarioError> {
    let timed_out = || ScenarioError::RemoteTimeout {
        endpoint: endpoint.to_string(),
    };

    let mut channel = timeout_at(deadline, transport.open(endpoint))
        .await
        .map_err(|_| timed_out())?
        .map_err(ScenarioError::Connection)?;

    let outcome = timeout_at(deadline, run_diagnostic(&mut channel, parser, expected))
        .await
        .unwrap_or_else(|_| Err(timed_out()));
    let closed = channel.close().await;

    match (outcome, closed) {
        (Ok(record), Ok(())) => {
            info!(attributes = record.len(), "Topology verified");
            Ok(record)
        }
        (Ok(_), Err(error)) => Err(ScenarioError::Remote(error)),
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(close_error)) => {
            warn!(%close_error, "Failed to close command channel");
            Err(error)
        }
    }
}

async fn run_diagnostic<C: CommandChannel>(
    channel: &mut C,
    parser: &dyn ReportParser,
    expected: &ExpectedTopology,
) -> Result<TopologyRecord, ScenarioError> {
    let CommandOutput {
        mut stdout,
        stderr,
        exit_status,
    } = channel
        .execute(parser.command())
        .await
        .map_err(ScenarioError::Remote)?;

    if exit_status.is_some_and(|status| status != 0) {
        warn!(?exit_status, "Diagnostic command exited unsuccessfully");
    }

    let stderr = stderr.into_string();
    let record = verify_report(&stderr, &mut stdout, parser, expected)?;
    Ok(record)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };
    use topocheck_ssh::{OutputStream, RemoteError};
    use topocheck_topology::{LscpuParser, MachineConfig};

    pub(crate) const LSCPU_2_VCPUS: &str = "\
Architecture:        x86_64
CPU op-mode(s):      32-bit, 64-bit
Byte Order:          Little Endian
CPU(s):              2
On-line CPU(s) list: 0,1
Thread(s) per core:  1
Core(s) per socket:  2
Socket(s):           1
NUMA node(s):        1
Vendor ID:           GenuineIntel
";

    /// Serves canned command output and counts opens and closes.
    #[derive(Clone, Default)]
    pub(crate) struct FakeTransport {
        pub stdout: String,
        pub stderr: String,
        pub refuse_connection: bool,
        pub hang: bool,
        pub fail_close: bool,
        pub opened: Arc<AtomicUsize>,
        pub closed: Arc<AtomicUsize>,
        pub hosts: Arc<Mutex<Vec<String>>>,
        pub commands: Arc<Mutex<Vec<String>>>,
    }

    impl FakeTransport {
        pub(crate) fn reporting(stdout: &str) -> Self {
            Self {
                stdout: stdout.to_owned(),
                ..Default::default()
            }
        }
    }

    pub(crate) struct FakeChannel(FakeTransport);

    fn fake_error(message: &str) -> Box<dyn std::error::Error + Send + Sync> {
        message.into()
    }

    #[async_trait]
    impl RemoteTransport for FakeTransport {
        type Channel = FakeChannel;

        async fn open(&self, endpoint: &RemoteEndpoint) -> Result<FakeChannel, RemoteError> {
            self.hosts.lock().unwrap().push(endpoint.hostname.clone());
            if self.refuse_connection {
                return Err(RemoteError::Connect {
                    endpoint: endpoint.to_string(),
                    source: fake_error("connection refused"),
                });
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeChannel(self.clone()))
        }
    }

    #[async_trait]
    impl CommandChannel for FakeChannel {
        async fn execute(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
            self.0.commands.lock().unwrap().push(command.to_owned());
            if self.0.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(CommandOutput {
                stdout: OutputStream::from(self.0.stdout.as_str()),
                stderr: OutputStream::from(self.0.stderr.as_str()),
                exit_status: Some(0),
            })
        }

        async fn close(self) -> Result<(), RemoteError> {
            self.0.closed.fetch_add(1, Ordering::SeqCst);
            if self.0.fail_close {
                return Err(RemoteError::Close {
                    source: fake_error("broken pipe"),
                });
            }
            Ok(())
        }
    }

    fn endpoint() -> RemoteEndpoint {
        let mut endpoint = RemoteEndpoint::new("root", 22, "/keys/id_rsa".into());
        endpoint.set_hostname("192.168.241.2");
        endpoint
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn expected() -> ExpectedTopology {
        ExpectedTopology::for_machine(&MachineConfig::new(2, false).unwrap())
    }

    #[tokio::test]
    async fn runs_lscpu_and_verifies() {
        let transport = FakeTransport::reporting(LSCPU_2_VCPUS);

        let record = check_topology(
            &transport,
            &endpoint(),
            &LscpuParser,
            &expected(),
            deadline(),
        )
        .await
        .unwrap();

        assert_eq!(record.get("Vendor ID"), Some("GenuineIntel"));
        assert_eq!(*transport.commands.lock().unwrap(), vec!["lscpu"]);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mismatch_still_closes_channel() {
        let transport = FakeTransport::reporting(&LSCPU_2_VCPUS.replace(
            "CPU(s):              2",
            "CPU(s):              4",
        ));

        let err = check_topology(
            &transport,
            &endpoint(),
            &LscpuParser,
            &expected(),
            deadline(),
        )
        .await
        .unwrap_err();

        match err {
            ScenarioError::TopologyMismatch(mismatch) => {
                assert_eq!(mismatch.key, "CPU(s)");
                assert_eq!(mismatch.expected, "2");
                assert_eq!(mismatch.actual.as_deref(), Some("4"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stderr_output_is_its_own_failure() {
        let transport = FakeTransport {
            stderr: "lscpu: failed to determine number of CPUs".to_owned(),
            ..FakeTransport::reporting(LSCPU_2_VCPUS)
        };

        let err = check_topology(
            &transport,
            &endpoint(),
            &LscpuParser,
            &expected(),
            deadline(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ScenarioError::StderrNonEmpty { .. }));
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_report_is_parse_failure() {
        let transport = FakeTransport::reporting("CPU(s) 2\n");

        let err = check_topology(
            &transport,
            &endpoint(),
            &LscpuParser,
            &expected(),
            deadline(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ScenarioError::Parse(_)));
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_connection_is_connection_failure() {
        let transport = FakeTransport {
            refuse_connection: true,
            ..Default::default()
        };

        let err = check_topology(
            &transport,
            &endpoint(),
            &LscpuParser,
            &expected(),
            deadline(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ScenarioError::Connection(_)));
        assert_eq!(transport.opened.load(Ordering::SeqCst), 0);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_failure_does_not_mask_check_failure() {
        let transport = FakeTransport {
            fail_close: true,
            ..FakeTransport::reporting("CPU(s): 4\n")
        };

        let err = check_topology(
            &transport,
            &endpoint(),
            &LscpuParser,
            &expected(),
            deadline(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScenarioError::TopologyMismatch(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_diagnostic_is_cut_off_and_closed() {
        let transport = FakeTransport {
            hang: true,
            ..FakeTransport::reporting(LSCPU_2_VCPUS)
        };
        let started = Instant::now();

        let err = check_topology(
            &transport,
            &endpoint(),
            &LscpuParser,
            &expected(),
            started + Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ScenarioError::RemoteTimeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_failure_after_success_is_reported() {
        let transport = FakeTransport {
            fail_close: true,
            ..FakeTransport::reporting(LSCPU_2_VCPUS)
        };

        let err = check_topology(
            &transport,
            &endpoint(),
            &LscpuParser,
            &expected(),
            deadline(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScenarioError::Remote(RemoteError::Close { .. })));
    }
}
