use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};
use thiserror::Error;
use tokio::time::{Instant, timeout_at};
use topocheck_api::{
    ApiPaths, ApiSession, ConfigurationError, ConfigureStep, InstanceConfigurator,
    InstanceLifecycle, InstancePlan, LifecycleError, NetError, ReadinessPolicy,
    ReadinessPolicyError, TapSubnet,
};
use topocheck_ssh::{RemoteEndpoint, RemoteError, RemoteTransport};
use topocheck_tap::{TapError, TapProvisioner};
use topocheck_topology::{
    ExpectedTopology, ParseError, ReportParser, TopologyMismatch, TopologyRecord, VerifyError,
};
use tracing::{error, info, instrument, warn};

use crate::check::check_topology;

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("scenario has no network interface to reach the guest through")]
    NoNetworkInterface,

    #[error("tap device {name} requested without a tap provisioner")]
    NoTapProvisioner { name: String },

    #[error("guest network is inconsistent with the tap device: {0}")]
    Network(#[from] NetError),

    #[error(transparent)]
    Tap(#[from] TapError),

    #[error("configuration failed: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error(
        "instance start was not confirmed within {waited:?} ({attempts} attempts, last status {last_status})"
    )]
    ReadinessTimeout {
        waited: Duration,
        attempts: u32,
        last_status: u16,
    },

    #[error("scenario did not finish within {0:?}")]
    ScenarioTimeout(Duration),

    #[error("remote check on {endpoint} did not finish before the scenario deadline")]
    RemoteTimeout { endpoint: String },

    #[error("invalid readiness policy: {0}")]
    Readiness(#[source] ReadinessPolicyError),

    #[error("could not connect to guest: {0}")]
    Connection(#[source] RemoteError),

    #[error("remote command channel failed: {0}")]
    Remote(#[source] RemoteError),

    #[error("failed to parse diagnostic output: {0}")]
    Parse(#[source] ParseError),

    #[error("diagnostic command wrote to stderr: {stderr}")]
    StderrNonEmpty { stderr: String },

    #[error("topology mismatch: {0}")]
    TopologyMismatch(#[source] TopologyMismatch),
}

impl From<LifecycleError> for ScenarioError {
    fn from(error: LifecycleError) -> Self {
        match error {
            LifecycleError::Configuration(error) => ScenarioError::Configuration(error),
            LifecycleError::Policy(error) => ScenarioError::Readiness(error),
            LifecycleError::Timeout {
                waited,
                attempts,
                last_status,
                ..
            } => ScenarioError::ReadinessTimeout {
                waited,
                attempts,
                last_status,
            },
        }
    }
}

impl From<VerifyError> for ScenarioError {
    fn from(error: VerifyError) -> Self {
        match error {
            VerifyError::StderrNonEmpty { stderr } => ScenarioError::StderrNonEmpty { stderr },
            VerifyError::Parse(error) => ScenarioError::Parse(error),
            VerifyError::Mismatch(mismatch) => ScenarioError::TopologyMismatch(mismatch),
        }
    }
}

/// Where a scenario is. Moves forward one step at a time; any failure
/// ends in `Failed`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ScenarioState {
    #[default]
    Unconfigured,
    MachineConfigured,
    StorageConfigured,
    BootConfigured,
    NetworkConfigured,
    Started,
    Verified,
    Failed,
}

impl From<ConfigureStep> for ScenarioState {
    fn from(step: ConfigureStep) -> Self {
        match step {
            ConfigureStep::Unconfigured => ScenarioState::Unconfigured,
            ConfigureStep::MachineConfigured => ScenarioState::MachineConfigured,
            ConfigureStep::StorageConfigured => ScenarioState::StorageConfigured,
            ConfigureStep::BootConfigured => ScenarioState::BootConfigured,
            ConfigureStep::NetworkConfigured => ScenarioState::NetworkConfigured,
        }
    }
}

impl Display for ScenarioState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScenarioState::Unconfigured => "unconfigured",
            ScenarioState::MachineConfigured => "machine-configured",
            ScenarioState::StorageConfigured => "storage-configured",
            ScenarioState::BootConfigured => "boot-configured",
            ScenarioState::NetworkConfigured => "network-configured",
            ScenarioState::Started => "started",
            ScenarioState::Verified => "verified",
            ScenarioState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything one scenario run needs to know.
#[derive(Debug, Clone)]
pub struct ScenarioSpec {
    pub plan: InstancePlan,
    pub paths: ApiPaths,
    pub subnet: TapSubnet,
    /// Tap device to create before configuring and remove afterwards.
    /// `None` when the device already exists.
    pub tap_name: Option<String>,
    pub endpoint: RemoteEndpoint,
    pub action_id: String,
    pub readiness: ReadinessPolicy,
    pub expected: ExpectedTopology,
    pub timeout: Duration,
}

/// Boots one instance with a requested CPU shape and checks the topology
/// the guest reports.
pub struct Scenario<'a, A: ApiSession + ?Sized, T: RemoteTransport> {
    api: &'a A,
    transport: &'a T,
    tap: Option<&'a dyn TapProvisioner>,
    parser: &'a dyn ReportParser,
    state: ScenarioState,
    tap_created: bool,
}

impl<'a, A: ApiSession + ?Sized, T: RemoteTransport> Scenario<'a, A, T> {
    pub fn new(
        api: &'a A,
        transport: &'a T,
        tap: Option<&'a dyn TapProvisioner>,
        parser: &'a dyn ReportParser,
    ) -> Self {
        Self {
            api,
            transport,
            tap,
            parser,
            state: ScenarioState::Unconfigured,
            tap_created: false,
        }
    }

    pub fn state(&self) -> ScenarioState {
        self.state
    }

    /// Configure, boot and check one instance, bounded by the scenario
    /// timeout. The command channel and a tap device created on the way
    /// are released on every path, including when the timeout fires.
    #[instrument(skip_all, fields(
        vcpu_count = spec.plan.machine.vcpu_count(),
        ht_enabled = spec.plan.machine.ht_enabled()
    ))]
    pub async fn run(&mut self, spec: &ScenarioSpec) -> Result<TopologyRecord, ScenarioError> {
        let deadline = Instant::now() + spec.timeout;
        let outcome = match timeout_at(deadline, self.boot(spec)).await {
            Ok(Ok(endpoint)) => {
                check_topology(
                    self.transport,
                    &endpoint,
                    self.parser,
                    &spec.expected,
                    deadline,
                )
                .await
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ScenarioError::ScenarioTimeout(spec.timeout)),
        };
        let outcome = self.release_tap(spec, outcome).await;

        match outcome {
            Ok(record) => {
                self.state = ScenarioState::Verified;
                info!("Scenario passed");
                Ok(record)
            }
            Err(error) => {
                error!(%error, state = %self.state, "Scenario failed");
                self.state = ScenarioState::Failed;
                Err(error)
            }
        }
    }

    /// Everything up to a confirmed start. Returns the guest endpoint.
    async fn boot(&mut self, spec: &ScenarioSpec) -> Result<RemoteEndpoint, ScenarioError> {
        spec.readiness.validate().map_err(ScenarioError::Readiness)?;
        let guest_mac = spec
            .plan
            .network_interfaces
            .first()
            .map(|iface| iface.guest_mac_address)
            .ok_or(ScenarioError::NoNetworkInterface)?;
        spec.subnet.check_guest(guest_mac.guest_ip())?;

        if let Some(name) = &spec.tap_name {
            let provisioner = self
                .tap
                .ok_or_else(|| ScenarioError::NoTapProvisioner { name: name.clone() })?;
            // A cancelled provision still needs teardown; a failed one has
            // already cleaned up.
            self.tap_created = true;
            if let Err(error) = provisioner.provision(name, &spec.subnet).await {
                self.tap_created = false;
                return Err(error.into());
            }
        }

        let mut configurator = InstanceConfigurator::new(self.api, &spec.paths);
        let configured = configurator.apply(&spec.plan).await;
        self.state = configurator.step().into();
        configured?;

        let lifecycle = InstanceLifecycle::new(self.api, &spec.paths, guest_mac);
        let mut endpoint = spec.endpoint.clone();
        endpoint.set_hostname(lifecycle.address().to_string());

        lifecycle.start(&spec.action_id).await?;
        self.state = ScenarioState::Started;
        lifecycle
            .await_ready(&spec.action_id, &spec.readiness)
            .await?;
        Ok(endpoint)
    }

    async fn release_tap(
        &mut self,
        spec: &ScenarioSpec,
        outcome: Result<TopologyRecord, ScenarioError>,
    ) -> Result<TopologyRecord, ScenarioError> {
        let (Some(name), Some(provisioner), true) = (&spec.tap_name, self.tap, self.tap_created)
        else {
            return outcome;
        };
        self.tap_created = false;

        match (outcome, provisioner.teardown(name).await) {
            (outcome, Ok(())) => outcome,
            (Ok(_), Err(error)) => Err(error.into()),
            (Err(error), Err(teardown_error)) => {
                warn!(%teardown_error, "Failed to remove tap device");
                Err(error)
            }
        }
    }
}
