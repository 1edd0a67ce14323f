use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use topocheck_topology::MachineConfig;
use tracing::{debug, info, instrument};

use crate::{
    models::{BlockDeviceSpec, BootSourceSpec, NetworkInterfaceSpec},
    paths::{ApiPaths, InvalidResourceId},
    session::{ApiError, ApiSession},
};

/// A management API call, named for error reporting.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApiCall {
    MachineConfig,
    BlockDevice,
    BootSource,
    NetworkInterface,
    InstanceStart,
    ActionStatus,
}

impl Display for ApiCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApiCall::MachineConfig => "machine configuration",
            ApiCall::BlockDevice => "block device",
            ApiCall::BootSource => "boot source",
            ApiCall::NetworkInterface => "network interface",
            ApiCall::InstanceStart => "instance start",
            ApiCall::ActionStatus => "action status",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("{call} call was rejected with status {status}: {body}")]
    Rejected {
        call: ApiCall,
        status: u16,
        body: String,
    },

    #[error("{call} call is not allowed once the instance is {step}")]
    OutOfOrder { call: ApiCall, step: ConfigureStep },

    #[error("instance plan has no root block device")]
    MissingRootDevice,

    #[error("failed to encode {call} request body: {source}")]
    Encode {
        call: ApiCall,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    InvalidId(#[from] InvalidResourceId),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// How far pre-boot configuration has progressed. Calls must follow
/// machine shape, storage, boot source, network.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigureStep {
    #[default]
    Unconfigured,
    MachineConfigured,
    StorageConfigured,
    BootConfigured,
    NetworkConfigured,
}

impl Display for ConfigureStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigureStep::Unconfigured => "unconfigured",
            ConfigureStep::MachineConfigured => "machine-configured",
            ConfigureStep::StorageConfigured => "storage-configured",
            ConfigureStep::BootConfigured => "boot-configured",
            ConfigureStep::NetworkConfigured => "network-configured",
        };
        f.write_str(name)
    }
}

/// Everything needed to configure an instance before boot.
#[derive(Debug, Clone)]
pub struct InstancePlan {
    pub machine: MachineConfig,
    pub drives: Vec<BlockDeviceSpec>,
    pub boot_source: BootSourceSpec,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
}

/// Issues the pre-boot configuration calls for one instance, refusing any
/// call made out of order.
pub struct InstanceConfigurator<'a, S: ApiSession + ?Sized> {
    session: &'a S,
    paths: &'a ApiPaths,
    step: ConfigureStep,
}

impl<'a, S: ApiSession + ?Sized> InstanceConfigurator<'a, S> {
    pub fn new(session: &'a S, paths: &'a ApiPaths) -> Self {
        Self {
            session,
            paths,
            step: ConfigureStep::Unconfigured,
        }
    }

    pub fn step(&self) -> ConfigureStep {
        self.step
    }

    /// Configure every subsystem of the plan, always in the required order.
    #[instrument(skip_all)]
    pub async fn apply(&mut self, plan: &InstancePlan) -> Result<(), ConfigurationError> {
        if !plan.drives.iter().any(|drive| drive.is_root) {
            return Err(ConfigurationError::MissingRootDevice);
        }

        self.machine_config(&plan.machine).await?;
        for drive in &plan.drives {
            self.block_device(drive).await?;
        }
        self.boot_source(&plan.boot_source).await?;
        for iface in &plan.network_interfaces {
            self.network_interface(iface).await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(vcpu_count = machine.vcpu_count(), ht_enabled = machine.ht_enabled()))]
    pub async fn machine_config(&mut self, machine: &MachineConfig) -> Result<(), ConfigurationError> {
        self.expect_step(ApiCall::MachineConfig, &[ConfigureStep::Unconfigured])?;
        put_checked(self.session, ApiCall::MachineConfig, &self.paths.machine_config, machine).await?;
        self.advance(ConfigureStep::MachineConfigured);
        Ok(())
    }

    #[instrument(skip_all, fields(drive_id = %drive.drive_id))]
    pub async fn block_device(&mut self, drive: &BlockDeviceSpec) -> Result<(), ConfigurationError> {
        self.expect_step(
            ApiCall::BlockDevice,
            &[ConfigureStep::MachineConfigured, ConfigureStep::StorageConfigured],
        )?;
        let path = self.paths.drive(&drive.drive_id)?;
        put_checked(self.session, ApiCall::BlockDevice, &path, drive).await?;
        self.advance(ConfigureStep::StorageConfigured);
        Ok(())
    }

    #[instrument(skip_all, fields(boot_source_id = %boot_source.id))]
    pub async fn boot_source(&mut self, boot_source: &BootSourceSpec) -> Result<(), ConfigurationError> {
        self.expect_step(ApiCall::BootSource, &[ConfigureStep::StorageConfigured])?;
        put_checked(self.session, ApiCall::BootSource, &self.paths.boot_source, boot_source).await?;
        self.advance(ConfigureStep::BootConfigured);
        Ok(())
    }

    #[instrument(skip_all, fields(iface_id = %iface.iface_id, guest_mac = %iface.guest_mac_address))]
    pub async fn network_interface(
        &mut self,
        iface: &NetworkInterfaceSpec,
    ) -> Result<(), ConfigurationError> {
        self.expect_step(
            ApiCall::NetworkInterface,
            &[ConfigureStep::BootConfigured, ConfigureStep::NetworkConfigured],
        )?;
        let path = self.paths.network_interface(&iface.iface_id)?;
        put_checked(self.session, ApiCall::NetworkInterface, &path, iface).await?;
        self.advance(ConfigureStep::NetworkConfigured);
        Ok(())
    }

    fn expect_step(&self, call: ApiCall, allowed: &[ConfigureStep]) -> Result<(), ConfigurationError> {
        if allowed.contains(&self.step) {
            Ok(())
        } else {
            Err(ConfigurationError::OutOfOrder {
                call,
                step: self.step,
            })
        }
    }

    fn advance(&mut self, step: ConfigureStep) {
        if step != self.step {
            info!(from = %self.step, to = %step, "Configuration advanced");
            self.step = step;
        }
    }
}

/// `PUT` a JSON body and fail unless the session calls the status good.
pub(crate) async fn put_checked<S, B>(
    session: &S,
    call: ApiCall,
    path: &str,
    body: &B,
) -> Result<(), ConfigurationError>
where
    S: ApiSession + ?Sized,
    B: Serialize,
{
    let body = serde_json::to_value(body).map_err(|source| ConfigurationError::Encode { call, source })?;
    debug!(%call, path, %body, "Sending configuration call");
    let response = session.put(path, &body).await?;
    if !session.is_good_response(response.status) {
        return Err(ConfigurationError::Rejected {
            call,
            status: response.status,
            body: response.body,
        });
    }
    Ok(())
}
