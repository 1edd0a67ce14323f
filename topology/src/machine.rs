use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineConfigError {
    #[error("vcpu_count must be at least 1")]
    NoVcpus,

    #[error("vcpu_count must be 1 or even when hyperthreading is enabled, got {vcpu_count}")]
    OddVcpusWithHyperthreading { vcpu_count: u16 },
}

/// Requested machine shape. Serializes to the body of the machine
/// configuration call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawMachineConfig")]
pub struct MachineConfig {
    vcpu_count: u16,
    ht_enabled: bool,
}

#[derive(Deserialize)]
struct RawMachineConfig {
    vcpu_count: u16,
    #[serde(default)]
    ht_enabled: bool,
}

impl TryFrom<RawMachineConfig> for MachineConfig {
    type Error = MachineConfigError;

    fn try_from(raw: RawMachineConfig) -> Result<Self, Self::Error> {
        Self::new(raw.vcpu_count, raw.ht_enabled)
    }
}

impl MachineConfig {
    pub fn new(vcpu_count: u16, ht_enabled: bool) -> Result<Self, MachineConfigError> {
        if vcpu_count == 0 {
            return Err(MachineConfigError::NoVcpus);
        }
        if ht_enabled && vcpu_count > 1 && vcpu_count % 2 != 0 {
            return Err(MachineConfigError::OddVcpusWithHyperthreading { vcpu_count });
        }
        Ok(Self {
            vcpu_count,
            ht_enabled,
        })
    }

    pub fn vcpu_count(&self) -> u16 {
        self.vcpu_count
    }

    pub fn ht_enabled(&self) -> bool {
        self.ht_enabled
    }

    pub fn threads_per_core(&self) -> u16 {
        if self.ht_enabled && self.vcpu_count > 1 {
            2
        } else {
            1
        }
    }

    pub fn cores_per_socket(&self) -> u16 {
        self.vcpu_count / self.threads_per_core()
    }
}
