use serde::Deserialize;
use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::fs::read_to_string;
use topocheck_api::{
    ApiPaths, AttachmentState, BlockDeviceSpec, BootSourceSpec, GuestMac, InstancePlan,
    NetworkInterfaceSpec, Permissions, ReadinessPolicy, TapSubnet, duration,
};
use topocheck_ssh::RemoteEndpoint;
use topocheck_topology::{ExpectedTopology, MachineConfig};

use crate::scenario::ScenarioSpec;

pub const CONFIG_FILE_NAME: &str = "topocheck.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("network needs `guest_ip` or `guest_mac`")]
    MissingGuestAddress,

    #[error("guest_ip {guest_ip} does not match guest_mac {guest_mac}")]
    GuestAddressConflict {
        guest_ip: Ipv4Addr,
        guest_mac: GuestMac,
    },
}

/// One topology check scenario, as read from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api_url: String,
    #[serde(default)]
    pub api_paths: ApiPaths,
    #[serde(
        default = "default_scenario_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub scenario_timeout: Duration,
    #[serde(default = "default_id")]
    pub action_id: String,
    pub machine: MachineConfig,
    pub rootfs: RootfsConfig,
    pub kernel: KernelConfig,
    pub network: NetworkConfig,
    pub ssh: SshConfig,
    #[serde(default)]
    pub readiness: ReadinessPolicy,
    /// Attributes to check. Derived from `machine` when absent.
    pub expected: Option<ExpectedTopology>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootfsConfig {
    #[serde(default = "default_drive_id")]
    pub drive_id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KernelConfig {
    #[serde(default = "default_id")]
    pub boot_source_id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_id")]
    pub iface_id: String,
    pub tap_name: String,
    pub tap_cidr: TapSubnet,
    pub guest_ip: Option<Ipv4Addr>,
    pub guest_mac: Option<GuestMac>,
    #[serde(default = "default_true")]
    pub provision_tap: bool,
    #[serde(default)]
    pub sudo: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub private_key: PathBuf,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub connect_timeout: Duration,
}

fn default_scenario_timeout() -> Duration {
    Duration::from_secs(500)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_id() -> String {
    "1".to_owned()
}

fn default_drive_id() -> String {
    "rootfs".to_owned()
}

fn default_username() -> String {
    "root".to_owned()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load from a file, or from `topocheck.toml` inside a directory.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let path = if path.is_dir() {
            path.join(CONFIG_FILE_NAME)
        } else {
            path.to_owned()
        };
        let string = read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        Self::from_toml(&string).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn from_toml(string: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(string)
    }

    /// The guest MAC, built from `guest_ip` when only that is given.
    pub fn guest_mac(&self) -> Result<GuestMac, ConfigError> {
        match (self.network.guest_ip, self.network.guest_mac) {
            (None, None) => Err(ConfigError::MissingGuestAddress),
            (Some(guest_ip), None) => Ok(GuestMac::for_guest_ip(guest_ip)),
            (None, Some(guest_mac)) => Ok(guest_mac),
            (Some(guest_ip), Some(guest_mac)) if guest_mac.guest_ip() == guest_ip => Ok(guest_mac),
            (Some(guest_ip), Some(guest_mac)) => Err(ConfigError::GuestAddressConflict {
                guest_ip,
                guest_mac,
            }),
        }
    }

    pub fn expected(&self) -> ExpectedTopology {
        self.expected
            .clone()
            .unwrap_or_else(|| ExpectedTopology::for_machine(&self.machine))
    }

    pub fn plan(&self) -> Result<InstancePlan, ConfigError> {
        let rootfs = BlockDeviceSpec {
            drive_id: self.rootfs.drive_id.clone(),
            host_path: self.rootfs.path.clone(),
            is_root: true,
            permissions: if self.rootfs.read_only {
                Permissions::ReadOnly
            } else {
                Permissions::ReadWrite
            },
            state: AttachmentState::Attached,
        };
        let iface = NetworkInterfaceSpec {
            iface_id: self.network.iface_id.clone(),
            host_device_name: self.network.tap_name.clone(),
            guest_mac_address: self.guest_mac()?,
            state: AttachmentState::Attached,
        };
        Ok(InstancePlan {
            machine: self.machine,
            drives: vec![rootfs],
            boot_source: BootSourceSpec::local_kernel(&self.kernel.boot_source_id, &self.kernel.path),
            network_interfaces: vec![iface],
        })
    }

    pub fn scenario(&self) -> Result<ScenarioSpec, ConfigError> {
        Ok(ScenarioSpec {
            plan: self.plan()?,
            paths: self.api_paths.clone(),
            subnet: self.network.tap_cidr,
            tap_name: self
                .network
                .provision_tap
                .then(|| self.network.tap_name.clone()),
            endpoint: self.endpoint(),
            action_id: self.action_id.clone(),
            readiness: self.readiness.clone(),
            expected: self.expected(),
            timeout: self.scenario_timeout,
        })
    }

    /// SSH endpoint with a placeholder host, to be pointed at the guest
    /// once its interface is configured.
    pub fn endpoint(&self) -> RemoteEndpoint {
        RemoteEndpoint::new(
            &self.ssh.username,
            self.ssh.port,
            self.ssh.private_key.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        api_url = "http://127.0.0.1:8080/"
        scenario_timeout = "5m"

        [machine]
        vcpu_count = 2
        ht_enabled = false

        [rootfs]
        path = "/images/rootfs.ext4"

        [kernel]
        path = "/images/vmlinux.bin"

        [network]
        tap_name = "tap0"
        tap_cidr = "192.168.241.1/30"
        guest_ip = "192.168.241.2"

        [ssh]
        private_key = "/keys/id_rsa"
        connect_timeout = "90s"

        [readiness]
        kind = "fixed_delay"
        delay = "1s"

        [expected]
        "CPU(s)" = "2"
        "Socket(s)" = "1"
    "#;

    #[test]
    fn parses_full_config() {
        let config = Config::from_toml(FULL).unwrap();
        assert_eq!(config.scenario_timeout, Duration::from_secs(300));
        assert_eq!(config.machine, MachineConfig::new(2, false).unwrap());
        assert_eq!(config.rootfs.drive_id, "rootfs");
        assert_eq!(config.ssh.username, "root");
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.ssh.connect_timeout, Duration::from_secs(90));
        assert_eq!(
            config.readiness,
            ReadinessPolicy::FixedDelay {
                delay: Duration::from_secs(1)
            }
        );
        assert!(config.network.provision_tap);
        assert_eq!(config.expected().len(), 2);
    }

    #[test]
    fn expected_defaults_to_machine_shape() {
        let config = Config::from_toml(&FULL.replace(
            "[expected]\n        \"CPU(s)\" = \"2\"\n        \"Socket(s)\" = \"1\"",
            "",
        ))
        .unwrap();
        assert!(config.expected.is_none());
        assert_eq!(config.expected().len(), 6);
        assert_eq!(config.expected().get("On-line CPU(s) list"), Some("0,1"));
    }

    #[test]
    fn plan_carries_mac_derived_from_ip() {
        let config = Config::from_toml(FULL).unwrap();
        let plan = config.plan().unwrap();
        assert_eq!(
            plan.network_interfaces[0].guest_mac_address.to_string(),
            "06:00:C0:A8:F1:02"
        );
        assert_eq!(plan.drives[0].permissions, Permissions::ReadWrite);
        assert_eq!(plan.boot_source.id, "1");
    }

    #[test]
    fn conflicting_guest_address_is_rejected() {
        let mut config = Config::from_toml(FULL).unwrap();
        config.network.guest_mac = Some("06:00:C0:A8:F1:06".parse().unwrap());
        assert!(matches!(
            config.guest_mac(),
            Err(ConfigError::GuestAddressConflict { .. })
        ));

        config.network.guest_ip = None;
        assert_eq!(
            config.guest_mac().unwrap().guest_ip(),
            Ipv4Addr::new(192, 168, 241, 6)
        );

        config.network.guest_mac = None;
        assert!(matches!(
            config.guest_mac(),
            Err(ConfigError::MissingGuestAddress)
        ));
    }

    #[test]
    fn invalid_machine_shape_fails_parse() {
        let err = Config::from_toml(&FULL.replace("vcpu_count = 2", "vcpu_count = 0")).unwrap_err();
        assert!(err.to_string().contains("vcpu_count"));
    }

    #[test]
    fn endpoint_starts_with_placeholder() {
        let config = Config::from_toml(FULL).unwrap();
        let endpoint = config.endpoint();
        assert!(endpoint.has_placeholder_hostname());
        assert_eq!(endpoint.private_key_path, PathBuf::from("/keys/id_rsa"));
    }

    #[test]
    fn scenario_follows_config() {
        let mut config = Config::from_toml(FULL).unwrap();
        let spec = config.scenario().unwrap();
        assert_eq!(spec.tap_name.as_deref(), Some("tap0"));
        assert_eq!(spec.timeout, Duration::from_secs(300));
        assert_eq!(spec.subnet.to_string(), "192.168.241.1/30");

        config.network.provision_tap = false;
        assert!(config.scenario().unwrap().tap_name.is_none());
    }

    #[tokio::test]
    async fn load_names_missing_file() {
        let err = Config::load(Path::new("/nonexistent/topocheck.toml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/topocheck.toml"));
    }
}
