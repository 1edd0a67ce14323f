use serde::Deserialize;
use thiserror::Error;

/// Management API resource paths, relative to the API base URL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ApiPaths {
    pub machine_config: String,
    pub drives: String,
    pub boot_source: String,
    pub network_interfaces: String,
    pub actions: String,
}

impl Default for ApiPaths {
    fn default() -> Self {
        Self {
            machine_config: "machine-config".to_owned(),
            drives: "drives".to_owned(),
            boot_source: "boot-source".to_owned(),
            network_interfaces: "network-interfaces".to_owned(),
            actions: "actions".to_owned(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("resource id {id:?} cannot be used as a path segment")]
pub struct InvalidResourceId {
    pub id: String,
}

impl ApiPaths {
    pub fn drive(&self, drive_id: &str) -> Result<String, InvalidResourceId> {
        join(&self.drives, drive_id)
    }

    pub fn network_interface(&self, iface_id: &str) -> Result<String, InvalidResourceId> {
        join(&self.network_interfaces, iface_id)
    }

    pub fn action(&self, action_id: &str) -> Result<String, InvalidResourceId> {
        join(&self.actions, action_id)
    }
}

/// Append `id` to `collection` as exactly one percent-encoded segment.
/// Empty and dot ids are refused.
fn join(collection: &str, id: &str) -> Result<String, InvalidResourceId> {
    if matches!(id, "" | "." | "..") {
        return Err(InvalidResourceId { id: id.to_owned() });
    }
    Ok(format!(
        "{}/{}",
        collection.trim_end_matches('/'),
        urlencoding::encode(id)
    ))
}
