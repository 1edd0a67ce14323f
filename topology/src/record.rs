use indexmap::IndexMap;
use serde::Deserialize;
use std::fmt::{self, Display, Formatter};

use crate::{keys, machine::MachineConfig};

/// Attributes parsed from one diagnostic report, in report order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyRecord(IndexMap<String, String>);

impl TopologyRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    // Callers are expected to reject repeated keys before inserting.
    pub(crate) fn insert(&mut self, key: String, value: String) {
        self.0.insert(key, value);
    }
}

impl Display for TopologyRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (key, value) in self.iter() {
            writeln!(f, "{key}: {value}")?;
        }
        Ok(())
    }
}

/// The attributes a check cares about. Keys missing here are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ExpectedTopology(IndexMap<String, String>);

impl ExpectedTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// What a Linux guest reports for the given machine shape: a single
    /// socket and NUMA node, with hyperthreading pairing vCPUs into cores.
    pub fn for_machine(machine: &MachineConfig) -> Self {
        let vcpus = machine.vcpu_count();
        Self::new()
            .with(keys::CPUS, vcpus.to_string())
            .with(keys::ONLINE_CPUS, cpu_list(0..vcpus))
            .with(keys::THREADS_PER_CORE, machine.threads_per_core().to_string())
            .with(keys::CORES_PER_SOCKET, machine.cores_per_socket().to_string())
            .with(keys::SOCKETS, "1")
            .with(keys::NUMA_NODES, "1")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ExpectedTopology {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Render CPU ids the way util-linux prints a cpulist: consecutive runs of
/// three or more collapse to `a-b`, shorter runs stay comma separated.
pub fn cpu_list(cpus: impl IntoIterator<Item = u16>) -> String {
    let mut cpus: Vec<u16> = cpus.into_iter().collect();
    cpus.sort_unstable();
    cpus.dedup();

    let mut parts = Vec::new();
    let mut index = 0;
    while index < cpus.len() {
        let start = cpus[index];
        let mut end = start;
        while index + 1 < cpus.len() && cpus[index + 1] == end + 1 {
            index += 1;
            end = cpus[index];
        }
        match end - start {
            0 => parts.push(start.to_string()),
            1 => {
                parts.push(start.to_string());
                parts.push(end.to_string());
            }
            _ => parts.push(format!("{start}-{end}")),
        }
        index += 1;
    }
    parts.join(",")
}
