mod machine;
mod parser;
mod record;
mod verify;

pub use crate::machine::{MachineConfig, MachineConfigError};
pub use crate::parser::{LscpuParser, ParseError, ReportParser};
pub use crate::record::{ExpectedTopology, TopologyRecord, cpu_list};
pub use crate::verify::{TopologyMismatch, VerifyError, verify, verify_report};

/// Attribute names reported by `lscpu` that describe the CPU layout.
pub mod keys {
    pub const CPUS: &str = "CPU(s)";
    pub const ONLINE_CPUS: &str = "On-line CPU(s) list";
    pub const THREADS_PER_CORE: &str = "Thread(s) per core";
    pub const CORES_PER_SOCKET: &str = "Core(s) per socket";
    pub const SOCKETS: &str = "Socket(s)";
    pub const NUMA_NODES: &str = "NUMA node(s)";
}
