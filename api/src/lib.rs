mod configure;
pub mod duration;
mod lifecycle;
mod models;
mod net;
mod paths;
mod session;

pub use crate::configure::{
    ApiCall, ConfigurationError, ConfigureStep, InstanceConfigurator, InstancePlan,
};
pub use crate::lifecycle::{
    InstanceLifecycle, LifecycleError, ReadinessPolicy, ReadinessPolicyError,
};
pub use crate::models::{
    ActionType, AttachmentState, BlockDeviceSpec, BootSourceSpec, InstanceActionSpec, LocalImage,
    NetworkInterfaceSpec, Permissions, SourceKind,
};
pub use crate::net::{GuestMac, NetError, TapSubnet};
pub use crate::paths::{ApiPaths, InvalidResourceId};
pub use crate::session::{ApiError, ApiResponse, ApiSession, HttpApiSession};
