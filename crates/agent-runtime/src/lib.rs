pub mod controller;
pub mod error;
pub mod host_fns;
pub mod lifecycle;
pub mod permissions;
pub mod protocol;
pub mod registry;
pub mod sandbox;
pub mod worker;

pub use controller::{AgentController, CallOutcome, ControllerConfig, RoomEvent};
pub use error::AgentError;
pub use host_fns::{CapabilityViolation, GatewayLimits};
pub use lifecycle::{AgentManifest, AgentStatus, InstanceKey, RoomScope};
pub use permissions::{Capability, PermissionSet};
pub use protocol::{EmittedEvent, EntryPoint, LogEntry, TrapKind};
pub use registry::{ModuleRegistry, RegistryError};
pub use sandbox::{SandboxConfig, SandboxError, WasmSandbox};
