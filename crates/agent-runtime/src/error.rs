use roomagent_state::StorageError;
use roomagent_wire::EncodingError;

use crate::host_fns::CapabilityViolation;
use crate::lifecycle::{InstanceKey, LifecycleError};
use crate::protocol::TrapKind;
use crate::registry::RegistryError;

/// Errors surfaced by the agent controller.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("module rejected: {0}")]
    Validation(String),
    #[error("capability violation: {0}")]
    CapabilityViolation(#[from] CapabilityViolation),
    #[error("agent trapped ({kind:?}): {message}")]
    Trap { kind: TrapKind, message: String },
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error("instance {0} is already active")]
    AlreadyActive(InstanceKey),
    #[error("instance {0} is not active")]
    NotActive(InstanceKey),
    #[error("instance {0} has faulted")]
    Faulted(InstanceKey),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("isolate unavailable: {0}")]
    Isolate(String),
}

impl AgentError {
    /// Whether the error faults the instance that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Validation(_) | AgentError::CapabilityViolation(_) | AgentError::Trap { .. }
        )
    }
}

impl From<RegistryError> for AgentError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownModule(id) => AgentError::UnknownModule(id),
            other => AgentError::Validation(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
