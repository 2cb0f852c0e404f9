//! Messages exchanged between the controller and an isolate worker.
//!
//! Requests that expect an answer carry a [`RequestId`] and a oneshot reply
//! channel; the response echoes the id. `UpdateContext` and `Terminate` are
//! fire-and-forget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use roomagent_wire::AssignmentEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use zeroize::Zeroizing;

use crate::host_fns::{CapabilityViolation, GatewayLimits};
use crate::permissions::PermissionSet;
use crate::sandbox::MemoryLimitExceeded;

pub type RequestId = u64;

/// Monotonic request id source shared by all instances of a controller.
#[derive(Debug)]
pub struct RequestIds(AtomicU64);

impl RequestIds {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> RequestId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Exported agent functions the host drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryPoint {
    Init,
    OnTaskEvent,
    OnTick,
}

impl EntryPoint {
    pub fn export_name(self) -> &'static str {
        match self {
            EntryPoint::Init => "init",
            EntryPoint::OnTaskEvent => "on_task_event",
            EntryPoint::OnTick => "on_tick",
        }
    }
}

/// Everything a call hands to the sandbox.
pub struct CallInput {
    /// Encoded Data Buffer. Shared and never mutated while the call runs.
    pub buffer: Arc<[u8]>,
    /// Payload readable through `host_get_event`.
    pub event: Option<Vec<u8>>,
    /// Replaces the in-sandbox state slot before the call (used by `init`).
    pub state: Option<Zeroizing<Vec<u8>>>,
}

/// Something an agent emitted during a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmittedEvent {
    Assignment(AssignmentEvent),
    Custom(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub message: String,
    pub truncated: bool,
}

/// Successful call result.
#[derive(Debug, Default)]
pub struct CallOutput {
    /// Present only when `state_dirty` is set.
    pub state: Option<Zeroizing<Vec<u8>>>,
    pub state_dirty: bool,
    pub events: Vec<EmittedEvent>,
    pub logs: Vec<LogEntry>,
    /// Log lines discarded by the per-call rate limit.
    pub dropped_logs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrapKind {
    FuelExhausted,
    /// Wall-clock bound exceeded, on either side of the boundary.
    Timeout,
    MemoryOutOfBounds,
    /// Linear memory growth past the isolate's ceiling.
    ResourceLimit,
    Unreachable,
    StackOverflow,
    IllegalInstruction,
    /// The isolate answered with the wrong id or shape, or went away.
    MalformedResponse,
    Other,
}

impl TrapKind {
    pub fn classify(err: &anyhow::Error) -> TrapKind {
        use wasmtime::Trap;
        if err.downcast_ref::<MemoryLimitExceeded>().is_some() {
            return TrapKind::ResourceLimit;
        }
        match err.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) => TrapKind::FuelExhausted,
            Some(Trap::Interrupt) => TrapKind::Timeout,
            Some(Trap::MemoryOutOfBounds | Trap::HeapMisaligned | Trap::TableOutOfBounds) => {
                TrapKind::MemoryOutOfBounds
            }
            Some(Trap::UnreachableCodeReached) => TrapKind::Unreachable,
            Some(Trap::StackOverflow) => TrapKind::StackOverflow,
            Some(_) => TrapKind::IllegalInstruction,
            None => TrapKind::Other,
        }
    }
}

/// Why a call did not produce a [`CallOutput`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallFailure {
    #[error("trap ({kind:?}): {message}")]
    Trap { kind: TrapKind, message: String },
    #[error("capability violation: {0}")]
    CapabilityViolation(CapabilityViolation),
    #[error("malformed call: {0}")]
    Malformed(String),
    #[error("isolate not instantiated")]
    NotInstantiated,
}

pub enum IsolateRequest {
    Instantiate {
        id: RequestId,
        module: Arc<[u8]>,
        permissions: PermissionSet,
        limits: GatewayLimits,
        reply: oneshot::Sender<IsolateResponse>,
    },
    Call {
        id: RequestId,
        entry: EntryPoint,
        input: CallInput,
        reply: oneshot::Sender<IsolateResponse>,
    },
    UpdateContext {
        context: Vec<u8>,
    },
    Terminate,
}

#[derive(Debug)]
pub enum IsolateResponse {
    InstantiateOk { id: RequestId },
    InstantiateErr { id: RequestId, reason: String },
    CallOk { id: RequestId, output: CallOutput },
    CallErr { id: RequestId, failure: CallFailure },
}

impl IsolateResponse {
    pub fn id(&self) -> RequestId {
        match self {
            IsolateResponse::InstantiateOk { id }
            | IsolateResponse::InstantiateErr { id, .. }
            | IsolateResponse::CallOk { id, .. }
            | IsolateResponse::CallErr { id, .. } => *id,
        }
    }
}
