//! Capability gateway: the only functions a sandboxed agent can import.
//!
//! Every pointer/length pair is checked against the guest's own linear memory
//! before the host touches it. A failed check records a
//! [`CapabilityViolation`] on the store and traps the guest.

use std::ops::Range;
use std::sync::Arc;

use roomagent_settings::GatewaySettings;
use roomagent_wire::{decode_identifier, AssignmentEvent, BufferLayout, ID_SLOT_LEN};
use tracing::{debug, info, warn};
use wasmtime::{Caller, Linker, Memory};
use zeroize::{Zeroize, Zeroizing};

use crate::permissions::{Capability, PermissionSet};
use crate::protocol::{CallOutput, EmittedEvent, LogEntry};
use crate::sandbox::IsolateLimiter;

/// Per-call bounds on data crossing the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayLimits {
    pub max_state_bytes: usize,
    pub max_event_bytes: usize,
    pub max_emitted_events_per_call: usize,
    pub max_log_line_bytes: usize,
    pub max_log_lines_per_call: usize,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self::from(&GatewaySettings::default())
    }
}

impl From<&GatewaySettings> for GatewayLimits {
    fn from(s: &GatewaySettings) -> Self {
        Self {
            max_state_bytes: s.max_state_bytes,
            max_event_bytes: s.max_event_bytes,
            max_emitted_events_per_call: s.max_emitted_events_per_call,
            max_log_line_bytes: s.max_log_line_bytes,
            max_log_lines_per_call: s.max_log_lines_per_call,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityViolation {
    #[error("{function}: range ({ptr}, {len}) outside guest memory of {memory_len} bytes")]
    OutOfBounds {
        function: &'static str,
        ptr: i32,
        len: i32,
        memory_len: usize,
    },
    #[error("{function}: capability {capability:?} was not declared")]
    Undeclared {
        function: &'static str,
        capability: Capability,
    },
    #[error("{function}: {len} bytes exceeds limit of {max}")]
    TooLarge {
        function: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{function}: more than {max} events emitted in one call")]
    QuotaExceeded { function: &'static str, max: usize },
    #[error("{function}: identifier is not valid UTF-8")]
    InvalidIdentifier { function: &'static str },
    #[error("{function} is not a gateway function")]
    NotInGateway { function: &'static str },
    #[error("{function}: guest exports no linear memory")]
    NoMemory { function: &'static str },
}

/// Store data for one isolate.
pub struct HostState {
    pub label: String,
    pub permissions: PermissionSet,
    pub limits: GatewayLimits,
    pub limiter: IsolateLimiter,
    data_buffer: Arc<[u8]>,
    layout: BufferLayout,
    event: Zeroizing<Vec<u8>>,
    context: Zeroizing<Vec<u8>>,
    state: Zeroizing<Vec<u8>>,
    state_dirty: bool,
    emitted: Vec<EmittedEvent>,
    logs: Vec<LogEntry>,
    dropped_logs: usize,
    violation: Option<CapabilityViolation>,
}

impl HostState {
    pub fn new(
        label: impl Into<String>,
        permissions: PermissionSet,
        limits: GatewayLimits,
        limiter: IsolateLimiter,
    ) -> Self {
        Self {
            label: label.into(),
            permissions,
            limits,
            limiter,
            data_buffer: empty_buffer(),
            layout: BufferLayout::new(0, 0),
            event: Zeroizing::new(Vec::new()),
            context: Zeroizing::new(Vec::new()),
            state: Zeroizing::new(Vec::new()),
            state_dirty: false,
            emitted: Vec::new(),
            logs: Vec::new(),
            dropped_logs: 0,
            violation: None,
        }
    }

    /// Reset per-call scratch and install the call's inputs.
    pub fn begin_call(
        &mut self,
        buffer: Arc<[u8]>,
        event: Option<Vec<u8>>,
    ) -> Result<(), roomagent_wire::DecodeError> {
        self.layout = BufferLayout::parse(&buffer)?;
        self.data_buffer = buffer;
        self.event = Zeroizing::new(event.unwrap_or_default());
        self.state_dirty = false;
        self.emitted.clear();
        self.logs.clear();
        self.dropped_logs = 0;
        self.violation = None;
        Ok(())
    }

    /// Collect the call's outputs and drop its inputs.
    pub fn finish_call(&mut self) -> CallOutput {
        let state_dirty = self.state_dirty;
        let output = CallOutput {
            state: state_dirty.then(|| self.state.clone()),
            state_dirty,
            events: std::mem::take(&mut self.emitted),
            logs: std::mem::take(&mut self.logs),
            dropped_logs: self.dropped_logs,
        };
        self.release_inputs();
        output
    }

    /// Forget a failed call's outputs.
    pub fn abort_call(&mut self) {
        self.emitted.clear();
        self.logs.clear();
        self.state_dirty = false;
        self.release_inputs();
    }

    pub fn take_violation(&mut self) -> Option<CapabilityViolation> {
        self.violation.take()
    }

    pub fn replace_state(&mut self, state: Zeroizing<Vec<u8>>) {
        self.state = state;
    }

    pub fn set_context(&mut self, context: Vec<u8>) {
        self.context = Zeroizing::new(context);
    }

    /// Zero every host-side buffer belonging to this isolate.
    pub fn wipe(&mut self) {
        self.abort_call();
        self.state.zeroize();
        self.context.zeroize();
    }

    fn release_inputs(&mut self) {
        self.data_buffer = empty_buffer();
        self.layout = BufferLayout::new(0, 0);
        self.event.zeroize();
    }

    fn emit(
        &mut self,
        function: &'static str,
        event: EmittedEvent,
    ) -> Result<(), CapabilityViolation> {
        let max = self.limits.max_emitted_events_per_call;
        if self.emitted.len() >= max {
            return Err(CapabilityViolation::QuotaExceeded { function, max });
        }
        self.emitted.push(event);
        Ok(())
    }
}

fn empty_buffer() -> Arc<[u8]> {
    Arc::from(vec![0u8; roomagent_wire::HEADER_LEN])
}

/// Validate `(ptr, len)` against a memory of `memory_len` bytes.
pub fn checked_range(
    function: &'static str,
    ptr: i32,
    len: i32,
    memory_len: usize,
) -> Result<Range<usize>, CapabilityViolation> {
    let oob = CapabilityViolation::OutOfBounds {
        function,
        ptr,
        len,
        memory_len,
    };
    if ptr < 0 || len < 0 {
        return Err(oob);
    }
    let start = ptr as usize;
    match start.checked_add(len as usize) {
        Some(end) if end <= memory_len => Ok(start..end),
        _ => Err(oob),
    }
}

fn guest_memory(
    caller: &mut Caller<'_, HostState>,
    function: &'static str,
) -> Result<Memory, CapabilityViolation> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or(CapabilityViolation::NoMemory { function })
}

fn require(
    caller: &Caller<'_, HostState>,
    function: &'static str,
) -> Result<(), CapabilityViolation> {
    match Capability::for_import(function) {
        Some(capability) if caller.data().permissions.has(capability) => Ok(()),
        Some(capability) => Err(CapabilityViolation::Undeclared {
            function,
            capability,
        }),
        None => Err(CapabilityViolation::NotInGateway { function }),
    }
}

/// Copy guest bytes out of `(ptr, len)`, refusing more than `max`.
fn read_guest(
    caller: &mut Caller<'_, HostState>,
    function: &'static str,
    ptr: i32,
    len: i32,
    max: usize,
) -> Result<Vec<u8>, CapabilityViolation> {
    let memory = guest_memory(caller, function)?;
    let data = memory.data(&*caller);
    let range = checked_range(function, ptr, len, data.len())?;
    if range.len() > max {
        return Err(CapabilityViolation::TooLarge {
            function,
            len: range.len(),
            max,
        });
    }
    Ok(data[range].to_vec())
}

/// Copy `payload` into `(dst, cap)` if it fits. Returns the payload length
/// either way; a result above `cap` means nothing was written.
fn write_guest(
    caller: &mut Caller<'_, HostState>,
    function: &'static str,
    dst: i32,
    cap: i32,
    payload: &[u8],
) -> Result<i32, CapabilityViolation> {
    let memory = guest_memory(caller, function)?;
    let range = checked_range(function, dst, cap, memory.data_size(&*caller))?;
    let len = i32::try_from(payload.len()).map_err(|_| CapabilityViolation::TooLarge {
        function,
        len: payload.len(),
        max: i32::MAX as usize,
    })?;
    if payload.len() <= range.len() {
        let start = range.start;
        memory.data_mut(&mut *caller)[start..start + payload.len()].copy_from_slice(payload);
    }
    Ok(len)
}

/// Run a host function body, turning a violation into a recorded trap.
fn guarded<'a, R>(
    caller: &mut Caller<'a, HostState>,
    function: &'static str,
    body: impl FnOnce(&mut Caller<'a, HostState>) -> Result<R, CapabilityViolation>,
) -> anyhow::Result<R> {
    let result = match require(caller, function) {
        Ok(()) => body(caller),
        Err(violation) => Err(violation),
    };
    result.map_err(|violation| {
        let state = caller.data_mut();
        warn!(agent = %state.label, function, %violation, "capability violation");
        if state.violation.is_none() {
            state.violation = Some(violation.clone());
        }
        anyhow::Error::new(violation)
    })
}

fn read_export(
    linker: &mut Linker<HostState>,
    function: &'static str,
    payload: fn(&HostState) -> Arc<[u8]>,
) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        function,
        move |mut caller: Caller<'_, HostState>, dst: i32, cap: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, function, |caller| {
                let bytes = payload(caller.data());
                write_guest(caller, function, dst, cap, &bytes)
            })
        },
    )?;
    Ok(())
}

/// Register the full gateway into the linker.
pub fn register_host_fns(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    read_export(linker, "host_get_assignment_data", |s| s.data_buffer.clone())?;
    read_export(linker, "host_get_tasks", |s| {
        Arc::from(&s.data_buffer[s.layout.task_region()])
    })?;
    read_export(linker, "host_get_members", |s| {
        Arc::from(&s.data_buffer[s.layout.member_region()])
    })?;
    read_export(linker, "host_get_event", |s| Arc::from(s.event.as_slice()))?;
    read_export(linker, "host_get_context", |s| Arc::from(s.context.as_slice()))?;

    // host_get_state(dst, cap) -> i32
    linker.func_wrap(
        "env",
        "host_get_state",
        |mut caller: Caller<'_, HostState>, dst: i32, cap: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, "host_get_state", |caller| {
                let state = caller.data().state.clone();
                write_guest(caller, "host_get_state", dst, cap, &state)
            })
        },
    )?;

    // host_set_state(src, len)
    linker.func_wrap(
        "env",
        "host_set_state",
        |mut caller: Caller<'_, HostState>, src: i32, len: i32| -> anyhow::Result<()> {
            guarded(&mut caller, "host_set_state", |caller| {
                let max = caller.data().limits.max_state_bytes;
                let bytes = Zeroizing::new(read_guest(caller, "host_set_state", src, len, max)?);
                let state = caller.data_mut();
                state.state = bytes;
                state.state_dirty = true;
                Ok(())
            })
        },
    )?;

    // host_emit_assignment(task_ptr, task_len, member_ptr, member_len)
    linker.func_wrap(
        "env",
        "host_emit_assignment",
        |mut caller: Caller<'_, HostState>,
         task_ptr: i32,
         task_len: i32,
         member_ptr: i32,
         member_len: i32|
         -> anyhow::Result<()> {
            const F: &str = "host_emit_assignment";
            guarded(&mut caller, F, |caller| {
                let task = read_guest(caller, F, task_ptr, task_len, ID_SLOT_LEN)?;
                let member = read_guest(caller, F, member_ptr, member_len, ID_SLOT_LEN)?;
                let invalid = |_| CapabilityViolation::InvalidIdentifier { function: F };
                let event = AssignmentEvent {
                    task_id: decode_identifier(&task).map_err(invalid)?,
                    member_key: decode_identifier(&member).map_err(invalid)?,
                };
                debug!(
                    agent = %caller.data().label,
                    task = %event.task_id,
                    member = %event.member_key,
                    "assignment emitted"
                );
                caller.data_mut().emit(F, EmittedEvent::Assignment(event))
            })
        },
    )?;

    // host_emit_event(src, len)
    linker.func_wrap(
        "env",
        "host_emit_event",
        |mut caller: Caller<'_, HostState>, src: i32, len: i32| -> anyhow::Result<()> {
            guarded(&mut caller, "host_emit_event", |caller| {
                let max = caller.data().limits.max_event_bytes;
                let payload = read_guest(caller, "host_emit_event", src, len, max)?;
                caller
                    .data_mut()
                    .emit("host_emit_event", EmittedEvent::Custom(payload))
            })
        },
    )?;

    // host_get_now() -> i32, unix seconds
    linker.func_wrap(
        "env",
        "host_get_now",
        |mut caller: Caller<'_, HostState>| -> anyhow::Result<i32> {
            guarded(&mut caller, "host_get_now", |_| {
                let secs = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                Ok(i32::try_from(secs).unwrap_or(i32::MAX))
            })
        },
    )?;

    // host_log(src, len)
    linker.func_wrap(
        "env",
        "host_log",
        |mut caller: Caller<'_, HostState>, src: i32, len: i32| -> anyhow::Result<()> {
            guarded(&mut caller, "host_log", |caller| {
                let memory = guest_memory(caller, "host_log")?;
                let range = checked_range("host_log", src, len, memory.data_size(&*caller))?;

                let limits = caller.data().limits.clone();
                if caller.data().logs.len() >= limits.max_log_lines_per_call {
                    caller.data_mut().dropped_logs += 1;
                    return Ok(());
                }

                let truncated = range.len() > limits.max_log_line_bytes;
                let end = range.start + range.len().min(limits.max_log_line_bytes);
                let message =
                    String::from_utf8_lossy(&memory.data(&*caller)[range.start..end]).into_owned();

                let state = caller.data_mut();
                info!(agent = %state.label, agent_log = true, truncated, "{}", message);
                state.logs.push(LogEntry { message, truncated });
                Ok(())
            })
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_range_accepts_in_bounds() {
        assert_eq!(checked_range("f", 0, 10, 10).unwrap(), 0..10);
        assert_eq!(checked_range("f", 10, 0, 10).unwrap(), 10..10);
        assert_eq!(checked_range("f", 4, 2, 65536).unwrap(), 4..6);
    }

    #[test]
    fn test_checked_range_rejects_out_of_bounds() {
        assert!(checked_range("f", 9, 2, 10).is_err());
        assert!(checked_range("f", 11, 0, 10).is_err());
        assert!(checked_range("f", -1, 1, 10).is_err());
        assert!(checked_range("f", 0, -1, 10).is_err());
        assert!(checked_range("f", i32::MAX, i32::MAX, 65536).is_err());
        assert_eq!(
            checked_range("host_log", 65530, 100, 65536),
            Err(CapabilityViolation::OutOfBounds {
                function: "host_log",
                ptr: 65530,
                len: 100,
                memory_len: 65536
            })
        );
    }

    #[test]
    fn test_limits_from_settings() {
        let settings = GatewaySettings {
            max_state_bytes: 10,
            ..Default::default()
        };
        let limits = GatewayLimits::from(&settings);
        assert_eq!(limits.max_state_bytes, 10);
        assert_eq!(limits.max_log_lines_per_call, settings.max_log_lines_per_call);
    }

    #[test]
    fn test_begin_call_rejects_bad_buffer() {
        let mut state = HostState::new(
            "test",
            PermissionSet::all(),
            GatewayLimits::default(),
            IsolateLimiter::default(),
        );
        assert!(state.begin_call(Arc::from(vec![1u8, 0, 0, 0, 0, 0, 0, 0]), None).is_err());
        let buf = roomagent_wire::encode_buffer(&[], &[]).unwrap();
        assert!(state.begin_call(Arc::from(buf), Some(b"evt".to_vec())).is_ok());
    }

    #[test]
    fn test_finish_call_returns_state_only_when_dirty() {
        let mut state = HostState::new(
            "test",
            PermissionSet::all(),
            GatewayLimits::default(),
            IsolateLimiter::default(),
        );
        state.replace_state(Zeroizing::new(b"old".to_vec()));
        let out = state.finish_call();
        assert!(!out.state_dirty);
        assert!(out.state.is_none());

        state.state_dirty = true;
        let out = state.finish_call();
        assert_eq!(out.state.as_deref().map(Vec::as_slice), Some(&b"old"[..]));
    }

    #[test]
    fn test_emit_quota() {
        let limits = GatewayLimits {
            max_emitted_events_per_call: 1,
            ..Default::default()
        };
        let mut state =
            HostState::new("test", PermissionSet::all(), limits, IsolateLimiter::default());
        state.emit("host_emit_event", EmittedEvent::Custom(vec![1])).unwrap();
        assert_eq!(
            state.emit("host_emit_event", EmittedEvent::Custom(vec![2])),
            Err(CapabilityViolation::QuotaExceeded {
                function: "host_emit_event",
                max: 1
            })
        );
    }
}
