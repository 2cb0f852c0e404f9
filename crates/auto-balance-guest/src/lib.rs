//! Reference auto-balance agent.
//!
//! Build with
//! `cargo build -p roomagent-auto-balance-guest --target wasm32-unknown-unknown --release`.
//! Needs the `ReadRoomData`, `State`, `EmitAssignment` and `Log` capabilities.
//!
//! Each tick reads the Data Buffer, assigns unblocked tasks with
//! [`auto_balance`], and persists a little-endian `u32` tick counter.
//!
//! The host faults an agent that emits more than its per-call event quota
//! (`gateway.max_emitted_events_per_call`, 1024 by default), so a tick emits
//! at most [`MAX_ASSIGNMENTS_PER_TICK`]. Tasks past that are left for the
//! next tick.

use roomagent_wire::policy::auto_balance;
use roomagent_wire::{decode_buffer, AssignmentEvent};

const INITIAL_READ: usize = 4096;

/// Must not exceed the host's per-call event quota.
pub const MAX_ASSIGNMENTS_PER_TICK: usize = 1024;

/// The slice of the host gateway this agent uses.
pub trait Gateway {
    /// Copy of the current Data Buffer.
    fn assignment_data(&mut self) -> Vec<u8>;
    fn state(&mut self) -> Vec<u8>;
    fn set_state(&mut self, state: &[u8]);
    fn emit_assignment(&mut self, event: &AssignmentEvent);
    fn log(&mut self, line: &str);
}

/// Read through a `(dst, cap) -> required_len` host function, growing the
/// buffer once if the first attempt was too small.
pub fn read_all(mut read: impl FnMut(&mut [u8]) -> usize) -> Vec<u8> {
    let mut buf = vec![0u8; INITIAL_READ];
    let needed = read(&mut buf);
    if needed > buf.len() {
        buf.resize(needed, 0);
        let again = read(&mut buf);
        buf.truncate(again.min(needed));
    } else {
        buf.truncate(needed);
    }
    buf
}

fn tick_count(state: &[u8]) -> u32 {
    state
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

pub fn on_init(gw: &mut impl Gateway) {
    let ticks = tick_count(&gw.state());
    gw.log(&format!("auto-balance ready after {ticks} ticks"));
}

pub fn on_tick(gw: &mut impl Gateway) {
    let buffer = match decode_buffer(&gw.assignment_data()) {
        Ok(buffer) => buffer,
        Err(e) => {
            gw.log(&format!("unreadable data buffer: {e}"));
            return;
        }
    };

    let mut assignments = auto_balance(&buffer.tasks, &buffer.members);
    let deferred = assignments.len().saturating_sub(MAX_ASSIGNMENTS_PER_TICK);
    assignments.truncate(MAX_ASSIGNMENTS_PER_TICK);
    for event in &assignments {
        gw.emit_assignment(event);
    }

    let ticks = tick_count(&gw.state()).wrapping_add(1);
    gw.set_state(&ticks.to_le_bytes());
    gw.log(&format!(
        "tick {ticks}: {} tasks, {} members, {} assigned, {deferred} deferred",
        buffer.tasks.len(),
        buffer.members.len(),
        assignments.len()
    ));
}

#[cfg(target_arch = "wasm32")]
mod guest {
    use super::{read_all, AssignmentEvent, Gateway};

    #[link(wasm_import_module = "env")]
    extern "C" {
        fn host_get_assignment_data(dst: i32, cap: i32) -> i32;
        fn host_get_state(dst: i32, cap: i32) -> i32;
        fn host_set_state(src: i32, len: i32);
        fn host_emit_assignment(task: i32, task_len: i32, member: i32, member_len: i32);
        fn host_log(src: i32, len: i32);
    }

    struct Host;

    fn read_with(f: unsafe extern "C" fn(i32, i32) -> i32) -> Vec<u8> {
        // SAFETY: the host only writes within (dst, cap), which is our buffer.
        read_all(|buf| unsafe { f(buf.as_mut_ptr() as i32, buf.len() as i32) }.max(0) as usize)
    }

    impl Gateway for Host {
        fn assignment_data(&mut self) -> Vec<u8> {
            read_with(host_get_assignment_data)
        }

        fn state(&mut self) -> Vec<u8> {
            read_with(host_get_state)
        }

        fn set_state(&mut self, state: &[u8]) {
            unsafe { host_set_state(state.as_ptr() as i32, state.len() as i32) }
        }

        fn emit_assignment(&mut self, event: &AssignmentEvent) {
            let (task, member) = (event.task_id.as_bytes(), event.member_key.as_bytes());
            unsafe {
                host_emit_assignment(
                    task.as_ptr() as i32,
                    task.len() as i32,
                    member.as_ptr() as i32,
                    member.len() as i32,
                )
            }
        }

        fn log(&mut self, line: &str) {
            unsafe { host_log(line.as_ptr() as i32, line.len() as i32) }
        }
    }

    #[no_mangle]
    pub extern "C" fn init() {
        super::on_init(&mut Host);
    }

    #[no_mangle]
    pub extern "C" fn on_tick() {
        super::on_tick(&mut Host);
    }

    #[no_mangle]
    pub extern "C" fn on_task_event() {
        super::on_tick(&mut Host);
    }
}
