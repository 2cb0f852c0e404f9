use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roomagent_settings::SandboxSettings;
use tracing::{debug, warn};
use wasmtime::*;

use crate::host_fns::{register_host_fns, GatewayLimits, HostState};
use crate::permissions::{Capability, PermissionSet};
use crate::protocol::{CallFailure, CallInput, CallOutput, EntryPoint, TrapKind};

const WASM_PAGE: u64 = 65536;

/// Configuration for a WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum linear memory per isolate in bytes (default: 16MB).
    pub max_memory_bytes: usize,
    /// Fuel granted to each call.
    pub fuel_limit: u64,
    /// In-engine wall-clock bound per call.
    pub max_execution_time: Duration,
    /// Epoch ticker interval.
    pub epoch_tick: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::from(&SandboxSettings::default())
    }
}

impl From<&SandboxSettings> for SandboxConfig {
    fn from(s: &SandboxSettings) -> Self {
        Self {
            max_memory_bytes: s.max_memory_bytes,
            fuel_limit: s.fuel_limit,
            max_execution_time: Duration::from_millis(s.max_execution_ms),
            epoch_tick: Duration::from_millis(s.epoch_tick_ms.max(1)),
        }
    }
}

impl SandboxConfig {
    fn epoch_deadline_ticks(&self) -> u64 {
        let interval_ms = self.epoch_tick.as_millis().max(1);
        let timeout_ms = self.max_execution_time.as_millis().max(1);
        timeout_ms.div_ceil(interval_ms) as u64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("wasm error: {0}")]
    Wasm(#[from] anyhow::Error),
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
    #[error("module rejected: {0}")]
    Validation(String),
    #[error("epoch ticker: {0}")]
    Ticker(#[from] std::io::Error),
}

/// Linear memory growth past the per-isolate ceiling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("memory growth to {desired} bytes exceeds the {max} byte limit")]
pub struct MemoryLimitExceeded {
    pub desired: usize,
    pub max: usize,
}

/// Per-store resource limiter. Denied memory growth traps instead of
/// handing `-1` back to the guest.
#[derive(Debug, Clone)]
pub struct IsolateLimiter {
    max_memory_bytes: usize,
    max_table_elements: u32,
}

impl IsolateLimiter {
    pub fn new(max_memory_bytes: usize) -> Self {
        Self {
            max_memory_bytes,
            max_table_elements: 10_000,
        }
    }
}

impl Default for IsolateLimiter {
    fn default() -> Self {
        Self::new(SandboxConfig::default().max_memory_bytes)
    }
}

impl ResourceLimiter for IsolateLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> Result<bool> {
        if desired > self.max_memory_bytes {
            return Err(MemoryLimitExceeded {
                desired,
                max: self.max_memory_bytes,
            }
            .into());
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: u32,
        desired: u32,
        _maximum: Option<u32>,
    ) -> Result<bool> {
        Ok(desired <= self.max_table_elements)
    }

    fn instances(&self) -> usize {
        1
    }

    fn memories(&self) -> usize {
        1
    }
}

struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = std::thread::Builder::new()
            .name("agent-epoch-ticker".to_string())
            .spawn(move || {
                while !stop_clone.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Shared engine for all isolates. Each agent gets its own store and
/// instance; nothing else is shared between them.
#[derive(Clone)]
pub struct WasmSandbox {
    engine: Engine,
    config: SandboxConfig,
    _ticker: Arc<EpochTicker>,
}

impl WasmSandbox {
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        engine_config.epoch_interruption(true);
        let engine = Engine::new(&engine_config)?;
        let ticker = EpochTicker::start(engine.clone(), config.epoch_tick)?;
        Ok(Self {
            engine,
            config,
            _ticker: Arc::new(ticker),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Create a new store with resource limits applied.
    pub fn create_store(&self, data: HostState) -> Result<Store<HostState>, SandboxError> {
        let mut store = Store::new(&self.engine, data);
        store.limiter(|state| &mut state.limiter);
        self.arm(&mut store)?;
        Ok(store)
    }

    /// Refill fuel and reset the epoch deadline before entering the guest.
    fn arm(&self, store: &mut Store<HostState>) -> Result<(), SandboxError> {
        store.set_fuel(self.config.fuel_limit)?;
        store.set_epoch_deadline(self.config.epoch_deadline_ticks());
        Ok(())
    }

    fn limiter(&self) -> IsolateLimiter {
        IsolateLimiter::new(self.config.max_memory_bytes)
    }

    /// Compile and check a module against the gateway and the granted
    /// permissions.
    pub fn compile(
        &self,
        wasm_bytes: &[u8],
        permissions: &PermissionSet,
    ) -> Result<Module, SandboxError> {
        let module = Module::new(&self.engine, wasm_bytes)
            .map_err(|e| SandboxError::Validation(format!("invalid wasm: {e}")))?;
        self.validate_module(&module, permissions)?;
        Ok(module)
    }

    pub fn validate_module(
        &self,
        module: &Module,
        permissions: &PermissionSet,
    ) -> Result<(), SandboxError> {
        for import in module.imports() {
            let name = import.name();
            if import.module() != "env" {
                return Err(SandboxError::Validation(format!(
                    "import {}::{} is outside the host gateway",
                    import.module(),
                    name
                )));
            }
            if matches!(import.ty(), ExternType::Memory(_)) {
                return Err(SandboxError::Validation(format!(
                    "imported memory {name} is not allowed"
                )));
            }
            let capability = Capability::for_import(name).ok_or_else(|| {
                SandboxError::Validation(format!("unknown host import {name}"))
            })?;
            if !permissions.has(capability) {
                return Err(SandboxError::Validation(format!(
                    "import {name} needs undeclared capability {capability:?}"
                )));
            }
        }

        match module.get_export("memory") {
            Some(ExternType::Memory(mem_type)) => {
                let max_pages = self.config.max_memory_bytes as u64 / WASM_PAGE;
                if mem_type.minimum() > max_pages {
                    return Err(SandboxError::ResourceLimit(format!(
                        "module requests {} pages, max is {}",
                        mem_type.minimum(),
                        max_pages
                    )));
                }
            }
            _ => {
                return Err(SandboxError::Validation(
                    "module must export its linear memory as \"memory\"".into(),
                ))
            }
        }

        for entry in [EntryPoint::Init, EntryPoint::OnTaskEvent, EntryPoint::OnTick] {
            let name = entry.export_name();
            match module.get_export(name) {
                Some(ExternType::Func(ty))
                    if ty.params().next().is_none() && ty.results().next().is_none() => {}
                Some(_) => {
                    return Err(SandboxError::Validation(format!(
                        "export {name} must be a function () -> ()"
                    )))
                }
                None if entry == EntryPoint::OnTaskEvent => {}
                None => {
                    return Err(SandboxError::Validation(format!(
                        "missing required export {name}"
                    )))
                }
            }
        }
        Ok(())
    }
}

/// One instantiated agent: its store, instance and linear memory.
pub struct IsolateRuntime {
    sandbox: WasmSandbox,
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    terminated: bool,
}

impl IsolateRuntime {
    pub fn instantiate(
        sandbox: &WasmSandbox,
        label: &str,
        wasm_bytes: &[u8],
        permissions: PermissionSet,
        limits: GatewayLimits,
    ) -> Result<Self, SandboxError> {
        let module = sandbox.compile(wasm_bytes, &permissions)?;

        let mut linker = Linker::new(sandbox.engine());
        register_host_fns(&mut linker)?;

        let state = HostState::new(label, permissions, limits, sandbox.limiter());
        let mut store = sandbox.create_store(state)?;
        let instance = linker.instantiate(&mut store, &module)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| SandboxError::Validation("memory export vanished".into()))?;

        debug!(agent = label, pages = memory.size(&store), "isolate instantiated");
        Ok(Self {
            sandbox: sandbox.clone(),
            store,
            instance,
            memory,
            terminated: false,
        })
    }

    /// Invoke one entry point with the given inputs.
    pub fn call(&mut self, entry: EntryPoint, input: CallInput) -> Result<CallOutput, CallFailure> {
        if self.terminated {
            return Err(CallFailure::NotInstantiated);
        }

        let state = self.store.data_mut();
        state
            .begin_call(input.buffer, input.event)
            .map_err(|e| CallFailure::Malformed(e.to_string()))?;
        if let Some(seed) = input.state {
            state.replace_state(seed);
        }

        let func = match self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, entry.export_name())
        {
            Ok(func) => func,
            Err(_) if entry == EntryPoint::OnTaskEvent => {
                return Ok(self.store.data_mut().finish_call());
            }
            Err(e) => {
                self.store.data_mut().abort_call();
                return Err(CallFailure::Malformed(e.to_string()));
            }
        };

        if let Err(e) = self.sandbox.arm(&mut self.store) {
            self.store.data_mut().abort_call();
            return Err(CallFailure::Malformed(e.to_string()));
        }

        match func.call(&mut self.store, ()) {
            Ok(()) => Ok(self.store.data_mut().finish_call()),
            Err(err) => {
                let host = self.store.data_mut();
                host.abort_call();
                if let Some(violation) = host.take_violation() {
                    return Err(CallFailure::CapabilityViolation(violation));
                }
                let kind = TrapKind::classify(&err);
                warn!(agent = %host.label, entry = entry.export_name(), ?kind, "guest trapped");
                Err(CallFailure::Trap {
                    kind,
                    message: format!("{err:#}"),
                })
            }
        }
    }

    pub fn update_context(&mut self, context: Vec<u8>) {
        self.store.data_mut().set_context(context);
    }

    /// Read-only view of guest memory.
    pub fn with_memory<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.memory.data(&self.store))
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Zero guest memory and host buffers. Safe to call more than once.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.memory.data_mut(&mut self.store).fill(0);
        self.store.data_mut().wipe();
        self.terminated = true;
        debug!(agent = %self.store.data().label, "isolate terminated");
    }
}

impl Drop for IsolateRuntime {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_fns::CapabilityViolation;

    fn sandbox() -> WasmSandbox {
        WasmSandbox::new(SandboxConfig {
            max_memory_bytes: 2 * 65536,
            ..Default::default()
        })
        .unwrap()
    }

    fn wasm(src: &str) -> Vec<u8> {
        wat::parse_str(src).unwrap()
    }

    const MINIMAL: &str = r#"(module
        (memory (export "memory") 1)
        (func (export "init"))
        (func (export "on_tick")))"#;

    #[test]
    fn test_epoch_ticks_round_up() {
        let config = SandboxConfig {
            max_execution_time: Duration::from_millis(25),
            epoch_tick: Duration::from_millis(10),
            ..Default::default()
        };
        assert_eq!(config.epoch_deadline_ticks(), 3);
    }

    #[test]
    fn test_minimal_module_validates() {
        let sb = sandbox();
        assert!(sb.compile(&wasm(MINIMAL), &PermissionSet::default()).is_ok());
    }

    #[test]
    fn test_rejects_undeclared_import() {
        let sb = sandbox();
        let src = r#"(module
            (import "env" "host_log" (func (param i32 i32)))
            (memory (export "memory") 1)
            (func (export "init"))
            (func (export "on_tick")))"#;
        let err = sb.compile(&wasm(src), &PermissionSet::default()).unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
        assert!(sb
            .compile(&wasm(src), &PermissionSet::new([Capability::Log]))
            .is_ok());
    }

    #[test]
    fn test_rejects_foreign_imports() {
        let sb = sandbox();
        let src = r#"(module
            (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (func (export "init"))
            (func (export "on_tick")))"#;
        assert!(sb.compile(&wasm(src), &PermissionSet::all()).is_err());

        let src = r#"(module
            (import "env" "memory" (memory 1))
            (export "memory" (memory 0))
            (func (export "init"))
            (func (export "on_tick")))"#;
        assert!(sb.compile(&wasm(src), &PermissionSet::all()).is_err());
    }

    #[test]
    fn test_rejects_missing_exports_and_big_memory() {
        let sb = sandbox();
        let no_tick = r#"(module (memory (export "memory") 1) (func (export "init")))"#;
        assert!(sb.compile(&wasm(no_tick), &PermissionSet::all()).is_err());

        let no_memory = r#"(module (func (export "init")) (func (export "on_tick")))"#;
        assert!(sb.compile(&wasm(no_memory), &PermissionSet::all()).is_err());

        let bad_sig = r#"(module
            (memory (export "memory") 1)
            (func (export "init") (param i32))
            (func (export "on_tick")))"#;
        assert!(sb.compile(&wasm(bad_sig), &PermissionSet::all()).is_err());

        let huge = r#"(module
            (memory (export "memory") 3)
            (func (export "init"))
            (func (export "on_tick")))"#;
        assert!(matches!(
            sb.compile(&wasm(huge), &PermissionSet::all()),
            Err(SandboxError::ResourceLimit(_))
        ));
    }

    #[test]
    fn test_terminate_is_idempotent_and_zeroes_memory() {
        let sb = sandbox();
        let src = r#"(module
            (memory (export "memory") 1)
            (data (i32.const 0) "secret")
            (func (export "init"))
            (func (export "on_tick")))"#;
        let mut rt = IsolateRuntime::instantiate(
            &sb,
            "t",
            &wasm(src),
            PermissionSet::default(),
            GatewayLimits::default(),
        )
        .unwrap();
        assert_eq!(rt.with_memory(|m| m[..6].to_vec()), b"secret");
        rt.terminate();
        rt.terminate();
        assert!(rt.is_terminated());
        assert!(rt.with_memory(|m| m.iter().all(|&b| b == 0)));
    }

    #[test]
    fn test_memory_growth_past_limit_traps() {
        let sb = sandbox();
        let src = r#"(module
            (memory (export "memory") 1)
            (func (export "init") (drop (memory.grow (i32.const 1))))
            (func (export "on_tick") (drop (memory.grow (i32.const 1)))))"#;
        let mut rt = IsolateRuntime::instantiate(
            &sb,
            "t",
            &wasm(src),
            PermissionSet::default(),
            GatewayLimits::default(),
        )
        .unwrap();
        let input = || CallInput {
            buffer: Arc::from(roomagent_wire::encode_buffer(&[], &[]).unwrap()),
            event: None,
            state: None,
        };
        rt.call(EntryPoint::Init, input()).unwrap();
        rt.with_memory(|m| assert_eq!(m.len(), 2 * 65536));

        match rt.call(EntryPoint::OnTick, input()) {
            Err(CallFailure::Trap { kind, .. }) => assert_eq!(kind, TrapKind::ResourceLimit),
            other => panic!("expected resource limit trap, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_bounds_destination_is_not_written() {
        let sb = sandbox();
        let src = r#"(module
            (import "env" "host_get_assignment_data" (func $get (param i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 65530) "abcdef")
            (func (export "init"))
            (func (export "on_tick") (drop (call $get (i32.const 65530) (i32.const 100)))))"#;
        let mut rt = IsolateRuntime::instantiate(
            &sb,
            "t",
            &wasm(src),
            PermissionSet::new([Capability::ReadRoomData]),
            GatewayLimits::default(),
        )
        .unwrap();
        let tasks = [roomagent_wire::TaskRecord::new("t1", false)];
        let buffer: Arc<[u8]> = Arc::from(roomagent_wire::encode_buffer(&tasks, &[]).unwrap());
        let result = rt.call(
            EntryPoint::OnTick,
            CallInput {
                buffer,
                event: None,
                state: None,
            },
        );
        assert_eq!(
            result.unwrap_err(),
            CallFailure::CapabilityViolation(CapabilityViolation::OutOfBounds {
                function: "host_get_assignment_data",
                ptr: 65530,
                len: 100,
                memory_len: 65536,
            })
        );
        rt.with_memory(|m| assert_eq!(&m[65530..], b"abcdef"));
    }

    #[test]
    fn test_missing_task_event_export_is_noop() {
        let sb = sandbox();
        let mut rt = IsolateRuntime::instantiate(
            &sb,
            "t",
            &wasm(MINIMAL),
            PermissionSet::default(),
            GatewayLimits::default(),
        )
        .unwrap();
        let buffer: Arc<[u8]> = Arc::from(roomagent_wire::encode_buffer(&[], &[]).unwrap());
        let out = rt
            .call(
                EntryPoint::OnTaskEvent,
                CallInput {
                    buffer,
                    event: Some(b"x".to_vec()),
                    state: None,
                },
            )
            .unwrap();
        assert!(out.events.is_empty());
        assert!(!out.state_dirty);
    }
}
