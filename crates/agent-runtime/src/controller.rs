//! Agent controller: owns every live instance, drives its lifecycle and
//! moves data between rooms, isolates and the state store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roomagent_settings::RoomAgentConfig;
use roomagent_state::EncryptedStateStore;
use roomagent_wire::{encode_buffer, DataBuffer};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{AgentError, Result};
use crate::host_fns::GatewayLimits;
use crate::lifecycle::{AgentStatus, InstanceKey, LifecycleError};
use crate::permissions::PermissionSet;
use crate::protocol::{
    CallFailure, CallInput, CallOutput, EmittedEvent, EntryPoint, IsolateRequest,
    IsolateResponse, LogEntry, RequestIds, TrapKind,
};
use crate::registry::ModuleRegistry;
use crate::sandbox::{SandboxConfig, SandboxError, WasmSandbox};
use crate::worker::IsolateHandle;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub sandbox: SandboxConfig,
    pub limits: GatewayLimits,
    pub call_timeout: Duration,
    pub instantiate_timeout: Duration,
    pub event_channel_capacity: usize,
    /// Capabilities any module may be granted on this host.
    pub capability_ceiling: PermissionSet,
}

impl ControllerConfig {
    pub fn from_settings(config: &RoomAgentConfig) -> Self {
        Self {
            sandbox: SandboxConfig::from(&config.sandbox),
            limits: GatewayLimits::from(&config.gateway),
            call_timeout: Duration::from_millis(config.controller.call_timeout_ms),
            instantiate_timeout: Duration::from_millis(config.controller.instantiate_timeout_ms),
            event_channel_capacity: config.controller.event_channel_capacity.max(1),
            capability_ceiling: PermissionSet::all(),
        }
        .bounded()
    }

    /// Cap the in-engine execution bound at `call_timeout`, so a guest the
    /// controller gave up on is interrupted by then too.
    pub fn bounded(mut self) -> Self {
        if self.sandbox.max_execution_time > self.call_timeout {
            self.sandbox.max_execution_time = self.call_timeout;
        }
        self
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_settings(&RoomAgentConfig::default())
    }
}

/// An event emitted by an instance, as seen by room subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEvent {
    pub instance: InstanceKey,
    pub event: EmittedEvent,
}

/// Result of one successful call.
#[derive(Debug, Default)]
pub struct CallOutcome {
    pub events: Vec<EmittedEvent>,
    pub logs: Vec<LogEntry>,
    pub dropped_logs: usize,
    /// The agent called `host_set_state` during the call.
    pub state_written: bool,
}

struct InstanceSlot {
    key: InstanceKey,
    status: watch::Sender<AgentStatus>,
    inner: tokio::sync::Mutex<InstanceInner>,
}

struct InstanceInner {
    handle: Option<IsolateHandle>,
    state: Zeroizing<Vec<u8>>,
}

impl InstanceSlot {
    fn new(key: InstanceKey) -> Self {
        let (status, _) = watch::channel(AgentStatus::Unloaded);
        Self {
            key,
            status,
            inner: tokio::sync::Mutex::new(InstanceInner {
                handle: None,
                state: Zeroizing::new(Vec::new()),
            }),
        }
    }

    fn status(&self) -> AgentStatus {
        *self.status.borrow()
    }

    fn transition(&self, next: AgentStatus) -> std::result::Result<AgentStatus, LifecycleError> {
        let mut result = Ok(next);
        self.status.send_if_modified(|status| {
            result = status.transition(next);
            result.is_ok()
        });
        if result.is_ok() {
            debug!(
                room = %self.key.room_id,
                module = %self.key.module_id,
                status = ?next,
                "transition"
            );
        }
        result
    }

    fn ensure_callable(&self) -> Result<()> {
        match self.status() {
            AgentStatus::Ready | AgentStatus::Active => Ok(()),
            AgentStatus::Faulted => Err(AgentError::Faulted(self.key.clone())),
            _ => Err(AgentError::NotActive(self.key.clone())),
        }
    }
}

impl InstanceInner {
    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.terminate();
        }
        self.state.zeroize();
    }
}

pub struct AgentController {
    sandbox: WasmSandbox,
    registry: Arc<ModuleRegistry>,
    store: Arc<EncryptedStateStore>,
    config: ControllerConfig,
    instances: Mutex<HashMap<InstanceKey, Arc<InstanceSlot>>>,
    events: broadcast::Sender<RoomEvent>,
    request_ids: RequestIds,
}

impl AgentController {
    pub fn new(
        config: ControllerConfig,
        registry: Arc<ModuleRegistry>,
        store: Arc<EncryptedStateStore>,
    ) -> std::result::Result<Self, SandboxError> {
        let config = config.bounded();
        let sandbox = WasmSandbox::new(config.sandbox.clone())?;
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Ok(Self {
            sandbox,
            registry,
            store,
            config,
            instances: Mutex::new(HashMap::new()),
            events,
            request_ids: RequestIds::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Receive every event emitted by any instance from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub fn status(&self, key: &InstanceKey) -> Option<AgentStatus> {
        self.slot(key).map(|slot| slot.status())
    }

    pub fn watch_status(&self, key: &InstanceKey) -> Option<watch::Receiver<AgentStatus>> {
        self.slot(key).map(|slot| slot.status.subscribe())
    }

    pub fn instances(&self) -> Vec<(InstanceKey, AgentStatus)> {
        let mut list: Vec<_> = self
            .instances
            .lock()
            .unwrap()
            .values()
            .map(|slot| (slot.key.clone(), slot.status()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Load a module into a room, restore its state and run `init`.
    pub async fn activate(&self, key: &InstanceKey, snapshot: &DataBuffer) -> Result<CallOutcome> {
        let buffer: Arc<[u8]> = Arc::from(encode_buffer(&snapshot.tasks, &snapshot.members)?);

        if self.status(key) == Some(AgentStatus::Faulted) {
            info!(room = %key.room_id, module = %key.module_id, "replacing faulted instance");
            self.deactivate(key).await?;
        }

        let slot = {
            let mut instances = self.instances.lock().unwrap();
            if instances.contains_key(key) {
                return Err(AgentError::AlreadyActive(key.clone()));
            }
            let slot = Arc::new(InstanceSlot::new(key.clone()));
            instances.insert(key.clone(), slot.clone());
            slot
        };
        let mut inner = slot.inner.lock().await;

        if let Err(e) = self.load(&slot, &mut inner).await {
            if slot.status() != AgentStatus::Faulted {
                self.discard(&slot, &mut inner);
            }
            return Err(e);
        }

        let state = match self.store.load(&key.state_key()) {
            Ok(Some(blob)) => blob,
            Ok(None) => Zeroizing::new(Vec::new()),
            Err(e) => {
                warn!(
                    room = %key.room_id,
                    module = %key.module_id,
                    error = %e,
                    "state unreadable, starting empty"
                );
                Zeroizing::new(Vec::new())
            }
        };
        inner.state = state.clone();

        let input = CallInput {
            buffer,
            event: None,
            state: Some(state),
        };
        let outcome = self.dispatch(&slot, &mut inner, EntryPoint::Init, input).await?;
        info!(room = %key.room_id, module = %key.module_id, "agent active");
        Ok(outcome)
    }

    /// Resolve, validate and instantiate. Leaves the slot `Ready`.
    async fn load(&self, slot: &InstanceSlot, inner: &mut InstanceInner) -> Result<()> {
        let key = &slot.key;
        let module = self.registry.resolve(&key.module_id)?;
        let manifest = &module.manifest;

        if !manifest.room_scope.allows(&key.room_id) {
            return Err(AgentError::Validation(format!(
                "module {} is not allowed in room {}",
                key.module_id, key.room_id
            )));
        }
        let permissions = manifest.permissions();
        let extra = permissions.exceeding(&self.config.capability_ceiling);
        if !extra.is_empty() {
            return Err(AgentError::Validation(format!(
                "module requests capabilities beyond this host: {extra:?}"
            )));
        }

        slot.transition(AgentStatus::Loading)?;
        let handle = IsolateHandle::spawn(self.sandbox.clone(), key.to_string())
            .map_err(|e| AgentError::Isolate(e.to_string()))?;

        let id = self.request_ids.next();
        let (reply, rx) = oneshot::channel();
        let sent = handle.send(IsolateRequest::Instantiate {
            id,
            module: module.wasm.clone(),
            permissions,
            limits: self.config.limits.clone(),
            reply,
        });
        inner.handle = Some(handle);
        if let Err(e) = sent {
            return Err(self.fault(slot, inner, malformed(e.to_string())));
        }

        let response = match tokio::time::timeout(self.config.instantiate_timeout, rx).await {
            Err(_) => return Err(self.fault(slot, inner, timed_out("instantiate"))),
            Ok(Err(_)) => {
                return Err(self.fault(slot, inner, malformed("isolate dropped reply".into())))
            }
            Ok(Ok(response)) => response,
        };
        if response.id() != id {
            return Err(self.fault(slot, inner, unexpected_id(id, response.id())));
        }
        match response {
            IsolateResponse::InstantiateOk { .. } => {
                slot.transition(AgentStatus::Ready)?;
                Ok(())
            }
            IsolateResponse::InstantiateErr { reason, .. } => Err(AgentError::Validation(reason)),
            other => {
                let err = malformed(format!("unexpected response {other:?}"));
                Err(self.fault(slot, inner, err))
            }
        }
    }

    pub async fn on_task_event(
        &self,
        key: &InstanceKey,
        event: Vec<u8>,
        snapshot: &DataBuffer,
    ) -> Result<CallOutcome> {
        self.invoke(key, EntryPoint::OnTaskEvent, Some(event), snapshot)
            .await
    }

    pub async fn on_tick(&self, key: &InstanceKey, snapshot: &DataBuffer) -> Result<CallOutcome> {
        self.invoke(key, EntryPoint::OnTick, None, snapshot).await
    }

    async fn invoke(
        &self,
        key: &InstanceKey,
        entry: EntryPoint,
        event: Option<Vec<u8>>,
        snapshot: &DataBuffer,
    ) -> Result<CallOutcome> {
        let buffer: Arc<[u8]> = Arc::from(encode_buffer(&snapshot.tasks, &snapshot.members)?);
        let slot = self
            .slot(key)
            .ok_or_else(|| AgentError::NotActive(key.clone()))?;
        let mut inner = slot.inner.lock().await;
        slot.ensure_callable()?;
        let input = CallInput {
            buffer,
            event,
            state: None,
        };
        self.dispatch(&slot, &mut inner, entry, input).await
    }

    async fn dispatch(
        &self,
        slot: &InstanceSlot,
        inner: &mut InstanceInner,
        entry: EntryPoint,
        input: CallInput,
    ) -> Result<CallOutcome> {
        slot.transition(AgentStatus::Ticking)?;
        let id = self.request_ids.next();
        debug!(
            room = %slot.key.room_id,
            module = %slot.key.module_id,
            request_id = id,
            entry = entry.export_name(),
            "dispatch"
        );

        let (reply, rx) = oneshot::channel();
        let sent = match inner.handle.as_ref() {
            Some(handle) => handle
                .send(IsolateRequest::Call {
                    id,
                    entry,
                    input,
                    reply,
                })
                .map_err(|e| e.to_string()),
            None => Err("no isolate".to_string()),
        };
        if let Err(reason) = sent {
            return Err(self.fault(slot, inner, malformed(reason)));
        }

        let response = match tokio::time::timeout(self.config.call_timeout, rx).await {
            Err(_) => return Err(self.fault(slot, inner, timed_out(entry.export_name()))),
            Ok(Err(_)) => {
                return Err(self.fault(slot, inner, malformed("isolate dropped reply".into())))
            }
            Ok(Ok(response)) => response,
        };
        if response.id() != id {
            return Err(self.fault(slot, inner, unexpected_id(id, response.id())));
        }

        match response {
            IsolateResponse::CallOk { output, .. } => {
                slot.transition(AgentStatus::Active)?;
                Ok(self.apply_output(&slot.key, inner, output))
            }
            IsolateResponse::CallErr { failure, .. } => {
                Err(self.fault(slot, inner, AgentError::from(failure)))
            }
            other => {
                let err = malformed(format!("unexpected response {other:?}"));
                Err(self.fault(slot, inner, err))
            }
        }
    }

    fn apply_output(
        &self,
        key: &InstanceKey,
        inner: &mut InstanceInner,
        output: CallOutput,
    ) -> CallOutcome {
        let state_written = output.state_dirty;
        if let Some(state) = output.state.filter(|_| output.state_dirty) {
            if let Err(e) = self.store.save(&key.state_key(), &state) {
                warn!(
                    room = %key.room_id,
                    module = %key.module_id,
                    error = %e,
                    "state write failed, keeping cached copy"
                );
            }
            inner.state = state;
        }
        if output.dropped_logs > 0 {
            warn!(
                room = %key.room_id,
                module = %key.module_id,
                dropped = output.dropped_logs,
                "agent log lines dropped"
            );
        }
        for event in &output.events {
            let _ = self.events.send(RoomEvent {
                instance: key.clone(),
                event: event.clone(),
            });
        }
        CallOutcome {
            events: output.events,
            logs: output.logs,
            dropped_logs: output.dropped_logs,
            state_written,
        }
    }

    /// Fault the instance, terminate its isolate and drop its cached state.
    /// The stored blob is left alone.
    fn fault(&self, slot: &InstanceSlot, inner: &mut InstanceInner, err: AgentError) -> AgentError {
        let _ = slot.transition(AgentStatus::Faulted);
        inner.release();
        error!(
            room = %slot.key.room_id,
            module = %slot.key.module_id,
            error = %err,
            "agent faulted"
        );
        err
    }

    /// Drop an instance that never became usable.
    fn discard(&self, slot: &Arc<InstanceSlot>, inner: &mut InstanceInner) {
        inner.release();
        let _ = slot.transition(AgentStatus::Faulted);
        self.remove_slot(slot);
    }

    /// Stop an instance. Its persisted state is kept for the next activation.
    pub async fn deactivate(&self, key: &InstanceKey) -> Result<()> {
        let slot = self
            .slot(key)
            .ok_or_else(|| AgentError::NotActive(key.clone()))?;
        let mut inner = slot.inner.lock().await;
        slot.transition(AgentStatus::Deactivating)?;
        inner.release();
        slot.transition(AgentStatus::Destroyed)?;
        self.remove_slot(&slot);
        info!(room = %key.room_id, module = %key.module_id, "agent deactivated");
        Ok(())
    }

    /// Deactivate (if live) and delete the persisted state.
    pub async fn unload(&self, key: &InstanceKey) -> Result<()> {
        match self.deactivate(key).await {
            Ok(()) | Err(AgentError::NotActive(_)) => {}
            Err(e) => return Err(e),
        }
        self.store.remove(&key.state_key())?;
        info!(room = %key.room_id, module = %key.module_id, "agent unloaded");
        Ok(())
    }

    /// Hand the instance new room context; visible from its next call.
    pub async fn update_context(&self, key: &InstanceKey, context: Vec<u8>) -> Result<()> {
        let slot = self
            .slot(key)
            .ok_or_else(|| AgentError::NotActive(key.clone()))?;
        let inner = slot.inner.lock().await;
        slot.ensure_callable()?;
        match inner.handle.as_ref() {
            Some(handle) => handle
                .send(IsolateRequest::UpdateContext { context })
                .map_err(|e| AgentError::Isolate(e.to_string())),
            None => Err(AgentError::NotActive(key.clone())),
        }
    }

    /// Deactivate every instance.
    pub async fn shutdown(&self) {
        let keys: Vec<_> = self.instances.lock().unwrap().keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.deactivate(&key).await {
                warn!(
                    room = %key.room_id,
                    module = %key.module_id,
                    error = %e,
                    "deactivate during shutdown failed"
                );
            }
        }
    }

    fn slot(&self, key: &InstanceKey) -> Option<Arc<InstanceSlot>> {
        self.instances.lock().unwrap().get(key).cloned()
    }

    fn remove_slot(&self, slot: &Arc<InstanceSlot>) {
        let mut instances = self.instances.lock().unwrap();
        if instances
            .get(&slot.key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            instances.remove(&slot.key);
        }
    }
}

impl From<CallFailure> for AgentError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Trap { kind, message } => AgentError::Trap { kind, message },
            CallFailure::CapabilityViolation(v) => AgentError::CapabilityViolation(v),
            CallFailure::Malformed(message) => malformed(message),
            CallFailure::NotInstantiated => malformed("isolate not instantiated".into()),
        }
    }
}

fn malformed(message: String) -> AgentError {
    AgentError::Trap {
        kind: TrapKind::MalformedResponse,
        message,
    }
}

fn timed_out(what: &str) -> AgentError {
    AgentError::Trap {
        kind: TrapKind::Timeout,
        message: format!("{what} timed out"),
    }
}

fn unexpected_id(expected: u64, got: u64) -> AgentError {
    malformed(format!("response id {got} does not match request {expected}"))
}

#[cfg(test)]
mod tests {
    use roomagent_crypto::DeviceSeed;
    use roomagent_state::{MemoryStateStore, SeedCipher};

    use super::*;

    fn controller() -> AgentController {
        let store = EncryptedStateStore::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(SeedCipher::new(DeviceSeed::generate())),
        );
        AgentController::new(
            ControllerConfig::default(),
            Arc::new(ModuleRegistry::new()),
            Arc::new(store),
        )
        .unwrap()
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = RoomAgentConfig::default();
        settings.controller.call_timeout_ms = 250;
        settings.controller.event_channel_capacity = 0;
        let config = ControllerConfig::from_settings(&settings);
        assert_eq!(config.call_timeout, Duration::from_millis(250));
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.capability_ceiling, PermissionSet::all());
        assert_eq!(config.sandbox.max_execution_time, Duration::from_millis(250));
    }

    #[test]
    fn test_execution_time_never_exceeds_call_timeout() {
        let mut config = ControllerConfig::default();
        config.call_timeout = Duration::from_millis(300);
        config.sandbox.max_execution_time = Duration::from_secs(30);
        let store = EncryptedStateStore::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(SeedCipher::new(DeviceSeed::generate())),
        );
        let ctl = AgentController::new(config, Arc::new(ModuleRegistry::new()), Arc::new(store))
            .unwrap();
        assert_eq!(ctl.config().sandbox.max_execution_time, Duration::from_millis(300));

        let mut shorter = ControllerConfig::default();
        shorter.call_timeout = Duration::from_secs(5);
        shorter.sandbox.max_execution_time = Duration::from_secs(1);
        assert_eq!(shorter.bounded().sandbox.max_execution_time, Duration::from_secs(1));
    }

    #[test]
    fn test_call_failure_mapping() {
        let err = AgentError::from(CallFailure::NotInstantiated);
        assert!(matches!(
            err,
            AgentError::Trap {
                kind: TrapKind::MalformedResponse,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_module_leaves_no_instance() {
        let ctl = controller();
        let key = InstanceKey::new("room", "missing");
        let err = ctl.activate(&key, &DataBuffer::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownModule(_)));
        assert!(ctl.status(&key).is_none());
        assert!(ctl.instances().is_empty());
    }

    #[tokio::test]
    async fn test_calls_on_missing_instance() {
        let ctl = controller();
        let key = InstanceKey::new("room", "m");
        assert!(matches!(
            ctl.on_tick(&key, &DataBuffer::default()).await,
            Err(AgentError::NotActive(_))
        ));
        assert!(matches!(ctl.deactivate(&key).await, Err(AgentError::NotActive(_))));
        assert!(ctl.unload(&key).await.is_ok());
    }
}
