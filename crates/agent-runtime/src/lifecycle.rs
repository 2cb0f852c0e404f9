use std::fmt;

use roomagent_state::StateKey;
use serde::{Deserialize, Serialize};

use crate::permissions::{Capability, PermissionSet};

/// Agent module metadata. The wasm bytes live beside it in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManifest {
    pub module_id: String,
    pub name: String,
    pub version: String,
    /// blake3 of the wasm binary, hex.
    pub content_hash: String,
    /// Publisher ed25519 public key.
    pub publisher: [u8; 32],
    /// Publisher signature over [`AgentManifest::signable_bytes`].
    #[serde(with = "signature_hex")]
    pub signature: [u8; 64],
    pub required_capabilities: Vec<Capability>,
    pub room_scope: RoomScope,
}

impl AgentManifest {
    /// Canonical bytes covered by the publisher signature.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for field in [&self.module_id, &self.version, &self.content_hash] {
            data.extend_from_slice(&(field.len() as u32).to_le_bytes());
            data.extend_from_slice(field.as_bytes());
        }
        let mut caps: Vec<_> = self
            .required_capabilities
            .iter()
            .map(|c| Capability::ALL.iter().position(|a| a == c).unwrap_or(usize::MAX) as u8)
            .collect();
        caps.sort_unstable();
        caps.dedup();
        data.push(caps.len() as u8);
        data.extend_from_slice(&caps);
        data
    }

    pub fn permissions(&self) -> PermissionSet {
        PermissionSet::new(self.required_capabilities.iter().copied())
    }
}

mod signature_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(sig))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let text = String::deserialize(d)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }
}

/// Rooms a module may be activated in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomScope {
    Any,
    Rooms(Vec<String>),
}

impl RoomScope {
    pub fn allows(&self, room_id: &str) -> bool {
        match self {
            RoomScope::Any => true,
            RoomScope::Rooms(rooms) => rooms.iter().any(|r| r == room_id),
        }
    }
}

/// Identity of one agent instance: a module bound to a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub room_id: String,
    pub module_id: String,
}

impl InstanceKey {
    pub fn new(room_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            module_id: module_id.into(),
        }
    }

    /// Instance id within the room. Stable across activations so the
    /// persisted blob is found again.
    pub fn instance_id(&self) -> &str {
        &self.module_id
    }

    pub fn state_key(&self) -> StateKey {
        StateKey::new(self.room_id.clone(), self.instance_id())
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room_id, self.module_id)
    }
}

/// Lifecycle of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    Unloaded,
    Loading,
    Ready,
    Active,
    /// A call is in flight.
    Ticking,
    Deactivating,
    Destroyed,
    Faulted,
}

impl AgentStatus {
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        match (self, next) {
            (Unloaded, Loading) => true,
            (Loading, Ready) => true,
            (Ready | Active, Ticking) => true,
            (Ticking, Active) => true,
            (Ready | Active | Faulted, Deactivating) => true,
            (Deactivating, Destroyed) => true,
            (Destroyed, _) => false,
            (Faulted, Faulted) => false,
            (_, Faulted) => true,
            _ => false,
        }
    }

    /// Apply a transition, refusing anything outside the state machine.
    pub fn transition(&mut self, next: AgentStatus) -> Result<AgentStatus, LifecycleError> {
        if !self.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        let prev = *self;
        *self = next;
        Ok(prev)
    }

}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid lifecycle transition {from:?} -> {to:?}")]
    InvalidTransition { from: AgentStatus, to: AgentStatus },
}
