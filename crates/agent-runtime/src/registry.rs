//! Registered agent modules and the publishers allowed to sign them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use roomagent_crypto::{content_hash, verify_signature};
use tracing::{info, warn};

use crate::lifecycle::AgentManifest;

/// A manifest together with its wasm bytes.
#[derive(Debug)]
pub struct RegisteredModule {
    pub manifest: AgentManifest,
    pub wasm: Arc<[u8]>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error("content hash mismatch: manifest says {expected}, binary is {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("publisher {0} is not trusted")]
    UntrustedPublisher(String),
    #[error("invalid publisher signature on {0}")]
    BadSignature(String),
}

#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<RegisteredModule>>>,
    trusted: RwLock<HashSet<[u8; 32]>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trust_publisher(&self, pubkey: [u8; 32]) {
        self.trusted.write().unwrap().insert(pubkey);
    }

    pub fn revoke_publisher(&self, pubkey: &[u8; 32]) -> bool {
        self.trusted.write().unwrap().remove(pubkey)
    }

    pub fn is_trusted(&self, pubkey: &[u8; 32]) -> bool {
        self.trusted.read().unwrap().contains(pubkey)
    }

    /// Add or replace a module. The binary must match the manifest hash.
    pub fn register(&self, manifest: AgentManifest, wasm: Vec<u8>) -> Result<(), RegistryError> {
        check_hash(&manifest, &wasm)?;
        info!(module = %manifest.module_id, version = %manifest.version, "module registered");
        let module = RegisteredModule {
            wasm: Arc::from(wasm),
            manifest,
        };
        self.modules
            .write()
            .unwrap()
            .insert(module.manifest.module_id.clone(), Arc::new(module));
        Ok(())
    }

    pub fn remove(&self, module_id: &str) -> Option<Arc<RegisteredModule>> {
        self.modules.write().unwrap().remove(module_id)
    }

    pub fn get(&self, module_id: &str) -> Option<Arc<RegisteredModule>> {
        self.modules.read().unwrap().get(module_id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.modules.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Look a module up and verify it is fit to run.
    pub fn resolve(&self, module_id: &str) -> Result<Arc<RegisteredModule>, RegistryError> {
        let module = self
            .get(module_id)
            .ok_or_else(|| RegistryError::UnknownModule(module_id.to_string()))?;
        self.verify(&module)?;
        Ok(module)
    }

    /// Check hash, publisher trust and signature.
    pub fn verify(&self, module: &RegisteredModule) -> Result<(), RegistryError> {
        let manifest = &module.manifest;
        check_hash(manifest, &module.wasm)?;
        if !self.is_trusted(&manifest.publisher) {
            warn!(module = %manifest.module_id, "untrusted publisher");
            return Err(RegistryError::UntrustedPublisher(hex::encode(manifest.publisher)));
        }
        if !verify_signature(&manifest.publisher, &manifest.signable_bytes(), &manifest.signature) {
            warn!(module = %manifest.module_id, "bad module signature");
            return Err(RegistryError::BadSignature(manifest.module_id.clone()));
        }
        Ok(())
    }
}

fn check_hash(manifest: &AgentManifest, wasm: &[u8]) -> Result<(), RegistryError> {
    let actual = content_hash(wasm);
    if actual != manifest.content_hash {
        return Err(RegistryError::HashMismatch {
            expected: manifest.content_hash.clone(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use roomagent_crypto::{sign_data, SigningKeypair};

    use super::*;
    use crate::lifecycle::RoomScope;
    use crate::permissions::Capability;

    fn signed(keypair: &SigningKeypair, wasm: &[u8]) -> AgentManifest {
        let mut manifest = AgentManifest {
            module_id: "auto-balance".into(),
            name: "Auto balance".into(),
            version: "1.0.0".into(),
            content_hash: content_hash(wasm),
            publisher: keypair.public_key_bytes(),
            signature: [0u8; 64],
            required_capabilities: vec![Capability::ReadRoomData, Capability::EmitAssignment],
            room_scope: RoomScope::Any,
        };
        manifest.signature = sign_data(keypair, &manifest.signable_bytes());
        manifest
    }

    #[test]
    fn test_register_and_resolve() {
        let keypair = SigningKeypair::generate();
        let registry = ModuleRegistry::new();
        registry.trust_publisher(keypair.public_key_bytes());
        registry
            .register(signed(&keypair, b"wasm"), b"wasm".to_vec())
            .unwrap();

        let module = registry.resolve("auto-balance").unwrap();
        assert_eq!(&*module.wasm, b"wasm");
        assert_eq!(registry.list(), vec!["auto-balance".to_string()]);
    }

    #[test]
    fn test_register_rejects_hash_mismatch() {
        let keypair = SigningKeypair::generate();
        let registry = ModuleRegistry::new();
        let err = registry
            .register(signed(&keypair, b"wasm"), b"other".to_vec())
            .unwrap_err();
        assert!(matches!(err, RegistryError::HashMismatch { .. }));
        assert!(registry.get("auto-balance").is_none());
    }

    #[test]
    fn test_untrusted_and_revoked_publishers() {
        let keypair = SigningKeypair::generate();
        let registry = ModuleRegistry::new();
        registry
            .register(signed(&keypair, b"wasm"), b"wasm".to_vec())
            .unwrap();
        assert!(matches!(
            registry.resolve("auto-balance"),
            Err(RegistryError::UntrustedPublisher(_))
        ));

        registry.trust_publisher(keypair.public_key_bytes());
        assert!(registry.resolve("auto-balance").is_ok());
        assert!(registry.revoke_publisher(&keypair.public_key_bytes()));
        assert!(registry.resolve("auto-balance").is_err());
    }

    #[test]
    fn test_bad_signature() {
        let keypair = SigningKeypair::generate();
        let registry = ModuleRegistry::new();
        registry.trust_publisher(keypair.public_key_bytes());
        let mut manifest = signed(&keypair, b"wasm");
        manifest.version = "2.0.0".into();
        registry.register(manifest, b"wasm".to_vec()).unwrap();
        assert_eq!(
            registry.resolve("auto-balance").unwrap_err(),
            RegistryError::BadSignature("auto-balance".into())
        );
    }

    #[test]
    fn test_unknown_and_remove() {
        let registry = ModuleRegistry::new();
        assert_eq!(
            registry.resolve("nope").unwrap_err(),
            RegistryError::UnknownModule("nope".into())
        );
        let keypair = SigningKeypair::generate();
        registry
            .register(signed(&keypair, b"wasm"), b"wasm".to_vec())
            .unwrap();
        assert!(registry.remove("auto-balance").is_some());
        assert!(registry.get("auto-balance").is_none());
    }
}
