//! Seam to the encryption collaborator.

use roomagent_crypto::{decrypt_symmetric, derive_scoped_key, encrypt_symmetric, DeviceSeed};
use zeroize::Zeroizing;

use crate::{StateKey, StorageError};

const STATE_KEY_CONTEXT: &str = "roomagent 2026-01 agent state encryption v1";

/// Seals and opens state blobs for one storage slot.
pub trait StateCipher: Send + Sync {
    fn seal(&self, key: &StateKey, plaintext: &[u8]) -> Result<Vec<u8>, StorageError>;
    fn open(&self, key: &StateKey, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, StorageError>;
}

/// ChaCha20-Poly1305 under a key derived from the device seed and the slot.
///
/// The slot is also bound as associated data, so a blob copied between slots
/// fails authentication.
pub struct SeedCipher {
    seed: DeviceSeed,
}

impl SeedCipher {
    pub fn new(seed: DeviceSeed) -> Self {
        Self { seed }
    }

    fn slot_key(&self, key: &StateKey) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(derive_scoped_key(
            &self.seed,
            STATE_KEY_CONTEXT,
            &[key.room_id.as_bytes(), key.instance_id.as_bytes()],
        ))
    }
}

fn associated_data(key: &StateKey) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + key.room_id.len() + key.instance_id.len());
    for part in [&key.room_id, &key.instance_id] {
        aad.extend_from_slice(&(part.len() as u64).to_le_bytes());
        aad.extend_from_slice(part.as_bytes());
    }
    aad
}

impl StateCipher for SeedCipher {
    fn seal(&self, key: &StateKey, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        Ok(encrypt_symmetric(
            &self.slot_key(key),
            &associated_data(key),
            plaintext,
        )?)
    }

    fn open(&self, key: &StateKey, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, StorageError> {
        let plain = decrypt_symmetric(&self.slot_key(key), &associated_data(key), sealed)?;
        Ok(Zeroizing::new(plain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let cipher = SeedCipher::new(DeviceSeed::from_bytes([5u8; 32]));
        let key = StateKey::new("room", "agent");
        let sealed = cipher.seal(&key, b"hello").unwrap();
        assert_eq!(cipher.open(&key, &sealed).unwrap().as_slice(), b"hello");
    }

    #[test]
    fn test_other_seed_cannot_open() {
        let key = StateKey::new("room", "agent");
        let sealed = SeedCipher::new(DeviceSeed::from_bytes([5u8; 32]))
            .seal(&key, b"hello")
            .unwrap();
        let other = SeedCipher::new(DeviceSeed::from_bytes([6u8; 32]));
        assert!(other.open(&key, &sealed).is_err());
    }

    #[test]
    fn test_instance_scoping() {
        let cipher = SeedCipher::new(DeviceSeed::from_bytes([5u8; 32]));
        let sealed = cipher.seal(&StateKey::new("room", "a"), b"x").unwrap();
        assert!(cipher.open(&StateKey::new("room", "b"), &sealed).is_err());
    }
}
