use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

pub const NONCE_LEN: usize = 12;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncryptError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Ciphertext too short")]
    CiphertextTooShort,
}

/// Encrypt with ChaCha20-Poly1305 under a random nonce.
///
/// Output is `[nonce: 12][ciphertext + tag]`. `aad` is authenticated but not
/// stored; the same bytes must be supplied to decrypt.
pub fn encrypt_symmetric(
    key: &[u8; 32],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptError::InvalidKey)?;

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| EncryptError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Reverse of [`encrypt_symmetric`].
pub fn decrypt_symmetric(
    key: &[u8; 32],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    if ciphertext.len() < NONCE_LEN {
        return Err(EncryptError::CiphertextTooShort);
    }

    let (nonce, body) = ciphertext.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptError::InvalidKey)?;

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad })
        .map_err(|_| EncryptError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_encryption() {
        let key = [42u8; 32];
        let ciphertext = encrypt_symmetric(&key, b"room/agent", b"state v1").unwrap();
        assert_ne!(&ciphertext[NONCE_LEN..], b"state v1");
        let decrypted = decrypt_symmetric(&key, b"room/agent", &ciphertext).unwrap();
        assert_eq!(decrypted, b"state v1");
    }

    #[test]
    fn test_wrong_key_fails() {
        let ciphertext = encrypt_symmetric(&[42u8; 32], b"", b"Secret data").unwrap();
        let result = decrypt_symmetric(&[43u8; 32], b"", &ciphertext);
        assert_eq!(result, Err(EncryptError::DecryptionFailed));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = [9u8; 32];
        let ciphertext = encrypt_symmetric(&key, b"room-a", b"blob").unwrap();
        assert!(decrypt_symmetric(&key, b"room-b", &ciphertext).is_err());
    }

    #[test]
    fn test_nonce_is_random() {
        let key = [1u8; 32];
        let a = encrypt_symmetric(&key, b"", b"same").unwrap();
        let b = encrypt_symmetric(&key, b"", b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_ciphertext_too_short() {
        let result = decrypt_symmetric(&[42u8; 32], b"", &[1, 2, 3]);
        assert!(matches!(result, Err(EncryptError::CiphertextTooShort)));
    }

    #[test]
    fn test_encrypt_empty_plaintext() {
        let key = [42u8; 32];
        let ciphertext = encrypt_symmetric(&key, b"", b"").unwrap();
        let decrypted = decrypt_symmetric(&key, b"", &ciphertext).unwrap();
        assert!(decrypted.is_empty());
    }
}
