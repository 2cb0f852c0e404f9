use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};

use crate::keys::SigningKeypair;

/// Sign `data` (typically a module's signable bytes).
pub fn sign_data(keypair: &SigningKeypair, data: &[u8]) -> [u8; 64] {
    let signature: Signature = keypair.signing_key.sign(data);
    signature.to_bytes()
}

/// Verify a publisher signature. Malformed keys verify as `false`.
pub fn verify_signature(pubkey: &[u8; 32], data: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(pubkey) else {
        return false;
    };
    let signature = Signature::from_bytes(signature);
    verifying_key.verify_strict(data, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = SigningKeypair::generate();
        let data = b"auto-balance:deadbeef";
        let signature = sign_data(&keypair, data);
        assert!(verify_signature(&keypair.public_key_bytes(), data, &signature));
        assert!(!verify_signature(&keypair.public_key_bytes(), b"auto-balance:cafe", &signature));
    }

    #[test]
    fn test_wrong_pubkey_fails() {
        let signer = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let signature = sign_data(&signer, b"module");
        assert!(!verify_signature(&other.public_key_bytes(), b"module", &signature));
    }

    #[test]
    fn test_tampered_signature_fails() {
        let keypair = SigningKeypair::generate();
        let mut signature = sign_data(&keypair, b"module");
        signature[0] ^= 0x01;
        assert!(!verify_signature(&keypair.public_key_bytes(), b"module", &signature));
    }
}
