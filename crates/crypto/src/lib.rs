//! RoomAgent Crypto
//!
//! Primitives used by the sandbox host: per-scope key derivation from the
//! device seed, authenticated encryption of persisted agent state, and
//! ed25519 signatures over agent modules.

pub mod keys;
pub mod encrypt;
pub mod sign;

pub use keys::{content_hash, derive_scoped_key, DeviceSeed, SigningKeypair, SEED_LEN};
pub use encrypt::{decrypt_symmetric, encrypt_symmetric, EncryptError, NONCE_LEN};
pub use sign::{sign_data, verify_signature};
