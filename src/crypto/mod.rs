//! Evidence signing: secp256k1 ECDSA and the file-backed key store.

pub mod key_management;
pub mod signatures;

pub use key_management::{key_id_for, KeyManager, Keypair, RetiredKey};
pub use signatures::SignatureManager;
