use crate::error::LedgerError;
use secp256k1::{ecdsa::Signature, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use tracing::debug;

/// ECDSA over secp256k1, signing the SHA-256 digest of the message.
pub struct SignatureManager {
    secp: Secp256k1<secp256k1::All>,
}

impl SignatureManager {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    fn message_digest(message: &[u8]) -> Result<secp256k1::Message, LedgerError> {
        let message_hash = Sha256::digest(message);
        secp256k1::Message::from_digest_slice(&message_hash)
            .map_err(|e| LedgerError::KeyStoreError(format!("Invalid message hash: {}", e)))
    }

    pub fn create_signature(
        &self,
        message: &[u8],
        secret_key: &SecretKey,
    ) -> Result<Signature, LedgerError> {
        let message_hash = Self::message_digest(message)?;
        Ok(self.secp.sign_ecdsa(&message_hash, secret_key))
    }

    /// Returns `false` on any mismatch; never errors.
    pub fn verify_signature(
        &self,
        message: &[u8],
        signature: &Signature,
        public_key: &PublicKey,
    ) -> bool {
        let message_hash = match Self::message_digest(message) {
            Ok(hash) => hash,
            Err(_) => return false,
        };

        match self.secp.verify_ecdsa(&message_hash, signature, public_key) {
            Ok(_) => true,
            Err(e) => {
                debug!("Signature rejected: {}", e);
                false
            }
        }
    }

    pub fn public_key_from_secret(&self, secret_key: &SecretKey) -> PublicKey {
        PublicKey::from_secret_key(&self.secp, secret_key)
    }

    /// Generate a new keypair
    pub fn generate_keypair(&self) -> (SecretKey, PublicKey) {
        let mut rng = rand::rngs::OsRng;
        let secret_key = SecretKey::new(&mut rng);
        let public_key = PublicKey::from_secret_key(&self.secp, &secret_key);
        (secret_key, public_key)
    }
}

impl Default for SignatureManager {
    fn default() -> Self {
        Self::new()
    }
}
