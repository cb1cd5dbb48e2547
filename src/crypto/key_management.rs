//! Evidence Signing Key Management
//!
//! Loads or creates the evidence signing keypair from a file-backed key
//! store, signs content hashes, and verifies signatures against a keyring
//! that keeps every retired public key.
//!
//! Signatures are encoded as `<key_id>:<hex compact signature>` so a
//! verifier can select the right public key after a rotation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use secp256k1::{ecdsa::Signature, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::signatures::SignatureManager;
use crate::canonical::{self, sha256_hex};
use crate::error::{LedgerError, Result};

const KEY_FILE_VERSION: u32 = 1;

/// Short identifier derived from the compressed public key.
pub fn key_id_for(public_key: &PublicKey) -> String {
    sha256_hex(&public_key.serialize())[..16].to_string()
}

/// Active signing keypair.
pub struct Keypair {
    pub key_id: String,
    secret_key: SecretKey,
    pub public_key: PublicKey,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("key_id", &self.key_id)
            .field("public_key", &self.public_key.to_string())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Public half of a key that no longer signs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredKey {
    pub key_id: String,
    pub public_key: String,
    #[serde(with = "canonical::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "canonical::timestamp")]
    pub retired_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    key_id: String,
    secret_key: String,
    public_key: String,
    #[serde(with = "canonical::timestamp")]
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    active: StoredKey,
    #[serde(default)]
    retired: Vec<RetiredKey>,
}

struct KeyState {
    active: Option<Keypair>,
    retired: Vec<RetiredKey>,
    public_keys: HashMap<String, PublicKey>,
}

/// File-backed signing key manager.
pub struct KeyManager {
    path: Option<PathBuf>,
    signature_manager: SignatureManager,
    state: RwLock<KeyState>,
}

impl KeyManager {
    /// Load the keypair at `path`, creating it when the file does not exist.
    ///
    /// A file that exists but cannot be read or parsed is an error and is
    /// left untouched.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let signature_manager = SignatureManager::new();

        let state = if path.exists() {
            let state = Self::read_key_file(&path, &signature_manager)?;
            info!(
                "Loaded signing key {} from {:?} ({} retired)",
                state.active.as_ref().map(|k| k.key_id.as_str()).unwrap_or("-"),
                path,
                state.retired.len()
            );
            state
        } else {
            let keypair = Self::new_keypair(&signature_manager);
            let state = KeyState {
                public_keys: HashMap::from([(keypair.key_id.clone(), keypair.public_key)]),
                active: Some(keypair),
                retired: Vec::new(),
            };
            Self::write_key_file(&path, &state)?;
            info!(
                "Created signing key {} at {:?}",
                state.active.as_ref().map(|k| k.key_id.as_str()).unwrap_or("-"),
                path
            );
            state
        };

        Ok(Self {
            path: Some(path),
            signature_manager,
            state: RwLock::new(state),
        })
    }

    /// Build a manager that can only verify, from already known public keys.
    pub fn verify_only(public_keys: impl IntoIterator<Item = (String, PublicKey)>) -> Self {
        Self {
            path: None,
            signature_manager: SignatureManager::new(),
            state: RwLock::new(KeyState {
                active: None,
                retired: Vec::new(),
                public_keys: public_keys.into_iter().collect(),
            }),
        }
    }

    fn new_keypair(signature_manager: &SignatureManager) -> Keypair {
        let (secret_key, public_key) = signature_manager.generate_keypair();
        Keypair {
            key_id: key_id_for(&public_key),
            secret_key,
            public_key,
            created_at: canonical::now(),
        }
    }

    fn read_key_file(path: &Path, signature_manager: &SignatureManager) -> Result<KeyState> {
        let contents = fs::read_to_string(path)
            .map_err(|e| LedgerError::KeyStoreError(format!("Failed to read {:?}: {}", path, e)))?;
        let file: KeyFile = serde_json::from_str(&contents)
            .map_err(|e| LedgerError::KeyStoreError(format!("Corrupt key file {:?}: {}", path, e)))?;

        if file.version != KEY_FILE_VERSION {
            return Err(LedgerError::KeyStoreError(format!(
                "Unsupported key file version {} in {:?}",
                file.version, path
            )));
        }

        let secret_bytes = hex::decode(&file.active.secret_key)
            .map_err(|e| LedgerError::KeyStoreError(format!("Invalid secret key hex: {}", e)))?;
        let secret_key = SecretKey::from_slice(&secret_bytes)
            .map_err(|e| LedgerError::KeyStoreError(format!("Invalid secret key: {}", e)))?;
        let public_key = signature_manager.public_key_from_secret(&secret_key);

        if public_key.to_string() != file.active.public_key {
            return Err(LedgerError::KeyStoreError(format!(
                "Public key in {:?} does not match its secret key",
                path
            )));
        }

        let mut public_keys = HashMap::new();
        for retired in &file.retired {
            let pk = parse_public_key(&retired.public_key)?;
            public_keys.insert(retired.key_id.clone(), pk);
        }
        public_keys.insert(file.active.key_id.clone(), public_key);

        Ok(KeyState {
            active: Some(Keypair {
                key_id: file.active.key_id,
                secret_key,
                public_key,
                created_at: file.active.created_at,
            }),
            retired: file.retired,
            public_keys,
        })
    }

    fn write_key_file(path: &Path, state: &KeyState) -> Result<()> {
        let active = state
            .active
            .as_ref()
            .ok_or_else(|| LedgerError::KeyStoreError("No active key to persist".to_string()))?;

        let file = KeyFile {
            version: KEY_FILE_VERSION,
            active: StoredKey {
                key_id: active.key_id.clone(),
                secret_key: hex::encode(active.secret_key.secret_bytes()),
                public_key: active.public_key.to_string(),
                created_at: active.created_at,
            },
            retired: state.retired.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    LedgerError::KeyStoreError(format!("Failed to create key directory {:?}: {}", parent, e))
                })?;
            }
        }

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, json.as_bytes())
            .map_err(|e| LedgerError::KeyStoreError(format!("Failed to write {:?}: {}", tmp_path, e)))?;
        restrict_permissions(&tmp_path)?;
        fs::rename(&tmp_path, path)
            .map_err(|e| LedgerError::KeyStoreError(format!("Failed to install {:?}: {}", path, e)))?;

        debug!("Key file written to {:?}", path);
        Ok(())
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, KeyState>> {
        self.state
            .read()
            .map_err(|_| LedgerError::KeyStoreError("Key state lock poisoned".to_string()))
    }

    /// Identifier of the key currently used for signing.
    pub fn active_key_id(&self) -> Option<String> {
        self.read_state()
            .ok()
            .and_then(|s| s.active.as_ref().map(|k| k.key_id.clone()))
    }

    /// Hex-encoded public half of the active key.
    pub fn active_public_key(&self) -> Option<String> {
        self.read_state()
            .ok()
            .and_then(|s| s.active.as_ref().map(|k| k.public_key.to_string()))
    }

    /// All public keys known for verification, active and retired.
    pub fn keyring(&self) -> Vec<(String, PublicKey)> {
        match self.read_state() {
            Ok(state) => {
                let mut keys: Vec<_> = state.public_keys.iter().map(|(id, pk)| (id.clone(), *pk)).collect();
                keys.sort_by(|a, b| a.0.cmp(&b.0));
                keys
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn retired_keys(&self) -> Vec<RetiredKey> {
        self.read_state().map(|s| s.retired.clone()).unwrap_or_default()
    }

    /// Sign `message` with the active key.
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        let state = self.read_state()?;
        let keypair = state
            .active
            .as_ref()
            .ok_or_else(|| LedgerError::KeyStoreError("No signing key loaded".to_string()))?;

        let signature = self
            .signature_manager
            .create_signature(message, &keypair.secret_key)?;
        Ok(format!(
            "{}:{}",
            keypair.key_id,
            hex::encode(signature.serialize_compact())
        ))
    }

    /// Check `signature` over `message`. Any mismatch or malformed input is `false`.
    pub fn verify(&self, message: &[u8], signature: &str) -> bool {
        let Some((key_id, sig_hex)) = signature.split_once(':') else {
            debug!("Signature without key id");
            return false;
        };

        let public_key = match self.read_state() {
            Ok(state) => match state.public_keys.get(key_id) {
                Some(pk) => *pk,
                None => {
                    warn!("Signature references unknown key {}", key_id);
                    return false;
                }
            },
            Err(_) => return false,
        };

        let Ok(sig_bytes) = hex::decode(sig_hex) else {
            return false;
        };
        let Ok(signature) = Signature::from_compact(&sig_bytes) else {
            return false;
        };

        self.signature_manager
            .verify_signature(message, &signature, &public_key)
    }

    /// Retire the active key and start signing with a fresh one.
    ///
    /// The retired public key stays in the keyring so earlier signatures
    /// keep verifying. Returns the new key id.
    pub fn rotate(&self) -> Result<String> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| LedgerError::KeyStoreError("Verify-only key manager cannot rotate".to_string()))?;

        let mut state = self
            .state
            .write()
            .map_err(|_| LedgerError::KeyStoreError("Key state lock poisoned".to_string()))?;

        let new_keypair = Self::new_keypair(&self.signature_manager);
        let new_id = new_keypair.key_id.clone();

        let mut next_retired = state.retired.clone();
        if let Some(old) = state.active.as_ref() {
            next_retired.push(RetiredKey {
                key_id: old.key_id.clone(),
                public_key: old.public_key.to_string(),
                created_at: old.created_at,
                retired_at: canonical::now(),
            });
        }

        let mut public_keys = state.public_keys.clone();
        public_keys.insert(new_id.clone(), new_keypair.public_key);

        let next = KeyState {
            active: Some(new_keypair),
            retired: next_retired,
            public_keys,
        };

        // Persist before swapping so a failed write leaves the old key in force.
        Self::write_key_file(path, &next)?;
        *state = next;

        info!("Signing key rotated, new key {}", new_id);
        Ok(new_id)
    }
}

fn parse_public_key(value: &str) -> Result<PublicKey> {
    value
        .parse::<PublicKey>()
        .map_err(|e| LedgerError::KeyStoreError(format!("Invalid public key {}: {}", value, e)))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| LedgerError::KeyStoreError(format!("Failed to set permissions on {:?}: {}", path, e)))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_then_reload_same_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("signing.json");

        let first = KeyManager::load_or_create(&path).unwrap();
        assert!(path.exists());
        let signature = first.sign(b"abc").unwrap();

        let second = KeyManager::load_or_create(&path).unwrap();
        assert_eq!(first.active_key_id(), second.active_key_id());
        assert!(second.verify(b"abc", &signature));
    }

    #[test]
    fn test_signature_format() {
        let dir = tempdir().unwrap();
        let manager = KeyManager::load_or_create(dir.path().join("k.json")).unwrap();
        let signature = manager.sign(b"hash").unwrap();

        let (key_id, sig_hex) = signature.split_once(':').unwrap();
        assert_eq!(Some(key_id.to_string()), manager.active_key_id());
        assert_eq!(sig_hex.len(), 128);
    }

    #[test]
    fn test_verify_never_errors_on_garbage() {
        let dir = tempdir().unwrap();
        let manager = KeyManager::load_or_create(dir.path().join("k.json")).unwrap();

        assert!(!manager.verify(b"m", ""));
        assert!(!manager.verify(b"m", "no-separator"));
        assert!(!manager.verify(b"m", "unknown:00"));
        let key_id = manager.active_key_id().unwrap();
        assert!(!manager.verify(b"m", &format!("{}:zz", key_id)));
        assert!(!manager.verify(b"m", &format!("{}:{}", key_id, "00".repeat(64))));
    }

    #[test]
    fn test_corrupt_key_file_is_error_and_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("k.json");
        fs::write(&path, b"not json").unwrap();

        let result = KeyManager::load_or_create(&path);
        assert!(matches!(result, Err(LedgerError::KeyStoreError(_))));
        assert_eq!(fs::read(&path).unwrap(), b"not json");
    }

    #[test]
    fn test_rotation_keeps_old_signatures_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("k.json");
        let manager = KeyManager::load_or_create(&path).unwrap();

        let old_id = manager.active_key_id().unwrap();
        let old_signature = manager.sign(b"before").unwrap();

        let new_id = manager.rotate().unwrap();
        assert_ne!(old_id, new_id);
        assert!(manager.verify(b"before", &old_signature));

        let new_signature = manager.sign(b"after").unwrap();
        assert!(new_signature.starts_with(&new_id));

        let reloaded = KeyManager::load_or_create(&path).unwrap();
        assert_eq!(reloaded.active_key_id(), Some(new_id));
        assert_eq!(reloaded.retired_keys().len(), 1);
        assert!(reloaded.verify(b"before", &old_signature));
        assert!(reloaded.verify(b"after", &new_signature));
    }

    #[test]
    fn test_verify_only_cannot_sign() {
        let dir = tempdir().unwrap();
        let full = KeyManager::load_or_create(dir.path().join("k.json")).unwrap();
        let signature = full.sign(b"hash").unwrap();

        let verifier = KeyManager::verify_only(full.keyring());
        assert!(verifier.verify(b"hash", &signature));
        assert!(matches!(verifier.sign(b"hash"), Err(LedgerError::KeyStoreError(_))));
        assert!(verifier.rotate().is_err());
    }
}
