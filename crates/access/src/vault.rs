//! Reversible encryption of shared secrets.
//!
//! Secrets attached to directory policies are stored as ChaCha20-Poly1305
//! ciphertext. The key is derived once from install-wide [`KeyMaterial`] (a
//! set of long-lived random strings unique to the deployment) and cached for
//! the lifetime of the [`CredentialVault`].
//!
//! Every encryption draws a fresh random nonce. Decryption failures (tampered
//! or truncated ciphertext, material from another install, a rotated key) are
//! ordinary errors that callers treat as "no secret configured".

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::store::{ConfigStore, ConfigStoreExt, StoreError};

/// Size of a ChaCha20-Poly1305 nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Number of random strings generated for fresh key material.
const KEY_MATERIAL_PARTS: usize = 4;

/// Length of each generated key material string.
const KEY_MATERIAL_PART_LEN: usize = 64;

/// Domain separation tag mixed into the key derivation.
const KEY_DOMAIN: &[u8] = b"hideaway/credential-vault/v1";

/// Store key holding the install-wide key material.
pub const KEY_MATERIAL_KEY: &str = "vault.key_material";

/// Errors that can occur while encrypting or decrypting a secret.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Encryption failed.
    #[error("encryption failed")]
    Encryption,

    /// Ciphertext is corrupt, truncated or was tampered with.
    #[error("decryption failed: {0}")]
    Decryption(&'static str),

    /// Ciphertext was produced under a different key.
    #[error("secret was encrypted with key {found}, vault key is {expected}")]
    KeyMismatch { expected: String, found: String },

    /// Key material is empty.
    #[error("key material must contain at least one non-empty value")]
    EmptyKeyMaterial,

    /// Key material could not be loaded or saved.
    #[error("key material storage failed: {0}")]
    Store(#[from] StoreError),
}

/// Install-wide secret material the vault key is derived from.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    parts: Vec<String>,
}

impl KeyMaterial {
    /// Wrap existing material.
    pub fn from_parts(parts: Vec<String>) -> Result<Self, VaultError> {
        if parts.iter().all(|p| p.is_empty()) {
            return Err(VaultError::EmptyKeyMaterial);
        }
        Ok(Self { parts })
    }

    /// Generate fresh random material.
    pub fn generate() -> Self {
        let parts = (0..KEY_MATERIAL_PARTS)
            .map(|_| {
                OsRng
                    .sample_iter(&Alphanumeric)
                    .take(KEY_MATERIAL_PART_LEN)
                    .map(char::from)
                    .collect()
            })
            .collect();
        Self { parts }
    }

    /// Load the material from `store`, generating and persisting it on first use.
    pub fn load_or_generate(store: &dyn ConfigStore) -> Result<Self, VaultError> {
        if let Some(material) = store.get_as::<KeyMaterial>(KEY_MATERIAL_KEY)? {
            return Self::from_parts(material.parts);
        }

        let material = Self::generate();
        store.set_as(KEY_MATERIAL_KEY, &material)?;
        tracing::info!("Generated new vault key material");
        Ok(material)
    }

    fn derive_key(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        for part in &self.parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.finalize().into()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("parts", &self.parts.len())
            .finish()
    }
}

/// Serde support for byte vectors (serializes as base64).
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        base64::engine::general_purpose::STANDARD
            .encode(bytes)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: String = Deserialize::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Ciphertext of a shared secret together with its nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// Identifier of the key that produced the ciphertext.
    pub key_id: String,
    /// Random nonce used for this encryption.
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// Ciphertext including the authentication tag.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedSecret {
    /// Short stable fingerprint of this ciphertext.
    ///
    /// Changes whenever the secret is re-set, because every encryption uses a
    /// new nonce.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.nonce);
        hasher.update(&self.ciphertext);
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Symmetric encryption of shared secrets under the install key.
pub struct CredentialVault {
    cipher: ChaCha20Poly1305,
    key_id: String,
}

impl CredentialVault {
    /// Derive the vault key from `material`.
    pub fn new(material: &KeyMaterial) -> Self {
        let key = material.derive_key();
        let key_id = hex::encode(&Sha256::digest(key)[..8]);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        Self { cipher, key_id }
    }

    /// Build a vault from the material held in `store`, creating it if absent.
    pub fn from_store(store: &dyn ConfigStore) -> Result<Self, VaultError> {
        let material = KeyMaterial::load_or_generate(store)?;
        Ok(Self::new(&material))
    }

    /// Identifier of the active key.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Encrypt `plaintext` with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, VaultError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| VaultError::Encryption)?;

        Ok(EncryptedSecret {
            key_id: self.key_id.clone(),
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt a previously encrypted secret.
    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<String, VaultError> {
        if secret.key_id != self.key_id {
            return Err(VaultError::KeyMismatch {
                expected: self.key_id.clone(),
                found: secret.key_id.clone(),
            });
        }
        if secret.nonce.len() != NONCE_SIZE {
            return Err(VaultError::Decryption("invalid nonce length"));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&secret.nonce), secret.ciphertext.as_ref())
            .map_err(|_| VaultError::Decryption("authentication failed"))?;

        String::from_utf8(plaintext).map_err(|_| VaultError::Decryption("plaintext is not UTF-8"))
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}
