//! Credential handling: AES-256-GCM at rest, plaintext only in this
//! crate, never logged.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use market_store::TimeSeriesStore;

use crate::adapter::ExchangeError;
use crate::Result;

const NONCE_LEN: usize = 12;

/// Opaque reference to a stored exchange credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CredentialHandle {
    pub id: i64,
}

impl CredentialHandle {
    pub fn new(id: i64) -> Self {
        Self { id }
    }
}

/// Decrypted key material. The Debug impl redacts everything.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***")
            .field("api_secret", &"***")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .finish()
    }
}

/// AES-256-GCM with a random nonce prepended to each ciphertext.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn from_key(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// 64 hex chars -> 32 byte key.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| ExchangeError::Fatal(format!("bad cipher key: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ExchangeError::Fatal("cipher key must be 32 bytes".into()))?;
        Ok(Self::from_key(&key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| ExchangeError::Fatal("credential encryption failed".into()))?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<String> {
        if blob.len() <= NONCE_LEN {
            return Err(ExchangeError::Auth("credential blob too short".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ExchangeError::Auth("credential decryption failed".into()))?;
        String::from_utf8(plaintext).map_err(|_| ExchangeError::Auth("credential not utf-8".into()))
    }
}

/// Resolves a handle to decrypted key material.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn resolve(&self, handle: &CredentialHandle) -> Result<Credentials>;
}

/// Production vault: encrypted rows in the store, decrypted here.
pub struct StoreVault {
    store: TimeSeriesStore,
    cipher: SecretCipher,
}

impl StoreVault {
    pub fn new(store: TimeSeriesStore, cipher: SecretCipher) -> Self {
        Self { store, cipher }
    }
}

#[async_trait]
impl CredentialVault for StoreVault {
    async fn resolve(&self, handle: &CredentialHandle) -> Result<Credentials> {
        let row = self
            .store
            .credential(handle.id)
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?
            .ok_or_else(|| ExchangeError::Auth(format!("unknown credential {}", handle.id)))?;
        if !row.active {
            return Err(ExchangeError::Auth(format!("credential {} revoked", handle.id)));
        }
        Ok(Credentials {
            api_key: self.cipher.decrypt(&row.api_key)?,
            api_secret: self.cipher.decrypt(&row.api_secret)?,
            passphrase: row.passphrase.as_deref().map(|p| self.cipher.decrypt(p)).transpose()?,
        })
    }
}

/// Test vault with fixed plaintext credentials.
#[derive(Default)]
pub struct StaticVault {
    entries: dashmap::DashMap<i64, Credentials>,
}

impl StaticVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: i64, credentials: Credentials) {
        self.entries.insert(id, credentials);
    }
}

#[async_trait]
impl CredentialVault for StaticVault {
    async fn resolve(&self, handle: &CredentialHandle) -> Result<Credentials> {
        self.entries
            .get(&handle.id)
            .map(|c| c.clone())
            .ok_or_else(|| ExchangeError::Auth(format!("unknown credential {}", handle.id)))
    }
}
