//! Software keystore kept in memory and optionally mirrored to an
//! encrypted file.
//!
//! File layout: `nonce(12) || ChaCha20-Poly1305(json)`, with the AEAD key
//! derived from the operator passphrase through HKDF-SHA256. The whole
//! keystore is rewritten on every `create` and `link`.

use crate::keys;
use crate::{KeyId, KeyProvider, KmsError};
use async_trait::async_trait;
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit};
use hkdf::Hkdf;
use issuer_types::{Did, KeyKind};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use zeroize::{Zeroize, Zeroizing};

const NONCE_LEN: usize = 12;
const HKDF_SALT: &[u8] = b"issuer-kms-local";
const HKDF_INFO: &[u8] = b"issuer-kms-keystore-v1";

#[derive(Clone, Serialize, Deserialize)]
struct StoredKey {
    kind: KeyKind,
    secret: String,
    #[serde(default)]
    did: Option<String>,
}

impl Drop for StoredKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl StoredKey {
    fn secret(&self) -> Result<Zeroizing<[u8; 32]>, KmsError> {
        let bytes = Zeroizing::new(
            hex::decode(&self.secret).map_err(|e| KmsError::Backend(e.to_string()))?,
        );
        let mut out = Zeroizing::new([0u8; 32]);
        if bytes.len() != 32 {
            return Err(KmsError::Backend("stored secret is not 32 bytes".into()));
        }
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

pub struct LocalProvider {
    path: Option<PathBuf>,
    cipher_key: Option<Zeroizing<[u8; 32]>>,
    keys: RwLock<HashMap<String, StoredKey>>,
}

fn derive_key(passphrase: &str) -> Result<Zeroizing<[u8; 32]>, KmsError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), passphrase.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(HKDF_INFO, key.as_mut())
        .map_err(|e| KmsError::Backend(format!("hkdf expand failed: {e}")))?;
    Ok(key)
}

fn cipher(key: &[u8; 32]) -> Result<ChaCha20Poly1305, KmsError> {
    ChaCha20Poly1305::new_from_slice(key).map_err(|e| KmsError::Backend(e.to_string()))
}

impl LocalProvider {
    /// A keystore that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            cipher_key: None,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Opens (or starts) the encrypted keystore at `path`.
    ///
    /// # Errors
    ///
    /// [`KmsError::Unauthorized`] for an empty or wrong passphrase,
    /// [`KmsError::Backend`] when the file cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>, passphrase: &str) -> Result<Self, KmsError> {
        if passphrase.is_empty() {
            return Err(KmsError::Unauthorized("empty keystore passphrase".into()));
        }
        let path = path.as_ref().to_path_buf();
        let cipher_key = derive_key(passphrase)?;

        let keys = match tokio::fs::read(&path).await {
            Ok(data) => decrypt_store(&cipher_key, &data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(KmsError::Backend(format!("read keystore: {e}"))),
        };
        tracing::info!(path = %path.display(), keys = keys.len(), "opened local keystore");

        Ok(Self {
            path: Some(path),
            cipher_key: Some(cipher_key),
            keys: RwLock::new(keys),
        })
    }

    async fn persist(&self, keys: &HashMap<String, StoredKey>) -> Result<(), KmsError> {
        let (Some(path), Some(cipher_key)) = (&self.path, &self.cipher_key) else {
            return Ok(());
        };
        let plain = Zeroizing::new(
            serde_json::to_vec(keys).map_err(|e| KmsError::Backend(e.to_string()))?,
        );
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = chacha20poly1305::Nonce::from(nonce_bytes);
        let sealed = cipher(cipher_key)?
            .encrypt(&nonce, plain.as_slice())
            .map_err(|e| KmsError::Backend(format!("encrypt keystore: {e}")))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&sealed);

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &out)
            .await
            .map_err(|e| KmsError::Backend(format!("write keystore: {e}")))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| KmsError::Backend(format!("replace keystore: {e}")))?;
        Ok(())
    }

    async fn stored(&self, key: &KeyId) -> Result<StoredKey, KmsError> {
        let keys = self.keys.read().await;
        let stored = keys
            .get(&key.id)
            .ok_or_else(|| KmsError::NotFound(key.to_string()))?;
        if stored.kind != key.kind {
            return Err(KmsError::WrongKeyType(format!(
                "{key} holds a {} key",
                stored.kind
            )));
        }
        Ok(stored.clone())
    }
}

fn decrypt_store(
    cipher_key: &[u8; 32],
    data: &[u8],
) -> Result<HashMap<String, StoredKey>, KmsError> {
    if data.len() < NONCE_LEN + 16 {
        return Err(KmsError::Backend("keystore file truncated".into()));
    }
    let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
    let nonce = chacha20poly1305::Nonce::from_slice(nonce_bytes);
    let plain = Zeroizing::new(
        cipher(cipher_key)?
            .decrypt(nonce, sealed)
            .map_err(|_| KmsError::Unauthorized("keystore passphrase rejected".into()))?,
    );
    serde_json::from_slice(&plain).map_err(|e| KmsError::Backend(format!("parse keystore: {e}")))
}

#[async_trait]
impl KeyProvider for LocalProvider {
    async fn create(&self, kind: KeyKind) -> Result<KeyId, KmsError> {
        let secret = keys::generate_secret(kind);
        let id = uuid::Uuid::new_v4().to_string();
        let mut map = self.keys.write().await;
        map.insert(
            id.clone(),
            StoredKey {
                kind,
                secret: hex::encode(&*secret),
                did: None,
            },
        );
        self.persist(&map).await?;
        Ok(KeyId::new(kind, id))
    }

    async fn public(&self, key: &KeyId) -> Result<Vec<u8>, KmsError> {
        let stored = self.stored(key).await?;
        keys::public_key(key.kind, &*stored.secret()?)
    }

    async fn sign(&self, key: &KeyId, digest: &[u8]) -> Result<Vec<u8>, KmsError> {
        let stored = self.stored(key).await?;
        keys::sign(key.kind, &*stored.secret()?, digest)
    }

    async fn link(&self, key: &KeyId, did: &Did) -> Result<KeyId, KmsError> {
        let mut map = self.keys.write().await;
        let mut stored = map
            .remove(&key.id)
            .ok_or_else(|| KmsError::NotFound(key.to_string()))?;
        let did = did.to_string();
        let suffix = key.id.rsplit('/').next().unwrap_or(&key.id).to_string();
        let new_id = format!("{did}/{suffix}");
        stored.did = Some(did);
        map.insert(new_id.clone(), stored);
        self.persist(&map).await?;
        Ok(KeyId::new(key.kind, new_id))
    }
}
