//! Key management for issuer identities.
//!
//! Two key kinds are held: Baby Jubjub keys sign claims and iden3comm
//! messages, secp256k1 keys pay for state transitions. Private material
//! never leaves a backend; callers hold a [`KeyId`] and ask for public keys
//! and signatures.
//!
//! Backends implement [`KeyProvider`]:
//!
//! | Backend | Kinds | Storage |
//! |---------|-------|---------|
//! | [`LocalProvider`] | BJJ, secp256k1 | ChaCha20-Poly1305 encrypted file, or memory |
//! | [`VaultProvider`] | BJJ, secp256k1 | HashiCorp Vault KV v2 |
//! | [`AwsKmsProvider`] | secp256k1 | AWS KMS `ECC_SECG_P256K1` keys |
//!
//! [`Kms`] routes each kind to one provider.

mod aws;
mod keys;
mod local;
mod vault;

pub use aws::{AwsCredentials, AwsKmsProvider};
pub use keys::ethereum_address;
pub use local::LocalProvider;
pub use vault::VaultProvider;

use async_trait::async_trait;
use issuer_crypto::babyjubjub::{PublicKey, Signature};
use issuer_crypto::Hash;
use issuer_types::{Did, ErrorKind, KeyKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("kms backend error: {0}")]
    Backend(String),
    #[error("kms unauthorized: {0}")]
    Unauthorized(String),
    #[error("wrong key type: {0}")]
    WrongKeyType(String),
}

impl KmsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Backend(_) => ErrorKind::BackendError,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::WrongKeyType(_) => ErrorKind::InvalidRequest,
        }
    }
}

/// Opaque handle to a key held by a backend.
///
/// The text form is `<KIND>:<backend id>`, e.g. `BJJ:3f2c...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyId {
    pub kind: KeyKind,
    pub id: String,
}

impl KeyId {
    pub fn new(kind: KeyKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for KeyId {
    type Err = KmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| KmsError::NotFound(format!("malformed key id {s}")))?;
        let kind = kind
            .parse::<KeyKind>()
            .map_err(|e| KmsError::WrongKeyType(e.to_string()))?;
        if id.is_empty() {
            return Err(KmsError::NotFound(format!("malformed key id {s}")));
        }
        Ok(Self::new(kind, id))
    }
}

impl Serialize for KeyId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A key backend. Operations never panic; a failed `sign` may be retried.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// # Errors
    ///
    /// [`KmsError::WrongKeyType`] if the backend cannot hold `kind`.
    async fn create(&self, kind: KeyKind) -> Result<KeyId, KmsError>;

    /// BJJ: 32-byte compressed point. secp256k1: 65-byte uncompressed point.
    ///
    /// # Errors
    ///
    /// [`KmsError::NotFound`] for an unknown key.
    async fn public(&self, key: &KeyId) -> Result<Vec<u8>, KmsError>;

    /// BJJ digests are 32-byte little-endian field elements and yield a
    /// 64-byte compressed signature. secp256k1 digests are 32-byte hashes
    /// and yield `r || s || v`.
    ///
    /// # Errors
    ///
    /// [`KmsError::NotFound`] for an unknown key, [`KmsError::Backend`] on
    /// transient failures.
    async fn sign(&self, key: &KeyId, digest: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Binds a key to the identity `did` and returns its new handle.
    ///
    /// # Errors
    ///
    /// [`KmsError::NotFound`] for an unknown key.
    async fn link(&self, key: &KeyId, did: &Did) -> Result<KeyId, KmsError>;
}

/// Routes each key kind to its provider.
#[derive(Clone)]
pub struct Kms {
    bjj: Arc<dyn KeyProvider>,
    eth: Arc<dyn KeyProvider>,
}

impl Kms {
    pub fn new(bjj: Arc<dyn KeyProvider>, eth: Arc<dyn KeyProvider>) -> Self {
        Self { bjj, eth }
    }

    /// Both kinds held by one in-memory local provider.
    pub fn in_memory() -> Self {
        let local: Arc<dyn KeyProvider> = Arc::new(LocalProvider::in_memory());
        Self::new(local.clone(), local)
    }

    fn provider(&self, kind: KeyKind) -> &Arc<dyn KeyProvider> {
        match kind {
            KeyKind::BabyJubjub => &self.bjj,
            KeyKind::Secp256k1 => &self.eth,
        }
    }

    /// Decoded Baby Jubjub public key.
    ///
    /// # Errors
    ///
    /// Fails for unknown keys, non-BJJ keys and undecodable points.
    pub async fn bjj_public(&self, key: &KeyId) -> Result<PublicKey, KmsError> {
        if key.kind != KeyKind::BabyJubjub {
            return Err(KmsError::WrongKeyType(format!("{key} is not a BJJ key")));
        }
        let bytes = self.public(key).await?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KmsError::Backend(format!("BJJ public key of {} bytes", bytes.len())))?;
        PublicKey::decompress(&arr).map_err(|e| KmsError::Backend(e.to_string()))
    }

    /// Signs a field element with a Baby Jubjub key.
    ///
    /// # Errors
    ///
    /// See [`KeyProvider::sign`].
    pub async fn sign_bjj(&self, key: &KeyId, msg: &Hash) -> Result<Signature, KmsError> {
        if key.kind != KeyKind::BabyJubjub {
            return Err(KmsError::WrongKeyType(format!("{key} is not a BJJ key")));
        }
        let bytes = self.sign(key, msg.as_le_bytes()).await?;
        Signature::decompress(&bytes).map_err(|e| KmsError::Backend(e.to_string()))
    }

    /// Ethereum address of a secp256k1 key.
    ///
    /// # Errors
    ///
    /// See [`KeyProvider::public`].
    pub async fn eth_address(&self, key: &KeyId) -> Result<[u8; 20], KmsError> {
        if key.kind != KeyKind::Secp256k1 {
            return Err(KmsError::WrongKeyType(format!("{key} is not an ETH key")));
        }
        ethereum_address(&self.public(key).await?)
    }
}

#[async_trait]
impl KeyProvider for Kms {
    async fn create(&self, kind: KeyKind) -> Result<KeyId, KmsError> {
        let key = self.provider(kind).create(kind).await?;
        tracing::debug!(key = %key, "created key");
        Ok(key)
    }

    async fn public(&self, key: &KeyId) -> Result<Vec<u8>, KmsError> {
        self.provider(key.kind).public(key).await
    }

    async fn sign(&self, key: &KeyId, digest: &[u8]) -> Result<Vec<u8>, KmsError> {
        tracing::debug!(key = %key, "signing digest");
        self.provider(key.kind).sign(key, digest).await
    }

    async fn link(&self, key: &KeyId, did: &Did) -> Result<KeyId, KmsError> {
        let linked = self.provider(key.kind).link(key, did).await?;
        tracing::debug!(key = %key, linked = %linked, did = %did, "linked key");
        Ok(linked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_text_form_roundtrips() {
        let id = KeyId::new(KeyKind::BabyJubjub, "did:polygonid:polygon:amoy:x/abc");
        let text = id.to_string();
        assert_eq!(text, "BJJ:did:polygonid:polygon:amoy:x/abc");
        assert_eq!(text.parse::<KeyId>().expect("parse"), id);

        assert!("nope".parse::<KeyId>().is_err());
        assert!(matches!(
            "RSA:abc".parse::<KeyId>(),
            Err(KmsError::WrongKeyType(_))
        ));
        assert!("ETH:".parse::<KeyId>().is_err());
    }

    #[tokio::test]
    async fn router_uses_kind_specific_helpers() {
        let kms = Kms::in_memory();
        let bjj = kms.create(KeyKind::BabyJubjub).await.expect("bjj");
        let eth = kms.create(KeyKind::Secp256k1).await.expect("eth");

        let pk = kms.bjj_public(&bjj).await.expect("bjj public");
        let msg = Hash::from_u64(99);
        let sig = kms.sign_bjj(&bjj, &msg).await.expect("sign");
        pk.verify_poseidon(&msg.to_fr(), &sig).expect("verifies");

        assert_eq!(kms.eth_address(&eth).await.expect("address").len(), 20);
        assert!(matches!(
            kms.bjj_public(&eth).await,
            Err(KmsError::WrongKeyType(_))
        ));
        assert!(matches!(
            kms.eth_address(&bjj).await,
            Err(KmsError::WrongKeyType(_))
        ));
    }
}
