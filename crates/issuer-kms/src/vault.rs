//! HashiCorp Vault KV v2 backend.
//!
//! Private keys are stored as `{kind, private_key}` secrets under
//! `<mount>/data/<path>`. Signing fetches the secret and signs locally.

use crate::keys;
use crate::{KeyId, KeyProvider, KmsError};
use async_trait::async_trait;
use issuer_types::{Did, KeyKind};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use zeroize::Zeroizing;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const KEYS_PREFIX: &str = "keys";

pub struct VaultProvider {
    client: reqwest::Client,
    addr: String,
    mount: String,
    token: Zeroizing<String>,
}

#[derive(Serialize, Deserialize)]
struct VaultSecret {
    kind: KeyKind,
    private_key: String,
}

#[derive(Serialize)]
struct WriteRequest<'a> {
    data: &'a VaultSecret,
}

#[derive(Deserialize)]
struct ReadResponse {
    data: ReadData,
}

#[derive(Deserialize)]
struct ReadData {
    data: VaultSecret,
}

fn map_status(status: StatusCode, context: &str) -> KmsError {
    match status {
        StatusCode::NOT_FOUND => KmsError::NotFound(context.to_string()),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            KmsError::Unauthorized(format!("vault rejected token for {context}"))
        }
        other => KmsError::Backend(format!("vault returned {other} for {context}")),
    }
}

fn transport(e: reqwest::Error) -> KmsError {
    KmsError::Backend(format!("vault request failed: {e}"))
}

impl VaultProvider {
    /// `addr` is the Vault base URL, `mount` the KV v2 mount name.
    pub fn new(addr: &str, mount: &str, token: &str) -> Result<Self, KmsError> {
        if token.is_empty() {
            return Err(KmsError::Unauthorized("empty vault token".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(transport)?;
        Ok(Self {
            client,
            addr: addr.trim_end_matches('/').to_string(),
            mount: mount.trim_matches('/').to_string(),
            token: Zeroizing::new(token.to_string()),
        })
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/v1/{}/data/{}", self.addr, self.mount, path)
    }

    fn metadata_url(&self, path: &str) -> String {
        format!("{}/v1/{}/metadata/{}", self.addr, self.mount, path)
    }

    async fn write(&self, path: &str, secret: &VaultSecret) -> Result<(), KmsError> {
        let resp = self
            .client
            .post(self.data_url(path))
            .header("X-Vault-Token", self.token.as_str())
            .json(&WriteRequest { data: secret })
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(map_status(resp.status(), path));
        }
        Ok(())
    }

    async fn read(&self, key: &KeyId) -> Result<VaultSecret, KmsError> {
        let resp = self
            .client
            .get(self.data_url(&key.id))
            .header("X-Vault-Token", self.token.as_str())
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(map_status(resp.status(), &key.to_string()));
        }
        let body: ReadResponse = resp.json().await.map_err(transport)?;
        let secret = body.data.data;
        if secret.kind != key.kind {
            return Err(KmsError::WrongKeyType(format!(
                "{key} holds a {} key",
                secret.kind
            )));
        }
        Ok(secret)
    }

    async fn delete(&self, path: &str) -> Result<(), KmsError> {
        let resp = self
            .client
            .delete(self.metadata_url(path))
            .header("X-Vault-Token", self.token.as_str())
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(map_status(resp.status(), path));
        }
        Ok(())
    }

    async fn secret(&self, key: &KeyId) -> Result<Zeroizing<[u8; 32]>, KmsError> {
        let stored = self.read(key).await?;
        let bytes = Zeroizing::new(
            hex::decode(&stored.private_key).map_err(|e| KmsError::Backend(e.to_string()))?,
        );
        if bytes.len() != 32 {
            return Err(KmsError::Backend("vault secret is not 32 bytes".into()));
        }
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

#[async_trait]
impl KeyProvider for VaultProvider {
    async fn create(&self, kind: KeyKind) -> Result<KeyId, KmsError> {
        let secret = keys::generate_secret(kind);
        let path = format!("{KEYS_PREFIX}/{}", uuid::Uuid::new_v4());
        let stored = VaultSecret {
            kind,
            private_key: hex::encode(&*secret),
        };
        self.write(&path, &stored).await?;
        Ok(KeyId::new(kind, path))
    }

    async fn public(&self, key: &KeyId) -> Result<Vec<u8>, KmsError> {
        keys::public_key(key.kind, &*self.secret(key).await?)
    }

    async fn sign(&self, key: &KeyId, digest: &[u8]) -> Result<Vec<u8>, KmsError> {
        keys::sign(key.kind, &*self.secret(key).await?, digest)
    }

    async fn link(&self, key: &KeyId, did: &Did) -> Result<KeyId, KmsError> {
        let stored = self.read(key).await?;
        let suffix = key.id.rsplit('/').next().unwrap_or(&key.id);
        let new_path = format!("{did}/{suffix}");
        self.write(&new_path, &stored).await?;
        self.delete(&key.id).await?;
        Ok(KeyId::new(key.kind, new_path))
    }
}

impl Drop for VaultSecret {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.private_key);
    }
}
