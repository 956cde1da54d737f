//! DID resolution for JWS verification.

use crate::PackerError;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use issuer_crypto::babyjubjub::{Point, PublicKey};
use issuer_crypto::Hash;
use issuer_identity::{IdentityError, IdentityRegistry};
use issuer_types::Did;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Fragment of the verification method holding the BJJ auth key.
pub const BJJ_AUTH_FRAGMENT: &str = "bjj-auth";

const VERIFICATION_METHOD_TYPE: &str = "JsonWebKey2020";

/// `x` and `y` are base64url big-endian field elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: String,
    pub controller: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_jwk: Option<Jwk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    #[serde(rename = "@context", default)]
    pub context: Vec<String>,
    pub id: String,
    #[serde(default)]
    pub verification_method: Vec<VerificationMethod>,
}

pub fn bjj_kid(did: &Did) -> String {
    format!("{did}#{BJJ_AUTH_FRAGMENT}")
}

fn encode_coordinate(fr: &issuer_crypto::Fr) -> String {
    URL_SAFE_NO_PAD.encode(Hash::from_fr(fr).to_be_bytes())
}

fn decode_coordinate(s: &str) -> Result<issuer_crypto::Fr, PackerError> {
    let bytes: [u8; 32] = URL_SAFE_NO_PAD
        .decode(s)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| PackerError::Malformed("jwk coordinate".into()))?;
    Ok(Hash::from_be_bytes(bytes)?.to_fr())
}

impl DidDocument {
    /// Document listing `key` as the `#bjj-auth` method of `did`.
    pub fn with_bjj_key(did: &Did, key: &PublicKey) -> Self {
        Self {
            context: vec![
                "https://www.w3.org/ns/did/v1".to_string(),
                "https://w3id.org/security/suites/jws-2020/v1".to_string(),
            ],
            id: did.to_string(),
            verification_method: vec![VerificationMethod {
                id: bjj_kid(did),
                method_type: VERIFICATION_METHOD_TYPE.to_string(),
                controller: did.to_string(),
                public_key_jwk: Some(Jwk {
                    kty: "EC".to_string(),
                    crv: "BJJ".to_string(),
                    x: encode_coordinate(&key.point().x),
                    y: encode_coordinate(&key.point().y),
                }),
            }],
        }
    }

    /// The BJJ key of method `kid`. A bare `#fragment` matches too.
    ///
    /// # Errors
    ///
    /// [`PackerError::UnknownKey`] when no such method carries a BJJ JWK,
    /// [`PackerError::InvalidSignature`] when the point is off the curve.
    pub fn bjj_key(&self, kid: &str) -> Result<PublicKey, PackerError> {
        let fragment = kid.rsplit_once('#').map(|(_, f)| f);
        let jwk = self
            .verification_method
            .iter()
            .find(|m| m.id == kid || (fragment.is_some() && m.id.rsplit_once('#').map(|(_, f)| f) == fragment))
            .and_then(|m| m.public_key_jwk.as_ref())
            .filter(|jwk| jwk.crv == "BJJ")
            .ok_or_else(|| PackerError::UnknownKey {
                did: self.id.clone(),
                kid: kid.to_string(),
            })?;
        let point = Point {
            x: decode_coordinate(&jwk.x)?,
            y: decode_coordinate(&jwk.y)?,
        };
        if !point.is_on_curve() || !point.in_subgroup() {
            return Err(PackerError::InvalidSignature);
        }
        Ok(PublicKey(point))
    }
}

/// Looks up DID documents.
#[async_trait]
pub trait DidResolver: Send + Sync {
    /// # Errors
    ///
    /// [`PackerError::UnresolvedDid`] for unknown DIDs, transport failures.
    async fn resolve(&self, did: &Did) -> Result<DidDocument, PackerError>;
}

/// Resolves identities this node manages.
pub struct LocalDidResolver {
    registry: IdentityRegistry,
}

impl LocalDidResolver {
    pub fn new(registry: IdentityRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DidResolver for LocalDidResolver {
    async fn resolve(&self, did: &Did) -> Result<DidDocument, PackerError> {
        let identity = match self.registry.get_by_did(did).await {
            Ok(identity) => identity,
            Err(IdentityError::NotFound(_)) => return Err(PackerError::UnresolvedDid(did.to_string())),
            Err(e) => return Err(e.into()),
        };
        let key = self.registry.kms().bjj_public(&identity.auth_key).await?;
        Ok(DidDocument::with_bjj_key(did, &key))
    }
}

/// A universal resolver: `GET {base}/1.0/identifiers/{did}`.
pub struct HttpDidResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDidResolver {
    /// # Errors
    ///
    /// [`PackerError::Resolver`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PackerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DidResolver for HttpDidResolver {
    async fn resolve(&self, did: &Did) -> Result<DidDocument, PackerError> {
        let resp = self
            .client
            .get(format!("{}/1.0/identifiers/{}", self.base_url, did))
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PackerError::UnresolvedDid(did.to_string()));
        }
        if !status.is_success() {
            return Err(PackerError::Resolver(format!("resolver returned {status}")));
        }
        let mut body: Value = resp.json().await?;
        // Universal resolvers wrap the document in resolution metadata.
        let document = match body.get_mut("didDocument") {
            Some(doc) => doc.take(),
            None => body,
        };
        serde_json::from_value(document).map_err(|e| PackerError::Resolver(format!("did document: {e}")))
    }
}
