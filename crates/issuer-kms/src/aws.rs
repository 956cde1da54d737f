//! AWS KMS backend for secp256k1 gas keys.
//!
//! Talks to the KMS JSON API directly with SigV4-signed requests. Keys are
//! `ECC_SECG_P256K1` / `SIGN_VERIFY`; signatures come back DER encoded and
//! are converted to `r || s || v`.

use crate::keys;
use crate::{KeyId, KeyProvider, KmsError};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use issuer_types::{Did, KeyKind};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::pkcs8::DecodePublicKey;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "kms";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key: String,
    pub secret_key: Zeroizing<String>,
    pub session_token: Option<String>,
}

pub struct AwsKmsProvider {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    region: String,
    credentials: AwsCredentials,
    public_keys: RwLock<HashMap<String, Vec<u8>>>,
}

#[derive(Deserialize)]
struct AwsErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, KmsError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| KmsError::Backend(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// SigV4 signing key for one day, region and service.
fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>, KmsError> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

fn map_aws_error(status: reqwest::StatusCode, body: &str) -> KmsError {
    let parsed: Option<AwsErrorBody> = serde_json::from_str(body).ok();
    let (kind, message) = match parsed {
        Some(b) => (b.kind, b.message),
        None => (String::new(), body.to_string()),
    };
    // `__type` may carry a namespace prefix: `com.amazonaws.kms#NotFoundException`.
    let short = kind.rsplit('#').next().unwrap_or(&kind);
    match short {
        "NotFoundException" => KmsError::NotFound(message),
        "AccessDeniedException"
        | "UnrecognizedClientException"
        | "InvalidSignatureException"
        | "ExpiredTokenException" => KmsError::Unauthorized(message),
        _ => KmsError::Backend(format!("aws kms {status} {short}: {message}")),
    }
}

impl AwsKmsProvider {
    /// `endpoint` overrides the regional `https://kms.<region>.amazonaws.com`.
    pub fn new(
        region: &str,
        credentials: AwsCredentials,
        endpoint: Option<&str>,
    ) -> Result<Self, KmsError> {
        let endpoint = match endpoint {
            Some(e) => e.to_string(),
            None => format!("https://kms.{region}.amazonaws.com"),
        };
        let endpoint = reqwest::Url::parse(&endpoint)
            .map_err(|e| KmsError::Backend(format!("bad kms endpoint {endpoint}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| KmsError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            region: region.to_string(),
            credentials,
            public_keys: RwLock::new(HashMap::new()),
        })
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Builds the `Authorization` header for a POST of `payload` to `/`.
    fn authorization(
        &self,
        target: &str,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(String, String), KmsError> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut headers = vec![
            ("content-type", CONTENT_TYPE.to_string()),
            ("host", self.host()),
            ("x-amz-date", amz_date.clone()),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }
        headers.push(("x-amz-target", target.to_string()));

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{}\n", v.trim()))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| *k)
            .collect::<Vec<_>>()
            .join(";");
        let canonical_request = format!(
            "POST\n/\n\n{canonical_headers}\n{signed_headers}\n{}",
            hex::encode(Sha256::digest(payload))
        );

        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let key = signing_key(&self.credentials.secret_key, &date, &self.region, SERVICE)?;
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

        let auth = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.credentials.access_key
        );
        Ok((auth, amz_date))
    }

    async fn call<T: DeserializeOwned>(&self, operation: &str, body: Value) -> Result<T, KmsError> {
        let target = format!("TrentService.{operation}");
        let payload =
            serde_json::to_vec(&body).map_err(|e| KmsError::Backend(e.to_string()))?;
        let (auth, amz_date) = self.authorization(&target, &payload, Utc::now())?;

        let mut req = self
            .client
            .post(self.endpoint.clone())
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-date", amz_date)
            .header("x-amz-target", &target)
            .header("authorization", auth);
        if let Some(token) = &self.credentials.session_token {
            req = req.header("x-amz-security-token", token);
        }

        let resp = req
            .body(payload)
            .send()
            .await
            .map_err(|e| KmsError::Backend(format!("aws kms {operation}: {e}")))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| KmsError::Backend(format!("aws kms {operation}: {e}")))?;
        if !status.is_success() {
            return Err(map_aws_error(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| KmsError::Backend(format!("aws kms {operation} response: {e}")))
    }

    fn ensure_secp(key_kind: KeyKind) -> Result<(), KmsError> {
        match key_kind {
            KeyKind::Secp256k1 => Ok(()),
            KeyKind::BabyJubjub => Err(KmsError::WrongKeyType(
                "AWS KMS holds secp256k1 keys only".into(),
            )),
        }
    }
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>, KmsError> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| KmsError::Backend(format!("aws kms {field}: {e}")))
}

#[async_trait]
impl KeyProvider for AwsKmsProvider {
    async fn create(&self, kind: KeyKind) -> Result<KeyId, KmsError> {
        Self::ensure_secp(kind)?;
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Metadata {
            key_id: String,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct CreateKeyResponse {
            key_metadata: Metadata,
        }

        let resp: CreateKeyResponse = self
            .call(
                "CreateKey",
                json!({ "KeySpec": "ECC_SECG_P256K1", "KeyUsage": "SIGN_VERIFY" }),
            )
            .await?;
        Ok(KeyId::new(kind, resp.key_metadata.key_id))
    }

    async fn public(&self, key: &KeyId) -> Result<Vec<u8>, KmsError> {
        Self::ensure_secp(key.kind)?;
        if let Some(cached) = self.public_keys.read().await.get(&key.id) {
            return Ok(cached.clone());
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct GetPublicKeyResponse {
            public_key: String,
        }
        let resp: GetPublicKeyResponse = self
            .call("GetPublicKey", json!({ "KeyId": key.id }))
            .await?;
        let der = decode_b64("PublicKey", &resp.public_key)?;
        let public = k256::PublicKey::from_public_key_der(&der)
            .map_err(|e| KmsError::Backend(format!("aws kms public key: {e}")))?;
        let bytes = public.to_encoded_point(false).as_bytes().to_vec();

        self.public_keys
            .write()
            .await
            .insert(key.id.clone(), bytes.clone());
        Ok(bytes)
    }

    async fn sign(&self, key: &KeyId, digest: &[u8]) -> Result<Vec<u8>, KmsError> {
        Self::ensure_secp(key.kind)?;
        if digest.len() != 32 {
            return Err(KmsError::Backend(format!(
                "digest must be 32 bytes, got {}",
                digest.len()
            )));
        }
        let public = self.public(key).await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct SignResponse {
            signature: String,
        }
        let resp: SignResponse = self
            .call(
                "Sign",
                json!({
                    "KeyId": key.id,
                    "Message": base64::engine::general_purpose::STANDARD.encode(digest),
                    "MessageType": "DIGEST",
                    "SigningAlgorithm": "ECDSA_SHA_256",
                }),
            )
            .await?;
        let der = decode_b64("Signature", &resp.signature)?;
        keys::der_to_recoverable(&der, digest, &public)
    }

    async fn link(&self, key: &KeyId, did: &Did) -> Result<KeyId, KmsError> {
        Self::ensure_secp(key.kind)?;
        let _: Value = self
            .call(
                "TagResource",
                json!({
                    "KeyId": key.id,
                    "Tags": [{ "TagKey": "did", "TagValue": did.to_string() }],
                }),
            )
            .await?;
        Ok(key.clone())
    }
}
