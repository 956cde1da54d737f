//! W3C verifiable credential rendering.

use crate::store::Claim;
use chrono::{DateTime, SecondsFormat};
use issuer_identity::proofs::{MtpProof, SignatureProof};
use issuer_revocation::CredentialStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const W3C_CONTEXT: &str = "https://www.w3.org/2018/credentials/v1";
pub const IDEN3_PROOFS_CONTEXT: &str = "https://schema.iden3.io/core/jsonld/iden3proofs.jsonld";
pub const JSON_SCHEMA_TYPE: &str = "JsonSchema2023";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSchema {
    pub id: String,
    #[serde(rename = "type")]
    pub schema_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialProof {
    Signature(SignatureProof),
    Mtp(MtpProof),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct W3CCredential {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    #[serde(rename = "type")]
    pub types: Vec<String>,
    pub issuer: String,
    pub issuance_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<String>,
    pub credential_subject: Map<String, Value>,
    pub credential_status: CredentialStatus,
    pub credential_schema: CredentialSchema,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proof: Vec<CredentialProof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_service: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_method: Option<Value>,
}

impl From<&Claim> for W3CCredential {
    fn from(claim: &Claim) -> Self {
        let mut subject = claim.credential_subject.clone();
        if let Some(did) = &claim.subject {
            subject.insert("id".into(), Value::String(did.to_string()));
        }
        subject.insert("type".into(), Value::String(claim.schema_type.clone()));

        let mut proof = Vec::new();
        if let Some(p) = &claim.signature_proof {
            proof.push(CredentialProof::Signature(p.clone()));
        }
        if let Some(p) = &claim.mtp_proof {
            proof.push(CredentialProof::Mtp(p.clone()));
        }

        Self {
            context: vec![
                W3C_CONTEXT.to_string(),
                IDEN3_PROOFS_CONTEXT.to_string(),
                claim.ld_context.clone(),
            ],
            id: format!("urn:uuid:{}", claim.id),
            types: vec!["VerifiableCredential".to_string(), claim.schema_type.clone()],
            issuer: claim.issuer.to_string(),
            issuance_date: claim.created_at.clone(),
            expiration_date: claim
                .expiration
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
                .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true)),
            credential_subject: subject,
            credential_status: claim.credential_status.clone(),
            credential_schema: CredentialSchema {
                id: claim.schema_url.clone(),
                schema_type: JSON_SCHEMA_TYPE.to_string(),
            },
            proof,
            refresh_service: claim.refresh_service.clone(),
            display_method: claim.display_method.clone(),
        }
    }
}
