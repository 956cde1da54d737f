//! Credential endpoints: issuance, listing, offers and revocation.

use crate::api::{issuer, ApiError};
use crate::AppState;
use axum::{
    extract::{Extension, Json, Path, Query},
    http::StatusCode,
};
use issuer_claims::store::parse_sort;
use issuer_claims::{Claim, ClaimFilter, CreateClaimRequest, Offer, OfferType, W3CCredential};
use issuer_state::RevocationStatus;
use issuer_types::{ProofTypes, RevocationStatusMode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const SIGNATURE_PROOF: &str = "BJJSignature2021";
pub const MTP_PROOF: &str = "Iden3SparseMerkleTreeProof";

/// Request body for `POST /v2/identities/{did}/credentials`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCredentialRequest {
    pub credential_schema: String,
    #[serde(rename = "type")]
    pub schema_type: String,
    pub credential_subject: Map<String, Value>,
    /// Unix seconds.
    #[serde(default)]
    pub expiration: Option<i64>,
    #[serde(default)]
    pub rev_nonce: Option<u64>,
    #[serde(default = "default_proofs")]
    pub proofs: Vec<String>,
    /// A `credentialStatus.type`; the server default when absent.
    #[serde(default)]
    pub credential_status_type: Option<String>,
    #[serde(default)]
    pub refresh_service: Option<Value>,
    #[serde(default)]
    pub display_method: Option<Value>,
}

fn default_proofs() -> Vec<String> {
    vec![SIGNATURE_PROOF.to_string()]
}

pub(crate) fn proof_types(names: &[String]) -> Result<ProofTypes, ApiError> {
    let mut proofs = ProofTypes::default();
    for name in names {
        match name.as_str() {
            SIGNATURE_PROOF => proofs.signature = true,
            MTP_PROOF => proofs.mtp = true,
            other => return Err(ApiError::bad_request(format!("unknown proof type {other}"))),
        }
    }
    Ok(proofs)
}

pub(crate) fn proof_names(proofs: ProofTypes) -> Vec<&'static str> {
    let mut names = Vec::new();
    if proofs.signature {
        names.push(SIGNATURE_PROOF);
    }
    if proofs.mtp {
        names.push(MTP_PROOF);
    }
    names
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateCredentialResponse {
    pub id: String,
}

/// A credential as the API shows it: the W3C document plus bookkeeping.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialResponse {
    pub id: String,
    pub revoked: bool,
    pub expired: bool,
    pub schema_type: String,
    pub proof_types: Vec<&'static str>,
    pub created_at: String,
    pub vc: W3CCredential,
}

impl CredentialResponse {
    fn new(claim: &Claim, now: i64) -> Self {
        let proofs = ProofTypes {
            signature: claim.signature_proof.is_some(),
            mtp: claim.mtp,
        };
        Self {
            id: claim.id.clone(),
            revoked: claim.revoked,
            expired: claim.is_expired(now),
            schema_type: claim.schema_type.clone(),
            proof_types: proof_names(proofs),
            created_at: claim.created_at.clone(),
            vc: W3CCredential::from(claim),
        }
    }
}

/// Handler for `POST /v2/identities/{did}/credentials`.
pub async fn create_credential_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(did): Path<String>,
    Json(payload): Json<CreateCredentialRequest>,
) -> Result<(StatusCode, Json<CreateCredentialResponse>), ApiError> {
    let identity = issuer(&state, &did).await?;
    let status_mode = payload
        .credential_status_type
        .as_deref()
        .map(str::parse::<RevocationStatusMode>)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let request = CreateClaimRequest {
        schema_url: payload.credential_schema,
        schema_type: payload.schema_type,
        credential_subject: payload.credential_subject,
        subject: None,
        expiration: payload.expiration,
        revocation_nonce: payload.rev_nonce,
        proofs: proof_types(&payload.proofs)?,
        status_mode,
        refresh_service: payload.refresh_service,
        display_method: payload.display_method,
    };
    let claim = state.claims.save(&identity.did, request).await?;
    Ok((StatusCode::CREATED, Json(CreateCredentialResponse { id: claim.id })))
}

/// Query of `GET /v2/identities/{did}/credentials`.
#[derive(Debug, Default, Deserialize)]
pub struct ListCredentialsQuery {
    /// Subject DID.
    pub did: Option<String>,
    pub query: Option<String>,
    pub status: Option<String>,
    pub page: Option<u32>,
    pub max_results: Option<u32>,
    pub sort: Option<String>,
}

impl ListCredentialsQuery {
    fn into_filter(self) -> Result<ClaimFilter, ApiError> {
        let defaults = ClaimFilter::default();
        Ok(ClaimFilter {
            subject: self.did.filter(|d| !d.is_empty()),
            query: self.query.filter(|q| !q.trim().is_empty()),
            status: self.status.as_deref().unwrap_or_default().parse()?,
            page: self.page.unwrap_or(defaults.page),
            max_results: self.max_results.unwrap_or(defaults.max_results),
            sort: parse_sort(self.sort.as_deref().unwrap_or_default())?,
        })
    }
}

/// Handler for `GET /v2/identities/{did}/credentials`.
///
/// The filter is validated before the identity is even looked up.
pub async fn list_credentials_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(did): Path<String>,
    Query(query): Query<ListCredentialsQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = query.into_filter()?;
    filter.validate()?;
    let identity = issuer(&state, &did).await?;
    let (page, max_results) = (filter.page, filter.max_results);
    let listed = state.claims.list(&identity.did, filter).await?;
    let now = chrono::Utc::now().timestamp();
    let items: Vec<CredentialResponse> = listed
        .claims
        .iter()
        .map(|c| CredentialResponse::new(c, now))
        .collect();
    Ok(Json(json!({
        "items": items,
        "meta": { "total": listed.total, "page": page, "maxResults": max_results },
    })))
}

/// Handler for `GET /v2/identities/{did}/credentials/{id}`.
pub async fn get_credential_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((did, id)): Path<(String, String)>,
) -> Result<Json<CredentialResponse>, ApiError> {
    let identity = issuer(&state, &did).await?;
    let claim = state.claims.get(&identity.did, &id).await?;
    Ok(Json(CredentialResponse::new(
        &claim,
        chrono::Utc::now().timestamp(),
    )))
}

/// Handler for `DELETE /v2/identities/{did}/credentials/{id}`.
pub async fn delete_credential_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((did, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let identity = issuer(&state, &did).await?;
    state.claims.delete(&identity.did, &id).await?;
    Ok(Json(json!({ "message": "credential deleted" })))
}

#[derive(Debug, Default, Deserialize)]
pub struct OfferQuery {
    #[serde(rename = "type")]
    pub offer_type: Option<String>,
}

/// Handler for `GET /v2/identities/{did}/credentials/{id}/offer`.
pub async fn credential_offer_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((did, id)): Path<(String, String)>,
    Query(query): Query<OfferQuery>,
) -> Result<Json<Value>, ApiError> {
    let kind: OfferType = query.offer_type.as_deref().unwrap_or_default().parse()?;
    let identity = issuer(&state, &did).await?;
    match state.claims.offer(&identity.did, &id, kind).await? {
        Offer::Raw(message) => Ok(Json(message)),
        Offer::Link { url, qr_id } => Ok(Json(json!({
            "universalLink": url,
            "qrID": qr_id,
        }))),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RevokeQuery {
    pub reason: Option<String>,
}

/// Handler for `POST /v2/identities/{did}/credentials/revoke/{nonce}`.
///
/// The revocation is recorded now and becomes visible in status answers
/// once the next state is published.
pub async fn revoke_credential_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((did, nonce)): Path<(String, u64)>,
    Query(query): Query<RevokeQuery>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let identity = issuer(&state, &did).await?;
    state.claims.revoke(&identity.did, nonce, query.reason).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "credential revocation request sent" })),
    ))
}

/// Handler for `GET /v2/identities/{did}/credentials/revocation/status/{nonce}`.
pub async fn revocation_status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((did, nonce)): Path<(String, u64)>,
) -> Result<Json<RevocationStatus>, ApiError> {
    let identity = issuer(&state, &did).await?;
    Ok(Json(
        state.engine.revocation_status(&identity.did, nonce).await?,
    ))
}
