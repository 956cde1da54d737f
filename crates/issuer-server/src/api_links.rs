//! Credential-offer links and the QR store.

use crate::api::{issuer, ApiError};
use crate::api_credentials::proof_types;
use crate::AppState;
use axum::{
    extract::{Extension, Json, Path, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use issuer_claims::{CreateLinkRequest, Link, LinkStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Deep link wallets open to fetch the message parked under `qr_id`.
pub fn universal_link(public_url: &str, qr_id: &str) -> String {
    format!(
        "iden3comm://?request_uri={}/v2/qr-store?id={qr_id}",
        public_url.trim_end_matches('/')
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkBody {
    pub credential_schema: String,
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub credential_subject: Map<String, Value>,
    #[serde(default)]
    pub max_issuance: Option<u32>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub credential_expiration: Option<DateTime<Utc>>,
    #[serde(default = "default_link_proofs")]
    pub proofs: Vec<String>,
    #[serde(default)]
    pub refresh_service: Option<Value>,
    #[serde(default)]
    pub display_method: Option<Value>,
}

fn default_link_proofs() -> Vec<String> {
    vec![crate::api_credentials::SIGNATURE_PROOF.to_string()]
}

/// A link with its status as of the request.
#[derive(Debug, Serialize)]
pub struct LinkResponse {
    #[serde(flatten)]
    pub link: Link,
    pub status: LinkStatus,
}

impl From<Link> for LinkResponse {
    fn from(link: Link) -> Self {
        let status = link.status_at(Utc::now());
        Self { link, status }
    }
}

/// Handler for `POST /v2/identities/{did}/links`.
pub async fn create_link_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(did): Path<String>,
    Json(payload): Json<CreateLinkBody>,
) -> Result<(StatusCode, Json<LinkResponse>), ApiError> {
    let identity = issuer(&state, &did).await?;
    let request = CreateLinkRequest {
        schema_url: payload.credential_schema,
        schema_type: payload.schema_type,
        credential_subject: payload.credential_subject,
        max_issuance: payload.max_issuance,
        valid_until: payload.valid_until,
        credential_expiration: payload.credential_expiration,
        proofs: proof_types(&payload.proofs)?,
        refresh_service: payload.refresh_service,
        display_method: payload.display_method,
    };
    let link = state.claims.create_link(&identity.did, request).await?;
    tracing::info!(did = %identity.did, link = %link.id, "created link");
    Ok((StatusCode::CREATED, Json(link.into())))
}

/// Handler for `GET /v2/identities/{did}/links/{id}`.
pub async fn get_link_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((did, id)): Path<(String, String)>,
) -> Result<Json<LinkResponse>, ApiError> {
    let identity = issuer(&state, &did).await?;
    Ok(Json(state.claims.get_link(&identity.did, &id).await?.into()))
}

#[derive(Debug, Deserialize)]
pub struct UpdateLinkBody {
    pub active: bool,
}

/// Handler for `PATCH /v2/identities/{did}/links/{id}`.
pub async fn update_link_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((did, id)): Path<(String, String)>,
    Json(payload): Json<UpdateLinkBody>,
) -> Result<Json<LinkResponse>, ApiError> {
    let identity = issuer(&state, &did).await?;
    let link = if payload.active {
        state.claims.activate_link(&identity.did, &id).await?
    } else {
        state.claims.deactivate_link(&identity.did, &id).await?
    };
    Ok(Json(link.into()))
}

#[derive(Debug, Deserialize)]
pub struct QrStoreQuery {
    pub id: String,
}

/// Handler for `GET /v2/qr-store`. Public: wallets follow deep links here.
pub async fn qr_store_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<QrStoreQuery>,
) -> Result<Response, ApiError> {
    let payload = state.claims.qr_payload(&query.id)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], payload).into_response())
}
