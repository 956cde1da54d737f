//! Wallet authentication for link redemption.
//!
//! Scanning a link's QR code opens a session holding an authorization
//! request. The wallet answers on the callback with a zkp-packed
//! authorization response; the proven sender receives a credential from
//! the link and gets its offer back.

use crate::api::{issuer, ApiError};
use crate::api_links::{universal_link, LinkResponse};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Extension, Json, Path, Query},
    http::StatusCode,
};
use issuer_claims::{credential_offer, LinkStatus};
use issuer_iden3comm::{AuthorizationRequestBody, BasicMessage, MediaType};
use issuer_types::{message_type, Did, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// An authorization request waiting for its wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub issuer: Did,
    pub link_id: String,
    /// Thread of the authorization request; the response must continue it.
    pub thread_id: String,
    /// Set once the session redeemed the link.
    pub credential_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkQrResponse {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub universal_link: String,
    pub link_detail: Value,
}

/// Handler for `POST /v2/identities/{did}/links/{id}/qrcode`.
pub async fn link_qr_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((did, id)): Path<(String, String)>,
) -> Result<Json<LinkQrResponse>, ApiError> {
    let identity = issuer(&state, &did).await?;
    let link: LinkResponse = state.claims.get_link(&identity.did, &id).await?.into();
    if link.status != LinkStatus::Active {
        return Err(ApiError::new(
            ErrorKind::Conflict,
            format!("link {id} is {}", link.status),
        ));
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let body = AuthorizationRequestBody {
        callback_url: format!(
            "{}/v2/authentication/callback?sessionID={session_id}",
            state.public_url
        ),
        reason: "authentication".to_string(),
        message: None,
        scope: Vec::new(),
    };
    let body = serde_json::to_value(body)
        .map_err(|e| ApiError::internal(format!("authorization request: {e}")))?;
    let request = BasicMessage::new(message_type::AUTHORIZATION_REQUEST, &identity.did, None, body);
    let payload = serde_json::to_string(&request)
        .map_err(|e| ApiError::internal(format!("authorization request: {e}")))?;

    state.sessions.insert(
        session_id.clone(),
        AuthSession {
            issuer: identity.did,
            link_id: id,
            thread_id: request.thread_id().to_string(),
            credential_id: None,
        },
    );
    let qr_id = uuid::Uuid::new_v4().to_string();
    state.claims.qr_store().insert(qr_id.clone(), payload);
    tracing::debug!(did = %identity.did, session = %session_id, "opened auth session");

    Ok(Json(LinkQrResponse {
        session_id,
        universal_link: universal_link(&state.public_url, &qr_id),
        link_detail: serde_json::to_value(&link)
            .map_err(|e| ApiError::internal(format!("link: {e}")))?,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(rename = "sessionID")]
    pub session_id: String,
}

/// Handler for `POST /v2/authentication/callback`. Public: the body is a
/// zkp envelope and authenticates itself.
pub async fn auth_callback_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .sessions
        .get(&query.session_id)
        .ok_or_else(|| ApiError::not_found(format!("session {}", query.session_id)))?;
    if session.credential_id.is_some() {
        return Err(ApiError::new(
            ErrorKind::Conflict,
            format!("session {} was already used", query.session_id),
        ));
    }

    let (message, media) = state.packager.unpack(&body).await?;
    if media != MediaType::Zkp {
        return Err(ApiError::unauthorized(format!(
            "authorization responses must be {}",
            MediaType::Zkp
        )));
    }
    if message.message_type != message_type::AUTHORIZATION_RESPONSE {
        return Err(ApiError::bad_request(format!(
            "expected {}, got {}",
            message_type::AUTHORIZATION_RESPONSE,
            message.message_type
        )));
    }
    if message.thread_id() != session.thread_id {
        return Err(ApiError::unauthorized("response is not in the session's thread"));
    }
    if let Some(to) = message.to.as_deref() {
        if to != session.issuer.to_string() {
            return Err(ApiError::unauthorized(format!("response is addressed to {to}")));
        }
    }
    let user = message.sender()?;

    let claim = state
        .claims
        .issue_from_link(&session.issuer, &session.link_id, &user)
        .await?;
    state.sessions.insert(
        query.session_id.clone(),
        AuthSession {
            credential_id: Some(claim.id.clone()),
            ..session
        },
    );
    tracing::info!(
        did = %claim.issuer,
        user = %user,
        credential = %claim.id,
        "redeemed link"
    );
    let offer = credential_offer(&claim, &state.claims.registry().status_builder().agent_url())?;
    Ok(Json(offer))
}

/// Handler for `GET /v2/authentication/sessions/{id}`.
pub async fn session_status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("session {id}")))?;
    Ok(match session.credential_id {
        Some(credential) => (
            StatusCode::OK,
            Json(json!({ "status": "done", "credentialID": credential })),
        ),
        None => (StatusCode::ACCEPTED, Json(json!({ "status": "pending" }))),
    })
}
