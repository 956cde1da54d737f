//! The Iden3comm agent endpoint wallets talk to.
//!
//! Requests arrive in any supported envelope; replies go back as plain
//! messages in the request's thread.

use crate::api::ApiError;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Extension, Json},
};
use issuer_claims::W3CCredential;
use issuer_iden3comm::{
    BasicMessage, CredentialFetchRequestBody, CredentialIssuanceBody, MediaType,
    RevocationStatusRequestBody,
};
use issuer_types::{media_type, message_type, Did};
use std::sync::Arc;

/// Handler for `POST /v2/agent`.
pub async fn agent_handler(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<BasicMessage>, ApiError> {
    let (message, media) = state.packager.unpack(&body).await?;
    let issuer = recipient(&state, &message).await?;
    tracing::debug!(
        did = %issuer,
        media_type = %media,
        message_type = %message.message_type,
        "agent request"
    );

    let mut reply = match message.message_type.as_str() {
        message_type::CREDENTIAL_FETCH_REQUEST => {
            fetch_credential(&state, &message, media, &issuer).await?
        }
        message_type::REVOCATION_STATUS_REQUEST => {
            revocation_status(&state, &message, &issuer).await?
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "unsupported message type {other}"
            )))
        }
    };
    reply.typ = Some(media_type::PLAIN.to_string());
    Ok(Json(reply))
}

/// The identity of this node a message is addressed to.
async fn recipient(state: &AppState, message: &BasicMessage) -> Result<Did, ApiError> {
    let to = message
        .to
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("message has no recipient"))?;
    let did: Did = to.parse()?;
    Ok(state.claims.registry().get_by_did(&did).await?.did)
}

/// Credentials are only handed out against a zkp-authenticated request
/// from their subject.
async fn fetch_credential(
    state: &AppState,
    message: &BasicMessage,
    media: MediaType,
    issuer: &Did,
) -> Result<BasicMessage, ApiError> {
    if media != MediaType::Zkp {
        return Err(ApiError::unauthorized(format!(
            "credential fetch requests must be {}",
            MediaType::Zkp
        )));
    }
    let sender = message.sender()?;
    let request: CredentialFetchRequestBody = message.body_as()?;
    let claim = state.claims.get(issuer, &request.id).await?;
    if claim.subject != Some(sender) {
        return Err(ApiError::unauthorized(format!(
            "credential {} was not issued to {sender}",
            claim.id
        )));
    }
    let credential = serde_json::to_value(W3CCredential::from(&claim))
        .map_err(|e| ApiError::internal(format!("credential {}: {e}", claim.id)))?;
    let body = serde_json::to_value(CredentialIssuanceBody { credential })
        .map_err(|e| ApiError::internal(format!("issuance response: {e}")))?;
    tracing::info!(did = %issuer, user = %sender, credential = %claim.id, "credential fetched");
    Ok(message.reply(message_type::CREDENTIAL_ISSUANCE_RESPONSE, issuer, body))
}

async fn revocation_status(
    state: &AppState,
    message: &BasicMessage,
    issuer: &Did,
) -> Result<BasicMessage, ApiError> {
    let request: RevocationStatusRequestBody = message.body_as()?;
    let status = state
        .engine
        .revocation_status(issuer, request.revocation_nonce)
        .await?;
    let body = serde_json::to_value(status)
        .map_err(|e| ApiError::internal(format!("revocation status: {e}")))?;
    Ok(message.reply(message_type::REVOCATION_STATUS_RESPONSE, issuer, body))
}
