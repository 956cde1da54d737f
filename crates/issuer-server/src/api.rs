//! Error mapping shared by every handler, and the identity endpoints.

use crate::AppState;
use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use issuer_claims::ClaimsError;
use issuer_identity::state::last_confirmed;
use issuer_identity::{Identity, IdentityError, StateRecord};
use issuer_iden3comm::PackerError;
use issuer_kms::KmsError;
use issuer_state::StateError;
use issuer_types::{Blockchain, Did, DidError, DidMethod, ErrorKind, NetworkId};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// API error: a message and the kind that picks the status code.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendError, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::SchemaError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::CryptoError | ErrorKind::StateError => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::BackendError => StatusCode::BAD_GATEWAY,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.kind {
            ErrorKind::CryptoError | ErrorKind::StateError | ErrorKind::BackendError => {
                tracing::error!(code = self.kind.code(), "request failed: {}", self.message);
            }
            _ => tracing::debug!(code = self.kind.code(), "request rejected: {}", self.message),
        }
        let body = Json(json!({
            "error": self.message,
            "code": self.kind.code(),
        }));
        (status_for(self.kind), body).into_response()
    }
}

macro_rules! from_kinded {
    ($($error:ty),+ $(,)?) => {
        $(
            impl From<$error> for ApiError {
                fn from(e: $error) -> Self {
                    Self::new(e.kind(), e.to_string())
                }
            }
        )+
    };
}

from_kinded!(ClaimsError, IdentityError, StateError, PackerError, KmsError);

impl From<DidError> for ApiError {
    fn from(e: DidError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::internal(format!("blocking task failed: {e}"))
    }
}

/// Runs `f` on a pooled connection off the async runtime.
pub(crate) async fn blocking<T, E, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
    F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
{
    let pool = state.claims.registry().pool().clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::internal(format!("database pool: {e}")))?;
        f(&conn).map_err(Into::into)
    })
    .await?
}

/// Parses a DID path segment.
pub(crate) fn did_param(raw: &str) -> Result<Did, ApiError> {
    raw.parse()
        .map_err(|e: DidError| ApiError::bad_request(format!("invalid did {raw}: {e}")))
}

/// Checks that `did` is an identity of this node.
pub(crate) async fn issuer(state: &AppState, raw: &str) -> Result<Identity, ApiError> {
    let did = did_param(raw)?;
    Ok(state.claims.registry().get_by_did(&did).await?)
}

pub(crate) fn state_json(record: &StateRecord) -> Value {
    let roots = record.current.roots;
    json!({
        "stateID": record.id,
        "state": record.current.state.hex(),
        "previousState": record.previous.map(|p| p.state.hex()),
        "claimsTreeRoot": roots.claims.hex(),
        "revocationTreeRoot": roots.revocations.hex(),
        "rootOfRoots": roots.roots.hex(),
        "status": record.status.as_str(),
        "txID": record.tx_id,
        "blockNumber": record.block_number,
        "error": record.error,
        "rhsPublished": record.rhs_published,
        "createdAt": record.created_at,
        "modifiedAt": record.modified_at,
    })
}

/// DID flavour of a new identity; unset fields take the configured default.
#[derive(Debug, Default, Deserialize)]
pub struct DidMetadata {
    pub method: Option<String>,
    pub blockchain: Option<String>,
    pub network: Option<String>,
    /// Auth key type. Only `BJJ` is supported.
    #[serde(rename = "type")]
    pub key_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIdentityRequest {
    #[serde(default)]
    pub did_metadata: DidMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityResponse {
    pub identifier: String,
    pub state: Value,
    /// Address of the gas key, `0x`-prefixed.
    pub address: Option<String>,
}

async fn identity_response(state: &AppState, identity: &Identity) -> Result<IdentityResponse, ApiError> {
    let did = identity.did;
    let confirmed = blocking(state, move |conn| last_confirmed(conn, &did)).await?;
    let address = match &identity.eth_key {
        Some(key) => Some(format!(
            "0x{}",
            hex::encode(state.claims.registry().kms().eth_address(key).await?)
        )),
        None => None,
    };
    Ok(IdentityResponse {
        identifier: identity.did.to_string(),
        state: state_json(&confirmed),
        address,
    })
}

/// Handler for `POST /v2/identities`.
pub async fn create_identity_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<CreateIdentityRequest>,
) -> Result<(StatusCode, Json<IdentityResponse>), ApiError> {
    let meta = payload.did_metadata;
    if let Some(key_type) = meta.key_type.as_deref() {
        if key_type != "BJJ" {
            return Err(ApiError::bad_request(format!("unsupported key type {key_type}")));
        }
    }
    let defaults = state.identity_defaults;
    let method: DidMethod = meta.method.as_deref().map_or(Ok(defaults.method), str::parse)?;
    let blockchain: Blockchain = meta
        .blockchain
        .as_deref()
        .map_or(Ok(defaults.blockchain), str::parse)?;
    let network: NetworkId = meta.network.as_deref().map_or(Ok(defaults.network), str::parse)?;

    let identity = state
        .claims
        .registry()
        .create(method, blockchain, network)
        .await?;
    let response = identity_response(&state, &identity).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Handler for `GET /v2/identities`.
pub async fn list_identities_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<Identity>>, ApiError> {
    Ok(Json(state.claims.registry().list().await?))
}

/// Handler for `GET /v2/identities/{did}`.
pub async fn get_identity_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(did): Path<String>,
) -> Result<Json<IdentityResponse>, ApiError> {
    let identity = issuer(&state, &did).await?;
    Ok(Json(identity_response(&state, &identity).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_status_codes() {
        let cases = [
            (ErrorKind::InvalidRequest, 400),
            (ErrorKind::NotFound, 404),
            (ErrorKind::Conflict, 409),
            (ErrorKind::SchemaError, 422),
            (ErrorKind::CryptoError, 500),
            (ErrorKind::StateError, 500),
            (ErrorKind::BackendError, 502),
            (ErrorKind::Unauthorized, 401),
        ];
        for (kind, code) in cases {
            assert_eq!(status_for(kind).as_u16(), code, "{kind:?}");
        }
    }

    #[tokio::test]
    async fn error_body_carries_message_and_code() {
        let response = ApiError::new(ErrorKind::Conflict, "nonce 7 is revoked").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["error"], "nonce 7 is revoked");
        assert_eq!(json["code"], "CONFLICT");
    }

    #[test]
    fn did_params_are_validated() {
        let err = did_param("did:nope").expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }
}
