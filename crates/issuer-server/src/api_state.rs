//! Identity state endpoints: manual publishing and the transition log.

use crate::api::{blocking, issuer, state_json, ApiError};
use crate::AppState;
use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
};
use issuer_identity::state::list_for_identity;
use serde_json::{json, Value};
use std::sync::Arc;

/// Handler for `POST /v2/identities/{did}/state/publish`.
///
/// Plans, proves and submits the identity's next state and waits for its
/// confirmation. `200` with the final row, or `200` with a message when
/// the identity has nothing to publish.
pub async fn publish_state_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(did): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let identity = issuer(&state, &did).await?;
    match state.publisher.publish_now(&identity.did).await? {
        Some(record) => Ok((StatusCode::OK, Json(state_json(&record)))),
        None => Ok((
            StatusCode::OK,
            Json(json!({ "message": "no state changes to publish" })),
        )),
    }
}

/// Handler for `GET /v2/identities/{did}/state/transactions`. Newest first.
pub async fn list_transactions_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(did): Path<String>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let identity = issuer(&state, &did).await?;
    let did = identity.did;
    let records = blocking(&state, move |conn| list_for_identity(conn, &did)).await?;
    Ok(Json(records.iter().map(state_json).collect()))
}
