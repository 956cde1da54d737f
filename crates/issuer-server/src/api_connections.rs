//! Issuer-to-user connections.

use crate::api::{blocking, issuer, ApiError};
use crate::AppState;
use axum::extract::{Extension, Json, Path};
use issuer_identity::{delete_connection, get_connection, list_connections, UserConnection};
use serde_json::{json, Value};
use std::sync::Arc;

/// Handler for `GET /v2/identities/{did}/connections`.
pub async fn list_connections_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(did): Path<String>,
) -> Result<Json<Vec<UserConnection>>, ApiError> {
    let did = issuer(&state, &did).await?.did;
    let connections = blocking(&state, move |conn| list_connections(conn, &did)).await?;
    Ok(Json(connections))
}

/// Handler for `GET /v2/identities/{did}/connections/{id}`.
pub async fn get_connection_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((did, id)): Path<(String, String)>,
) -> Result<Json<UserConnection>, ApiError> {
    let did = issuer(&state, &did).await?.did;
    let connection = blocking(&state, move |conn| get_connection(conn, &did, &id)).await?;
    Ok(Json(connection))
}

/// Handler for `DELETE /v2/identities/{did}/connections/{id}`.
pub async fn delete_connection_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((did, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let did = issuer(&state, &did).await?.did;
    blocking(&state, move |conn| delete_connection(conn, &did, &id)).await?;
    Ok(Json(json!({ "message": "connection deleted" })))
}
