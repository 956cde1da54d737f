//! Issuer node HTTP server library logic.

pub mod api;
pub mod api_agent;
pub mod api_auth;
pub mod api_connections;
pub mod api_credentials;
pub mod api_links;
pub mod api_state;
pub mod background;
pub mod config;
pub mod middleware;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use issuer_claims::{ClaimService, TtlStore};
use issuer_iden3comm::Packager;
use issuer_state::{Publisher, TransitionEngine};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use api_auth::AuthSession;
pub use config::IdentityConfig;
pub use middleware::BasicAuth;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Credential issuance; also reaches the identity registry, the KMS
    /// and the QR store.
    pub claims: ClaimService,
    pub engine: TransitionEngine,
    pub publisher: Publisher,
    pub packager: Packager,
    /// Open link authorization sessions by session id.
    pub sessions: TtlStore<AuthSession>,
    pub auth: BasicAuth,
    /// DID flavour of identities created without metadata.
    pub identity_defaults: IdentityConfig,
    /// Base URL wallets reach this server at, without a trailing slash.
    pub public_url: String,
}

/// Maximum request body size (2 MiB). Protects against OOM from oversized payloads.
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/v2/identities",
            post(api::create_identity_handler).get(api::list_identities_handler),
        )
        .route("/v2/identities/{did}", get(api::get_identity_handler))
        .route(
            "/v2/identities/{did}/credentials",
            post(api_credentials::create_credential_handler)
                .get(api_credentials::list_credentials_handler),
        )
        .route(
            "/v2/identities/{did}/credentials/{id}",
            get(api_credentials::get_credential_handler)
                .delete(api_credentials::delete_credential_handler),
        )
        .route(
            "/v2/identities/{did}/credentials/{id}/offer",
            get(api_credentials::credential_offer_handler),
        )
        .route(
            "/v2/identities/{did}/credentials/revoke/{nonce}",
            post(api_credentials::revoke_credential_handler),
        )
        .route(
            "/v2/identities/{did}/credentials/revocation/status/{nonce}",
            get(api_credentials::revocation_status_handler),
        )
        .route(
            "/v2/identities/{did}/state/publish",
            post(api_state::publish_state_handler),
        )
        .route(
            "/v2/identities/{did}/state/transactions",
            get(api_state::list_transactions_handler),
        )
        .route(
            "/v2/identities/{did}/links",
            post(api_links::create_link_handler),
        )
        .route(
            "/v2/identities/{did}/links/{id}",
            get(api_links::get_link_handler).patch(api_links::update_link_handler),
        )
        .route(
            "/v2/identities/{did}/links/{id}/qrcode",
            post(api_auth::link_qr_handler),
        )
        .route(
            "/v2/identities/{did}/connections",
            get(api_connections::list_connections_handler),
        )
        .route(
            "/v2/identities/{did}/connections/{id}",
            get(api_connections::get_connection_handler)
                .delete(api_connections::delete_connection_handler),
        )
        .route(
            "/v2/authentication/sessions/{id}",
            get(api_auth::session_status_handler),
        )
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/v2/agent", post(api_agent::agent_handler))
        .route("/v2/qr-store", get(api_links::qr_store_handler))
        .route(
            "/v2/authentication/callback",
            post(api_auth::auth_callback_handler),
        )
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
