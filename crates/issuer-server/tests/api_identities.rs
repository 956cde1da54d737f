mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::harness;
use serde_json::json;

#[tokio::test]
async fn health_is_public() {
    let h = harness().await;
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .expect("request");
    let (status, body) = h.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn identity_routes_require_basic_auth() {
    let h = harness().await;
    let request = Request::builder()
        .uri("/v2/identities")
        .body(Body::empty())
        .expect("request");
    let (status, body) = h.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let request = Request::builder()
        .uri("/v2/identities")
        .header("authorization", "Basic dXNlcjp3cm9uZw==")
        .body(Body::empty())
        .expect("request");
    let (status, _) = h.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn creates_a_polygon_amoy_identity_with_a_confirmed_genesis_state() {
    let h = harness().await;
    let (status, body) = h
        .call(
            "POST",
            "/v2/identities",
            Some(json!({
                "didMetadata": {
                    "method": "polygonid",
                    "blockchain": "polygon",
                    "network": "amoy",
                    "type": "BJJ"
                }
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    let did = body["identifier"].as_str().expect("identifier");
    assert!(did.starts_with("did:polygonid:polygon:amoy:"), "{did}");
    let state = &body["state"];
    assert_eq!(state["status"], "confirmed");
    let zero = "0".repeat(64);
    assert_ne!(state["claimsTreeRoot"], zero.as_str());
    assert_eq!(state["revocationTreeRoot"], zero.as_str());
    assert_eq!(state["rootOfRoots"], zero.as_str());

    let (status, listed) = h.call("GET", "/v2/identities", None).await;
    assert_eq!(status, StatusCode::OK);
    let listed = listed.as_array().expect("array");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["did"], did);

    let (status, fetched) = h.call("GET", &format!("/v2/identities/{did}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["identifier"], did);
    assert_eq!(fetched["state"]["state"], state["state"]);
}

#[tokio::test]
async fn identity_metadata_defaults_and_validation() {
    let h = harness().await;
    let (status, body) = h.call("POST", "/v2/identities", Some(json!({}))).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert!(body["identifier"]
        .as_str()
        .expect("identifier")
        .starts_with("did:polygonid:polygon:amoy:"));

    let (status, body) = h
        .call(
            "POST",
            "/v2/identities",
            Some(json!({ "didMetadata": { "type": "ETH" } })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, _) = h
        .call(
            "POST",
            "/v2/identities",
            Some(json!({ "didMetadata": { "network": "nowhere" } })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_and_malformed_identities() {
    let h = harness().await;
    let (status, _) = h.call("GET", "/v2/identities/not-a-did", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let local = h.wallet().await;
    let (status, _) = h
        .call("GET", &format!("/v2/identities/{local}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let foreign = issuer_types::Did::from_genesis_state(
        issuer_types::DidMethod::Iden3,
        issuer_types::Blockchain::Polygon,
        issuer_types::NetworkId::Amoy,
        &[7u8; 32],
    )
    .expect("did");
    let (status, body) = h
        .call("GET", &format!("/v2/identities/{foreign}"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}
