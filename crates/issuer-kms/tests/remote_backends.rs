//! Vault and AWS KMS providers against in-process fakes of their HTTP APIs.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, post};
use axum::{Json, Router};
use base64::Engine;
use issuer_kms::{
    ethereum_address, AwsCredentials, AwsKmsProvider, KeyId, KeyProvider, KmsError,
    VaultProvider,
};
use issuer_types::{Blockchain, Did, DidMethod, KeyKind, NetworkId};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::pkcs8::EncodePublicKey;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn did() -> Did {
    Did::from_genesis_state(
        DidMethod::PolygonId,
        Blockchain::Polygon,
        NetworkId::Amoy,
        &[3u8; 32],
    )
    .expect("did")
}

// --- Vault -----------------------------------------------------------------

type VaultStore = Arc<Mutex<HashMap<String, Value>>>;

const TOKEN: &str = "s.test-token";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("x-vault-token")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == TOKEN)
}

async fn vault_write(
    State(store): State<VaultStore>,
    Path(path): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::FORBIDDEN;
    }
    let data = body.get("data").cloned().unwrap_or(Value::Null);
    store.lock().expect("lock").insert(path, data);
    StatusCode::OK
}

async fn vault_read(
    State(store): State<VaultStore>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::FORBIDDEN);
    }
    let store = store.lock().expect("lock");
    let data = store.get(&path).cloned().ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({ "data": { "data": data, "metadata": {} } })))
}

async fn vault_delete(
    State(store): State<VaultStore>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::FORBIDDEN;
    }
    store.lock().expect("lock").remove(&path);
    StatusCode::NO_CONTENT
}

async fn fake_vault() -> (String, VaultStore) {
    let store: VaultStore = Arc::default();
    let app = Router::new()
        .route(
            "/v1/secret/data/{*path}",
            post(vault_write).get(vault_read),
        )
        .route("/v1/secret/metadata/{*path}", delete(vault_delete))
        .with_state(store.clone());
    (serve(app).await, store)
}

#[tokio::test]
async fn vault_keys_sign_and_move_on_link() {
    let (addr, store) = fake_vault().await;
    let vault = VaultProvider::new(&addr, "secret", TOKEN).expect("provider");

    let bjj = vault.create(KeyKind::BabyJubjub).await.expect("create bjj");
    let eth = vault.create(KeyKind::Secp256k1).await.expect("create eth");
    assert_eq!(store.lock().expect("lock").len(), 2);

    let public = vault.public(&eth).await.expect("public");
    let digest = Keccak256::digest(b"vault");
    let sig = vault.sign(&eth, &digest).await.expect("sign");
    let recovered = VerifyingKey::recover_from_prehash(
        &digest,
        &Signature::from_slice(&sig[..64]).expect("sig"),
        RecoveryId::from_byte(sig[64]).expect("recid"),
    )
    .expect("recover");
    assert_eq!(recovered.to_encoded_point(false).as_bytes(), public.as_slice());

    let before = vault.public(&bjj).await.expect("bjj public");
    let linked = vault.link(&bjj, &did()).await.expect("link");
    assert!(linked.id.starts_with(&did().to_string()));
    assert_eq!(vault.public(&linked).await.expect("linked public"), before);
    assert!(matches!(
        vault.public(&bjj).await,
        Err(KmsError::NotFound(_))
    ));
}

#[tokio::test]
async fn vault_token_rejection_is_unauthorized() {
    let (addr, _) = fake_vault().await;
    let vault = VaultProvider::new(&addr, "secret", "wrong").expect("provider");
    assert!(matches!(
        vault.create(KeyKind::Secp256k1).await,
        Err(KmsError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn vault_kind_mismatch_is_reported() {
    let (addr, _) = fake_vault().await;
    let vault = VaultProvider::new(&addr, "secret", TOKEN).expect("provider");
    let eth = vault.create(KeyKind::Secp256k1).await.expect("create");
    let wrong = KeyId::new(KeyKind::BabyJubjub, eth.id);
    assert!(matches!(
        vault.public(&wrong).await,
        Err(KmsError::WrongKeyType(_))
    ));
}

// --- AWS KMS ---------------------------------------------------------------

#[derive(Default)]
struct FakeKms {
    keys: HashMap<String, SigningKey>,
    tags: HashMap<String, String>,
}

type KmsState = Arc<Mutex<FakeKms>>;

fn aws_error(kind: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "__type": kind, "message": kind })),
    )
}

async fn fake_kms_handler(
    State(state): State<KmsState>,
    headers: HeaderMap,
    raw: String,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    // KMS bodies are `application/x-amz-json-1.1`, which `Json` refuses.
    let body: Value = serde_json::from_str(&raw).map_err(|_| aws_error("SerializationException"))?;
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDTEST/") {
        return Err(aws_error("UnrecognizedClientException"));
    }
    let target = headers
        .get("x-amz-target")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let b64 = base64::engine::general_purpose::STANDARD;
    let mut state = state.lock().expect("lock");
    let key_id = body["KeyId"].as_str().unwrap_or_default().to_string();

    match target.as_str() {
        "TrentService.CreateKey" => {
            assert_eq!(body["KeySpec"], "ECC_SECG_P256K1");
            let id = format!("key-{}", state.keys.len() + 1);
            state
                .keys
                .insert(id.clone(), SigningKey::random(&mut rand::rngs::OsRng));
            Ok(Json(json!({ "KeyMetadata": { "KeyId": id } })))
        }
        "TrentService.GetPublicKey" => {
            let key = state
                .keys
                .get(&key_id)
                .ok_or_else(|| aws_error("NotFoundException"))?;
            let der = k256::PublicKey::from(key.verifying_key())
                .to_public_key_der()
                .expect("der");
            Ok(Json(json!({ "PublicKey": b64.encode(der.as_bytes()) })))
        }
        "TrentService.Sign" => {
            assert_eq!(body["MessageType"], "DIGEST");
            let key = state
                .keys
                .get(&key_id)
                .ok_or_else(|| aws_error("NotFoundException"))?;
            let digest = b64
                .decode(body["Message"].as_str().unwrap_or_default())
                .expect("digest");
            let (sig, _) = key.sign_prehash_recoverable(&digest).expect("sign");
            // Real KMS does not normalize s; hand back the high-s twin half
            // of the time to exercise normalization.
            let sig = if digest[0] % 2 == 0 {
                let (r, s) = sig.split_scalars();
                Signature::from_scalars(r, -s).expect("high s")
            } else {
                sig
            };
            Ok(Json(json!({ "Signature": b64.encode(sig.to_der().as_bytes()) })))
        }
        "TrentService.TagResource" => {
            let tag = body["Tags"][0]["TagValue"].as_str().unwrap_or_default();
            state.tags.insert(key_id, tag.to_string());
            Ok(Json(json!({})))
        }
        _ => Err(aws_error("UnknownOperationException")),
    }
}

async fn fake_kms() -> (String, KmsState) {
    let state: KmsState = Arc::default();
    let app = Router::new()
        .route("/", post(fake_kms_handler))
        .with_state(state.clone());
    (serve(app).await, state)
}

fn credentials(access_key: &str) -> AwsCredentials {
    AwsCredentials {
        access_key: access_key.into(),
        secret_key: Zeroizing::new("secret".into()),
        session_token: None,
    }
}

#[tokio::test]
async fn aws_signatures_are_low_s_and_recoverable() {
    let (endpoint, state) = fake_kms().await;
    let kms = AwsKmsProvider::new("eu-west-1", credentials("AKIDTEST"), Some(&endpoint))
        .expect("provider");

    let key = kms.create(KeyKind::Secp256k1).await.expect("create");
    let public = kms.public(&key).await.expect("public");
    assert_eq!(public.len(), 65);
    assert_eq!(ethereum_address(&public).expect("address").len(), 20);

    for msg in [b"even".as_slice(), b"odd", b"third", b"fourth"] {
        let digest = Keccak256::digest(msg);
        let sig = kms.sign(&key, &digest).await.expect("sign");
        let parsed = Signature::from_slice(&sig[..64]).expect("r||s");
        assert!(parsed.normalize_s().is_none(), "s must be low");
        let recovered = VerifyingKey::recover_from_prehash(
            &digest,
            &parsed,
            RecoveryId::from_byte(sig[64]).expect("recid"),
        )
        .expect("recover");
        assert_eq!(recovered.to_encoded_point(false).as_bytes(), public.as_slice());
    }

    let linked = kms.link(&key, &did()).await.expect("link");
    assert_eq!(linked, key);
    assert_eq!(
        state.lock().expect("lock").tags.get(&key.id),
        Some(&did().to_string())
    );
}

#[tokio::test]
async fn aws_errors_surface_as_kms_errors() {
    let (endpoint, _) = fake_kms().await;
    let kms = AwsKmsProvider::new("eu-west-1", credentials("AKIDTEST"), Some(&endpoint))
        .expect("provider");
    let missing = KeyId::new(KeyKind::Secp256k1, "key-404");
    assert!(matches!(
        kms.public(&missing).await,
        Err(KmsError::NotFound(_))
    ));

    let intruder = AwsKmsProvider::new("eu-west-1", credentials("OTHER"), Some(&endpoint))
        .expect("provider");
    assert!(matches!(
        intruder.create(KeyKind::Secp256k1).await,
        Err(KmsError::Unauthorized(_))
    ));
}
