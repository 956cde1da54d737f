use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use issuer_chain::{GistRootInfo, InMemoryStateContract, StateContract};
use issuer_crypto::prover::{Prover, ProverError};
use issuer_crypto::zk::{CircuitId, ProofData, ProofVerifier, ZkError, ZkProof};
use issuer_crypto::Hash;
use issuer_db::{create_pool, run_migrations, DbRuntimeSettings};
use issuer_iden3comm::jws;
use issuer_iden3comm::resolver::bjj_kid;
use issuer_iden3comm::{
    sniff, BasicMessage, ChainStateResolver, DidDocument, HttpDidResolver, LocalDidResolver,
    MediaType, Packager, PackerError,
};
use issuer_identity::IdentityRegistry;
use issuer_kms::Kms;
use issuer_merkle::IdentityLocks;
use issuer_observe::EventBus;
use issuer_revocation::StatusBuilder;
use issuer_state::TransitionEngine;
use issuer_types::{message_type, Blockchain, Did, DidMethod, ErrorKind, NetworkId};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// Answers authV2 with the public signals the circuit would output.
#[derive(Default)]
struct AuthV2Prover {
    inputs: Mutex<Vec<Value>>,
}

#[async_trait]
impl Prover for AuthV2Prover {
    async fn prove(&self, circuit: CircuitId, inputs: &Value) -> Result<ZkProof, ProverError> {
        assert_eq!(circuit, CircuitId::AuthV2);
        self.inputs.lock().expect("inputs").push(inputs.clone());
        let signal = |key: &str| inputs[key].as_str().unwrap_or_default().to_string();
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        Ok(ZkProof {
            proof: ProofData {
                pi_a: s(&["1", "2", "1"]),
                pi_b: vec![s(&["1", "2"]), s(&["3", "4"]), s(&["1", "0"])],
                pi_c: s(&["1", "2", "1"]),
                protocol: "groth16".into(),
                curve: "bn128".into(),
            },
            pub_signals: vec![signal("genesisID"), signal("challenge"), signal("gistRoot")],
        })
    }
}

#[derive(Default)]
struct FakeVerifier {
    reject: AtomicBool,
}

impl ProofVerifier for FakeVerifier {
    fn verify(&self, circuit: CircuitId, _proof: &ZkProof) -> Result<(), ZkError> {
        assert_eq!(circuit, CircuitId::AuthV2);
        if self.reject.load(Ordering::SeqCst) {
            Err(ZkError::VerificationFailed)
        } else {
            Ok(())
        }
    }
}

struct Harness {
    registry: IdentityRegistry,
    packager: Packager,
    contract: Arc<InMemoryStateContract>,
    prover: Arc<AuthV2Prover>,
    verifier: Arc<FakeVerifier>,
    issuer: Did,
}

async fn harness() -> Harness {
    let pool = create_pool(":memory:", DbRuntimeSettings::default()).expect("pool");
    run_migrations(&pool.get().expect("conn")).expect("migrations");
    let registry = IdentityRegistry::new(
        pool,
        Kms::in_memory(),
        EventBus::default(),
        StatusBuilder::new("https://issuer.example"),
    );
    let issuer = registry
        .create(DidMethod::PolygonId, Blockchain::Polygon, NetworkId::Amoy)
        .await
        .expect("issuer")
        .did;
    let contract = Arc::new(InMemoryStateContract::new());
    let prover = Arc::new(AuthV2Prover::default());
    let verifier = Arc::new(FakeVerifier::default());
    let engine = TransitionEngine::new(registry.clone(), IdentityLocks::new(), prover.clone());
    let packager = Packager::new(
        registry.clone(),
        Arc::new(LocalDidResolver::new(registry.clone())),
        Arc::new(ChainStateResolver::new(contract.clone())),
        verifier.clone(),
    )
    .with_zkp(engine, contract.clone());
    Harness {
        registry,
        packager,
        contract,
        prover,
        verifier,
        issuer,
    }
}

fn now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).expect("positive time")
}

/// Registers the contract's current GIST root, optionally replaced
/// `replaced` seconds ago.
async fn known_root(h: &Harness, replaced: Option<u64>) -> Hash {
    let root = h.contract.gist_proof(&h.issuer).await.expect("gist").root;
    h.contract
        .insert_root_info(GistRootInfo {
            root,
            created_at_timestamp: now() - 7200,
            replaced_at_timestamp: replaced.map_or(0, |ago| now() - ago),
            ..GistRootInfo::default()
        })
        .expect("root info");
    root
}

fn status_request(from: &Did) -> BasicMessage {
    BasicMessage::new(
        message_type::REVOCATION_STATUS_REQUEST,
        from,
        None,
        json!({ "revocation_nonce": 12 }),
    )
}

#[tokio::test]
async fn plain_round_trip() {
    let h = harness().await;
    let message = status_request(&h.issuer);
    let packed = h
        .packager
        .pack(MediaType::Plain, &message, &h.issuer)
        .await
        .expect("pack");
    let (opened, media) = h.packager.unpack(&packed).await.expect("unpack");
    assert_eq!(media, MediaType::Plain);
    assert_eq!(opened.id, message.id);
    assert_eq!(opened.typ.as_deref(), Some(MediaType::Plain.as_str()));
    assert_eq!(opened.body, message.body);
}

#[tokio::test]
async fn pack_refuses_foreign_sender() {
    let h = harness().await;
    let other = Did::from_genesis_state(DidMethod::Iden3, Blockchain::Polygon, NetworkId::Amoy, &[9u8; 32])
        .expect("did");
    let err = h
        .packager
        .pack(MediaType::Plain, &status_request(&other), &h.issuer)
        .await
        .expect_err("foreign");
    assert!(matches!(err, PackerError::SenderMismatch { .. }));
}

#[tokio::test]
async fn jws_round_trip_and_tamper() {
    let h = harness().await;
    let message = status_request(&h.issuer);
    let packed = h
        .packager
        .pack(MediaType::Signed, &message, &h.issuer)
        .await
        .expect("pack");
    assert_eq!(sniff(&packed).expect("sniff"), MediaType::Signed);

    let (opened, media) = h.packager.unpack(&packed).await.expect("unpack");
    assert_eq!(media, MediaType::Signed);
    assert_eq!(opened.id, message.id);

    let token = String::from_utf8(packed).expect("utf-8");
    let parts: Vec<&str> = token.split('.').collect();
    let header: Value =
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).expect("b64")).expect("header");
    assert_eq!(header["alg"], "BJJ");
    assert_eq!(header["kid"], bjj_kid(&h.issuer));

    let mut forged = message.clone();
    forged.body = json!({ "revocation_nonce": 13 });
    let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).expect("json"));
    let tampered = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);
    let err = h.packager.unpack(tampered.as_bytes()).await.expect_err("tampered");
    assert!(matches!(err, PackerError::InvalidSignature));
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn jws_signer_must_be_the_sender() {
    let h = harness().await;
    let other = h
        .registry
        .create(DidMethod::PolygonId, Blockchain::Polygon, NetworkId::Amoy)
        .await
        .expect("second identity")
        .did;
    let identity = h.registry.get_by_did(&h.issuer).await.expect("issuer");
    let payload = serde_json::to_vec(&status_request(&other)).expect("json");
    let token = jws::sign(h.registry.kms(), &identity.auth_key, &bjj_kid(&h.issuer), &payload)
        .await
        .expect("sign");

    let err = h.packager.unpack(token.as_bytes()).await.expect_err("mismatch");
    assert!(matches!(err, PackerError::SenderMismatch { .. }));
}

#[tokio::test]
async fn jwz_round_trip() {
    let h = harness().await;
    let root = known_root(&h, None).await;
    let message = status_request(&h.issuer);
    let packed = h
        .packager
        .pack(MediaType::Zkp, &message, &h.issuer)
        .await
        .expect("pack");
    assert_eq!(sniff(&packed).expect("sniff"), MediaType::Zkp);

    let inputs = h.prover.inputs.lock().expect("inputs").clone();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0]["gistRoot"], root.to_decimal());
    assert_eq!(inputs[0]["authClaimIncMtp"].as_array().expect("mtp").len(), 40);
    assert_eq!(inputs[0]["gistMtp"].as_array().expect("gist").len(), 64);
    assert_eq!(inputs[0]["profileNonce"], "0");

    let (opened, media) = h.packager.unpack(&packed).await.expect("unpack");
    assert_eq!(media, MediaType::Zkp);
    assert_eq!(opened.id, message.id);
}

#[tokio::test]
async fn jwz_against_a_stale_root_is_rejected() {
    let h = harness().await;
    known_root(&h, Some(16 * 60)).await;
    let packed = h
        .packager
        .pack(MediaType::Zkp, &status_request(&h.issuer), &h.issuer)
        .await
        .expect("pack");
    let err = h.packager.unpack(&packed).await.expect_err("stale");
    assert!(matches!(err, PackerError::StaleState { .. }));
    assert_eq!(err.kind(), ErrorKind::StateError);
}

#[tokio::test]
async fn jwz_recently_replaced_root_is_accepted() {
    let h = harness().await;
    known_root(&h, Some(60)).await;
    let packed = h
        .packager
        .pack(MediaType::Zkp, &status_request(&h.issuer), &h.issuer)
        .await
        .expect("pack");
    h.packager.unpack(&packed).await.expect("within tolerance");
}

#[tokio::test]
async fn jwz_against_an_unknown_root_is_rejected() {
    let h = harness().await;
    let packed = h
        .packager
        .pack(MediaType::Zkp, &status_request(&h.issuer), &h.issuer)
        .await
        .expect("pack");
    let err = h.packager.unpack(&packed).await.expect_err("unknown");
    assert!(matches!(err, PackerError::UnknownState(_)));
}

#[tokio::test]
async fn jwz_rejected_proof_is_unauthorized() {
    let h = harness().await;
    known_root(&h, None).await;
    let packed = h
        .packager
        .pack(MediaType::Zkp, &status_request(&h.issuer), &h.issuer)
        .await
        .expect("pack");
    h.verifier.reject.store(true, Ordering::SeqCst);
    let err = h.packager.unpack(&packed).await.expect_err("rejected");
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn zkp_needs_a_prover() {
    let h = harness().await;
    let bare = Packager::new(
        h.registry.clone(),
        Arc::new(LocalDidResolver::new(h.registry.clone())),
        Arc::new(ChainStateResolver::new(h.contract.clone())),
        h.verifier.clone(),
    );
    let err = bare
        .pack(MediaType::Zkp, &status_request(&h.issuer), &h.issuer)
        .await
        .expect_err("no prover");
    assert!(matches!(err, PackerError::NoProver));
}

#[test]
fn sniff_rejects_unknown_envelopes() {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256"}"#);
    assert!(matches!(
        sniff(format!("{header}.e30.sig").as_bytes()),
        Err(PackerError::UnsupportedAlgorithm(_))
    ));
    assert!(matches!(sniff(b"%%%"), Err(PackerError::Malformed(_))));
    assert_eq!(sniff(b"  {\"id\":\"1\"}").expect("plain"), MediaType::Plain);
}

type Documents = Arc<HashMap<String, DidDocument>>;

async fn resolver_server(documents: Documents) -> String {
    let app = Router::new()
        .route(
            "/1.0/identifiers/{did}",
            get(|State(docs): State<Documents>, Path(did): Path<String>| async move {
                match docs.get(&did) {
                    Some(doc) => Ok(Json(json!({ "didDocument": doc, "didResolutionMetadata": {} }))),
                    None => Err(StatusCode::NOT_FOUND),
                }
            }),
        )
        .with_state(documents);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn jws_verifies_through_a_universal_resolver() {
    let h = harness().await;
    let identity = h.registry.get_by_did(&h.issuer).await.expect("issuer");
    let key = h.registry.kms().bjj_public(&identity.auth_key).await.expect("key");
    let mut docs = HashMap::new();
    docs.insert(h.issuer.to_string(), DidDocument::with_bjj_key(&h.issuer, &key));
    let url = resolver_server(Arc::new(docs)).await;

    let remote = Packager::new(
        h.registry.clone(),
        Arc::new(HttpDidResolver::new(url, Duration::from_secs(5)).expect("resolver")),
        Arc::new(ChainStateResolver::new(h.contract.clone())),
        h.verifier.clone(),
    );
    let packed = h
        .packager
        .pack(MediaType::Signed, &status_request(&h.issuer), &h.issuer)
        .await
        .expect("pack");
    remote.unpack(&packed).await.expect("verified remotely");

    let stranger = h
        .registry
        .create(DidMethod::PolygonId, Blockchain::Polygon, NetworkId::Amoy)
        .await
        .expect("unpublished identity")
        .did;
    let packed = h
        .packager
        .pack(MediaType::Signed, &status_request(&stranger), &stranger)
        .await
        .expect("pack");
    let err = remote.unpack(&packed).await.expect_err("unknown did");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
