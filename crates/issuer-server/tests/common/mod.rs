//! Shared harness: a full node over an in-memory database, an in-memory
//! State contract, fake circuits and a local schema server.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use issuer_chain::{GistRootInfo, InMemoryStateContract, StateContract};
use issuer_claims::{ClaimService, MemoryCache, SchemaLoader, TtlStore};
use issuer_crypto::prover::{Prover, ProverError};
use issuer_crypto::zk::{CircuitId, ProofData, ProofVerifier, ZkError, ZkProof};
use issuer_db::{create_pool, run_migrations, DbRuntimeSettings};
use issuer_iden3comm::{BasicMessage, ChainStateResolver, LocalDidResolver, MediaType, Packager};
use issuer_identity::IdentityRegistry;
use issuer_kms::Kms;
use issuer_merkle::IdentityLocks;
use issuer_observe::EventBus;
use issuer_revocation::{RetryPolicy, RhsPublisher, StatusBuilder};
use issuer_server::{app, AppState, BasicAuth, IdentityConfig};
use issuer_state::{Publisher, PublisherSettings, TransitionEngine};
use issuer_types::{Blockchain, Did, DidMethod, NetworkId};
use serde_json::{json, Value};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;

pub const PUBLIC_URL: &str = "https://issuer.example";
pub const KYC_TYPE: &str = "KYCAgeCredential";

/// Answers both circuits with the public signals the real ones would
/// output for the inputs the node builds.
pub struct FakeProver;

#[async_trait]
impl Prover for FakeProver {
    async fn prove(&self, circuit: CircuitId, inputs: &Value) -> Result<ZkProof, ProverError> {
        let signal = |key: &str| inputs[key].as_str().unwrap_or_default().to_string();
        let pub_signals = match circuit {
            CircuitId::AuthV2 => vec![signal("genesisID"), signal("challenge"), signal("gistRoot")],
            CircuitId::StateTransition => Vec::new(),
        };
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        Ok(ZkProof {
            proof: ProofData {
                pi_a: s(&["1", "2", "1"]),
                pi_b: vec![s(&["1", "2"]), s(&["3", "4"]), s(&["1", "0"])],
                pi_c: s(&["1", "2", "1"]),
                protocol: "groth16".into(),
                curve: "bn128".into(),
            },
            pub_signals,
        })
    }
}

pub struct AcceptAll;

impl ProofVerifier for AcceptAll {
    fn verify(&self, _circuit: CircuitId, _proof: &ZkProof) -> Result<(), ZkError> {
        Ok(())
    }
}

fn kyc_schema() -> Value {
    json!({
        "$metadata": {
            "type": KYC_TYPE,
            "uris": { "jsonLdContext": "https://schema.example/kyc.jsonld" }
        },
        "properties": {
            "credentialSubject": {
                "type": "object",
                "required": ["birthday", "documentType"],
                "properties": {
                    "id": { "type": "string" },
                    "birthday": { "type": "integer" },
                    "documentType": { "type": "integer" }
                }
            }
        }
    })
}

async fn schema_server() -> String {
    let app = Router::new().route("/kyc.json", get(|| async { Json(kyc_schema()) }));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}/kyc.json")
}

pub struct Harness {
    pub state: AppState,
    pub contract: Arc<InMemoryStateContract>,
    pub schema_url: String,
}

pub async fn harness() -> Harness {
    let pool = create_pool(":memory:", DbRuntimeSettings::default()).expect("pool");
    run_migrations(&pool.get().expect("conn")).expect("migrations");
    let registry = IdentityRegistry::new(
        pool,
        Kms::in_memory(),
        EventBus::default(),
        StatusBuilder::new(PUBLIC_URL),
    );
    let cache = Arc::new(MemoryCache::new(NonZeroUsize::new(8).expect("non-zero")));
    let loader =
        SchemaLoader::new(cache, Duration::from_secs(600), Duration::from_secs(5)).expect("loader");
    let locks = IdentityLocks::new();
    let claims = ClaimService::new(
        registry.clone(),
        Arc::new(loader),
        locks.clone(),
        TtlStore::new(Duration::from_secs(100)),
        PUBLIC_URL,
    );
    let engine = TransitionEngine::new(registry.clone(), locks, Arc::new(FakeProver));
    let contract = Arc::new(InMemoryStateContract::new());
    let publisher = Publisher::on_chain(
        engine.clone(),
        contract.clone(),
        RhsPublisher::Noop,
        PublisherSettings {
            publish_interval: Duration::from_secs(3600),
            confirmation_blocks: 1,
            confirmation_timeout: Duration::from_secs(5),
            wait_receipt_cycle: Duration::from_millis(10),
            submit_attempts: 1,
            submit_backoff: Duration::from_millis(1),
            rhs_retry: RetryPolicy {
                retries: 0,
                initial_backoff: Duration::from_millis(1),
                ignore_errors: false,
            },
        },
    );
    let packager = Packager::new(
        registry.clone(),
        Arc::new(LocalDidResolver::new(registry)),
        Arc::new(ChainStateResolver::new(contract.clone())),
        Arc::new(AcceptAll),
    )
    .with_zkp(engine.clone(), contract.clone());

    let state = AppState {
        claims,
        engine,
        publisher,
        packager,
        sessions: TtlStore::new(Duration::from_secs(300)),
        auth: BasicAuth::new("user", "password"),
        identity_defaults: IdentityConfig::default(),
        public_url: PUBLIC_URL.to_string(),
    };
    Harness {
        state,
        contract,
        schema_url: schema_server().await,
    }
}

pub fn basic_auth() -> String {
    format!("Basic {}", STANDARD.encode("user:password"))
}

impl Harness {
    /// Sends an authenticated JSON request and returns status and body.
    pub async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, basic_auth());
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&json).expect("json"))
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).expect("request")).await
    }

    /// Posts raw bytes without credentials, the way a wallet does.
    pub async fn post_raw(&self, uri: &str, body: Vec<u8>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body))
            .expect("request");
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = app(self.state.clone())
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, json)
    }

    /// Creates an identity through the API and returns its DID.
    pub async fn create_identity(&self) -> Did {
        let (status, body) = self
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
        body["identifier"]
            .as_str()
            .expect("identifier")
            .parse()
            .expect("did")
    }

    /// A second identity on the same node, standing in for a wallet.
    pub async fn wallet(&self) -> Did {
        self.state
            .claims
            .registry()
            .create(DidMethod::PolygonId, Blockchain::Polygon, NetworkId::Amoy)
            .await
            .expect("wallet")
            .did
    }

    pub fn credential_body(&self, subject: Option<&Did>, proofs: &[&str]) -> Value {
        let mut credential_subject = json!({ "birthday": 19960424, "documentType": 2 });
        if let Some(did) = subject {
            credential_subject["id"] = json!(did.to_string());
        }
        json!({
            "credentialSchema": self.schema_url,
            "type": KYC_TYPE,
            "credentialSubject": credential_subject,
            "proofs": proofs,
        })
    }

    /// Issues a credential through the API and returns its id.
    pub async fn issue(&self, issuer: &Did, subject: Option<&Did>, proofs: &[&str]) -> String {
        let (status, body) = self
            .call(
                "POST",
                &format!("/v2/identities/{issuer}/credentials"),
                Some(self.credential_body(subject, proofs)),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().expect("id").to_string()
    }

    /// Registers the GIST root `did` would prove against as current.
    pub async fn known_root(&self, did: &Did) {
        let root = self.contract.gist_proof(did).await.expect("gist").root;
        let now = u64::try_from(chrono::Utc::now().timestamp()).expect("positive time");
        self.contract
            .insert_root_info(GistRootInfo {
                root,
                created_at_timestamp: now - 7200,
                ..GistRootInfo::default()
            })
            .expect("root info");
    }

    /// Packs `message` from `from` in a zkp envelope.
    pub async fn zkp(&self, message: &BasicMessage, from: &Did) -> Vec<u8> {
        self.known_root(from).await;
        self.state
            .packager
            .pack(MediaType::Zkp, message, from)
            .await
            .expect("pack zkp")
    }
}
