//! Identity creation against an in-memory database and KMS.

use issuer_crypto::Hash;
use issuer_db::{create_pool, run_migrations, DbRuntimeSettings};
use issuer_identity::proofs::MtpProof;
use issuer_identity::state::{last_confirmed, list_for_identity};
use issuer_identity::{delete_connection, list_connections, upsert_connection, IdentityError, IdentityRegistry};
use async_trait::async_trait;
use issuer_kms::{KeyId, KeyProvider, Kms, KmsError, LocalProvider};
use issuer_merkle::IdentityTrees;
use issuer_observe::EventBus;
use issuer_revocation::StatusBuilder;
use issuer_types::{
    Blockchain, Did, DidMethod, ErrorKind, IdentityStateStatus, KeyKind, NetworkId,
};
use std::sync::Arc;

fn registry_on(events: EventBus) -> IdentityRegistry {
    let pool = create_pool(":memory:", DbRuntimeSettings::default()).expect("pool");
    run_migrations(&pool.get().expect("conn")).expect("migrations");
    IdentityRegistry::new(
        pool,
        Kms::in_memory(),
        events,
        StatusBuilder::new("https://issuer.example"),
    )
}

fn registry() -> IdentityRegistry {
    registry_on(EventBus::default())
}

async fn amoy(registry: &IdentityRegistry) -> Did {
    registry
        .create(DidMethod::PolygonId, Blockchain::Polygon, NetworkId::Amoy)
        .await
        .expect("create")
        .did
}

#[tokio::test]
async fn creates_identity_with_confirmed_genesis() {
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let registry = registry_on(bus);

    let did = amoy(&registry).await;
    assert!(did.to_string().starts_with("did:polygonid:polygon:amoy:"));
    let event = events.try_recv().expect("identity event");
    assert_eq!(event.event_type, "CREATE_IDENTITY");
    assert_eq!(event.issuer, did.to_string());

    let conn = registry.pool().get().expect("conn");
    let genesis = last_confirmed(&conn, &did).expect("genesis");
    assert!(genesis.is_genesis);
    assert_eq!(genesis.status, IdentityStateStatus::Confirmed);
    assert!(genesis.tx_id.is_none());
    assert!(!genesis.current.roots.claims.is_zero());
    assert_eq!(genesis.current.roots.revocations, Hash::ZERO);
    assert_eq!(genesis.current.roots.roots, Hash::ZERO);
    assert!(did.is_genesis_state(genesis.current.state.as_le_bytes()));
    assert_eq!(list_for_identity(&conn, &did).expect("states").len(), 1);

    let trees = IdentityTrees::open(&conn, &did.to_string()).expect("trees");
    assert_eq!(trees.state().expect("state"), genesis.current.state);
}

#[tokio::test]
async fn auth_claim_carries_a_valid_proof() {
    let registry = registry();
    let did = amoy(&registry).await;
    let identity = registry.get_by_did(&did).await.expect("identity");

    let auth = registry.auth_claim(&did).await.expect("auth claim");
    assert_eq!(auth.id, identity.auth_claim_id);
    assert_eq!(auth.credential_status.revocation_nonce, auth.revocation_nonce());
    assert_eq!(auth.credential_status.id, "https://issuer.example/v2/agent");

    let public = registry
        .kms()
        .bjj_public(&identity.auth_key)
        .await
        .expect("linked key still resolves");
    let (x, y) = auth.core_claim.index_data().expect("index");
    assert_eq!(x.to_fr(), public.point().x);
    assert_eq!(y.to_fr(), public.point().y);

    let conn = registry.pool().get().expect("conn");
    let raw: String = conn
        .query_row(
            "SELECT mtp_proof FROM claims WHERE id = ?1",
            [&auth.id],
            |row| row.get(0),
        )
        .expect("proof");
    let proof: MtpProof = serde_json::from_str(&raw).expect("parse");
    proof.verify().expect("genesis mtp verifies");
    assert_eq!(proof.issuer_data.id, did);
}

#[tokio::test]
async fn keys_are_linked_to_the_did() {
    let registry = registry();
    let did = amoy(&registry).await;
    let identity = registry.get_by_did(&did).await.expect("identity");
    assert!(identity.auth_key.id.starts_with(&did.to_string()));
    let eth = identity.eth_key.expect("eth key");
    assert!(eth.id.starts_with(&did.to_string()));
    registry.kms().public(&eth).await.expect("eth key resolves");
}

/// Holds keys locally but cannot tag them, like a remote store that
/// rejects the write.
struct UnlinkableKeys(LocalProvider);

#[async_trait]
impl KeyProvider for UnlinkableKeys {
    async fn create(&self, kind: KeyKind) -> Result<KeyId, KmsError> {
        self.0.create(kind).await
    }

    async fn public(&self, key: &KeyId) -> Result<Vec<u8>, KmsError> {
        self.0.public(key).await
    }

    async fn sign(&self, key: &KeyId, digest: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.0.sign(key, digest).await
    }

    async fn link(&self, _key: &KeyId, _did: &Did) -> Result<KeyId, KmsError> {
        Err(KmsError::Backend("vault returned 500".into()))
    }
}

#[tokio::test]
async fn failed_key_link_persists_nothing() {
    let pool = create_pool(":memory:", DbRuntimeSettings::default()).expect("pool");
    run_migrations(&pool.get().expect("conn")).expect("migrations");
    let keys: Arc<dyn KeyProvider> = Arc::new(UnlinkableKeys(LocalProvider::in_memory()));
    let registry = IdentityRegistry::new(
        pool,
        Kms::new(keys.clone(), keys),
        EventBus::default(),
        StatusBuilder::new("https://issuer.example"),
    );

    let err = registry
        .create(DidMethod::PolygonId, Blockchain::Polygon, NetworkId::Amoy)
        .await
        .expect_err("link failure surfaces");
    assert_eq!(err.kind(), ErrorKind::BackendError);
    assert!(registry.list().await.expect("list").is_empty());

    let conn = registry.pool().get().expect("conn");
    let trees: i64 = conn
        .query_row("SELECT COUNT(*) FROM identity_mts", [], |row| row.get(0))
        .expect("count");
    assert_eq!(trees, 0);
}

#[tokio::test]
async fn identities_are_distinct_and_listed() {
    let registry = registry();
    let first = amoy(&registry).await;
    let second = registry
        .create(DidMethod::Iden3, Blockchain::Polygon, NetworkId::Main)
        .await
        .expect("create")
        .did;
    assert_ne!(first, second);
    assert!(second.to_string().starts_with("did:iden3:polygon:main:"));

    let all = registry.list().await.expect("list");
    assert_eq!(all.len(), 2);

    let unknown = Did::from_genesis_state(
        DidMethod::PolygonId,
        Blockchain::Polygon,
        NetworkId::Amoy,
        &[9u8; 32],
    )
    .expect("did");
    let err = registry.get_by_did(&unknown).await.expect_err("unknown");
    assert!(matches!(err, IdentityError::NotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn connections_upsert_and_delete() {
    let registry = registry();
    let issuer = amoy(&registry).await;
    let user = Did::from_genesis_state(
        DidMethod::PolygonId,
        Blockchain::Polygon,
        NetworkId::Amoy,
        &[5u8; 32],
    )
    .expect("did");

    let conn = registry.pool().get().expect("conn");
    let (first, created) = upsert_connection(&conn, &issuer, &user).expect("insert");
    assert!(created);
    let (again, created) = upsert_connection(&conn, &issuer, &user).expect("touch");
    assert!(!created);
    assert_eq!(again.id, first.id);
    assert_eq!(list_connections(&conn, &issuer).expect("list").len(), 1);

    delete_connection(&conn, &issuer, &first.id).expect("delete");
    assert!(list_connections(&conn, &issuer).expect("list").is_empty());
    assert!(matches!(
        delete_connection(&conn, &issuer, &first.id),
        Err(IdentityError::NotFound(_))
    ));
}
