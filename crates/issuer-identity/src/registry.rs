//! Identity creation and lookup.

use crate::identities::{get_auth_claim, insert_identity, AuthClaim};
use crate::proofs::{issuer_data, MtpProof};
use crate::state::{get_state, insert_state, StateSnapshot};
use crate::{get_identity, list_identities, Identity, IdentityError};
use issuer_crypto::claim::CoreClaim;
use issuer_crypto::Hash;
use issuer_db::DbPool;
use issuer_kms::{KeyId, KeyProvider, Kms};
use issuer_merkle::{register_trees, IdentityTrees, MemoryStorage, MerkleTree, TreeRoots};
use issuer_observe::{emit_event, EventBus, EventPayload};
use issuer_revocation::{CredentialStatus, StatusBuilder};
use issuer_types::{
    Blockchain, Did, DidMethod, IdentityStateStatus, KeyKind, NetworkId, AUTH_BJJ_SCHEMA_HEX,
    MAX_MERKLE_DEPTH,
};
use rusqlite::{params, Connection};
use serde_json::json;

pub const AUTH_SCHEMA_URL: &str = "https://schema.iden3.io/core/json/auth.json";
pub const AUTH_SCHEMA_CONTEXT: &str = "https://schema.iden3.io/core/jsonld/auth.jsonld";
pub const AUTH_SCHEMA_TYPE: &str = "AuthBJJCredential";

/// Creates issuer identities and answers questions about them.
#[derive(Clone)]
pub struct IdentityRegistry {
    pool: DbPool,
    kms: Kms,
    events: EventBus,
    status: StatusBuilder,
}

struct Genesis {
    did: Did,
    snapshot: StateSnapshot,
    auth_claim: CoreClaim,
    auth_claim_id: String,
    status: CredentialStatus,
}

impl IdentityRegistry {
    pub fn new(pool: DbPool, kms: Kms, events: EventBus, status: StatusBuilder) -> Self {
        Self {
            pool,
            kms,
            events,
            status,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn kms(&self) -> &Kms {
        &self.kms
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn status_builder(&self) -> &StatusBuilder {
        &self.status
    }

    /// Runs `f` on a pooled connection off the async runtime.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T, IdentityError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, IdentityError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }

    /// Mints a new identity.
    ///
    /// Keys come first, then the genesis state is computed off-database to
    /// learn the DID. Both keys are linked to the DID before anything is
    /// written; trees, the identity row with the linked key ids, the
    /// confirmed genesis state and the auth claim then go in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// KMS, database and hashing failures. Nothing is persisted on error;
    /// keys created before a failure stay in the KMS unused.
    pub async fn create(
        &self,
        method: DidMethod,
        blockchain: Blockchain,
        network: NetworkId,
    ) -> Result<Identity, IdentityError> {
        let auth_key = self.kms.create(KeyKind::BabyJubjub).await?;
        let eth_key = self.kms.create(KeyKind::Secp256k1).await?;
        let public = self.kms.bjj_public(&auth_key).await?;

        let auth_claim = CoreClaim::auth_bjj(&public, rand::random());
        let (hi, hv) = auth_claim.hi_hv()?;
        let mut scratch = MerkleTree::with_levels(MemoryStorage::new(), MAX_MERKLE_DEPTH);
        scratch.add(&hi, &hv)?;
        let snapshot = StateSnapshot::from_roots(TreeRoots {
            claims: scratch.root()?,
            ..TreeRoots::default()
        })?;
        let did = Did::from_genesis_state(method, blockchain, network, snapshot.state.as_le_bytes())?;
        let status = self.status.credential_status(
            &did,
            auth_claim.revocation_nonce(),
            Some(&snapshot.state),
            None,
        )?;

        let auth_key = self.link(&auth_key, &did).await?;
        let eth_key = self.link(&eth_key, &did).await?;

        let genesis = Genesis {
            did,
            snapshot,
            auth_claim,
            auth_claim_id: uuid::Uuid::new_v4().to_string(),
            status,
        };
        let event = self
            .blocking(move |conn| persist_genesis(conn, &genesis, &auth_key, &eth_key))
            .await?;
        self.events.publish(event);
        tracing::info!(did = %did, state = %snapshot.state, "created identity");
        self.get_by_did(&did).await
    }

    async fn link(&self, key: &KeyId, did: &Did) -> Result<KeyId, IdentityError> {
        self.kms.link(key, did).await.map_err(|e| {
            tracing::warn!(did = %did, key = %key, "failed to link key: {}", e);
            IdentityError::from(e)
        })
    }

    /// # Errors
    ///
    /// [`IdentityError::NotFound`] for an unknown DID.
    pub async fn get_by_did(&self, did: &Did) -> Result<Identity, IdentityError> {
        let did = *did;
        self.blocking(move |conn| get_identity(conn, &did)).await
    }

    /// # Errors
    ///
    /// Database errors.
    pub async fn list(&self) -> Result<Vec<Identity>, IdentityError> {
        self.blocking(|conn| list_identities(conn)).await
    }

    /// # Errors
    ///
    /// [`IdentityError::NotFound`] for an unknown DID.
    pub async fn auth_claim(&self, did: &Did) -> Result<AuthClaim, IdentityError> {
        let did = *did;
        self.blocking(move |conn| get_auth_claim(conn, &did)).await
    }
}

fn persist_genesis(
    conn: &mut Connection,
    genesis: &Genesis,
    auth_key: &KeyId,
    eth_key: &KeyId,
) -> Result<issuer_observe::IssuerEvent, IdentityError> {
    let did = &genesis.did;
    let identifier = did.to_string();
    let tx = conn.transaction()?;

    insert_identity(&tx, did, auth_key, Some(eth_key), &genesis.auth_claim_id)?;
    register_trees(&tx, &identifier)?;
    let (hi, hv) = genesis.auth_claim.hi_hv()?;
    let roots = {
        let mut trees = IdentityTrees::open(&tx, &identifier)?;
        trees.claims.add(&hi, &hv)?;
        trees.roots()?
    };
    if roots != genesis.snapshot.roots {
        return Err(IdentityError::Corrupt(format!(
            "genesis roots of {identifier} differ from the precomputed state"
        )));
    }

    let state_id = insert_state(&tx, did, None, &genesis.snapshot, IdentityStateStatus::Confirmed)?;
    let record = get_state(&tx, state_id)?;
    insert_auth_claim(&tx, genesis)?;
    // Issuer data reads the auth claim back, so the row must exist first.
    let data = issuer_data(&tx, &record)?;
    let mtp = data.mtp.clone();
    let proof = MtpProof::new(data, &genesis.auth_claim, mtp);
    tx.execute(
        "UPDATE claims SET mtp_proof = ?2 WHERE id = ?1",
        params![genesis.auth_claim_id, serde_json::to_string(&proof)?],
    )?;

    let event = emit_event(
        &tx,
        &identifier,
        &identifier,
        &EventPayload::CreateIdentity {
            state: genesis.snapshot.state.to_decimal(),
        },
    )?;
    tx.commit()?;
    Ok(event)
}

fn insert_auth_claim(conn: &Connection, genesis: &Genesis) -> Result<(), IdentityError> {
    let claim = &genesis.auth_claim;
    let (x, y) = claim.index_data()?;
    let subject = json!({
        "type": AUTH_SCHEMA_TYPE,
        "x": x.to_decimal(),
        "y": y.to_decimal(),
    });
    let hash_index: Hash = claim.hash_index()?;
    conn.execute(
        "INSERT INTO claims
            (id, issuer, schema_url, schema_type, schema_hash, ld_context, rev_nonce,
             core_claim, hash_index, identity_state, mtp, credential_status,
             credential_subject, search_text)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?12, ?13)",
        params![
            genesis.auth_claim_id,
            genesis.did.to_string(),
            AUTH_SCHEMA_URL,
            AUTH_SCHEMA_TYPE,
            AUTH_BJJ_SCHEMA_HEX,
            AUTH_SCHEMA_CONTEXT,
            claim.revocation_nonce() as i64,
            claim.to_bytes().to_vec(),
            hash_index.to_decimal(),
            genesis.snapshot.state.hex(),
            serde_json::to_string(&genesis.status)?,
            subject.to_string(),
            AUTH_SCHEMA_TYPE.to_lowercase(),
        ],
    )?;
    Ok(())
}
