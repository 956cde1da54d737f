//! Transition planning and state transition proofs.

use crate::status::{revocation_status, RevocationStatus};
use crate::StateError;
use issuer_claims::store::tag_pending_mtp;
use issuer_crypto::babyjubjub::Signature;
use issuer_crypto::claim::CoreClaim;
use issuer_crypto::prover::Prover;
use issuer_crypto::zk::{CircuitId, ZkProof};
use issuer_crypto::{poseidon, Hash};
use issuer_identity::state::{get_state, in_flight, insert_state, last_confirmed};
use issuer_identity::{get_auth_claim, get_identity, IdentityRegistry, StateRecord, StateSnapshot};
use issuer_merkle::{IdentityLocks, IdentityTrees, MerkleError, Proof};
use issuer_types::{Did, IdentityStateStatus, MAX_MERKLE_DEPTH};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::sync::Arc;

/// A planned transition with its proof, ready for `transitState`.
#[derive(Debug, Clone)]
pub struct TransitionPlan {
    pub record: StateRecord,
    pub old_state: Hash,
    pub new_state: Hash,
    pub is_old_state_genesis: bool,
    pub proof: ZkProof,
}

/// Plans transitions under the identity lock and proves them.
#[derive(Clone)]
pub struct TransitionEngine {
    registry: IdentityRegistry,
    locks: IdentityLocks,
    prover: Arc<dyn Prover>,
}

impl TransitionEngine {
    /// `locks` must be the set the claim service writes under.
    pub fn new(registry: IdentityRegistry, locks: IdentityLocks, prover: Arc<dyn Prover>) -> Self {
        Self {
            registry,
            locks,
            prover,
        }
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn prover(&self) -> &Arc<dyn Prover> {
        &self.prover
    }

    /// Auth claim proofs at the last confirmed state.
    ///
    /// # Errors
    ///
    /// [`StateError::Identity`] for an unknown identity, tree errors.
    pub async fn auth_witness(&self, did: &Did) -> Result<AuthWitness, StateError> {
        let did = *did;
        self.blocking(move |conn| {
            let confirmed = last_confirmed(conn, &did)?;
            auth_witness(conn, &did, &confirmed.current)
        })
        .await
    }

    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T, StateError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StateError> + Send + 'static,
    {
        let pool = self.registry.pool().clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }

    /// Records a `created` transition from the last confirmed state to the
    /// current roots, or returns `None` when nothing changed.
    ///
    /// A changed claims root is first added to the roots tree. Claims
    /// waiting for an inclusion proof are tagged with the new state.
    ///
    /// # Errors
    ///
    /// [`StateError::TransitionInFlight`] while another transition of the
    /// identity is `created` or `transacted`.
    pub async fn plan(&self, did: &Did) -> Result<Option<StateRecord>, StateError> {
        let _guard = self.locks.lock(&did.to_string()).await;
        let did = *did;
        let planned = self.blocking(move |conn| plan_transition(conn, &did)).await?;
        if let Some(record) = &planned {
            tracing::info!(
                did = %did,
                id = record.id,
                state = %record.current.state,
                "planned state transition"
            );
        }
        Ok(planned)
    }

    /// Builds the `stateTransition` witness for `record` and proves it.
    ///
    /// The auth claim proofs are taken at the old roots and the old and
    /// new states are signed with the identity's auth key.
    ///
    /// # Errors
    ///
    /// [`StateError::Genesis`] for a genesis row, KMS and prover failures.
    pub async fn prove(&self, record: &StateRecord) -> Result<ZkProof, StateError> {
        let previous = record.previous.ok_or(StateError::Genesis(record.id))?;
        let did = record.identifier;
        let witness = self
            .blocking(move |conn| auth_witness(conn, &did, &previous))
            .await?;

        let message = poseidon::hash(&[previous.state, record.current.state])?;
        let signature = self
            .registry
            .kms()
            .sign_bjj(&witness.auth_key, &message)
            .await?;
        let inputs = state_transition_inputs(record, &previous, &witness, &signature)?;

        let started = std::time::Instant::now();
        let proof = self.prover.prove(CircuitId::StateTransition, &inputs).await?;
        tracing::debug!(
            did = %did,
            state = %record.current.state,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "proved state transition"
        );
        Ok(proof)
    }

    /// [`plan`](Self::plan) followed by [`prove`](Self::prove).
    ///
    /// # Errors
    ///
    /// As for `plan` and `prove`. A planned row stays `created` when
    /// proving fails.
    pub async fn compute_transition(&self, did: &Did) -> Result<Option<TransitionPlan>, StateError> {
        let Some(record) = self.plan(did).await? else {
            return Ok(None);
        };
        let proof = self.prove(&record).await?;
        let old_state = record
            .previous
            .map(|p| p.state)
            .ok_or(StateError::Genesis(record.id))?;
        Ok(Some(TransitionPlan {
            old_state,
            new_state: record.current.state,
            is_old_state_genesis: record.is_old_state_genesis(),
            record,
            proof,
        }))
    }

    /// Non-revocation proof of `nonce` at the last confirmed state.
    ///
    /// # Errors
    ///
    /// [`StateError::Identity`] with `NotFound` for an unknown identity.
    pub async fn revocation_status(&self, did: &Did, nonce: u64) -> Result<RevocationStatus, StateError> {
        let did = *did;
        self.blocking(move |conn| revocation_status(conn, &did, nonce))
            .await
    }
}

fn plan_transition(conn: &mut Connection, did: &Did) -> Result<Option<StateRecord>, StateError> {
    let tx = conn.transaction()?;
    if in_flight(&tx, did)?.is_some() {
        return Err(StateError::TransitionInFlight(did.to_string()));
    }
    let prev = last_confirmed(&tx, did)?;
    let next = {
        let mut trees = IdentityTrees::open(&tx, &did.to_string())?;
        let claims_root = trees.claims.root()?;
        if claims_root != prev.current.roots.claims {
            match trees.roots.add(&claims_root, &Hash::ZERO) {
                Ok(_) | Err(MerkleError::KeyAlreadyExists) => {}
                Err(e) => return Err(e.into()),
            }
        }
        StateSnapshot::from_roots(trees.roots()?)?
    };
    if next.state == prev.current.state {
        return Ok(None);
    }

    let id = insert_state(&tx, did, Some(&prev.current), &next, IdentityStateStatus::Created)?;
    let tagged = tag_pending_mtp(&tx, did, &next.state.hex())?;
    let record = get_state(&tx, id)?;
    tx.commit()?;
    if tagged > 0 {
        tracing::debug!(did = %did, state = %next.state, tagged, "claims waiting on state");
    }
    Ok(Some(record))
}

/// The auth claim with its inclusion and non-revocation proofs at `state`.
#[derive(Debug, Clone)]
pub struct AuthWitness {
    pub auth_key: issuer_kms::KeyId,
    pub state: StateSnapshot,
    pub claim: CoreClaim,
    pub mtp: Proof,
    pub non_rev_mtp: Proof,
}

fn auth_witness(conn: &mut Connection, did: &Did, previous: &StateSnapshot) -> Result<AuthWitness, StateError> {
    let identity = get_identity(conn, did)?;
    let auth = get_auth_claim(conn, did)?;
    let trees = IdentityTrees::open(conn, &did.to_string())?;
    let (mtp, _) = trees
        .claims
        .generate_proof(&auth.core_claim.hash_index()?, Some(&previous.roots.claims))?;
    let (non_rev_mtp, _) = trees.revocations.generate_proof(
        &Hash::from_u64(auth.revocation_nonce()),
        Some(&previous.roots.revocations),
    )?;
    Ok(AuthWitness {
        auth_key: identity.auth_key,
        state: *previous,
        claim: auth.core_claim,
        mtp,
        non_rev_mtp,
    })
}

fn decimals(proof: &Proof) -> Vec<String> {
    proof
        .siblings_padded(MAX_MERKLE_DEPTH)
        .iter()
        .map(Hash::to_decimal)
        .collect()
}

fn state_transition_inputs(
    record: &StateRecord,
    previous: &StateSnapshot,
    witness: &AuthWitness,
    signature: &Signature,
) -> Result<Value, StateError> {
    let user_id = Hash::from_le_bytes(record.identifier.id_le_bytes())?;
    let (aux_hi, aux_hv, no_aux) = witness.non_rev_mtp.aux_values();
    let flag = |b: bool| if b { "1" } else { "0" };
    Ok(json!({
        "userID": user_id.to_decimal(),
        "oldUserState": previous.state.to_decimal(),
        "newUserState": record.current.state.to_decimal(),
        "isOldStateGenesis": flag(record.is_old_state_genesis()),
        "claimsTreeRoot": previous.roots.claims.to_decimal(),
        "authClaim": witness.claim.to_decimal_slots(),
        "authClaimMtp": decimals(&witness.mtp),
        "authClaimNonRevMtp": decimals(&witness.non_rev_mtp),
        "authClaimNonRevMtpNoAux": no_aux.to_decimal(),
        "authClaimNonRevMtpAuxHi": aux_hi.to_decimal(),
        "authClaimNonRevMtpAuxHv": aux_hv.to_decimal(),
        "revTreeRoot": previous.roots.revocations.to_decimal(),
        "rootsTreeRoot": previous.roots.roots.to_decimal(),
        "signatureR8x": Hash::from_fr(&signature.r8.x).to_decimal(),
        "signatureR8y": Hash::from_fr(&signature.r8.y).to_decimal(),
        "signatureS": signature.s_decimal(),
        "newClaimsTreeRoot": record.current.roots.claims.to_decimal(),
        "newRevTreeRoot": record.current.roots.revocations.to_decimal(),
        "newRootsTreeRoot": record.current.roots.roots.to_decimal(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use issuer_crypto::babyjubjub::PrivateKey;
    use issuer_merkle::{MemoryStorage, MerkleTree, TreeRoots};
    use issuer_types::{Blockchain, DidMethod, NetworkId};

    fn snapshot(claims: u64, revs: u64) -> StateSnapshot {
        StateSnapshot::from_roots(TreeRoots {
            claims: Hash::from_u64(claims),
            revocations: Hash::from_u64(revs),
            roots: Hash::ZERO,
        })
        .expect("state")
    }

    #[test]
    fn witness_lists_every_circuit_input() {
        let genesis = snapshot(1, 0);
        let next = snapshot(1, 2);
        let did = Did::from_genesis_state(
            DidMethod::PolygonId,
            Blockchain::Polygon,
            NetworkId::Amoy,
            genesis.state.as_le_bytes(),
        )
        .expect("did");
        let record = StateRecord {
            id: 2,
            identifier: did,
            previous: Some(genesis),
            current: next,
            is_genesis: false,
            status: IdentityStateStatus::Created,
            tx_id: None,
            block_number: None,
            error: None,
            rhs_published: false,
            created_at: String::new(),
            modified_at: String::new(),
        };

        let key = PrivateKey::generate();
        let claim = CoreClaim::auth_bjj(&key.public(), 9);
        let mut tree = MerkleTree::with_levels(MemoryStorage::new(), MAX_MERKLE_DEPTH);
        let (hi, hv) = claim.hi_hv().expect("hi hv");
        tree.add(&hi, &hv).expect("add");
        let (mtp, _) = tree.generate_proof(&hi, None).expect("proof");
        let (non_rev_mtp, _) = tree.generate_proof(&Hash::from_u64(9), None).expect("proof");
        let witness = AuthWitness {
            auth_key: issuer_kms::KeyId::new(issuer_types::KeyKind::BabyJubjub, "k"),
            state: genesis,
            claim,
            mtp,
            non_rev_mtp,
        };
        let message = poseidon::hash(&[genesis.state, next.state]).expect("hash");
        let signature = key.sign_poseidon(&message.to_fr()).expect("sign");

        let inputs = state_transition_inputs(&record, &genesis, &witness, &signature).expect("inputs");
        assert_eq!(inputs["isOldStateGenesis"], "1");
        assert_eq!(inputs["oldUserState"], genesis.state.to_decimal());
        assert_eq!(inputs["newRevTreeRoot"], "2");
        assert_eq!(inputs["revTreeRoot"], "0");
        assert_eq!(inputs["authClaim"].as_array().expect("slots").len(), 8);
        assert_eq!(
            inputs["authClaimMtp"].as_array().expect("siblings").len(),
            MAX_MERKLE_DEPTH
        );
        assert_eq!(inputs["authClaimNonRevMtpNoAux"], "0");
        assert_eq!(inputs["signatureS"], signature.s_decimal());
        assert_eq!(
            inputs["userID"],
            Hash::from_le_bytes(did.id_le_bytes()).expect("id").to_decimal()
        );
    }
}
