use crate::StateError;
use issuer_crypto::Hash;
use issuer_identity::state::last_confirmed;
use issuer_merkle::{IdentityTrees, NodeAux};
use issuer_types::Did;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Issuer roots a revocation proof is taken against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusIssuer {
    pub state: Hash,
    pub claims_tree_root: Hash,
    pub revocation_tree_root: Hash,
    pub root_of_roots: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusProof {
    pub existence: bool,
    pub siblings: Vec<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_aux: Option<NodeAux>,
}

/// Answer to a revocation status query: `existence` is `true` when the
/// nonce is revoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationStatus {
    pub issuer: StatusIssuer,
    pub mtp: StatusProof,
}

/// Proof of `nonce` in the revocations tree at the last confirmed state.
/// Revocations that are not yet published read as not revoked.
///
/// # Errors
///
/// [`StateError::Identity`] for an unknown identity, tree errors.
pub fn revocation_status(conn: &Connection, did: &Did, nonce: u64) -> Result<RevocationStatus, StateError> {
    let confirmed = last_confirmed(conn, did)?;
    let trees = IdentityTrees::open(conn, &did.to_string())?;
    let roots = confirmed.current.roots;
    let (proof, _) = trees
        .revocations
        .generate_proof(&Hash::from_u64(nonce), Some(&roots.revocations))?;
    Ok(RevocationStatus {
        issuer: StatusIssuer {
            state: confirmed.current.state,
            claims_tree_root: roots.claims,
            revocation_tree_root: roots.revocations,
            root_of_roots: roots.roots,
        },
        mtp: StatusProof {
            existence: proof.existence,
            siblings: proof.siblings,
            node_aux: proof.node_aux,
        },
    })
}
