//! W3C proof objects attached to issued credentials.
//!
//! Both proof types carry the issuer's data at the time of issuance: the
//! state and roots, the auth claim and its inclusion proof, and the auth
//! claim's revocation status.

use crate::identities::get_auth_claim;
use crate::state::{StateRecord, StateSnapshot};
use crate::IdentityError;
use issuer_crypto::babyjubjub::{Point, PublicKey, Signature};
use issuer_crypto::claim::CoreClaim;
use issuer_crypto::{poseidon, CryptoError, Hash};
use issuer_merkle::{IdentityTrees, Proof};
use issuer_revocation::CredentialStatus;
use issuer_types::Did;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

pub const BJJ_SIGNATURE_PROOF: &str = "BJJSignature2021";
pub const SMT_PROOF: &str = "Iden3SparseMerkleTreeProof";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerState {
    pub claims_tree_root: Hash,
    pub revocation_tree_root: Hash,
    pub root_of_roots: Hash,
    pub value: Hash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<u64>,
}

impl From<&StateSnapshot> for IssuerState {
    fn from(s: &StateSnapshot) -> Self {
        Self {
            claims_tree_root: s.roots.claims,
            revocation_tree_root: s.roots.revocations,
            root_of_roots: s.roots.roots,
            value: s.state,
            tx_id: None,
            block_number: None,
            block_timestamp: None,
        }
    }
}

impl From<&StateRecord> for IssuerState {
    fn from(record: &StateRecord) -> Self {
        Self {
            tx_id: record.tx_id.clone(),
            block_number: record.block_number,
            ..Self::from(&record.current)
        }
    }
}

impl IssuerState {
    /// Whether `value` is the Poseidon hash of the three listed roots.
    ///
    /// # Errors
    ///
    /// Hashing failures.
    pub fn is_consistent(&self) -> Result<bool, CryptoError> {
        Ok(poseidon::hash(&[
            self.claims_tree_root,
            self.revocation_tree_root,
            self.root_of_roots,
        ])? == self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerData {
    pub id: Did,
    pub state: IssuerState,
    /// Hex of the issuer's auth core claim.
    pub auth_core_claim: String,
    /// Inclusion of the auth claim in `state.claims_tree_root`.
    pub mtp: Proof,
    pub credential_status: CredentialStatus,
}

impl IssuerData {
    /// The Baby Jubjub key held in the auth claim's index slots.
    ///
    /// # Errors
    ///
    /// [`IdentityError::Crypto`] for an undecodable claim or a point off
    /// the curve.
    pub fn auth_key(&self) -> Result<PublicKey, IdentityError> {
        let claim = decode_claim(&self.auth_core_claim)?;
        let (x, y) = claim.index_data()?;
        let point = Point {
            x: x.to_fr(),
            y: y.to_fr(),
        };
        if !point.is_on_curve() {
            return Err(CryptoError::InvalidPoint.into());
        }
        Ok(PublicKey(point))
    }
}

/// Issuer data at a recorded state, with the auth claim's inclusion proof
/// taken against that state's claims root.
///
/// # Errors
///
/// [`IdentityError::NotFound`] for an unknown identity, tree errors when the
/// state's claims root is not stored.
pub fn issuer_data(conn: &Connection, record: &StateRecord) -> Result<IssuerData, IdentityError> {
    let did = record.identifier;
    let auth = get_auth_claim(conn, &did)?;
    let trees = IdentityTrees::open(conn, &did.to_string())?;
    let (mtp, _) = trees.claims.generate_proof(
        &auth.core_claim.hash_index()?,
        Some(&record.current.roots.claims),
    )?;
    Ok(IssuerData {
        id: did,
        state: IssuerState::from(record),
        auth_core_claim: auth.core_claim.to_hex(),
        mtp,
        credential_status: auth.credential_status,
    })
}

fn decode_claim(hex_claim: &str) -> Result<CoreClaim, IdentityError> {
    let bytes =
        hex::decode(hex_claim).map_err(|e| CryptoError::InvalidClaim(format!("core claim hex: {e}")))?;
    Ok(CoreClaim::from_bytes(&bytes)?)
}

/// `BJJSignature2021`: the issuer's auth key signed the claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureProof {
    #[serde(rename = "type")]
    pub proof_type: String,
    pub issuer_data: IssuerData,
    pub core_claim: String,
    /// Hex of the 64-byte compressed signature.
    pub signature: String,
}

impl SignatureProof {
    pub fn new(issuer_data: IssuerData, claim: &CoreClaim, signature: &Signature) -> Self {
        Self {
            proof_type: BJJ_SIGNATURE_PROOF.to_string(),
            issuer_data,
            core_claim: claim.to_hex(),
            signature: hex::encode(signature.compress()),
        }
    }

    /// Checks the signature over the claim against the issuer's auth key
    /// and the auth claim against the issuer state.
    ///
    /// # Errors
    ///
    /// [`IdentityError::Crypto`] when either check fails.
    pub fn verify(&self) -> Result<(), IdentityError> {
        let claim = decode_claim(&self.core_claim)?;
        let sig_bytes =
            hex::decode(&self.signature).map_err(|_| CryptoError::InvalidSignature)?;
        let signature = Signature::decompress(&sig_bytes)?;
        self.issuer_data
            .auth_key()?
            .verify_poseidon(&claim.signing_hash()?.to_fr(), &signature)?;

        let auth = decode_claim(&self.issuer_data.auth_core_claim)?;
        let (hi, hv) = auth.hi_hv()?;
        if !self
            .issuer_data
            .mtp
            .verify(&self.issuer_data.state.claims_tree_root, &hi, &hv)?
            || !self.issuer_data.mtp.existence
        {
            return Err(CryptoError::InvalidClaim("auth claim not in issuer claims tree".into()).into());
        }
        Ok(())
    }
}

/// `Iden3SparseMerkleTreeProof`: the claim is a leaf of a published claims
/// tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtpProof {
    #[serde(rename = "type")]
    pub proof_type: String,
    pub issuer_data: IssuerData,
    pub core_claim: String,
    pub mtp: Proof,
}

impl MtpProof {
    pub fn new(issuer_data: IssuerData, claim: &CoreClaim, mtp: Proof) -> Self {
        Self {
            proof_type: SMT_PROOF.to_string(),
            issuer_data,
            core_claim: claim.to_hex(),
            mtp,
        }
    }

    /// Checks the claim leaf against the listed claims root and the state
    /// against its roots.
    ///
    /// # Errors
    ///
    /// [`IdentityError::Crypto`] when either check fails.
    pub fn verify(&self) -> Result<(), IdentityError> {
        let claim = decode_claim(&self.core_claim)?;
        let (hi, hv) = claim.hi_hv()?;
        let state = &self.issuer_data.state;
        if !self.mtp.existence || !self.mtp.verify(&state.claims_tree_root, &hi, &hv)? {
            return Err(CryptoError::InvalidClaim("claim not in issuer claims tree".into()).into());
        }
        if !state.is_consistent()? {
            return Err(CryptoError::InvalidClaim("issuer state does not match its roots".into()).into());
        }
        Ok(())
    }
}
