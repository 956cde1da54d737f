//! `application/iden3-zkp-json`: JWZ tokens carrying an authV2 proof.
//!
//! The proof's public signals are `[userID, challenge, gistRoot]`, where the
//! challenge is the signing digest of the token's header and payload.

use crate::state::{verify_gist_root, StateResolver};
use crate::token::{self, Compact};
use crate::PackerError;
use issuer_chain::GistProof;
use issuer_crypto::babyjubjub::Signature;
use issuer_crypto::zk::{CircuitId, ProofVerifier, ZkError, ZkProof};
use issuer_crypto::Hash;
use issuer_merkle::Proof;
use issuer_state::AuthWitness;
use issuer_types::{media_type, Did, MAX_MERKLE_DEPTH};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const ALG_GROTH16: &str = "groth16";

const CIRCUIT_ID_HEADER: &str = "circuitId";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwzHeader {
    pub alg: String,
    pub circuit_id: String,
    #[serde(default)]
    pub crit: Vec<String>,
    pub typ: String,
}

impl JwzHeader {
    pub fn auth_v2() -> Self {
        Self {
            alg: ALG_GROTH16.to_string(),
            circuit_id: CircuitId::AuthV2.as_str().to_string(),
            crit: vec![CIRCUIT_ID_HEADER.to_string()],
            typ: media_type::ZKP.to_string(),
        }
    }
}

/// A parsed, not yet verified, token.
#[derive(Debug, Clone)]
pub struct Jwz {
    pub header: JwzHeader,
    pub payload: Vec<u8>,
    pub proof: ZkProof,
    signing_input: String,
}

impl Jwz {
    /// # Errors
    ///
    /// [`PackerError::Malformed`] for a token that does not decode.
    pub fn parse(jwz: &str) -> Result<Self, PackerError> {
        let compact = Compact::split(jwz)?;
        Ok(Self {
            header: token::decode_json(compact.header, "jwz header")?,
            payload: token::decode(compact.payload, "jwz payload")?,
            proof: token::decode_json(compact.signature, "jwz proof")?,
            signing_input: compact.signing_input(),
        })
    }

    /// The digest the proof must commit to.
    ///
    /// # Errors
    ///
    /// Hashing failures.
    pub fn challenge(&self) -> Result<Hash, PackerError> {
        token::signing_digest(self.signing_input.as_bytes())
    }

    /// Checks the proof and its public signals and returns the proven
    /// `userID`.
    ///
    /// # Errors
    ///
    /// [`PackerError::UnsupportedAlgorithm`], [`PackerError::ProofRejected`],
    /// [`PackerError::ChallengeMismatch`] and the GIST root errors of
    /// [`check_gist_root`](crate::state::check_gist_root).
    pub async fn verify(
        &self,
        verifier: &dyn ProofVerifier,
        states: &dyn StateResolver,
    ) -> Result<Hash, PackerError> {
        if self.header.alg != ALG_GROTH16 {
            return Err(PackerError::UnsupportedAlgorithm(self.header.alg.clone()));
        }
        let circuit: CircuitId = self.header.circuit_id.parse()?;
        if circuit != CircuitId::AuthV2 {
            return Err(PackerError::UnsupportedAlgorithm(circuit.to_string()));
        }
        if !self.header.crit.iter().any(|c| c == CIRCUIT_ID_HEADER) {
            return Err(PackerError::Malformed("circuitId must be critical".into()));
        }

        let [user_id, challenge, gist_root] = match self.proof.pub_signals.as_slice() {
            [a, b, c, ..] => [a, b, c].map(|s| Hash::from_decimal(s)),
            _ => return Err(PackerError::MalformedProof("authV2 needs three public signals".into())),
        };
        let (user_id, challenge, gist_root) = (
            user_id.map_err(|e| PackerError::MalformedProof(e.to_string()))?,
            challenge.map_err(|e| PackerError::MalformedProof(e.to_string()))?,
            gist_root.map_err(|e| PackerError::MalformedProof(e.to_string()))?,
        );
        if challenge != self.challenge()? {
            return Err(PackerError::ChallengeMismatch);
        }

        verifier.verify(circuit, &self.proof).map_err(|e| match e {
            ZkError::VerificationFailed => PackerError::ProofRejected(circuit.to_string()),
            other => PackerError::Zk(other),
        })?;
        verify_gist_root(states, &gist_root).await?;
        Ok(user_id)
    }
}

pub(crate) fn compact(header: &JwzHeader, payload: &[u8], proof: &ZkProof) -> Result<String, PackerError> {
    let input = token::signing_input(header, payload)?;
    Ok(format!("{input}.{}", token::encode(serde_json::to_vec(proof)?)))
}

/// `userID` as the circuit encodes it.
pub fn user_id(did: &Did) -> Result<Hash, PackerError> {
    Ok(Hash::from_le_bytes(did.id_le_bytes())?)
}

fn decimals(proof: &Proof, levels: usize) -> Vec<String> {
    proof.siblings_padded(levels).iter().map(Hash::to_decimal).collect()
}

/// Inputs of the authV2 circuit for `did` proving knowledge of its auth
/// key at its last confirmed state.
pub(crate) fn auth_v2_inputs(
    did: &Did,
    witness: &AuthWitness,
    challenge: &Hash,
    signature: &Signature,
    gist: &GistProof,
) -> Result<Value, PackerError> {
    let roots = witness.state.roots;
    let (aux_hi, aux_hv, no_aux) = witness.non_rev_mtp.aux_values();
    let (gist_aux_hi, gist_aux_hv, gist_no_aux) = if gist.existence {
        (Hash::ZERO, Hash::ZERO, Hash::ZERO)
    } else if gist.aux_existence {
        (gist.aux_index, gist.aux_value, Hash::ZERO)
    } else {
        (Hash::ZERO, Hash::ZERO, Hash::from_u64(1))
    };
    Ok(json!({
        "genesisID": user_id(did)?.to_decimal(),
        "profileNonce": "0",
        "state": witness.state.state.to_decimal(),
        "claimsTreeRoot": roots.claims.to_decimal(),
        "revTreeRoot": roots.revocations.to_decimal(),
        "rootsTreeRoot": roots.roots.to_decimal(),
        "authClaim": witness.claim.to_decimal_slots(),
        "authClaimIncMtp": decimals(&witness.mtp, MAX_MERKLE_DEPTH),
        "authClaimNonRevMtp": decimals(&witness.non_rev_mtp, MAX_MERKLE_DEPTH),
        "authClaimNonRevMtpNoAux": no_aux.to_decimal(),
        "authClaimNonRevMtpAuxHi": aux_hi.to_decimal(),
        "authClaimNonRevMtpAuxHv": aux_hv.to_decimal(),
        "challenge": challenge.to_decimal(),
        "challengeSignatureR8x": Hash::from_fr(&signature.r8.x).to_decimal(),
        "challengeSignatureR8y": Hash::from_fr(&signature.r8.y).to_decimal(),
        "challengeSignatureS": signature.s_decimal(),
        "gistRoot": gist.root.to_decimal(),
        "gistMtp": gist.siblings.iter().map(Hash::to_decimal).collect::<Vec<_>>(),
        "gistMtpAuxHi": gist_aux_hi.to_decimal(),
        "gistMtpAuxHv": gist_aux_hv.to_decimal(),
        "gistMtpNoAux": gist_no_aux.to_decimal(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use issuer_crypto::zk::ProofData;

    fn token(signals: Vec<String>) -> String {
        let proof = ZkProof {
            proof: ProofData {
                pi_a: vec!["1".into(), "2".into(), "1".into()],
                pi_b: vec![vec!["1".into(), "2".into()], vec!["3".into(), "4".into()], vec!["1".into(), "0".into()]],
                pi_c: vec!["1".into(), "2".into(), "1".into()],
                protocol: "groth16".into(),
                curve: "bn128".into(),
            },
            pub_signals: signals,
        };
        compact(&JwzHeader::auth_v2(), br#"{"id":"1","type":"t"}"#, &proof).expect("compact")
    }

    #[test]
    fn header_names_the_circuit() {
        let json = serde_json::to_value(JwzHeader::auth_v2()).expect("json");
        assert_eq!(json["alg"], "groth16");
        assert_eq!(json["circuitId"], "authV2");
        assert_eq!(json["crit"][0], "circuitId");
        assert_eq!(json["typ"], "application/iden3-zkp-json");
    }

    #[test]
    fn parse_recovers_payload_and_signals() {
        let jwz = Jwz::parse(&token(vec!["1".into(), "2".into(), "3".into()])).expect("parse");
        assert_eq!(jwz.payload, br#"{"id":"1","type":"t"}"#);
        assert_eq!(jwz.proof.pub_signals.len(), 3);
        assert_ne!(jwz.challenge().expect("challenge"), Hash::ZERO);
        assert!(Jwz::parse("not-a-token").is_err());
    }
}
