//! Groth16 proofs in snarkjs JSON form.
//!
//! Proofs produced by the native prover and proofs received inside JWZ
//! tokens share the [`ZkProof`] shape. Parsing validates every point for
//! curve and subgroup membership before it reaches the pairing check.

pub use ark_bn254::Bn254;
use ark_bn254::{Fq, Fq2, Fr};
pub use ark_bn254::{G1Affine, G2Affine};
use ark_ec::AffineRepr;
use ark_groth16::Groth16;
pub use ark_groth16::{Proof, VerifyingKey};
use ark_snark::SNARK;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZkError {
    #[error("json parse error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("field element parse error")]
    FieldElementError,
    #[error("point parse error")]
    PointError,
    #[error("verification failed")]
    VerificationFailed,
    #[error("snark error: {0}")]
    SnarkError(String),
    #[error("no verification key for circuit {0}")]
    UnknownCircuit(String),
    #[error("failed to read verification key: {0}")]
    KeyRead(#[from] std::io::Error),
}

/// Circuits the issuer proves or verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitId {
    #[serde(rename = "stateTransition")]
    StateTransition,
    #[serde(rename = "authV2")]
    AuthV2,
}

impl CircuitId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateTransition => "stateTransition",
            Self::AuthV2 => "authV2",
        }
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitId {
    type Err = ZkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stateTransition" => Ok(Self::StateTransition),
            "authV2" => Ok(Self::AuthV2),
            other => Err(ZkError::UnknownCircuit(other.to_string())),
        }
    }
}

/// The `proof.json` object written by snarkjs and rapidsnark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofData {
    pub pi_a: Vec<String>,
    pub pi_b: Vec<Vec<String>>,
    pub pi_c: Vec<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_curve")]
    pub curve: String,
}

fn default_protocol() -> String {
    "groth16".to_string()
}

fn default_curve() -> String {
    "bn128".to_string()
}

/// A proof together with its public signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkProof {
    pub proof: ProofData,
    pub pub_signals: Vec<String>,
}

#[derive(Deserialize)]
struct SnarkJsVKey {
    vk_alpha_1: Vec<String>,
    vk_beta_2: Vec<Vec<String>>,
    vk_gamma_2: Vec<Vec<String>>,
    vk_delta_2: Vec<Vec<String>>,
    #[serde(rename = "IC")]
    ic: Vec<Vec<String>>,
}

pub fn parse_fr(s: &str) -> Result<Fr, ZkError> {
    Fr::from_str(s).map_err(|_| ZkError::FieldElementError)
}

pub fn parse_fq(s: &str) -> Result<Fq, ZkError> {
    Fq::from_str(s).map_err(|_| ZkError::FieldElementError)
}

/// Validates that a G1 affine point lies on the BN254 curve and belongs
/// to the correct prime-order subgroup.
fn validate_g1(point: &G1Affine) -> Result<(), ZkError> {
    if point.is_zero() {
        return Ok(());
    }
    if !point.is_on_curve() {
        return Err(ZkError::PointError);
    }
    if !point.is_in_correct_subgroup_assuming_on_curve() {
        return Err(ZkError::PointError);
    }
    Ok(())
}

/// Validates that a G2 affine point lies on the BN254 twist curve and
/// belongs to the correct prime-order subgroup.
fn validate_g2(point: &G2Affine) -> Result<(), ZkError> {
    if point.is_zero() {
        return Ok(());
    }
    if !point.is_on_curve() {
        return Err(ZkError::PointError);
    }
    if !point.is_in_correct_subgroup_assuming_on_curve() {
        return Err(ZkError::PointError);
    }
    Ok(())
}

fn parse_g1(v: &[String]) -> Result<G1Affine, ZkError> {
    if v.len() < 2 {
        return Err(ZkError::PointError);
    }
    // snarkjs emits projective [x, y, z]; z == 0 is the point at infinity.
    if v.len() > 2 && v[2] == "0" {
        return Ok(G1Affine::zero());
    }
    let x = parse_fq(&v[0])?;
    let y = parse_fq(&v[1])?;
    let point = G1Affine::new_unchecked(x, y);
    validate_g1(&point)?;
    Ok(point)
}

fn parse_g2(v: &[Vec<String>]) -> Result<G2Affine, ZkError> {
    if v.len() < 2 {
        return Err(ZkError::PointError);
    }
    if v[0].len() < 2 || v[1].len() < 2 {
        return Err(ZkError::PointError);
    }
    // snarkjs: [[x_c0, x_c1], [y_c0, y_c1], ...]; arkworks Fq2 is c0 + c1*u.
    let x = Fq2::new(parse_fq(&v[0][0])?, parse_fq(&v[0][1])?);
    let y = Fq2::new(parse_fq(&v[1][0])?, parse_fq(&v[1][1])?);

    let point = G2Affine::new_unchecked(x, y);
    validate_g2(&point)?;
    Ok(point)
}

pub fn parse_proof(data: &ProofData) -> Result<Proof<Bn254>, ZkError> {
    let a = parse_g1(&data.pi_a)?;
    let b = parse_g2(&data.pi_b)?;
    let c = parse_g1(&data.pi_c)?;
    Ok(Proof { a, b, c })
}

pub fn parse_verification_key(json: &str) -> Result<VerifyingKey<Bn254>, ZkError> {
    let raw: SnarkJsVKey = serde_json::from_str(json)?;

    let alpha_g1 = parse_g1(&raw.vk_alpha_1)?;
    let beta_g2 = parse_g2(&raw.vk_beta_2)?;
    let gamma_g2 = parse_g2(&raw.vk_gamma_2)?;
    let delta_g2 = parse_g2(&raw.vk_delta_2)?;

    let mut gamma_abc_g1 = Vec::with_capacity(raw.ic.len());
    for p in raw.ic {
        gamma_abc_g1.push(parse_g1(&p)?);
    }

    Ok(VerifyingKey {
        alpha_g1,
        beta_g2,
        gamma_g2,
        delta_g2,
        gamma_abc_g1,
    })
}

pub fn parse_public_signals(signals: &[String]) -> Result<Vec<Fr>, ZkError> {
    signals.iter().map(|s| parse_fr(s)).collect()
}

pub fn verify_proof(
    vk: &VerifyingKey<Bn254>,
    proof: &Proof<Bn254>,
    public_inputs: &[Fr],
) -> Result<bool, ZkError> {
    Groth16::<Bn254>::verify(vk, public_inputs, proof)
        .map_err(|e| ZkError::SnarkError(e.to_string()))
}

/// Checks Groth16 proofs for a named circuit.
pub trait ProofVerifier: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ZkError::VerificationFailed`] when the proof does not verify.
    fn verify(&self, circuit: CircuitId, proof: &ZkProof) -> Result<(), ZkError>;
}

/// Verifier backed by snarkjs `verification_key.json` files.
#[derive(Default)]
pub struct Groth16Verifier {
    keys: HashMap<CircuitId, VerifyingKey<Bn254>>,
}

impl Groth16Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, circuit: CircuitId, key: VerifyingKey<Bn254>) -> Self {
        self.keys.insert(circuit, key);
        self
    }

    /// Loads `<dir>/<circuit>/verification_key.json` for each circuit.
    ///
    /// # Errors
    ///
    /// Returns [`ZkError::KeyRead`] or a parse error for a missing or
    /// malformed key.
    pub fn load(dir: &Path, circuits: &[CircuitId]) -> Result<Self, ZkError> {
        let mut verifier = Self::new();
        for circuit in circuits {
            let path = dir.join(circuit.as_str()).join("verification_key.json");
            let json = std::fs::read_to_string(&path)?;
            verifier.keys.insert(*circuit, parse_verification_key(&json)?);
            tracing::debug!(circuit = circuit.as_str(), path = %path.display(), "loaded verification key");
        }
        Ok(verifier)
    }
}

impl ProofVerifier for Groth16Verifier {
    fn verify(&self, circuit: CircuitId, proof: &ZkProof) -> Result<(), ZkError> {
        let vk = self
            .keys
            .get(&circuit)
            .ok_or_else(|| ZkError::UnknownCircuit(circuit.to_string()))?;
        let parsed = parse_proof(&proof.proof)?;
        let inputs = parse_public_signals(&proof.pub_signals)?;
        if verify_proof(vk, &parsed, &inputs)? {
            Ok(())
        } else {
            Err(ZkError::VerificationFailed)
        }
    }
}
