//! Cryptographic primitives shared by every issuer crate.
//!
//! - [`poseidon`]: circom-compatible Poseidon over BN254.
//! - [`Hash`]: a BN254 scalar in its little-endian wire form.
//! - [`babyjubjub`]: Baby Jubjub points and EdDSA-Poseidon signatures.
//! - [`claim`]: the 8-slot Iden3 core claim codec.
//! - [`zk`]: snarkjs Groth16 parsing and verification.
//! - [`prover`]: the proving seam and the native prover.

pub mod babyjubjub;
pub mod claim;
mod hash;
pub mod poseidon;
pub mod prover;
pub mod zk;

pub use ark_bn254::Fr;
pub use hash::Hash;

use issuer_types::ErrorKind;
use thiserror::Error;

/// Errors produced by hashing, curve arithmetic and claim encoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Poseidon initialization or hashing failed.
    #[error("poseidon error: {0}")]
    PoseidonError(String),
    /// A byte string or decimal is not a canonical BN254 scalar.
    #[error("invalid field element: {0}")]
    InvalidFieldElement(String),
    /// A compressed point does not decode to a curve point.
    #[error("invalid curve point")]
    InvalidPoint,
    /// A signature is malformed or does not verify.
    #[error("invalid signature")]
    InvalidSignature,
    /// A core claim is malformed.
    #[error("invalid claim: {0}")]
    InvalidClaim(String),
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::CryptoError
    }
}
