//! Shared types, error kinds, and constants for the issuer node.
//!
//! This crate is the leaf of the workspace. It holds the decentralized
//! identifier model, the status enums that are persisted as text, the
//! protocol constants shared by the tree store, the publisher and the
//! iden3comm layer, and the [`ErrorKind`] taxonomy every crate maps its
//! errors onto.
//!
//! Nothing in here performs I/O or field arithmetic. Higher crates depend
//! downward only, which keeps identity, claims and merkle code free of
//! cycles.

mod did;

pub use did::{Blockchain, Did, DidError, DidMethod, NetworkId, ID_LENGTH};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum number of levels of every identity Merkle tree.
pub const MAX_MERKLE_DEPTH: usize = 40;

/// Number of levels of the on-chain global identity state tree.
pub const GIST_DEPTH: usize = 64;

/// Maximum number of nodes pushed to a reverse hash service per request.
pub const MAX_RHS_BATCH: usize = 128;

/// How long a replaced GIST root is still accepted, in seconds.
pub const STATE_REPLACEMENT_TOLERANCE_SECS: u64 = 15 * 60;

/// Default lifetime of a QR-store entry, in seconds.
pub const DEFAULT_QR_TTL_SECS: u64 = 100;

/// Default lifetime of an authorization session, in seconds.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 5 * 60;

/// Schema hash of the Baby Jubjub authentication claim.
pub const AUTH_BJJ_SCHEMA_HEX: &str = "ca938857241db9451ea329256b9c06e5";

/// Iden3comm media types.
pub mod media_type {
    /// Unauthenticated JSON message.
    pub const PLAIN: &str = "application/iden3comm-plain-json";
    /// JWS signed message.
    pub const SIGNED: &str = "application/iden3comm-signed-json";
    /// JWZ message carrying a Groth16 proof.
    pub const ZKP: &str = "application/iden3-zkp-json";
}

/// Iden3comm protocol message types.
pub mod message_type {
    pub const AUTHORIZATION_REQUEST: &str =
        "https://iden3-communication.io/authorization/1.0/request";
    pub const AUTHORIZATION_RESPONSE: &str =
        "https://iden3-communication.io/authorization/1.0/response";
    pub const CREDENTIAL_OFFER: &str = "https://iden3-communication.io/credentials/1.0/offer";
    pub const CREDENTIAL_FETCH_REQUEST: &str =
        "https://iden3-communication.io/credentials/1.0/fetch-request";
    pub const CREDENTIAL_ISSUANCE_RESPONSE: &str =
        "https://iden3-communication.io/credentials/1.0/issuance-response";
    pub const REVOCATION_STATUS_REQUEST: &str =
        "https://iden3-communication.io/revocation/1.0/request-status";
    pub const REVOCATION_STATUS_RESPONSE: &str =
        "https://iden3-communication.io/revocation/1.0/status";
}

/// Machine-readable error categories surfaced to callers.
///
/// Every crate error maps onto exactly one kind; the HTTP layer renders the
/// kind's [`code`](ErrorKind::code) next to a single human message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed input, missing proof type, bad DID, invalid sort key.
    InvalidRequest,
    /// Unknown DID, claim, connection, link, session or schema.
    NotFound,
    /// Duplicate nonce, in-flight transition, link state clash.
    Conflict,
    /// Schema validation or fetch failure.
    SchemaError,
    /// Signature mismatch, malformed proof, failed proof generation.
    CryptoError,
    /// Unknown or stale on-chain root, reverted transition.
    StateError,
    /// Transient KMS, database, RPC or IPFS failure.
    BackendError,
    /// Authentication failure.
    Unauthorized,
}

impl ErrorKind {
    /// Returns the stable code string for this kind.
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::SchemaError => "SCHEMA_ERROR",
            Self::CryptoError => "CRYPTO_ERROR",
            Self::StateError => "STATE_ERROR",
            Self::BackendError => "BACKEND_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }

    /// Whether an operation failing with this kind may succeed on retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::BackendError)
    }
}

/// The three trees every identity owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TreeKind {
    /// Issued claims, keyed by `hash_index`.
    Claims = 0,
    /// Revocation nonces.
    Revocations = 1,
    /// Historical claims-tree roots.
    Roots = 2,
}

impl TreeKind {
    /// All kinds, in state-hash order.
    pub const ALL: [TreeKind; 3] = [Self::Claims, Self::Revocations, Self::Roots];

    /// Returns the numeric code stored in the database.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts a stored code back into a kind.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Claims),
            1 => Some(Self::Revocations),
            2 => Some(Self::Roots),
            _ => None,
        }
    }

    /// Returns the label used in logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::Claims => "claims",
            Self::Revocations => "revocations",
            Self::Roots => "roots",
        }
    }
}

/// Returned when a persisted enum string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: {value}")]
pub struct ParseEnumError {
    /// Name of the enum being parsed.
    pub what: &'static str,
    /// The rejected input.
    pub value: String,
}

/// Lifecycle of an identity state transition.
///
/// ```text
/// Created ──submit──▶ Transacted ──mined──▶ Confirmed
///    │                       │
///    └───────────────────────┴──reverted/timeout──▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStateStatus {
    Created,
    Transacted,
    Confirmed,
    Failed,
}

impl IdentityStateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Transacted => "transacted",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    /// Whether a row with this status blocks planning another transition.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Created | Self::Transacted)
    }
}

impl fmt::Display for IdentityStateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityStateStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "transacted" => Ok(Self::Transacted),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError {
                what: "identity state status",
                value: other.to_string(),
            }),
        }
    }
}

/// Where relying parties look up whether a credential was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RevocationStatusMode {
    /// Ask the issuer's agent endpoint.
    #[default]
    Direct,
    /// Walk the off-chain reverse hash service.
    OffChain,
    /// Walk the on-chain identity tree store.
    OnChain,
}

impl RevocationStatusMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::OffChain => "off_chain",
            Self::OnChain => "on_chain",
        }
    }

    /// The `credentialStatus.type` emitted for this mode.
    pub fn status_type(self) -> &'static str {
        match self {
            Self::Direct => "Iden3commRevocationStatusV1.0",
            Self::OffChain => "Iden3ReverseSparseMerkleTreeProof",
            Self::OnChain => "Iden3OnchainSparseMerkleTreeProof2023",
        }
    }
}

impl FromStr for RevocationStatusMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" | "Iden3commRevocationStatusV1.0" => Ok(Self::Direct),
            "off_chain" | "Iden3ReverseSparseMerkleTreeProof" => Ok(Self::OffChain),
            "on_chain" | "Iden3OnchainSparseMerkleTreeProof2023" => Ok(Self::OnChain),
            other => Err(ParseEnumError {
                what: "revocation status mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Key algorithms held by the KMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    /// Baby Jubjub, for claim and message signatures.
    BabyJubjub,
    /// secp256k1, for blockchain transactions.
    Secp256k1,
}

impl KeyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BabyJubjub => "BJJ",
            Self::Secp256k1 => "ETH",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BJJ" => Ok(Self::BabyJubjub),
            "ETH" => Ok(Self::Secp256k1),
            other => Err(ParseEnumError {
                what: "key kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Which proofs a claim is issued with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProofTypes {
    /// Attach a `BJJSignature2021` proof.
    pub signature: bool,
    /// Insert into the claims tree and attach an MTP after publication.
    pub mtp: bool,
}

impl ProofTypes {
    /// At least one proof type must be requested.
    pub fn is_empty(&self) -> bool {
        !self.signature && !self.mtp
    }
}
