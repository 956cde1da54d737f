//! Revocation status for issued credentials.
//!
//! Two halves:
//!
//! - [`StatusBuilder`] decides where relying parties check a credential's
//!   revocation: the issuer's agent endpoint, an off-chain reverse hash
//!   service (RHS), or the on-chain identity tree store.
//! - [`RhsPublisher`] pushes the tree nodes an RHS needs to answer
//!   non-revocation queries after every confirmed state transition.
//!   [`collect_nodes`] computes that batch.

mod nodes;
mod publisher;
mod status;

pub use nodes::{collect_nodes, state_node, RhsNode};
pub use publisher::{HttpRhs, OnChainRhs, RetryPolicy, RhsPublisher};
pub use status::{CredentialStatus, StatusBuilder};

use issuer_chain::ChainError;
use issuer_merkle::MerkleError;
use issuer_types::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RevocationError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("revocation status mode {0} needs an issuer state")]
    MissingState(&'static str),
    #[error("reverse hash service request failed: {0}")]
    Http(String),
    #[error("reverse hash service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
}

impl RevocationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConfigured(_) | Self::MissingState(_) => ErrorKind::InvalidRequest,
            Self::Http(_) | Self::Status { .. } => ErrorKind::BackendError,
            Self::Chain(e) => e.kind(),
            Self::Merkle(e) => e.kind(),
        }
    }
}

impl From<reqwest::Error> for RevocationError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}
