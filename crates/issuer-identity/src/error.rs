use issuer_crypto::CryptoError;
use issuer_kms::KmsError;
use issuer_merkle::MerkleError;
use issuer_observe::ObserveError;
use issuer_revocation::RevocationError;
use issuer_types::{DidError, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("state transition already in flight for {0}")]
    TransitionInFlight(String),
    #[error("state {id} is not {expected}")]
    StatusMismatch { id: i64, expected: &'static str },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("corrupt identity record: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("blocking task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Did(#[from] DidError),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Kms(#[from] KmsError),
    #[error(transparent)]
    Revocation(#[from] RevocationError),
    #[error(transparent)]
    Observe(#[from] ObserveError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IdentityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::TransitionInFlight(_) | Self::StatusMismatch { .. } => ErrorKind::Conflict,
            Self::InvalidRequest(_) | Self::Did(_) => ErrorKind::InvalidRequest,
            Self::Corrupt(_) => ErrorKind::StateError,
            Self::Database(_) | Self::Pool(_) | Self::Task(_) | Self::Serialization(_) => {
                ErrorKind::BackendError
            }
            Self::Merkle(e) => e.kind(),
            Self::Crypto(e) => e.kind(),
            Self::Kms(e) => e.kind(),
            Self::Revocation(e) => e.kind(),
            Self::Observe(e) => e.kind(),
        }
    }
}

impl From<tokio::task::JoinError> for IdentityError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

/// Whether `e` is a UNIQUE or PRIMARY KEY violation.
pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
