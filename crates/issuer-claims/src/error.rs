use issuer_crypto::CryptoError;
use issuer_identity::IdentityError;
use issuer_kms::KmsError;
use issuer_merkle::MerkleError;
use issuer_observe::ObserveError;
use issuer_revocation::RevocationError;
use issuer_types::{DidError, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClaimsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("schema fetch failed: {0}")]
    Http(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("blocking task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Did(#[from] DidError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
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

impl ClaimsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidRequest(_) | Self::Did(_) => ErrorKind::InvalidRequest,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Schema(_) => ErrorKind::SchemaError,
            Self::Http(_)
            | Self::Database(_)
            | Self::Pool(_)
            | Self::Task(_)
            | Self::Serialization(_) => ErrorKind::BackendError,
            Self::Identity(e) => e.kind(),
            Self::Merkle(e) => e.kind(),
            Self::Crypto(e) => e.kind(),
            Self::Kms(e) => e.kind(),
            Self::Revocation(e) => e.kind(),
            Self::Observe(e) => e.kind(),
        }
    }
}

impl From<tokio::task::JoinError> for ClaimsError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
