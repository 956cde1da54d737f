use issuer_chain::ChainError;
use issuer_claims::ClaimsError;
use issuer_crypto::prover::ProverError;
use issuer_crypto::CryptoError;
use issuer_identity::IdentityError;
use issuer_kms::KmsError;
use issuer_merkle::MerkleError;
use issuer_observe::ObserveError;
use issuer_revocation::RevocationError;
use issuer_types::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state transition already in flight for {0}")]
    TransitionInFlight(String),
    #[error("state {0} is a genesis state and has no transition")]
    Genesis(i64),
    #[error("on-chain publishing is disabled")]
    PublishingDisabled,
    #[error("identity {0} has no eth key to pay for transitions")]
    NoPayer(String),
    #[error("transaction {tx} not confirmed after {secs} seconds")]
    ConfirmationTimeout { tx: String, secs: u64 },
    #[error("transaction {0} reverted")]
    Reverted(String),
    #[error("proof generation failed: {0}")]
    Prover(#[from] ProverError),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("blocking task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Claims(#[from] ClaimsError),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Kms(#[from] KmsError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Revocation(#[from] RevocationError),
    #[error(transparent)]
    Observe(#[from] ObserveError),
}

impl StateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransitionInFlight(_) => ErrorKind::Conflict,
            Self::Genesis(_) | Self::PublishingDisabled | Self::NoPayer(_) => {
                ErrorKind::InvalidRequest
            }
            Self::ConfirmationTimeout { .. } | Self::Reverted(_) => ErrorKind::StateError,
            Self::Prover(_) => ErrorKind::CryptoError,
            Self::Database(_) | Self::Pool(_) | Self::Task(_) => ErrorKind::BackendError,
            Self::Identity(e) => e.kind(),
            Self::Claims(e) => e.kind(),
            Self::Merkle(e) => e.kind(),
            Self::Crypto(e) => e.kind(),
            Self::Kms(e) => e.kind(),
            Self::Chain(e) => e.kind(),
            Self::Revocation(e) => e.kind(),
            Self::Observe(e) => e.kind(),
        }
    }

    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<tokio::task::JoinError> for StateError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
