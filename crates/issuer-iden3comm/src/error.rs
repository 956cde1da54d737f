use issuer_chain::ChainError;
use issuer_crypto::prover::ProverError;
use issuer_crypto::zk::ZkError;
use issuer_crypto::CryptoError;
use issuer_identity::IdentityError;
use issuer_kms::KmsError;
use issuer_state::StateError;
use issuer_types::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackerError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("invalid message json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no verification method {kid} in the document of {did}")]
    UnknownKey { did: String, kid: String },
    #[error("did {0} could not be resolved")]
    UnresolvedDid(String),
    #[error("resolver request failed: {0}")]
    Resolver(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("sender {sender} does not match message from {from}")]
    SenderMismatch { sender: String, from: String },
    #[error("proof challenge does not match the token")]
    ChallengeMismatch,
    #[error("proof rejected by the {0} verifier")]
    ProofRejected(String),
    #[error("gist root {0} is unknown on chain")]
    UnknownState(String),
    #[error("gist root {root} was replaced {age_secs} seconds ago")]
    StaleState { root: String, age_secs: u64 },
    #[error("malformed proof: {0}")]
    MalformedProof(String),
    #[error("no prover configured for zkp envelopes")]
    NoProver,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Zk(#[from] ZkError),
    #[error("proof generation failed: {0}")]
    Prover(#[from] ProverError),
    #[error(transparent)]
    Kms(#[from] KmsError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    State(#[from] StateError),
}

impl PackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Malformed(_)
            | Self::UnsupportedMediaType(_)
            | Self::UnsupportedAlgorithm(_)
            | Self::Json(_)
            | Self::NoProver => ErrorKind::InvalidRequest,
            Self::UnknownKey { .. } | Self::UnresolvedDid(_) => ErrorKind::NotFound,
            Self::Resolver(_) => ErrorKind::BackendError,
            Self::InvalidSignature
            | Self::SenderMismatch { .. }
            | Self::ChallengeMismatch
            | Self::ProofRejected(_) => ErrorKind::Unauthorized,
            Self::UnknownState(_) | Self::StaleState { .. } => ErrorKind::StateError,
            Self::MalformedProof(_) | Self::Zk(_) | Self::Prover(_) => ErrorKind::CryptoError,
            Self::Crypto(e) => e.kind(),
            Self::Kms(e) => e.kind(),
            Self::Chain(e) => e.kind(),
            Self::Identity(e) => e.kind(),
            Self::State(e) => e.kind(),
        }
    }
}

impl From<reqwest::Error> for PackerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Resolver(e.to_string())
    }
}
