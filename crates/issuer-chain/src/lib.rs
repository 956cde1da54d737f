//! EVM access for the issuer: JSON-RPC, transaction signing and the State
//! and identity tree store contracts.
//!
//! Transactions are built here and signed through the KMS; the private key
//! never leaves its backend. [`StateContract`] is the seam the publisher and
//! the iden3comm state checks talk to. [`EthStateContract`] drives a real
//! node, [`InMemoryStateContract`] stands in for one in development and
//! tests.

pub mod abi;
mod contract;
mod memory;
mod rlp;
mod rpc;
mod tx;

pub use contract::{
    EthStateContract, GistProof, GistRootInfo, StateContract, Transactor, TransitStateArgs,
    TreeStoreContract,
};
pub use memory::InMemoryStateContract;
pub use rpc::{EthClient, TxReceipt};
pub use tx::{tx_hash, Fees, GasSettings, UnsignedTx};

use issuer_kms::KmsError;
use issuer_types::ErrorKind;
use thiserror::Error;

/// Parses a `0x`-prefixed 20-byte address.
///
/// # Errors
///
/// Returns [`ChainError::Decode`] for anything else.
pub fn parse_address(s: &str) -> Result<[u8; 20], ChainError> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(raw).map_err(|e| ChainError::Decode(format!("address {s}: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ChainError::Decode(format!("address {s} is not 20 bytes")))
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("rpc call timed out")]
    Timeout,
    #[error("malformed chain data: {0}")]
    Decode(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Kms(#[from] KmsError),
    #[error("transaction reverted: {0}")]
    Reverted(String),
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Reverted(_) => ErrorKind::StateError,
            Self::Kms(e) => e.kind(),
            Self::Signing(_) => ErrorKind::CryptoError,
            _ => ErrorKind::BackendError,
        }
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}
