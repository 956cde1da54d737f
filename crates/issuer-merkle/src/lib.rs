//! Sparse Merkle trees for identity state.
//!
//! Every identity owns three trees (claims, revocations, roots of roots).
//! Trees use the iden3 compressed layout: a leaf sits at the shallowest
//! level where the little-endian bits of its key are unique, and empty
//! subtrees hash to zero.
//!
//! Nodes are content addressed, so a historical root stays readable after
//! later mutations. Writers for one identity serialize on [`IdentityLocks`].

mod locks;
mod node;
mod proof;
mod registry;
mod storage;
mod tree;

pub use locks::IdentityLocks;
pub use node::Node;
pub use proof::{NodeAux, Proof};
pub use registry::{register_trees, tree_id, IdentityTrees, TreeRoots};
pub use storage::{MemoryStorage, NodeStorage, SqlStorage};
pub use tree::MerkleTree;

use issuer_crypto::{CryptoError, Hash};
use issuer_types::{ErrorKind, TreeKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("key already exists in tree")]
    KeyAlreadyExists,
    #[error("key not found in tree")]
    KeyNotFound,
    #[error("reached maximum tree depth")]
    ReachedMaxLevel,
    #[error("node {0:?} missing from storage")]
    NodeNotFound(Hash),
    #[error("no {kind:?} tree registered for {identifier}")]
    TreeNotFound { identifier: String, kind: TreeKind },
    #[error("invalid proof: {0}")]
    InvalidProof(String),
    #[error("merkle database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl MerkleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::KeyAlreadyExists => ErrorKind::Conflict,
            Self::KeyNotFound | Self::TreeNotFound { .. } => ErrorKind::NotFound,
            Self::ReachedMaxLevel | Self::NodeNotFound(_) => ErrorKind::StateError,
            Self::InvalidProof(_) => ErrorKind::InvalidRequest,
            Self::Database(_) => ErrorKind::BackendError,
            Self::Crypto(_) => ErrorKind::CryptoError,
        }
    }
}
