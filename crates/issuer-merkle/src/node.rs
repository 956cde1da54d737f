use crate::MerkleError;
use issuer_crypto::{poseidon, Hash};

/// A tree node. `Empty` is never stored; its hash is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Empty,
    Leaf { key: Hash, value: Hash },
    Middle { left: Hash, right: Hash },
}

impl Node {
    /// Stored `node_type` code.
    pub(crate) const MIDDLE: i64 = 1;
    pub(crate) const LEAF: i64 = 2;

    /// # Errors
    ///
    /// Returns [`MerkleError::Crypto`] if Poseidon fails.
    pub fn hash(&self) -> Result<Hash, MerkleError> {
        Ok(match self {
            Self::Empty => Hash::ZERO,
            Self::Leaf { key, value } => leaf_hash(key, value)?,
            Self::Middle { left, right } => poseidon::hash(&[*left, *right])?,
        })
    }

    /// The children published to a reverse hash service: `[k, v, 1]` for a
    /// leaf and `[left, right]` for a middle node.
    pub fn children(&self) -> Vec<Hash> {
        match self {
            Self::Empty => Vec::new(),
            Self::Leaf { key, value } => vec![*key, *value, Hash::from_u64(1)],
            Self::Middle { left, right } => vec![*left, *right],
        }
    }
}

/// `Poseidon3(key, value, 1)`.
pub(crate) fn leaf_hash(key: &Hash, value: &Hash) -> Result<Hash, MerkleError> {
    Ok(poseidon::hash(&[*key, *value, Hash::from_u64(1)])?)
}
