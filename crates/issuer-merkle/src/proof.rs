use crate::node::leaf_hash;
use crate::MerkleError;
use issuer_crypto::{poseidon, Hash};
use serde::{Deserialize, Serialize};

/// The leaf that ends a non-existence path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAux {
    pub key: Hash,
    pub value: Hash,
}

/// Merkle proof of existence or non-existence.
///
/// `siblings` lists one hash per level walked, root first, zeros included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub existence: bool,
    pub siblings: Vec<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_aux: Option<NodeAux>,
}

impl Proof {
    /// Siblings right-padded with zeros to `levels` entries, as circuits
    /// expect them.
    pub fn siblings_padded(&self, levels: usize) -> Vec<Hash> {
        let mut out = self.siblings.clone();
        if out.len() < levels {
            out.resize(levels, Hash::ZERO);
        }
        out
    }

    /// `(aux_key, aux_value, no_aux)` circuit inputs.
    pub fn aux_values(&self) -> (Hash, Hash, Hash) {
        match (&self.node_aux, self.existence) {
            (_, true) => (Hash::ZERO, Hash::ZERO, Hash::ZERO),
            (Some(aux), false) => (aux.key, aux.value, Hash::ZERO),
            (None, false) => (Hash::ZERO, Hash::ZERO, Hash::from_u64(1)),
        }
    }

    /// Root implied by this proof for `(key, value)`. `value` is ignored
    /// for non-existence proofs.
    ///
    /// # Errors
    ///
    /// Returns [`MerkleError::InvalidProof`] when a non-existence proof's
    /// auxiliary leaf has the queried key.
    pub fn root_from(&self, key: &Hash, value: &Hash) -> Result<Hash, MerkleError> {
        let mut mid = if self.existence {
            leaf_hash(key, value)?
        } else if let Some(aux) = &self.node_aux {
            if aux.key == *key {
                return Err(MerkleError::InvalidProof(
                    "non-existence proof ends at the queried key".into(),
                ));
            }
            leaf_hash(&aux.key, &aux.value)?
        } else {
            Hash::ZERO
        };

        for (lvl, sibling) in self.siblings.iter().enumerate().rev() {
            mid = if key.test_bit(lvl) {
                poseidon::hash(&[*sibling, mid])?
            } else {
                poseidon::hash(&[mid, *sibling])?
            };
        }
        Ok(mid)
    }

    /// # Errors
    ///
    /// See [`root_from`](Self::root_from).
    pub fn verify(&self, root: &Hash, key: &Hash, value: &Hash) -> Result<bool, MerkleError> {
        Ok(self.root_from(key, value)? == *root)
    }
}
