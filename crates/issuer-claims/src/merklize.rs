//! Merklized credential subjects.
//!
//! Every scalar in the subject becomes a leaf keyed by the Poseidon hash
//! of its dotted path (`credentialSubject.address.city`, array items by
//! index) with the hash of its value as leaf value. The tree root goes
//! into the core claim, so verifiers can later be shown a single field.

use crate::ClaimsError;
use issuer_crypto::{poseidon, Hash};
use issuer_merkle::{MemoryStorage, MerkleTree, Proof};
use issuer_types::MAX_MERKLE_DEPTH;
use serde_json::{Map, Value};

const ROOT_PATH: &str = "credentialSubject";

pub struct Merklized {
    tree: MerkleTree<MemoryStorage>,
}

impl Merklized {
    /// Builds the tree over `subject`.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::Crypto`] on hashing failures, [`ClaimsError::Merkle`]
    /// when two paths collide.
    pub fn new(subject: &Map<String, Value>) -> Result<Self, ClaimsError> {
        let mut tree = MerkleTree::with_levels(MemoryStorage::new(), MAX_MERKLE_DEPTH);
        let mut leaves = Vec::new();
        let whole = Value::Object(subject.clone());
        flatten(ROOT_PATH, &whole, &mut leaves);
        for (path, value) in leaves {
            tree.add(&path_key(&path)?, &value_hash(value)?)?;
        }
        Ok(Self { tree })
    }

    /// # Errors
    ///
    /// Storage errors.
    pub fn root(&self) -> Result<Hash, ClaimsError> {
        Ok(self.tree.root()?)
    }

    /// Proof for the field at `path` relative to the subject, e.g.
    /// `birthday` or `address.city`.
    ///
    /// # Errors
    ///
    /// Hashing and storage errors.
    pub fn prove(&self, path: &str) -> Result<(Proof, Option<Hash>), ClaimsError> {
        let key = path_key(&format!("{ROOT_PATH}.{path}"))?;
        Ok(self.tree.generate_proof(&key, None)?)
    }
}

fn flatten<'a>(path: &str, value: &'a Value, out: &mut Vec<(String, &'a Value)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten(&format!("{path}.{k}"), v, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten(&format!("{path}.{i}"), v, out);
            }
        }
        scalar => out.push((path.to_string(), scalar)),
    }
}

/// Leaf key of a dotted subject path.
///
/// # Errors
///
/// Hashing failures.
pub fn path_key(path: &str) -> Result<Hash, ClaimsError> {
    Ok(Hash::from(poseidon::hash_bytes(path.as_bytes())?))
}

/// Leaf value of a scalar. Unsigned integers and booleans are embedded
/// directly; everything else is hashed as its string form.
///
/// # Errors
///
/// Hashing failures.
pub fn value_hash(value: &Value) -> Result<Hash, ClaimsError> {
    let hash = match value {
        Value::Null => Hash::ZERO,
        Value::Bool(b) => Hash::from_u64(u64::from(*b)),
        Value::Number(n) => match n.as_u64() {
            Some(u) => Hash::from_u64(u),
            None => Hash::from(poseidon::hash_bytes(n.to_string().as_bytes())?),
        },
        Value::String(s) => Hash::from(poseidon::hash_bytes(s.as_bytes())?),
        other => Hash::from(poseidon::hash_bytes(other.to_string().as_bytes())?),
    };
    Ok(hash)
}
