//! Tree registration and the per-identity tree triple.

use crate::{MerkleError, MerkleTree, SqlStorage};
use issuer_crypto::{poseidon, Hash};
use issuer_types::TreeKind;
use rusqlite::{params, Connection, OptionalExtension};

/// Registers the three trees of `identifier` and returns their ids in
/// [`TreeKind::ALL`] order. Existing registrations are reused.
///
/// # Errors
///
/// Returns [`MerkleError::Database`] on SQL failure.
pub fn register_trees(conn: &Connection, identifier: &str) -> Result<[i64; 3], MerkleError> {
    let mut ids = [0i64; 3];
    for (slot, kind) in ids.iter_mut().zip(TreeKind::ALL) {
        conn.execute(
            "INSERT OR IGNORE INTO identity_mts (identifier, kind) VALUES (?1, ?2)",
            params![identifier, kind.as_u8()],
        )?;
        *slot = tree_id(conn, identifier, kind)?;
    }
    tracing::debug!(identifier, "registered identity trees");
    Ok(ids)
}

/// # Errors
///
/// Returns [`MerkleError::TreeNotFound`] if the tree was never registered.
pub fn tree_id(conn: &Connection, identifier: &str, kind: TreeKind) -> Result<i64, MerkleError> {
    conn.query_row(
        "SELECT id FROM identity_mts WHERE identifier = ?1 AND kind = ?2",
        params![identifier, kind.as_u8()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| MerkleError::TreeNotFound {
        identifier: identifier.to_string(),
        kind,
    })
}

/// The three roots an identity state commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeRoots {
    pub claims: Hash,
    pub revocations: Hash,
    pub roots: Hash,
}

impl TreeRoots {
    /// `Poseidon3(claims, revocations, roots)`.
    ///
    /// # Errors
    ///
    /// Returns [`MerkleError::Crypto`] if hashing fails.
    pub fn state(&self) -> Result<Hash, MerkleError> {
        Ok(poseidon::hash(&[self.claims, self.revocations, self.roots])?)
    }
}

/// An identity's claims, revocations and roots trees over one connection.
pub struct IdentityTrees<'c> {
    pub claims: MerkleTree<SqlStorage<'c>>,
    pub revocations: MerkleTree<SqlStorage<'c>>,
    pub roots: MerkleTree<SqlStorage<'c>>,
}

impl<'c> IdentityTrees<'c> {
    /// # Errors
    ///
    /// Returns [`MerkleError::TreeNotFound`] for an unknown identity.
    pub fn open(conn: &'c Connection, identifier: &str) -> Result<Self, MerkleError> {
        let tree = |kind| -> Result<MerkleTree<SqlStorage<'c>>, MerkleError> {
            Ok(MerkleTree::new(SqlStorage::new(
                conn,
                tree_id(conn, identifier, kind)?,
            )))
        };
        Ok(Self {
            claims: tree(TreeKind::Claims)?,
            revocations: tree(TreeKind::Revocations)?,
            roots: tree(TreeKind::Roots)?,
        })
    }

    pub fn get(&self, kind: TreeKind) -> &MerkleTree<SqlStorage<'c>> {
        match kind {
            TreeKind::Claims => &self.claims,
            TreeKind::Revocations => &self.revocations,
            TreeKind::Roots => &self.roots,
        }
    }

    /// # Errors
    ///
    /// Returns a storage error.
    pub fn roots(&self) -> Result<TreeRoots, MerkleError> {
        Ok(TreeRoots {
            claims: self.claims.root()?,
            revocations: self.revocations.root()?,
            roots: self.roots.root()?,
        })
    }

    /// # Errors
    ///
    /// Returns a storage or hashing error.
    pub fn state(&self) -> Result<Hash, MerkleError> {
        self.roots()?.state()
    }
}
