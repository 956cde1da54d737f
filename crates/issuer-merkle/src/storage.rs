use crate::{MerkleError, Node};
use issuer_crypto::Hash;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

/// Backing store for one tree.
pub trait NodeStorage {
    /// Returns the node stored under `hash`. The zero hash is always
    /// [`Node::Empty`].
    ///
    /// # Errors
    ///
    /// Returns a storage error; a missing node is `Ok(None)`.
    fn get_node(&self, hash: &Hash) -> Result<Option<Node>, MerkleError>;

    /// Stores `node` and returns its hash. Storing an existing node is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a storage or hashing error.
    fn put_node(&mut self, node: &Node) -> Result<Hash, MerkleError>;

    /// # Errors
    ///
    /// Returns a storage error.
    fn root(&self) -> Result<Hash, MerkleError>;

    /// # Errors
    ///
    /// Returns a storage error.
    fn set_root(&mut self, root: &Hash) -> Result<(), MerkleError>;
}

/// In-process storage for throwaway trees and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    nodes: HashMap<Hash, Node>,
    root: Hash,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeStorage for MemoryStorage {
    fn get_node(&self, hash: &Hash) -> Result<Option<Node>, MerkleError> {
        if hash.is_zero() {
            return Ok(Some(Node::Empty));
        }
        Ok(self.nodes.get(hash).copied())
    }

    fn put_node(&mut self, node: &Node) -> Result<Hash, MerkleError> {
        let hash = node.hash()?;
        if !matches!(node, Node::Empty) {
            self.nodes.entry(hash).or_insert(*node);
        }
        Ok(hash)
    }

    fn root(&self) -> Result<Hash, MerkleError> {
        Ok(self.root)
    }

    fn set_root(&mut self, root: &Hash) -> Result<(), MerkleError> {
        self.root = *root;
        Ok(())
    }
}

/// Storage over the `mt_nodes` and `mt_roots` tables.
///
/// Borrowing a `Transaction` (which derefs to `Connection`) keeps every
/// node and root write inside the caller's transaction.
pub struct SqlStorage<'c> {
    conn: &'c Connection,
    mt_id: i64,
}

impl<'c> SqlStorage<'c> {
    pub fn new(conn: &'c Connection, mt_id: i64) -> Self {
        Self { conn, mt_id }
    }

    pub fn mt_id(&self) -> i64 {
        self.mt_id
    }
}

fn hash_column(bytes: Option<Vec<u8>>) -> Result<Hash, MerkleError> {
    match bytes {
        Some(b) => Ok(Hash::from_le_slice(&b)?),
        None => Err(MerkleError::InvalidProof("node row missing a hash column".into())),
    }
}

impl NodeStorage for SqlStorage<'_> {
    fn get_node(&self, hash: &Hash) -> Result<Option<Node>, MerkleError> {
        if hash.is_zero() {
            return Ok(Some(Node::Empty));
        }
        type Row = (i64, Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>);
        let row: Option<Row> = self
            .conn
            .query_row(
                "SELECT node_type, child_l, child_r, entry_k, entry_v
                 FROM mt_nodes WHERE mt_id = ?1 AND hash = ?2",
                params![self.mt_id, &hash.as_le_bytes()[..]],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        let Some((node_type, child_l, child_r, entry_k, entry_v)) = row else {
            return Ok(None);
        };
        let node = match node_type {
            Node::LEAF => Node::Leaf {
                key: hash_column(entry_k)?,
                value: hash_column(entry_v)?,
            },
            Node::MIDDLE => Node::Middle {
                left: hash_column(child_l)?,
                right: hash_column(child_r)?,
            },
            other => {
                return Err(MerkleError::InvalidProof(format!("unknown node type {other}")));
            }
        };
        Ok(Some(node))
    }

    fn put_node(&mut self, node: &Node) -> Result<Hash, MerkleError> {
        let hash = node.hash()?;
        let (node_type, l, r, k, v): (i64, Option<&[u8]>, Option<&[u8]>, Option<&[u8]>, Option<&[u8]>) =
            match node {
                Node::Empty => return Ok(hash),
                Node::Leaf { key, value } => (
                    Node::LEAF,
                    None,
                    None,
                    Some(&key.as_le_bytes()[..]),
                    Some(&value.as_le_bytes()[..]),
                ),
                Node::Middle { left, right } => (
                    Node::MIDDLE,
                    Some(&left.as_le_bytes()[..]),
                    Some(&right.as_le_bytes()[..]),
                    None,
                    None,
                ),
            };
        self.conn.execute(
            "INSERT OR IGNORE INTO mt_nodes (mt_id, hash, node_type, child_l, child_r, entry_k, entry_v)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![self.mt_id, &hash.as_le_bytes()[..], node_type, l, r, k, v],
        )?;
        Ok(hash)
    }

    fn root(&self) -> Result<Hash, MerkleError> {
        let root: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT root FROM mt_roots WHERE mt_id = ?1",
                params![self.mt_id],
                |row| row.get(0),
            )
            .optional()?;
        match root {
            Some(bytes) => Ok(Hash::from_le_slice(&bytes)?),
            None => Ok(Hash::ZERO),
        }
    }

    fn set_root(&mut self, root: &Hash) -> Result<(), MerkleError> {
        self.conn.execute(
            "INSERT INTO mt_roots (mt_id, root) VALUES (?1, ?2)
             ON CONFLICT(mt_id) DO UPDATE SET
                root = excluded.root,
                modified_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
            params![self.mt_id, &root.as_le_bytes()[..]],
        )?;
        Ok(())
    }
}
