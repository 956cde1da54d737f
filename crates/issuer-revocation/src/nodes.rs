use issuer_crypto::Hash;
use issuer_merkle::{IdentityTrees, MerkleError, MerkleTree, NodeStorage, TreeRoots};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One node as a reverse hash service stores it: the hash and its
/// preimage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RhsNode {
    pub hash: Hash,
    pub children: Vec<Hash>,
}

#[derive(Serialize, Deserialize)]
struct WireNode {
    hash: String,
    children: Vec<String>,
}

// RHS APIs exchange little-endian hex, not the decimal serde form of Hash.
impl Serialize for RhsNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireNode {
            hash: self.hash.hex(),
            children: self.children.iter().map(Hash::hex).collect(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RhsNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireNode::deserialize(deserializer)?;
        let parse = |s: &str| Hash::from_hex(s).map_err(serde::de::Error::custom);
        Ok(Self {
            hash: parse(&wire.hash)?,
            children: wire
                .children
                .iter()
                .map(|c| parse(c))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// The node binding an identity state to its three roots.
///
/// # Errors
///
/// Returns a hashing error.
pub fn state_node(roots: &TreeRoots) -> Result<RhsNode, MerkleError> {
    Ok(RhsNode {
        hash: roots.state()?,
        children: vec![roots.claims, roots.revocations, roots.roots],
    })
}

/// Nodes under `new_root` that are not under `old_root`.
fn tree_delta<S: NodeStorage>(
    tree: &MerkleTree<S>,
    old_root: Option<&Hash>,
    new_root: &Hash,
    out: &mut Vec<RhsNode>,
) -> Result<(), MerkleError> {
    let old_root = old_root.copied().unwrap_or(Hash::ZERO);
    tree.walk_delta(&old_root, new_root, |hash, node| {
        out.push(RhsNode {
            hash: *hash,
            children: node.children(),
        });
        Ok(())
    })
}

/// The batch an RHS needs after a transition from `previous` to `current`:
/// new revocation-tree nodes, new roots-tree nodes and the state node.
/// `previous` is the last published state, `None` to publish everything.
///
/// # Errors
///
/// Returns a storage error if a root's nodes are missing.
pub fn collect_nodes(
    trees: &IdentityTrees<'_>,
    previous: Option<&TreeRoots>,
    current: &TreeRoots,
) -> Result<Vec<RhsNode>, MerkleError> {
    let mut out = Vec::new();
    tree_delta(
        &trees.revocations,
        previous.map(|p| &p.revocations),
        &current.revocations,
        &mut out,
    )?;
    tree_delta(
        &trees.roots,
        previous.map(|p| &p.roots),
        &current.roots,
        &mut out,
    )?;
    out.push(state_node(current)?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use issuer_merkle::register_trees;
    use rusqlite::Connection;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        issuer_db::run_migrations(&conn).expect("migrations should succeed");
        conn
    }

    const DID: &str = "did:polygonid:polygon:amoy:2qRhs";

    fn h(n: u64) -> Hash {
        Hash::from_u64(n)
    }

    #[test]
    fn wire_form_is_little_endian_hex() {
        let node = RhsNode {
            hash: h(1),
            children: vec![h(2), h(3)],
        };
        let json = serde_json::to_value(&node).expect("json");
        assert_eq!(json["hash"], h(1).hex());
        assert_eq!(json["children"][1], h(3).hex());
        let back: RhsNode = serde_json::from_value(json).expect("parse");
        assert_eq!(back, node);
    }

    #[test]
    fn first_batch_covers_whole_trees() {
        let conn = test_db();
        register_trees(&conn, DID).expect("register");
        let mut trees = IdentityTrees::open(&conn, DID).expect("open");
        trees.revocations.add(&h(5), &h(1)).expect("revoke 5");
        trees.revocations.add(&h(6), &h(1)).expect("revoke 6");
        trees.roots.add(&h(100), &Hash::ZERO).expect("root");

        let roots = trees.roots().expect("roots");
        let nodes = collect_nodes(&trees, None, &roots).expect("collect");

        // Two revocation leaves under one middle (5 = 101b, 6 = 110b differ
        // at bit 0), one roots leaf, one state node.
        assert_eq!(nodes.len(), 5);
        let state = nodes.last().expect("state node");
        assert_eq!(state.hash, roots.state().expect("state"));
        assert_eq!(state.children, vec![roots.claims, roots.revocations, roots.roots]);
        let leaf = nodes
            .iter()
            .find(|n| n.children.first() == Some(&h(5)))
            .expect("leaf for nonce 5");
        assert_eq!(leaf.children, vec![h(5), h(1), h(1)]);
    }

    #[test]
    fn later_batches_skip_published_nodes() {
        let conn = test_db();
        register_trees(&conn, DID).expect("register");
        let mut trees = IdentityTrees::open(&conn, DID).expect("open");
        trees.revocations.add(&h(5), &h(1)).expect("revoke");
        let before = trees.roots().expect("roots");

        trees.revocations.add(&h(6), &h(1)).expect("revoke");
        let after = trees.roots().expect("roots");
        let nodes = collect_nodes(&trees, Some(&before), &after).expect("collect");

        // New middle, the new leaf for 6, the relocated leaf for 5 is
        // unchanged content and therefore skipped, plus the state node.
        assert_eq!(nodes.len(), 3);
        assert!(nodes.iter().all(|n| n.children.first() != Some(&h(5))));

        let unchanged = collect_nodes(&trees, Some(&after), &after).expect("collect");
        assert_eq!(unchanged.len(), 1);
    }
}
