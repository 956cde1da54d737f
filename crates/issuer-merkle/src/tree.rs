use crate::node::leaf_hash;
use crate::{MerkleError, Node, NodeAux, NodeStorage, Proof};
use issuer_crypto::Hash;
use issuer_types::MAX_MERKLE_DEPTH;
use std::collections::HashSet;

/// A compressed sparse Merkle tree over some [`NodeStorage`].
#[derive(Debug)]
pub struct MerkleTree<S> {
    storage: S,
    max_levels: usize,
}

impl<S: NodeStorage> MerkleTree<S> {
    /// A tree of [`MAX_MERKLE_DEPTH`] levels.
    pub fn new(storage: S) -> Self {
        Self::with_levels(storage, MAX_MERKLE_DEPTH)
    }

    pub fn with_levels(storage: S, max_levels: usize) -> Self {
        Self {
            storage,
            max_levels,
        }
    }

    pub fn max_levels(&self) -> usize {
        self.max_levels
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// # Errors
    ///
    /// Returns a storage error.
    pub fn root(&self) -> Result<Hash, MerkleError> {
        self.storage.root()
    }

    /// The current root, usable later as a historical proof root.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn snapshot(&self) -> Result<Hash, MerkleError> {
        self.storage.root()
    }

    fn node(&self, hash: &Hash) -> Result<Node, MerkleError> {
        self.storage
            .get_node(hash)?
            .ok_or(MerkleError::NodeNotFound(*hash))
    }

    /// Inserts a leaf.
    ///
    /// # Errors
    ///
    /// Returns [`MerkleError::KeyAlreadyExists`] for an occupied key and
    /// [`MerkleError::ReachedMaxLevel`] when the paths cannot be separated
    /// within the tree depth.
    pub fn add(&mut self, key: &Hash, value: &Hash) -> Result<Hash, MerkleError> {
        let root = self.storage.root()?;
        let new_root = self.add_leaf(key, value, &root, 0)?;
        self.storage.set_root(&new_root)?;
        Ok(new_root)
    }

    fn add_leaf(
        &mut self,
        key: &Hash,
        value: &Hash,
        at: &Hash,
        lvl: usize,
    ) -> Result<Hash, MerkleError> {
        if lvl + 1 > self.max_levels {
            return Err(MerkleError::ReachedMaxLevel);
        }
        match self.node(at)? {
            Node::Empty => self.storage.put_node(&Node::Leaf {
                key: *key,
                value: *value,
            }),
            Node::Leaf {
                key: old_key,
                value: old_value,
            } => {
                if old_key == *key {
                    return Err(MerkleError::KeyAlreadyExists);
                }
                self.push_leaf(key, value, &old_key, &old_value, lvl)
            }
            Node::Middle { left, right } => {
                let node = if key.test_bit(lvl) {
                    let right = self.add_leaf(key, value, &right, lvl + 1)?;
                    Node::Middle { left, right }
                } else {
                    let left = self.add_leaf(key, value, &left, lvl + 1)?;
                    Node::Middle { left, right }
                };
                self.storage.put_node(&node)
            }
        }
    }

    /// Pushes an existing leaf down until its path diverges from the new one.
    fn push_leaf(
        &mut self,
        key: &Hash,
        value: &Hash,
        old_key: &Hash,
        old_value: &Hash,
        lvl: usize,
    ) -> Result<Hash, MerkleError> {
        if lvl + 2 > self.max_levels {
            return Err(MerkleError::ReachedMaxLevel);
        }
        let new_bit = key.test_bit(lvl);
        if new_bit == old_key.test_bit(lvl) {
            let next = self.push_leaf(key, value, old_key, old_value, lvl + 1)?;
            let node = if new_bit {
                Node::Middle {
                    left: Hash::ZERO,
                    right: next,
                }
            } else {
                Node::Middle {
                    left: next,
                    right: Hash::ZERO,
                }
            };
            return self.storage.put_node(&node);
        }

        let new_hash = self.storage.put_node(&Node::Leaf {
            key: *key,
            value: *value,
        })?;
        let old_hash = leaf_hash(old_key, old_value)?;
        let node = if new_bit {
            Node::Middle {
                left: old_hash,
                right: new_hash,
            }
        } else {
            Node::Middle {
                left: new_hash,
                right: old_hash,
            }
        };
        self.storage.put_node(&node)
    }

    /// Walks from `root` towards `key`, returning the siblings passed and
    /// the node where the walk ended.
    fn descend(&self, key: &Hash, root: &Hash) -> Result<(Vec<Hash>, Node), MerkleError> {
        let mut at = *root;
        let mut siblings = Vec::new();
        for lvl in 0..self.max_levels {
            match self.node(&at)? {
                Node::Middle { left, right } => {
                    if key.test_bit(lvl) {
                        siblings.push(left);
                        at = right;
                    } else {
                        siblings.push(right);
                        at = left;
                    }
                }
                end => return Ok((siblings, end)),
            }
        }
        Err(MerkleError::ReachedMaxLevel)
    }

    /// Replaces the value of an existing leaf.
    ///
    /// # Errors
    ///
    /// Returns [`MerkleError::KeyNotFound`] if the key is absent.
    pub fn update(&mut self, key: &Hash, value: &Hash) -> Result<Hash, MerkleError> {
        let root = self.storage.root()?;
        let (siblings, end) = self.descend(key, &root)?;
        match end {
            Node::Leaf { key: found, .. } if found == *key => {}
            _ => return Err(MerkleError::KeyNotFound),
        }

        let mut current = self.storage.put_node(&Node::Leaf {
            key: *key,
            value: *value,
        })?;
        for (lvl, sibling) in siblings.iter().enumerate().rev() {
            let node = if key.test_bit(lvl) {
                Node::Middle {
                    left: *sibling,
                    right: current,
                }
            } else {
                Node::Middle {
                    left: current,
                    right: *sibling,
                }
            };
            current = self.storage.put_node(&node)?;
        }
        self.storage.set_root(&current)?;
        Ok(current)
    }

    /// Value stored under `key` in the current tree.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn get(&self, key: &Hash) -> Result<Option<Hash>, MerkleError> {
        let root = self.storage.root()?;
        self.get_at(key, &root)
    }

    /// Value stored under `key` in the tree rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn get_at(&self, key: &Hash, root: &Hash) -> Result<Option<Hash>, MerkleError> {
        let (_, end) = self.descend(key, root)?;
        Ok(match end {
            Node::Leaf { key: found, value } if found == *key => Some(value),
            _ => None,
        })
    }

    /// Existence or non-existence proof for `key`, against `root` or the
    /// current root. Returns the value when the key exists.
    ///
    /// # Errors
    ///
    /// Returns [`MerkleError::NodeNotFound`] if `root` is unknown to this
    /// tree's storage.
    pub fn generate_proof(
        &self,
        key: &Hash,
        root: Option<&Hash>,
    ) -> Result<(Proof, Option<Hash>), MerkleError> {
        let root = match root {
            Some(r) => *r,
            None => self.storage.root()?,
        };
        let (siblings, end) = self.descend(key, &root)?;
        Ok(match end {
            Node::Leaf { key: found, value } if found == *key => (
                Proof {
                    existence: true,
                    siblings,
                    node_aux: None,
                },
                Some(value),
            ),
            Node::Leaf { key: found, value } => (
                Proof {
                    existence: false,
                    siblings,
                    node_aux: Some(NodeAux { key: found, value }),
                },
                None,
            ),
            _ => (
                Proof {
                    existence: false,
                    siblings,
                    node_aux: None,
                },
                None,
            ),
        })
    }

    /// Depth-first walk over every stored node under `root`.
    ///
    /// The visitor returns whether to descend into a middle node's
    /// children, which lets callers skip subtrees they have already seen.
    ///
    /// # Errors
    ///
    /// Propagates storage errors and visitor errors.
    pub fn walk<F>(&self, root: &Hash, mut visit: F) -> Result<(), MerkleError>
    where
        F: FnMut(&Hash, &Node) -> Result<bool, MerkleError>,
    {
        let mut stack = vec![*root];
        while let Some(hash) = stack.pop() {
            let node = self.node(&hash)?;
            if matches!(node, Node::Empty) {
                continue;
            }
            let descend = visit(&hash, &node)?;
            if let (true, Node::Middle { left, right }) = (descend, node) {
                stack.push(right);
                stack.push(left);
            }
        }
        Ok(())
    }

    /// Visits the nodes under `new_root` that are not under `old_root`,
    /// descending only along positions where the two trees differ. Leaves
    /// the old tree held higher up and a collision pushed down keep their
    /// hash and are not visited.
    ///
    /// # Errors
    ///
    /// Propagates storage errors and visitor errors.
    pub fn walk_delta<F>(&self, old_root: &Hash, new_root: &Hash, mut visit: F) -> Result<(), MerkleError>
    where
        F: FnMut(&Hash, &Node) -> Result<(), MerkleError>,
    {
        let mut moved = HashSet::new();
        let mut stack = vec![(*new_root, *old_root)];
        while let Some((hash, old)) = stack.pop() {
            if hash == old || hash.is_zero() || moved.contains(&hash) {
                continue;
            }
            let node = self.node(&hash)?;
            visit(&hash, &node)?;
            let Node::Middle { left, right } = node else {
                continue;
            };
            let (old_left, old_right) = if old.is_zero() {
                (Hash::ZERO, Hash::ZERO)
            } else {
                match self.node(&old)? {
                    Node::Middle { left, right } => (left, right),
                    Node::Leaf { .. } => {
                        moved.insert(old);
                        (Hash::ZERO, Hash::ZERO)
                    }
                    Node::Empty => (Hash::ZERO, Hash::ZERO),
                }
            };
            stack.push((right, old_right));
            stack.push((left, old_left));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;
    use issuer_crypto::poseidon;

    fn h(n: u64) -> Hash {
        Hash::from_u64(n)
    }

    fn tree() -> MerkleTree<MemoryStorage> {
        MerkleTree::new(MemoryStorage::new())
    }

    #[test]
    fn empty_tree_has_zero_root() {
        assert_eq!(tree().root().expect("root"), Hash::ZERO);
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let mut t = tree();
        let root = t.add(&h(1), &h(2)).expect("add");
        let expected = poseidon::hash(&[h(1), h(2), h(1)]).expect("hash");
        assert_eq!(root, expected);
        assert_eq!(t.get(&h(1)).expect("get"), Some(h(2)));
        assert_eq!(t.get(&h(3)).expect("get"), None);
    }

    #[test]
    fn diverging_keys_split_at_first_differing_bit() {
        // 1 = ...01 and 2 = ...10 differ at bit 0.
        let mut t = tree();
        t.add(&h(1), &h(10)).expect("add");
        let root = t.add(&h(2), &h(20)).expect("add");

        let l1 = poseidon::hash(&[h(1), h(10), h(1)]).expect("hash");
        let l2 = poseidon::hash(&[h(2), h(20), h(1)]).expect("hash");
        // Bit 0 of 2 is clear, so it goes left.
        assert_eq!(root, poseidon::hash(&[l2, l1]).expect("hash"));
    }

    #[test]
    fn shared_prefix_creates_empty_siblings() {
        // 1 = 0b001 and 5 = 0b101 share bits 0 and 1.
        let mut t = tree();
        t.add(&h(1), &h(0)).expect("add");
        t.add(&h(5), &h(0)).expect("add");
        let (proof, value) = t.generate_proof(&h(5), None).expect("proof");
        assert!(proof.existence);
        assert_eq!(value, Some(h(0)));
        assert_eq!(proof.siblings.len(), 3);
        assert_eq!(proof.siblings[0], Hash::ZERO);
        assert_eq!(proof.siblings[1], Hash::ZERO);
        assert!(proof
            .verify(&t.root().expect("root"), &h(5), &h(0))
            .expect("verify"));
    }

    #[test]
    fn insertion_order_does_not_change_root() {
        let keys = [7u64, 3, 12, 100, 55, 1];
        let mut a = tree();
        for k in keys {
            a.add(&h(k), &h(k * 2)).expect("add");
        }
        let mut b = tree();
        for k in keys.iter().rev() {
            b.add(&h(*k), &h(k * 2)).expect("add");
        }
        assert_eq!(a.root().expect("root"), b.root().expect("root"));
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut t = tree();
        t.add(&h(9), &h(1)).expect("add");
        assert!(matches!(
            t.add(&h(9), &h(2)),
            Err(MerkleError::KeyAlreadyExists)
        ));
    }

    #[test]
    fn colliding_paths_hit_max_level() {
        // 0 and 16 agree on bits 0..4.
        let mut t = MerkleTree::with_levels(MemoryStorage::new(), 4);
        t.add(&h(0), &h(1)).expect("add");
        assert!(matches!(
            t.add(&h(16), &h(1)),
            Err(MerkleError::ReachedMaxLevel)
        ));
        // Bit 2 differs: fits.
        t.add(&h(4), &h(1)).expect("add within depth");
    }

    #[test]
    fn non_existence_proofs_carry_aux_leaf() {
        let mut t = tree();
        t.add(&h(1), &h(11)).expect("add");
        t.add(&h(2), &h(22)).expect("add");
        let root = t.root().expect("root");

        // 3 = 0b11 follows 1's path (bit 0 set) and ends at leaf 1.
        let (proof, value) = t.generate_proof(&h(3), None).expect("proof");
        assert!(!proof.existence);
        assert_eq!(value, None);
        let aux = proof.node_aux.expect("aux leaf");
        assert_eq!(aux.key, h(1));
        assert_eq!(aux.value, h(11));
        assert!(proof.verify(&root, &h(3), &Hash::ZERO).expect("verify"));

        // 1 and 3 both go right at bit 0, leaving the left subtree empty.
        let mut t2 = tree();
        t2.add(&h(1), &h(11)).expect("add");
        t2.add(&h(3), &h(33)).expect("add");
        let (proof, _) = t2.generate_proof(&h(2), None).expect("proof");
        assert!(!proof.existence);
        assert!(proof.node_aux.is_none());
        assert_eq!(proof.siblings.len(), 1);
        let root = t2.root().expect("root");
        assert!(proof.verify(&root, &h(2), &Hash::ZERO).expect("verify"));
    }

    #[test]
    fn historical_roots_stay_provable() {
        let mut t = tree();
        t.add(&h(1), &h(1)).expect("add");
        let old_root = t.snapshot().expect("snapshot");
        t.add(&h(2), &h(2)).expect("add");

        let (proof, _) = t.generate_proof(&h(2), Some(&old_root)).expect("proof");
        assert!(!proof.existence);
        assert!(proof.verify(&old_root, &h(2), &Hash::ZERO).expect("verify"));

        let (proof, value) = t.generate_proof(&h(1), Some(&old_root)).expect("proof");
        assert!(proof.existence);
        assert_eq!(value, Some(h(1)));
        assert_eq!(t.get_at(&h(2), &old_root).expect("get"), None);
    }

    #[test]
    fn update_replaces_value_and_root() {
        let mut a = tree();
        a.add(&h(1), &h(1)).expect("add");
        a.add(&h(6), &h(1)).expect("add");
        let updated = a.update(&h(6), &h(9)).expect("update");

        let mut b = tree();
        b.add(&h(1), &h(1)).expect("add");
        b.add(&h(6), &h(9)).expect("add");
        assert_eq!(updated, b.root().expect("root"));
        assert_eq!(a.get(&h(6)).expect("get"), Some(h(9)));

        assert!(matches!(
            a.update(&h(7), &h(1)),
            Err(MerkleError::KeyNotFound)
        ));
    }

    #[test]
    fn walk_visits_every_stored_node() {
        let mut t = tree();
        for k in [1u64, 2, 3, 8] {
            t.add(&h(k), &h(k)).expect("add");
        }
        let mut leaves = Vec::new();
        let mut middles = 0;
        t.walk(&t.root().expect("root"), |_, node| {
            match node {
                Node::Leaf { key, .. } => leaves.push(*key),
                Node::Middle { .. } => middles += 1,
                Node::Empty => {}
            }
            Ok(true)
        })
        .expect("walk");
        leaves.sort();
        assert_eq!(leaves, vec![h(1), h(2), h(3), h(8)]);
        assert!(middles >= 3);
    }

    #[test]
    fn walk_can_prune_subtrees() {
        let mut t = tree();
        t.add(&h(1), &h(1)).expect("add");
        t.add(&h(2), &h(2)).expect("add");
        let root = t.root().expect("root");
        let mut seen = 0;
        t.walk(&root, |_, _| {
            seen += 1;
            Ok(false)
        })
        .expect("walk");
        assert_eq!(seen, 1);
    }

    fn all_nodes(t: &MerkleTree<MemoryStorage>, root: &Hash) -> HashSet<Hash> {
        let mut seen = HashSet::new();
        t.walk(root, |hash, _| {
            seen.insert(*hash);
            Ok(true)
        })
        .expect("walk");
        seen
    }

    fn delta(t: &MerkleTree<MemoryStorage>, old: &Hash, new: &Hash) -> HashSet<Hash> {
        let mut seen = HashSet::new();
        t.walk_delta(old, new, |hash, _| {
            assert!(seen.insert(*hash), "visited twice");
            Ok(())
        })
        .expect("delta");
        seen
    }

    #[test]
    fn delta_walk_follows_only_changed_paths() {
        let mut t = tree();
        for k in 0..200u64 {
            t.add(&h(k * 7 + 3), &h(k)).expect("add");
        }
        let before = t.root().expect("root");

        t.add(&h(5000), &h(1)).expect("add");
        let added = t.root().expect("root");
        let expected: HashSet<Hash> = all_nodes(&t, &added)
            .difference(&all_nodes(&t, &before))
            .copied()
            .collect();
        let changed = delta(&t, &before, &added);
        assert_eq!(changed, expected);
        assert!(changed.len() <= MAX_MERKLE_DEPTH + 2, "{}", changed.len());

        t.update(&h(3), &h(99)).expect("update");
        let updated = t.root().expect("root");
        let expected: HashSet<Hash> = all_nodes(&t, &updated)
            .difference(&all_nodes(&t, &added))
            .copied()
            .collect();
        assert_eq!(delta(&t, &added, &updated), expected);

        assert!(delta(&t, &updated, &updated).is_empty());
        assert_eq!(delta(&t, &Hash::ZERO, &updated), all_nodes(&t, &updated));
    }
}
