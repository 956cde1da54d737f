use crate::contract::{
    proof_tokens, synthetic_tx_hash, GistProof, GistRootInfo, StateContract, TransitStateArgs,
};
use crate::rpc::TxReceipt;
use crate::ChainError;
use async_trait::async_trait;
use issuer_crypto::Hash;
use issuer_kms::KeyId;
use issuer_merkle::{MemoryStorage, MerkleTree};
use issuer_types::{Did, GIST_DEPTH};
use std::collections::HashMap;
use std::sync::Mutex;

struct Inner {
    gist: MerkleTree<MemoryStorage>,
    states: HashMap<Did, Hash>,
    roots: HashMap<Hash, GistRootInfo>,
    receipts: HashMap<String, TxReceipt>,
    block: u64,
    auto_mine: bool,
    pending: Vec<String>,
    reject_next: Option<String>,
}

/// A State contract held in process: a real GIST over identity states,
/// root history with replacement times, and receipts that confirm on the
/// next block. Used by the dev server and tests.
pub struct InMemoryStateContract {
    inner: Mutex<Inner>,
}

impl Default for InMemoryStateContract {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

fn gist_key(id: &Did) -> Result<Hash, ChainError> {
    Hash::from_le_bytes(id.id_le_bytes()).map_err(|e| ChainError::Decode(e.to_string()))
}

fn merkle_err(e: issuer_merkle::MerkleError) -> ChainError {
    ChainError::Decode(format!("gist: {e}"))
}

impl InMemoryStateContract {
    /// Transactions are mined as soon as they are sent.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                gist: MerkleTree::with_levels(MemoryStorage::new(), GIST_DEPTH),
                states: HashMap::new(),
                roots: HashMap::new(),
                receipts: HashMap::new(),
                block: 1,
                auto_mine: true,
                pending: Vec::new(),
                reject_next: None,
            }),
        }
    }

    /// Transactions stay pending until [`mine`](Self::mine) is called.
    pub fn manual_mining() -> Self {
        let contract = Self::new();
        if let Ok(mut inner) = contract.inner.lock() {
            inner.auto_mine = false;
        }
        contract
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, ChainError> {
        self.inner
            .lock()
            .map_err(|_| ChainError::Transport("state contract lock poisoned".into()))
    }

    /// Mines `blocks` blocks, confirming every pending transaction in the
    /// first one.
    ///
    /// # Errors
    ///
    /// Fails only if the lock is poisoned.
    pub fn mine(&self, blocks: u64) -> Result<(), ChainError> {
        let mut inner = self.lock()?;
        if blocks == 0 {
            return Ok(());
        }
        let first = inner.block + 1;
        for tx in std::mem::take(&mut inner.pending) {
            inner.receipts.insert(
                tx,
                TxReceipt {
                    status: true,
                    block_number: first,
                },
            );
        }
        inner.block += blocks;
        Ok(())
    }

    /// Makes the next `transit_state` call revert with `reason`.
    ///
    /// # Errors
    ///
    /// Fails only if the lock is poisoned.
    pub fn reject_next(&self, reason: impl Into<String>) -> Result<(), ChainError> {
        self.lock()?.reject_next = Some(reason.into());
        Ok(())
    }

    /// Records root history directly, e.g. a root replaced long ago.
    ///
    /// # Errors
    ///
    /// Fails only if the lock is poisoned.
    pub fn insert_root_info(&self, info: GistRootInfo) -> Result<(), ChainError> {
        self.lock()?.roots.insert(info.root, info);
        Ok(())
    }
}

#[async_trait]
impl StateContract for InMemoryStateContract {
    async fn transit_state(
        &self,
        key: &KeyId,
        args: &TransitStateArgs,
    ) -> Result<String, ChainError> {
        // Malformed proofs fail here exactly as they would when encoding
        // calldata for a real node.
        proof_tokens(&args.proof)?;

        let mut inner = self.lock()?;
        if let Some(reason) = inner.reject_next.take() {
            return Err(ChainError::Reverted(reason));
        }

        let current = inner.states.get(&args.id).copied();
        match current {
            None => {
                if !args.is_old_state_genesis
                    || !args.id.is_genesis_state(args.old_state.as_le_bytes())
                {
                    return Err(ChainError::Reverted(
                        "old state is not the genesis state".into(),
                    ));
                }
            }
            Some(state) => {
                if args.is_old_state_genesis || state != args.old_state {
                    return Err(ChainError::Reverted("old state does not match".into()));
                }
            }
        }

        let key_hash = gist_key(&args.id)?;
        let old_root = inner.gist.root().map_err(merkle_err)?;
        let new_root = if current.is_some() {
            inner.gist.update(&key_hash, &args.new_state)
        } else {
            inner.gist.add(&key_hash, &args.new_state)
        }
        .map_err(merkle_err)?;
        inner.states.insert(args.id, args.new_state);

        let ts = now();
        let block = inner.block + 1;
        if let Some(old) = inner.roots.get_mut(&old_root) {
            old.replaced_by_root = new_root;
            old.replaced_at_timestamp = ts;
            old.replaced_at_block = block;
        }
        inner.roots.insert(
            new_root,
            GistRootInfo {
                root: new_root,
                created_at_timestamp: ts,
                created_at_block: block,
                ..GistRootInfo::default()
            },
        );

        let tx = synthetic_tx_hash(&[
            key.to_string().as_bytes(),
            args.id.id_bytes(),
            args.new_state.as_le_bytes(),
        ]);
        inner.pending.push(tx.clone());
        let auto_mine = inner.auto_mine;
        drop(inner);
        if auto_mine {
            self.mine(1)?;
        }
        tracing::debug!(tx, did = %args.id, "state transition recorded");
        Ok(tx)
    }

    async fn receipt(&self, tx: &str) -> Result<Option<TxReceipt>, ChainError> {
        Ok(self.lock()?.receipts.get(tx).copied())
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.lock()?.block)
    }

    async fn gist_root_info(&self, root: &Hash) -> Result<GistRootInfo, ChainError> {
        Ok(self
            .lock()?
            .roots
            .get(root)
            .copied()
            .unwrap_or_default())
    }

    async fn gist_proof(&self, id: &Did) -> Result<GistProof, ChainError> {
        let inner = self.lock()?;
        let key = gist_key(id)?;
        let root = inner.gist.root().map_err(merkle_err)?;
        let (proof, value) = inner
            .gist
            .generate_proof(&key, None)
            .map_err(merkle_err)?;
        let (aux_existence, aux_index, aux_value) = match proof.node_aux {
            Some(aux) => (true, aux.key, aux.value),
            None => (false, Hash::ZERO, Hash::ZERO),
        };
        Ok(GistProof {
            root,
            existence: proof.existence,
            siblings: proof.siblings_padded(GIST_DEPTH),
            index: key,
            value: value.unwrap_or(Hash::ZERO),
            aux_existence,
            aux_index,
            aux_value,
        })
    }

    async fn latest_state(&self, id: &Did) -> Result<Option<Hash>, ChainError> {
        Ok(self.lock()?.states.get(id).copied())
    }
}
