//! State contract and identity tree store bindings.

use crate::abi::{self, Token, U256};
use crate::rpc::{EthClient, TxReceipt};
use crate::tx::{tx_hash, GasSettings, UnsignedTx};
use crate::ChainError;
use async_trait::async_trait;
use issuer_crypto::zk::ProofData;
use issuer_crypto::Hash;
use issuer_kms::{KeyId, KeyProvider, Kms};
use issuer_types::{Did, GIST_DEPTH};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::sync::Arc;

const TRANSIT_STATE: &str =
    "transitState(uint256,uint256,uint256,bool,uint256[2],uint256[2][2],uint256[2])";
const GET_GIST_ROOT_INFO: &str = "getGISTRootInfo(uint256)";
const GET_GIST_PROOF: &str = "getGISTProof(uint256)";
const GET_STATE_INFO_BY_ID: &str = "getStateInfoById(uint256)";
const SAVE_NODES: &str = "saveNodes(uint256[][])";

/// JSON-RPC code for `execution reverted`.
const REVERT_CODE: i64 = 3;

/// Arguments of `transitState`.
#[derive(Debug, Clone)]
pub struct TransitStateArgs {
    pub id: Did,
    pub old_state: Hash,
    pub new_state: Hash,
    pub is_old_state_genesis: bool,
    pub proof: ProofData,
}

/// `getGISTRootInfo` result. A root the contract never saw comes back
/// all zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GistRootInfo {
    pub root: Hash,
    pub replaced_by_root: Hash,
    pub created_at_timestamp: u64,
    pub replaced_at_timestamp: u64,
    pub created_at_block: u64,
    pub replaced_at_block: u64,
}

/// `getGISTProof` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GistProof {
    pub root: Hash,
    pub existence: bool,
    /// Exactly [`GIST_DEPTH`] entries.
    pub siblings: Vec<Hash>,
    pub index: Hash,
    pub value: Hash,
    pub aux_existence: bool,
    pub aux_index: Hash,
    pub aux_value: Hash,
}

/// The on-chain State contract as the issuer uses it.
#[async_trait]
pub trait StateContract: Send + Sync {
    /// Submits a transition paid for by `key` and returns the transaction
    /// hash.
    ///
    /// # Errors
    ///
    /// [`ChainError::Reverted`] when the contract rejects the transition.
    async fn transit_state(&self, key: &KeyId, args: &TransitStateArgs)
        -> Result<String, ChainError>;

    /// `None` while the transaction is pending.
    async fn receipt(&self, tx: &str) -> Result<Option<TxReceipt>, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    async fn gist_root_info(&self, root: &Hash) -> Result<GistRootInfo, ChainError>;

    async fn gist_proof(&self, id: &Did) -> Result<GistProof, ChainError>;

    /// Latest published state of `id`, `None` for identities that never
    /// transitioned.
    async fn latest_state(&self, id: &Did) -> Result<Option<Hash>, ChainError>;
}

fn is_revert(e: &ChainError) -> bool {
    match e {
        ChainError::Rpc { code, message } => {
            *code == REVERT_CODE || message.to_ascii_lowercase().contains("revert")
        }
        _ => false,
    }
}

fn revert_or(e: ChainError) -> ChainError {
    if is_revert(&e) {
        ChainError::Reverted(e.to_string())
    } else {
        e
    }
}

/// Builds, signs and sends transactions from KMS-held keys.
pub struct Transactor {
    rpc: Arc<EthClient>,
    kms: Kms,
    chain_id: u64,
    gas: GasSettings,
}

impl Transactor {
    pub fn new(rpc: Arc<EthClient>, kms: Kms, chain_id: u64, gas: GasSettings) -> Self {
        Self {
            rpc,
            kms,
            chain_id,
            gas,
        }
    }

    pub fn rpc(&self) -> &Arc<EthClient> {
        &self.rpc
    }

    /// Sends a contract call and returns its transaction hash.
    ///
    /// # Errors
    ///
    /// [`ChainError::Reverted`] when gas estimation shows the call would
    /// revert, otherwise RPC and KMS errors.
    pub async fn send(&self, key: &KeyId, to: &[u8; 20], data: Vec<u8>) -> Result<String, ChainError> {
        let from = self.kms.eth_address(key).await?;
        let nonce = self.rpc.transaction_count(&from).await?;
        let gas_limit = match self.gas.gas_limit {
            Some(limit) => limit,
            None => {
                let estimate = self
                    .rpc
                    .estimate_gas(&from, to, &data)
                    .await
                    .map_err(revert_or)?;
                estimate.saturating_add(estimate / 5)
            }
        };
        let fees = if self.gas.gas_less {
            self.gas.gas_less()
        } else {
            let tip = self.rpc.max_priority_fee().await?;
            let base_fee = self.rpc.base_fee().await?;
            self.gas.eip1559(base_fee, tip)
        };

        let tx = UnsignedTx {
            chain_id: self.chain_id,
            nonce,
            to: *to,
            value: 0,
            data,
            gas_limit,
            fees,
        };
        let signature = self.kms.sign(key, &tx.signing_hash()).await?;
        let raw = tx.encode_signed(&signature)?;
        let expected = tx_hash(&raw);

        let hash = self.rpc.send_raw_transaction(&raw).await.map_err(revert_or)?;
        if !hash.eq_ignore_ascii_case(&expected) {
            tracing::warn!(expected, returned = %hash, "node returned unexpected tx hash");
        }
        tracing::info!(
            tx = %hash,
            nonce,
            gas_limit,
            from = %format!("0x{}", hex::encode(from)),
            "transaction sent"
        );
        Ok(hash)
    }
}

fn decimal_word(s: &str) -> Result<Token, ChainError> {
    U256::from_decimal(s).map(Token::Uint)
}

fn field(values: &[String], i: usize, what: &str) -> Result<Token, ChainError> {
    let v = values
        .get(i)
        .ok_or_else(|| ChainError::Decode(format!("proof {what} has no element {i}")))?;
    decimal_word(v)
}

/// Encodes a snarkjs proof as the `(a, b, c)` Solidity verifier arguments.
/// The G2 point's coordinate pairs are swapped.
pub(crate) fn proof_tokens(proof: &ProofData) -> Result<[Token; 3], ChainError> {
    let a = Token::FixedArray(vec![
        field(&proof.pi_a, 0, "a")?,
        field(&proof.pi_a, 1, "a")?,
    ]);
    let mut b_rows = Vec::with_capacity(2);
    for i in 0..2 {
        let row = proof
            .pi_b
            .get(i)
            .ok_or_else(|| ChainError::Decode(format!("proof b has no row {i}")))?;
        b_rows.push(Token::FixedArray(vec![
            field(row, 1, "b")?,
            field(row, 0, "b")?,
        ]));
    }
    let c = Token::FixedArray(vec![
        field(&proof.pi_c, 0, "c")?,
        field(&proof.pi_c, 1, "c")?,
    ]);
    Ok([a, Token::FixedArray(b_rows), c])
}

pub(crate) fn transit_state_calldata(args: &TransitStateArgs) -> Result<Vec<u8>, ChainError> {
    let [a, b, c] = proof_tokens(&args.proof)?;
    Ok(abi::function_call(
        TRANSIT_STATE,
        &[
            Token::Uint(U256::from_le_bytes(args.id.id_le_bytes())),
            Token::Uint(U256::from_hash(&args.old_state)),
            Token::Uint(U256::from_hash(&args.new_state)),
            Token::Bool(args.is_old_state_genesis),
            a,
            b,
            c,
        ],
    ))
}

pub(crate) fn decode_gist_root_info(data: &[u8]) -> Result<GistRootInfo, ChainError> {
    let w = abi::decode_words(data, 6)?;
    Ok(GistRootInfo {
        root: w[0].to_hash()?,
        replaced_by_root: w[1].to_hash()?,
        created_at_timestamp: w[2].to_u64()?,
        replaced_at_timestamp: w[3].to_u64()?,
        created_at_block: w[4].to_u64()?,
        replaced_at_block: w[5].to_u64()?,
    })
}

pub(crate) fn decode_gist_proof(data: &[u8]) -> Result<GistProof, ChainError> {
    let w = abi::decode_words(data, GIST_DEPTH + 7)?;
    let siblings = w[2..2 + GIST_DEPTH]
        .iter()
        .map(U256::to_hash)
        .collect::<Result<Vec<_>, _>>()?;
    let rest = &w[2 + GIST_DEPTH..];
    Ok(GistProof {
        root: w[0].to_hash()?,
        existence: !w[1].is_zero(),
        siblings,
        index: rest[0].to_hash()?,
        value: rest[1].to_hash()?,
        aux_existence: !rest[2].is_zero(),
        aux_index: rest[3].to_hash()?,
        aux_value: rest[4].to_hash()?,
    })
}

/// [`StateContract`] over JSON-RPC.
pub struct EthStateContract {
    transactor: Arc<Transactor>,
    address: [u8; 20],
}

impl EthStateContract {
    pub fn new(transactor: Arc<Transactor>, address: [u8; 20]) -> Self {
        Self {
            transactor,
            address,
        }
    }

    async fn view(&self, signature: &str, arg: U256) -> Result<Vec<u8>, ChainError> {
        let data = abi::function_call(signature, &[Token::Uint(arg)]);
        self.transactor.rpc().call(&self.address, &data).await
    }
}

#[async_trait]
impl StateContract for EthStateContract {
    async fn transit_state(
        &self,
        key: &KeyId,
        args: &TransitStateArgs,
    ) -> Result<String, ChainError> {
        let data = transit_state_calldata(args)?;
        self.transactor.send(key, &self.address, data).await
    }

    async fn receipt(&self, tx: &str) -> Result<Option<TxReceipt>, ChainError> {
        self.transactor.rpc().transaction_receipt(tx).await
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.transactor.rpc().block_number().await
    }

    async fn gist_root_info(&self, root: &Hash) -> Result<GistRootInfo, ChainError> {
        let out = self
            .view(GET_GIST_ROOT_INFO, U256::from_hash(root))
            .await?;
        decode_gist_root_info(&out)
    }

    async fn gist_proof(&self, id: &Did) -> Result<GistProof, ChainError> {
        let out = self
            .view(GET_GIST_PROOF, U256::from_le_bytes(id.id_le_bytes()))
            .await?;
        decode_gist_proof(&out)
    }

    async fn latest_state(&self, id: &Did) -> Result<Option<Hash>, ChainError> {
        // (id, state, replacedByState, createdAtTimestamp, ...); unknown ids revert.
        match self
            .view(GET_STATE_INFO_BY_ID, U256::from_le_bytes(id.id_le_bytes()))
            .await
        {
            Ok(out) => {
                let w = abi::decode_words(&out, 2)?;
                Ok(Some(w[1].to_hash()?))
            }
            Err(e) if is_revert(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// The on-chain reverse hash service.
pub struct TreeStoreContract {
    transactor: Arc<Transactor>,
    address: [u8; 20],
}

impl TreeStoreContract {
    pub fn new(transactor: Arc<Transactor>, address: [u8; 20]) -> Self {
        Self {
            transactor,
            address,
        }
    }

    pub fn address(&self) -> &[u8; 20] {
        &self.address
    }

    /// Calldata of `saveNodes`. Each entry is the preimage of one node,
    /// i.e. its children.
    pub fn save_nodes_calldata(nodes: &[Vec<Hash>]) -> Vec<u8> {
        let rows = nodes
            .iter()
            .map(|children| Token::Array(abi::uints(children.iter().map(U256::from_hash))))
            .collect();
        abi::function_call(SAVE_NODES, &[Token::Array(rows)])
    }

    /// # Errors
    ///
    /// See [`Transactor::send`].
    pub async fn save_nodes(&self, key: &KeyId, nodes: &[Vec<Hash>]) -> Result<String, ChainError> {
        self.transactor
            .send(key, &self.address, Self::save_nodes_calldata(nodes))
            .await
    }
}

/// Synthetic transaction hash for contracts that do not hit a chain.
pub(crate) fn synthetic_tx_hash(parts: &[&[u8]]) -> String {
    let mut hasher = Keccak256::new();
    for p in parts {
        hasher.update(p);
    }
    format!("0x{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use issuer_types::{Blockchain, DidMethod, NetworkId};

    fn proof() -> ProofData {
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        ProofData {
            pi_a: s(&["1", "2", "1"]),
            pi_b: vec![s(&["3", "4"]), s(&["5", "6"]), s(&["1", "0"])],
            pi_c: s(&["7", "8", "1"]),
            protocol: "groth16".into(),
            curve: "bn128".into(),
        }
    }

    fn word(data: &[u8], i: usize) -> u64 {
        let start = 4 + i * 32;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&data[start + 24..start + 32]);
        u64::from_be_bytes(buf)
    }

    #[test]
    fn transit_state_swaps_g2_coordinates() {
        let did = Did::from_genesis_state(
            DidMethod::Iden3,
            Blockchain::Polygon,
            NetworkId::Amoy,
            Hash::from_u64(5).as_le_bytes(),
        )
        .expect("did");
        let data = transit_state_calldata(&TransitStateArgs {
            id: did,
            old_state: Hash::from_u64(5),
            new_state: Hash::from_u64(6),
            is_old_state_genesis: true,
            proof: proof(),
        })
        .expect("calldata");

        assert_eq!(&data[..4], &abi::selector(TRANSIT_STATE));
        // id, old, new, genesis, a[2], b[2][2], c[2]
        assert_eq!(data.len(), 4 + 12 * 32);
        assert_eq!(word(&data, 1), 5);
        assert_eq!(word(&data, 2), 6);
        assert_eq!(word(&data, 3), 1);
        let rest: Vec<u64> = (4..12).map(|i| word(&data, i)).collect();
        assert_eq!(rest, vec![1, 2, 4, 3, 6, 5, 7, 8]);
    }

    #[test]
    fn short_proofs_are_rejected() {
        let mut bad = proof();
        bad.pi_b.truncate(1);
        assert!(matches!(proof_tokens(&bad), Err(ChainError::Decode(_))));
    }

    #[test]
    fn gist_root_info_decodes_six_words() {
        let mut data = Vec::new();
        for n in [11u64, 0, 1_700_000_000, 0, 42, 0] {
            data.extend_from_slice(&U256::from_u64(n).0);
        }
        let info = decode_gist_root_info(&data).expect("decode");
        assert_eq!(info.root, Hash::from_u64(11));
        assert_eq!(info.created_at_timestamp, 1_700_000_000);
        assert_eq!(info.created_at_block, 42);
        assert!(decode_gist_root_info(&data[..64]).is_err());
    }

    #[test]
    fn gist_proof_decodes_fixed_siblings() {
        let mut data = Vec::new();
        data.extend_from_slice(&U256::from_u64(9).0);
        data.extend_from_slice(&U256::from_u64(1).0);
        for i in 0..GIST_DEPTH as u64 {
            data.extend_from_slice(&U256::from_u64(i).0);
        }
        for n in [3u64, 4, 0, 0, 0] {
            data.extend_from_slice(&U256::from_u64(n).0);
        }
        let proof = decode_gist_proof(&data).expect("decode");
        assert!(proof.existence);
        assert_eq!(proof.siblings.len(), GIST_DEPTH);
        assert_eq!(proof.siblings[63], Hash::from_u64(63));
        assert_eq!(proof.index, Hash::from_u64(3));
        assert_eq!(proof.value, Hash::from_u64(4));
        assert!(!proof.aux_existence);
    }

    #[test]
    fn save_nodes_encodes_nested_arrays() {
        let data = TreeStoreContract::save_nodes_calldata(&[
            vec![Hash::from_u64(1), Hash::from_u64(2)],
            vec![Hash::from_u64(3), Hash::from_u64(4), Hash::from_u64(1)],
        ]);
        assert_eq!(&data[..4], &abi::selector(SAVE_NODES));
        // offset, len, two offsets, [len, 1, 2], [len, 3, 4, 1]
        assert_eq!(data.len(), 4 + 11 * 32);
        assert_eq!(word(&data, 1), 2);
    }

    #[test]
    fn reverts_are_recognized() {
        assert!(is_revert(&ChainError::Rpc {
            code: 3,
            message: "execution reverted".into()
        }));
        assert!(is_revert(&ChainError::Rpc {
            code: -32000,
            message: "Execution Reverted: bad state".into()
        }));
        assert!(!is_revert(&ChainError::Timeout));
        assert!(matches!(
            revert_or(ChainError::Rpc {
                code: 3,
                message: "x".into()
            }),
            ChainError::Reverted(_)
        ));
    }
}
