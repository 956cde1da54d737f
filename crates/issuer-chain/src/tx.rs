//! Transaction envelopes and fee selection.

use crate::rlp;
use crate::ChainError;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// Gas policy for issuer transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasSettings {
    /// Lower bound on any fee per gas, in wei. Zero disables the bound.
    #[serde(default)]
    pub min_gas_price: u64,
    /// Upper bound on any fee per gas, in wei. Zero disables the bound.
    #[serde(default)]
    pub max_gas_price: u64,
    /// Send type-0 transactions with a zero gas price, for networks that
    /// sponsor gas.
    #[serde(default)]
    pub gas_less: bool,
    /// Fixed gas limit. When absent the node's estimate plus 20% is used.
    #[serde(default)]
    pub gas_limit: Option<u64>,
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            min_gas_price: 0,
            max_gas_price: 0,
            gas_less: false,
            gas_limit: None,
        }
    }
}

impl GasSettings {
    fn clamp(&self, fee: u128) -> u128 {
        let mut fee = fee;
        if self.min_gas_price > 0 {
            fee = fee.max(u128::from(self.min_gas_price));
        }
        if self.max_gas_price > 0 {
            fee = fee.min(u128::from(self.max_gas_price));
        }
        fee
    }

    /// EIP-1559 fees: tip from the node, cap `2 * base_fee + tip`, both
    /// clamped into the configured bounds.
    pub fn eip1559(&self, base_fee: u128, tip: u128) -> Fees {
        let max_priority_fee = self.clamp(tip);
        let max_fee = self
            .clamp(base_fee.saturating_mul(2).saturating_add(max_priority_fee))
            .max(max_priority_fee);
        Fees::Eip1559 {
            max_priority_fee,
            max_fee,
        }
    }

    /// Gas-less legacy fees.
    pub fn gas_less(&self) -> Fees {
        Fees::Legacy { gas_price: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fees {
    Eip1559 { max_priority_fee: u128, max_fee: u128 },
    Legacy { gas_price: u128 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTx {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: [u8; 20],
    pub value: u128,
    pub data: Vec<u8>,
    pub gas_limit: u64,
    pub fees: Fees,
}

impl UnsignedTx {
    fn common_fields(&self) -> Vec<Vec<u8>> {
        vec![
            rlp::encode_uint(u128::from(self.gas_limit)),
            rlp::encode_bytes(&self.to),
            rlp::encode_uint(self.value),
            rlp::encode_bytes(&self.data),
        ]
    }

    fn payload(&self, signature: Option<(&[u8], &[u8], u8)>) -> Vec<u8> {
        match self.fees {
            Fees::Eip1559 {
                max_priority_fee,
                max_fee,
            } => {
                let mut fields = vec![
                    rlp::encode_uint(u128::from(self.chain_id)),
                    rlp::encode_uint(u128::from(self.nonce)),
                    rlp::encode_uint(max_priority_fee),
                    rlp::encode_uint(max_fee),
                ];
                fields.extend(self.common_fields());
                fields.push(rlp::encode_list(&[]));
                if let Some((r, s, recid)) = signature {
                    fields.push(rlp::encode_uint(u128::from(recid)));
                    fields.push(rlp::encode_uint_bytes(r));
                    fields.push(rlp::encode_uint_bytes(s));
                }
                let mut out = vec![0x02];
                out.extend(rlp::encode_list(&fields));
                out
            }
            Fees::Legacy { gas_price } => {
                let mut fields = vec![
                    rlp::encode_uint(u128::from(self.nonce)),
                    rlp::encode_uint(gas_price),
                ];
                fields.extend(self.common_fields());
                match signature {
                    Some((r, s, recid)) => {
                        let v = u128::from(recid) + 35 + 2 * u128::from(self.chain_id);
                        fields.push(rlp::encode_uint(v));
                        fields.push(rlp::encode_uint_bytes(r));
                        fields.push(rlp::encode_uint_bytes(s));
                    }
                    // EIP-155 replay protection.
                    None => {
                        fields.push(rlp::encode_uint(u128::from(self.chain_id)));
                        fields.push(rlp::encode_uint(0));
                        fields.push(rlp::encode_uint(0));
                    }
                }
                rlp::encode_list(&fields)
            }
        }
    }

    /// The digest the sender signs.
    pub fn signing_hash(&self) -> [u8; 32] {
        Keccak256::digest(self.payload(None)).into()
    }

    /// Raw transaction bytes for `eth_sendRawTransaction`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Signing`] unless `signature` is 65-byte
    /// `r || s || v` with `v` in `{0, 1}`.
    pub fn encode_signed(&self, signature: &[u8]) -> Result<Vec<u8>, ChainError> {
        if signature.len() != 65 || signature[64] > 1 {
            return Err(ChainError::Signing(format!(
                "expected r||s||v signature, got {} bytes",
                signature.len()
            )));
        }
        Ok(self.payload(Some((&signature[..32], &signature[32..64], signature[64]))))
    }
}

/// Keccak-256 of raw transaction bytes, i.e. the transaction hash.
pub fn tx_hash(raw: &[u8]) -> String {
    format!("0x{}", hex::encode(Keccak256::digest(raw)))
}
