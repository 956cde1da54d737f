//! Minimal Solidity ABI encoding for the contract calls the issuer makes.

use crate::ChainError;
use issuer_crypto::Hash;
use num_bigint::BigUint;
use sha3::{Digest, Keccak256};
use std::str::FromStr;

/// A 256-bit unsigned word, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct U256(pub [u8; 32]);

impl U256 {
    pub const ZERO: U256 = U256([0u8; 32]);

    pub fn from_u64(n: u64) -> Self {
        let mut out = [0u8; 32];
        out[24..].copy_from_slice(&n.to_be_bytes());
        Self(out)
    }

    pub fn from_hash(h: &Hash) -> Self {
        Self(h.to_be_bytes())
    }

    /// Reads a little-endian integer such as an identity id.
    pub fn from_le_bytes(le: [u8; 32]) -> Self {
        let mut out = le;
        out.reverse();
        Self(out)
    }

    /// # Errors
    ///
    /// Returns [`ChainError::Decode`] for non-decimal input or overflow.
    pub fn from_decimal(s: &str) -> Result<Self, ChainError> {
        let n = BigUint::from_str(s).map_err(|e| ChainError::Decode(format!("{s}: {e}")))?;
        let bytes = n.to_bytes_be();
        if bytes.len() > 32 {
            return Err(ChainError::Decode(format!("{s} overflows uint256")));
        }
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// # Errors
    ///
    /// Returns [`ChainError::Decode`] if the word is not a field element.
    pub fn to_hash(&self) -> Result<Hash, ChainError> {
        Hash::from_be_bytes(self.0).map_err(|e| ChainError::Decode(e.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`ChainError::Decode`] if the value does not fit in 64 bits.
    pub fn to_u64(&self) -> Result<u64, ChainError> {
        if self.0[..24].iter().any(|b| *b != 0) {
            return Err(ChainError::Decode("word does not fit in u64".into()));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[24..]);
        Ok(u64::from_be_bytes(buf))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Uint(U256),
    Bool(bool),
    Address([u8; 20]),
    /// `T[k]`
    FixedArray(Vec<Token>),
    /// `T[]`
    Array(Vec<Token>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        match self {
            Token::Array(_) => true,
            Token::FixedArray(items) => items.iter().any(Token::is_dynamic),
            _ => false,
        }
    }

    fn head_len(&self) -> usize {
        match self {
            Token::FixedArray(items) if !self.is_dynamic() => {
                items.iter().map(Token::head_len).sum()
            }
            _ => 32,
        }
    }
}

/// First four bytes of `keccak256(signature)`.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

fn encode_static(token: &Token, out: &mut Vec<u8>) {
    match token {
        Token::Uint(word) => out.extend_from_slice(&word.0),
        Token::Bool(b) => out.extend_from_slice(&U256::from_u64(u64::from(*b)).0),
        Token::Address(addr) => {
            out.extend_from_slice(&[0u8; 12]);
            out.extend_from_slice(addr);
        }
        Token::FixedArray(items) => {
            for item in items {
                encode_static(item, out);
            }
        }
        // Dynamic tokens never reach here.
        Token::Array(_) => {}
    }
}

fn encode_tail(token: &Token) -> Vec<u8> {
    match token {
        Token::Array(items) => {
            let mut out = U256::from_u64(items.len() as u64).0.to_vec();
            out.extend(encode(items));
            out
        }
        Token::FixedArray(items) => encode(items),
        _ => Vec::new(),
    }
}

/// ABI-encodes `tokens` as a tuple (head/tail layout).
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let heads_len: usize = tokens.iter().map(Token::head_len).sum();
    let mut head = Vec::with_capacity(heads_len);
    let mut tail = Vec::new();
    for token in tokens {
        if token.is_dynamic() {
            let offset = (heads_len + tail.len()) as u64;
            head.extend_from_slice(&U256::from_u64(offset).0);
            tail.extend(encode_tail(token));
        } else {
            encode_static(token, &mut head);
        }
    }
    head.extend(tail);
    head
}

/// Selector followed by encoded arguments.
pub fn function_call(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut out = selector(signature).to_vec();
    out.extend(encode(tokens));
    out
}

/// Splits return data into words. Only static return types are decoded
/// this way.
///
/// # Errors
///
/// Returns [`ChainError::Decode`] if fewer than `expected` words are
/// present.
pub fn decode_words(data: &[u8], expected: usize) -> Result<Vec<U256>, ChainError> {
    if data.len() < expected * 32 {
        return Err(ChainError::Decode(format!(
            "expected {expected} words, got {} bytes",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(32)
        .take(expected)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word.copy_from_slice(chunk);
            U256(word)
        })
        .collect())
}

pub fn uints(values: impl IntoIterator<Item = U256>) -> Vec<Token> {
    values.into_iter().map(Token::Uint).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_match_known_functions() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
        assert_eq!(hex::encode(selector("balanceOf(address)")), "70a08231");
    }

    #[test]
    fn static_arguments_are_concatenated() {
        let data = encode(&[
            Token::Uint(U256::from_u64(1)),
            Token::Bool(true),
            Token::FixedArray(uints([U256::from_u64(2), U256::from_u64(3)])),
        ]);
        assert_eq!(data.len(), 4 * 32);
        assert_eq!(data[31], 1);
        assert_eq!(data[63], 1);
        assert_eq!(data[95], 2);
        assert_eq!(data[127], 3);
    }

    #[test]
    fn nested_dynamic_arrays_use_offsets() {
        // f(uint256[][]) with [[1, 2], [3]].
        let data = encode(&[Token::Array(vec![
            Token::Array(uints([U256::from_u64(1), U256::from_u64(2)])),
            Token::Array(uints([U256::from_u64(3)])),
        ])]);
        let words: Vec<u64> = decode_words(&data, data.len() / 32)
            .expect("words")
            .iter()
            .map(|w| w.to_u64().expect("small"))
            .collect();
        assert_eq!(words, vec![0x20, 2, 0x40, 0xa0, 2, 1, 2, 1, 3]);
    }

    #[test]
    fn decimal_words_roundtrip_through_hash() {
        let h = Hash::from_u64(987_654_321);
        let w = U256::from_decimal("987654321").expect("decimal");
        assert_eq!(w, U256::from_hash(&h));
        assert_eq!(w.to_hash().expect("field"), h);
        assert!(U256([0xff; 32]).to_hash().is_err());
        assert!(U256([0xff; 32]).to_u64().is_err());
    }
}
