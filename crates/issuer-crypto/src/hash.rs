use crate::{CryptoError, Fr};
use ark_ff::{BigInteger, PrimeField};
use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A BN254 scalar field element in little-endian byte order.
///
/// This is the unit every tree node, root, state and claim hash is stored
/// and exchanged as. Constructors reject non-canonical encodings, so a
/// `Hash` always converts to an [`Fr`] without reduction.
///
/// Text forms: [`hex`](Hash::hex) is the hex of the little-endian bytes
/// (reverse hash service, state columns); [`Display`] and serde use the
/// decimal integer (proof JSON, circuit inputs).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The empty-node sentinel.
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_fr(fr: &Fr) -> Self {
        let bytes = fr.into_bigint().to_bytes_le();
        let mut out = [0u8; 32];
        out[..bytes.len()].copy_from_slice(&bytes);
        Self(out)
    }

    pub fn to_fr(&self) -> Fr {
        Fr::from_le_bytes_mod_order(&self.0)
    }

    pub fn from_u64(n: u64) -> Self {
        let mut out = [0u8; 32];
        out[..8].copy_from_slice(&n.to_le_bytes());
        Self(out)
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidFieldElement`] if the value is not
    /// below the field modulus.
    pub fn from_le_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        let fr = Fr::from_le_bytes_mod_order(&bytes);
        let hash = Self::from_fr(&fr);
        if hash.0 != bytes {
            return Err(CryptoError::InvalidFieldElement(hex::encode(bytes)));
        }
        Ok(hash)
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidFieldElement`] if the slice is not 32
    /// bytes or not canonical.
    pub fn from_le_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidFieldElement(format!("expected 32 bytes, got {}", bytes.len())))?;
        Self::from_le_bytes(arr)
    }

    /// Reduces arbitrary little-endian bytes, such as a digest, into the
    /// field.
    pub fn reduce_le_bytes(bytes: &[u8]) -> Self {
        Self::from_fr(&Fr::from_le_bytes_mod_order(bytes))
    }

    pub fn as_le_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Big-endian bytes, as used by contract `uint256` words.
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut out = self.0;
        out.reverse();
        out
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidFieldElement`] if not canonical.
    pub fn from_be_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        let mut le = bytes;
        le.reverse();
        Self::from_le_bytes(le)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Hex of the little-endian bytes.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidFieldElement`] on bad hex or a
    /// non-canonical value.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| CryptoError::InvalidFieldElement(e.to_string()))?;
        Self::from_le_slice(&bytes)
    }

    pub fn to_decimal(&self) -> String {
        BigUint::from_bytes_le(&self.0).to_string()
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidFieldElement`] if `s` is not a decimal
    /// integer below the modulus.
    pub fn from_decimal(s: &str) -> Result<Self, CryptoError> {
        let n = BigUint::from_str(s).map_err(|e| CryptoError::InvalidFieldElement(e.to_string()))?;
        let bytes = n.to_bytes_le();
        if bytes.len() > 32 {
            return Err(CryptoError::InvalidFieldElement(s.to_string()));
        }
        let mut out = [0u8; 32];
        out[..bytes.len()].copy_from_slice(&bytes);
        Self::from_le_bytes(out)
    }

    /// Whether bit `i` of the little-endian integer is set. Path bits of a
    /// sparse Merkle tree key are read this way.
    pub fn test_bit(&self, i: usize) -> bool {
        if i >= 256 {
            return false;
        }
        self.0[i / 8] & (1 << (i % 8)) != 0
    }
}

impl From<Fr> for Hash {
    fn from(fr: Fr) -> Self {
        Self::from_fr(&fr)
    }
}

impl From<&Fr> for Hash {
    fn from(fr: &Fr) -> Self {
        Self::from_fr(fr)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_decimal())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.hex())
    }
}

impl FromStr for Hash {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_decimal(s)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_decimal(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // r - 1 for BN254.
    const MAX_DECIMAL: &str =
        "21888242871839275222246405745257275088548364400416034343698204186575808495616";

    #[test]
    fn decimal_and_hex_forms_agree() {
        let h = Hash::from_u64(258);
        assert_eq!(h.to_decimal(), "258");
        assert_eq!(
            h.hex(),
            "0201000000000000000000000000000000000000000000000000000000000000"
        );
        assert_eq!(Hash::from_hex(&h.hex()).expect("hex parses"), h);
        assert_eq!(Hash::from_decimal("258").expect("decimal parses"), h);
    }

    #[test]
    fn fr_conversion_roundtrips() {
        let fr = Fr::from(123_456_789u64);
        let h = Hash::from_fr(&fr);
        assert_eq!(h.to_fr(), fr);
        assert_eq!(h.to_decimal(), "123456789");
    }

    #[test]
    fn rejects_values_at_or_above_modulus() {
        let max = Hash::from_decimal(MAX_DECIMAL).expect("r - 1 is canonical");
        assert_eq!(max.to_fr(), -Fr::from(1u64));

        let modulus =
            "21888242871839275222246405745257275088548364400416034343698204186575808495617";
        assert!(Hash::from_decimal(modulus).is_err());
        assert!(Hash::from_le_bytes([0xff; 32]).is_err());
        let reduced = Hash::reduce_le_bytes(&[0xff; 32]);
        assert_eq!(Hash::from_le_bytes(*reduced.as_le_bytes()).expect("canonical"), reduced);
        assert_eq!(Hash::reduce_le_bytes(&[7]), Hash::from_u64(7));
    }

    #[test]
    fn big_endian_is_reversed() {
        let h = Hash::from_u64(1);
        let be = h.to_be_bytes();
        assert_eq!(be[31], 1);
        assert_eq!(Hash::from_be_bytes(be).expect("canonical"), h);
    }

    #[test]
    fn test_bit_reads_little_endian_bits() {
        let h = Hash::from_u64(0b1010);
        assert!(!h.test_bit(0));
        assert!(h.test_bit(1));
        assert!(!h.test_bit(2));
        assert!(h.test_bit(3));
        assert!(!h.test_bit(300));
    }

    #[test]
    fn serde_uses_decimal_strings() {
        let h = Hash::from_u64(42);
        assert_eq!(serde_json::to_string(&h).expect("serialize"), "\"42\"");
        let back: Hash = serde_json::from_str("\"42\"").expect("deserialize");
        assert_eq!(back, h);
    }
}
