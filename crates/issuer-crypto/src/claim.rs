//! Iden3 core claim codec.
//!
//! A core claim is eight 32-byte little-endian slots, four index slots and
//! four value slots:
//!
//! | Slot | Contents |
//! |------|----------|
//! | `i0` | schema hash (16) · flags (4) · version (4) · reserved |
//! | `i1` | subject identifier when the subject sits in the index |
//! | `i2`, `i3` | index data (merklized root in `i2` when flagged) |
//! | `v0` | revocation nonce (8) · expiration (8) · reserved |
//! | `v1` | subject identifier when the subject sits in the value |
//! | `v2`, `v3` | value data (merklized root in `v2` when flagged) |
//!
//! `hash_index = Poseidon(i0..i3)`, `hash_value = Poseidon(v0..v3)`.

use crate::babyjubjub::PublicKey;
use crate::{poseidon, CryptoError, Hash};
use sha3::{Digest, Keccak256};

/// Size of a serialized core claim.
pub const CLAIM_BYTES: usize = 256;

/// 128-bit schema identifier.
pub type SchemaHash = [u8; 16];

const FLAGS_BYTE: usize = 16;
const SUBJECT_MASK: u8 = 0b0000_0111;
const EXPIRATION_BIT: u8 = 3;
const UPDATABLE_BIT: u8 = 4;
const MERKLIZED_SHIFT: u8 = 5;
const MERKLIZED_MASK: u8 = 0b0110_0000;

/// Derives a schema hash from its JSON-LD context URL and type name.
///
/// The hash is the last 16 bytes of `Keccak256(context_url + "#" + type)`.
pub fn schema_hash(context_url: &str, type_name: &str) -> SchemaHash {
    let digest = Keccak256::digest(format!("{context_url}#{type_name}").as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[16..]);
    out
}

/// Where the claim subject's identifier is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectPosition {
    /// Self-issued; no subject slot.
    SelfSubject,
    Index,
    Value,
}

impl SubjectPosition {
    fn bits(self) -> u8 {
        match self {
            Self::SelfSubject => 0b000,
            Self::Index => 0b010,
            Self::Value => 0b011,
        }
    }

    fn from_bits(bits: u8) -> Result<Self, CryptoError> {
        match bits {
            0b000 => Ok(Self::SelfSubject),
            0b010 => Ok(Self::Index),
            0b011 => Ok(Self::Value),
            other => Err(CryptoError::InvalidClaim(format!("invalid subject flag {other:#05b}"))),
        }
    }
}

/// Where a merklized credential-subject root is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerklizedPosition {
    None,
    Index,
    Value,
}

/// An Iden3 core claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreClaim {
    index: [[u8; 32]; 4],
    value: [[u8; 32]; 4],
}

impl CoreClaim {
    pub fn new(schema: SchemaHash) -> Self {
        let mut claim = Self {
            index: [[0u8; 32]; 4],
            value: [[0u8; 32]; 4],
        };
        claim.index[0][..16].copy_from_slice(&schema);
        claim
    }

    /// Builds the Baby Jubjub authentication claim for `key`.
    pub fn auth_bjj(key: &PublicKey, revocation_nonce: u64) -> Self {
        let mut schema = [0u8; 16];
        // The constant is valid 32-char hex.
        if let Ok(bytes) = hex::decode(issuer_types::AUTH_BJJ_SCHEMA_HEX) {
            schema.copy_from_slice(&bytes);
        }
        let mut claim = Self::new(schema);
        claim.set_index_data(&Hash::from_fr(&key.point().x), &Hash::from_fr(&key.point().y));
        claim.set_revocation_nonce(revocation_nonce);
        claim
    }

    pub fn schema_hash(&self) -> SchemaHash {
        let mut out = [0u8; 16];
        out.copy_from_slice(&self.index[0][..16]);
        out
    }

    fn set_flag_bit(&mut self, bit: u8, on: bool) {
        if on {
            self.index[0][FLAGS_BYTE] |= 1 << bit;
        } else {
            self.index[0][FLAGS_BYTE] &= !(1 << bit);
        }
    }

    fn flag_bit(&self, bit: u8) -> bool {
        self.index[0][FLAGS_BYTE] & (1 << bit) != 0
    }

    /// Stores `id` (a 31-byte identifier) as the claim subject.
    pub fn set_subject(&mut self, position: SubjectPosition, id: &[u8; 31]) {
        self.index[1] = [0u8; 32];
        self.value[1] = [0u8; 32];
        self.index[0][FLAGS_BYTE] =
            (self.index[0][FLAGS_BYTE] & !SUBJECT_MASK) | position.bits();
        match position {
            SubjectPosition::SelfSubject => {}
            SubjectPosition::Index => self.index[1][..31].copy_from_slice(id),
            SubjectPosition::Value => self.value[1][..31].copy_from_slice(id),
        }
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidClaim`] on an unknown subject flag.
    pub fn subject_position(&self) -> Result<SubjectPosition, CryptoError> {
        SubjectPosition::from_bits(self.index[0][FLAGS_BYTE] & SUBJECT_MASK)
    }

    /// The subject identifier, if the claim has one.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidClaim`] on an unknown subject flag.
    pub fn subject_id(&self) -> Result<Option<[u8; 31]>, CryptoError> {
        let slot = match self.subject_position()? {
            SubjectPosition::SelfSubject => return Ok(None),
            SubjectPosition::Index => &self.index[1],
            SubjectPosition::Value => &self.value[1],
        };
        let mut id = [0u8; 31];
        id.copy_from_slice(&slot[..31]);
        Ok(Some(id))
    }

    pub fn set_merklized_root(&mut self, position: MerklizedPosition, root: &Hash) {
        let bits = match position {
            MerklizedPosition::None => 0b00,
            MerklizedPosition::Index => 0b01,
            MerklizedPosition::Value => 0b10,
        };
        self.index[0][FLAGS_BYTE] =
            (self.index[0][FLAGS_BYTE] & !MERKLIZED_MASK) | (bits << MERKLIZED_SHIFT);
        match position {
            MerklizedPosition::None => {}
            MerklizedPosition::Index => self.index[2] = *root.as_le_bytes(),
            MerklizedPosition::Value => self.value[2] = *root.as_le_bytes(),
        }
    }

    pub fn merklized_root(&self) -> Option<Hash> {
        match (self.index[0][FLAGS_BYTE] & MERKLIZED_MASK) >> MERKLIZED_SHIFT {
            0b01 => Hash::from_le_bytes(self.index[2]).ok(),
            0b10 => Hash::from_le_bytes(self.value[2]).ok(),
            _ => None,
        }
    }

    pub fn set_updatable(&mut self, updatable: bool) {
        self.set_flag_bit(UPDATABLE_BIT, updatable);
    }

    pub fn updatable(&self) -> bool {
        self.flag_bit(UPDATABLE_BIT)
    }

    pub fn set_version(&mut self, version: u32) {
        self.index[0][20..24].copy_from_slice(&version.to_le_bytes());
    }

    pub fn version(&self) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.index[0][20..24]);
        u32::from_le_bytes(buf)
    }

    pub fn set_revocation_nonce(&mut self, nonce: u64) {
        self.value[0][..8].copy_from_slice(&nonce.to_le_bytes());
    }

    pub fn revocation_nonce(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.value[0][..8]);
        u64::from_le_bytes(buf)
    }

    /// Sets or clears the expiration, in unix seconds.
    pub fn set_expiration(&mut self, expiration: Option<u64>) {
        match expiration {
            Some(ts) => {
                self.set_flag_bit(EXPIRATION_BIT, true);
                self.value[0][8..16].copy_from_slice(&ts.to_le_bytes());
            }
            None => {
                self.set_flag_bit(EXPIRATION_BIT, false);
                self.value[0][8..16].copy_from_slice(&[0u8; 8]);
            }
        }
    }

    pub fn expiration(&self) -> Option<u64> {
        if !self.flag_bit(EXPIRATION_BIT) {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.value[0][8..16]);
        Some(u64::from_le_bytes(buf))
    }

    pub fn set_index_data(&mut self, a: &Hash, b: &Hash) {
        self.index[2] = *a.as_le_bytes();
        self.index[3] = *b.as_le_bytes();
    }

    pub fn set_value_data(&mut self, a: &Hash, b: &Hash) {
        self.value[2] = *a.as_le_bytes();
        self.value[3] = *b.as_le_bytes();
    }

    /// Index data slots `i2`, `i3`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidFieldElement`] if a slot is not canonical.
    pub fn index_data(&self) -> Result<(Hash, Hash), CryptoError> {
        Ok((
            Hash::from_le_bytes(self.index[2])?,
            Hash::from_le_bytes(self.index[3])?,
        ))
    }

    fn slots(&self, half: &[[u8; 32]; 4]) -> Result<[Hash; 4], CryptoError> {
        Ok([
            Hash::from_le_bytes(half[0])?,
            Hash::from_le_bytes(half[1])?,
            Hash::from_le_bytes(half[2])?,
            Hash::from_le_bytes(half[3])?,
        ])
    }

    /// # Errors
    ///
    /// Fails if a slot is not a canonical field element or hashing fails.
    pub fn hash_index(&self) -> Result<Hash, CryptoError> {
        poseidon::hash(&self.slots(&self.index)?)
    }

    /// # Errors
    ///
    /// Fails if a slot is not a canonical field element or hashing fails.
    pub fn hash_value(&self) -> Result<Hash, CryptoError> {
        poseidon::hash(&self.slots(&self.value)?)
    }

    /// `(hash_index, hash_value)`, the key and value of the claim's leaf.
    ///
    /// # Errors
    ///
    /// See [`hash_index`](Self::hash_index).
    pub fn hi_hv(&self) -> Result<(Hash, Hash), CryptoError> {
        Ok((self.hash_index()?, self.hash_value()?))
    }

    /// `Poseidon(hash_index, hash_value)`, the digest signed by issuers.
    ///
    /// # Errors
    ///
    /// See [`hash_index`](Self::hash_index).
    pub fn signing_hash(&self) -> Result<Hash, CryptoError> {
        let (hi, hv) = self.hi_hv()?;
        poseidon::hash(&[hi, hv])
    }

    /// All eight slots as decimal strings, the circuit input form.
    pub fn to_decimal_slots(&self) -> Vec<String> {
        self.index
            .iter()
            .chain(self.value.iter())
            .map(|slot| num_bigint::BigUint::from_bytes_le(slot).to_string())
            .collect()
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidClaim`] if fewer or more than eight
    /// slots are given or a slot is not a canonical field element.
    pub fn from_decimal_slots(slots: &[String]) -> Result<Self, CryptoError> {
        if slots.len() != 8 {
            return Err(CryptoError::InvalidClaim(format!(
                "expected 8 slots, got {}",
                slots.len()
            )));
        }
        let mut bytes = [0u8; CLAIM_BYTES];
        for (i, s) in slots.iter().enumerate() {
            let h = Hash::from_decimal(s).map_err(|e| CryptoError::InvalidClaim(e.to_string()))?;
            bytes[i * 32..(i + 1) * 32].copy_from_slice(h.as_le_bytes());
        }
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; CLAIM_BYTES] {
        let mut out = [0u8; CLAIM_BYTES];
        for (i, slot) in self.index.iter().chain(self.value.iter()).enumerate() {
            out[i * 32..(i + 1) * 32].copy_from_slice(slot);
        }
        out
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidClaim`] if the blob is not 256 bytes or
    /// a slot is not a canonical field element.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != CLAIM_BYTES {
            return Err(CryptoError::InvalidClaim(format!(
                "expected {CLAIM_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        let mut claim = Self {
            index: [[0u8; 32]; 4],
            value: [[0u8; 32]; 4],
        };
        for i in 0..8 {
            let mut slot = [0u8; 32];
            slot.copy_from_slice(&bytes[i * 32..(i + 1) * 32]);
            Hash::from_le_bytes(slot).map_err(|e| CryptoError::InvalidClaim(e.to_string()))?;
            if i < 4 {
                claim.index[i] = slot;
            } else {
                claim.value[i - 4] = slot;
            }
        }
        claim.subject_position()?;
        Ok(claim)
    }

    /// Hex of the 256 serialized bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::babyjubjub::PrivateKey;

    fn subject() -> [u8; 31] {
        let mut id = [0u8; 31];
        id[0] = 0x02;
        id[1] = 0x13;
        id[5] = 0xaa;
        id
    }

    #[test]
    fn schema_hash_is_keccak_tail() {
        let a = schema_hash("https://example.com/kyc-v3.json-ld", "KYCAgeCredential");
        let b = schema_hash("https://example.com/kyc-v3.json-ld", "KYCAgeCredential");
        let c = schema_hash("https://example.com/kyc-v3.json-ld", "KYCCountryOfResidenceCredential");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn header_fields_roundtrip() {
        let mut claim = CoreClaim::new([7u8; 16]);
        claim.set_subject(SubjectPosition::Index, &subject());
        claim.set_revocation_nonce(0xdead_beef);
        claim.set_expiration(Some(1_900_000_000));
        claim.set_version(3);
        claim.set_updatable(true);
        claim.set_merklized_root(MerklizedPosition::Index, &Hash::from_u64(55));

        assert_eq!(claim.schema_hash(), [7u8; 16]);
        assert_eq!(claim.subject_position(), Ok(SubjectPosition::Index));
        assert_eq!(claim.subject_id(), Ok(Some(subject())));
        assert_eq!(claim.revocation_nonce(), 0xdead_beef);
        assert_eq!(claim.expiration(), Some(1_900_000_000));
        assert_eq!(claim.version(), 3);
        assert!(claim.updatable());
        assert_eq!(claim.merklized_root(), Some(Hash::from_u64(55)));

        claim.set_expiration(None);
        assert_eq!(claim.expiration(), None);
        assert!(claim.updatable(), "clearing expiration keeps other flags");
    }

    #[test]
    fn bytes_roundtrip_and_validation() {
        let mut claim = CoreClaim::new([1u8; 16]);
        claim.set_subject(SubjectPosition::Value, &subject());
        claim.set_revocation_nonce(9);
        let bytes = claim.to_bytes();
        assert_eq!(CoreClaim::from_bytes(&bytes), Ok(claim.clone()));

        assert!(CoreClaim::from_bytes(&bytes[..100]).is_err());

        let mut bad = bytes;
        bad[255] = 0xff;
        bad[254] = 0xff;
        assert!(CoreClaim::from_bytes(&bad).is_err());
    }

    #[test]
    fn decimal_slots_roundtrip() {
        let sk = PrivateKey::from_bytes([3u8; 32]);
        let claim = CoreClaim::auth_bjj(&sk.public(), 42);
        let slots = claim.to_decimal_slots();
        assert_eq!(slots.len(), 8);
        assert_eq!(CoreClaim::from_decimal_slots(&slots), Ok(claim));
    }

    #[test]
    fn auth_claim_embeds_public_key() {
        let sk = PrivateKey::from_bytes([3u8; 32]);
        let pk = sk.public();
        let claim = CoreClaim::auth_bjj(&pk, 42);
        let (x, y) = claim.index_data().expect("slots are canonical");
        assert_eq!(x.to_fr(), pk.point().x);
        assert_eq!(y.to_fr(), pk.point().y);
        assert_eq!(claim.revocation_nonce(), 42);
        assert_eq!(claim.subject_position(), Ok(SubjectPosition::SelfSubject));
        assert_eq!(hex::encode(claim.schema_hash()), issuer_types::AUTH_BJJ_SCHEMA_HEX);
    }

    #[test]
    fn nonce_changes_value_hash_only() {
        let sk = PrivateKey::from_bytes([3u8; 32]);
        let a = CoreClaim::auth_bjj(&sk.public(), 1);
        let b = CoreClaim::auth_bjj(&sk.public(), 2);
        assert_eq!(a.hash_index(), b.hash_index());
        assert_ne!(a.hash_value(), b.hash_value());
    }
}
