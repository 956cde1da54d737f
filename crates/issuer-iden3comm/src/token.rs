//! Compact `header.payload.signature` serialization shared by JWS and JWZ.

use crate::PackerError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use issuer_crypto::{poseidon, Hash};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub(crate) fn encode(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn decode(segment: &str, what: &str) -> Result<Vec<u8>, PackerError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| PackerError::Malformed(format!("{what}: {e}")))
}

pub(crate) fn decode_json<T: DeserializeOwned>(segment: &str, what: &str) -> Result<T, PackerError> {
    serde_json::from_slice(&decode(segment, what)?)
        .map_err(|e| PackerError::Malformed(format!("{what}: {e}")))
}

/// A token split into its three segments.
pub(crate) struct Compact<'a> {
    pub header: &'a str,
    pub payload: &'a str,
    pub signature: &'a str,
}

impl<'a> Compact<'a> {
    pub fn split(token: &'a str) -> Result<Self, PackerError> {
        let mut parts = token.trim().split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(header), Some(payload), Some(signature), None) => Ok(Self {
                header,
                payload,
                signature,
            }),
            _ => Err(PackerError::Malformed("expected three token segments".into())),
        }
    }

    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.header, self.payload)
    }
}

pub(crate) fn signing_input<H: Serialize>(header: &H, payload: &[u8]) -> Result<String, PackerError> {
    Ok(format!("{}.{}", encode(serde_json::to_vec(header)?), encode(payload)))
}

/// `Poseidon(sha256(input))`, the digest is read as a little-endian field
/// element. Signed by JWS and used as the JWZ challenge.
pub fn signing_digest(input: &[u8]) -> Result<Hash, PackerError> {
    let digest = Sha256::digest(input);
    Ok(poseidon::hash(&[Hash::reduce_le_bytes(&digest)])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_needs_exactly_three_segments() {
        let token = Compact::split("a.b.c").expect("three");
        assert_eq!(token.signing_input(), "a.b");
        assert!(Compact::split("a.b").is_err());
        assert!(Compact::split("a.b.c.d").is_err());
    }

    #[test]
    fn digest_depends_on_every_byte() {
        let a = signing_digest(b"header.payload").expect("digest");
        let b = signing_digest(b"header.payloae").expect("digest");
        assert_ne!(a, b);
        assert_eq!(a, signing_digest(b"header.payload").expect("digest"));
    }
}
