//! Raw key material operations shared by the software backends.

use crate::KmsError;
use issuer_crypto::babyjubjub::PrivateKey;
use issuer_crypto::Hash;
use issuer_types::KeyKind;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};
use zeroize::Zeroizing;

/// Fresh secret bytes for a key of `kind`.
pub(crate) fn generate_secret(kind: KeyKind) -> Zeroizing<[u8; 32]> {
    match kind {
        KeyKind::BabyJubjub => Zeroizing::new(*PrivateKey::generate().as_bytes()),
        KeyKind::Secp256k1 => {
            let key = SigningKey::random(&mut rand::rngs::OsRng);
            let mut out = [0u8; 32];
            out.copy_from_slice(&key.to_bytes());
            Zeroizing::new(out)
        }
    }
}

fn secp_key(secret: &[u8; 32]) -> Result<SigningKey, KmsError> {
    SigningKey::from_slice(secret).map_err(|e| KmsError::Backend(format!("bad secp256k1 key: {e}")))
}

/// BJJ: 32-byte compressed point. secp256k1: 65-byte uncompressed point.
pub(crate) fn public_key(kind: KeyKind, secret: &[u8; 32]) -> Result<Vec<u8>, KmsError> {
    match kind {
        KeyKind::BabyJubjub => Ok(PrivateKey::from_bytes(*secret).public().compress().to_vec()),
        KeyKind::Secp256k1 => {
            let key = secp_key(secret)?;
            Ok(key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec())
        }
    }
}

/// BJJ: `digest` is a little-endian field element; returns the 64-byte
/// compressed signature. secp256k1: `digest` is a 32-byte hash; returns
/// `r || s || v` with `v` in `{0, 1}`.
pub(crate) fn sign(kind: KeyKind, secret: &[u8; 32], digest: &[u8]) -> Result<Vec<u8>, KmsError> {
    match kind {
        KeyKind::BabyJubjub => {
            let msg = Hash::from_le_slice(digest)
                .map_err(|e| KmsError::Backend(format!("digest is not a field element: {e}")))?;
            let sig = PrivateKey::from_bytes(*secret)
                .sign_poseidon(&msg.to_fr())
                .map_err(|e| KmsError::Backend(e.to_string()))?;
            Ok(sig.compress().to_vec())
        }
        KeyKind::Secp256k1 => {
            let key = secp_key(secret)?;
            let (sig, recid) = key
                .sign_prehash_recoverable(digest)
                .map_err(|e| KmsError::Backend(format!("secp256k1 signing failed: {e}")))?;
            Ok(recoverable_bytes(&sig, recid))
        }
    }
}

pub(crate) fn recoverable_bytes(sig: &EcdsaSignature, recid: RecoveryId) -> Vec<u8> {
    let mut out = Vec::with_capacity(65);
    out.extend_from_slice(&sig.to_bytes());
    out.push(recid.to_byte());
    out
}

/// Turns a DER ECDSA signature from a remote signer into `r || s || v`,
/// normalizing `s` and recovering `v` against the known public key.
pub(crate) fn der_to_recoverable(
    der: &[u8],
    digest: &[u8],
    public_uncompressed: &[u8],
) -> Result<Vec<u8>, KmsError> {
    let sig = EcdsaSignature::from_der(der)
        .map_err(|e| KmsError::Backend(format!("bad DER signature: {e}")))?;
    let sig = sig.normalize_s().unwrap_or(sig);
    let expected = VerifyingKey::from_sec1_bytes(public_uncompressed)
        .map_err(|e| KmsError::Backend(format!("bad public key: {e}")))?;
    for byte in 0u8..=1 {
        let Some(recid) = RecoveryId::from_byte(byte) else {
            continue;
        };
        if let Ok(recovered) = VerifyingKey::recover_from_prehash(digest, &sig, recid) {
            if recovered == expected {
                return Ok(recoverable_bytes(&sig, recid));
            }
        }
    }
    Err(KmsError::Backend("could not recover signer from signature".into()))
}

/// Ethereum address of a 65-byte uncompressed secp256k1 public key.
///
/// # Errors
///
/// Returns [`KmsError::WrongKeyType`] for any other key encoding.
pub fn ethereum_address(public_uncompressed: &[u8]) -> Result<[u8; 20], KmsError> {
    if public_uncompressed.len() != 65 || public_uncompressed[0] != 0x04 {
        return Err(KmsError::WrongKeyType(
            "expected a 65-byte uncompressed secp256k1 key".into(),
        ));
    }
    let digest = Keccak256::digest(&public_uncompressed[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    Ok(out)
}
