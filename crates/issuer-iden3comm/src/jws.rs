//! `application/iden3comm-signed-json`: compact JWS signed with a BJJ key.

use crate::resolver::DidResolver;
use crate::token::{self, Compact};
use crate::PackerError;
use issuer_crypto::babyjubjub::Signature;
use issuer_kms::{KeyId, Kms};
use issuer_types::{media_type, Did};
use serde::{Deserialize, Serialize};

pub const ALG_BJJ: &str = "BJJ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

impl JwsHeader {
    /// DID part of `kid`.
    ///
    /// # Errors
    ///
    /// [`PackerError::Malformed`] when `kid` does not start with a DID.
    pub fn signer(&self) -> Result<Did, PackerError> {
        let did = self.kid.split_once('#').map_or(self.kid.as_str(), |(did, _)| did);
        did.parse()
            .map_err(|e| PackerError::Malformed(format!("kid {}: {e}", self.kid)))
    }
}

/// Signs `payload` with `key`, naming `kid` as the verification method.
///
/// # Errors
///
/// KMS failures.
pub async fn sign(kms: &Kms, key: &KeyId, kid: &str, payload: &[u8]) -> Result<String, PackerError> {
    let header = JwsHeader {
        alg: ALG_BJJ.to_string(),
        typ: media_type::SIGNED.to_string(),
        kid: kid.to_string(),
    };
    let input = token::signing_input(&header, payload)?;
    let digest = token::signing_digest(input.as_bytes())?;
    let signature = kms.sign_bjj(key, &digest).await?;
    Ok(format!("{input}.{}", token::encode(signature.compress())))
}

/// Verifies `jws` against the key its `kid` resolves to and returns the
/// header and payload.
///
/// # Errors
///
/// [`PackerError::UnsupportedAlgorithm`], resolution failures and
/// [`PackerError::InvalidSignature`].
pub async fn verify(resolver: &dyn DidResolver, jws: &str) -> Result<(JwsHeader, Vec<u8>), PackerError> {
    let compact = Compact::split(jws)?;
    let header: JwsHeader = token::decode_json(compact.header, "jws header")?;
    if header.alg != ALG_BJJ {
        return Err(PackerError::UnsupportedAlgorithm(header.alg));
    }
    let document = resolver.resolve(&header.signer()?).await?;
    let key = document.bjj_key(&header.kid)?;

    let raw = token::decode(compact.signature, "jws signature")?;
    let signature = Signature::decompress(&raw).map_err(|_| PackerError::InvalidSignature)?;
    let digest = token::signing_digest(compact.signing_input().as_bytes())?;
    key.verify_poseidon(&digest.to_fr(), &signature)
        .map_err(|_| PackerError::InvalidSignature)?;

    let payload = token::decode(compact.payload, "jws payload")?;
    Ok((header, payload))
}
