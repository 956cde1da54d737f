use crate::jwz::{self, Jwz, JwzHeader};
use crate::message::{BasicMessage, MediaType};
use crate::resolver::{bjj_kid, DidResolver};
use crate::state::StateResolver;
use crate::{jws, token, PackerError};
use issuer_chain::StateContract;
use issuer_crypto::zk::{CircuitId, ProofVerifier};
use issuer_identity::IdentityRegistry;
use issuer_state::TransitionEngine;
use issuer_types::Did;
use serde::Deserialize;
use std::sync::Arc;

/// Proves authV2 for outgoing zkp envelopes.
#[derive(Clone)]
struct ZkpSigner {
    engine: TransitionEngine,
    contract: Arc<dyn StateContract>,
}

/// Packs and unpacks agent messages for the identities of this node.
#[derive(Clone)]
pub struct Packager {
    registry: IdentityRegistry,
    dids: Arc<dyn DidResolver>,
    states: Arc<dyn StateResolver>,
    verifier: Arc<dyn ProofVerifier>,
    zkp: Option<ZkpSigner>,
}

#[derive(Deserialize)]
struct AlgOnly {
    alg: String,
}

/// Media type of an envelope, from its shape: JSON objects are plain,
/// compact tokens are told apart by their header `alg`.
///
/// # Errors
///
/// [`PackerError::Malformed`] for anything else.
pub fn sniff(envelope: &[u8]) -> Result<MediaType, PackerError> {
    let text = std::str::from_utf8(envelope)
        .map_err(|_| PackerError::Malformed("envelope is not utf-8".into()))?
        .trim();
    if text.starts_with('{') {
        return Ok(MediaType::Plain);
    }
    let header = text
        .split('.')
        .next()
        .ok_or_else(|| PackerError::Malformed("empty envelope".into()))?;
    let AlgOnly { alg } = token::decode_json(header, "token header")?;
    match alg.as_str() {
        jwz::ALG_GROTH16 => Ok(MediaType::Zkp),
        jws::ALG_BJJ => Ok(MediaType::Signed),
        _ => Err(PackerError::UnsupportedAlgorithm(alg)),
    }
}

impl Packager {
    /// A packager that verifies every envelope but packs zkp only after
    /// [`with_zkp`](Self::with_zkp).
    pub fn new(
        registry: IdentityRegistry,
        dids: Arc<dyn DidResolver>,
        states: Arc<dyn StateResolver>,
        verifier: Arc<dyn ProofVerifier>,
    ) -> Self {
        Self {
            registry,
            dids,
            states,
            verifier,
            zkp: None,
        }
    }

    /// Enables zkp packing: auth proofs come from `engine`, GIST proofs
    /// from `contract`.
    pub fn with_zkp(mut self, engine: TransitionEngine, contract: Arc<dyn StateContract>) -> Self {
        self.zkp = Some(ZkpSigner { engine, contract });
        self
    }

    /// Wraps `message` from `sender` in a `media_type` envelope.
    ///
    /// # Errors
    ///
    /// [`PackerError::SenderMismatch`] when the message names another
    /// sender, [`PackerError::NoProver`] for zkp without a prover, key and
    /// proof failures.
    pub async fn pack(
        &self,
        media_type: MediaType,
        message: &BasicMessage,
        sender: &Did,
    ) -> Result<Vec<u8>, PackerError> {
        if message.sender()? != *sender {
            return Err(PackerError::SenderMismatch {
                sender: sender.to_string(),
                from: message.from.clone().unwrap_or_default(),
            });
        }
        let mut message = message.clone();
        message.typ = Some(media_type.as_str().to_string());
        let payload = serde_json::to_vec(&message)?;

        let packed = match media_type {
            MediaType::Plain => payload,
            MediaType::Signed => {
                let identity = self.registry.get_by_did(sender).await?;
                let kms = self.registry.kms();
                jws::sign(kms, &identity.auth_key, &bjj_kid(sender), &payload)
                    .await?
                    .into_bytes()
            }
            MediaType::Zkp => self.pack_zkp(sender, &payload).await?.into_bytes(),
        };
        tracing::debug!(
            did = %sender,
            media_type = %media_type,
            message_type = %message.message_type,
            "packed message"
        );
        Ok(packed)
    }

    async fn pack_zkp(&self, sender: &Did, payload: &[u8]) -> Result<String, PackerError> {
        let signer = self.zkp.as_ref().ok_or(PackerError::NoProver)?;
        let header = JwzHeader::auth_v2();
        let challenge = token::signing_digest(token::signing_input(&header, payload)?.as_bytes())?;

        let witness = signer.engine.auth_witness(sender).await?;
        let signature = self
            .registry
            .kms()
            .sign_bjj(&witness.auth_key, &challenge)
            .await?;
        let gist = signer.contract.gist_proof(sender).await?;
        let inputs = jwz::auth_v2_inputs(sender, &witness, &challenge, &signature, &gist)?;
        let proof = signer.engine.prover().prove(CircuitId::AuthV2, &inputs).await?;
        jwz::compact(&header, payload, &proof)
    }

    /// Opens an envelope of any supported kind, verifying signatures and
    /// proofs, and checks that the authenticated sender wrote the message.
    ///
    /// # Errors
    ///
    /// [`PackerError::Malformed`] for undecodable input, verification
    /// failures, [`PackerError::SenderMismatch`].
    pub async fn unpack(&self, envelope: &[u8]) -> Result<(BasicMessage, MediaType), PackerError> {
        let media_type = sniff(envelope)?;
        let text = String::from_utf8_lossy(envelope);
        let message = match media_type {
            MediaType::Plain => serde_json::from_str::<BasicMessage>(text.trim())?,
            MediaType::Signed => {
                let (header, payload) = jws::verify(self.dids.as_ref(), &text).await?;
                let message: BasicMessage = serde_json::from_slice(&payload)?;
                let signer = header.signer()?;
                ensure_sender(&message, &signer)?;
                message
            }
            MediaType::Zkp => {
                let token = Jwz::parse(&text)?;
                let user_id = token
                    .verify(self.verifier.as_ref(), self.states.as_ref())
                    .await?;
                let message: BasicMessage = serde_json::from_slice(&token.payload)?;
                let sender = message.sender()?;
                if jwz::user_id(&sender)? != user_id {
                    return Err(PackerError::SenderMismatch {
                        sender: user_id.to_decimal(),
                        from: sender.to_string(),
                    });
                }
                message
            }
        };
        tracing::debug!(
            media_type = %media_type,
            message_type = %message.message_type,
            "unpacked message"
        );
        Ok((message, media_type))
    }
}

fn ensure_sender(message: &BasicMessage, signer: &Did) -> Result<(), PackerError> {
    if message.sender()? != *signer {
        return Err(PackerError::SenderMismatch {
            sender: signer.to_string(),
            from: message.from.clone().unwrap_or_default(),
        });
    }
    Ok(())
}
