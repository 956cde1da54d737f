use crate::RevocationError;
use issuer_crypto::Hash;
use issuer_types::{Did, RevocationStatusMode};
use serde::{Deserialize, Serialize};

/// The `credentialStatus` object of a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    pub id: String,
    #[serde(rename = "type")]
    pub status_type: String,
    pub revocation_nonce: u64,
    /// Fallback for holders that cannot reach the RHS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_issuer: Option<Box<CredentialStatus>>,
}

/// Builds `credentialStatus` entries for each revocation mode.
#[derive(Debug, Clone)]
pub struct StatusBuilder {
    agent_base: String,
    rhs_url: Option<String>,
    onchain: Option<(u64, String)>,
    default_mode: RevocationStatusMode,
}

impl StatusBuilder {
    /// `agent_base` is the public server URL the `/v2/agent` endpoint hangs
    /// off.
    pub fn new(agent_base: impl Into<String>) -> Self {
        Self {
            agent_base: agent_base.into().trim_end_matches('/').to_string(),
            rhs_url: None,
            onchain: None,
            default_mode: RevocationStatusMode::Direct,
        }
    }

    pub fn with_rhs_url(mut self, url: impl Into<String>) -> Self {
        self.rhs_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    /// Chain id and `0x` address of the identity tree store contract.
    pub fn with_onchain(mut self, chain_id: u64, contract: impl Into<String>) -> Self {
        self.onchain = Some((chain_id, contract.into()));
        self
    }

    pub fn with_default_mode(mut self, mode: RevocationStatusMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn default_mode(&self) -> RevocationStatusMode {
        self.default_mode
    }

    pub fn agent_url(&self) -> String {
        format!("{}/v2/agent", self.agent_base)
    }

    fn direct(&self, nonce: u64) -> CredentialStatus {
        CredentialStatus {
            id: self.agent_url(),
            status_type: RevocationStatusMode::Direct.status_type().to_string(),
            revocation_nonce: nonce,
            status_issuer: None,
        }
    }

    /// `state` is the issuer state the holder starts the RHS walk from;
    /// only the RHS modes need it.
    ///
    /// # Errors
    ///
    /// [`RevocationError::NotConfigured`] when the mode's service is not
    /// configured, [`RevocationError::MissingState`] when an RHS mode gets
    /// no state.
    pub fn credential_status(
        &self,
        did: &Did,
        nonce: u64,
        state: Option<&Hash>,
        mode: Option<RevocationStatusMode>,
    ) -> Result<CredentialStatus, RevocationError> {
        let mode = mode.unwrap_or(self.default_mode);
        match mode {
            RevocationStatusMode::Direct => Ok(self.direct(nonce)),
            RevocationStatusMode::OffChain => {
                let rhs = self
                    .rhs_url
                    .as_deref()
                    .ok_or(RevocationError::NotConfigured("reverse hash service url"))?;
                let state = state.ok_or(RevocationError::MissingState("off_chain"))?;
                Ok(CredentialStatus {
                    id: format!("{rhs}/node?state={}", state.hex()),
                    status_type: mode.status_type().to_string(),
                    revocation_nonce: nonce,
                    status_issuer: Some(Box::new(self.direct(nonce))),
                })
            }
            RevocationStatusMode::OnChain => {
                let (chain_id, contract) = self
                    .onchain
                    .as_ref()
                    .ok_or(RevocationError::NotConfigured("identity tree store contract"))?;
                let state = state.ok_or(RevocationError::MissingState("on_chain"))?;
                Ok(CredentialStatus {
                    id: format!(
                        "{did}/credentialStatus?revocationNonce={nonce}&contractAddress={chain_id}:{contract}&state={}",
                        state.hex()
                    ),
                    status_type: mode.status_type().to_string(),
                    revocation_nonce: nonce,
                    status_issuer: Some(Box::new(self.direct(nonce))),
                })
            }
        }
    }
}
