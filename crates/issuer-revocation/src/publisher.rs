use crate::{RevocationError, RhsNode};
use issuer_chain::TreeStoreContract;
use issuer_crypto::Hash;
use issuer_kms::KeyId;
use issuer_types::MAX_RHS_BATCH;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// How failed pushes are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first failed push of a chunk.
    pub retries: u32,
    /// Doubles after every retry.
    pub initial_backoff: Duration,
    /// Log and swallow failures once retries run out.
    pub ignore_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_backoff: Duration::from_secs(1),
            ignore_errors: false,
        }
    }
}

/// Off-chain reverse hash service over HTTP.
pub struct HttpRhs {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct NodeResponse {
    node: RhsNode,
}

impl HttpRhs {
    /// # Errors
    ///
    /// Returns [`RevocationError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RevocationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn push(&self, nodes: &[RhsNode]) -> Result<(), RevocationError> {
        let resp = self
            .client
            .post(format!("{}/node", self.base_url))
            .json(nodes)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RevocationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Reads one node back, `None` if the service does not know it.
    ///
    /// # Errors
    ///
    /// Transport failures and non-404 error statuses.
    pub async fn fetch_node(&self, hash: &Hash) -> Result<Option<RhsNode>, RevocationError> {
        let resp = self
            .client
            .get(format!("{}/node/{}", self.base_url, hash.hex()))
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RevocationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Some(resp.json::<NodeResponse>().await?.node))
    }
}

/// On-chain reverse hash service: the identity tree store contract.
pub struct OnChainRhs {
    contract: Arc<TreeStoreContract>,
}

impl OnChainRhs {
    pub fn new(contract: Arc<TreeStoreContract>) -> Self {
        Self { contract }
    }

    async fn push(&self, payer: &KeyId, nodes: &[RhsNode]) -> Result<(), RevocationError> {
        let preimages: Vec<Vec<Hash>> = nodes.iter().map(|n| n.children.clone()).collect();
        let tx = self.contract.save_nodes(payer, &preimages).await?;
        tracing::debug!(tx, nodes = nodes.len(), "saved nodes on chain");
        Ok(())
    }
}

/// Where node batches go after a confirmed transition.
pub enum RhsPublisher {
    Http(HttpRhs),
    OnChain(OnChainRhs),
    /// Direct-mode deployments publish nothing.
    Noop,
}

impl RhsPublisher {
    async fn push_chunk(&self, payer: &KeyId, chunk: &[RhsNode]) -> Result<(), RevocationError> {
        match self {
            Self::Http(rhs) => rhs.push(chunk).await,
            Self::OnChain(rhs) => rhs.push(payer, chunk).await,
            Self::Noop => Ok(()),
        }
    }

    /// Pushes `nodes` in chunks of at most [`MAX_RHS_BATCH`]. Nodes are
    /// content addressed, so pushing a batch twice is harmless.
    ///
    /// `payer` signs on-chain pushes and is ignored otherwise.
    ///
    /// # Errors
    ///
    /// The last failure once `policy.retries` are spent, unless
    /// `policy.ignore_errors` is set.
    pub async fn publish(
        &self,
        payer: &KeyId,
        nodes: &[RhsNode],
        policy: &RetryPolicy,
    ) -> Result<(), RevocationError> {
        if matches!(self, Self::Noop) || nodes.is_empty() {
            return Ok(());
        }
        for chunk in nodes.chunks(MAX_RHS_BATCH) {
            let mut backoff = policy.initial_backoff;
            let mut retry = 0;
            loop {
                match self.push_chunk(payer, chunk).await {
                    Ok(()) => break,
                    Err(e) if retry < policy.retries => {
                        retry += 1;
                        tracing::warn!(
                            retry,
                            backoff_ms = backoff.as_millis() as u64,
                            "rhs push failed, retrying: {}",
                            e
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                    Err(e) if policy.ignore_errors => {
                        tracing::warn!(nodes = chunk.len(), "ignoring rhs push failure: {}", e);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        tracing::debug!(nodes = nodes.len(), "published rhs nodes");
        Ok(())
    }
}
