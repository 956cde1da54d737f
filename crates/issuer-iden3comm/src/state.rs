//! On-chain checks of the GIST root a proof was generated against.

use crate::PackerError;
use async_trait::async_trait;
use issuer_chain::{GistRootInfo, StateContract};
use issuer_crypto::Hash;
use issuer_types::STATE_REPLACEMENT_TOLERANCE_SECS;
use std::sync::Arc;

#[async_trait]
pub trait StateResolver: Send + Sync {
    /// # Errors
    ///
    /// Transport failures reading the State contract.
    async fn gist_root_info(&self, root: &Hash) -> Result<GistRootInfo, PackerError>;
}

/// Reads `getGISTRootInfo` from the State contract.
pub struct ChainStateResolver {
    contract: Arc<dyn StateContract>,
}

impl ChainStateResolver {
    pub fn new(contract: Arc<dyn StateContract>) -> Self {
        Self { contract }
    }
}

#[async_trait]
impl StateResolver for ChainStateResolver {
    async fn gist_root_info(&self, root: &Hash) -> Result<GistRootInfo, PackerError> {
        Ok(self.contract.gist_root_info(root).await?)
    }
}

/// Accepts `claimed` when the chain knows it and it was replaced no more
/// than the tolerance window before `now` (unix seconds).
///
/// # Errors
///
/// [`PackerError::UnknownState`], [`PackerError::MalformedProof`] or
/// [`PackerError::StaleState`].
pub fn check_gist_root(info: &GistRootInfo, claimed: &Hash, now: u64) -> Result<(), PackerError> {
    if info.created_at_timestamp == 0 {
        return Err(PackerError::UnknownState(claimed.to_decimal()));
    }
    if info.root != *claimed {
        return Err(PackerError::MalformedProof(format!(
            "contract returned root {} for {}",
            info.root, claimed
        )));
    }
    if info.replaced_at_timestamp > 0 {
        let age_secs = now.saturating_sub(info.replaced_at_timestamp);
        if age_secs > STATE_REPLACEMENT_TOLERANCE_SECS {
            return Err(PackerError::StaleState {
                root: claimed.to_decimal(),
                age_secs,
            });
        }
    }
    Ok(())
}

/// Resolves and checks `root`.
///
/// # Errors
///
/// As for [`check_gist_root`], plus resolver failures.
pub async fn verify_gist_root(resolver: &dyn StateResolver, root: &Hash) -> Result<(), PackerError> {
    let info = resolver.gist_root_info(root).await?;
    let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
    check_gist_root(&info, root, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use issuer_types::ErrorKind;

    fn info(root: u64, created: u64, replaced: u64) -> GistRootInfo {
        GistRootInfo {
            root: Hash::from_u64(root),
            created_at_timestamp: created,
            replaced_at_timestamp: replaced,
            ..GistRootInfo::default()
        }
    }

    #[test]
    fn current_root_is_accepted() {
        check_gist_root(&info(5, 100, 0), &Hash::from_u64(5), 10_000).expect("current");
    }

    #[test]
    fn unknown_root_is_rejected() {
        let err = check_gist_root(&GistRootInfo::default(), &Hash::from_u64(5), 100).expect_err("unknown");
        assert!(matches!(err, PackerError::UnknownState(_)));
        assert_eq!(err.kind(), ErrorKind::StateError);
    }

    #[test]
    fn mismatched_root_is_malformed() {
        let err = check_gist_root(&info(6, 100, 0), &Hash::from_u64(5), 100).expect_err("mismatch");
        assert!(matches!(err, PackerError::MalformedProof(_)));
    }

    #[test]
    fn replaced_roots_age_out_after_fifteen_minutes() {
        let replaced = 1_000;
        let root = Hash::from_u64(5);
        check_gist_root(&info(5, 10, replaced), &root, replaced + 15 * 60).expect("at the edge");
        let err = check_gist_root(&info(5, 10, replaced), &root, replaced + 15 * 60 + 1).expect_err("stale");
        assert!(matches!(err, PackerError::StaleState { age_secs: 901, .. }));
        assert_eq!(err.kind(), ErrorKind::StateError);
    }
}
