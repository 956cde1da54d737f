//! Publishes planned transitions to the State contract.
//!
//! Rows move `created → transacted → confirmed`, or to `failed` from
//! either in-flight status. This module is the only writer of those
//! moves; every move is a guarded update, so a publisher stopped halfway
//! leaves the row where it was and the next tick resumes it.

use crate::engine::TransitionEngine;
use crate::StateError;
use chrono::{DateTime, Utc};
use issuer_chain::{StateContract, TransitStateArgs};
use issuer_claims::store::{set_mtp_proof, waiting_on_state};
use issuer_identity::proofs::{issuer_data, MtpProof};
use issuer_identity::state::{
    get_state, in_flight, last_rhs_published, mark_confirmed, mark_failed, mark_rhs_published,
    mark_transacted,
};
use issuer_identity::StateRecord;
use issuer_merkle::{IdentityLocks, IdentityTrees};
use issuer_observe::{emit_event, EventPayload, IssuerEvent};
use issuer_revocation::{collect_nodes, RetryPolicy, RhsPublisher};
use issuer_types::{Did, IdentityStateStatus};
use rusqlite::Connection;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub publish_interval: Duration,
    /// Blocks a receipt must be buried under, counting its own block.
    pub confirmation_blocks: u64,
    pub confirmation_timeout: Duration,
    /// Receipt polling period of [`Publisher::publish_now`].
    pub wait_receipt_cycle: Duration,
    /// Attempts at proving and submitting before a row fails.
    pub submit_attempts: u32,
    pub submit_backoff: Duration,
    pub rhs_retry: RetryPolicy,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(30),
            confirmation_blocks: 10,
            confirmation_timeout: Duration::from_secs(600),
            wait_receipt_cycle: Duration::from_secs(5),
            submit_attempts: 3,
            submit_backoff: Duration::from_secs(1),
            rhs_retry: RetryPolicy::default(),
        }
    }
}

pub struct OnChainPublisher {
    engine: TransitionEngine,
    contract: Arc<dyn StateContract>,
    rhs: RhsPublisher,
    settings: PublisherSettings,
    publishing: IdentityLocks,
}

/// The background publisher, or nothing when no chain is configured.
#[derive(Clone)]
pub enum Publisher {
    Real(Arc<OnChainPublisher>),
    Noop,
}

impl Publisher {
    pub fn on_chain(
        engine: TransitionEngine,
        contract: Arc<dyn StateContract>,
        rhs: RhsPublisher,
        settings: PublisherSettings,
    ) -> Self {
        Self::Real(Arc::new(OnChainPublisher {
            engine,
            contract,
            rhs,
            settings,
            publishing: IdentityLocks::new(),
        }))
    }

    /// Ticks every `publish_interval` and whenever an event asks for a
    /// transition, until `shutdown` flips to `true` or its sender drops.
    pub async fn run(self, mut events: broadcast::Receiver<IssuerEvent>, mut shutdown: watch::Receiver<bool>) {
        let Self::Real(publisher) = self else {
            tracing::info!("on-chain publishing disabled");
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            return;
        };

        let period = publisher.settings.publish_interval;
        tracing::info!(interval_secs = period.as_secs(), "starting state publisher");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut listening = true;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                event = events.recv(), if listening => match event {
                    Ok(event) => {
                        if !event.payload().is_ok_and(|p| p.needs_transition()) {
                            continue;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "publisher lagged behind events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        listening = false;
                        continue;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            publisher.tick().await;
        }
        tracing::info!("state publisher stopped");
    }

    /// One pass over every identity. Returns how many identities have a
    /// transition in flight or just confirmed.
    pub async fn tick(&self) -> usize {
        match self {
            Self::Real(publisher) => publisher.tick().await,
            Self::Noop => 0,
        }
    }

    /// Plans, submits and waits for one identity's transition. `None` when
    /// there is nothing to publish.
    ///
    /// # Errors
    ///
    /// [`StateError::PublishingDisabled`] for [`Publisher::Noop`]; planning
    /// and database errors. Chain failures end in a `failed` row, not an
    /// error.
    pub async fn publish_now(&self, did: &Did) -> Result<Option<StateRecord>, StateError> {
        match self {
            Self::Real(publisher) => publisher.publish_now(did).await,
            Self::Noop => Err(StateError::PublishingDisabled),
        }
    }
}

impl OnChainPublisher {
    async fn tick(&self) -> usize {
        let identities = match self.engine.registry().list().await {
            Ok(identities) => identities,
            Err(e) => {
                tracing::error!("failed to list identities: {}", e);
                return 0;
            }
        };
        let mut active = 0;
        for identity in identities {
            match self.step(&identity.did).await {
                Ok(Some(_)) => active += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(did = %identity.did, "publish step failed: {}", e),
            }
        }
        active
    }

    async fn publish_now(&self, did: &Did) -> Result<Option<StateRecord>, StateError> {
        let Some(mut record) = self.step(did).await? else {
            return Ok(None);
        };
        let deadline = Instant::now() + self.settings.confirmation_timeout;
        while record.status == IdentityStateStatus::Transacted {
            if Instant::now() >= deadline {
                let error = StateError::ConfirmationTimeout {
                    tx: record.tx_id.clone().unwrap_or_default(),
                    secs: self.settings.confirmation_timeout.as_secs(),
                };
                return self.fail(&record, &error).await.map(Some);
            }
            sleep(self.settings.wait_receipt_cycle).await;
            let _guard = self.publishing.lock(&did.to_string()).await;
            let id = record.id;
            record = self.engine.blocking(move |conn| Ok(get_state(conn, id)?)).await?;
            if record.status == IdentityStateStatus::Transacted {
                record = self.check_receipt(record).await?;
            }
        }
        Ok(Some(record))
    }

    /// Advances the identity's in-flight row, planning one if there is
    /// none.
    async fn step(&self, did: &Did) -> Result<Option<StateRecord>, StateError> {
        let _guard = self.publishing.lock(&did.to_string()).await;
        let current = {
            let did = *did;
            self.engine
                .blocking(move |conn| Ok(in_flight(conn, &did)?))
                .await?
        };
        let mut record = match current {
            Some(record) => record,
            None => match self.engine.plan(did).await? {
                Some(record) => record,
                None => return Ok(None),
            },
        };
        if record.status == IdentityStateStatus::Created {
            record = self.submit(record).await?;
        }
        if record.status == IdentityStateStatus::Transacted {
            record = self.check_receipt(record).await?;
        }
        Ok(Some(record))
    }

    async fn retry<T, F, Fut>(&self, what: &'static str, did: &Did, mut attempt: F) -> Result<T, StateError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StateError>>,
    {
        let mut backoff = self.settings.submit_backoff;
        let mut tries = 1;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && tries < self.settings.submit_attempts => {
                    tracing::warn!(
                        did = %did,
                        tries,
                        backoff_ms = backoff.as_millis() as u64,
                        "{} failed, retrying: {}",
                        what,
                        e
                    );
                    sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    tries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_submit(&self, record: &StateRecord) -> Result<String, StateError> {
        let did = record.identifier;
        let identity = self.engine.registry().get_by_did(&did).await?;
        let payer = identity
            .eth_key
            .ok_or_else(|| StateError::NoPayer(did.to_string()))?;
        let proof = self
            .retry("proving", &did, || self.engine.prove(record))
            .await?;
        let args = TransitStateArgs {
            id: did,
            old_state: record
                .previous
                .map(|p| p.state)
                .ok_or(StateError::Genesis(record.id))?,
            new_state: record.current.state,
            is_old_state_genesis: record.is_old_state_genesis(),
            proof: proof.proof,
        };
        let (contract, payer, args) = (&self.contract, &payer, &args);
        self.retry("transitState", &did, move || async move {
            Ok(contract.transit_state(payer, args).await?)
        })
        .await
    }

    async fn submit(&self, record: StateRecord) -> Result<StateRecord, StateError> {
        let tx = match self.try_submit(&record).await {
            Ok(tx) => tx,
            Err(e) => return self.fail(&record, &e).await,
        };
        let (id, did, state) = (record.id, record.identifier, record.current.state);
        let tx_hash = tx.clone();
        let (updated, event) = self
            .engine
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                mark_transacted(&tx, id, &tx_hash)?;
                let event = emit_event(
                    &tx,
                    &did.to_string(),
                    &id.to_string(),
                    &EventPayload::StateTransacted {
                        state: state.to_decimal(),
                        tx: tx_hash,
                    },
                )?;
                let updated = get_state(&tx, id)?;
                tx.commit()?;
                Ok((updated, event))
            })
            .await?;
        self.engine.registry().events().publish(event);
        tracing::info!(did = %did, state = %state, tx, "submitted state transition");
        Ok(updated)
    }

    async fn check_receipt(&self, record: StateRecord) -> Result<StateRecord, StateError> {
        let Some(tx) = record.tx_id.clone() else {
            let error = StateError::Reverted("transacted row without a transaction".into());
            return self.fail(&record, &error).await;
        };
        let receipt = match self.contract.receipt(&tx).await {
            Ok(receipt) => receipt,
            Err(e) if e.kind().is_retryable() => {
                tracing::warn!(did = %record.identifier, tx, "receipt lookup failed: {}", e);
                return Ok(record);
            }
            Err(e) => return Err(e.into()),
        };
        match receipt {
            None if self.timed_out(&record) => {
                let error = StateError::ConfirmationTimeout {
                    tx,
                    secs: self.settings.confirmation_timeout.as_secs(),
                };
                self.fail(&record, &error).await
            }
            None => Ok(record),
            Some(r) if !r.status => self.fail(&record, &StateError::Reverted(tx)).await,
            Some(r) => {
                let head = self.contract.block_number().await?;
                let depth = (head + 1).saturating_sub(r.block_number);
                if depth < self.settings.confirmation_blocks.max(1) {
                    tracing::debug!(did = %record.identifier, tx, depth, "waiting for confirmations");
                    return Ok(record);
                }
                self.confirm(record, r.block_number).await
            }
        }
    }

    fn timed_out(&self, record: &StateRecord) -> bool {
        match DateTime::parse_from_rfc3339(&record.modified_at) {
            Ok(since) => Utc::now()
                .signed_duration_since(since)
                .to_std()
                .is_ok_and(|elapsed| elapsed > self.settings.confirmation_timeout),
            Err(e) => {
                tracing::warn!(id = record.id, "unreadable modified_at: {}", e);
                false
            }
        }
    }

    /// Pushes the RHS batch, then confirms the row and attaches inclusion
    /// proofs to the claims that waited for it.
    async fn confirm(&self, record: StateRecord, block_number: u64) -> Result<StateRecord, StateError> {
        let did = record.identifier;
        let identity = self.engine.registry().get_by_did(&did).await?;
        let payer = identity.eth_key.unwrap_or(identity.auth_key);
        let roots = record.current.roots;
        let nodes = self
            .engine
            .blocking(move |conn| {
                let previous = last_rhs_published(conn, &did)?.map(|r| r.current.roots);
                let trees = IdentityTrees::open(conn, &did.to_string())?;
                Ok(collect_nodes(&trees, previous.as_ref(), &roots)?)
            })
            .await?;
        if let Err(e) = self
            .rhs
            .publish(&payer, &nodes, &self.settings.rhs_retry)
            .await
        {
            return self.fail(&record, &StateError::from(e)).await;
        }

        let id = record.id;
        let rhs_published = !matches!(self.rhs, RhsPublisher::Noop);
        let (confirmed, attached, event) = self
            .engine
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                mark_confirmed(&tx, id, block_number)?;
                if rhs_published {
                    mark_rhs_published(&tx, id)?;
                }
                let confirmed = get_state(&tx, id)?;
                let attached = attach_mtp_proofs(&tx, &confirmed)?;
                let event = emit_event(
                    &tx,
                    &did.to_string(),
                    &id.to_string(),
                    &EventPayload::StatePublished {
                        state: confirmed.current.state.to_decimal(),
                        block_number,
                    },
                )?;
                tx.commit()?;
                Ok((confirmed, attached, event))
            })
            .await?;
        self.engine.registry().events().publish(event);
        tracing::info!(
            did = %did,
            state = %confirmed.current.state,
            block_number,
            nodes = nodes.len(),
            attached,
            "confirmed state transition"
        );
        Ok(confirmed)
    }

    async fn fail(&self, record: &StateRecord, error: &StateError) -> Result<StateRecord, StateError> {
        let (id, did, state) = (record.id, record.identifier, record.current.state);
        let message = error.to_string();
        tracing::error!(did = %did, state = %state, id, "state transition failed: {}", message);
        let (failed, event) = self
            .engine
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                mark_failed(&tx, id, &message)?;
                let event = emit_event(
                    &tx,
                    &did.to_string(),
                    &id.to_string(),
                    &EventPayload::StateFailed {
                        state: state.to_decimal(),
                        error: message,
                    },
                )?;
                let failed = get_state(&tx, id)?;
                tx.commit()?;
                Ok((failed, event))
            })
            .await?;
        self.engine.registry().events().publish(event);
        Ok(failed)
    }
}

/// Attaches `Iden3SparseMerkleTreeProof`s at `confirmed` to the claims
/// tagged with its state.
fn attach_mtp_proofs(conn: &Connection, confirmed: &StateRecord) -> Result<usize, StateError> {
    let did = confirmed.identifier;
    let waiting = waiting_on_state(conn, &did, &confirmed.current.state.hex())?;
    if waiting.is_empty() {
        return Ok(0);
    }
    let data = issuer_data(conn, confirmed)?;
    let trees = IdentityTrees::open(conn, &did.to_string())?;
    let mut attached = 0;
    for claim in waiting {
        let (mtp, _) = trees
            .claims
            .generate_proof(&claim.hash_index, Some(&confirmed.current.roots.claims))?;
        if !mtp.existence {
            tracing::warn!(did = %did, claim = %claim.id, "claim missing from confirmed claims root");
            continue;
        }
        set_mtp_proof(conn, &claim.id, &MtpProof::new(data.clone(), &claim.core_claim, mtp))?;
        attached += 1;
    }
    Ok(attached)
}
