//! Credential issuance, revocation and offers.

use crate::merklize::Merklized;
use crate::schema::SchemaLoader;
use crate::store::{
    delete_claim, get_claim, insert_claim, list_claims, mark_revoked, Claim, ClaimFilter, ClaimPage,
};
use crate::ttl::TtlStore;
use crate::ClaimsError;
use issuer_crypto::claim::{self, CoreClaim, MerklizedPosition, SubjectPosition};
use issuer_crypto::Hash;
use issuer_identity::proofs::{issuer_data, SignatureProof};
use issuer_identity::state::last_confirmed;
use issuer_identity::{get_auth_claim, upsert_connection, IdentityRegistry};
use issuer_merkle::{IdentityLocks, IdentityTrees, MerkleError};
use issuer_observe::{emit_event, EventPayload, IssuerEvent};
use issuer_types::{media_type, message_type, Did, ProofTypes, RevocationStatusMode};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::sync::Arc;

/// Leaf value recorded in the revocations tree.
const REVOKED: u64 = 1;

/// What to issue.
#[derive(Debug, Clone, Default)]
pub struct CreateClaimRequest {
    pub schema_url: String,
    pub schema_type: String,
    /// Attributes. An `id` entry names the subject when `subject` is unset.
    pub credential_subject: Map<String, Value>,
    pub subject: Option<Did>,
    /// Unix seconds.
    pub expiration: Option<i64>,
    /// Random when absent.
    pub revocation_nonce: Option<u64>,
    pub proofs: ProofTypes,
    /// Issuer default when absent.
    pub status_mode: Option<RevocationStatusMode>,
    pub refresh_service: Option<Value>,
    pub display_method: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfferType {
    Raw,
    #[default]
    Link,
}

impl FromStr for OfferType {
    type Err = ClaimsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Self::Raw),
            "" | "link" => Ok(Self::Link),
            other => Err(ClaimsError::InvalidRequest(format!("unknown offer type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Offer {
    /// The credentials-offer message itself.
    Raw(Value),
    /// A deep link to the message parked in the QR store.
    Link { url: String, qr_id: String },
}

/// Issues and manages credentials for the identities of a registry.
#[derive(Clone)]
pub struct ClaimService {
    registry: IdentityRegistry,
    schemas: Arc<SchemaLoader>,
    locks: IdentityLocks,
    qr_store: TtlStore<String>,
    server_url: String,
}

impl ClaimService {
    pub fn new(
        registry: IdentityRegistry,
        schemas: Arc<SchemaLoader>,
        locks: IdentityLocks,
        qr_store: TtlStore<String>,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            schemas,
            locks,
            qr_store,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn schemas(&self) -> &SchemaLoader {
        &self.schemas
    }

    pub fn locks(&self) -> &IdentityLocks {
        &self.locks
    }

    pub fn qr_store(&self) -> &TtlStore<String> {
        &self.qr_store
    }

    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T, ClaimsError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, ClaimsError> + Send + 'static,
    {
        let pool = self.registry.pool().clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }

    fn publish(&self, events: Vec<IssuerEvent>) {
        for event in events {
            self.registry.events().publish(event);
        }
    }

    /// Issues a credential.
    ///
    /// The schema is loaded and the subject validated before anything is
    /// written. Signing happens under the issuer's lock against its last
    /// confirmed state; the claim row, the claims tree leaf (for `mtp`)
    /// and the connection are written in one transaction.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::InvalidRequest`] without proof types or with a past
    /// expiration, [`ClaimsError::Schema`] for subjects the schema rejects,
    /// [`ClaimsError::Conflict`] for a used or revoked nonce.
    pub async fn save(&self, issuer: &Did, mut request: CreateClaimRequest) -> Result<Claim, ClaimsError> {
        if request.proofs.is_empty() {
            return Err(ClaimsError::InvalidRequest(
                "at least one proof type is required".into(),
            ));
        }
        let subject = take_subject(&mut request)?;
        if let Some(expiration) = request.expiration {
            if expiration <= chrono::Utc::now().timestamp() {
                return Err(ClaimsError::InvalidRequest("expiration is in the past".into()));
            }
        }

        let schema = self.schemas.load(&request.schema_url).await?;
        schema.check_type(&request.schema_type)?;
        let mut validated = request.credential_subject.clone();
        if let Some(s) = &subject {
            validated.insert("id".into(), Value::String(s.to_string()));
        }
        schema.validate_subject(&validated, &[])?;
        let ld_context = schema.ld_context()?.to_string();

        let identity = self.registry.get_by_did(issuer).await?;
        let nonce = request.revocation_nonce.unwrap_or_else(rand::random);
        let schema_hash = claim::schema_hash(&ld_context, &request.schema_type);
        let mut core = CoreClaim::new(schema_hash);
        match &subject {
            Some(s) => core.set_subject(SubjectPosition::Index, s.id_bytes()),
            None => core.set_subject(SubjectPosition::SelfSubject, &[0u8; 31]),
        }
        core.set_merklized_root(
            MerklizedPosition::Index,
            &Merklized::new(&request.credential_subject)?.root()?,
        );
        core.set_revocation_nonce(nonce);
        core.set_expiration(request.expiration.map(|e| e as u64));
        core.set_version(0);
        let hash_index = core.hash_index()?;

        let _guard = self.locks.lock(&issuer.to_string()).await;
        let did = *issuer;
        let sign = request.proofs.signature;
        let (record, data) = self
            .blocking(move |conn| {
                let record = last_confirmed(conn, &did)?;
                let data = if sign {
                    Some(issuer_data(conn, &record)?)
                } else {
                    None
                };
                Ok((record, data))
            })
            .await?;
        let signature_proof = match data {
            Some(data) => {
                let signature = self
                    .registry
                    .kms()
                    .sign_bjj(&identity.auth_key, &core.signing_hash()?)
                    .await?;
                Some(SignatureProof::new(data, &core, &signature))
            }
            None => None,
        };
        let credential_status = self.registry.status_builder().credential_status(
            issuer,
            nonce,
            Some(&record.current.state),
            request.status_mode,
        )?;

        let claim = Claim {
            id: uuid::Uuid::new_v4().to_string(),
            issuer: *issuer,
            subject,
            schema_url: request.schema_url,
            schema_type: request.schema_type,
            schema_hash: hex::encode(schema_hash),
            ld_context,
            rev_nonce: nonce,
            expiration: request.expiration,
            version: 0,
            updatable: false,
            core_claim: core,
            hash_index,
            signature_proof,
            mtp_proof: None,
            identity_state: None,
            mtp: request.proofs.mtp,
            revoked: false,
            revocation_reason: None,
            credential_status,
            credential_subject: request.credential_subject,
            refresh_service: request.refresh_service,
            display_method: request.display_method,
            created_at: String::new(),
        };
        let (saved, events) = self.blocking(move |conn| persist_claim(conn, &claim)).await?;
        self.publish(events);
        tracing::info!(
            did = %issuer,
            id = %saved.id,
            nonce,
            mtp = saved.mtp,
            "issued credential"
        );
        Ok(saved)
    }

    /// Revokes `nonce`: adds it to the revocations tree and flags the
    /// claim carrying it, if any.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::Conflict`] when the nonce is already revoked,
    /// [`ClaimsError::InvalidRequest`] for the issuer's auth claim.
    pub async fn revoke(&self, issuer: &Did, nonce: u64, reason: Option<String>) -> Result<(), ClaimsError> {
        let _guard = self.locks.lock(&issuer.to_string()).await;
        let did = *issuer;
        let events = self
            .blocking(move |conn| {
                let auth = get_auth_claim(conn, &did)?;
                if auth.revocation_nonce() == nonce {
                    return Err(ClaimsError::InvalidRequest(format!(
                        "nonce {nonce} belongs to the auth claim of {did}"
                    )));
                }
                let identifier = did.to_string();
                let tx = conn.transaction()?;
                {
                    let mut trees = IdentityTrees::open(&tx, &identifier)?;
                    match trees
                        .revocations
                        .add(&Hash::from_u64(nonce), &Hash::from_u64(REVOKED))
                    {
                        Err(MerkleError::KeyAlreadyExists) => {
                            return Err(ClaimsError::Conflict(format!("nonce {nonce} is already revoked")))
                        }
                        other => {
                            other?;
                        }
                    }
                }
                let matched = mark_revoked(&tx, &did, nonce, reason.as_deref())?;
                if !matched {
                    tracing::debug!(did = %did, nonce, "revoked a nonce with no stored credential");
                }
                let entity = nonce.to_string();
                let events = vec![
                    emit_event(
                        &tx,
                        &identifier,
                        &entity,
                        &EventPayload::RevokeCredential { nonce, reason },
                    )?,
                    emit_event(
                        &tx,
                        &identifier,
                        &entity,
                        &EventPayload::CreateState {
                            reason: "revocation".into(),
                        },
                    )?,
                ];
                tx.commit()?;
                Ok(events)
            })
            .await?;
        self.publish(events);
        tracing::info!(did = %issuer, nonce, "revoked credential");
        Ok(())
    }

    /// Deletes a credential row. Tree leaves stay where they are.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::NotFound`] for unknown ids,
    /// [`ClaimsError::InvalidRequest`] for the auth claim.
    pub async fn delete(&self, issuer: &Did, id: &str) -> Result<(), ClaimsError> {
        let (did, id) = (*issuer, id.to_string());
        self.blocking(move |conn| {
            if get_auth_claim(conn, &did)?.id == id {
                return Err(ClaimsError::InvalidRequest(
                    "the auth claim cannot be deleted".into(),
                ));
            }
            delete_claim(conn, &did, &id)
        })
        .await
    }

    /// # Errors
    ///
    /// [`ClaimsError::NotFound`] for unknown ids.
    pub async fn get(&self, issuer: &Did, id: &str) -> Result<Claim, ClaimsError> {
        let (did, id) = (*issuer, id.to_string());
        self.blocking(move |conn| get_claim(conn, &did, &id)).await
    }

    /// # Errors
    ///
    /// [`ClaimsError::InvalidRequest`] for a bad filter, checked before
    /// the database is touched.
    pub async fn list(&self, issuer: &Did, filter: ClaimFilter) -> Result<ClaimPage, ClaimsError> {
        filter.validate()?;
        let did = *issuer;
        let now = chrono::Utc::now().timestamp();
        self.blocking(move |conn| list_claims(conn, &did, &filter, now))
            .await
    }

    /// Builds the credentials-offer message for a claim and returns it
    /// directly or parks it in the QR store behind a deep link.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::InvalidRequest`] for self-issued claims,
    /// [`ClaimsError::Conflict`] for revoked ones.
    pub async fn offer(&self, issuer: &Did, id: &str, kind: OfferType) -> Result<Offer, ClaimsError> {
        let claim = self.get(issuer, id).await?;
        if claim.revoked {
            return Err(ClaimsError::Conflict(format!("credential {id} is revoked")));
        }
        let message = credential_offer(&claim, &self.registry.status_builder().agent_url())?;
        match kind {
            OfferType::Raw => Ok(Offer::Raw(message)),
            OfferType::Link => {
                let qr_id = uuid::Uuid::new_v4().to_string();
                self.qr_store.insert(qr_id.clone(), message.to_string());
                Ok(Offer::Link {
                    url: format!(
                        "iden3comm://?request_uri={}/v2/qr-store?id={qr_id}",
                        self.server_url
                    ),
                    qr_id,
                })
            }
        }
    }

    /// The message parked under `qr_id`.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::NotFound`] for unknown or expired ids.
    pub fn qr_payload(&self, qr_id: &str) -> Result<String, ClaimsError> {
        self.qr_store
            .get(qr_id)
            .ok_or_else(|| ClaimsError::NotFound(format!("qr code {qr_id}")))
    }
}

/// Moves a string `id` out of the attributes into the subject DID.
fn take_subject(request: &mut CreateClaimRequest) -> Result<Option<Did>, ClaimsError> {
    let Some(raw) = request.credential_subject.remove("id") else {
        return Ok(request.subject);
    };
    let Value::String(raw) = raw else {
        return Err(ClaimsError::Schema("credentialSubject.id must be a DID string".into()));
    };
    let parsed: Did = raw.parse()?;
    match request.subject {
        Some(subject) if subject != parsed => Err(ClaimsError::InvalidRequest(format!(
            "subject {subject} differs from credentialSubject.id {parsed}"
        ))),
        _ => Ok(Some(parsed)),
    }
}

fn persist_claim(conn: &mut Connection, claim: &Claim) -> Result<(Claim, Vec<IssuerEvent>), ClaimsError> {
    let identifier = claim.issuer.to_string();
    let tx = conn.transaction()?;
    {
        let mut trees = IdentityTrees::open(&tx, &identifier)?;
        if trees.revocations.get(&Hash::from_u64(claim.rev_nonce))?.is_some() {
            return Err(ClaimsError::Conflict(format!(
                "revocation nonce {} is revoked",
                claim.rev_nonce
            )));
        }
        if claim.mtp {
            match trees.claims.add(&claim.hash_index, &claim.core_claim.hash_value()?) {
                Err(MerkleError::KeyAlreadyExists) => {
                    return Err(ClaimsError::Conflict(
                        "a claim with the same index is already in the claims tree".into(),
                    ))
                }
                other => {
                    other?;
                }
            }
        }
    }
    insert_claim(&tx, claim)?;

    let mut events = vec![emit_event(
        &tx,
        &identifier,
        &claim.id,
        &EventPayload::CreateCredential {
            schema_type: claim.schema_type.clone(),
            subject: claim.subject.map(|d| d.to_string()),
            mtp: claim.mtp,
        },
    )?];
    if let Some(user) = &claim.subject {
        let (connection, created) = upsert_connection(&tx, &claim.issuer, user)?;
        if created {
            events.push(emit_event(
                &tx,
                &identifier,
                &connection.id,
                &EventPayload::CreateConnection {
                    user_did: user.to_string(),
                },
            )?);
        }
    }
    if claim.mtp {
        events.push(emit_event(
            &tx,
            &identifier,
            &claim.id,
            &EventPayload::CreateState {
                reason: "credential".into(),
            },
        )?);
    }
    let saved = get_claim(&tx, &claim.issuer, &claim.id)?;
    tx.commit()?;
    Ok((saved, events))
}

/// The Iden3comm credentials-offer message for `claim`.
///
/// # Errors
///
/// [`ClaimsError::InvalidRequest`] for claims without a subject.
pub fn credential_offer(claim: &Claim, agent_url: &str) -> Result<Value, ClaimsError> {
    let subject = claim.subject.ok_or_else(|| {
        ClaimsError::InvalidRequest(format!("credential {} has no subject to offer it to", claim.id))
    })?;
    let id = uuid::Uuid::new_v4().to_string();
    Ok(json!({
        "id": id,
        "thid": id,
        "typ": media_type::PLAIN,
        "type": message_type::CREDENTIAL_OFFER,
        "from": claim.issuer.to_string(),
        "to": subject.to_string(),
        "body": {
            "url": agent_url,
            "credentials": [{ "id": claim.id, "description": claim.schema_type }],
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use issuer_types::{Blockchain, DidMethod, NetworkId};

    fn did(seed: u8) -> Did {
        Did::from_genesis_state(
            DidMethod::PolygonId,
            Blockchain::Polygon,
            NetworkId::Amoy,
            &[seed; 32],
        )
        .expect("did")
    }

    #[test]
    fn subject_comes_from_attributes() {
        let user = did(4);
        let mut request = CreateClaimRequest::default();
        request
            .credential_subject
            .insert("id".into(), Value::String(user.to_string()));
        request.credential_subject.insert("age".into(), json!(30));
        assert_eq!(take_subject(&mut request).expect("subject"), Some(user));
        assert!(!request.credential_subject.contains_key("id"));

        let mut clash = CreateClaimRequest {
            subject: Some(did(5)),
            ..CreateClaimRequest::default()
        };
        clash
            .credential_subject
            .insert("id".into(), Value::String(user.to_string()));
        assert!(take_subject(&mut clash).is_err());

        let mut bad = CreateClaimRequest::default();
        bad.credential_subject.insert("id".into(), json!(12));
        assert!(take_subject(&mut bad).is_err());
    }

    #[test]
    fn offer_types_parse() {
        assert_eq!("raw".parse::<OfferType>().expect("raw"), OfferType::Raw);
        assert_eq!("".parse::<OfferType>().expect("default"), OfferType::Link);
        assert!("qr".parse::<OfferType>().is_err());
    }
}
