//! Credential-offer links: templates a wallet redeems for a credential.

use crate::service::{ClaimService, CreateClaimRequest};
use crate::store::Claim;
use crate::ClaimsError;
use chrono::{DateTime, SecondsFormat, Utc};
use issuer_types::{Did, ProofTypes};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Inactive,
    Exceeded,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Exceeded => "exceeded",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub id: String,
    pub issuer_did: String,
    pub schema_url: String,
    pub schema_type: String,
    pub credential_subject: Map<String, Value>,
    pub max_issuance: Option<u32>,
    pub issued_claims: u32,
    pub valid_until: Option<DateTime<Utc>>,
    pub credential_expiration: Option<DateTime<Utc>>,
    pub proofs: ProofTypes,
    pub active: bool,
    pub refresh_service: Option<Value>,
    pub display_method: Option<Value>,
    pub created_at: String,
}

impl Link {
    /// Exceeded wins over inactive: a used-up link cannot be revived.
    pub fn status_at(&self, now: DateTime<Utc>) -> LinkStatus {
        let used_up = self.max_issuance.is_some_and(|max| self.issued_claims >= max);
        let expired = self.valid_until.is_some_and(|until| until <= now);
        if used_up || expired {
            LinkStatus::Exceeded
        } else if !self.active {
            LinkStatus::Inactive
        } else {
            LinkStatus::Active
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateLinkRequest {
    pub schema_url: String,
    pub schema_type: String,
    /// Attributes every redeemed credential carries; `id` is filled in
    /// with the redeeming DID.
    pub credential_subject: Map<String, Value>,
    pub max_issuance: Option<u32>,
    pub valid_until: Option<DateTime<Utc>>,
    pub credential_expiration: Option<DateTime<Utc>>,
    pub proofs: ProofTypes,
    pub refresh_service: Option<Value>,
    pub display_method: Option<Value>,
}

const COLUMNS: &str = "id, issuer_did, schema_url, schema_type, credential_subject, max_issuance, \
     issued_claims, valid_until, credential_expiration, signature_proof, mtp_proof, active, \
     refresh_service, display_method, created_at";

struct RawLink {
    id: String,
    issuer_did: String,
    schema_url: String,
    schema_type: String,
    credential_subject: String,
    max_issuance: Option<i64>,
    issued_claims: i64,
    valid_until: Option<String>,
    credential_expiration: Option<String>,
    signature: bool,
    mtp: bool,
    active: bool,
    refresh_service: Option<String>,
    display_method: Option<String>,
    created_at: String,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<RawLink> {
    Ok(RawLink {
        id: row.get(0)?,
        issuer_did: row.get(1)?,
        schema_url: row.get(2)?,
        schema_type: row.get(3)?,
        credential_subject: row.get(4)?,
        max_issuance: row.get(5)?,
        issued_claims: row.get(6)?,
        valid_until: row.get(7)?,
        credential_expiration: row.get(8)?,
        signature: row.get(9)?,
        mtp: row.get(10)?,
        active: row.get(11)?,
        refresh_service: row.get(12)?,
        display_method: row.get(13)?,
        created_at: row.get(14)?,
    })
}

fn parse_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>, ClaimsError> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| ClaimsError::InvalidRequest(format!("stored time {s}: {e}")))
    })
    .transpose()
}

fn format_time(t: Option<&DateTime<Utc>>) -> Option<String> {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn decode(raw: RawLink) -> Result<Link, ClaimsError> {
    Ok(Link {
        credential_subject: serde_json::from_str(&raw.credential_subject)?,
        max_issuance: raw.max_issuance.map(|m| m.max(0) as u32),
        issued_claims: raw.issued_claims.max(0) as u32,
        valid_until: parse_time(raw.valid_until)?,
        credential_expiration: parse_time(raw.credential_expiration)?,
        proofs: ProofTypes {
            signature: raw.signature,
            mtp: raw.mtp,
        },
        refresh_service: raw.refresh_service.map(|s| serde_json::from_str(&s)).transpose()?,
        display_method: raw.display_method.map(|s| serde_json::from_str(&s)).transpose()?,
        id: raw.id,
        issuer_did: raw.issuer_did,
        schema_url: raw.schema_url,
        schema_type: raw.schema_type,
        active: raw.active,
        created_at: raw.created_at,
    })
}

fn load_link(conn: &Connection, issuer: &Did, id: &str) -> Result<Link, ClaimsError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM links WHERE issuer_did = ?1 AND id = ?2"),
            params![issuer.to_string(), id],
            from_row,
        )
        .optional()?
        .ok_or_else(|| ClaimsError::NotFound(format!("link {id}")))?;
    decode(raw)
}

impl ClaimService {
    /// # Errors
    ///
    /// [`ClaimsError::InvalidRequest`] for empty proof types, a zero
    /// issuance cap or a past deadline; [`ClaimsError::Schema`] when the
    /// template does not fit the schema.
    pub async fn create_link(&self, issuer: &Did, request: CreateLinkRequest) -> Result<Link, ClaimsError> {
        if request.proofs.is_empty() {
            return Err(ClaimsError::InvalidRequest(
                "at least one proof type is required".into(),
            ));
        }
        if request.max_issuance == Some(0) {
            return Err(ClaimsError::InvalidRequest("max issuance must be positive".into()));
        }
        if request.valid_until.is_some_and(|t| t <= Utc::now()) {
            return Err(ClaimsError::InvalidRequest("valid until is in the past".into()));
        }
        let schema = self.schemas().load(&request.schema_url).await?;
        schema.check_type(&request.schema_type)?;
        schema.validate_subject(&request.credential_subject, &["id"])?;
        self.registry().get_by_did(issuer).await?;

        let (did, id) = (*issuer, uuid::Uuid::new_v4().to_string());
        let link = self
            .blocking(move |conn| {
                conn.execute(
                    "INSERT INTO links
                        (id, issuer_did, schema_url, schema_type, credential_subject, max_issuance,
                         valid_until, credential_expiration, signature_proof, mtp_proof,
                         refresh_service, display_method)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        id,
                        did.to_string(),
                        request.schema_url,
                        request.schema_type,
                        serde_json::to_string(&request.credential_subject)?,
                        request.max_issuance,
                        format_time(request.valid_until.as_ref()),
                        format_time(request.credential_expiration.as_ref()),
                        request.proofs.signature,
                        request.proofs.mtp,
                        request.refresh_service.map(|v| v.to_string()),
                        request.display_method.map(|v| v.to_string()),
                    ],
                )?;
                load_link(conn, &did, &id)
            })
            .await?;
        tracing::info!(did = %issuer, link = %link.id, "created link");
        Ok(link)
    }

    /// # Errors
    ///
    /// [`ClaimsError::NotFound`] for unknown links.
    pub async fn get_link(&self, issuer: &Did, id: &str) -> Result<Link, ClaimsError> {
        let (did, id) = (*issuer, id.to_string());
        self.blocking(move |conn| load_link(conn, &did, &id)).await
    }

    /// # Errors
    ///
    /// [`ClaimsError::Conflict`] when the link is already active.
    pub async fn activate_link(&self, issuer: &Did, id: &str) -> Result<Link, ClaimsError> {
        self.set_link_active(issuer, id, true).await
    }

    /// # Errors
    ///
    /// [`ClaimsError::Conflict`] when the link is already inactive.
    pub async fn deactivate_link(&self, issuer: &Did, id: &str) -> Result<Link, ClaimsError> {
        self.set_link_active(issuer, id, false).await
    }

    async fn set_link_active(&self, issuer: &Did, id: &str, active: bool) -> Result<Link, ClaimsError> {
        let (did, id) = (*issuer, id.to_string());
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE links SET active = ?3 WHERE issuer_did = ?1 AND id = ?2 AND active <> ?3",
                params![did.to_string(), id, active],
            )?;
            let link = load_link(conn, &did, &id)?;
            if changed == 0 {
                let state = if active { "active" } else { "inactive" };
                return Err(ClaimsError::Conflict(format!("link {id} is already {state}")));
            }
            Ok(link)
        })
        .await
    }

    /// Issues the link's credential to `user`.
    ///
    /// A slot is reserved with a guarded counter update before issuing and
    /// given back if issuing fails.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::Conflict`] when the link is inactive, expired or used
    /// up; otherwise as [`ClaimService::save`].
    pub async fn issue_from_link(&self, issuer: &Did, id: &str, user: &Did) -> Result<Claim, ClaimsError> {
        let link = self.get_link(issuer, id).await?;
        let status = link.status_at(Utc::now());
        if status != LinkStatus::Active {
            return Err(ClaimsError::Conflict(format!("link {id} is {status}")));
        }

        let (did, link_id) = (*issuer, link.id.clone());
        let reserved = self
            .blocking(move |conn| {
                Ok(conn.execute(
                    "UPDATE links SET issued_claims = issued_claims + 1
                     WHERE issuer_did = ?1 AND id = ?2 AND active = 1
                       AND (max_issuance IS NULL OR issued_claims < max_issuance)",
                    params![did.to_string(), link_id],
                )?)
            })
            .await?;
        if reserved == 0 {
            return Err(ClaimsError::Conflict(format!("link {id} is exceeded")));
        }

        let request = CreateClaimRequest {
            schema_url: link.schema_url.clone(),
            schema_type: link.schema_type.clone(),
            credential_subject: link.credential_subject.clone(),
            subject: Some(*user),
            expiration: link.credential_expiration.map(|t| t.timestamp()),
            revocation_nonce: None,
            proofs: link.proofs,
            status_mode: None,
            refresh_service: link.refresh_service.clone(),
            display_method: link.display_method.clone(),
        };
        match self.save(issuer, request).await {
            Ok(claim) => {
                tracing::info!(did = %issuer, link = %id, user = %user, "issued from link");
                Ok(claim)
            }
            Err(e) => {
                let link_id = link.id.clone();
                let released = self
                    .blocking(move |conn| {
                        Ok(conn.execute(
                            "UPDATE links SET issued_claims = issued_claims - 1
                             WHERE id = ?1 AND issued_claims > 0",
                            [link_id],
                        )?)
                    })
                    .await;
                if let Err(release) = released {
                    tracing::warn!(link = %id, "failed to release link slot: {}", release);
                }
                Err(e)
            }
        }
    }
}
