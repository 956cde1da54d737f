//! Claim rows: persistence, lookups and the filtered listing.

use crate::error::is_constraint_violation;
use crate::ClaimsError;
use issuer_crypto::claim::CoreClaim;
use issuer_crypto::Hash;
use issuer_identity::proofs::{MtpProof, SignatureProof};
use issuer_identity::AUTH_SCHEMA_TYPE;
use issuer_revocation::CredentialStatus;
use issuer_types::Did;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::str::FromStr;

pub const DEFAULT_MAX_RESULTS: u32 = 50;

/// An issued credential in its internal form.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub id: String,
    pub issuer: Did,
    /// Absent for self-issued claims.
    pub subject: Option<Did>,
    pub schema_url: String,
    pub schema_type: String,
    pub schema_hash: String,
    pub ld_context: String,
    pub rev_nonce: u64,
    /// Unix seconds.
    pub expiration: Option<i64>,
    pub version: u32,
    pub updatable: bool,
    pub core_claim: CoreClaim,
    pub hash_index: Hash,
    pub signature_proof: Option<SignatureProof>,
    pub mtp_proof: Option<MtpProof>,
    /// Hex of the state whose publication the MTP waits for.
    pub identity_state: Option<String>,
    pub mtp: bool,
    pub revoked: bool,
    pub revocation_reason: Option<String>,
    pub credential_status: CredentialStatus,
    pub credential_subject: Map<String, Value>,
    pub refresh_service: Option<Value>,
    pub display_method: Option<Value>,
    pub created_at: String,
}

impl Claim {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration.is_some_and(|e| e < now)
    }
}

const COLUMNS: &str = "id, issuer, other_identifier, schema_url, schema_type, schema_hash, \
     ld_context, rev_nonce, expiration, version, updatable, core_claim, hash_index, \
     signature_proof, mtp_proof, identity_state, mtp, revoked, revocation_reason, \
     credential_status, credential_subject, refresh_service, display_method, created_at";

struct RawClaim {
    id: String,
    issuer: String,
    subject: Option<String>,
    schema_url: String,
    schema_type: String,
    schema_hash: String,
    ld_context: String,
    rev_nonce: i64,
    expiration: Option<i64>,
    version: i64,
    updatable: bool,
    core_claim: Vec<u8>,
    hash_index: String,
    signature_proof: Option<String>,
    mtp_proof: Option<String>,
    identity_state: Option<String>,
    mtp: bool,
    revoked: bool,
    revocation_reason: Option<String>,
    credential_status: String,
    credential_subject: String,
    refresh_service: Option<String>,
    display_method: Option<String>,
    created_at: String,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<RawClaim> {
    Ok(RawClaim {
        id: row.get(0)?,
        issuer: row.get(1)?,
        subject: row.get(2)?,
        schema_url: row.get(3)?,
        schema_type: row.get(4)?,
        schema_hash: row.get(5)?,
        ld_context: row.get(6)?,
        rev_nonce: row.get(7)?,
        expiration: row.get(8)?,
        version: row.get(9)?,
        updatable: row.get(10)?,
        core_claim: row.get(11)?,
        hash_index: row.get(12)?,
        signature_proof: row.get(13)?,
        mtp_proof: row.get(14)?,
        identity_state: row.get(15)?,
        mtp: row.get(16)?,
        revoked: row.get(17)?,
        revocation_reason: row.get(18)?,
        credential_status: row.get(19)?,
        credential_subject: row.get(20)?,
        refresh_service: row.get(21)?,
        display_method: row.get(22)?,
        created_at: row.get(23)?,
    })
}

fn opt_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>, ClaimsError> {
    Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
}

fn decode(raw: RawClaim) -> Result<Claim, ClaimsError> {
    Ok(Claim {
        issuer: raw.issuer.parse()?,
        subject: raw.subject.map(|s| s.parse::<Did>()).transpose()?,
        rev_nonce: raw.rev_nonce as u64,
        version: u32::try_from(raw.version).unwrap_or_default(),
        core_claim: CoreClaim::from_bytes(&raw.core_claim)?,
        hash_index: Hash::from_decimal(&raw.hash_index)?,
        signature_proof: opt_json(raw.signature_proof)?,
        mtp_proof: opt_json(raw.mtp_proof)?,
        credential_status: serde_json::from_str(&raw.credential_status)?,
        credential_subject: serde_json::from_str(&raw.credential_subject)?,
        refresh_service: opt_json(raw.refresh_service)?,
        display_method: opt_json(raw.display_method)?,
        id: raw.id,
        schema_url: raw.schema_url,
        schema_type: raw.schema_type,
        schema_hash: raw.schema_hash,
        ld_context: raw.ld_context,
        expiration: raw.expiration,
        updatable: raw.updatable,
        identity_state: raw.identity_state,
        mtp: raw.mtp,
        revoked: raw.revoked,
        revocation_reason: raw.revocation_reason,
        created_at: raw.created_at,
    })
}

fn to_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, ClaimsError> {
    Ok(value.map(serde_json::to_string).transpose()?)
}

/// Lowercased tokens a claim is found by: schema type, subject DID,
/// attribute names and scalar values.
pub fn search_text(schema_type: &str, subject: Option<&Did>, credential_subject: &Map<String, Value>) -> String {
    fn collect(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    out.push(k.to_lowercase());
                    collect(v, out);
                }
            }
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            Value::String(s) => out.push(s.to_lowercase()),
            Value::Null => {}
            other => out.push(other.to_string()),
        }
    }
    let mut tokens = vec![schema_type.to_lowercase()];
    if let Some(did) = subject {
        tokens.push(did.to_string().to_lowercase());
    }
    for (k, v) in credential_subject {
        tokens.push(k.to_lowercase());
        collect(v, &mut tokens);
    }
    tokens.join(" ")
}

/// # Errors
///
/// [`ClaimsError::Conflict`] when the issuer already used the revocation
/// nonce.
pub fn insert_claim(conn: &Connection, claim: &Claim) -> Result<(), ClaimsError> {
    let result = conn.execute(
        "INSERT INTO claims
            (id, issuer, other_identifier, schema_url, schema_type, schema_hash, ld_context,
             rev_nonce, expiration, version, updatable, core_claim, hash_index,
             signature_proof, mtp_proof, identity_state, mtp, revoked, revocation_reason,
             credential_status, credential_subject, refresh_service, display_method, search_text)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
        params![
            claim.id,
            claim.issuer.to_string(),
            claim.subject.map(|d| d.to_string()),
            claim.schema_url,
            claim.schema_type,
            claim.schema_hash,
            claim.ld_context,
            claim.rev_nonce as i64,
            claim.expiration,
            claim.version,
            claim.updatable,
            claim.core_claim.to_bytes().to_vec(),
            claim.hash_index.to_decimal(),
            to_json(claim.signature_proof.as_ref())?,
            to_json(claim.mtp_proof.as_ref())?,
            claim.identity_state,
            claim.mtp,
            claim.revoked,
            claim.revocation_reason,
            serde_json::to_string(&claim.credential_status)?,
            serde_json::to_string(&claim.credential_subject)?,
            to_json(claim.refresh_service.as_ref())?,
            to_json(claim.display_method.as_ref())?,
            search_text(&claim.schema_type, claim.subject.as_ref(), &claim.credential_subject),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => Err(ClaimsError::Conflict(format!(
            "revocation nonce {} already used by {}",
            claim.rev_nonce, claim.issuer
        ))),
        Err(e) => Err(e.into()),
    }
}

/// # Errors
///
/// [`ClaimsError::NotFound`] for an unknown claim.
pub fn get_claim(conn: &Connection, issuer: &Did, id: &str) -> Result<Claim, ClaimsError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM claims WHERE issuer = ?1 AND id = ?2"),
            params![issuer.to_string(), id],
            from_row,
        )
        .optional()?
        .ok_or_else(|| ClaimsError::NotFound(format!("credential {id}")))?;
    decode(raw)
}

/// # Errors
///
/// [`ClaimsError::NotFound`] when nothing was deleted.
pub fn delete_claim(conn: &Connection, issuer: &Did, id: &str) -> Result<(), ClaimsError> {
    let deleted = conn.execute(
        "DELETE FROM claims WHERE issuer = ?1 AND id = ?2",
        params![issuer.to_string(), id],
    )?;
    if deleted == 0 {
        return Err(ClaimsError::NotFound(format!("credential {id}")));
    }
    Ok(())
}

/// Flags the claim holding `nonce` as revoked. Returns whether a claim
/// matched; nonces without a claim may still be revoked.
///
/// # Errors
///
/// Database errors.
pub fn mark_revoked(
    conn: &Connection,
    issuer: &Did,
    nonce: u64,
    reason: Option<&str>,
) -> Result<bool, ClaimsError> {
    let updated = conn.execute(
        "UPDATE claims SET revoked = 1, revocation_reason = ?3
         WHERE issuer = ?1 AND rev_nonce = ?2",
        params![issuer.to_string(), nonce as i64, reason],
    )?;
    Ok(updated > 0)
}

/// Points every claim still waiting for an MTP at `state_hex`.
///
/// Claims left over from a failed transition are re-pointed too: their
/// leaves are in the tree the new state commits to.
///
/// # Errors
///
/// Database errors.
pub fn tag_pending_mtp(conn: &Connection, issuer: &Did, state_hex: &str) -> Result<usize, ClaimsError> {
    Ok(conn.execute(
        "UPDATE claims SET identity_state = ?2
         WHERE issuer = ?1 AND mtp = 1 AND mtp_proof IS NULL",
        params![issuer.to_string(), state_hex],
    )?)
}

/// Claims whose MTP waits on the publication of `state_hex`.
///
/// # Errors
///
/// Database and decoding errors.
pub fn waiting_on_state(conn: &Connection, issuer: &Did, state_hex: &str) -> Result<Vec<Claim>, ClaimsError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM claims
         WHERE issuer = ?1 AND identity_state = ?2 AND mtp = 1 AND mtp_proof IS NULL
         ORDER BY rowid"
    ))?;
    let rows = stmt.query_map(params![issuer.to_string(), state_hex], from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(decode(row?)?);
    }
    Ok(out)
}

/// # Errors
///
/// Database and serialization errors.
pub fn set_mtp_proof(conn: &Connection, id: &str, proof: &MtpProof) -> Result<(), ClaimsError> {
    conn.execute(
        "UPDATE claims SET mtp_proof = ?2 WHERE id = ?1",
        params![id, serde_json::to_string(proof)?],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Revoked,
    Expired,
}

impl FromStr for StatusFilter {
    type Err = ClaimsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "all" => Ok(Self::All),
            "revoked" => Ok(Self::Revoked),
            "expired" => Ok(Self::Expired),
            other => Err(ClaimsError::InvalidRequest(format!("unknown status filter {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    SchemaType,
    ExpiresAt,
    Revoked,
}

impl SortField {
    fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::SchemaType => "schema_type",
            Self::ExpiresAt => "expiration",
            Self::Revoked => "revoked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub descending: bool,
}

/// Parses `createdAt,-schemaType` style sort lists.
///
/// # Errors
///
/// [`ClaimsError::InvalidRequest`] for unknown keys ("wrong sort by value")
/// and for a field named twice ("repeated sort by value field").
pub fn parse_sort(raw: &str) -> Result<Vec<SortKey>, ClaimsError> {
    let mut keys: Vec<SortKey> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (descending, name) = match part.strip_prefix('-') {
            Some(name) => (true, name),
            None => (false, part),
        };
        let field = match name {
            "createdAt" => SortField::CreatedAt,
            "schemaType" => SortField::SchemaType,
            "expiresAt" => SortField::ExpiresAt,
            "revoked" => SortField::Revoked,
            _ => return Err(ClaimsError::InvalidRequest("wrong sort by value".into())),
        };
        if keys.iter().any(|k| k.field == field) {
            return Err(ClaimsError::InvalidRequest("repeated sort by value field".into()));
        }
        keys.push(SortKey { field, descending });
    }
    Ok(keys)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Subject DID.
    pub subject: Option<String>,
    /// Whitespace separated tokens, all of which must match.
    pub query: Option<String>,
    pub status: StatusFilter,
    /// 1-based.
    pub page: u32,
    pub max_results: u32,
    /// Empty means newest first.
    pub sort: Vec<SortKey>,
}

impl Default for ClaimFilter {
    fn default() -> Self {
        Self {
            subject: None,
            query: None,
            status: StatusFilter::All,
            page: 1,
            max_results: DEFAULT_MAX_RESULTS,
            sort: Vec::new(),
        }
    }
}

impl ClaimFilter {
    /// # Errors
    ///
    /// [`ClaimsError::InvalidRequest`] for a zero page or page size.
    pub fn validate(&self) -> Result<(), ClaimsError> {
        if self.page == 0 {
            return Err(ClaimsError::InvalidRequest("page must be at least 1".into()));
        }
        if self.max_results == 0 {
            return Err(ClaimsError::InvalidRequest("max_results must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClaimPage {
    pub claims: Vec<Claim>,
    /// Matches across all pages.
    pub total: u64,
}

/// Lists an issuer's credentials. Auth claims are never listed.
///
/// # Errors
///
/// [`ClaimsError::InvalidRequest`] from [`ClaimFilter::validate`], database
/// and decoding errors.
pub fn list_claims(
    conn: &Connection,
    issuer: &Did,
    filter: &ClaimFilter,
    now: i64,
) -> Result<ClaimPage, ClaimsError> {
    filter.validate()?;

    let mut clauses = vec!["issuer = ?".to_string(), "schema_type <> ?".to_string()];
    let mut values = vec![
        SqlValue::Text(issuer.to_string()),
        SqlValue::Text(AUTH_SCHEMA_TYPE.to_string()),
    ];
    if let Some(subject) = &filter.subject {
        clauses.push("other_identifier = ?".into());
        values.push(SqlValue::Text(subject.clone()));
    }
    if let Some(query) = &filter.query {
        for token in query.split_whitespace() {
            clauses.push("instr(search_text, ?) > 0".into());
            values.push(SqlValue::Text(token.to_lowercase()));
        }
    }
    match filter.status {
        StatusFilter::All => {}
        StatusFilter::Revoked => clauses.push("revoked = 1".into()),
        StatusFilter::Expired => {
            clauses.push("expiration IS NOT NULL AND expiration < ?".into());
            values.push(SqlValue::Integer(now));
        }
    }
    let where_sql = clauses.join(" AND ");

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM claims WHERE {where_sql}"),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    let sort = if filter.sort.is_empty() {
        vec![SortKey {
            field: SortField::CreatedAt,
            descending: true,
        }]
    } else {
        filter.sort.clone()
    };
    let mut order: Vec<String> = sort
        .iter()
        .map(|k| format!("{} {}", k.field.column(), if k.descending { "DESC" } else { "ASC" }))
        .collect();
    order.push(format!("rowid {}", if sort[0].descending { "DESC" } else { "ASC" }));

    let offset = i64::from(filter.page - 1) * i64::from(filter.max_results);
    let mut page_values = values;
    page_values.push(SqlValue::Integer(i64::from(filter.max_results)));
    page_values.push(SqlValue::Integer(offset));

    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM claims WHERE {where_sql} ORDER BY {} LIMIT ? OFFSET ?",
        order.join(", ")
    ))?;
    let rows = stmt.query_map(params_from_iter(page_values.iter()), from_row)?;
    let mut claims = Vec::new();
    for row in rows {
        claims.push(decode(row?)?);
    }
    Ok(ClaimPage {
        claims,
        total: total as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_keys_parse() {
        let keys = parse_sort("createdAt,-schemaType").expect("sort");
        assert_eq!(
            keys,
            vec![
                SortKey {
                    field: SortField::CreatedAt,
                    descending: false
                },
                SortKey {
                    field: SortField::SchemaType,
                    descending: true
                },
            ]
        );
        assert!(parse_sort("").expect("empty").is_empty());
    }

    #[test]
    fn sort_key_errors() {
        let err = parse_sort("createdAt,-createdAt").expect_err("repeated");
        assert_eq!(err.to_string(), "invalid request: repeated sort by value field");
        let err = parse_sort("revoked,revoked").expect_err("repeated");
        assert!(err.to_string().contains("repeated sort by value field"));
        let err = parse_sort("nonsense").expect_err("unknown");
        assert_eq!(err.to_string(), "invalid request: wrong sort by value");
    }

    #[test]
    fn status_filter_parses() {
        assert_eq!("".parse::<StatusFilter>().expect("all"), StatusFilter::All);
        assert_eq!("revoked".parse::<StatusFilter>().expect("rev"), StatusFilter::Revoked);
        assert!("live".parse::<StatusFilter>().is_err());
    }

    #[test]
    fn search_text_tokens() {
        let subject = serde_json::json!({"Name": "Alice", "age": 30, "address": {"City": "Vigo"}});
        let text = search_text(
            "KYCAgeCredential",
            None,
            subject.as_object().expect("object"),
        );
        for token in ["kycagecredential", "name", "alice", "age", "30", "address", "city", "vigo"] {
            assert!(text.split(' ').any(|t| t == token), "{token} in {text}");
        }
    }
}
