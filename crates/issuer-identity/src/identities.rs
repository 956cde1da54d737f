use crate::IdentityError;
use issuer_crypto::claim::CoreClaim;
use issuer_kms::KeyId;
use issuer_revocation::CredentialStatus;
use issuer_types::Did;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

/// A persisted issuer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(serialize_with = "serialize_did")]
    pub did: Did,
    #[serde(skip)]
    pub auth_key: KeyId,
    #[serde(skip)]
    pub eth_key: Option<KeyId>,
    pub auth_claim_id: String,
    pub created_at: String,
}

fn serialize_did<S: serde::Serializer>(did: &Did, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(did)
}

const COLUMNS: &str = "did, auth_key_id, eth_key_id, auth_claim_id, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, Option<String>, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode(
    (did, auth, eth, auth_claim_id, created_at): (String, String, Option<String>, String, String),
) -> Result<Identity, IdentityError> {
    let corrupt = |what: &str, e: &dyn std::fmt::Display| {
        IdentityError::Corrupt(format!("{what} of {did}: {e}"))
    };
    Ok(Identity {
        did: did.parse().map_err(|e| corrupt("did", &e))?,
        auth_key: auth.parse().map_err(|e| corrupt("auth key", &e))?,
        eth_key: eth
            .map(|k| k.parse::<KeyId>())
            .transpose()
            .map_err(|e| corrupt("eth key", &e))?,
        auth_claim_id,
        created_at,
    })
}

pub(crate) fn insert_identity(
    conn: &Connection,
    did: &Did,
    auth_key: &KeyId,
    eth_key: Option<&KeyId>,
    auth_claim_id: &str,
) -> Result<(), IdentityError> {
    conn.execute(
        "INSERT INTO identities (did, method, blockchain, network, auth_key_id, eth_key_id, auth_claim_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            did.to_string(),
            did.method().as_str(),
            did.blockchain().as_str(),
            did.network().as_str(),
            auth_key.to_string(),
            eth_key.map(ToString::to_string),
            auth_claim_id,
        ],
    )?;
    Ok(())
}

/// # Errors
///
/// [`IdentityError::NotFound`] for an unknown DID.
pub fn get_identity(conn: &Connection, did: &Did) -> Result<Identity, IdentityError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM identities WHERE did = ?1"),
            [did.to_string()],
            from_row,
        )
        .optional()?
        .ok_or_else(|| IdentityError::NotFound(did.to_string()))?;
    decode(raw)
}

/// All identities, oldest first.
///
/// # Errors
///
/// Returns a database error or a decoding error for corrupt rows.
pub fn list_identities(conn: &Connection) -> Result<Vec<Identity>, IdentityError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM identities ORDER BY created_at ASC, did ASC"
    ))?;
    let rows = stmt.query_map([], from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(decode(row?)?);
    }
    Ok(out)
}

/// The Baby Jubjub authentication claim an identity was born from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaim {
    pub id: String,
    pub core_claim: CoreClaim,
    pub credential_status: CredentialStatus,
}

impl AuthClaim {
    pub fn revocation_nonce(&self) -> u64 {
        self.core_claim.revocation_nonce()
    }
}

/// # Errors
///
/// [`IdentityError::NotFound`] for an unknown DID.
pub fn get_auth_claim(conn: &Connection, did: &Did) -> Result<AuthClaim, IdentityError> {
    let (id, blob, status): (String, Vec<u8>, String) = conn
        .query_row(
            "SELECT c.id, c.core_claim, c.credential_status
             FROM identities i JOIN claims c ON c.id = i.auth_claim_id
             WHERE i.did = ?1",
            [did.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
        .ok_or_else(|| IdentityError::NotFound(did.to_string()))?;
    Ok(AuthClaim {
        core_claim: CoreClaim::from_bytes(&blob)?,
        credential_status: serde_json::from_str(&status)?,
        id,
    })
}
