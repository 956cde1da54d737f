//! Issuer-to-user connections.
//!
//! A connection exists once a user DID holds at least one credential from
//! the issuer. Issuing again only bumps `modified_at`.

use crate::IdentityError;
use issuer_types::Did;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConnection {
    pub id: String,
    pub issuer_did: String,
    pub user_did: String,
    pub created_at: String,
    pub modified_at: String,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<UserConnection> {
    Ok(UserConnection {
        id: row.get(0)?,
        issuer_did: row.get(1)?,
        user_did: row.get(2)?,
        created_at: row.get(3)?,
        modified_at: row.get(4)?,
    })
}

/// Inserts or touches the connection and returns it with whether it is new.
///
/// # Errors
///
/// Database errors, including a foreign key failure for an unknown issuer.
pub fn upsert_connection(
    conn: &Connection,
    issuer: &Did,
    user: &Did,
) -> Result<(UserConnection, bool), IdentityError> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO connections (id, issuer_did, user_did) VALUES (?1, ?2, ?3)
         ON CONFLICT (issuer_did, user_did)
         DO UPDATE SET modified_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
        params![id, issuer.to_string(), user.to_string()],
    )?;
    let connection = conn.query_row(
        "SELECT id, issuer_did, user_did, created_at, modified_at
         FROM connections WHERE issuer_did = ?1 AND user_did = ?2",
        params![issuer.to_string(), user.to_string()],
        from_row,
    )?;
    let created = connection.id == id;
    if created {
        tracing::debug!(issuer = %issuer, user = %user, "new connection");
    }
    Ok((connection, created))
}

/// Connections of `issuer`, newest first.
///
/// # Errors
///
/// Database errors.
pub fn list_connections(conn: &Connection, issuer: &Did) -> Result<Vec<UserConnection>, IdentityError> {
    let mut stmt = conn.prepare(
        "SELECT id, issuer_did, user_did, created_at, modified_at
         FROM connections WHERE issuer_did = ?1
         ORDER BY created_at DESC, id ASC",
    )?;
    let rows = stmt.query_map([issuer.to_string()], from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// # Errors
///
/// [`IdentityError::NotFound`] for an unknown connection.
pub fn get_connection(conn: &Connection, issuer: &Did, id: &str) -> Result<UserConnection, IdentityError> {
    conn.query_row(
        "SELECT id, issuer_did, user_did, created_at, modified_at
         FROM connections WHERE issuer_did = ?1 AND id = ?2",
        params![issuer.to_string(), id],
        from_row,
    )
    .optional()?
    .ok_or_else(|| IdentityError::NotFound(format!("connection {id}")))
}

/// Removes a connection. Credentials already issued stay untouched.
///
/// # Errors
///
/// [`IdentityError::NotFound`] for an unknown connection.
pub fn delete_connection(conn: &Connection, issuer: &Did, id: &str) -> Result<(), IdentityError> {
    let deleted = conn.execute(
        "DELETE FROM connections WHERE issuer_did = ?1 AND id = ?2",
        params![issuer.to_string(), id],
    )?;
    if deleted == 0 {
        return Err(IdentityError::NotFound(format!("connection {id}")));
    }
    Ok(())
}
