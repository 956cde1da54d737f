//! Persistence operations for the event log.
//!
//! All writes go through [`emit_event`], which serialises the payload,
//! assigns a per-issuer sequence number, and inserts into the `event_log`
//! table in a single statement.

use rusqlite::{params, Connection};

use crate::error::ObserveError;
use crate::event::{EventPayload, IssuerEvent};

/// Writes a single event to the event log.
///
/// Event and entity types come from the payload. Runs on whatever
/// connection (or open transaction) the caller holds.
///
/// # Errors
///
/// Returns `ObserveError::Database` on SQL failure or
/// `ObserveError::Serialization` if the payload cannot be serialised.
pub fn emit_event(
    conn: &Connection,
    issuer: &str,
    entity_id: &str,
    payload: &EventPayload,
) -> Result<IssuerEvent, ObserveError> {
    let payload_json = serde_json::to_string(payload)?;

    // Sequence assignment and insert share one statement.
    let (id, seq, occurred_at) = conn.query_row(
        "INSERT INTO event_log
            (issuer, event_type, entity_type, entity_id, seq, payload_json)
         VALUES (
            ?1, ?2, ?3, ?4,
            (SELECT COALESCE(MAX(seq), 0) + 1 FROM event_log WHERE issuer = ?1),
            ?5
         )
         RETURNING id, seq, occurred_at",
        params![
            issuer,
            payload.event_type(),
            payload.entity_type(),
            entity_id,
            payload_json,
        ],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?)),
    )?;

    Ok(IssuerEvent {
        id,
        issuer: issuer.to_string(),
        event_type: payload.event_type().to_string(),
        entity_type: payload.entity_type().to_string(),
        entity_id: entity_id.to_string(),
        seq,
        payload_json,
        occurred_at,
    })
}

/// Filter criteria for querying the event log.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by issuer DID.
    pub issuer: Option<String>,
    /// Filter by event type string.
    pub event_type: Option<String>,
    /// Filter by entity type string.
    pub entity_type: Option<String>,
    /// Filter by entity ID.
    pub entity_id: Option<String>,
    /// Return events that occurred at or after this ISO 8601 timestamp.
    pub since: Option<String>,
    /// Maximum number of events to return (default: 100).
    pub limit: Option<i64>,
}

/// Queries the event log with optional filters, oldest first.
///
/// # Errors
///
/// Returns `ObserveError::Database` on SQL failure.
pub fn query_events(conn: &Connection, filter: &EventFilter) -> Result<Vec<IssuerEvent>, ObserveError> {
    let mut clauses: Vec<String> = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    let columns = [
        ("issuer", &filter.issuer),
        ("event_type", &filter.event_type),
        ("entity_type", &filter.entity_type),
        ("entity_id", &filter.entity_id),
    ];
    for (column, value) in columns {
        if let Some(value) = value {
            param_values.push(Box::new(value.clone()));
            clauses.push(format!("{column} = ?{}", param_values.len()));
        }
    }
    if let Some(ref since) = filter.since {
        param_values.push(Box::new(since.clone()));
        clauses.push(format!("occurred_at >= ?{}", param_values.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    param_values.push(Box::new(filter.limit.unwrap_or(100)));
    let sql = format!(
        "SELECT id, issuer, event_type, entity_type, entity_id, seq, payload_json, occurred_at
         FROM event_log
         {where_clause}
         ORDER BY id ASC
         LIMIT ?{}",
        param_values.len()
    );

    let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values.iter().map(|p| &**p).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_refs.as_slice(), |row| {
        Ok(IssuerEvent {
            id: row.get(0)?,
            issuer: row.get(1)?,
            event_type: row.get(2)?,
            entity_type: row.get(3)?,
            entity_id: row.get(4)?,
            seq: row.get(5)?,
            payload_json: row.get(6)?,
            occurred_at: row.get(7)?,
        })
    })?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}
