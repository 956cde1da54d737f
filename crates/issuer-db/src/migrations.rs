//! Embedded SQL migration runner.
//!
//! Migrations are SQL files embedded at compile time and applied in order
//! on startup. Applied names are recorded in `_issuer_migrations`; a
//! migration already recorded there is skipped.

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. New migrations are appended here.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_merkle",
        sql: include_str!("migrations/000_merkle.sql"),
    },
    Migration {
        name: "001_identities",
        sql: include_str!("migrations/001_identities.sql"),
    },
    Migration {
        name: "002_claims",
        sql: include_str!("migrations/002_claims.sql"),
    },
    Migration {
        name: "003_connections_links",
        sql: include_str!("migrations/003_connections_links.sql"),
    },
    Migration {
        name: "004_event_log",
        sql: include_str!("migrations/004_event_log.sql"),
    },
];

#[derive(Debug, Error)]
pub enum MigrationError {
    /// A SQL statement within a migration failed.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Runs all pending migrations and returns how many were applied.
///
/// # Errors
///
/// Returns `MigrationError` if a migration fails or the tracking table
/// cannot be read. A failed migration leaves no partial schema behind.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    run_migrations_from_list(conn, MIGRATIONS)
}

fn run_migrations_from_list(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<usize, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _issuer_migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| MigrationError::ExecutionFailed {
        name: "_issuer_migrations_bootstrap".to_string(),
        source: e,
    })?;

    let mut applied = 0;

    for migration in migrations {
        let already_applied: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM _issuer_migrations WHERE name = ?1",
                [migration.name],
                |row| row.get(0),
            )
            .map_err(MigrationError::StateQuery)?;

        if already_applied {
            tracing::debug!(migration = migration.name, "migration already applied");
            continue;
        }

        tracing::info!(migration = migration.name, "applying migration");

        let failed = |e| MigrationError::ExecutionFailed {
            name: migration.name.to_string(),
            source: e,
        };

        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(migration.sql).map_err(failed)?;
        tx.execute(
            "INSERT INTO _issuer_migrations (name) VALUES (?1)",
            [migration.name],
        )
        .map_err(failed)?;
        tx.commit().map_err(failed)?;

        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .expect("should query sqlite_master")
    }

    #[test]
    fn run_migrations_on_fresh_db() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, MIGRATIONS.len());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM _issuer_migrations", [], |row| {
                row.get(0)
            })
            .expect("should query migration count");
        assert_eq!(count as usize, MIGRATIONS.len());

        for table in [
            "identity_mts",
            "mt_nodes",
            "mt_roots",
            "identities",
            "identity_states",
            "claims",
            "connections",
            "links",
            "event_log",
        ] {
            assert!(table_exists(&conn, table), "{table} should exist");
        }
    }

    #[test]
    fn run_migrations_idempotent() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("first run should succeed");
        let second = run_migrations(&conn).expect("second run should succeed");
        assert_eq!(second, 0, "no new migrations to apply");
    }

    #[test]
    fn migration_side_effects_rollback_when_tracking_insert_fails() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let migrations = [Migration {
            name: "001_tracking_insert_conflict",
            sql: "
                CREATE TABLE rollback_probe (id INTEGER PRIMARY KEY);
                INSERT INTO _issuer_migrations (name) VALUES ('001_tracking_insert_conflict');
            ",
        }];

        let err = run_migrations_from_list(&conn, &migrations)
            .expect_err("tracking insert conflict should fail migration");
        match err {
            MigrationError::ExecutionFailed { name, .. } => {
                assert_eq!(name, "001_tracking_insert_conflict")
            }
            other => panic!("unexpected error type: {other:?}"),
        }
        assert!(!table_exists(&conn, "rollback_probe"));
    }

    #[test]
    fn second_in_flight_state_is_rejected() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("migrations should succeed");
        conn.execute(
            "INSERT INTO identities (did, method, blockchain, network, auth_key_id, auth_claim_id)
             VALUES ('did:test', 'polygonid', 'polygon', 'amoy', 'BJJ:k', 'c')",
            [],
        )
        .expect("insert identity");

        let insert = "INSERT INTO identity_states
            (identifier, new_state, new_claims, new_revs, new_roots, status)
            VALUES ('did:test', 'aa', 'bb', 'cc', 'dd', ?1)";
        conn.execute(insert, ["confirmed"]).expect("confirmed row");
        conn.execute(insert, ["created"]).expect("first in-flight row");
        assert!(conn.execute(insert, ["transacted"]).is_err());
        conn.execute(insert, ["failed"]).expect("failed rows are unconstrained");
    }

    #[test]
    fn revocation_nonce_unique_per_issuer() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("migrations should succeed");
        for did in ["did:a", "did:b"] {
            conn.execute(
                "INSERT INTO identities (did, method, blockchain, network, auth_key_id, auth_claim_id)
                 VALUES (?1, 'iden3', 'polygon', 'amoy', 'BJJ:k', 'c')",
                [did],
            )
            .expect("insert identity");
        }
        let insert = "INSERT INTO claims
            (id, issuer, schema_url, schema_type, schema_hash, ld_context, rev_nonce,
             core_claim, hash_index, credential_status, credential_subject)
            VALUES (?1, ?2, 'u', 't', 'h', 'c', 7, x'00', '1', '{}', '{}')";
        conn.execute(insert, ["c1", "did:a"]).expect("first claim");
        conn.execute(insert, ["c2", "did:b"]).expect("same nonce, other issuer");
        assert!(conn.execute(insert, ["c3", "did:a"]).is_err());
    }
}
