//! The identity state log.
//!
//! One row per planned or published state. Status updates are single
//! statements guarded on the expected previous status, so two writers
//! racing on the same row cannot both win.

use crate::error::is_constraint_violation;
use crate::IdentityError;
use issuer_crypto::Hash;
use issuer_merkle::TreeRoots;
use issuer_types::{Did, IdentityStateStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

/// A state hash with the three roots it commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub state: Hash,
    #[serde(skip)]
    pub roots: TreeRoots,
}

impl StateSnapshot {
    /// # Errors
    ///
    /// Hashing failures.
    pub fn from_roots(roots: TreeRoots) -> Result<Self, IdentityError> {
        Ok(Self {
            state: roots.state()?,
            roots,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub id: i64,
    pub identifier: Did,
    /// `None` for the genesis row.
    pub previous: Option<StateSnapshot>,
    pub current: StateSnapshot,
    pub is_genesis: bool,
    pub status: IdentityStateStatus,
    pub tx_id: Option<String>,
    pub block_number: Option<u64>,
    pub error: Option<String>,
    pub rhs_published: bool,
    pub created_at: String,
    pub modified_at: String,
}

impl StateRecord {
    /// Whether the transition starts from the identity's genesis state.
    pub fn is_old_state_genesis(&self) -> bool {
        self.previous
            .as_ref()
            .is_some_and(|p| self.identifier.is_genesis_state(p.state.as_le_bytes()))
    }
}

const COLUMNS: &str = "id, identifier, prev_state, prev_claims, prev_revs, prev_roots, \
     new_state, new_claims, new_revs, new_roots, is_genesis, status, tx_id, block_number, \
     error, rhs_published, created_at, modified_at";

struct RawState {
    id: i64,
    identifier: String,
    prev: [Option<String>; 4],
    new: [String; 4],
    is_genesis: bool,
    status: String,
    tx_id: Option<String>,
    block_number: Option<i64>,
    error: Option<String>,
    rhs_published: bool,
    created_at: String,
    modified_at: String,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<RawState> {
    Ok(RawState {
        id: row.get(0)?,
        identifier: row.get(1)?,
        prev: [row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?],
        new: [row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?],
        is_genesis: row.get(10)?,
        status: row.get(11)?,
        tx_id: row.get(12)?,
        block_number: row.get(13)?,
        error: row.get(14)?,
        rhs_published: row.get(15)?,
        created_at: row.get(16)?,
        modified_at: row.get(17)?,
    })
}

fn hash(id: i64, hex: &str) -> Result<Hash, IdentityError> {
    Hash::from_hex(hex).map_err(|e| IdentityError::Corrupt(format!("state {id}: {e}")))
}

fn snapshot(id: i64, [state, claims, revs, roots]: [&str; 4]) -> Result<StateSnapshot, IdentityError> {
    Ok(StateSnapshot {
        state: hash(id, state)?,
        roots: TreeRoots {
            claims: hash(id, claims)?,
            revocations: hash(id, revs)?,
            roots: hash(id, roots)?,
        },
    })
}

impl TryFrom<RawState> for StateRecord {
    type Error = IdentityError;

    fn try_from(raw: RawState) -> Result<Self, Self::Error> {
        let id = raw.id;
        let previous = match &raw.prev {
            [Some(s), Some(c), Some(r), Some(o)] => Some(snapshot(id, [s.as_str(), c.as_str(), r.as_str(), o.as_str()])?),
            [None, None, None, None] => None,
            _ => return Err(IdentityError::Corrupt(format!("state {id}: partial previous roots"))),
        };
        let [s, c, r, o] = &raw.new;
        Ok(Self {
            id,
            identifier: raw
                .identifier
                .parse()
                .map_err(|e| IdentityError::Corrupt(format!("state {id}: {e}")))?,
            previous,
            current: snapshot(id, [s.as_str(), c.as_str(), r.as_str(), o.as_str()])?,
            is_genesis: raw.is_genesis,
            status: raw
                .status
                .parse()
                .map_err(|e| IdentityError::Corrupt(format!("state {id}: {e}")))?,
            tx_id: raw.tx_id,
            block_number: raw.block_number.map(|b| b as u64),
            error: raw.error,
            rhs_published: raw.rhs_published,
            created_at: raw.created_at,
            modified_at: raw.modified_at,
        })
    }
}

fn query_one(
    conn: &Connection,
    sql_where: &str,
    params: impl rusqlite::Params,
) -> Result<Option<StateRecord>, IdentityError> {
    conn.query_row(&format!("SELECT {COLUMNS} FROM identity_states {sql_where}"), params, from_row)
        .optional()?
        .map(StateRecord::try_from)
        .transpose()
}

fn query_many(
    conn: &Connection,
    sql_where: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<StateRecord>, IdentityError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM identity_states {sql_where}"))?;
    let rows = stmt.query_map(params, from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(StateRecord::try_from(row?)?);
    }
    Ok(out)
}

/// Appends a state row and returns its id.
///
/// # Errors
///
/// [`IdentityError::TransitionInFlight`] when `status` is in flight and the
/// identity already has an in-flight row.
pub fn insert_state(
    conn: &Connection,
    did: &Did,
    previous: Option<&StateSnapshot>,
    current: &StateSnapshot,
    status: IdentityStateStatus,
) -> Result<i64, IdentityError> {
    let prev_hex = |f: fn(&StateSnapshot) -> Hash| previous.map(|p| f(p).hex());
    let result = conn.execute(
        "INSERT INTO identity_states
            (identifier, prev_state, prev_claims, prev_revs, prev_roots,
             new_state, new_claims, new_revs, new_roots, is_genesis, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            did.to_string(),
            prev_hex(|p| p.state),
            prev_hex(|p| p.roots.claims),
            prev_hex(|p| p.roots.revocations),
            prev_hex(|p| p.roots.roots),
            current.state.hex(),
            current.roots.claims.hex(),
            current.roots.revocations.hex(),
            current.roots.roots.hex(),
            previous.is_none(),
            status.as_str(),
        ],
    );
    match result {
        Ok(_) => {
            let id = conn.last_insert_rowid();
            tracing::debug!(did = %did, state = %current.state, id, status = %status, "recorded identity state");
            Ok(id)
        }
        Err(e) if is_constraint_violation(&e) => {
            Err(IdentityError::TransitionInFlight(did.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// # Errors
///
/// [`IdentityError::NotFound`] for an unknown id.
pub fn get_state(conn: &Connection, id: i64) -> Result<StateRecord, IdentityError> {
    query_one(conn, "WHERE id = ?1", [id])?
        .ok_or_else(|| IdentityError::NotFound(format!("state {id}")))
}

/// The newest confirmed state; every identity has at least its genesis.
///
/// # Errors
///
/// [`IdentityError::NotFound`] for an identity without states.
pub fn last_confirmed(conn: &Connection, did: &Did) -> Result<StateRecord, IdentityError> {
    query_one(
        conn,
        "WHERE identifier = ?1 AND status = 'confirmed' ORDER BY id DESC LIMIT 1",
        [did.to_string()],
    )?
    .ok_or_else(|| IdentityError::NotFound(did.to_string()))
}

/// The newest confirmed state whose nodes reached the reverse hash service.
///
/// # Errors
///
/// Database and decoding errors.
pub fn last_rhs_published(conn: &Connection, did: &Did) -> Result<Option<StateRecord>, IdentityError> {
    query_one(
        conn,
        "WHERE identifier = ?1 AND status = 'confirmed' AND rhs_published = 1
         ORDER BY id DESC LIMIT 1",
        [did.to_string()],
    )
}

/// The `created` or `transacted` row of `did`, if any.
///
/// # Errors
///
/// Database and decoding errors.
pub fn in_flight(conn: &Connection, did: &Did) -> Result<Option<StateRecord>, IdentityError> {
    query_one(
        conn,
        "WHERE identifier = ?1 AND status IN ('created', 'transacted')",
        [did.to_string()],
    )
}

/// Every state of `did`, newest first.
///
/// # Errors
///
/// Database and decoding errors.
pub fn list_for_identity(conn: &Connection, did: &Did) -> Result<Vec<StateRecord>, IdentityError> {
    query_many(conn, "WHERE identifier = ?1 ORDER BY id DESC", [did.to_string()])
}

/// Looks a state up by its hash.
///
/// # Errors
///
/// Database and decoding errors.
pub fn find_by_state(
    conn: &Connection,
    did: &Did,
    state: &Hash,
) -> Result<Option<StateRecord>, IdentityError> {
    query_one(
        conn,
        "WHERE identifier = ?1 AND new_state = ?2 ORDER BY id DESC LIMIT 1",
        params![did.to_string(), state.hex()],
    )
}

fn guarded_update(
    conn: &Connection,
    id: i64,
    from: &[IdentityStateStatus],
    expected: &'static str,
    set: &str,
    values: &[&dyn rusqlite::ToSql],
) -> Result<(), IdentityError> {
    let allowed = from
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE identity_states
         SET {set}, modified_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ?1 AND status IN ({allowed})"
    );
    let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&id as &dyn rusqlite::ToSql];
    bound.extend_from_slice(values);
    let changed = conn.execute(&sql, bound.as_slice())?;
    if changed == 0 {
        return Err(IdentityError::StatusMismatch { id, expected });
    }
    Ok(())
}

/// `created → transacted`.
///
/// # Errors
///
/// [`IdentityError::StatusMismatch`] if the row is not `created`.
pub fn mark_transacted(conn: &Connection, id: i64, tx: &str) -> Result<(), IdentityError> {
    guarded_update(
        conn,
        id,
        &[IdentityStateStatus::Created],
        "created",
        "status = 'transacted', tx_id = ?2",
        &[&tx as &dyn rusqlite::ToSql],
    )
}

/// `transacted → confirmed`.
///
/// # Errors
///
/// [`IdentityError::StatusMismatch`] if the row is not `transacted`.
pub fn mark_confirmed(conn: &Connection, id: i64, block_number: u64) -> Result<(), IdentityError> {
    let block = block_number as i64;
    guarded_update(
        conn,
        id,
        &[IdentityStateStatus::Transacted],
        "transacted",
        "status = 'confirmed', block_number = ?2, error = NULL",
        &[&block as &dyn rusqlite::ToSql],
    )
}

/// `created | transacted → failed`.
///
/// # Errors
///
/// [`IdentityError::StatusMismatch`] if the row is no longer in flight.
pub fn mark_failed(conn: &Connection, id: i64, error: &str) -> Result<(), IdentityError> {
    guarded_update(
        conn,
        id,
        &[IdentityStateStatus::Created, IdentityStateStatus::Transacted],
        "in flight",
        "status = 'failed', error = ?2",
        &[&error as &dyn rusqlite::ToSql],
    )
}

/// Flags a confirmed row once its nodes reached the reverse hash service.
///
/// # Errors
///
/// [`IdentityError::StatusMismatch`] if the row is not `confirmed`.
pub fn mark_rhs_published(conn: &Connection, id: i64) -> Result<(), IdentityError> {
    guarded_update(
        conn,
        id,
        &[IdentityStateStatus::Confirmed],
        "confirmed",
        "rhs_published = 1",
        &[],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identities::insert_identity;
    use issuer_crypto::poseidon;
    use issuer_kms::KeyId;
    use issuer_types::{Blockchain, DidMethod, KeyKind, NetworkId};

    fn snapshot_of(n: u64) -> StateSnapshot {
        StateSnapshot::from_roots(TreeRoots {
            claims: Hash::from_u64(n),
            revocations: Hash::ZERO,
            roots: Hash::ZERO,
        })
        .expect("snapshot")
    }

    fn setup() -> (Connection, Did, StateSnapshot) {
        let conn = Connection::open_in_memory().expect("db");
        issuer_db::run_migrations(&conn).expect("migrations");
        let genesis = snapshot_of(1);
        let did = Did::from_genesis_state(
            DidMethod::PolygonId,
            Blockchain::Polygon,
            NetworkId::Amoy,
            genesis.state.as_le_bytes(),
        )
        .expect("did");
        insert_identity(
            &conn,
            &did,
            &KeyId::new(KeyKind::BabyJubjub, "auth"),
            None,
            "auth-claim",
        )
        .expect("identity");
        insert_state(&conn, &did, None, &genesis, IdentityStateStatus::Confirmed).expect("genesis");
        (conn, did, genesis)
    }

    #[test]
    fn genesis_is_the_first_confirmed_state() {
        let (conn, did, genesis) = setup();
        let confirmed = last_confirmed(&conn, &did).expect("confirmed");
        assert!(confirmed.is_genesis);
        assert_eq!(confirmed.current, genesis);
        assert!(confirmed.previous.is_none());
        assert!(in_flight(&conn, &did).expect("query").is_none());
    }

    #[test]
    fn only_one_transition_in_flight() {
        let (conn, did, genesis) = setup();
        insert_state(&conn, &did, Some(&genesis), &snapshot_of(2), IdentityStateStatus::Created)
            .expect("first");
        let err = insert_state(&conn, &did, Some(&genesis), &snapshot_of(3), IdentityStateStatus::Created)
            .expect_err("second in flight");
        assert!(matches!(err, IdentityError::TransitionInFlight(_)));
        assert_eq!(err.kind(), issuer_types::ErrorKind::Conflict);
    }

    #[test]
    fn status_moves_forward_only() {
        let (conn, did, genesis) = setup();
        let next = snapshot_of(2);
        let id = insert_state(&conn, &did, Some(&genesis), &next, IdentityStateStatus::Created)
            .expect("insert");

        assert!(matches!(
            mark_confirmed(&conn, id, 10),
            Err(IdentityError::StatusMismatch { .. })
        ));
        mark_transacted(&conn, id, "0xabc").expect("transacted");
        assert!(mark_transacted(&conn, id, "0xdef").is_err());
        mark_confirmed(&conn, id, 10).expect("confirmed");
        assert!(mark_failed(&conn, id, "late").is_err());

        let row = get_state(&conn, id).expect("row");
        assert_eq!(row.status, IdentityStateStatus::Confirmed);
        assert_eq!(row.tx_id.as_deref(), Some("0xabc"));
        assert_eq!(row.block_number, Some(10));
        assert!(row.is_old_state_genesis());
        assert_eq!(last_confirmed(&conn, &did).expect("confirmed").id, id);
    }

    #[test]
    fn failed_rows_release_the_slot() {
        let (conn, did, genesis) = setup();
        let id = insert_state(&conn, &did, Some(&genesis), &snapshot_of(2), IdentityStateStatus::Created)
            .expect("insert");
        mark_failed(&conn, id, "reverted").expect("failed");
        assert!(in_flight(&conn, &did).expect("query").is_none());
        insert_state(&conn, &did, Some(&genesis), &snapshot_of(2), IdentityStateStatus::Created)
            .expect("retry plan");
        let states = list_for_identity(&conn, &did).expect("list");
        assert_eq!(states.len(), 3);
        assert_eq!(states[1].status, IdentityStateStatus::Failed);
    }

    #[test]
    fn rhs_flag_tracks_published_states() {
        let (conn, did, genesis) = setup();
        assert!(last_rhs_published(&conn, &did).expect("query").is_none());
        let id = last_confirmed(&conn, &did).expect("genesis").id;
        mark_rhs_published(&conn, id).expect("flag");
        let published = last_rhs_published(&conn, &did).expect("query").expect("row");
        assert_eq!(published.current, genesis);
        assert_eq!(
            find_by_state(&conn, &did, &genesis.state).expect("find").map(|r| r.id),
            Some(id)
        );
        assert!(find_by_state(&conn, &did, &poseidon::hash(&[Hash::from_u64(9)]).expect("hash"))
            .expect("find")
            .is_none());
    }
}
