//! Event payload and record types for the issuer event log.

use serde::{Deserialize, Serialize};

/// Structured event payloads.
///
/// Payloads are serialised to JSON and stored in the `payload_json` column
/// of the `event_log` table. Each variant corresponds to an `event_type`
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    // ── Identity ─────────────────────────────────────────────────────
    /// A new issuer identity was created with a confirmed genesis state.
    CreateIdentity {
        /// Decimal genesis state.
        state: String,
    },

    // ── Credentials ──────────────────────────────────────────────────
    /// A credential was issued.
    CreateCredential {
        /// Schema type of the credential.
        schema_type: String,
        /// Subject DID, absent for self-issued claims.
        subject: Option<String>,
        /// Whether the claim waits for an MTP.
        mtp: bool,
    },

    /// A credential was revoked.
    RevokeCredential {
        /// The revocation nonce added to the revocations tree.
        nonce: u64,
        /// Operator-supplied reason.
        reason: Option<String>,
    },

    /// A user DID received its first credential from this issuer.
    CreateConnection {
        /// The user DID.
        user_did: String,
    },

    // ── State ────────────────────────────────────────────────────────
    /// Trees changed; a state transition is needed.
    CreateState {
        /// What changed: `credential`, `revocation` or `reissuance`.
        reason: String,
    },

    /// A transition was submitted on chain.
    StateTransacted {
        /// Decimal new state.
        state: String,
        /// Transaction hash.
        tx: String,
    },

    /// A transition was mined and confirmed.
    StatePublished {
        /// Decimal new state.
        state: String,
        /// Block the transition was mined in.
        block_number: u64,
    },

    /// A transition failed and was abandoned.
    StateFailed {
        /// Decimal new state.
        state: String,
        /// The failure.
        error: String,
    },
}

impl EventPayload {
    /// Returns the canonical event type string for this payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CreateIdentity { .. } => "CREATE_IDENTITY",
            Self::CreateCredential { .. } => "CREATE_CREDENTIAL",
            Self::RevokeCredential { .. } => "REVOKE_CREDENTIAL",
            Self::CreateConnection { .. } => "CREATE_CONNECTION",
            Self::CreateState { .. } => "CREATE_STATE",
            Self::StateTransacted { .. } => "STATE_TRANSACTED",
            Self::StatePublished { .. } => "STATE_PUBLISHED",
            Self::StateFailed { .. } => "STATE_FAILED",
        }
    }

    /// Returns the entity type for this payload, used as the `entity_type`
    /// column in the event log.
    pub fn entity_type(&self) -> &'static str {
        match self {
            Self::CreateIdentity { .. } => "identity",
            Self::CreateCredential { .. } | Self::RevokeCredential { .. } => "credential",
            Self::CreateConnection { .. } => "connection",
            Self::CreateState { .. }
            | Self::StateTransacted { .. }
            | Self::StatePublished { .. }
            | Self::StateFailed { .. } => "state",
        }
    }

    /// Whether this event means the issuer's trees moved past the last
    /// published state.
    pub fn needs_transition(&self) -> bool {
        matches!(self, Self::CreateState { .. })
    }
}

/// A single row from the `event_log` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerEvent {
    /// Auto-incremented row ID.
    pub id: i64,
    /// The issuer DID that owns this event.
    pub issuer: String,
    /// The specific event type (e.g., `CREATE_CREDENTIAL`).
    pub event_type: String,
    /// The type of entity involved (e.g., `credential`, `state`).
    pub entity_type: String,
    /// The identifier of the entity involved.
    pub entity_id: String,
    /// Monotonically increasing sequence number within the issuer.
    pub seq: i64,
    /// The structured event payload as a JSON string.
    pub payload_json: String,
    /// ISO 8601 timestamp of when the event occurred.
    pub occurred_at: String,
}

impl IssuerEvent {
    /// Decodes the stored payload.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if the payload does not match any variant.
    pub fn payload(&self) -> Result<EventPayload, serde_json::Error> {
        serde_json::from_str(&self.payload_json)
    }
}
