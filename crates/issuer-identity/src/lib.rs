//! Issuer identities: creation, the state log and user connections.
//!
//! An identity is born from its Baby Jubjub authentication claim. The
//! claim goes into a fresh claims tree, the three roots hash to the
//! genesis state, and the genesis state determines the DID. Everything
//! lands in one database transaction; the keys are linked to the DID
//! afterwards.
//!
//! The state log (`identity_states`) records every transition an identity
//! plans and publishes. Status moves only forward and every update is
//! guarded on the previous status, so a crashed or cancelled publisher
//! never leaves a row in between.

mod connections;
mod error;
mod identities;
pub mod proofs;
mod registry;
pub mod state;

pub use connections::{delete_connection, get_connection, list_connections, upsert_connection, UserConnection};
pub use error::IdentityError;
pub use identities::{get_auth_claim, get_identity, list_identities, AuthClaim, Identity};
pub use registry::{IdentityRegistry, AUTH_SCHEMA_CONTEXT, AUTH_SCHEMA_TYPE, AUTH_SCHEMA_URL};
pub use state::{StateRecord, StateSnapshot};
