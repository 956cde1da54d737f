//! Issuer event log.
//!
//! Every identity, credential and state change is recorded in an
//! append-only `event_log` table and fanned out on an in-process broadcast
//! channel. The state publisher listens for `CREATE_STATE` events to plan
//! transitions ahead of its periodic tick.
//!
//! | Entity | Event types |
//! |--------|-------------|
//! | `identity` | `CREATE_IDENTITY` |
//! | `credential` | `CREATE_CREDENTIAL`, `REVOKE_CREDENTIAL` |
//! | `connection` | `CREATE_CONNECTION` |
//! | `state` | `CREATE_STATE`, `STATE_TRANSACTED`, `STATE_PUBLISHED`, `STATE_FAILED` |
//!
//! # Usage
//!
//! ```rust,ignore
//! let event = emit_event(&tx, &did, &claim_id, &EventPayload::CreateState {
//!     reason: "credential".into(),
//! })?;
//! tx.commit()?;
//! bus.publish(event);
//! ```

mod bus;
mod error;
mod event;
mod store;

pub use bus::{EventBus, EVENT_CHANNEL_CAPACITY};
pub use error::ObserveError;
pub use event::{EventPayload, IssuerEvent};
pub use store::{emit_event, query_events, EventFilter};
