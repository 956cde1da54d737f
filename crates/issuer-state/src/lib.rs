//! Identity state transitions.
//!
//! The [`TransitionEngine`] turns tree changes into a `created` state row
//! and proves it with the `stateTransition` circuit. The [`Publisher`]
//! submits created rows to the State contract, waits for confirmations,
//! pushes the reverse hash service batch and attaches inclusion proofs to
//! the credentials that waited for the new state.

mod engine;
mod error;
mod publisher;
mod status;

pub use engine::{AuthWitness, TransitionEngine, TransitionPlan};
pub use error::StateError;
pub use publisher::{OnChainPublisher, Publisher, PublisherSettings};
pub use status::{revocation_status, RevocationStatus, StatusIssuer, StatusProof};
