//! Claim store and indexer.
//!
//! Credentials are issued against an identity's last confirmed state:
//! signature proofs immediately, inclusion proofs once the state that
//! commits to the claim is published. Schemas are fetched through a
//! pluggable cache; offers and sessions live in TTL stores.

pub mod cache;
mod error;
mod links;
pub mod merklize;
pub mod schema;
mod service;
pub mod store;
mod ttl;
pub mod w3c;

pub use cache::{Cache, MemoryCache, RespCache};
pub use error::ClaimsError;
pub use links::{CreateLinkRequest, Link, LinkStatus};
pub use schema::{Schema, SchemaLoader};
pub use service::{credential_offer, ClaimService, CreateClaimRequest, Offer, OfferType};
pub use store::{Claim, ClaimFilter, ClaimPage, SortField, SortKey, StatusFilter};
pub use ttl::TtlStore;
pub use w3c::W3CCredential;
