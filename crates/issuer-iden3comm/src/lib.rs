//! Iden3comm envelopes for agent traffic.
//!
//! [`Packager`] wraps [`BasicMessage`]s in plain, JWS or JWZ envelopes
//! and opens them again. JWS signers are looked up through a
//! [`DidResolver`]; JWZ proofs are checked with a
//! [`ProofVerifier`](issuer_crypto::zk::ProofVerifier) and their GIST root
//! against the State contract through a [`StateResolver`].

mod error;
pub mod jws;
pub mod jwz;
mod message;
mod packer;
pub mod resolver;
pub mod state;
mod token;

pub use error::PackerError;
pub use message::{
    AuthorizationRequestBody, BasicMessage, CredentialFetchRequestBody, CredentialIssuanceBody,
    CredentialsOfferBody, MediaType, OfferedCredential, RevocationStatusRequestBody,
};
pub use packer::{sniff, Packager};
pub use resolver::{DidDocument, DidResolver, HttpDidResolver, LocalDidResolver};
pub use state::{ChainStateResolver, StateResolver};
pub use token::signing_digest;
