//! Persistence layer for the issuer node.
//!
//! SQLite in WAL mode behind an `r2d2` pool, plus the embedded schema
//! migrations every other crate relies on. Tree nodes, identities, state
//! transitions, claims, links and the event log all live in one database
//! file so that a claim row and its tree mutation commit together.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
