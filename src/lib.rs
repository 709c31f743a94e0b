//! identity-store - Identity and session persistence over a partitioned row store
//!
//! This crate provides the storage engine of an identity server:
//! - Realms, clients, users, user/client sessions, authentication sessions,
//!   login failures and single-use objects over redb
//! - Row-level TTLs with read-time expiry and a background sweeper
//! - Secondary attribute indexes with unique-claim semantics
//! - Roles, groups and client scopes stored as per-realm aggregates with
//!   deferred write-back per unit of work
//! - Session expiration decisions from realm and client timeouts

pub mod aggregate;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod expiration;
pub mod index;
pub mod provider;
pub mod repository;
pub mod storage;
#[cfg(test)]
pub mod testutil;
pub mod ttl;
pub mod uow;

pub use error::{StoreError, StoreResult};
pub use provider::{IdentityStore, StoreContext};
