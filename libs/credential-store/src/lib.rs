//! # credential-store
//!
//! `credential-store` defines a trait `CredentialStore` over the document store
//! that holds one record per issued client certificate.
//!
//! It offers three primitives, each of which a backend must execute
//! atomically:
//!
//! - [`CredentialStore::find_one_and_update`] applies a lease update to the
//!   single record matching a query and hands back the record as it was
//!   *before* the write.
//! - [`CredentialStore::update_many`] unsets fields on every record owned by
//!   an instance and reports how many records matched.
//! - [`CredentialStore::find_one`] is a read-only lookup.
//!
//! Deciding what to write and how to interpret the result is left to the
//! lease registry, which wraps any `CredentialStore` implementation.
//!
//! Two backends ship with the crate: [`memory::MemoryStore`] and
//! [`sqlite::SqliteDb`].
use async_trait::async_trait;

pub mod memory;
pub mod models;
pub mod serial;
pub mod sqlite;

pub use models::{
    CredentialQuery, CredentialRecord, Identity, Instance, LeaseUpdate, OwnerQuery, Remote,
    Status, Unset, UnknownStatus,
};
pub use serial::{ParseSerialError, SerialNumber};

#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    // send/sync/static required for async trait bounds
    type Error: std::error::Error + Send + Sync + 'static;

    /// Atomically apply `update` to the record matching `query`.
    ///
    /// Returns the matched record as it was before the update, or `None` if
    /// nothing matched. No concurrent caller may observe a partially applied
    /// update, and the returned pre-image must be the state this write
    /// replaced.
    async fn find_one_and_update(
        &self,
        query: &CredentialQuery,
        update: &LeaseUpdate,
    ) -> Result<Option<CredentialRecord>, Self::Error>;

    /// Atomically unset fields on all records matching `query`, returning the
    /// number of records matched.
    async fn update_many(&self, query: &OwnerQuery, unset: &Unset) -> Result<u64, Self::Error>;

    async fn find_one(
        &self,
        query: &CredentialQuery,
    ) -> Result<Option<CredentialRecord>, Self::Error>;
}
