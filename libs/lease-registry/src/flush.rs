//! Release of lease ownership held by this replica.
//!
//! A replica that restarts loses its in-memory session state, so the claims
//! it recorded before the restart are stale. Flushing unsets the address set
//! and owning instance on every record claimed by `<fqdn>-<service>`, which
//! makes the next submission for those clients look like a fresh claim
//! rather than a migration.
//!
//! Ownership is a plain string, so a flush cannot tell the previous process
//! apart from the current one on the same host and service.
use std::time::Duration;

use credential_store::{CredentialStore, OwnerQuery, Unset};
use tracing::{debug, info, instrument};

use crate::{DEFAULT_STORE_TIMEOUT, Replica, bounded, error::RegistryError, metrics};

#[derive(Debug, Clone)]
pub struct FlushCoordinator<S> {
    store: S,
    replica: Replica,
    store_timeout: Duration,
}

impl<S> FlushCoordinator<S>
where
    S: CredentialStore,
{
    pub fn new(store: S, replica: Replica) -> Self {
        Self {
            store,
            replica,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    /// Unset `internal_addresses` and `owning_instance` on every record owned
    /// by this replica and `service`. Returns how many records were released;
    /// running it again straight away releases none.
    #[instrument(level = "debug", skip(self), fields(replica = %self.replica))]
    pub async fn flush(&self, service: &str) -> Result<u64, RegistryError<S::Error>> {
        let query = OwnerQuery::new(self.replica.instance(service));
        let count = bounded(
            self.store_timeout,
            self.store.update_many(&query, &Unset::DISOWN),
        )
        .await?;
        metrics::LEASE_FLUSHES.with_label_values(&[service]).inc();
        if count > 0 {
            info!(instance = %query.instance, count, "released stale lease ownership");
        } else {
            debug!(instance = %query.instance, "no lease ownership to release");
        }
        Ok(count)
    }
}
