//! # lease-registry
//!
//! Tracks which replica owns each client credential's session and where the
//! client was last seen.
//!
//! Clients periodically report their lease. [`LeaseRegistry::submit`] turns a
//! validated report into one atomic find-and-update against the
//! [`CredentialStore`] and classifies the outcome from the pre-image the store
//! returns with the write:
//!
//! - [`Outcome::Updated`]: the record was refreshed by the replica that
//!   already owned it, or by the first replica to claim it
//! - [`Outcome::Migrated`]: the record was owned by a different replica
//! - [`Outcome::NotFound`]: no signed credential matched
//!
//! The outcome is never derived from a separate read.
//!
//! [`FlushCoordinator`] releases the ownership claims of this replica when it
//! restarts.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{fmt, future::Future, time::Duration};

use chrono::{DateTime, Utc};
use credential_store::{
    CredentialQuery, CredentialRecord, CredentialStore, Identity, Instance, LeaseUpdate,
    SerialNumber,
};
use tracing::{debug, error, info, instrument};

pub mod error;
pub mod flush;
pub mod form;
pub mod metrics;

pub use error::{RegistryError, ValidationError};
pub use flush::FlushCoordinator;
pub use form::{LeaseForm, LeaseReport};

/// Default bound on a single store call
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(3);

/// This process's identity among the gateway replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    fqdn: String,
}

impl Replica {
    pub fn new(fqdn: impl Into<String>) -> Self {
        Self { fqdn: fqdn.into() }
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    /// the owner string recorded for leases of `service` on this replica
    pub fn instance(&self, service: &str) -> Instance {
        Instance::new(&self.fqdn, service)
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fqdn)
    }
}

/// Result of a lease submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// refreshed by its owner, or claimed for the first time
    Updated,
    /// claimed away from another replica
    Migrated { from: Instance },
    /// no signed credential matched the identity
    NotFound,
}

impl Outcome {
    /// Classify a submission by `instance` from the pre-image of the record
    /// it wrote. An unset or empty prior owner is a fresh claim.
    pub fn classify(before: Option<&CredentialRecord>, instance: &Instance) -> Self {
        match before {
            None => Outcome::NotFound,
            Some(record) => match &record.owning_instance {
                Some(prev) if !prev.as_str().is_empty() && prev != instance => {
                    Outcome::Migrated { from: prev.clone() }
                }
                _ => Outcome::Updated,
            },
        }
    }

    /// did the submission write to the store
    pub fn is_applied(&self) -> bool {
        !matches!(self, Outcome::NotFound)
    }
}

/// Run a store call under `timeout`. Failures and timeouts are counted and
/// never folded into a not-found result.
pub(crate) async fn bounded<T, E, F>(timeout: Duration, fut: F) -> Result<T, RegistryError<E>>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(val)) => Ok(val),
        Ok(Err(err)) => {
            metrics::LEASE_STORE_ERRORS.inc();
            error!(%err, "credential store call failed");
            Err(RegistryError::Store(err))
        }
        Err(_) => {
            metrics::LEASE_STORE_ERRORS.inc();
            error!(?timeout, "credential store call timed out");
            Err(RegistryError::Timeout(timeout))
        }
    }
}

/// Applies lease submissions and answers validity checks.
///
/// Holds no mutable state of its own. Concurrent submissions are ordered by
/// the store's atomic primitive alone.
#[derive(Debug, Clone)]
pub struct LeaseRegistry<S> {
    store: S,
    replica: Replica,
    store_timeout: Duration,
    validity_window: bool,
}

impl<S> LeaseRegistry<S>
where
    S: CredentialStore,
{
    pub fn new(store: S, replica: Replica) -> Self {
        Self {
            store,
            replica,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            validity_window: false,
        }
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    /// When enabled, records whose recorded `not_after` has passed are
    /// treated as not found by both `submit` and `check_validity`.
    pub fn with_validity_window(mut self, enabled: bool) -> Self {
        self.validity_window = enabled;
        self
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// a flush coordinator sharing this registry's store handle and settings
    pub fn flush_coordinator(&self) -> FlushCoordinator<S>
    where
        S: Clone,
    {
        FlushCoordinator::new(self.store.clone(), self.replica.clone())
            .with_store_timeout(self.store_timeout)
    }

    fn query(&self, identity: Identity, now: DateTime<Utc>) -> CredentialQuery {
        let query = CredentialQuery::signed(identity);
        if self.validity_window {
            query.valid_at(now)
        } else {
            query
        }
    }

    /// Record a lease report against the signed credential selected by
    /// `identity`.
    ///
    /// Sets `last_seen`, overwrites `remote` and the owning instance, and adds
    /// the internal address to the record's address set, all in one atomic
    /// store operation.
    #[instrument(level = "debug", skip_all, fields(%identity, service = %report.service))]
    pub async fn submit(
        &self,
        identity: Identity,
        report: &LeaseReport,
    ) -> Result<Outcome, RegistryError<S::Error>> {
        let now = Utc::now();
        let instance = self.replica.instance(&report.service);
        let query = self.query(identity, now);
        let update = LeaseUpdate {
            last_seen: now,
            remote: report.remote,
            instance: instance.clone(),
            internal_addr: report.internal_addr,
        };

        let before = bounded(
            self.store_timeout,
            self.store.find_one_and_update(&query, &update),
        )
        .await?;
        let outcome = Outcome::classify(before.as_ref(), &instance);

        match &outcome {
            Outcome::Updated => {
                metrics::LEASE_UPDATES
                    .with_label_values(&[report.service.as_str()])
                    .inc();
                debug!("client lease info updated");
            }
            Outcome::Migrated { from } => {
                metrics::LEASE_UPDATES
                    .with_label_values(&[report.service.as_str()])
                    .inc();
                metrics::LEASE_MIGRATIONS
                    .with_label_values(&[self.replica.fqdn()])
                    .inc();
                info!(%from, to = %instance, "client migrated to this replica");
            }
            Outcome::NotFound => {
                metrics::LEASE_NOT_FOUND
                    .with_label_values(&[report.service.as_str()])
                    .inc();
                debug!("no signed credential for lease report");
            }
        }
        Ok(outcome)
    }

    /// Is there a signed credential with this serial number. Read only.
    #[instrument(level = "debug", skip(self), fields(serial = %serial))]
    pub async fn check_validity(
        &self,
        serial: &SerialNumber,
    ) -> Result<bool, RegistryError<S::Error>> {
        let query = self.query(Identity::Serial(serial.clone()), Utc::now());
        let found = bounded(self.store_timeout, self.store.find_one(&query)).await?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        net::{IpAddr, Ipv4Addr},
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use credential_store::{OwnerQuery, Remote, Status, Unset, memory::MemoryStore};
    use tracing_test::traced_test;

    use super::*;

    fn report(service: &str, internal: [u8; 4]) -> LeaseReport {
        LeaseReport {
            service: service.to_owned(),
            internal_addr: IpAddr::V4(Ipv4Addr::from(internal)),
            remote: Remote {
                addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 33)),
                port: 55_000,
            },
        }
    }

    fn store_with(serial: u128, dn: &str, status: Status) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert(CredentialRecord::new(SerialNumber::from(serial), dn, status))
            .expect("seed record");
        store
    }

    fn serial(serial: u128) -> Identity {
        Identity::Serial(SerialNumber::from(serial))
    }

    #[tokio::test]
    async fn first_submission_is_an_update() {
        let store = store_with(0x10, "CN=first", Status::Signed);
        let registry = LeaseRegistry::new(store.clone(), Replica::new("gw1.first.test"));

        let outcome = registry
            .submit(serial(0x10), &report("openvpn", [10, 8, 0, 2]))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Updated);

        let record = &store.select_all()[0];
        assert!(
            record
                .internal_addresses
                .contains(&IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2)))
        );
        assert_eq!(
            record.owning_instance.as_ref().map(Instance::as_str),
            Some("gw1.first.test-openvpn")
        );
        assert!(metrics::LEASE_UPDATES.with_label_values(&["openvpn"]).get() > 0);
    }

    #[tokio::test]
    async fn repeated_address_is_stored_once() {
        let store = store_with(0x11, "CN=repeat", Status::Signed);
        let registry = LeaseRegistry::new(store.clone(), Replica::new("gw1.repeat.test"));

        for _ in 0..2 {
            let outcome = registry
                .submit(serial(0x11), &report("openvpn", [10, 8, 0, 3]))
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::Updated);
        }
        registry
            .submit(serial(0x11), &report("openvpn", [10, 8, 0, 4]))
            .await
            .unwrap();

        let record = &store.select_all()[0];
        assert_eq!(record.internal_addresses.len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn submission_from_another_replica_is_a_migration() {
        let store = store_with(0x12, "CN=mover", Status::Signed);
        let replica_a = LeaseRegistry::new(store.clone(), Replica::new("gw-a.migrate.test"));
        let replica_b = LeaseRegistry::new(store.clone(), Replica::new("gw-b.migrate.test"));
        let migrations = |fqdn: &str| metrics::LEASE_MIGRATIONS.with_label_values(&[fqdn]).get();

        let outcome = replica_a
            .submit(serial(0x12), &report("ipsec", [10, 9, 0, 2]))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Updated);

        let outcome = replica_b
            .submit(serial(0x12), &report("ipsec", [10, 9, 0, 2]))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Migrated {
                from: Instance::new("gw-a.migrate.test", "ipsec")
            }
        );
        assert_eq!(migrations("gw-b.migrate.test"), 1);
        assert_eq!(migrations("gw-a.migrate.test"), 0);
        assert!(logs_contain("client migrated to this replica"));

        // back on b, an ordinary refresh
        let outcome = replica_b
            .submit(serial(0x12), &report("ipsec", [10, 9, 0, 2]))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Updated);
        assert_eq!(migrations("gw-b.migrate.test"), 1);
    }

    #[tokio::test]
    async fn unknown_or_unsigned_credentials_are_not_found() {
        let store = store_with(0x13, "CN=pending", Status::Unsigned);
        let registry = LeaseRegistry::new(store.clone(), Replica::new("gw1.notfound.test"));
        let not_found = || metrics::LEASE_NOT_FOUND.with_label_values(&["notfound-svc"]).get();

        let outcome = registry
            .submit(serial(0x13), &report("notfound-svc", [10, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NotFound);
        let outcome = registry
            .submit(
                Identity::DistinguishedName("CN=nobody".into()),
                &report("notfound-svc", [10, 0, 0, 1]),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NotFound);
        assert_eq!(not_found(), 2);

        let record = &store.select_all()[0];
        assert!(record.last_seen.is_none());
        assert!(record.internal_addresses.is_empty());
        assert!(record.owning_instance.is_none());
        assert!(!registry.check_validity(&SerialNumber::from(0x13)).await.unwrap());
    }

    #[tokio::test]
    async fn lookup_by_distinguished_name() {
        let store = store_with(0x14, "CN=by name,O=Example", Status::Signed);
        let registry = LeaseRegistry::new(store, Replica::new("gw1.dn.test"));

        let outcome = registry
            .submit(
                Identity::DistinguishedName("CN=by name,O=Example".into()),
                &report("openvpn", [10, 8, 1, 2]),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Updated);
        assert!(registry.check_validity(&SerialNumber::from(0x14)).await.unwrap());
    }

    #[tokio::test]
    async fn flush_releases_only_this_replica_and_service() {
        let store = MemoryStore::new();
        for (serial, dn) in [(0x20u128, "CN=f1"), (0x21, "CN=f2"), (0x22, "CN=f3")] {
            store
                .insert(CredentialRecord::new(SerialNumber::from(serial), dn, Status::Signed))
                .unwrap();
        }
        let here = LeaseRegistry::new(store.clone(), Replica::new("gw1.flush.test"));
        let there = LeaseRegistry::new(store.clone(), Replica::new("gw2.flush.test"));
        here.submit(serial(0x20), &report("flush-svc", [10, 1, 0, 1]))
            .await
            .unwrap();
        here.submit(serial(0x21), &report("other-svc", [10, 1, 0, 2]))
            .await
            .unwrap();
        there
            .submit(serial(0x22), &report("flush-svc", [10, 1, 0, 3]))
            .await
            .unwrap();
        let flushes = || metrics::LEASE_FLUSHES.with_label_values(&["flush-svc"]).get();

        let flusher = here.flush_coordinator();
        assert_eq!(flusher.flush("flush-svc").await.unwrap(), 1);
        assert_eq!(flusher.flush("flush-svc").await.unwrap(), 0);
        assert_eq!(flushes(), 2);

        let records = store.select_all();
        assert!(records[0].owning_instance.is_none());
        assert!(records[0].internal_addresses.is_empty());
        assert!(records[1].owning_instance.is_some());
        assert!(records[2].owning_instance.is_some());

        // a flushed record is claimed afresh, not migrated
        let outcome = there
            .submit(serial(0x20), &report("flush-svc", [10, 1, 0, 9]))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Updated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_submissions_yield_one_migration() {
        for round in 0..20u128 {
            let store = store_with(0x100 + round, "CN=racer", Status::Signed);
            let a = LeaseRegistry::new(store.clone(), Replica::new("gw-a.race.test"));
            let b = LeaseRegistry::new(store.clone(), Replica::new("gw-b.race.test"));
            let id = serial(0x100 + round);
            let report_a = report("race", [10, 2, 0, 1]);
            let report_b = report("race", [10, 2, 0, 2]);

            let id_b = id.clone();
            let ta = tokio::spawn(async move { a.submit(id, &report_a).await });
            let tb = tokio::spawn(async move { b.submit(id_b, &report_b).await });
            let outcomes = [ta.await.unwrap().unwrap(), tb.await.unwrap().unwrap()];
            let migrated = outcomes
                .iter()
                .filter(|o| matches!(o, Outcome::Migrated { .. }))
                .count();
            assert_eq!(migrated, 1, "round {round}: {outcomes:?}");

            // both addresses land no matter the interleaving
            assert_eq!(store.select_all()[0].internal_addresses.len(), 2);
        }
    }

    #[tokio::test]
    async fn validity_window_hides_lapsed_credentials() {
        let store = MemoryStore::new();
        store
            .insert(
                CredentialRecord::new(SerialNumber::from(0x30), "CN=lapsed", Status::Signed)
                    .with_not_after(Utc::now() - ChronoDuration::minutes(5)),
            )
            .unwrap();
        let lenient = LeaseRegistry::new(store.clone(), Replica::new("gw1.window.test"));
        let strict = lenient.clone().with_validity_window(true);

        assert!(lenient.check_validity(&SerialNumber::from(0x30)).await.unwrap());
        assert!(!strict.check_validity(&SerialNumber::from(0x30)).await.unwrap());
        assert_eq!(
            strict
                .submit(serial(0x30), &report("openvpn", [10, 3, 0, 1]))
                .await
                .unwrap(),
            Outcome::NotFound
        );
    }

    #[test]
    fn empty_prior_owner_is_a_fresh_claim() {
        let mut record = CredentialRecord::new(SerialNumber::from(1), "CN=x", Status::Signed);
        record.owning_instance = Some(Instance::from(String::new()));
        let me = Instance::new("gw1", "openvpn");
        assert_eq!(Outcome::classify(Some(&record), &me), Outcome::Updated);
        assert_eq!(Outcome::classify(None, &me), Outcome::NotFound);
    }

    #[test]
    fn only_not_found_leaves_the_store_untouched() {
        let from = Instance::new("gw2", "openvpn");
        assert!(Outcome::Updated.is_applied());
        assert!(Outcome::Migrated { from }.is_applied());
        assert!(!Outcome::NotFound.is_applied());
    }

    /// never answers
    #[derive(Debug, Clone, Default)]
    struct StalledStore;

    /// fails every call, counting them
    #[derive(Debug, Clone, Default)]
    struct BrokenStore {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CredentialStore for StalledStore {
        type Error = io::Error;

        async fn find_one_and_update(
            &self,
            _query: &CredentialQuery,
            _update: &LeaseUpdate,
        ) -> Result<Option<CredentialRecord>, Self::Error> {
            std::future::pending().await
        }

        async fn update_many(
            &self,
            _query: &OwnerQuery,
            _unset: &Unset,
        ) -> Result<u64, Self::Error> {
            std::future::pending().await
        }

        async fn find_one(
            &self,
            _query: &CredentialQuery,
        ) -> Result<Option<CredentialRecord>, Self::Error> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl CredentialStore for BrokenStore {
        type Error = io::Error;

        async fn find_one_and_update(
            &self,
            _query: &CredentialQuery,
            _update: &LeaseUpdate,
        ) -> Result<Option<CredentialRecord>, Self::Error> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }

        async fn update_many(
            &self,
            _query: &OwnerQuery,
            _unset: &Unset,
        ) -> Result<u64, Self::Error> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }

        async fn find_one(
            &self,
            _query: &CredentialQuery,
        ) -> Result<Option<CredentialRecord>, Self::Error> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_is_a_timeout_not_a_miss() {
        let registry = LeaseRegistry::new(StalledStore, Replica::new("gw1.slow.test"))
            .with_store_timeout(Duration::from_millis(250));

        let err = registry
            .submit(serial(1), &report("openvpn", [10, 0, 0, 1]))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        let err = registry
            .check_validity(&SerialNumber::from(1))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        let err = registry
            .flush_coordinator()
            .flush("openvpn")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn store_failures_propagate() {
        let store = BrokenStore::default();
        let registry = LeaseRegistry::new(store.clone(), Replica::new("gw1.broken.test"));
        let flushes_before = metrics::LEASE_FLUSHES
            .with_label_values(&["broken-svc"])
            .get();

        let err = registry
            .submit(serial(1), &report("broken-svc", [10, 0, 0, 1]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Store(_)));
        assert!(registry.check_validity(&SerialNumber::from(1)).await.is_err());
        assert!(registry.flush_coordinator().flush("broken-svc").await.is_err());
        assert_eq!(store.calls.load(Ordering::Relaxed), 3);
        // a failed flush is not counted
        assert_eq!(
            metrics::LEASE_FLUSHES
                .with_label_values(&["broken-svc"])
                .get(),
            flushes_before
        );
    }
}
