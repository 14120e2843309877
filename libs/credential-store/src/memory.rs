use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::{
    CredentialQuery, CredentialRecord, CredentialStore, LeaseUpdate, OwnerQuery, SerialNumber,
    Unset,
};

/// In-process store. Every operation runs under one lock, which makes each
/// primitive trivially atomic.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Vec<CredentialRecord>>>,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("serial number already exists in memory store: {0}")]
    SerialExists(SerialNumber),
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// add a record, as the signing workflow would
    pub fn insert(&self, record: CredentialRecord) -> Result<(), MemoryError> {
        let mut guard = self.inner.lock();
        if guard
            .iter()
            .any(|existing| existing.serial_number == record.serial_number)
        {
            return Err(MemoryError::SerialExists(record.serial_number));
        }
        guard.push(record);
        Ok(())
    }

    /// snapshot of every record
    pub fn select_all(&self) -> Vec<CredentialRecord> {
        self.inner.lock().clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    type Error = MemoryError;

    async fn find_one_and_update(
        &self,
        query: &CredentialQuery,
        update: &LeaseUpdate,
    ) -> Result<Option<CredentialRecord>, Self::Error> {
        let mut guard = self.inner.lock();
        Ok(guard
            .iter_mut()
            .find(|record| query.matches(record))
            .map(|record| {
                let before = record.clone();
                update.apply(record);
                before
            }))
    }

    async fn update_many(&self, query: &OwnerQuery, unset: &Unset) -> Result<u64, Self::Error> {
        let mut guard = self.inner.lock();
        let mut matched = 0;
        for record in guard.iter_mut().filter(|record| query.matches(record)) {
            unset.apply(record);
            matched += 1;
        }
        debug!(instance = %query.instance, matched, "unset fields on owned records");
        Ok(matched)
    }

    async fn find_one(
        &self,
        query: &CredentialQuery,
    ) -> Result<Option<CredentialRecord>, Self::Error> {
        let guard = self.inner.lock();
        Ok(guard.iter().find(|record| query.matches(record)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use chrono::Utc;

    use super::MemoryStore;
    use crate::{
        CredentialQuery, CredentialRecord, CredentialStore, Identity, Instance, LeaseUpdate,
        OwnerQuery, Remote, SerialNumber, Status, Unset,
    };

    fn update(instance: &str, internal: IpAddr) -> LeaseUpdate {
        LeaseUpdate {
            last_seen: Utc::now(),
            remote: Remote {
                addr: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
                port: 1194,
            },
            instance: Instance::from(instance.to_owned()),
            internal_addr: internal,
        }
    }

    #[tokio::test]
    async fn find_one_and_update_returns_pre_image() {
        let store = MemoryStore::new();
        store
            .insert(CredentialRecord::new(
                SerialNumber::from(42),
                "CN=bob",
                Status::Signed,
            ))
            .expect("seed record");
        let query = CredentialQuery::signed(Identity::Serial(SerialNumber::from(42)));
        let internal = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));

        let before = store
            .find_one_and_update(&query, &update("a-svc", internal))
            .await
            .expect("first update")
            .expect("record matched");
        assert!(before.owning_instance.is_none());
        assert!(before.internal_addresses.is_empty());

        let before = store
            .find_one_and_update(&query, &update("b-svc", internal))
            .await
            .expect("second update")
            .expect("record matched");
        assert_eq!(before.owning_instance.as_ref().map(Instance::as_str), Some("a-svc"));

        let after = store.find_one(&query).await.expect("lookup").expect("exists");
        assert_eq!(after.owning_instance.as_ref().map(Instance::as_str), Some("b-svc"));
        assert_eq!(after.internal_addresses.len(), 1);
    }

    #[tokio::test]
    async fn unsigned_records_do_not_match() {
        let store = MemoryStore::new();
        store
            .insert(CredentialRecord::new(
                SerialNumber::from(7),
                "CN=carol",
                Status::Unsigned,
            ))
            .expect("seed record");
        let query = CredentialQuery::signed(Identity::DistinguishedName("CN=carol".into()));

        let res = store
            .find_one_and_update(&query, &update("a-svc", IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .await
            .expect("update call");
        assert!(res.is_none());
        assert_eq!(store.select_all()[0].last_seen, None);
    }

    #[tokio::test]
    async fn update_many_counts_matches_and_is_idempotent() {
        let store = MemoryStore::new();
        for serial in 1..=3u128 {
            store
                .insert(CredentialRecord::new(
                    SerialNumber::from(serial),
                    format!("CN=client{serial}"),
                    Status::Signed,
                ))
                .expect("seed record");
        }
        for (serial, owner) in [(1u128, "a-svc"), (2, "a-svc"), (3, "b-svc")] {
            let query = CredentialQuery::signed(Identity::Serial(SerialNumber::from(serial)));
            store
                .find_one_and_update(&query, &update(owner, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))))
                .await
                .expect("lease update");
        }

        let owner = OwnerQuery::new(Instance::from("a-svc".to_owned()));
        assert_eq!(store.update_many(&owner, &Unset::DISOWN).await.unwrap(), 2);
        assert_eq!(store.update_many(&owner, &Unset::DISOWN).await.unwrap(), 0);

        let records = store.select_all();
        assert!(records[0].owning_instance.is_none());
        assert!(records[1].internal_addresses.is_empty());
        assert!(records[2].owning_instance.is_some());
    }

    #[test]
    fn duplicate_serials_are_rejected() {
        let store = MemoryStore::new();
        let rec = CredentialRecord::new(SerialNumber::from(9), "CN=dave", Status::Signed);
        store.insert(rec.clone()).expect("first insert");
        assert!(store.insert(rec).is_err());
    }
}
