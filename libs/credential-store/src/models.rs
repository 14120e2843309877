//! Credential records and the query/update documents the store understands.

use std::{collections::BTreeSet, fmt, net::IpAddr, str::FromStr};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::SerialNumber;

/// Signing lifecycle of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Unsigned,
    Signed,
    Revoked,
    Expired,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unsigned => "unsigned",
            Status::Signed => "signed",
            Status::Revoked => "revoked",
            Status::Expired => "expired",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown credential status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsigned" => Ok(Status::Unsigned),
            "signed" => Ok(Status::Signed),
            "revoked" => Ok(Status::Revoked),
            "expired" => Ok(Status::Expired),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

/// Owner of a lease: the replica's fully-qualified name joined with the
/// service name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Instance(String);

impl Instance {
    pub fn new(fqdn: &str, service: &str) -> Self {
        Self(format!("{fqdn}-{service}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Instance {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last observed address the client connected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Remote {
    pub addr: IpAddr,
    pub port: u16,
}

/// One issued certificate and the lease state reported against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub serial_number: SerialNumber,
    pub distinguished_name: String,
    pub status: Status,
    /// addresses the client reported as locally assigned. Empty means unset.
    pub internal_addresses: BTreeSet<IpAddr>,
    pub remote: Option<Remote>,
    pub last_seen: Option<DateTime<Utc>>,
    pub owning_instance: Option<Instance>,
    /// end of the validity window, if one was recorded at signing
    pub not_after: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// a record as the signing workflow leaves it: no lease state yet
    pub fn new(
        serial_number: SerialNumber,
        distinguished_name: impl Into<String>,
        status: Status,
    ) -> Self {
        Self {
            serial_number,
            distinguished_name: distinguished_name.into(),
            status,
            internal_addresses: BTreeSet::new(),
            remote: None,
            last_seen: None,
            owning_instance: None,
            not_after: None,
        }
    }

    pub fn with_not_after(mut self, not_after: DateTime<Utc>) -> Self {
        self.not_after = Some(not_after);
        self
    }
}

/// The key a lookup selects a record by. A query names exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Serial(SerialNumber),
    DistinguishedName(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Serial(serial) => write!(f, "serial:{serial}"),
            Identity::DistinguishedName(dn) => write!(f, "dn:{dn}"),
        }
    }
}

/// Selects at most one record by identity and status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialQuery {
    pub identity: Identity,
    pub status: Status,
    /// when set, records whose `not_after` is at or before this instant do
    /// not match
    pub valid_at: Option<DateTime<Utc>>,
}

impl CredentialQuery {
    /// match `identity` among signed records
    pub fn signed(identity: Identity) -> Self {
        Self {
            identity,
            status: Status::Signed,
            valid_at: None,
        }
    }

    pub fn valid_at(mut self, at: DateTime<Utc>) -> Self {
        self.valid_at = Some(at);
        self
    }

    pub fn matches(&self, record: &CredentialRecord) -> bool {
        let identity = match &self.identity {
            Identity::Serial(serial) => record.serial_number == *serial,
            Identity::DistinguishedName(dn) => record.distinguished_name == *dn,
        };
        let valid = match (self.valid_at, record.not_after) {
            (Some(at), Some(not_after)) => not_after > at,
            _ => true,
        };
        identity && record.status == self.status && valid
    }
}

/// Selects every record currently owned by `instance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerQuery {
    pub instance: Instance,
}

impl OwnerQuery {
    pub fn new(instance: Instance) -> Self {
        Self { instance }
    }

    pub fn matches(&self, record: &CredentialRecord) -> bool {
        record.owning_instance.as_ref() == Some(&self.instance)
    }
}

/// The write applied by a lease submission. `last_seen`, `remote` and
/// `instance` overwrite, `internal_addr` is added to the address set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseUpdate {
    pub last_seen: DateTime<Utc>,
    pub remote: Remote,
    pub instance: Instance,
    pub internal_addr: IpAddr,
}

impl LeaseUpdate {
    pub fn apply(&self, record: &mut CredentialRecord) {
        record.last_seen = Some(self.last_seen);
        record.remote = Some(self.remote);
        record.owning_instance = Some(self.instance.clone());
        record.internal_addresses.insert(self.internal_addr);
    }
}

/// Fields to clear on every matched record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unset {
    pub internal_addresses: bool,
    pub owning_instance: bool,
}

impl Unset {
    /// release ownership: drop the address set and the owning instance
    pub const DISOWN: Unset = Unset {
        internal_addresses: true,
        owning_instance: true,
    };

    pub fn apply(&self, record: &mut CredentialRecord) {
        if self.internal_addresses {
            record.internal_addresses.clear();
        }
        if self.owning_instance {
            record.owning_instance = None;
        }
    }
}
