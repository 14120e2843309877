//! Validation of the lease report a client submits.
//!
//! The gateway decodes the form body into [`LeaseForm`] with every field
//! optional, then calls [`LeaseForm::validate`]. Only a validated
//! [`LeaseReport`] can reach the registry, so malformed input never touches
//! the store.
use std::net::IpAddr;

use credential_store::{Identity, Remote, SerialNumber};
use serde::Deserialize;

use crate::error::ValidationError;

/// Highest remote port a client may report.
pub const MAX_REMOTE_PORT: u16 = 65534;

/// Raw form body, as submitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeaseForm {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub internal_addr: Option<String>,
    #[serde(default)]
    pub remote_addr: Option<String>,
    #[serde(default)]
    pub remote_port: Option<String>,
}

/// A lease report that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseReport {
    pub service: String,
    pub internal_addr: IpAddr,
    pub remote: Remote,
}

/// empty strings count as missing
fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::Missing(field))
}

fn ip_addr(value: Option<String>, field: &'static str) -> Result<IpAddr, ValidationError> {
    let value = required(value, field)?;
    value
        .parse()
        .map_err(|_| ValidationError::InvalidAddr { field, value })
}

fn port(value: Option<String>) -> Result<u16, ValidationError> {
    let value = required(value, "remote_port")?;
    match value.parse::<u16>() {
        Ok(port) if port <= MAX_REMOTE_PORT => Ok(port),
        _ => Err(ValidationError::InvalidPort(value)),
    }
}

impl LeaseForm {
    pub fn validate(self) -> Result<LeaseReport, ValidationError> {
        Ok(LeaseReport {
            service: required(self.service, "service")?,
            internal_addr: ip_addr(self.internal_addr, "internal_addr")?,
            remote: Remote {
                addr: ip_addr(self.remote_addr, "remote_addr")?,
                port: port(self.remote_port)?,
            },
        })
    }
}

/// identity from a decimal serial number path segment
pub fn serial_identity(serial: &str) -> Result<Identity, ValidationError> {
    Ok(Identity::Serial(SerialNumber::from_decimal(serial)?))
}

/// identity from an already percent-decoded distinguished name
pub fn dn_identity(dn: &str) -> Result<Identity, ValidationError> {
    if dn.is_empty() {
        return Err(ValidationError::Missing("distinguished_name"));
    }
    Ok(Identity::DistinguishedName(dn.to_owned()))
}
