//! Certificate serial numbers.
//!
//! Serials arrive as decimal integers (URL path segments) but are stored and
//! looked up as lowercase hex without leading zeros. X.509 allows serials of
//! up to 20 octets, which is wider than any native integer, so the decimal
//! conversion works on a big-endian octet buffer.
use std::{fmt, str::FromStr};

use thiserror::Error;

/// Largest serial accepted, in octets (RFC 5280 4.1.2.2)
pub const MAX_SERIAL_OCTETS: usize = 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseSerialError {
    #[error("serial number is empty")]
    Empty,
    #[error("invalid digit {0:?} in serial number")]
    InvalidDigit(char),
    #[error("serial number is longer than {MAX_SERIAL_OCTETS} octets")]
    TooLarge,
    #[error("malformed hex serial number: {0}")]
    MalformedHex(String),
}

impl From<hex::FromHexError> for ParseSerialError {
    fn from(err: hex::FromHexError) -> Self {
        match err {
            hex::FromHexError::InvalidHexCharacter { c, .. } => Self::InvalidDigit(c),
            other => Self::MalformedHex(other.to_string()),
        }
    }
}

/// A certificate serial number, normalized to its hex lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(String);

impl SerialNumber {
    /// Parse a non-negative decimal integer. Leading zeros are ignored.
    pub fn from_decimal(digits: &str) -> Result<Self, ParseSerialError> {
        if digits.is_empty() {
            return Err(ParseSerialError::Empty);
        }
        let mut octets: Vec<u8> = Vec::with_capacity(MAX_SERIAL_OCTETS);
        for c in digits.chars() {
            let mut carry = c.to_digit(10).ok_or(ParseSerialError::InvalidDigit(c))?;
            // octets = octets * 10 + digit
            for octet in octets.iter_mut().rev() {
                let acc = u32::from(*octet) * 10 + carry;
                *octet = (acc & 0xff) as u8;
                carry = acc >> 8;
            }
            while carry > 0 {
                octets.insert(0, (carry & 0xff) as u8);
                carry >>= 8;
            }
            if octets.len() > MAX_SERIAL_OCTETS {
                return Err(ParseSerialError::TooLarge);
            }
        }
        Ok(Self::from_octets(&octets))
    }

    /// Parse a hex string in either case. Leading zeros are ignored.
    pub fn from_hex(value: &str) -> Result<Self, ParseSerialError> {
        if value.is_empty() {
            return Err(ParseSerialError::Empty);
        }
        // hex reports bytes, not chars
        if let Some(c) = value.chars().find(|c| !c.is_ascii()) {
            return Err(ParseSerialError::InvalidDigit(c));
        }
        let padded = if value.len() % 2 == 1 {
            format!("0{value}")
        } else {
            value.to_owned()
        };
        let octets = hex::decode(padded)?;
        let significant = octets.iter().skip_while(|b| **b == 0).count();
        if significant > MAX_SERIAL_OCTETS {
            return Err(ParseSerialError::TooLarge);
        }
        Ok(Self::from_octets(&octets))
    }

    fn from_octets(octets: &[u8]) -> Self {
        let encoded = hex::encode(octets);
        let trimmed = encoded.trim_start_matches('0');
        if trimmed.is_empty() {
            Self("0".to_owned())
        } else {
            Self(trimmed.to_owned())
        }
    }

    /// the lowercase hex form used as the store key
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl From<u128> for SerialNumber {
    fn from(value: u128) -> Self {
        Self(format!("{value:x}"))
    }
}

impl FromStr for SerialNumber {
    type Err = ParseSerialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_decimal(s)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
