//! Hierarchical Bluetooth resource identifiers
//!
//! A [`Url`] addresses an adapter, a device seen through an adapter, or a
//! characteristic of such a device. Governors and the manager registry key
//! everything by these values; the optional protocol segment records which
//! transport backend a handle came from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when parsing a URL from its string form
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UrlParseError {
    #[error("Empty URL")]
    Empty,

    #[error("Too many path segments: {0}")]
    TooManySegments(usize),

    #[error("Empty path segment in: {0}")]
    EmptySegment(String),
}

/// Identifier of one adapter, device or characteristic.
///
/// String form is `protocol://adapterAddress/deviceAddress/characteristicUUID`
/// with trailing segments optional. Equality compares the address components;
/// the protocol is compared only when both sides carry one, so a
/// protocol-bound URL still matches its protocol-less counterpart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Url {
    protocol: Option<String>,
    adapter_address: Option<String>,
    device_address: Option<String>,
    characteristic_uuid: Option<String>,
}

impl Url {
    /// URL of an adapter
    pub fn adapter(adapter_address: impl Into<String>) -> Self {
        Self {
            protocol: None,
            adapter_address: Some(adapter_address.into()),
            device_address: None,
            characteristic_uuid: None,
        }
    }

    /// URL of a device seen through an adapter
    pub fn device(adapter_address: impl Into<String>, device_address: impl Into<String>) -> Self {
        Self {
            protocol: None,
            adapter_address: Some(adapter_address.into()),
            device_address: Some(device_address.into()),
            characteristic_uuid: None,
        }
    }

    /// URL of a characteristic of a device
    pub fn characteristic(
        adapter_address: impl Into<String>,
        device_address: impl Into<String>,
        characteristic_uuid: impl Into<String>,
    ) -> Self {
        Self {
            protocol: None,
            adapter_address: Some(adapter_address.into()),
            device_address: Some(device_address.into()),
            characteristic_uuid: Some(characteristic_uuid.into()),
        }
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn adapter_address(&self) -> Option<&str> {
        self.adapter_address.as_deref()
    }

    pub fn device_address(&self) -> Option<&str> {
        self.device_address.as_deref()
    }

    pub fn characteristic_uuid(&self) -> Option<&str> {
        self.characteristic_uuid.as_deref()
    }

    /// Same URL bound to a specific transport backend
    pub fn copy_with_protocol(&self, protocol: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.protocol = Some(protocol.into());
        copy
    }

    /// Same URL with the protocol stripped
    pub fn copy_without_protocol(&self) -> Self {
        let mut copy = self.clone();
        copy.protocol = None;
        copy
    }

    /// The adapter portion of this URL (protocol preserved)
    pub fn adapter_url(&self) -> Self {
        Self {
            protocol: self.protocol.clone(),
            adapter_address: self.adapter_address.clone(),
            device_address: None,
            characteristic_uuid: None,
        }
    }

    /// The device portion of this URL (protocol preserved)
    pub fn device_url(&self) -> Self {
        Self {
            protocol: self.protocol.clone(),
            adapter_address: self.adapter_address.clone(),
            device_address: self.device_address.clone(),
            characteristic_uuid: None,
        }
    }

    /// The characteristic portion of this URL, i.e. the URL itself
    pub fn characteristic_url(&self) -> Self {
        self.clone()
    }

    pub fn is_adapter(&self) -> bool {
        self.adapter_address.is_some() && self.device_address.is_none()
    }

    pub fn is_device(&self) -> bool {
        self.device_address.is_some() && self.characteristic_uuid.is_none()
    }

    pub fn is_characteristic(&self) -> bool {
        self.characteristic_uuid.is_some()
    }

    /// True iff this URL's address path strictly extends `parent`'s.
    ///
    /// A device descends from its adapter, a characteristic from both its
    /// device and its adapter. A URL is not a descendant of itself.
    pub fn is_descendant(&self, parent: &Url) -> bool {
        if self.adapter_address != parent.adapter_address {
            return false;
        }
        match (&parent.device_address, &self.device_address) {
            // parent is an adapter: any device or characteristic below it
            (None, Some(_)) => true,
            (None, None) => false,
            // parent is a device or characteristic
            (Some(p), Some(s)) => {
                p == s && parent.characteristic_uuid.is_none() && self.characteristic_uuid.is_some()
            }
            (Some(_), None) => false,
        }
    }
}

// Protocol acts as a wildcard when absent on either side. Hash therefore
// covers the address components only, keeping equal values hashing equally.
impl PartialEq for Url {
    fn eq(&self, other: &Self) -> bool {
        let protocol_matches = match (&self.protocol, &other.protocol) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        protocol_matches
            && self.adapter_address == other.adapter_address
            && self.device_address == other.device_address
            && self.characteristic_uuid == other.characteristic_uuid
    }
}

impl Eq for Url {}

impl Hash for Url {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.adapter_address.hash(state);
        self.device_address.hash(state);
        self.characteristic_uuid.hash(state);
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(protocol) = &self.protocol {
            write!(f, "{}://", protocol)?;
        }
        if let Some(adapter) = &self.adapter_address {
            write!(f, "{}", adapter)?;
        }
        if let Some(device) = &self.device_address {
            write!(f, "/{}", device)?;
        }
        if let Some(characteristic) = &self.characteristic_uuid {
            write!(f, "/{}", characteristic)?;
        }
        Ok(())
    }
}

impl FromStr for Url {
    type Err = UrlParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(UrlParseError::Empty);
        }
        let (protocol, rest) = match s.split_once("://") {
            Some((proto, rest)) if !proto.is_empty() => (Some(proto.to_string()), rest),
            Some((_, rest)) => (None, rest),
            None => (None, s),
        };
        if rest.is_empty() {
            return Err(UrlParseError::Empty);
        }
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.len() > 3 {
            return Err(UrlParseError::TooManySegments(segments.len()));
        }
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(UrlParseError::EmptySegment(s.to_string()));
        }
        Ok(Self {
            protocol,
            adapter_address: segments.first().map(|s| s.to_string()),
            device_address: segments.get(1).map(|s| s.to_string()),
            characteristic_uuid: segments.get(2).map(|s| s.to_string()),
        })
    }
}
