//! Discovery records and listener contracts
//!
//! The manager's discovery job converts backend reports into these value
//! types and diffs them across passes. Identity is the address components
//! only; mutable fields (name, alias, RSSI) do not participate in the diff.

use crate::transport::{AdapterReport, DeviceReport};
use crate::url::Url;
use std::fmt;
use std::hash::{Hash, Hasher};

/// An adapter visible in the latest discovery pass
#[derive(Debug, Clone)]
pub struct DiscoveredAdapter {
    pub url: Url,
    pub name: String,
    pub alias: String,
}

impl DiscoveredAdapter {
    pub(crate) fn from_report(report: &AdapterReport) -> Self {
        Self {
            url: Url::adapter(report.url.adapter_address().unwrap_or_default()),
            name: report.name.clone(),
            alias: report.alias.clone(),
        }
    }
}

impl PartialEq for DiscoveredAdapter {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for DiscoveredAdapter {}

impl Hash for DiscoveredAdapter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
    }
}

impl fmt::Display for DiscoveredAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.url, self.name)
    }
}

/// A device visible in the latest discovery pass
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub url: Url,
    pub name: String,
    pub alias: String,
    pub rssi: i16,
    pub bluetooth_class: u32,
}

impl DiscoveredDevice {
    pub(crate) fn from_report(report: &DeviceReport) -> Self {
        Self {
            url: Url::device(
                report.url.adapter_address().unwrap_or_default(),
                report.url.device_address().unwrap_or_default(),
            ),
            name: report.name.clone(),
            alias: report.alias.clone(),
            rssi: report.rssi,
            bluetooth_class: report.bluetooth_class,
        }
    }
}

impl PartialEq for DiscoveredDevice {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for DiscoveredDevice {}

impl Hash for DiscoveredDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
    }
}

impl fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}dBm", self.url, self.name, self.rssi)
    }
}

/// Notified about adapters appearing and vanishing
pub trait AdapterDiscoveryListener: Send + Sync {
    fn discovered(&self, adapter: &DiscoveredAdapter);
    fn lost(&self, url: &Url);
}

/// Notified about devices appearing and vanishing
pub trait DeviceDiscoveryListener: Send + Sync {
    fn discovered(&self, device: &DiscoveredDevice);
    fn lost(&self, url: &Url);
}
