//! Transport backend contract
//!
//! A transport backend exposes native adapter/device/characteristic handles
//! behind these traits. Handles are volatile: any call may fail, and the
//! governor layer treats every failure uniformly by resetting and
//! re-acquiring. The factory is the only way handles enter the system.

use crate::url::Url;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfacing from a transport backend
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Native object gone: {0}")]
    ObjectGone(Url),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Notification subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Callback used for backend-pushed notifications.
///
/// Runs on whichever thread the backend delivers events on; it must be fast
/// and non-blocking.
pub type Notification<T> = Box<dyn Fn(T) + Send + Sync>;

/// A GATT service resolved on a connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub url: Url,
    pub characteristics: Vec<Url>,
}

/// Common surface of every native handle
pub trait BluetoothObject: Send + Sync {
    /// The handle's own URL, protocol included
    fn url(&self) -> Url;

    /// Release the native resource. Called exactly once per acquisition,
    /// after the owning governor has torn down its domain state.
    fn dispose(&self) -> Result<(), TransportError>;
}

/// Native adapter handle
pub trait Adapter: BluetoothObject {
    fn get_name(&self) -> Result<String, TransportError>;
    fn get_alias(&self) -> Result<String, TransportError>;
    fn set_alias(&self, alias: &str) -> Result<(), TransportError>;
    fn is_powered(&self) -> Result<bool, TransportError>;
    fn set_powered(&self, powered: bool) -> Result<(), TransportError>;
    fn is_discovering(&self) -> Result<bool, TransportError>;
    fn start_discovery(&self) -> Result<(), TransportError>;
    fn stop_discovery(&self) -> Result<(), TransportError>;

    /// URLs of devices currently known to this adapter
    fn get_device_urls(&self) -> Result<Vec<Url>, TransportError>;

    fn enable_powered_notifications(&self, callback: Notification<bool>)
        -> Result<(), TransportError>;
    fn disable_powered_notifications(&self) -> Result<(), TransportError>;
    fn enable_discovering_notifications(
        &self,
        callback: Notification<bool>,
    ) -> Result<(), TransportError>;
    fn disable_discovering_notifications(&self) -> Result<(), TransportError>;
}

/// Native device handle
pub trait Device: BluetoothObject {
    fn get_name(&self) -> Result<String, TransportError>;
    fn get_alias(&self) -> Result<String, TransportError>;
    fn set_alias(&self, alias: &str) -> Result<(), TransportError>;
    fn get_bluetooth_class(&self) -> Result<u32, TransportError>;
    fn is_ble_enabled(&self) -> Result<bool, TransportError>;
    fn is_connected(&self) -> Result<bool, TransportError>;
    fn connect(&self) -> Result<(), TransportError>;
    fn disconnect(&self) -> Result<(), TransportError>;
    fn is_blocked(&self) -> Result<bool, TransportError>;
    fn set_blocked(&self, blocked: bool) -> Result<(), TransportError>;
    fn get_rssi(&self) -> Result<i16, TransportError>;

    /// Advertised TX power, 0 when the device does not advertise one
    fn get_tx_power(&self) -> Result<i16, TransportError>;

    fn is_services_resolved(&self) -> Result<bool, TransportError>;
    fn get_services(&self) -> Result<Vec<GattService>, TransportError>;

    fn enable_rssi_notifications(&self, callback: Notification<i16>)
        -> Result<(), TransportError>;
    fn disable_rssi_notifications(&self) -> Result<(), TransportError>;
    fn enable_connected_notifications(
        &self,
        callback: Notification<bool>,
    ) -> Result<(), TransportError>;
    fn disable_connected_notifications(&self) -> Result<(), TransportError>;
    fn enable_blocked_notifications(
        &self,
        callback: Notification<bool>,
    ) -> Result<(), TransportError>;
    fn disable_blocked_notifications(&self) -> Result<(), TransportError>;
    fn enable_services_resolved_notifications(
        &self,
        callback: Notification<bool>,
    ) -> Result<(), TransportError>;
    fn disable_services_resolved_notifications(&self) -> Result<(), TransportError>;
    fn enable_manufacturer_data_notifications(
        &self,
        callback: Notification<HashMap<u16, Vec<u8>>>,
    ) -> Result<(), TransportError>;
    fn disable_manufacturer_data_notifications(&self) -> Result<(), TransportError>;
    fn enable_service_data_notifications(
        &self,
        callback: Notification<HashMap<Url, Vec<u8>>>,
    ) -> Result<(), TransportError>;
    fn disable_service_data_notifications(&self) -> Result<(), TransportError>;
}

/// Native characteristic handle
pub trait Characteristic: BluetoothObject {
    fn read_value(&self) -> Result<Vec<u8>, TransportError>;
    fn write_value(&self, value: &[u8]) -> Result<(), TransportError>;
    fn is_notifying(&self) -> Result<bool, TransportError>;
    fn enable_value_notifications(
        &self,
        callback: Notification<Vec<u8>>,
    ) -> Result<(), TransportError>;
    fn disable_value_notifications(&self) -> Result<(), TransportError>;
}

/// Raw discovery record for an adapter, as reported by a backend
#[derive(Debug, Clone)]
pub struct AdapterReport {
    pub url: Url,
    pub name: String,
    pub alias: String,
}

/// Raw discovery record for a device, as reported by a backend
#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub url: Url,
    pub name: String,
    pub alias: String,
    pub rssi: i16,
    pub bluetooth_class: u32,
}

/// Factory producing native handles, one per backend.
///
/// `None` from an acquisition getter means "not visible right now"; the
/// governor stays un-ready and tries again on the next refresh.
pub trait BluetoothObjectFactory: Send + Sync {
    /// The protocol scheme this backend serves, e.g. `bluez` or `tinyb`
    fn protocol_name(&self) -> &str;

    fn get_adapter(&self, url: &Url) -> Option<Arc<dyn Adapter>>;
    fn get_device(&self, url: &Url) -> Option<Arc<dyn Device>>;
    fn get_characteristic(&self, url: &Url) -> Option<Arc<dyn Characteristic>>;

    /// Adapters currently visible to this backend
    fn discovered_adapters(&self) -> Vec<AdapterReport>;

    /// Devices currently visible to this backend, `None` when the backend
    /// cannot enumerate right now
    fn discovered_devices(&self) -> Option<Vec<DeviceReport>>;
}
