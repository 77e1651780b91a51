//! In-memory mock transport and recording listeners for integration tests

#![allow(dead_code)]

use btmanager_core::transport::{
    Adapter, AdapterReport, BluetoothObject, BluetoothObjectFactory, Characteristic, Device,
    DeviceReport, GattService, Notification, TransportError,
};
use btmanager_core::url::Url;
use btmanager_core::GovernorListener;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

pub const PROTOCOL: &str = "mock";

/// Shared, ordered log of everything observable in a scenario
#[derive(Default)]
pub struct EventLog {
    entries: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|logged| logged.as_str() == entry)
            .count()
    }

    pub fn index_of(&self, entry: &str) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .position(|logged| logged.as_str() == entry)
    }
}

/// Governor listener that records transitions into an [`EventLog`]
pub struct RecordingGovernorListener {
    pub tag: String,
    pub log: Arc<EventLog>,
}

impl GovernorListener for RecordingGovernorListener {
    fn ready(&self, ready: bool) {
        self.log.push(format!("{}:ready:{}", self.tag, ready));
    }

    fn last_updated_changed(&self, _at: SystemTime) {
        self.log.push(format!("{}:lastUpdated", self.tag));
    }
}

// ============================================================================
// MOCK ADAPTER
// ============================================================================

pub struct MockAdapter {
    pub url: Url,
    pub log: Arc<EventLog>,
    pub name: Mutex<String>,
    pub alias: Mutex<String>,
    pub powered: AtomicBool,
    pub discovering: AtomicBool,
    pub device_urls: Mutex<Vec<Url>>,
    pub fail_operations: AtomicBool,
    pub dispose_count: AtomicU32,
    powered_callback: Mutex<Option<Notification<bool>>>,
    discovering_callback: Mutex<Option<Notification<bool>>>,
}

impl MockAdapter {
    pub fn new(url: Url, log: Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            url,
            log,
            name: Mutex::new("mock-adapter".into()),
            alias: Mutex::new(String::new()),
            powered: AtomicBool::new(false),
            discovering: AtomicBool::new(false),
            device_urls: Mutex::new(Vec::new()),
            fail_operations: AtomicBool::new(false),
            dispose_count: AtomicU32::new(0),
            powered_callback: Mutex::new(None),
            discovering_callback: Mutex::new(None),
        })
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.fail_operations.load(Ordering::SeqCst) {
            Err(TransportError::Backend("injected adapter failure".into()))
        } else {
            Ok(())
        }
    }

    pub fn push_powered(&self, powered: bool) {
        if let Some(callback) = self.powered_callback.lock().as_ref() {
            callback(powered);
        }
    }
}

impl BluetoothObject for MockAdapter {
    fn url(&self) -> Url {
        self.url.copy_with_protocol(PROTOCOL)
    }

    fn dispose(&self) -> Result<(), TransportError> {
        self.dispose_count.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("disposed:{}", self.url));
        Ok(())
    }
}

impl Adapter for MockAdapter {
    fn get_name(&self) -> Result<String, TransportError> {
        self.check()?;
        Ok(self.name.lock().clone())
    }

    fn get_alias(&self) -> Result<String, TransportError> {
        self.check()?;
        Ok(self.alias.lock().clone())
    }

    fn set_alias(&self, alias: &str) -> Result<(), TransportError> {
        self.check()?;
        *self.alias.lock() = alias.to_string();
        Ok(())
    }

    fn is_powered(&self) -> Result<bool, TransportError> {
        self.check()?;
        Ok(self.powered.load(Ordering::SeqCst))
    }

    fn set_powered(&self, powered: bool) -> Result<(), TransportError> {
        self.check()?;
        self.powered.store(powered, Ordering::SeqCst);
        Ok(())
    }

    fn is_discovering(&self) -> Result<bool, TransportError> {
        self.check()?;
        Ok(self.discovering.load(Ordering::SeqCst))
    }

    fn start_discovery(&self) -> Result<(), TransportError> {
        self.check()?;
        self.discovering.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_discovery(&self) -> Result<(), TransportError> {
        self.check()?;
        self.discovering.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn get_device_urls(&self) -> Result<Vec<Url>, TransportError> {
        self.check()?;
        Ok(self.device_urls.lock().clone())
    }

    fn enable_powered_notifications(
        &self,
        callback: Notification<bool>,
    ) -> Result<(), TransportError> {
        self.check()?;
        *self.powered_callback.lock() = Some(callback);
        Ok(())
    }

    fn disable_powered_notifications(&self) -> Result<(), TransportError> {
        *self.powered_callback.lock() = None;
        Ok(())
    }

    fn enable_discovering_notifications(
        &self,
        callback: Notification<bool>,
    ) -> Result<(), TransportError> {
        self.check()?;
        *self.discovering_callback.lock() = Some(callback);
        Ok(())
    }

    fn disable_discovering_notifications(&self) -> Result<(), TransportError> {
        *self.discovering_callback.lock() = None;
        Ok(())
    }
}

// ============================================================================
// MOCK DEVICE
// ============================================================================

pub struct MockDevice {
    pub url: Url,
    pub log: Arc<EventLog>,
    pub name: Mutex<String>,
    pub alias: Mutex<String>,
    pub connected: AtomicBool,
    pub blocked: AtomicBool,
    pub rssi: AtomicI16,
    pub tx_power: AtomicI16,
    pub services: Mutex<Vec<GattService>>,
    pub fail_operations: AtomicBool,
    pub dispose_count: AtomicU32,
    pub connect_count: AtomicU32,
    pub disconnect_count: AtomicU32,
    rssi_callback: Mutex<Option<Notification<i16>>>,
    connected_callback: Mutex<Option<Notification<bool>>>,
    blocked_callback: Mutex<Option<Notification<bool>>>,
    services_callback: Mutex<Option<Notification<bool>>>,
    manufacturer_callback: Mutex<Option<Notification<HashMap<u16, Vec<u8>>>>>,
    service_data_callback: Mutex<Option<Notification<HashMap<Url, Vec<u8>>>>>,
}

impl MockDevice {
    pub fn new(url: Url, log: Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            url,
            log,
            name: Mutex::new("mock-device".into()),
            alias: Mutex::new(String::new()),
            connected: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            rssi: AtomicI16::new(-60),
            tx_power: AtomicI16::new(0),
            services: Mutex::new(Vec::new()),
            fail_operations: AtomicBool::new(false),
            dispose_count: AtomicU32::new(0),
            connect_count: AtomicU32::new(0),
            disconnect_count: AtomicU32::new(0),
            rssi_callback: Mutex::new(None),
            connected_callback: Mutex::new(None),
            blocked_callback: Mutex::new(None),
            services_callback: Mutex::new(None),
            manufacturer_callback: Mutex::new(None),
            service_data_callback: Mutex::new(None),
        })
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.fail_operations.load(Ordering::SeqCst) {
            Err(TransportError::Backend("injected device failure".into()))
        } else {
            Ok(())
        }
    }

    pub fn push_rssi(&self, rssi: i16) {
        if let Some(callback) = self.rssi_callback.lock().as_ref() {
            callback(rssi);
        }
    }

    pub fn push_connected(&self, connected: bool) {
        if let Some(callback) = self.connected_callback.lock().as_ref() {
            callback(connected);
        }
    }

    pub fn push_manufacturer_data(&self, data: HashMap<u16, Vec<u8>>) {
        if let Some(callback) = self.manufacturer_callback.lock().as_ref() {
            callback(data);
        }
    }
}

impl BluetoothObject for MockDevice {
    fn url(&self) -> Url {
        self.url.copy_with_protocol(PROTOCOL)
    }

    fn dispose(&self) -> Result<(), TransportError> {
        self.dispose_count.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("disposed:{}", self.url));
        Ok(())
    }
}

impl Device for MockDevice {
    fn get_name(&self) -> Result<String, TransportError> {
        self.check()?;
        Ok(self.name.lock().clone())
    }

    fn get_alias(&self) -> Result<String, TransportError> {
        self.check()?;
        Ok(self.alias.lock().clone())
    }

    fn set_alias(&self, alias: &str) -> Result<(), TransportError> {
        self.check()?;
        *self.alias.lock() = alias.to_string();
        Ok(())
    }

    fn get_bluetooth_class(&self) -> Result<u32, TransportError> {
        self.check()?;
        Ok(0)
    }

    fn is_ble_enabled(&self) -> Result<bool, TransportError> {
        self.check()?;
        Ok(true)
    }

    fn is_connected(&self) -> Result<bool, TransportError> {
        self.check()?;
        Ok(self.connected.load(Ordering::SeqCst))
    }

    fn connect(&self) -> Result<(), TransportError> {
        self.check()?;
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.check()?;
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_blocked(&self) -> Result<bool, TransportError> {
        self.check()?;
        Ok(self.blocked.load(Ordering::SeqCst))
    }

    fn set_blocked(&self, blocked: bool) -> Result<(), TransportError> {
        self.check()?;
        self.blocked.store(blocked, Ordering::SeqCst);
        Ok(())
    }

    fn get_rssi(&self) -> Result<i16, TransportError> {
        self.check()?;
        Ok(self.rssi.load(Ordering::SeqCst))
    }

    fn get_tx_power(&self) -> Result<i16, TransportError> {
        self.check()?;
        Ok(self.tx_power.load(Ordering::SeqCst))
    }

    fn is_services_resolved(&self) -> Result<bool, TransportError> {
        self.check()?;
        Ok(!self.services.lock().is_empty())
    }

    fn get_services(&self) -> Result<Vec<GattService>, TransportError> {
        self.check()?;
        Ok(self.services.lock().clone())
    }

    fn enable_rssi_notifications(
        &self,
        callback: Notification<i16>,
    ) -> Result<(), TransportError> {
        self.check()?;
        *self.rssi_callback.lock() = Some(callback);
        Ok(())
    }

    fn disable_rssi_notifications(&self) -> Result<(), TransportError> {
        *self.rssi_callback.lock() = None;
        Ok(())
    }

    fn enable_connected_notifications(
        &self,
        callback: Notification<bool>,
    ) -> Result<(), TransportError> {
        self.check()?;
        *self.connected_callback.lock() = Some(callback);
        Ok(())
    }

    fn disable_connected_notifications(&self) -> Result<(), TransportError> {
        *self.connected_callback.lock() = None;
        Ok(())
    }

    fn enable_blocked_notifications(
        &self,
        callback: Notification<bool>,
    ) -> Result<(), TransportError> {
        self.check()?;
        *self.blocked_callback.lock() = Some(callback);
        Ok(())
    }

    fn disable_blocked_notifications(&self) -> Result<(), TransportError> {
        *self.blocked_callback.lock() = None;
        Ok(())
    }

    fn enable_services_resolved_notifications(
        &self,
        callback: Notification<bool>,
    ) -> Result<(), TransportError> {
        self.check()?;
        *self.services_callback.lock() = Some(callback);
        Ok(())
    }

    fn disable_services_resolved_notifications(&self) -> Result<(), TransportError> {
        *self.services_callback.lock() = None;
        Ok(())
    }

    fn enable_manufacturer_data_notifications(
        &self,
        callback: Notification<HashMap<u16, Vec<u8>>>,
    ) -> Result<(), TransportError> {
        self.check()?;
        *self.manufacturer_callback.lock() = Some(callback);
        Ok(())
    }

    fn disable_manufacturer_data_notifications(&self) -> Result<(), TransportError> {
        *self.manufacturer_callback.lock() = None;
        Ok(())
    }

    fn enable_service_data_notifications(
        &self,
        callback: Notification<HashMap<Url, Vec<u8>>>,
    ) -> Result<(), TransportError> {
        self.check()?;
        *self.service_data_callback.lock() = Some(callback);
        Ok(())
    }

    fn disable_service_data_notifications(&self) -> Result<(), TransportError> {
        *self.service_data_callback.lock() = None;
        Ok(())
    }
}

// ============================================================================
// MOCK CHARACTERISTIC
// ============================================================================

pub struct MockCharacteristic {
    pub url: Url,
    pub log: Arc<EventLog>,
    pub value: Mutex<Vec<u8>>,
    pub fail_operations: AtomicBool,
    pub dispose_count: AtomicU32,
    value_callback: Mutex<Option<Notification<Vec<u8>>>>,
}

impl MockCharacteristic {
    pub fn new(url: Url, log: Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            url,
            log,
            value: Mutex::new(Vec::new()),
            fail_operations: AtomicBool::new(false),
            dispose_count: AtomicU32::new(0),
            value_callback: Mutex::new(None),
        })
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.fail_operations.load(Ordering::SeqCst) {
            Err(TransportError::Backend(
                "injected characteristic failure".into(),
            ))
        } else {
            Ok(())
        }
    }

    pub fn push_value(&self, value: Vec<u8>) {
        if let Some(callback) = self.value_callback.lock().as_ref() {
            callback(value);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.value_callback.lock().is_some()
    }
}

impl BluetoothObject for MockCharacteristic {
    fn url(&self) -> Url {
        self.url.copy_with_protocol(PROTOCOL)
    }

    fn dispose(&self) -> Result<(), TransportError> {
        self.dispose_count.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("disposed:{}", self.url));
        Ok(())
    }
}

impl Characteristic for MockCharacteristic {
    fn read_value(&self) -> Result<Vec<u8>, TransportError> {
        self.check()?;
        Ok(self.value.lock().clone())
    }

    fn write_value(&self, value: &[u8]) -> Result<(), TransportError> {
        self.check()?;
        *self.value.lock() = value.to_vec();
        Ok(())
    }

    fn is_notifying(&self) -> Result<bool, TransportError> {
        self.check()?;
        Ok(self.is_subscribed())
    }

    fn enable_value_notifications(
        &self,
        callback: Notification<Vec<u8>>,
    ) -> Result<(), TransportError> {
        self.check()?;
        *self.value_callback.lock() = Some(callback);
        Ok(())
    }

    fn disable_value_notifications(&self) -> Result<(), TransportError> {
        *self.value_callback.lock() = None;
        Ok(())
    }
}

// ============================================================================
// MOCK FACTORY
// ============================================================================

/// In-memory transport backend; tests register mocks and flip visibility
pub struct MockFactory {
    pub log: Arc<EventLog>,
    pub adapters: Mutex<HashMap<Url, Arc<MockAdapter>>>,
    pub devices: Mutex<HashMap<Url, Arc<MockDevice>>>,
    pub characteristics: Mutex<HashMap<Url, Arc<MockCharacteristic>>>,
    /// when false, all acquisition getters return None
    pub visible: AtomicBool,
    pub enumerate_devices: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(EventLog::default()),
            adapters: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            characteristics: Mutex::new(HashMap::new()),
            visible: AtomicBool::new(true),
            enumerate_devices: AtomicBool::new(true),
        })
    }

    pub fn add_adapter(&self, url: &Url) -> Arc<MockAdapter> {
        let adapter = MockAdapter::new(url.clone(), Arc::clone(&self.log));
        self.adapters.lock().insert(url.clone(), Arc::clone(&adapter));
        adapter
    }

    pub fn add_device(&self, url: &Url) -> Arc<MockDevice> {
        let device = MockDevice::new(url.clone(), Arc::clone(&self.log));
        self.devices.lock().insert(url.clone(), Arc::clone(&device));
        device
    }

    pub fn add_characteristic(&self, url: &Url) -> Arc<MockCharacteristic> {
        let characteristic = MockCharacteristic::new(url.clone(), Arc::clone(&self.log));
        self.characteristics
            .lock()
            .insert(url.clone(), Arc::clone(&characteristic));
        characteristic
    }

    pub fn remove_device(&self, url: &Url) {
        self.devices.lock().remove(url);
    }

    pub fn remove_adapter(&self, url: &Url) {
        self.adapters.lock().remove(url);
    }
}

impl BluetoothObjectFactory for MockFactory {
    fn protocol_name(&self) -> &str {
        PROTOCOL
    }

    fn get_adapter(&self, url: &Url) -> Option<Arc<dyn Adapter>> {
        if !self.visible.load(Ordering::SeqCst) {
            return None;
        }
        let adapter = self.adapters.lock().get(&url.copy_without_protocol())?.clone();
        Some(adapter)
    }

    fn get_device(&self, url: &Url) -> Option<Arc<dyn Device>> {
        if !self.visible.load(Ordering::SeqCst) {
            return None;
        }
        let device = self.devices.lock().get(&url.copy_without_protocol())?.clone();
        Some(device)
    }

    fn get_characteristic(&self, url: &Url) -> Option<Arc<dyn Characteristic>> {
        if !self.visible.load(Ordering::SeqCst) {
            return None;
        }
        let characteristic = self
            .characteristics
            .lock()
            .get(&url.copy_without_protocol())?
            .clone();
        Some(characteristic)
    }

    fn discovered_adapters(&self) -> Vec<AdapterReport> {
        self.adapters
            .lock()
            .values()
            .map(|adapter| AdapterReport {
                url: adapter.url(),
                name: adapter.name.lock().clone(),
                alias: adapter.alias.lock().clone(),
            })
            .collect()
    }

    fn discovered_devices(&self) -> Option<Vec<DeviceReport>> {
        if !self.enumerate_devices.load(Ordering::SeqCst) {
            return None;
        }
        Some(
            self.devices
                .lock()
                .values()
                .map(|device| DeviceReport {
                    url: device.url(),
                    name: device.name.lock().clone(),
                    alias: device.alias.lock().clone(),
                    rssi: device.rssi.load(Ordering::SeqCst),
                    bluetooth_class: 0,
                })
                .collect(),
        )
    }
}
