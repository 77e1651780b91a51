//! Device governor
//!
//! On top of the common lifecycle this adds connection supervision driven by
//! a multi-controller bitmap, the RSSI smoothing/throttling pipeline,
//! distance estimation, and the online/offline watchdog.

use crate::bitmap::ConcurrentBitMap;
use crate::governor::{governor_common, Governed, GovernorCore};
use crate::manager::ManagerShared;
use crate::signal::{estimate_distance, FilterKind, SignalFilter};
use crate::transport::{Device, GattService, TransportError};
use crate::url::Url;
use crate::util::safe_for_each;
use crate::Error;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};
use tracing::trace;

const DEFAULT_ONLINE_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_RSSI_REPORTING_RATE: Duration = Duration::from_millis(1000);

/// Notified about BLE-level device events
pub trait BluetoothSmartDeviceListener: Send + Sync {
    fn connected(&self) {}
    fn disconnected(&self) {}
    fn services_resolved(&self, _services: &[GattService]) {}
    fn services_unresolved(&self) {}
    fn characteristic_changed(&self, _url: &Url, _value: &[u8]) {}
}

/// Notified about generic device events
pub trait GenericBluetoothDeviceListener: Send + Sync {
    fn online(&self) {}
    fn offline(&self) {}
    fn rssi_changed(&self, _rssi: i16) {}
    fn blocked(&self, _blocked: bool) {}
    fn manufacturer_data_changed(&self, _data: &HashMap<u16, Vec<u8>>) {}
    fn service_data_changed(&self, _data: &HashMap<Url, Vec<u8>>) {}
}

/// Supervises one native device handle
pub struct DeviceGovernor {
    core: GovernorCore<dyn Device>,
    me: Weak<DeviceGovernor>,
    // one bit per controller; the device connects while any bit is set
    connection_control: ConcurrentBitMap,
    blocked_control: AtomicBool,
    online: AtomicBool,
    online_timeout: RwLock<Duration>,
    measured_tx_power: AtomicI16,
    advertised_tx_power: AtomicI16,
    propagation_exponent: RwLock<f64>,
    rssi_filtering: AtomicBool,
    rssi_filter: Mutex<Box<dyn SignalFilter>>,
    rssi_reporting_rate_ms: AtomicU64,
    rssi: AtomicI16,
    last_advertised: Mutex<Option<SystemTime>>,
    last_rssi_notified: Mutex<Option<Instant>>,
    manufacturer_data: Mutex<HashMap<u16, Vec<u8>>>,
    service_data: Mutex<HashMap<Url, Vec<u8>>>,
    smart_listeners: RwLock<Vec<Arc<dyn BluetoothSmartDeviceListener>>>,
    generic_listeners: RwLock<Vec<Arc<dyn GenericBluetoothDeviceListener>>>,
}

impl DeviceGovernor {
    pub(crate) fn new(url: Url, manager: Weak<ManagerShared>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: GovernorCore::new(url, manager),
            me: me.clone(),
            connection_control: ConcurrentBitMap::new(),
            blocked_control: AtomicBool::new(false),
            online: AtomicBool::new(false),
            online_timeout: RwLock::new(DEFAULT_ONLINE_TIMEOUT),
            measured_tx_power: AtomicI16::new(0),
            advertised_tx_power: AtomicI16::new(0),
            propagation_exponent: RwLock::new(2.0),
            rssi_filtering: AtomicBool::new(true),
            rssi_filter: Mutex::new(FilterKind::Kalman.create()),
            rssi_reporting_rate_ms: AtomicU64::new(
                DEFAULT_RSSI_REPORTING_RATE.as_millis() as u64
            ),
            rssi: AtomicI16::new(0),
            last_advertised: Mutex::new(None),
            last_rssi_notified: Mutex::new(None),
            manufacturer_data: Mutex::new(HashMap::new()),
            service_data: Mutex::new(HashMap::new()),
            smart_listeners: RwLock::new(Vec::new()),
            generic_listeners: RwLock::new(Vec::new()),
        })
    }

    governor_common!();

    // ------------------------------------------------------------------
    // connection control
    // ------------------------------------------------------------------

    /// Request (or withdraw) a connection on behalf of controller `slot`
    /// (0..=63). The device stays connected while any slot requests it.
    /// A change of the aggregate schedules a prompt update.
    pub fn set_connection_control(&self, slot: u32, requested: bool) -> Result<(), Error> {
        let mut flipped = false;
        self.connection_control
            .cumulative_set_with(slot, requested, || flipped = true, || {})?;
        if flipped {
            if let Some(manager) = self.core.manager() {
                manager.schedule_update(self.core.url());
            }
        }
        Ok(())
    }

    /// The aggregate connection request across all controllers
    pub fn get_connection_control(&self) -> bool {
        self.connection_control.any()
    }

    pub fn is_connected(&self) -> Result<bool, Error> {
        self.do_interact("isConnected", |handle| handle.is_connected())
    }

    pub fn set_blocked_control(&self, blocked: bool) {
        self.blocked_control.store(blocked, Ordering::SeqCst);
    }

    pub fn get_blocked_control(&self) -> bool {
        self.blocked_control.load(Ordering::SeqCst)
    }

    pub fn is_blocked(&self) -> Result<bool, Error> {
        self.do_interact("isBlocked", |handle| handle.is_blocked())
    }

    // ------------------------------------------------------------------
    // identity
    // ------------------------------------------------------------------

    pub fn get_name(&self) -> Result<String, Error> {
        self.do_interact("getName", |handle| handle.get_name())
    }

    pub fn get_alias(&self) -> Result<String, Error> {
        self.do_interact("getAlias", |handle| handle.get_alias())
    }

    pub fn set_alias(&self, alias: &str) -> Result<(), Error> {
        self.do_interact("setAlias", |handle| handle.set_alias(alias))
    }

    /// Alias when set, otherwise name, otherwise the device address
    pub fn get_display_name(&self) -> Result<String, Error> {
        self.do_interact("getDisplayName", |handle| {
            let alias = handle.get_alias()?;
            if !alias.is_empty() {
                return Ok(alias);
            }
            let name = handle.get_name()?;
            if !name.is_empty() {
                return Ok(name);
            }
            Ok(handle
                .url()
                .device_address()
                .unwrap_or_default()
                .to_string())
        })
    }

    pub fn get_bluetooth_class(&self) -> Result<u32, Error> {
        self.do_interact("getBluetoothClass", |handle| handle.get_bluetooth_class())
    }

    pub fn is_ble_enabled(&self) -> Result<bool, Error> {
        self.do_interact("isBleEnabled", |handle| handle.is_ble_enabled())
    }

    // ------------------------------------------------------------------
    // online watchdog
    // ------------------------------------------------------------------

    /// A device is online when it has shown activity within the online
    /// timeout
    pub fn is_online(&self) -> bool {
        match self.last_activity() {
            Some(at) => match at.elapsed() {
                Ok(elapsed) => elapsed <= *self.online_timeout.read(),
                Err(_) => true,
            },
            None => false,
        }
    }

    pub fn get_online_timeout(&self) -> Duration {
        *self.online_timeout.read()
    }

    pub fn set_online_timeout(&self, timeout: Duration) {
        *self.online_timeout.write() = timeout;
    }

    // ------------------------------------------------------------------
    // RSSI pipeline
    // ------------------------------------------------------------------

    /// The last reported (smoothed when filtering is enabled) RSSI,
    /// 0 before the first advertisement
    pub fn get_rssi(&self) -> i16 {
        self.rssi.load(Ordering::SeqCst)
    }

    /// When the device last advertised
    pub fn get_last_advertised(&self) -> Option<SystemTime> {
        *self.last_advertised.lock()
    }

    /// Replace the filter with a fresh instance of the given kind,
    /// discarding prior filter state
    pub fn set_rssi_filter(&self, kind: FilterKind) {
        *self.rssi_filter.lock() = kind.create();
    }

    /// Replace the filter with a caller-supplied implementation
    pub fn set_custom_rssi_filter(&self, filter: Box<dyn SignalFilter>) {
        *self.rssi_filter.lock() = filter;
    }

    pub fn is_rssi_filtering_enabled(&self) -> bool {
        self.rssi_filtering.load(Ordering::SeqCst)
    }

    pub fn set_rssi_filtering_enabled(&self, enabled: bool) {
        self.rssi_filtering.store(enabled, Ordering::SeqCst);
    }

    /// Minimum interval between reported RSSI events; zero reports
    /// unconditionally
    pub fn get_rssi_reporting_rate(&self) -> Duration {
        Duration::from_millis(self.rssi_reporting_rate_ms.load(Ordering::SeqCst))
    }

    pub fn set_rssi_reporting_rate(&self, rate: Duration) {
        self.rssi_reporting_rate_ms
            .store(rate.as_millis() as u64, Ordering::SeqCst);
    }

    /// Feed one raw advertisement sample through the pipeline.
    ///
    /// The filter state advances on every sample; listeners only hear about
    /// it when the reporting rate allows.
    pub(crate) fn on_rssi(&self, raw: i16) {
        *self.last_advertised.lock() = Some(SystemTime::now());
        self.core().mark_activity();
        let reported = if self.rssi_filtering.load(Ordering::SeqCst) {
            self.rssi_filter.lock().next(raw)
        } else {
            raw
        };
        self.rssi.store(reported, Ordering::SeqCst);

        let rate = self.get_rssi_reporting_rate();
        let emit = {
            let mut notified = self.last_rssi_notified.lock();
            let due = rate.is_zero()
                || notified.map_or(true, |at| at.elapsed() >= rate);
            if due {
                *notified = Some(Instant::now());
            }
            due
        };
        if emit {
            let snapshot = self.generic_listeners.read().clone();
            safe_for_each(&snapshot, "rssi changed", |listener| {
                listener.rssi_changed(reported)
            });
        }
    }

    // ------------------------------------------------------------------
    // distance / location
    // ------------------------------------------------------------------

    /// Advertised TX power as last seen on the handle, 0 when unknown
    pub fn get_tx_power(&self) -> i16 {
        self.advertised_tx_power.load(Ordering::SeqCst)
    }

    pub fn get_measured_tx_power(&self) -> i16 {
        self.measured_tx_power.load(Ordering::SeqCst)
    }

    /// RSSI measured one meter away, used in preference to the advertised
    /// TX power for distance estimation
    pub fn set_measured_tx_power(&self, tx_power: i16) {
        self.measured_tx_power.store(tx_power, Ordering::SeqCst);
    }

    pub fn get_signal_propagation_exponent(&self) -> f64 {
        *self.propagation_exponent.read()
    }

    /// Environment factor for distance estimation, typically 2.0 (open air)
    /// to 4.0 (indoors)
    pub fn set_signal_propagation_exponent(&self, exponent: f64) {
        *self.propagation_exponent.write() = exponent;
    }

    /// Estimated distance to the adapter in meters, 0.0 when no TX power is
    /// available
    pub fn get_estimated_distance(&self) -> f64 {
        let tx_power = match self.get_measured_tx_power() {
            0 => self.get_tx_power(),
            measured => measured,
        };
        estimate_distance(tx_power, self.get_rssi(), self.get_signal_propagation_exponent())
    }

    /// URL of the closest adapter that sees this device.
    ///
    /// When the same device address is governed through several adapters the
    /// shortest estimated distance wins; ties break on the smallest adapter
    /// address.
    pub fn get_location(&self) -> Url {
        let own = self.core.url().adapter_url().copy_without_protocol();
        let Some(manager) = self.core.manager() else {
            return own;
        };
        let Some(device_address) = self.core.url().device_address() else {
            return own;
        };
        let mut best: Option<(f64, String)> = None;
        for sibling in manager.device_governors() {
            if sibling.url().device_address() != Some(device_address) {
                continue;
            }
            let Some(adapter) = sibling.url().adapter_address() else {
                continue;
            };
            let distance = sibling.get_estimated_distance();
            let candidate = (distance, adapter.to_string());
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    if candidate.0 < current.0
                        || (candidate.0 == current.0 && candidate.1 < current.1)
                    {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        match best {
            Some((_, adapter)) => Url::adapter(adapter),
            None => own,
        }
    }

    // ------------------------------------------------------------------
    // services / advertisement data
    // ------------------------------------------------------------------

    pub fn is_services_resolved(&self) -> Result<bool, Error> {
        self.do_interact("isServicesResolved", |handle| handle.is_services_resolved())
    }

    pub fn get_resolved_services(&self) -> Result<Vec<GattService>, Error> {
        self.do_interact("getServices", |handle| handle.get_services())
    }

    /// Characteristic URLs across all resolved services
    pub fn get_characteristics(&self) -> Result<Vec<Url>, Error> {
        let services = self.get_resolved_services()?;
        Ok(services
            .into_iter()
            .flat_map(|service| service.characteristics)
            .collect())
    }

    /// Snapshot of the advertised manufacturer data
    pub fn get_manufacturer_data(&self) -> HashMap<u16, Vec<u8>> {
        self.manufacturer_data.lock().clone()
    }

    /// Snapshot of the advertised service data
    pub fn get_service_data(&self) -> HashMap<Url, Vec<u8>> {
        self.service_data.lock().clone()
    }

    // ------------------------------------------------------------------
    // listeners
    // ------------------------------------------------------------------

    pub fn add_smart_device_listener(&self, listener: Arc<dyn BluetoothSmartDeviceListener>) {
        self.smart_listeners.write().push(listener);
    }

    pub fn remove_smart_device_listener(&self, listener: &Arc<dyn BluetoothSmartDeviceListener>) {
        self.smart_listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub fn add_generic_device_listener(&self, listener: Arc<dyn GenericBluetoothDeviceListener>) {
        self.generic_listeners.write().push(listener);
    }

    pub fn remove_generic_device_listener(
        &self,
        listener: &Arc<dyn GenericBluetoothDeviceListener>,
    ) {
        self.generic_listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Relay a characteristic value change up to the smart listeners
    pub(crate) fn characteristic_changed(&self, url: &Url, value: &[u8]) {
        let snapshot = self.smart_listeners.read().clone();
        safe_for_each(&snapshot, "characteristic changed", |listener| {
            listener.characteristic_changed(url, value)
        });
    }

    fn notify_connected(&self, connected: bool) {
        let snapshot = self.smart_listeners.read().clone();
        safe_for_each(&snapshot, "connected", |listener| {
            if connected {
                listener.connected()
            } else {
                listener.disconnected()
            }
        });
    }

    fn notify_blocked(&self, blocked: bool) {
        let snapshot = self.generic_listeners.read().clone();
        safe_for_each(&snapshot, "blocked", |listener| listener.blocked(blocked));
    }

    fn notify_services_resolved(&self, resolved: bool) {
        if resolved {
            let Some(handle) = self.core.handle() else {
                return;
            };
            match handle.get_services() {
                Ok(services) => {
                    let snapshot = self.smart_listeners.read().clone();
                    safe_for_each(&snapshot, "services resolved", |listener| {
                        listener.services_resolved(&services)
                    });
                }
                Err(err) => trace!("Could not read resolved services: {}", err),
            }
        } else {
            let snapshot = self.smart_listeners.read().clone();
            safe_for_each(&snapshot, "services unresolved", |listener| {
                listener.services_unresolved()
            });
        }
    }

    fn on_manufacturer_data(&self, data: HashMap<u16, Vec<u8>>) {
        *self.manufacturer_data.lock() = data.clone();
        self.core.mark_activity();
        let snapshot = self.generic_listeners.read().clone();
        safe_for_each(&snapshot, "manufacturer data", |listener| {
            listener.manufacturer_data_changed(&data)
        });
    }

    fn on_service_data(&self, data: HashMap<Url, Vec<u8>>) {
        *self.service_data.lock() = data.clone();
        self.core.mark_activity();
        let snapshot = self.generic_listeners.read().clone();
        safe_for_each(&snapshot, "service data", |listener| {
            listener.service_data_changed(&data)
        });
    }

    fn update_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) != online {
            let snapshot = self.generic_listeners.read().clone();
            safe_for_each(&snapshot, "online", |listener| {
                if online {
                    listener.online()
                } else {
                    listener.offline()
                }
            });
        }
    }
}

impl Governed for DeviceGovernor {
    type Handle = dyn Device;

    fn core(&self) -> &GovernorCore<dyn Device> {
        &self.core
    }

    fn acquire_handle(&self, url: &Url) -> Option<Arc<dyn Device>> {
        self.core.manager()?.factory().get_device(url)
    }

    fn init_handle(&self, handle: &Arc<dyn Device>) -> Result<(), TransportError> {
        let me = self.me.clone();
        handle.enable_rssi_notifications(Box::new(move |rssi| {
            if let Some(governor) = me.upgrade() {
                governor.on_rssi(rssi);
            }
        }))?;
        let me = self.me.clone();
        handle.enable_connected_notifications(Box::new(move |connected| {
            if let Some(governor) = me.upgrade() {
                governor.notify_connected(connected);
            }
        }))?;
        let me = self.me.clone();
        handle.enable_blocked_notifications(Box::new(move |blocked| {
            if let Some(governor) = me.upgrade() {
                governor.notify_blocked(blocked);
            }
        }))?;
        let me = self.me.clone();
        handle.enable_services_resolved_notifications(Box::new(move |resolved| {
            if let Some(governor) = me.upgrade() {
                governor.notify_services_resolved(resolved);
            }
        }))?;
        let me = self.me.clone();
        handle.enable_manufacturer_data_notifications(Box::new(move |data| {
            if let Some(governor) = me.upgrade() {
                governor.on_manufacturer_data(data);
            }
        }))?;
        let me = self.me.clone();
        handle.enable_service_data_notifications(Box::new(move |data| {
            if let Some(governor) = me.upgrade() {
                governor.on_service_data(data);
            }
        }))?;
        self.advertised_tx_power
            .store(handle.get_tx_power().unwrap_or(0), Ordering::SeqCst);
        Ok(())
    }

    fn update_handle(&self, handle: &Arc<dyn Device>) -> Result<(), TransportError> {
        let blocked_requested = self.blocked_control.load(Ordering::SeqCst);
        if handle.is_blocked()? != blocked_requested {
            handle.set_blocked(blocked_requested)?;
        }
        // a blocked device cannot be connected to
        if !blocked_requested {
            let requested = self.connection_control.any();
            let connected = handle.is_connected()?;
            if requested && !connected {
                handle.connect()?;
            } else if !requested && connected {
                handle.disconnect()?;
            }
        }
        self.update_online(self.is_online());
        Ok(())
    }

    fn reset_handle(&self, handle: &Arc<dyn Device>) -> Result<(), TransportError> {
        let teardown: [(&str, Result<(), TransportError>); 6] = [
            ("rssi", handle.disable_rssi_notifications()),
            ("connected", handle.disable_connected_notifications()),
            ("blocked", handle.disable_blocked_notifications()),
            (
                "services resolved",
                handle.disable_services_resolved_notifications(),
            ),
            (
                "manufacturer data",
                handle.disable_manufacturer_data_notifications(),
            ),
            ("service data", handle.disable_service_data_notifications()),
        ];
        for (what, result) in teardown {
            if let Err(err) = result {
                trace!("Could not unsubscribe from {} notifications: {}", what, err);
            }
        }
        self.update_online(false);
        Ok(())
    }
}
