//! Manager: governor registry, refresh scheduling and discovery
//!
//! The manager owns every governor and the two schedulers that drive them: a
//! single-worker scheduler running the periodic discovery pass and a small
//! pool refreshing each governor at a fixed rate. Governors keep a non-owning
//! reference back to the manager for cascades and prompt reschedules, so the
//! manager must outlive them; `dispose()` tears the governors down first.

use crate::discovery::{
    AdapterDiscoveryListener, DeviceDiscoveryListener, DiscoveredAdapter, DiscoveredDevice,
};
use crate::governor::{AdapterGovernor, CharacteristicGovernor, DeviceGovernor};
use crate::scheduler::{TaskHandle, TaskScheduler};
use crate::transport::BluetoothObjectFactory;
use crate::url::Url;
use crate::util::safe_for_each;
use crate::Error;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const REFRESH_PERIOD: Duration = Duration::from_secs(5);
const REFRESH_WORKERS: usize = 5;
const MIN_DISCOVERY_RATE: Duration = Duration::from_secs(1);

/// Tunables of the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Period of the discovery job
    pub discovery_rate: Duration,
    /// Whether a freshly observed adapter gets a governor (whose default
    /// discovering control is on)
    pub start_discovering: bool,
    /// Whether `discovered` is re-emitted for entities already known
    pub rediscover: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            discovery_rate: Duration::from_secs(10),
            start_discovering: false,
            rediscover: false,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the discovery period; values below one second are clamped up,
    /// a zero rate would spin the discovery worker
    pub fn with_discovery_rate(mut self, rate: Duration) -> Self {
        self.discovery_rate = rate.max(MIN_DISCOVERY_RATE);
        self
    }

    pub fn with_start_discovering(mut self, start_discovering: bool) -> Self {
        self.start_discovering = start_discovering;
        self
    }

    pub fn with_rediscover(mut self, rediscover: bool) -> Self {
        self.rediscover = rediscover;
        self
    }
}

/// Notified about governor lifecycle transitions across the whole registry
pub trait ManagerListener: Send + Sync {
    fn governor_ready(&self, _url: &Url, _ready: bool) {}
}

/// A governor of any kind, as stored in the registry
#[derive(Clone)]
pub enum AnyGovernor {
    Adapter(Arc<AdapterGovernor>),
    Device(Arc<DeviceGovernor>),
    Characteristic(Arc<CharacteristicGovernor>),
}

impl AnyGovernor {
    pub fn url(&self) -> &Url {
        match self {
            AnyGovernor::Adapter(governor) => governor.url(),
            AnyGovernor::Device(governor) => governor.url(),
            AnyGovernor::Characteristic(governor) => governor.url(),
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            AnyGovernor::Adapter(governor) => governor.is_ready(),
            AnyGovernor::Device(governor) => governor.is_ready(),
            AnyGovernor::Characteristic(governor) => governor.is_ready(),
        }
    }

    pub fn update(&self) {
        match self {
            AnyGovernor::Adapter(governor) => governor.update(),
            AnyGovernor::Device(governor) => governor.update(),
            AnyGovernor::Characteristic(governor) => governor.update(),
        }
    }

    pub fn reset(&self) {
        match self {
            AnyGovernor::Adapter(governor) => governor.reset(),
            AnyGovernor::Device(governor) => governor.reset(),
            AnyGovernor::Characteristic(governor) => governor.reset(),
        }
    }

    pub fn dispose(&self) {
        match self {
            AnyGovernor::Adapter(governor) => governor.dispose(),
            AnyGovernor::Device(governor) => governor.dispose(),
            AnyGovernor::Characteristic(governor) => governor.dispose(),
        }
    }
}

/// Manager internals shared with the governors
pub(crate) struct ManagerShared {
    me: Weak<ManagerShared>,
    factory: Arc<dyn BluetoothObjectFactory>,
    config: ManagerConfig,
    governors: Mutex<HashMap<Url, AnyGovernor>>,
    refresh_tasks: Mutex<HashMap<Url, TaskHandle>>,
    discovery_task: Mutex<Option<TaskHandle>>,
    discovery_scheduler: TaskScheduler,
    refresh_scheduler: TaskScheduler,
    adapter_listeners: RwLock<Vec<Arc<dyn AdapterDiscoveryListener>>>,
    device_listeners: RwLock<Vec<Arc<dyn DeviceDiscoveryListener>>>,
    manager_listeners: RwLock<Vec<Arc<dyn ManagerListener>>>,
    discovered_adapters: Mutex<HashSet<DiscoveredAdapter>>,
    discovered_devices: Mutex<HashSet<DiscoveredDevice>>,
    disposed: AtomicBool,
}

impl ManagerShared {
    pub(crate) fn factory(&self) -> &Arc<dyn BluetoothObjectFactory> {
        &self.factory
    }

    /// Reset every governor whose URL strictly descends from `parent`
    pub(crate) fn reset_descendants(&self, parent: &Url) {
        for governor in self.descendants(parent) {
            governor.reset();
        }
    }

    /// Update every governor whose URL strictly descends from `parent`
    pub(crate) fn update_descendants(&self, parent: &Url) {
        for governor in self.descendants(parent) {
            governor.update();
        }
    }

    // collected under the registry lock, acted on outside it: governor
    // lifecycle calls take their own locks and must not nest inside ours
    fn descendants(&self, parent: &Url) -> Vec<AnyGovernor> {
        self.governors
            .lock()
            .values()
            .filter(|governor| governor.url().is_descendant(parent))
            .cloned()
            .collect()
    }

    /// Fan a governor's ready transition out to the manager listeners
    pub(crate) fn governor_ready(&self, url: &Url, ready: bool) {
        let snapshot = self.manager_listeners.read().clone();
        safe_for_each(&snapshot, "governor ready", |listener| {
            listener.governor_ready(url, ready)
        });
    }

    /// Run one prompt update of an existing governor on the refresh pool
    pub(crate) fn schedule_update(&self, url: &Url) {
        let me = self.me.clone();
        let url = url.clone();
        self.refresh_scheduler.execute(move || {
            if let Some(manager) = me.upgrade() {
                if let Some(governor) = manager.lookup(&url) {
                    governor.update();
                }
            }
        });
    }

    /// Relay a characteristic value event to its device governor
    pub(crate) fn characteristic_value_changed(&self, url: &Url, value: &[u8]) {
        if let Some(AnyGovernor::Device(device)) = self.lookup(&url.device_url()) {
            device.characteristic_changed(url, value);
        }
    }

    /// Device governors currently registered
    pub(crate) fn device_governors(&self) -> Vec<Arc<DeviceGovernor>> {
        self.governors
            .lock()
            .values()
            .filter_map(|governor| match governor {
                AnyGovernor::Device(device) => Some(Arc::clone(device)),
                _ => None,
            })
            .collect()
    }

    fn lookup(&self, url: &Url) -> Option<AnyGovernor> {
        self.governors.lock().get(url).cloned()
    }

    fn get_governor(&self, url: &Url) -> AnyGovernor {
        let key = url.copy_without_protocol();
        let created = {
            let mut governors = self.governors.lock();
            if let Some(existing) = governors.get(&key) {
                return existing.clone();
            }
            let governor = self.create_governor(&key);
            governors.insert(key.clone(), governor.clone());
            governor
        };
        // the initial update and the refresh enrollment run outside the
        // registry lock: update() can cascade back into the registry
        created.update();
        let me = self.me.clone();
        let refresh_url = key.clone();
        let handle = self.refresh_scheduler.schedule_at_fixed_rate(
            REFRESH_PERIOD,
            REFRESH_PERIOD,
            move || {
                if let Some(manager) = me.upgrade() {
                    if let Some(governor) = manager.lookup(&refresh_url) {
                        governor.update();
                    }
                }
            },
        );
        self.refresh_tasks.lock().insert(key, handle);
        created
    }

    fn create_governor(&self, url: &Url) -> AnyGovernor {
        if url.is_characteristic() {
            AnyGovernor::Characteristic(CharacteristicGovernor::new(url.clone(), self.me.clone()))
        } else if url.is_device() {
            AnyGovernor::Device(DeviceGovernor::new(url.clone(), self.me.clone()))
        } else {
            AnyGovernor::Adapter(AdapterGovernor::new(url.clone(), self.me.clone()))
        }
    }

    fn dispose_governor(&self, url: &Url) {
        let key = url.copy_without_protocol();
        let governor = self.governors.lock().remove(&key);
        if let Some(handle) = self.refresh_tasks.lock().remove(&key) {
            handle.cancel();
        }
        if let Some(governor) = governor {
            governor.dispose();
        }
    }

    // ------------------------------------------------------------------
    // discovery job
    // ------------------------------------------------------------------

    fn run_discovery(&self) {
        self.discover_adapters();
        self.discover_devices();
    }

    fn discover_adapters(&self) {
        let mut known = self.discovered_adapters.lock();
        let mut fresh = HashSet::new();
        for report in self.factory.discovered_adapters() {
            let adapter = DiscoveredAdapter::from_report(&report);
            self.notify_adapter_discovered(&adapter, &known);
            if self.config.start_discovering {
                // its default discovering control kicks off discovery on the
                // governor's first update
                self.get_governor(&adapter.url);
            }
            fresh.insert(adapter);
        }
        for lost in known.difference(&fresh) {
            self.handle_adapter_lost(&lost.url);
        }
        *known = fresh;
    }

    fn discover_devices(&self) {
        let mut known = self.discovered_devices.lock();
        let Some(reports) = self.factory.discovered_devices() else {
            return;
        };
        let mut fresh = HashSet::new();
        for report in reports {
            // zero RSSI marks a transient record the backend has not fully
            // populated yet
            if report.rssi == 0 {
                continue;
            }
            let device = DiscoveredDevice::from_report(&report);
            self.notify_device_discovered(&device, &known);
            fresh.insert(device);
        }
        for lost in known.difference(&fresh) {
            self.handle_device_lost(&lost.url);
        }
        *known = fresh;
    }

    fn notify_adapter_discovered(
        &self,
        adapter: &DiscoveredAdapter,
        known: &HashSet<DiscoveredAdapter>,
    ) {
        if known.contains(adapter) && !self.config.rediscover {
            return;
        }
        let snapshot = self.adapter_listeners.read().clone();
        safe_for_each(&snapshot, "adapter discovered", |listener| {
            listener.discovered(adapter)
        });
    }

    fn notify_device_discovered(
        &self,
        device: &DiscoveredDevice,
        known: &HashSet<DiscoveredDevice>,
    ) {
        if known.contains(device) && !self.config.rediscover {
            return;
        }
        let snapshot = self.device_listeners.read().clone();
        safe_for_each(&snapshot, "device discovered", |listener| {
            listener.discovered(device)
        });
    }

    fn handle_adapter_lost(&self, url: &Url) {
        info!("Adapter has been lost: {}", url);
        let snapshot = self.adapter_listeners.read().clone();
        safe_for_each(&snapshot, "adapter lost", |listener| listener.lost(url));
        if let Some(governor) = self.lookup(url) {
            governor.reset();
        }
    }

    fn handle_device_lost(&self, url: &Url) {
        info!("Device has been lost: {}", url);
        let snapshot = self.device_listeners.read().clone();
        safe_for_each(&snapshot, "device lost", |listener| listener.lost(url));
        if let Some(governor) = self.lookup(url) {
            governor.reset();
        }
    }
}

/// Entry point: owns the governor registry and drives discovery and
/// refreshes.
///
/// Constructed with an explicit transport factory; there is no process-wide
/// default.
pub struct BluetoothManager {
    shared: Arc<ManagerShared>,
}

impl BluetoothManager {
    /// Build a manager over the given transport backend. Fails if the
    /// discovery or refresh worker threads cannot be spawned.
    pub fn new(
        factory: Arc<dyn BluetoothObjectFactory>,
        config: ManagerConfig,
    ) -> Result<Self, Error> {
        let discovery_scheduler = TaskScheduler::new("bt-discovery", 1)
            .map_err(|err| Error::Internal(err.to_string()))?;
        let refresh_scheduler = TaskScheduler::new("bt-refresh", REFRESH_WORKERS)
            .map_err(|err| Error::Internal(err.to_string()))?;
        let shared = Arc::new_cyclic(|me| ManagerShared {
            me: me.clone(),
            factory,
            config,
            governors: Mutex::new(HashMap::new()),
            refresh_tasks: Mutex::new(HashMap::new()),
            discovery_task: Mutex::new(None),
            discovery_scheduler,
            refresh_scheduler,
            adapter_listeners: RwLock::new(Vec::new()),
            device_listeners: RwLock::new(Vec::new()),
            manager_listeners: RwLock::new(Vec::new()),
            discovered_adapters: Mutex::new(HashSet::new()),
            discovered_devices: Mutex::new(HashSet::new()),
            disposed: AtomicBool::new(false),
        });
        Ok(Self { shared })
    }

    /// Begin the periodic discovery job, immediately and then at the
    /// configured rate. Idempotent: a second call while the job is scheduled
    /// does nothing.
    pub fn start(&self) {
        let mut task = self.shared.discovery_task.lock();
        if task.is_some() {
            return;
        }
        let me = self.shared.me.clone();
        *task = Some(self.shared.discovery_scheduler.schedule_at_fixed_rate(
            Duration::ZERO,
            self.shared.config.discovery_rate,
            move || {
                if let Some(manager) = me.upgrade() {
                    manager.run_discovery();
                }
            },
        ));
        debug!("Discovery job scheduled");
    }

    /// Cancel the periodic discovery job
    pub fn stop(&self) {
        if let Some(handle) = self.shared.discovery_task.lock().take() {
            handle.cancel();
        }
    }

    /// The governor for `url`, created and enrolled for refresh on first
    /// lookup
    pub fn get_governor(&self, url: &Url) -> AnyGovernor {
        self.shared.get_governor(url)
    }

    /// The adapter governor for the adapter portion of `url`
    pub fn get_adapter_governor(&self, url: &Url) -> Arc<AdapterGovernor> {
        match self.shared.get_governor(&url.adapter_url()) {
            AnyGovernor::Adapter(governor) => governor,
            _ => unreachable!("adapter URL resolved to a non-adapter governor"),
        }
    }

    /// The device governor for the device portion of `url`
    pub fn get_device_governor(&self, url: &Url) -> Arc<DeviceGovernor> {
        match self.shared.get_governor(&url.device_url()) {
            AnyGovernor::Device(governor) => governor,
            _ => unreachable!("device URL resolved to a non-device governor"),
        }
    }

    /// The characteristic governor for `url`
    pub fn get_characteristic_governor(&self, url: &Url) -> Arc<CharacteristicGovernor> {
        match self.shared.get_governor(&url.characteristic_url()) {
            AnyGovernor::Characteristic(governor) => governor,
            _ => unreachable!("characteristic URL resolved to a non-characteristic governor"),
        }
    }

    /// Governors for a batch of URLs
    pub fn governors_for(&self, urls: &[Url]) -> Vec<AnyGovernor> {
        urls.iter().map(|url| self.shared.get_governor(url)).collect()
    }

    /// Cancel the refresh task and dispose the governor for `url`
    pub fn dispose_governor(&self, url: &Url) {
        self.shared.dispose_governor(url);
    }

    /// Reset every governor below `parent` (descendants only)
    pub fn reset_descendants(&self, parent: &Url) {
        self.shared.reset_descendants(parent);
    }

    /// Update every governor below `parent` (descendants only)
    pub fn update_descendants(&self, parent: &Url) {
        self.shared.update_descendants(parent);
    }

    /// Adapters seen by the latest discovery pass
    pub fn discovered_adapters(&self) -> Vec<DiscoveredAdapter> {
        self.shared
            .discovered_adapters
            .lock()
            .iter()
            .cloned()
            .collect()
    }

    /// Devices seen by the latest discovery pass
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.shared
            .discovered_devices
            .lock()
            .iter()
            .cloned()
            .collect()
    }

    pub fn add_adapter_discovery_listener(&self, listener: Arc<dyn AdapterDiscoveryListener>) {
        self.shared.adapter_listeners.write().push(listener);
    }

    pub fn remove_adapter_discovery_listener(&self, listener: &Arc<dyn AdapterDiscoveryListener>) {
        self.shared
            .adapter_listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub fn add_device_discovery_listener(&self, listener: Arc<dyn DeviceDiscoveryListener>) {
        self.shared.device_listeners.write().push(listener);
    }

    pub fn remove_device_discovery_listener(&self, listener: &Arc<dyn DeviceDiscoveryListener>) {
        self.shared
            .device_listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub fn add_manager_listener(&self, listener: Arc<dyn ManagerListener>) {
        self.shared.manager_listeners.write().push(listener);
    }

    pub fn remove_manager_listener(&self, listener: &Arc<dyn ManagerListener>) {
        self.shared
            .manager_listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Tear everything down: discovery, refresh tasks, governors, workers.
    /// Idempotent; never fails.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disposing Bluetooth manager");
        self.stop();
        for handle in self.shared.refresh_tasks.lock().values() {
            handle.cancel();
        }
        self.shared.adapter_listeners.write().clear();
        self.shared.device_listeners.write().clear();
        self.shared.manager_listeners.write().clear();

        // dispose with entries still registered so cascades keep resolving,
        // then drop the registry
        let governors: Vec<AnyGovernor> =
            self.shared.governors.lock().values().cloned().collect();
        for governor in governors {
            let url = governor.url().clone();
            if catch_unwind(AssertUnwindSafe(|| governor.dispose())).is_err() {
                error!("Could not dispose governor: {}", url);
            }
        }
        self.shared.governors.lock().clear();
        self.shared.refresh_tasks.lock().clear();

        self.shared.discovery_scheduler.shutdown();
        self.shared.refresh_scheduler.shutdown();
        info!("Bluetooth manager has been disposed");
    }
}

impl Drop for BluetoothManager {
    fn drop(&mut self) {
        if !self.shared.disposed.load(Ordering::SeqCst) {
            warn!("Bluetooth manager dropped without dispose; disposing now");
            self.dispose();
        }
    }
}
