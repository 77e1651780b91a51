//! Adapter governor
//!
//! Reconciles requested power/discovery/alias state against a native
//! adapter handle and converts the handle's signals into listener events.

use crate::governor::{governor_common, Governed, GovernorCore};
use crate::manager::ManagerShared;
use crate::transport::{Adapter, TransportError};
use crate::url::Url;
use crate::util::safe_for_each;
use crate::Error;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Notified about adapter signal changes
pub trait AdapterListener: Send + Sync {
    fn powered(&self, _powered: bool) {}
    fn discovering(&self, _discovering: bool) {}
}

/// Supervises one native adapter handle
pub struct AdapterGovernor {
    core: GovernorCore<dyn Adapter>,
    me: Weak<AdapterGovernor>,
    powered_control: AtomicBool,
    discovering_control: AtomicBool,
    alias_control: Mutex<Option<String>>,
    // discovery started by this governor, to be stopped on teardown
    started_discovery: AtomicBool,
    adapter_listeners: RwLock<Vec<Arc<dyn AdapterListener>>>,
}

impl AdapterGovernor {
    pub(crate) fn new(url: Url, manager: Weak<ManagerShared>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: GovernorCore::new(url, manager),
            me: me.clone(),
            powered_control: AtomicBool::new(true),
            discovering_control: AtomicBool::new(true),
            alias_control: Mutex::new(None),
            started_discovery: AtomicBool::new(false),
            adapter_listeners: RwLock::new(Vec::new()),
        })
    }

    governor_common!();

    /// Whether this governor keeps the adapter powered
    pub fn get_powered_control(&self) -> bool {
        self.powered_control.load(Ordering::SeqCst)
    }

    pub fn set_powered_control(&self, powered: bool) {
        self.powered_control.store(powered, Ordering::SeqCst);
    }

    /// Whether this governor keeps the adapter discovering
    pub fn get_discovering_control(&self) -> bool {
        self.discovering_control.load(Ordering::SeqCst)
    }

    pub fn set_discovering_control(&self, discovering: bool) {
        self.discovering_control.store(discovering, Ordering::SeqCst);
    }

    /// Requested alias; applied on the next update pass
    pub fn set_alias(&self, alias: impl Into<String>) {
        *self.alias_control.lock() = Some(alias.into());
    }

    pub fn get_alias(&self) -> Result<String, Error> {
        self.do_interact("getAlias", |handle| handle.get_alias())
    }

    pub fn get_name(&self) -> Result<String, Error> {
        self.do_interact("getName", |handle| handle.get_name())
    }

    pub fn is_powered(&self) -> Result<bool, Error> {
        self.do_interact("isPowered", |handle| handle.is_powered())
    }

    pub fn is_discovering(&self) -> Result<bool, Error> {
        self.do_interact("isDiscovering", |handle| handle.is_discovering())
    }

    /// URLs of devices currently known to the adapter
    pub fn get_device_urls(&self) -> Result<Vec<Url>, Error> {
        self.do_interact("getDevices", |handle| handle.get_device_urls())
    }

    pub fn add_adapter_listener(&self, listener: Arc<dyn AdapterListener>) {
        self.adapter_listeners.write().push(listener);
    }

    pub fn remove_adapter_listener(&self, listener: &Arc<dyn AdapterListener>) {
        self.adapter_listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    fn notify_powered(&self, powered: bool) {
        let snapshot = self.adapter_listeners.read().clone();
        safe_for_each(&snapshot, "adapter powered", |listener| {
            listener.powered(powered)
        });
    }

    fn notify_discovering(&self, discovering: bool) {
        let snapshot = self.adapter_listeners.read().clone();
        safe_for_each(&snapshot, "adapter discovering", |listener| {
            listener.discovering(discovering)
        });
    }
}

impl Governed for AdapterGovernor {
    type Handle = dyn Adapter;

    fn core(&self) -> &GovernorCore<dyn Adapter> {
        &self.core
    }

    fn acquire_handle(&self, url: &Url) -> Option<Arc<dyn Adapter>> {
        self.core.manager()?.factory().get_adapter(url)
    }

    fn init_handle(&self, handle: &Arc<dyn Adapter>) -> Result<(), TransportError> {
        let me = self.me.clone();
        handle.enable_powered_notifications(Box::new(move |powered| {
            if let Some(governor) = me.upgrade() {
                governor.notify_powered(powered);
            }
        }))?;
        let me = self.me.clone();
        handle.enable_discovering_notifications(Box::new(move |discovering| {
            if let Some(governor) = me.upgrade() {
                governor.notify_discovering(discovering);
            }
        }))?;
        Ok(())
    }

    fn update_handle(&self, handle: &Arc<dyn Adapter>) -> Result<(), TransportError> {
        let powered_requested = self.powered_control.load(Ordering::SeqCst);
        if handle.is_powered()? != powered_requested {
            handle.set_powered(powered_requested)?;
        }
        // discovery can only run on a powered adapter
        if powered_requested {
            let discovering_requested = self.discovering_control.load(Ordering::SeqCst);
            let discovering = handle.is_discovering()?;
            if discovering_requested && !discovering {
                handle.start_discovery()?;
                self.started_discovery.store(true, Ordering::SeqCst);
            } else if !discovering_requested && discovering {
                handle.stop_discovery()?;
                self.started_discovery.store(false, Ordering::SeqCst);
            }
        }
        if let Some(alias) = self.alias_control.lock().clone() {
            if handle.get_alias()? != alias {
                handle.set_alias(&alias)?;
            }
        }
        Ok(())
    }

    fn reset_handle(&self, handle: &Arc<dyn Adapter>) -> Result<(), TransportError> {
        if self.started_discovery.swap(false, Ordering::SeqCst) {
            if let Err(err) = handle.stop_discovery() {
                trace!("Could not stop discovery: {}", err);
            }
        }
        if let Err(err) = handle.disable_powered_notifications() {
            trace!("Could not unsubscribe from powered notifications: {}", err);
        }
        if let Err(err) = handle.disable_discovering_notifications() {
            trace!("Could not unsubscribe from discovering notifications: {}", err);
        }
        Ok(())
    }
}
