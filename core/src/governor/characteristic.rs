//! Characteristic governor
//!
//! Keeps the notification subscription in step with the registered value
//! listeners and exposes read/write through the interaction conduit. Value
//! events also surface on the parent device governor's smart listeners.

use crate::governor::{governor_common, Governed, GovernorCore};
use crate::manager::ManagerShared;
use crate::transport::{Characteristic, TransportError};
use crate::url::Url;
use crate::util::safe_for_each;
use crate::Error;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Notified when the characteristic's value changes
pub trait ValueListener: Send + Sync {
    fn changed(&self, value: &[u8]);
}

/// Supervises one native characteristic handle
pub struct CharacteristicGovernor {
    core: GovernorCore<dyn Characteristic>,
    me: Weak<CharacteristicGovernor>,
    subscribed: AtomicBool,
    last_value: Mutex<Option<Vec<u8>>>,
    value_listeners: RwLock<Vec<Arc<dyn ValueListener>>>,
}

impl CharacteristicGovernor {
    pub(crate) fn new(url: Url, manager: Weak<ManagerShared>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: GovernorCore::new(url, manager),
            me: me.clone(),
            subscribed: AtomicBool::new(false),
            last_value: Mutex::new(None),
            value_listeners: RwLock::new(Vec::new()),
        })
    }

    governor_common!();

    /// Read the characteristic's value
    pub fn read(&self) -> Result<Vec<u8>, Error> {
        let value = self.do_interact("read", |handle| handle.read_value())?;
        *self.last_value.lock() = Some(value.clone());
        Ok(value)
    }

    /// Write a value to the characteristic
    pub fn write(&self, value: &[u8]) -> Result<(), Error> {
        self.do_interact("write", |handle| handle.write_value(value))
    }

    /// Whether the backend subscription is currently active
    pub fn is_notifying(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// The most recent value seen by a read or a notification
    pub fn last_value(&self) -> Option<Vec<u8>> {
        self.last_value.lock().clone()
    }

    /// Registering the first value listener turns the backend notification
    /// subscription on at the next update pass
    pub fn add_value_listener(&self, listener: Arc<dyn ValueListener>) {
        self.value_listeners.write().push(listener);
    }

    pub fn remove_value_listener(&self, listener: &Arc<dyn ValueListener>) {
        self.value_listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    fn notifications_requested(&self) -> bool {
        !self.value_listeners.read().is_empty()
    }

    fn subscribe(&self, handle: &Arc<dyn Characteristic>) -> Result<(), TransportError> {
        let me = self.me.clone();
        handle.enable_value_notifications(Box::new(move |value| {
            if let Some(governor) = me.upgrade() {
                governor.on_value(value);
            }
        }))?;
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_value(&self, value: Vec<u8>) {
        *self.last_value.lock() = Some(value.clone());
        self.core.mark_activity();
        let snapshot = self.value_listeners.read().clone();
        safe_for_each(&snapshot, "value changed", |listener| {
            listener.changed(&value)
        });
        if let Some(manager) = self.core.manager() {
            manager.characteristic_value_changed(self.core.url(), &value);
        }
    }
}

impl Governed for CharacteristicGovernor {
    type Handle = dyn Characteristic;

    fn core(&self) -> &GovernorCore<dyn Characteristic> {
        &self.core
    }

    fn acquire_handle(&self, url: &Url) -> Option<Arc<dyn Characteristic>> {
        self.core.manager()?.factory().get_characteristic(url)
    }

    fn init_handle(&self, handle: &Arc<dyn Characteristic>) -> Result<(), TransportError> {
        if self.notifications_requested() {
            self.subscribe(handle)?;
        }
        Ok(())
    }

    fn update_handle(&self, handle: &Arc<dyn Characteristic>) -> Result<(), TransportError> {
        let requested = self.notifications_requested();
        let subscribed = self.subscribed.load(Ordering::SeqCst);
        if requested && !subscribed {
            self.subscribe(handle)?;
        } else if !requested && subscribed {
            handle.disable_value_notifications()?;
            self.subscribed.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn reset_handle(&self, handle: &Arc<dyn Characteristic>) -> Result<(), TransportError> {
        if self.subscribed.swap(false, Ordering::SeqCst) {
            if let Err(err) = handle.disable_value_notifications() {
                trace!("Could not unsubscribe from value notifications: {}", err);
            }
        }
        Ok(())
    }
}
