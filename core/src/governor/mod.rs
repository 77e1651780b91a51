//! Governor lifecycle engine
//!
//! A governor supervises exactly one native handle: it lazily acquires the
//! handle from the transport factory, initializes it, keeps reconciling
//! user-requested state against it, and on any transport failure tears the
//! handle down (descendants first) so the next pass starts clean.
//!
//! One `update()` pass, driven by the refresh scheduler or an explicit
//! caller, walks the whole machine: acquire → init → `ready(true)` →
//! maintain. An error anywhere flips it into reset, which emits
//! `ready(false)` and releases the handle. Dispose is terminal.

mod adapter;
mod characteristic;
mod device;

pub use adapter::{AdapterGovernor, AdapterListener};
pub use characteristic::{CharacteristicGovernor, ValueListener};
pub use device::{
    BluetoothSmartDeviceListener, DeviceGovernor, GenericBluetoothDeviceListener,
};

use crate::manager::ManagerShared;
use crate::transport::{BluetoothObject, TransportError};
use crate::url::Url;
use crate::util::safe_for_each;
use crate::Error;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tracing::{debug, trace, warn};

/// Lifecycle stage of a governor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorState {
    /// No handle acquired yet
    New,
    /// Handle acquired and initialized
    Ready,
    /// Torn down after a failure or an explicit reset; re-acquires lazily
    Reset,
    /// Terminal; the governor never changes state or notifies again
    Disposed,
}

/// Notified about a governor's lifecycle transitions.
///
/// Callbacks run on whichever thread produced the transition (usually a
/// refresh worker) and must be fast and non-blocking.
pub trait GovernorListener: Send + Sync {
    fn ready(&self, _ready: bool) {}
    fn last_updated_changed(&self, _at: SystemTime) {}
}

/// Shared state of every governor, generic over the native handle type
pub(crate) struct GovernorCore<H: ?Sized> {
    url: Url,
    manager: Weak<ManagerShared>,
    state: RwLock<GovernorState>,
    handle: RwLock<Option<Arc<H>>>,
    protocol_cache: RwLock<Option<String>>,
    last_activity: Mutex<Option<SystemTime>>,
    last_activity_notified: Mutex<Option<SystemTime>>,
    listeners: RwLock<Vec<Arc<dyn GovernorListener>>>,
    // serializes the acquire-init-maintain sequence; reentrant so that an
    // interact issued from inside update_handle can drive a nested pass
    update_lock: ReentrantMutex<()>,
    update_lock_held: AtomicBool,
}

impl<H: ?Sized> GovernorCore<H> {
    pub(crate) fn new(url: Url, manager: Weak<ManagerShared>) -> Self {
        Self {
            url,
            manager,
            state: RwLock::new(GovernorState::New),
            handle: RwLock::new(None),
            protocol_cache: RwLock::new(None),
            last_activity: Mutex::new(None),
            last_activity_notified: Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
            update_lock: ReentrantMutex::new(()),
            update_lock_held: AtomicBool::new(false),
        }
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn state(&self) -> GovernorState {
        *self.state.read()
    }

    pub(crate) fn handle(&self) -> Option<Arc<H>> {
        self.handle.read().clone()
    }

    pub(crate) fn manager(&self) -> Option<Arc<ManagerShared>> {
        self.manager.upgrade()
    }

    pub(crate) fn protocol(&self) -> Option<String> {
        self.protocol_cache.read().clone()
    }

    fn last_activity(&self) -> Option<SystemTime> {
        *self.last_activity.lock()
    }

    fn mark_activity(&self) {
        *self.last_activity.lock() = Some(SystemTime::now());
    }

    fn add_listener(&self, listener: Arc<dyn GovernorListener>) {
        self.listeners.write().push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn GovernorListener>) {
        self.listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }
}

/// The lifecycle contract every concrete governor implements.
///
/// The three handle hooks carry the entity-specific behavior; the provided
/// methods implement the state machine once, for all of them.
pub(crate) trait Governed: Send + Sync {
    type Handle: BluetoothObject + ?Sized;

    fn core(&self) -> &GovernorCore<Self::Handle>;

    /// Ask the transport factory for a handle bound to `url`
    fn acquire_handle(&self, url: &Url) -> Option<Arc<Self::Handle>>;

    /// One-time setup after acquisition (subscriptions, initial state)
    fn init_handle(&self, handle: &Arc<Self::Handle>) -> Result<(), TransportError>;

    /// One reconciliation pass of requested state against the handle
    fn update_handle(&self, handle: &Arc<Self::Handle>) -> Result<(), TransportError>;

    /// Domain teardown before the handle is released
    fn reset_handle(&self, handle: &Arc<Self::Handle>) -> Result<(), TransportError>;

    /// One full update pass. Never propagates transport failures.
    fn do_update(&self)
    where
        Self: Sized,
    {
        let core = self.core();
        if core.state() == GovernorState::Disposed {
            return;
        }
        debug!("Updating governor. Trying to acquire lock: {}", core.url);
        if let Some(guard) = core.update_lock.try_lock() {
            let was_held = core.update_lock_held.swap(true, Ordering::SeqCst);
            let updated = match self.locked_update_pass() {
                Ok(updated) => updated,
                Err(err) => {
                    warn!(
                        "Error occurred while updating governor: {} : {}",
                        core.url, err
                    );
                    self.do_reset();
                    false
                }
            };
            core.update_lock_held.store(was_held, Ordering::SeqCst);
            drop(guard);
            if updated {
                core.mark_activity();
                self.notify_last_changed();
            }
        } else {
            // another thread is mid-update; serialize with it so the caller
            // has observed one completed pass, then return
            debug!("Lock could not be acquired (governor is being updated). Skipping the update.");
            let guard = core.update_lock.lock();
            drop(guard);
        }
    }

    /// Acquire-or-reuse plus maintain, under the update lock.
    /// Returns whether a pass actually ran.
    #[doc(hidden)]
    fn locked_update_pass(&self) -> Result<bool, TransportError>
    where
        Self: Sized,
    {
        let core = self.core();
        let handle = match self.get_or_acquire()? {
            Some(handle) => handle,
            None => {
                trace!("Native object is not available: {}", core.url);
                return Ok(false);
            }
        };
        trace!("Performing update with the native object: {}", core.url);
        self.update_handle(&handle)?;
        debug!("Governor has been updated: {}", core.url);
        Ok(true)
    }

    /// Return the cached handle or acquire and initialize a fresh one
    #[doc(hidden)]
    fn get_or_acquire(&self) -> Result<Option<Arc<Self::Handle>>, TransportError>
    where
        Self: Sized,
    {
        let core = self.core();
        if let Some(handle) = core.handle() {
            return Ok(Some(handle));
        }
        trace!("Native object is null. Trying to acquire a new one: {}", core.url);
        let lookup = match core.protocol() {
            Some(protocol) => core.url.copy_with_protocol(protocol),
            None => core.url.clone(),
        };
        let handle = match self.acquire_handle(&lookup) {
            Some(handle) => handle,
            None => return Ok(None),
        };
        debug!("A new native object has been acquired: {}", core.url);
        // remember which backend produced the handle so the next acquisition
        // skips the protocol resolution
        if let Some(protocol) = handle.url().protocol() {
            *core.protocol_cache.write() = Some(protocol.to_string());
        }
        // cache before init: a failing init still reaches the reset path
        // with the handle in place, so it gets disposed properly
        *core.handle.write() = Some(Arc::clone(&handle));
        self.init_handle(&handle)?;
        *core.state.write() = GovernorState::Ready;
        self.notify_ready(true);
        Ok(Some(handle))
    }

    /// Tear down: descendants first, then domain teardown, `ready(false)`,
    /// handle release. The governor re-acquires on a later pass.
    fn do_reset(&self)
    where
        Self: Sized,
    {
        let core = self.core();
        {
            let mut state = core.state.write();
            if *state == GovernorState::Reset || *state == GovernorState::Disposed {
                return;
            }
            *state = GovernorState::Reset;
        }
        debug!("Resetting governor. Descendants first: {}", core.url);
        if let Some(manager) = core.manager() {
            manager.reset_descendants(&core.url);
        }
        let handle = core.handle();
        if let Some(handle) = handle {
            if let Err(err) = self.reset_handle(&handle) {
                debug!("Could not reset native object {}: {}", core.url, err);
            }
            self.notify_ready(false);
            if let Err(err) = handle.dispose() {
                debug!("Could not dispose native object {}: {}", core.url, err);
            }
        }
        *core.handle.write() = None;
        debug!("Governor has been reset: {}", core.url);
    }

    /// Reset and freeze. Idempotent; never fails.
    fn do_dispose(&self)
    where
        Self: Sized,
    {
        let core = self.core();
        if core.state() == GovernorState::Disposed {
            return;
        }
        debug!("Disposing governor: {}", core.url);
        self.do_reset();
        *core.state.write() = GovernorState::Disposed;
        core.listeners.write().clear();
    }

    /// Run `f` against the live handle, resetting on failure.
    ///
    /// Performs one on-demand update when not ready; fails with
    /// [`Error::NotReady`] if the handle still cannot be obtained. A
    /// transport failure resets the governor and propagates to the caller.
    fn do_interact<R>(
        &self,
        name: &str,
        f: impl FnOnce(&Arc<Self::Handle>) -> Result<R, TransportError>,
    ) -> Result<R, Error>
    where
        Self: Sized,
    {
        let core = self.core();
        let handle = match core.handle() {
            Some(handle) => handle,
            None => {
                trace!("Governor is not ready. Trying an explicit update: {}", core.url);
                self.do_update();
                core.handle()
                    .ok_or_else(|| Error::NotReady(core.url.clone()))?
            }
        };
        trace!("Interacting with native object ({}): {}", name, core.url);
        match f(&handle) {
            Ok(value) => {
                core.mark_activity();
                Ok(value)
            }
            Err(err) => {
                let locked = core.update_lock_held.load(Ordering::SeqCst);
                warn!(
                    "Error occurred while interacting ({}) with native object: {} (update in progress: {}): {}",
                    name, core.url, locked, err
                );
                self.do_reset();
                Err(Error::Transport(err))
            }
        }
    }

    /// Fan out a ready transition to listeners and the manager
    #[doc(hidden)]
    fn notify_ready(&self, ready: bool) {
        let core = self.core();
        let snapshot = core.listeners.read().clone();
        safe_for_each(&snapshot, "ready", |listener| listener.ready(ready));
        if let Some(manager) = core.manager() {
            manager.governor_ready(&core.url, ready);
        }
    }

    /// Fan out a last-activity change, debounced by timestamp equality
    #[doc(hidden)]
    fn notify_last_changed(&self) {
        let core = self.core();
        let Some(last) = core.last_activity() else {
            return;
        };
        {
            let mut notified = core.last_activity_notified.lock();
            if *notified == Some(last) {
                return;
            }
            *notified = Some(last);
        }
        let snapshot = core.listeners.read().clone();
        safe_for_each(&snapshot, "last changed", |listener| {
            listener.last_updated_changed(last)
        });
    }
}

/// Accessors every governor exposes, independent of handle type
macro_rules! governor_common {
    () => {
        /// This governor's stable identifier
        pub fn url(&self) -> &crate::url::Url {
            self.core.url()
        }

        /// Whether an initialized native handle is currently held
        pub fn is_ready(&self) -> bool {
            self.core.handle().is_some()
        }

        /// Current lifecycle state
        pub fn state(&self) -> crate::governor::GovernorState {
            self.core.state()
        }

        /// Timestamp of the last successful update or interaction
        pub fn last_activity(&self) -> Option<std::time::SystemTime> {
            self.core.last_activity()
        }

        /// Protocol scheme of the backend that produced the current or most
        /// recent handle
        pub fn protocol(&self) -> Option<String> {
            self.core.protocol()
        }

        pub fn add_governor_listener(
            &self,
            listener: std::sync::Arc<dyn crate::governor::GovernorListener>,
        ) {
            self.core.add_listener(listener);
        }

        pub fn remove_governor_listener(
            &self,
            listener: &std::sync::Arc<dyn crate::governor::GovernorListener>,
        ) {
            self.core.remove_listener(listener);
        }

        /// Alias for the first `update()` (acquires and initializes)
        pub fn init(&self) {
            self.update();
        }

        /// One acquire-or-reconcile pass; never propagates failures
        pub fn update(&self) {
            crate::governor::Governed::do_update(self);
        }

        /// Tear down the handle (descendants first); re-acquires lazily
        pub fn reset(&self) {
            crate::governor::Governed::do_reset(self);
        }

        /// Reset and permanently retire this governor
        pub fn dispose(&self) {
            crate::governor::Governed::do_dispose(self);
        }
    };
}

pub(crate) use governor_common;
