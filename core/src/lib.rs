//! Self-healing governor layer over volatile Bluetooth transport handles
//!
//! Native adapter/device/characteristic handles appear and vanish
//! asynchronously and any backend call can fail. This crate wraps each
//! logical entity, addressed by a stable [`Url`], in a governor that
//! acquires the handle lazily, reconciles requested state against it on a
//! fixed cadence, and recovers from every transport failure by tearing down
//! and re-acquiring. The [`BluetoothManager`] owns the governors, schedules
//! their refreshes and runs the periodic discovery pass.
//!
//! Listener callbacks run on whichever thread produced the event (usually a
//! refresh worker); they must be fast and non-blocking.

pub mod bitmap;
pub mod discovery;
pub mod governor;
pub mod manager;
pub mod scheduler;
pub mod signal;
pub mod transport;
pub mod url;

mod util;

use thiserror::Error as ThisError;

pub use bitmap::{BitMapError, ConcurrentBitMap};
pub use discovery::{
    AdapterDiscoveryListener, DeviceDiscoveryListener, DiscoveredAdapter, DiscoveredDevice,
};
pub use governor::{
    AdapterGovernor, AdapterListener, BluetoothSmartDeviceListener, CharacteristicGovernor,
    DeviceGovernor, GenericBluetoothDeviceListener, GovernorListener, GovernorState,
    ValueListener,
};
pub use manager::{AnyGovernor, BluetoothManager, ManagerConfig, ManagerListener};
pub use signal::{FilterKind, KalmanFilter, MovingAverageFilter, SignalFilter};
pub use transport::{
    Adapter, AdapterReport, BluetoothObject, BluetoothObjectFactory, Characteristic, Device,
    DeviceReport, GattService, Notification, TransportError,
};
pub use url::{Url, UrlParseError};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Failures surfaced to callers of governor and manager operations.
///
/// Background refreshes never propagate errors; only user-initiated calls
/// (accessors and the interaction conduit) return these.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A handle could not be obtained even after an on-demand update;
    /// retry later
    #[error("Bluetooth object is not ready: {0}")]
    NotReady(Url),

    /// A backend call failed; the governor has been reset
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// API misuse, e.g. a bitmap index out of range
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Failure inside the manager itself, e.g. its worker threads could
    /// not be spawned
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BitMapError> for Error {
    fn from(err: BitMapError) -> Self {
        Error::InvalidState(err.to_string())
    }
}
