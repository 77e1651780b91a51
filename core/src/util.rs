//! Small shared helpers

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Invoke `f` for every listener in the snapshot, isolating failures.
///
/// A panicking listener is logged and skipped; it never aborts the iteration
/// and never reaches the caller.
pub(crate) fn safe_for_each<T: ?Sized>(listeners: &[Arc<T>], context: &str, f: impl Fn(&T)) {
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
            error!("Listener failure suppressed: {}", context);
        }
    }
}
