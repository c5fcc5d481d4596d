//! Progress sink port
//!
//! The engine reports what it is doing through an explicit sink passed in
//! at construction. Delivery (log lines, a polling endpoint, desktop
//! notifications) is the implementation's concern.

use crate::domain::ProgressEvent;

/// Receives progress events from a running backup
///
/// Called from the run's task, once per item outcome and per scope
/// change; implementations must return quickly.
pub trait IProgressSink: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}
