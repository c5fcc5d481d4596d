//! Progress reporting
//!
//! Every [`ProgressEvent`] is folded into the run's [`RunProgress`] (shared
//! through a `watch` channel, so observers only see the latest value) and
//! forwarded to the configured [`IProgressSink`].

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use cloudkeep_core::domain::{ItemAction, ProgressEvent, RunProgress};
use cloudkeep_core::ports::IProgressSink;

/// Progress sink that writes events to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl IProgressSink for TracingProgressSink {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::PhaseStarted { phase } => debug!(?phase, "Phase started"),
            ProgressEvent::ScopeStarted { kind, scope } => {
                debug!(%kind, scope = %scope, "Processing");
            }
            ProgressEvent::ItemFinished { kind, path, action } => match action {
                ItemAction::Fetched { bytes } => debug!(%kind, path = %path, bytes, "Fetched"),
                ItemAction::Failed { reason } => {
                    debug!(%kind, path = %path, reason = %reason, "Item failed");
                }
                other => debug!(%kind, path = %path, action = ?other, "Item finished"),
            },
            ProgressEvent::Reconciled {
                kind,
                scope,
                removed,
                archived,
            } => debug!(%kind, scope = %scope, removed, archived, "Reconciled"),
            ProgressEvent::SkippedShared { path } => debug!(path = %path, "Skipped shared folder"),
            ProgressEvent::CancelRequested => debug!("Cancellation requested"),
            ProgressEvent::Warning { message } => warn!("{message}"),
        }
    }
}

/// Publishes progress for one run
pub struct ProgressReporter {
    tx: watch::Sender<RunProgress>,
    sink: Arc<dyn IProgressSink>,
}

impl ProgressReporter {
    /// Create a reporter and the receiver observers poll
    pub fn new(
        initial: RunProgress,
        sink: Arc<dyn IProgressSink>,
    ) -> (Self, watch::Receiver<RunProgress>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx, sink }, rx)
    }

    /// Apply an event to the shared progress and forward it to the sink
    pub fn emit(&self, event: ProgressEvent) {
        self.tx.send_modify(|progress| progress.apply(&event));
        self.sink.report(&event);
    }

    /// Current progress snapshot
    pub fn snapshot(&self) -> RunProgress {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;

    use cloudkeep_core::domain::{BackupKind, Phase};

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl IProgressSink for Recorder {
        fn report(&self, event: &ProgressEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn events_update_watchers_and_sink() {
        let recorder = Arc::new(Recorder::default());
        let (reporter, rx) = ProgressReporter::new(RunProgress::new(Utc::now()), recorder.clone());

        reporter.emit(ProgressEvent::PhaseStarted { phase: Phase::Drive });
        reporter.emit(ProgressEvent::ItemFinished {
            kind: BackupKind::Drive,
            path: "Docs/a.txt".into(),
            action: ItemAction::Fetched { bytes: 42 },
        });

        let progress = rx.borrow().clone();
        assert_eq!(progress.phase, Phase::Drive);
        assert_eq!(progress.processed, 1);
        assert_eq!(progress.drive_bytes, 42);
        assert_eq!(reporter.snapshot(), progress);
        assert_eq!(recorder.0.lock().unwrap().len(), 2);
    }
}
