//! Explicit owner of the per-process control-plane state.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use time::UtcOffset;

use crate::health::HealthReporter;
use crate::lifecycle::LifecycleRegistry;
use crate::monitor::{MonitorEngine, ProxySettingsStore};
use crate::process_state::ProcessState;

/// State shared by the dispatcher, the tray collaborator and teardown.
///
/// One context is built per process and handed to each component by
/// reference, so nothing relies on process-wide globals.
pub struct ApplicationContext {
    state: Arc<ProcessState>,
    lifecycle: LifecycleRegistry,
    engine: MonitorEngine,
    reporter: Arc<dyn HealthReporter>,
}

impl ApplicationContext {
    /// Builds a context whose engine journals readings of `store` to
    /// `journal_path`.
    pub fn new(
        store: Arc<dyn ProxySettingsStore>,
        journal_path: impl Into<PathBuf>,
        offset: UtcOffset,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        let state = Arc::new(ProcessState::new());
        let engine = MonitorEngine::new(
            store,
            journal_path,
            offset,
            Arc::clone(&state),
            Arc::clone(&reporter),
        );
        Self {
            lifecycle: LifecycleRegistry::new(Arc::clone(&state)),
            state,
            engine,
            reporter,
        }
    }

    /// Process-wide normal/abnormal flag.
    #[must_use]
    pub fn state(&self) -> &Arc<ProcessState> {
        &self.state
    }

    /// Quit callbacks and finalizers.
    #[must_use]
    pub const fn lifecycle(&self) -> &LifecycleRegistry {
        &self.lifecycle
    }

    /// Logging state machine.
    #[must_use]
    pub const fn engine(&self) -> &MonitorEngine {
        &self.engine
    }

    /// Sink for lifecycle events.
    #[must_use]
    pub fn reporter(&self) -> &dyn HealthReporter {
        self.reporter.as_ref()
    }
}

impl fmt::Debug for ApplicationContext {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ApplicationContext")
            .field("state", &self.state)
            .field("lifecycle", &self.lifecycle)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
