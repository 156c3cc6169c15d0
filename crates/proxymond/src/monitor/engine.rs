//! Logging on/off state machine and the cancellable watch loop it drives.

use std::any::Any;
use std::fmt;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use time::UtcOffset;
use tracing::{debug, info, warn};

use super::journal::{Journal, JournalError};
use super::snapshot::ProxySnapshot;
use super::store::{ProxySettings, ProxySettingsStore, StoreError, StoreWatch};
use crate::event::{Event, WaitError, wait_any};
use crate::health::HealthReporter;
use crate::process_state::ProcessState;

const MONITOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::monitor");

/// Callback told about every applied logging transition.
pub type LoggingListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Result of a [`MonitorEngine::set_enabled`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The requested state is now in effect.
    Applied,
    /// The engine was already in the requested state.
    Unchanged,
    /// Another transition was in flight; nothing changed.
    Rejected,
    /// Setting up the transition failed; nothing changed.
    Failed,
}

/// Errors raised while enabling or running the watch loop.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The journal could not be opened or written.
    #[error(transparent)]
    Journal(#[from] JournalError),
    /// The settings store could not be watched or armed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The multiplexed wait failed.
    #[error("watch loop wait failed: {0}")]
    Wait(#[from] WaitError),
    /// The watch loop thread could not be started.
    #[error("failed to start the watch loop: {0}")]
    Spawn(#[source] io::Error),
    /// A logging-state listener panicked.
    #[error("logging listener panicked: {0}")]
    Listener(String),
    /// Watch loop threads panicked before they could be joined.
    #[error("{count} watch loop thread(s) panicked")]
    WorkerPanicked {
        /// Number of panicked workers.
        count: usize,
    },
}

/// Toggles proxy logging and owns the watch-loop activations.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct MonitorEngine {
    shared: Arc<EngineShared>,
}

struct EngineShared {
    state: Mutex<LoggingState>,
    listeners: Mutex<Vec<LoggingListener>>,
    store: Arc<dyn ProxySettingsStore>,
    journal_path: PathBuf,
    offset: UtcOffset,
    process: Arc<ProcessState>,
    reporter: Arc<dyn HealthReporter>,
}

#[derive(Default)]
struct LoggingState {
    enabled: bool,
    change_in_progress: bool,
    generation: u64,
    cancel: Option<Event>,
    // Set when the current activation's worker fails while a transition
    // holds the guard; the transition resolves it before releasing.
    worker_failed: bool,
    workers: Vec<JoinHandle<()>>,
}

/// Resources owned by one watch-loop activation, released together on drop.
struct Activation {
    generation: u64,
    watch: Box<dyn StoreWatch>,
    notification: Event,
    cancel: Event,
    journal: Journal,
}

impl fmt::Debug for MonitorEngine {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock_state();
        formatter
            .debug_struct("MonitorEngine")
            .field("enabled", &state.enabled)
            .field("change_in_progress", &state.change_in_progress)
            .field("generation", &state.generation)
            .field("journal_path", &self.shared.journal_path)
            .finish_non_exhaustive()
    }
}

impl MonitorEngine {
    /// Builds a disabled engine.
    ///
    /// `offset` is applied to journal timestamps; it should be resolved before
    /// any thread is spawned, since the local offset cannot be queried safely
    /// afterwards.
    pub fn new(
        store: Arc<dyn ProxySettingsStore>,
        journal_path: impl Into<PathBuf>,
        offset: UtcOffset,
        process: Arc<ProcessState>,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(LoggingState::default()),
                listeners: Mutex::new(Vec::new()),
                store,
                journal_path: journal_path.into(),
                offset,
                process,
                reporter,
            }),
        }
    }

    /// Whether logging is currently enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.shared.lock_state().enabled
    }

    /// Journal file written by the watch loop.
    #[must_use]
    pub fn journal_path(&self) -> &Path {
        self.shared.journal_path.as_path()
    }

    /// Adds a listener invoked after every applied transition.
    ///
    /// Listeners run without the state lock but while the transition guard is
    /// still held, so a listener that requests a transition is rejected.
    pub fn register_listener<F>(&self, listener: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Requests logging on or off.
    ///
    /// Enabling opens the journal and a settings watch, then starts a new
    /// watch-loop activation. Disabling signals the activation's cancel event
    /// and returns without waiting for the loop to finish. Setup failures are
    /// reported to the process state and yield [`Transition::Failed`].
    pub fn set_enabled(&self, value: bool) -> Transition {
        let shared = &self.shared;
        let (generation, cancel) = {
            let mut state = shared.lock_state();
            if state.change_in_progress {
                drop(state);
                warn!(
                    target: MONITOR_TARGET,
                    requested = value,
                    "logging transition already in progress; request rejected"
                );
                shared.reporter.transition_rejected(value);
                return Transition::Rejected;
            }
            if state.enabled == value {
                return Transition::Unchanged;
            }
            state.change_in_progress = true;
            if value {
                state.generation += 1;
                state.worker_failed = false;
            }
            let cancel = if value { None } else { state.cancel.take() };
            (state.generation, cancel)
        };

        if value {
            match self.activate(generation) {
                Ok((cancel, worker)) => {
                    let mut state = shared.lock_state();
                    state.enabled = true;
                    state.cancel = Some(cancel);
                    state.workers.retain(|handle| !handle.is_finished());
                    state.workers.push(worker);
                }
                Err(error) => {
                    shared.process.report(&error);
                    shared.lock_state().change_in_progress = false;
                    return Transition::Failed;
                }
            }
        } else {
            if let Some(cancel) = cancel {
                cancel.set();
            }
            let mut state = shared.lock_state();
            state.enabled = false;
            state.worker_failed = false;
        }
        info!(target: MONITOR_TARGET, enabled = value, generation, "logging transition applied");

        shared.notify(value);

        let worker_already_failed = {
            let mut state = shared.lock_state();
            state.change_in_progress = false;
            let failed = value && state.worker_failed && state.generation == generation;
            if failed {
                state.worker_failed = false;
                state.enabled = false;
                state.cancel = None;
            }
            failed
        };
        if worker_already_failed {
            warn!(target: MONITOR_TARGET, generation, "watch loop failed during start; logging disabled");
            shared.notify(false);
        }
        Transition::Applied
    }

    /// Disables logging and waits for every watch-loop thread to finish.
    pub fn shutdown(&self) -> Result<(), MonitorError> {
        if self.set_enabled(false) == Transition::Rejected {
            warn!(target: MONITOR_TARGET, "forcing watch loop cancellation during shutdown");
        }
        let (cancel, workers) = {
            let mut state = self.shared.lock_state();
            (state.cancel.take(), mem::take(&mut state.workers))
        };
        if let Some(cancel) = cancel {
            cancel.set();
        }
        let count = workers
            .into_iter()
            .map(JoinHandle::join)
            .filter(Result::is_err)
            .count();
        if count > 0 {
            return Err(MonitorError::WorkerPanicked { count });
        }
        debug!(target: MONITOR_TARGET, "monitor engine shut down");
        Ok(())
    }

    fn activate(&self, generation: u64) -> Result<(Event, JoinHandle<()>), MonitorError> {
        let shared = &self.shared;
        let journal = Journal::open(&shared.journal_path, shared.offset)?;
        let notification = Event::new();
        let watch = shared.store.watch(notification.clone())?;
        let cancel = Event::new();
        let activation = Activation {
            generation,
            watch,
            notification,
            cancel: cancel.clone(),
            journal,
        };

        let worker_shared = Arc::clone(shared);
        let worker = thread::Builder::new()
            .name(format!("proxymon-watch-{generation}"))
            .spawn(move || worker_shared.run(activation))
            .map_err(MonitorError::Spawn)?;
        Ok((cancel, worker))
    }
}

impl EngineShared {
    fn lock_state(&self) -> MutexGuard<'_, LoggingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, enabled: bool) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(enabled))) {
                self.process
                    .report(&MonitorError::Listener(panic_message(payload.as_ref())));
            }
        }
        self.reporter.logging_changed(enabled);
    }

    fn run(self: Arc<Self>, mut activation: Activation) {
        let generation = activation.generation;
        self.reporter.monitor_started(generation);
        let outcome = self.watch_loop(&mut activation);
        drop(activation);
        self.reporter.monitor_stopped(generation);

        if let Err(error) = outcome {
            self.process.report(&error);
            self.worker_failed(generation);
        }
    }

    fn watch_loop(&self, activation: &mut Activation) -> Result<(), MonitorError> {
        let mut snapshot = ProxySnapshot::default();
        loop {
            activation.watch.arm()?;
            let reading = self.store.read().unwrap_or_else(|error| {
                warn!(
                    target: MONITOR_TARGET,
                    error = %error,
                    "failed to read proxy settings; assuming proxy off"
                );
                ProxySettings::disabled()
            });

            let first = !snapshot.has_observed();
            if snapshot.observe(&reading) {
                activation.journal.record(&reading)?;
                debug!(
                    target: MONITOR_TARGET,
                    generation = activation.generation,
                    first,
                    enabled = reading.enabled,
                    "proxy reading journalled"
                );
                self.reporter.proxy_changed(&reading);
            }

            if wait_any(&[&activation.cancel, &activation.notification])? == 0 {
                return Ok(());
            }
        }
    }

    fn worker_failed(&self, generation: u64) {
        {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            if state.change_in_progress {
                state.worker_failed = true;
                return;
            }
            if !state.enabled {
                return;
            }
            state.enabled = false;
            state.cancel = None;
        }
        warn!(target: MONITOR_TARGET, generation, "watch loop stopped on error; logging disabled");
        self.notify(false);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("non-string panic payload"))
}
