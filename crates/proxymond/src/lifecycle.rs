//! Ordered callback stacks for quit handling and process finalisation.
//!
//! Callbacks are appended during setup and drained exactly once, in reverse
//! registration order, when their trigger fires. Each callback runs in
//! isolation: an error or a panic is converted into a [`CallbackFailure`],
//! reported through [`ProcessState`], and the remaining callbacks still run.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::process_state::ProcessState;

const LIFECYCLE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::lifecycle");

type Callback = Box<dyn FnOnce() -> Result<(), CallbackError> + Send>;

/// Error returned by a lifecycle callback.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl CallbackError {
    /// Builds an error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Builds an error wrapping the failure that caused it.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Trigger a callback stack is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Runs when the dispatcher processes the quit verb.
    Quit,
    /// Runs at process exit, whatever the role or verb.
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quit => formatter.write_str("quit"),
            Self::Finalize => formatter.write_str("finalize"),
        }
    }
}

/// Why a callback did not complete.
#[derive(Debug, Error)]
pub enum FailureCause {
    /// The callback returned an error.
    #[error(transparent)]
    Returned(#[from] CallbackError),
    /// The callback panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

/// Record of one callback that did not complete.
#[derive(Debug, Error)]
#[error("{stage} callback '{label}' failed: {cause}")]
pub struct CallbackFailure {
    /// Label supplied at registration.
    pub label: String,
    /// Stack the callback belonged to.
    pub stage: Stage,
    /// What went wrong.
    #[source]
    pub cause: FailureCause,
}

struct Entry {
    label: String,
    callback: Callback,
}

/// Registry of quit callbacks and finalizers.
pub struct LifecycleRegistry {
    state: Arc<ProcessState>,
    finalizers: Mutex<Vec<Entry>>,
    quit_callbacks: Mutex<Vec<Entry>>,
}

impl fmt::Debug for LifecycleRegistry {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LifecycleRegistry")
            .field("finalizers", &labels(&self.finalizers))
            .field("quit_callbacks", &labels(&self.quit_callbacks))
            .finish_non_exhaustive()
    }
}

impl LifecycleRegistry {
    /// Builds an empty registry that reports failures to `state`.
    #[must_use]
    pub fn new(state: Arc<ProcessState>) -> Self {
        Self {
            state,
            finalizers: Mutex::new(Vec::new()),
            quit_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Appends a callback to run at process exit.
    pub fn register_finalizer<F>(&self, label: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Result<(), CallbackError> + Send + 'static,
    {
        push(&self.finalizers, label.into(), Box::new(callback));
    }

    /// Appends a callback to run when the quit verb is processed.
    pub fn register_quit_callback<F>(&self, label: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Result<(), CallbackError> + Send + 'static,
    {
        push(&self.quit_callbacks, label.into(), Box::new(callback));
    }

    /// Drains the quit callbacks, last registered first.
    pub fn run_quit_callbacks(&self) -> Vec<CallbackFailure> {
        self.drain(&self.quit_callbacks, Stage::Quit)
    }

    /// Drains the finalizers, last registered first.
    pub fn run_finalizers(&self) -> Vec<CallbackFailure> {
        self.drain(&self.finalizers, Stage::Finalize)
    }

    fn drain(&self, stack: &Mutex<Vec<Entry>>, stage: Stage) -> Vec<CallbackFailure> {
        // The lock is released before any callback runs so callbacks may
        // register further entries without deadlocking.
        let entries = mem::take(&mut *stack.lock().unwrap_or_else(PoisonError::into_inner));
        let mut failures = Vec::new();
        for Entry { label, callback } in entries.into_iter().rev() {
            debug!(target: LIFECYCLE_TARGET, %stage, callback = %label, "running callback");
            let cause = match panic::catch_unwind(AssertUnwindSafe(callback)) {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => FailureCause::Returned(error),
                Err(payload) => FailureCause::Panicked(panic_message(payload.as_ref())),
            };
            let failure = CallbackFailure {
                label,
                stage,
                cause,
            };
            self.state.report(&failure);
            failures.push(failure);
        }
        failures
    }
}

fn push(stack: &Mutex<Vec<Entry>>, label: String, callback: Callback) {
    stack
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(Entry { label, callback });
}

fn labels(stack: &Mutex<Vec<Entry>>) -> Vec<String> {
    stack
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|entry| entry.label.clone())
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}
