//! Process-wide normal/abnormal flag.

use std::error::Error;
use std::sync::{Mutex, PoisonError};

use tracing::error;

const STATE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::state");

/// Advisory health of the whole process.
///
/// The state starts normal and flips to abnormal the first time any component
/// reports a failure. It never recovers within the process lifetime.
#[derive(Debug)]
pub struct ProcessState {
    normal: Mutex<bool>,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self {
            normal: Mutex::new(true),
        }
    }
}

impl ProcessState {
    /// Builds a state in the normal condition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the process abnormal and emits a diagnostic for `failure`.
    pub fn report<E>(&self, failure: &E)
    where
        E: Error + ?Sized,
    {
        *self.normal.lock().unwrap_or_else(PoisonError::into_inner) = false;
        let cause = failure.source().map(ToString::to_string);
        error!(
            target: STATE_TARGET,
            error = %failure,
            cause = cause.as_deref(),
            "internal error"
        );
    }

    /// Returns `true` until the first failure is reported.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        *self.normal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
