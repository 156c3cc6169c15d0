//! Auto-reset events and a multiplexed wait over a fixed set of them.
//!
//! An [`Event`] behaves like a kernel auto-reset event: [`Event::set`] makes
//! it observable, and the next successful wait both observes and clears it.
//! Setting an already-set event has no further effect, so several sets before
//! a wait coalesce into a single wakeup.

use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Errors reported by [`wait_any`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    /// The wait set contained no events, so nothing could ever fire.
    #[error("cannot wait on an empty set of events")]
    EmptySet,
}

/// Cloneable handle to an auto-reset event.
#[derive(Debug, Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    state: Mutex<EventState>,
}

#[derive(Debug, Default)]
struct EventState {
    signalled: bool,
    waiters: Vec<Arc<Waiter>>,
}

#[derive(Debug, Default)]
struct Waiter {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl Waiter {
    fn wake(&self) {
        *lock(&self.woken) = true;
        self.condvar.notify_one();
    }

    fn park(&self) {
        let guard = lock(&self.woken);
        let mut woken = self
            .condvar
            .wait_while(guard, |woken| !*woken)
            .unwrap_or_else(PoisonError::into_inner);
        *woken = false;
    }
}

impl Event {
    /// Creates an event in the non-signalled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the event, waking any thread blocked on it.
    pub fn set(&self) {
        let waiters = {
            let mut state = lock(&self.inner.state);
            state.signalled = true;
            state.waiters.clone()
        };
        for waiter in waiters {
            waiter.wake();
        }
    }

    /// Observes and clears the event without blocking.
    pub fn try_consume(&self) -> bool {
        mem::replace(&mut lock(&self.inner.state).signalled, false)
    }

    /// Reports whether the event is currently signalled without clearing it.
    #[must_use]
    pub fn is_set(&self) -> bool {
        lock(&self.inner.state).signalled
    }

    /// Blocks until the event is signalled, then clears it.
    pub fn wait(&self) {
        park_until_fired(&[self]);
    }

    fn register(&self, waiter: &Arc<Waiter>) {
        lock(&self.inner.state).waiters.push(Arc::clone(waiter));
    }

    fn unregister(&self, waiter: &Arc<Waiter>) {
        lock(&self.inner.state)
            .waiters
            .retain(|registered| !Arc::ptr_eq(registered, waiter));
    }
}

/// Blocks until one of `events` is signalled and returns its index.
///
/// The fired event is cleared. When several events are signalled at once the
/// lowest index wins and the others stay signalled for the next wait. There
/// is no timeout.
pub fn wait_any(events: &[&Event]) -> Result<usize, WaitError> {
    if events.is_empty() {
        return Err(WaitError::EmptySet);
    }
    Ok(park_until_fired(events))
}

// `events` must not be empty, or this never returns.
fn park_until_fired(events: &[&Event]) -> usize {
    let waiter = Arc::new(Waiter::default());
    for event in events {
        event.register(&waiter);
    }

    let fired = loop {
        if let Some(index) = events.iter().position(|event| event.try_consume()) {
            break index;
        }
        waiter.park();
    };

    for event in events {
        event.unregister(&waiter);
    }
    fired
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
