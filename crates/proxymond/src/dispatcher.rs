//! Event loop of the primary instance.
//!
//! The dispatcher blocks on the command channel, which is its only blocking
//! point, and turns each observed verb into a monitor transition. `Quit`
//! drains the quit callbacks and ends the loop; a wait error is reported and
//! also ends the loop. Neither outcome is retried. The channel is closed as the
//! loop exits, so later senders observe that no instance is listening.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{info, warn};

use crate::action::Action;
use crate::channel::CommandChannel;
use crate::context::ApplicationContext;
use crate::event::Event;
use crate::monitor::Transition;

const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatcher");

/// How the dispatch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The quit verb was processed.
    Quit,
    /// Waiting on the channel failed.
    Failed,
}

/// Errors raised while starting or joining the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatcher thread could not be started.
    #[error("failed to start the dispatcher: {0}")]
    Spawn(#[source] io::Error),
    /// The dispatcher thread panicked.
    #[error("the dispatcher thread panicked")]
    Panicked,
}

/// Dispatch loop bound to one command channel.
#[derive(Debug)]
pub struct Dispatcher {
    channel: CommandChannel,
    context: Arc<ApplicationContext>,
}

/// Handle to a running dispatcher thread.
#[derive(Debug)]
pub struct DispatcherHandle {
    thread: JoinHandle<DispatchOutcome>,
    stopped: Event,
}

impl DispatcherHandle {
    /// Event set once the loop has stopped and the channel is closed.
    #[must_use]
    pub fn stopped(&self) -> Event {
        self.stopped.clone()
    }

    /// Waits for the loop to end.
    pub fn join(self) -> Result<DispatchOutcome, DispatchError> {
        self.thread.join().map_err(|_| DispatchError::Panicked)
    }
}

// Sets the stopped event however the loop thread exits.
struct StoppedGuard(Event);

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

impl Dispatcher {
    /// Applies the initial transition and starts the loop on its own thread.
    ///
    /// Logging is switched on unless `initial` is [`Action::Stop`]. The
    /// initial transition runs on the calling thread, so it has completed when
    /// this returns.
    pub fn spawn(
        channel: CommandChannel,
        context: Arc<ApplicationContext>,
        initial: Action,
    ) -> Result<DispatcherHandle, DispatchError> {
        let enable = initial != Action::Stop;
        let transition = context.engine().set_enabled(enable);
        info!(
            target: DISPATCH_TARGET,
            %initial,
            enable,
            ?transition,
            "initial logging transition"
        );

        let stopped = Event::new();
        let guard = StoppedGuard(stopped.clone());
        let dispatcher = Self { channel, context };
        let thread = thread::Builder::new()
            .name(String::from("proxymon-dispatch"))
            .spawn(move || {
                let _guard = guard;
                dispatcher.run()
            })
            .map_err(DispatchError::Spawn)?;
        Ok(DispatcherHandle { thread, stopped })
    }

    fn run(self) -> DispatchOutcome {
        let Self { channel, context } = self;
        let outcome = loop {
            let action = match channel.wait() {
                Ok(action) => action,
                Err(error) => {
                    context.state().report(&error);
                    break DispatchOutcome::Failed;
                }
            };
            context.reporter().command_received(action);
            match action {
                Action::Start => log_transition(action, context.engine().set_enabled(true)),
                Action::Stop => log_transition(action, context.engine().set_enabled(false)),
                Action::Quit => {
                    let failures = context.lifecycle().run_quit_callbacks();
                    if !failures.is_empty() {
                        warn!(
                            target: DISPATCH_TARGET,
                            failed = failures.len(),
                            "quit callbacks failed"
                        );
                    }
                    break DispatchOutcome::Quit;
                }
                Action::None => {}
            }
        };
        channel.close();
        context.reporter().dispatcher_stopped(outcome);
        outcome
    }
}

fn log_transition(action: Action, transition: Transition) {
    info!(target: DISPATCH_TARGET, %action, ?transition, "command dispatched");
}
