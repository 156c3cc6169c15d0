//! Relays termination signals to the primary's own command channel.
//!
//! A terminal interrupt or a service-manager stop is turned into the quit
//! verb, so the same ordered teardown runs as for `proxymon -quit`.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use thiserror::Error;
use tracing::info;

use crate::action::Action;
use crate::channel::{ChannelNames, send};
use crate::process_state::ProcessState;

const SHUTDOWN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::shutdown");

/// Errors reported by the signal relay.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The relay thread could not be started.
    #[error("failed to start the signal relay: {source}")]
    Spawn {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The relay thread panicked.
    #[error("the signal relay thread panicked")]
    Panicked,
}

/// Background thread turning termination signals into `Quit`.
#[derive(Debug)]
pub struct SignalRelay {
    handle: Handle,
    thread: JoinHandle<()>,
}

impl SignalRelay {
    /// Installs the handlers and starts relaying to the channel at `names`.
    pub fn install(names: ChannelNames, state: Arc<ProcessState>) -> Result<Self, ShutdownError> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP])
            .map_err(|source| ShutdownError::Install { source })?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name(String::from("proxymon-signals"))
            .spawn(move || {
                for signal in signals.forever() {
                    info!(
                        target: SHUTDOWN_TARGET,
                        signal,
                        "termination signal received; requesting quit"
                    );
                    if let Err(error) = send(&names, Action::Quit) {
                        state.report(&error);
                    }
                }
            })
            .map_err(|source| ShutdownError::Spawn { source })?;
        Ok(Self { handle, thread })
    }

    /// Stops relaying and waits for the relay thread.
    pub fn close(self) -> Result<(), ShutdownError> {
        self.handle.close();
        self.thread.join().map_err(|_| ShutdownError::Panicked)
    }
}
