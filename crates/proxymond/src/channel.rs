//! Named, cross-process command signals.
//!
//! Each transmittable [`Action`] owns one FIFO named `<base><suffix>` inside
//! the object namespace. The primary creates the FIFOs and runs one reader per
//! FIFO; a reader drains every pending byte on wakeup and sets the verb's
//! auto-reset [`Event`], so repeated sends before the dispatcher consumes them
//! coalesce into one wakeup. Secondaries open a FIFO by name and write a
//! single byte.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use proxymon_config::NamedObjects;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::event::{Event, wait_any};

const CHANNEL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::channel");

// One read consumes every byte a burst of senders could have queued, up to
// the atomic pipe write size.
const DRAIN_BUFFER: usize = 4096;
const SIGNAL_BYTE: [u8; 1] = [1];

/// Errors raised by the command channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Creating a signal object failed.
    #[error("failed to create signal object '{}': {source}", path.display())]
    Create {
        /// Signal object path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
    /// Opening a signal object failed.
    #[error("failed to open signal object '{}': {source}", path.display())]
    Open {
        /// Signal object path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// No primary instance is listening on the signal object.
    #[error("no running instance listens on '{}'", path.display())]
    NotRunning {
        /// Signal object path.
        path: PathBuf,
    },
    /// Setting a signal object failed.
    #[error("failed to signal '{}': {source}", path.display())]
    Signal {
        /// Signal object path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A reader stopped observing its signal object.
    #[error("waiting on the {action} signal failed: {source}")]
    Wait {
        /// Verb whose reader failed.
        action: Action,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Starting a reader thread failed.
    #[error("failed to start the {action} signal reader: {source}")]
    Spawn {
        /// Verb whose reader could not start.
        action: Action,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Names of the three signal objects, indexed by [`Action::slot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    paths: [PathBuf; 3],
}

impl ChannelNames {
    /// Derives the signal object names from the shared namespace.
    #[must_use]
    pub fn from_objects(objects: &NamedObjects) -> Self {
        Self {
            paths: Action::SIGNALLED.map(|action| {
                objects.signal_path(action.channel_suffix().unwrap_or_default())
            }),
        }
    }

    /// Path of the signal object for `action`, or `None` for [`Action::None`].
    #[must_use]
    pub fn path(&self, action: Action) -> Option<&Path> {
        action
            .slot()
            .and_then(|slot| self.paths.get(slot))
            .map(PathBuf::as_path)
    }
}

/// Signals `action` on a running primary instance.
///
/// [`Action::None`] succeeds without touching the channel. A signal that is
/// already pending counts as delivered.
pub fn send(names: &ChannelNames, action: Action) -> Result<(), ChannelError> {
    let Some(path) = names.path(action) else {
        return Ok(());
    };

    let file = OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
        .map_err(|source| match source.raw_os_error() {
            Some(code) if code == Errno::ENXIO as i32 || code == Errno::ENOENT as i32 => {
                ChannelError::NotRunning {
                    path: path.to_path_buf(),
                }
            }
            _ => ChannelError::Open {
                path: path.to_path_buf(),
                source,
            },
        })?;

    let is_fifo = file
        .metadata()
        .map_err(|source| ChannelError::Open {
            path: path.to_path_buf(),
            source,
        })?
        .file_type()
        .is_fifo();
    if !is_fifo {
        return Err(ChannelError::NotRunning {
            path: path.to_path_buf(),
        });
    }

    match (&file).write(&SIGNAL_BYTE) {
        Ok(_) => {}
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
            debug!(
                target: CHANNEL_TARGET,
                %action,
                "signal already pending; coalesced"
            );
        }
        Err(source) => {
            return Err(ChannelError::Signal {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    debug!(target: CHANNEL_TARGET, %action, path = %path.display(), "signal sent");
    Ok(())
}

/// Receiving end of the command channel, owned by the primary instance.
///
/// Dropping the channel stops the readers and removes the signal objects.
#[derive(Debug)]
pub struct CommandChannel {
    names: ChannelNames,
    events: [Event; 3],
    fault: Event,
    faults: Arc<Mutex<Option<ChannelError>>>,
    closing: Arc<AtomicBool>,
    readers: Vec<Reader>,
}

#[derive(Debug)]
struct Reader {
    action: Action,
    waker: File,
    handle: Option<JoinHandle<()>>,
}

impl CommandChannel {
    /// Creates the signal objects and starts observing them.
    pub fn open(names: ChannelNames) -> Result<Self, ChannelError> {
        let mut channel = Self {
            names,
            events: [Event::new(), Event::new(), Event::new()],
            fault: Event::new(),
            faults: Arc::new(Mutex::new(None)),
            closing: Arc::new(AtomicBool::new(false)),
            readers: Vec::with_capacity(Action::SIGNALLED.len()),
        };
        // On error the partially opened channel is dropped, which tears down
        // the objects created so far.
        for action in Action::SIGNALLED {
            let reader = channel.start_reader(action)?;
            channel.readers.push(reader);
        }
        info!(
            target: CHANNEL_TARGET,
            objects = channel.readers.len(),
            "command channel open"
        );
        Ok(channel)
    }

    /// Names of the signal objects this channel observes.
    #[must_use]
    pub fn names(&self) -> &ChannelNames {
        &self.names
    }

    /// Blocks until a verb is signalled and returns it.
    ///
    /// When several verbs are pending the lowest slot wins; the rest remain
    /// pending for the next call. A failed reader is reported as an error.
    pub fn wait(&self) -> Result<Action, ChannelError> {
        let [start, stop, quit] = &self.events;
        let fired = wait_any(&[start, stop, quit, &self.fault])
            .map_err(|error| ChannelError::Wait {
                action: Action::None,
                source: io::Error::other(error),
            })?;
        match Action::SIGNALLED.get(fired) {
            Some(action) => Ok(*action),
            None => Err(self.take_fault()),
        }
    }

    /// Observes a pending verb without blocking.
    #[cfg(test)]
    pub(crate) fn try_receive(&self) -> Option<Action> {
        Action::SIGNALLED
            .into_iter()
            .zip(self.events.iter())
            .find_map(|(action, event)| event.try_consume().then_some(action))
    }

    /// Handle that fails the channel the way a broken reader does.
    #[cfg(test)]
    pub(crate) fn fault_injector(&self) -> FaultInjector {
        FaultInjector {
            fault: self.fault.clone(),
            faults: Arc::clone(&self.faults),
        }
    }

    /// Stops the readers and removes the signal objects.
    pub fn close(self) {
        drop(self);
    }

    fn start_reader(&self, action: Action) -> Result<Reader, ChannelError> {
        let path = self.names.path(action).map(Path::to_path_buf).ok_or_else(|| {
            ChannelError::Spawn {
                action,
                source: io::Error::other("verb has no signal object"),
            }
        })?;
        create_fifo(&path)?;

        // Read-write keeps a writer attached, so reads block instead of
        // reporting end-of-file between senders.
        let fifo = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| ChannelError::Open {
                path: path.clone(),
                source,
            })?;
        let waker = fifo.try_clone().map_err(|source| ChannelError::Open {
            path: path.clone(),
            source,
        })?;

        let slot = action.slot().unwrap_or_default();
        let event = self.events.get(slot).cloned().unwrap_or_default();
        let fault = self.fault.clone();
        let faults = Arc::clone(&self.faults);
        let closing = Arc::clone(&self.closing);
        let handle = thread::Builder::new()
            .name(format!("proxymon-signal-{}", action.display_name().to_lowercase()))
            .spawn(move || read_signals(action, fifo, &event, &fault, &faults, &closing))
            .map_err(|source| ChannelError::Spawn { action, source })?;

        debug!(target: CHANNEL_TARGET, %action, path = %path.display(), "signal object created");
        Ok(Reader {
            action,
            waker,
            handle: Some(handle),
        })
    }

    fn take_fault(&self) -> ChannelError {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| ChannelError::Wait {
                action: Action::None,
                source: io::Error::other("signal reader stopped"),
            })
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        for reader in &mut self.readers {
            if let Err(error) = (&reader.waker).write(&SIGNAL_BYTE)
                && error.kind() != io::ErrorKind::WouldBlock
            {
                warn!(
                    target: CHANNEL_TARGET,
                    action = %reader.action,
                    error = %error,
                    "failed to wake signal reader"
                );
            }
            if let Some(handle) = reader.handle.take()
                && handle.join().is_err()
            {
                warn!(target: CHANNEL_TARGET, action = %reader.action, "signal reader panicked");
            }
        }
        for action in Action::SIGNALLED {
            let Some(path) = self.names.path(action) else {
                continue;
            };
            match fs::remove_file(path) {
                Err(error) if error.kind() != io::ErrorKind::NotFound => {
                    warn!(
                        target: CHANNEL_TARGET,
                        file = %path.display(),
                        error = %error,
                        "failed to remove signal object"
                    );
                }
                _ => {}
            }
        }
        info!(target: CHANNEL_TARGET, "command channel closed");
    }
}

fn create_fifo(path: &Path) -> Result<(), ChannelError> {
    // Only the lock holder creates signal objects, so a leftover FIFO belongs
    // to a primary that died without cleaning up.
    match fs::remove_file(path) {
        Err(source) if source.kind() != io::ErrorKind::NotFound => {
            return Err(ChannelError::Open {
                path: path.to_path_buf(),
                source,
            });
        }
        _ => {}
    }
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|source| ChannelError::Create {
        path: path.to_path_buf(),
        source,
    })
}

fn read_signals(
    action: Action,
    mut fifo: File,
    event: &Event,
    fault: &Event,
    faults: &Mutex<Option<ChannelError>>,
    closing: &AtomicBool,
) {
    let mut buffer = [0_u8; DRAIN_BUFFER];
    loop {
        match fifo.read(&mut buffer) {
            Ok(_) if closing.load(Ordering::SeqCst) => break,
            Ok(0) => continue,
            Ok(count) => {
                debug!(target: CHANNEL_TARGET, %action, pending = count, "signal observed");
                event.set();
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                if !closing.load(Ordering::SeqCst) {
                    record_fault(faults, fault, ChannelError::Wait { action, source });
                }
                break;
            }
        }
    }
}

fn record_fault(faults: &Mutex<Option<ChannelError>>, fault: &Event, error: ChannelError) {
    *faults.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    fault.set();
}

/// Fails a [`CommandChannel`] from outside its reader threads.
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct FaultInjector {
    fault: Event,
    faults: Arc<Mutex<Option<ChannelError>>>,
}

#[cfg(test)]
impl FaultInjector {
    /// Makes the next [`CommandChannel::wait`] return `error`.
    pub(crate) fn fail(&self, error: ChannelError) {
        record_fault(&self.faults, &self.fault, error);
    }
}
