//! Interfaces to the notification-area collaborator.
//!
//! Rendering a menu and decoding icons belong to the frontend; this module
//! only defines what the control plane hands it and what it expects back.
//! [`TrayController`] translates menu clicks into command-channel sends and
//! tracks which menu entries should be available. [`HeadlessTray`] is the
//! shipped frontend: it has no menu and simply keeps the main thread parked
//! until the instance quits.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use crate::action::Action;
use crate::channel::{ChannelError, ChannelNames, send};
use crate::event::{Event, WaitError, wait_any};
use crate::lifecycle::LifecycleRegistry;
use crate::monitor::MonitorEngine;
use crate::process_state::ProcessState;

const TRAY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::tray");

const ICON_MAGIC: [u8; 4] = [0x00, 0x00, 0x01, 0x00];

/// Icon compiled into the binary: a single 1x1 grey 32-bit image.
pub const DEFAULT_TRAY_ICON: &[u8] = &[
    // ICONDIR: reserved, type 1 (icon), one image.
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00,
    // ICONDIRENTRY: 1x1, no palette, 1 plane, 32 bpp, 48 bytes at offset 22.
    0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x20, 0x00,
    0x30, 0x00, 0x00, 0x00, 0x16, 0x00, 0x00, 0x00,
    // BITMAPINFOHEADER: 40 bytes, 1x2 (XOR and AND halves), 1 plane, 32 bpp.
    0x28, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
    0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x20, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    // XOR pixel (BGRA).
    0x80, 0x80, 0x80, 0xFF,
    // AND mask row, padded to 32 bits.
    0x00, 0x00, 0x00, 0x00,
];

/// Errors raised by tray collaborators.
#[derive(Debug, Error)]
pub enum TrayError {
    /// The icon file could not be read.
    #[error("failed to read tray icon '{}': {source}", path.display())]
    Icon {
        /// Icon path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The icon bytes do not start with an icon-container header.
    #[error("tray icon from {origin} is not an icon container")]
    NotAnIcon {
        /// Where the bytes came from.
        origin: String,
    },
    /// Waiting for the instance to stop failed.
    #[error("tray wait failed: {0}")]
    Wait(#[from] WaitError),
}

/// Supplies the raw icon-container bytes shown by the frontend.
pub trait TrayIconSource: Send + Sync {
    /// Loads the icon.
    fn load_tray_icon(&self) -> Result<Vec<u8>, TrayError>;
}

/// Loads the icon from a loose file.
#[derive(Debug, Clone)]
pub struct FileIconSource {
    path: PathBuf,
}

impl FileIconSource {
    /// Builds a source reading `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Icon file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrayIconSource for FileIconSource {
    fn load_tray_icon(&self) -> Result<Vec<u8>, TrayError> {
        let bytes = fs::read(&self.path).map_err(|source| TrayError::Icon {
            path: self.path.clone(),
            source,
        })?;
        check_header(bytes, || self.path.display().to_string())
    }
}

/// Serves icon bytes embedded in the binary.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedIconSource {
    bytes: &'static [u8],
}

impl Default for EmbeddedIconSource {
    fn default() -> Self {
        Self::new(DEFAULT_TRAY_ICON)
    }
}

impl EmbeddedIconSource {
    /// Builds a source serving `bytes`.
    #[must_use]
    pub const fn new(bytes: &'static [u8]) -> Self {
        Self { bytes }
    }
}

impl TrayIconSource for EmbeddedIconSource {
    fn load_tray_icon(&self) -> Result<Vec<u8>, TrayError> {
        check_header(self.bytes.to_vec(), || String::from("embedded resource"))
    }
}

fn check_header(bytes: Vec<u8>, origin: impl FnOnce() -> String) -> Result<Vec<u8>, TrayError> {
    if bytes.starts_with(&ICON_MAGIC) {
        Ok(bytes)
    } else {
        Err(TrayError::NotAnIcon { origin: origin() })
    }
}

/// Menu clicks delivered by the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayEvent {
    /// "Start logging" was chosen.
    StartClicked,
    /// "Stop logging" was chosen.
    StopClicked,
    /// "Quit" was chosen.
    QuitClicked,
}

impl TrayEvent {
    /// Verb sent in response to the click.
    #[must_use]
    pub const fn action(self) -> Action {
        match self {
            Self::StartClicked => Action::Start,
            Self::StopClicked => Action::Stop,
            Self::QuitClicked => Action::Quit,
        }
    }
}

/// Which menu entries the frontend should offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuAffordances {
    /// "Start logging" is available.
    pub start: bool,
    /// "Stop logging" is available.
    pub stop: bool,
}

impl MenuAffordances {
    /// Entries matching the given logging state.
    #[must_use]
    pub const fn for_logging(enabled: bool) -> Self {
        Self {
            start: !enabled,
            stop: enabled,
        }
    }
}

/// Bridges frontend clicks and logging-state notifications.
#[derive(Clone)]
pub struct TrayController {
    names: ChannelNames,
    state: Arc<ProcessState>,
    affordances: Arc<Mutex<MenuAffordances>>,
}

impl fmt::Debug for TrayController {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TrayController")
            .field("names", &self.names)
            .field("affordances", &self.affordances())
            .finish_non_exhaustive()
    }
}

impl TrayController {
    /// Builds a controller that sends through the channel at `names`.
    #[must_use]
    pub fn new(names: ChannelNames, state: Arc<ProcessState>) -> Self {
        Self {
            names,
            state,
            affordances: Arc::new(Mutex::new(MenuAffordances::for_logging(false))),
        }
    }

    /// Follows the engine's logging state from now on.
    pub fn attach(&self, engine: &MonitorEngine) {
        let affordances = Arc::clone(&self.affordances);
        engine.register_listener(move |enabled| {
            *affordances.lock().unwrap_or_else(PoisonError::into_inner) =
                MenuAffordances::for_logging(enabled);
            debug!(target: TRAY_TARGET, enabled, "menu affordances updated");
        });
    }

    /// Entries the frontend should currently offer.
    #[must_use]
    pub fn affordances(&self) -> MenuAffordances {
        *self.affordances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends the verb for `event`; failures are also reported to the process
    /// state.
    pub fn handle(&self, event: TrayEvent) -> Result<(), ChannelError> {
        let action = event.action();
        info!(target: TRAY_TARGET, ?event, %action, "menu item chosen");
        send(&self.names, action).inspect_err(|error| self.state.report(error))
    }
}

/// Everything a frontend needs once the instance is running.
#[derive(Debug)]
pub struct TraySession {
    /// Click handler and affordance tracker.
    pub controller: TrayController,
    /// Icon-container bytes to display.
    pub icon: Vec<u8>,
    /// Set when the dispatch loop has stopped.
    pub dispatcher_stopped: Event,
}

/// Frontend owning the main thread of the primary instance.
pub trait TrayFrontend {
    /// Registers the frontend's quit callback; called before dispatching
    /// starts.
    fn install(&mut self, lifecycle: &LifecycleRegistry);

    /// Runs until the frontend is told to quit or the dispatcher stops.
    fn run(&mut self, session: TraySession) -> Result<(), TrayError>;
}

/// Frontend without any visual presence.
#[derive(Debug, Clone, Default)]
pub struct HeadlessTray {
    quit: Event,
}

impl HeadlessTray {
    /// Builds a headless frontend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrayFrontend for HeadlessTray {
    fn install(&mut self, lifecycle: &LifecycleRegistry) {
        let quit = self.quit.clone();
        lifecycle.register_quit_callback("tray", move || {
            quit.set();
            Ok(())
        });
    }

    fn run(&mut self, session: TraySession) -> Result<(), TrayError> {
        info!(
            target: TRAY_TARGET,
            icon_bytes = session.icon.len(),
            affordances = ?session.controller.affordances(),
            "headless tray running"
        );
        let fired = wait_any(&[&self.quit, &session.dispatcher_stopped])?;
        debug!(target: TRAY_TARGET, quit = fired == 0, "headless tray finished");
        Ok(())
    }
}
