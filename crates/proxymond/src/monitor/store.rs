//! Sources of the per-user proxy settings and their change notifications.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::event::Event;

const STORE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::store");

/// One reading of the two monitored values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    /// Whether the proxy is switched on.
    pub enabled: bool,
    /// Configured proxy server address.
    pub server: String,
}

impl ProxySettings {
    /// Reading used when the store cannot be read.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Reading for an enabled proxy at `server`.
    pub fn enabled(server: impl Into<String>) -> Self {
        Self {
            enabled: true,
            server: server.into(),
        }
    }
}

/// Errors raised by settings stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The settings file could not be read.
    #[error("failed to read proxy settings '{}': {source}", path.display())]
    Read {
        /// Settings file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The settings file is not valid TOML or has mistyped values.
    #[error("failed to parse proxy settings '{}': {source}", path.display())]
    Parse {
        /// Settings file path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// Subscribing to or observing change notifications failed.
    #[error("failed to watch proxy settings '{}': {source}", path.display())]
    Watch {
        /// Watched directory.
        path: PathBuf,
        /// Underlying watcher error.
        #[source]
        source: notify::Error,
    },
    /// The directory holding the settings could not be prepared.
    #[error("failed to prepare settings directory '{}': {source}", path.display())]
    Directory {
        /// Directory path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A failure injected into the in-memory store.
    #[error("{0}")]
    Injected(String),
}

/// Per-user configuration source exposing the proxy values and a change
/// subscription.
pub trait ProxySettingsStore: Send + Sync {
    /// Reads the current values.
    fn read(&self) -> Result<ProxySettings, StoreError>;

    /// Subscribes to changes; `notification` is set whenever the store may
    /// have changed after the returned watch was armed.
    fn watch(&self, notification: Event) -> Result<Box<dyn StoreWatch>, StoreError>;
}

/// Live change subscription owned by one watch-loop activation.
///
/// Dropping the watch releases the subscription.
pub trait StoreWatch: Send {
    /// Arms the subscription for the next mutation.
    fn arm(&mut self) -> Result<(), StoreError>;
}

/// Settings held in a TOML file with `ProxyEnable` and `ProxyServer` keys.
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    #[serde(rename = "ProxyEnable", default)]
    proxy_enable: Option<ProxyFlag>,
    #[serde(rename = "ProxyServer", default)]
    proxy_server: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProxyFlag {
    Flag(bool),
    Number(i64),
}

impl ProxyFlag {
    const fn is_on(&self) -> bool {
        match self {
            Self::Flag(value) => *value,
            Self::Number(value) => *value != 0,
        }
    }
}

impl FileSettingsStore {
    /// Builds a store reading the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the settings file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

impl ProxySettingsStore for FileSettingsStore {
    fn read(&self) -> Result<ProxySettings, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            // No file means nothing has been configured yet.
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(ProxySettings::disabled());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let raw: RawSettings = toml::from_str(&contents).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(ProxySettings {
            enabled: raw.proxy_enable.as_ref().is_some_and(ProxyFlag::is_on),
            server: raw.proxy_server.unwrap_or_default(),
        })
    }

    fn watch(&self, notification: Event) -> Result<Box<dyn StoreWatch>, StoreError> {
        let directory = self.directory();
        fs::create_dir_all(&directory).map_err(|source| StoreError::Directory {
            path: directory.clone(),
            source,
        })?;

        let sink = NotificationSink::new(&self.path, notification);
        let forward = sink.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<notify::Event>| forward.deliver(result),
            notify::Config::default(),
        )
        .map_err(|source| StoreError::Watch {
            path: directory.clone(),
            source,
        })?;
        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|source| StoreError::Watch {
                path: directory.clone(),
                source,
            })?;
        debug!(target: STORE_TARGET, directory = %directory.display(), "settings watch opened");

        Ok(Box::new(FileWatch {
            _watcher: watcher,
            directory,
            sink,
        }))
    }
}

/// Filters watcher callbacks down to the settings file and parks watcher
/// errors until the next arm.
#[derive(Clone)]
struct NotificationSink {
    target: Option<OsString>,
    notification: Event,
    faults: Arc<Mutex<Option<notify::Error>>>,
}

impl NotificationSink {
    fn new(path: &Path, notification: Event) -> Self {
        Self {
            target: path.file_name().map(ToOwned::to_owned),
            notification,
            faults: Arc::new(Mutex::new(None)),
        }
    }

    fn deliver(&self, result: notify::Result<notify::Event>) {
        match result {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) && event
                    .paths
                    .iter()
                    .any(|path| path.file_name() == self.target.as_deref());
                if relevant {
                    self.notification.set();
                }
            }
            Err(error) => {
                *lock(&self.faults) = Some(error);
                self.notification.set();
            }
        }
    }

    fn take_fault(&self, directory: &Path) -> Result<(), StoreError> {
        match lock(&self.faults).take() {
            Some(source) => Err(StoreError::Watch {
                path: directory.to_path_buf(),
                source,
            }),
            None => Ok(()),
        }
    }
}

struct FileWatch {
    _watcher: RecommendedWatcher,
    directory: PathBuf,
    sink: NotificationSink,
}

impl StoreWatch for FileWatch {
    // The watcher stays subscribed between iterations, so arming only
    // surfaces errors it reported since the previous arm.
    fn arm(&mut self) -> Result<(), StoreError> {
        self.sink.take_fault(&self.directory)
    }
}

impl Drop for FileWatch {
    fn drop(&mut self) {
        debug!(
            target: STORE_TARGET,
            directory = %self.directory.display(),
            "settings watch released"
        );
    }
}

/// In-process settings store for tests and embedding.
///
/// Every [`MemorySettingsStore::set`] signals each live watch. Read and arm
/// failures can be injected to exercise the watch loop's error paths.
#[derive(Clone, Default)]
pub struct MemorySettingsStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    current: Mutex<ProxySettings>,
    watchers: Mutex<Vec<(u64, Event)>>,
    next_watch: AtomicU64,
    reads: AtomicUsize,
    fail_reads: Mutex<Option<String>>,
    fail_arms: Mutex<Option<String>>,
}

impl fmt::Debug for MemorySettingsStore {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MemorySettingsStore")
            .field("current", &self.current())
            .field("reads", &self.reads())
            .field("active_watches", &self.active_watches())
            .finish()
    }
}

impl MemorySettingsStore {
    /// Builds a store holding `initial`.
    #[must_use]
    pub fn new(initial: ProxySettings) -> Self {
        let store = Self::default();
        *lock(&store.inner.current) = initial;
        store
    }

    /// Replaces the stored values and notifies every live watch.
    pub fn set(&self, settings: ProxySettings) {
        *lock(&self.inner.current) = settings;
        for (_, notification) in lock(&self.inner.watchers).iter() {
            notification.set();
        }
    }

    /// Current stored values.
    #[must_use]
    pub fn current(&self) -> ProxySettings {
        lock(&self.inner.current).clone()
    }

    /// Number of completed read attempts, failed ones included.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// Number of watches that have not been released.
    #[must_use]
    pub fn active_watches(&self) -> usize {
        lock(&self.inner.watchers).len()
    }

    /// Makes every subsequent read fail with `message` until cleared.
    pub fn fail_reads(&self, message: Option<&str>) {
        *lock(&self.inner.fail_reads) = message.map(ToOwned::to_owned);
    }

    /// Makes every subsequent arm fail with `message` and wakes live watches
    /// so they observe it.
    pub fn fail_arms(&self, message: Option<&str>) {
        *lock(&self.inner.fail_arms) = message.map(ToOwned::to_owned);
        for (_, notification) in lock(&self.inner.watchers).iter() {
            notification.set();
        }
    }
}

impl ProxySettingsStore for MemorySettingsStore {
    fn read(&self) -> Result<ProxySettings, StoreError> {
        let outcome = match lock(&self.inner.fail_reads).as_ref() {
            Some(message) => Err(StoreError::Injected(message.clone())),
            None => Ok(self.current()),
        };
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    fn watch(&self, notification: Event) -> Result<Box<dyn StoreWatch>, StoreError> {
        let id = self.inner.next_watch.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.watchers).push((id, notification));
        Ok(Box::new(MemoryWatch {
            id,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryWatch {
    id: u64,
    inner: Arc<MemoryInner>,
}

impl StoreWatch for MemoryWatch {
    fn arm(&mut self) -> Result<(), StoreError> {
        match lock(&self.inner.fail_arms).as_ref() {
            Some(message) => Err(StoreError::Injected(message.clone())),
            None => Ok(()),
        }
    }
}

impl Drop for MemoryWatch {
    fn drop(&mut self) {
        lock(&self.inner.watchers).retain(|(id, _)| *id != self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
