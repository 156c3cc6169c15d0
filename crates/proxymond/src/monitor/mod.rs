//! Proxy settings monitoring.
//!
//! [`MonitorEngine`] owns the logging on/off state. While enabled it runs one
//! watch-loop activation that arms a change subscription on a
//! [`ProxySettingsStore`], reads the current values and journals a line
//! whenever they differ from the previous reading.

mod engine;
mod journal;
mod snapshot;
mod store;

pub use engine::{LoggingListener, MonitorEngine, MonitorError, Transition};
pub use journal::JournalError;
pub use store::{
    FileSettingsStore, MemorySettingsStore, ProxySettings, ProxySettingsStore, StoreError,
    StoreWatch,
};
