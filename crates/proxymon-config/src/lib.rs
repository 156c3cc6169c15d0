//! Shared configuration for the proxy settings monitor.
//!
//! Configuration is layered by [`ortho_config`]: built-in defaults are
//! overridden by a configuration file, then by `PROXYMON_*` environment
//! variables, and finally by command-line flags. The crate also derives the
//! on-disk namespace that hosts the instance lock and the command signal
//! objects so that every invocation of the binary agrees on their names.

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

mod defaults;
mod logging;
mod namespace;

pub use defaults::{
    DEFAULT_INSTANCE_NAME, DEFAULT_LOG_FILTER, default_journal_path, default_log_filter,
    default_log_format, default_namespace_dir, default_settings_path,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use namespace::{NamedObjects, NamespaceError};

/// Resolved configuration shared by the primary and secondary roles.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "PROXYMON")]
#[serde(default)]
pub struct Config {
    /// Base identifier for the instance lock and the command signal objects.
    pub instance_name: String,
    /// Directory acting as the namespace for named objects.
    pub namespace_dir: Option<Utf8PathBuf>,
    /// Append-only journal receiving one line per observed proxy change.
    pub journal_path: Option<Utf8PathBuf>,
    /// Per-user settings file holding `ProxyEnable` and `ProxyServer`.
    pub settings_path: Option<Utf8PathBuf>,
    /// Optional icon file handed to the tray collaborator.
    pub tray_icon: Option<Utf8PathBuf>,
    /// `tracing` filter directive applied to diagnostics.
    pub log_filter: String,
    /// Output format for diagnostics.
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_name: DEFAULT_INSTANCE_NAME.to_owned(),
            namespace_dir: None,
            journal_path: None,
            settings_path: None,
            tray_icon: None,
            log_filter: defaults::default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Base identifier shared by the instance lock and the signal objects.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Namespace directory, falling back to the per-user runtime directory.
    #[must_use]
    pub fn namespace_dir(&self) -> Utf8PathBuf {
        self.namespace_dir
            .clone()
            .unwrap_or_else(default_namespace_dir)
    }

    /// Journal file path, falling back to the per-user data directory.
    #[must_use]
    pub fn journal_path(&self) -> Utf8PathBuf {
        self.journal_path.clone().unwrap_or_else(default_journal_path)
    }

    /// Settings file path, falling back to the per-user config directory.
    #[must_use]
    pub fn settings_path(&self) -> Utf8PathBuf {
        self.settings_path
            .clone()
            .unwrap_or_else(default_settings_path)
    }

    /// Icon file for the tray collaborator, when configured.
    #[must_use]
    pub fn tray_icon(&self) -> Option<&Utf8Path> {
        self.tray_icon.as_deref()
    }

    /// Filter directive for diagnostics.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Output format for diagnostics.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }
}
