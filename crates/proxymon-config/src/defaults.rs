use camino::Utf8PathBuf;
use std::env;
use std::path::PathBuf;

#[cfg(unix)]
use libc::geteuid;

use crate::logging::LogFormat;

/// Base identifier used when none is configured.
pub const DEFAULT_INSTANCE_NAME: &str = "proxymon";

/// Default log filter expression used by the binary.
pub const DEFAULT_LOG_FILTER: &str = "info";

const APP_DIRECTORY: &str = "proxymon";
const JOURNAL_FILE: &str = "proxymon.log";
const SETTINGS_FILE: &str = "internet-settings.toml";

/// Default log filter expression used by the binary.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
pub(crate) fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binary.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

/// Computes the default namespace directory for named objects.
///
/// Prefers the session runtime directory so the namespace disappears with the
/// login session; otherwise a per-user directory below the temporary
/// directory is used.
#[must_use]
pub fn default_namespace_dir() -> Utf8PathBuf {
    if let Some(mut dir) = dirs::runtime_dir().and_then(utf8) {
        dir.push(APP_DIRECTORY);
        return dir;
    }
    let mut dir = fallback_base_directory();
    dir.push(APP_DIRECTORY);
    dir.push(user_namespace());
    dir
}

/// Computes the default journal location below the per-user data directory.
#[must_use]
pub fn default_journal_path() -> Utf8PathBuf {
    let mut path = dirs::data_dir()
        .and_then(utf8)
        .unwrap_or_else(fallback_base_directory);
    path.push(APP_DIRECTORY);
    path.push(JOURNAL_FILE);
    path
}

/// Computes the default proxy settings file below the per-user config
/// directory.
#[must_use]
pub fn default_settings_path() -> Utf8PathBuf {
    let mut path = dirs::config_dir()
        .and_then(utf8)
        .unwrap_or_else(fallback_base_directory);
    path.push(APP_DIRECTORY);
    path.push(SETTINGS_FILE);
    path
}

fn utf8(path: PathBuf) -> Option<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(path).ok()
}

fn fallback_base_directory() -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(env::temp_dir()).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

#[cfg(unix)]
fn user_namespace() -> String {
    let uid = unsafe { geteuid() };
    format!("uid-{uid}")
}

#[cfg(not(unix))]
fn user_namespace() -> String {
    env::var("USERNAME").unwrap_or_else(|_| String::from("user"))
}
