//! Append-only journal of observed proxy changes.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use thiserror::Error;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use super::store::ProxySettings;

const TIMESTAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]");

/// Errors raised while journalling.
#[derive(Debug, Error)]
pub enum JournalError {
    /// The journal file or its directory could not be opened.
    #[error("failed to open journal '{}': {source}", path.display())]
    Open {
        /// Journal path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A line could not be appended.
    #[error("failed to append to journal '{}': {source}", path.display())]
    Write {
        /// Journal path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The timestamp could not be rendered.
    #[error("failed to format journal timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Open journal file owned by one watch-loop activation.
#[derive(Debug)]
pub(crate) struct Journal {
    file: File,
    path: PathBuf,
    offset: UtcOffset,
}

impl Journal {
    /// Opens `path` for appending, creating it and its directory as needed.
    pub(crate) fn open(path: &Path, offset: UtcOffset) -> Result<Self, JournalError> {
        let open_error = |source: io::Error| JournalError::Open {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            DirBuilder::new()
                .recursive(true)
                .mode(0o770)
                .create(parent)
                .map_err(open_error)?;
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(path)
            .map_err(open_error)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            offset,
        })
    }

    /// Appends one timestamped line describing `settings`.
    pub(crate) fn record(&mut self, settings: &ProxySettings) -> Result<(), JournalError> {
        let now = OffsetDateTime::now_utc().to_offset(self.offset);
        let line = format_line(now, settings)?;
        writeln!(self.file, "{line}").map_err(|source| JournalError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

pub(crate) fn format_line(
    timestamp: OffsetDateTime,
    settings: &ProxySettings,
) -> Result<String, JournalError> {
    let stamp = timestamp.format(TIMESTAMP)?;
    Ok(if settings.enabled {
        format!("{stamp}  proxy on, {}", settings.server)
    } else {
        format!("{stamp}  proxy off")
    })
}
