//! Single-instance election through a named, machine-visible lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use thiserror::Error;
use tracing::{debug, info};

use crate::action::Action;

const ARBITER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::arbiter");

/// Errors that prevent arbitration from reaching a verdict.
#[derive(Debug, Error)]
pub enum ArbiterError {
    /// The lock object could not be created or opened.
    #[error("failed to create instance lock '{}': {source}", path.display())]
    Create {
        /// Lock file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Locking failed for a reason other than an existing holder.
    #[error("failed to acquire instance lock '{}': {source}", path.display())]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
    /// Releasing the lock failed.
    #[error("failed to release instance lock '{}': {source}", path.display())]
    Release {
        /// Lock file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
}

/// Role assigned to the calling process.
#[derive(Debug)]
pub enum Role {
    /// The caller holds the instance lock for the rest of its life.
    Primary(PrimaryLease),
    /// Another process already holds the instance lock.
    Secondary,
}

impl Role {
    /// Returns `true` for the primary role.
    #[must_use]
    pub const fn is_primary(&self) -> bool {
        matches!(self, Self::Primary(_))
    }
}

/// Ownership of the instance lock held by the primary process.
///
/// The lock is released when the lease is dropped or explicitly released, and
/// by the kernel if the process dies, so no stale-lock recovery is needed. The
/// lock file itself is left in place; removing it would let a racing process
/// lock an unlinked inode.
#[derive(Debug)]
pub struct PrimaryLease {
    lock: Flock<File>,
    path: PathBuf,
}

impl PrimaryLease {
    /// Path of the lock object.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Releases the lock, reporting any failure.
    pub fn release(self) -> Result<(), ArbiterError> {
        let Self { lock, path } = self;
        match lock.unlock() {
            Ok(_file) => {
                info!(
                    target: ARBITER_TARGET,
                    file = %path.display(),
                    "released instance lock"
                );
                Ok(())
            }
            Err((_lock, source)) => Err(ArbiterError::Release { path, source }),
        }
    }

    fn record_owner(&self) -> io::Result<()> {
        let mut file: &File = &self.lock;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()
    }
}

/// Elects the primary process for one lock name.
#[derive(Debug, Clone)]
pub struct InstanceArbiter {
    path: PathBuf,
}

impl InstanceArbiter {
    /// Builds an arbiter for the lock object at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Attempts to become the primary instance without blocking.
    ///
    /// Contention on the lock yields [`Role::Secondary`]; any other failure is
    /// returned so the caller can abort initialisation.
    pub fn elect(&self, requested: Action) -> Result<Role, ArbiterError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&self.path)
            .map_err(|source| ArbiterError::Create {
                path: self.path.clone(),
                source,
            })?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                let lease = PrimaryLease {
                    lock,
                    path: self.path.clone(),
                };
                if let Err(error) = lease.record_owner() {
                    debug!(
                        target: ARBITER_TARGET,
                        error = %error,
                        "could not record owner pid in lock file"
                    );
                }
                info!(
                    target: ARBITER_TARGET,
                    file = %self.path.display(),
                    action = %requested,
                    "elected primary instance"
                );
                Ok(Role::Primary(lease))
            }
            Err((_file, errno)) if errno == Errno::EWOULDBLOCK => {
                info!(
                    target: ARBITER_TARGET,
                    file = %self.path.display(),
                    action = %requested,
                    "instance lock held elsewhere; acting as secondary"
                );
                Ok(Role::Secondary)
            }
            Err((_file, source)) => Err(ArbiterError::Lock {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
