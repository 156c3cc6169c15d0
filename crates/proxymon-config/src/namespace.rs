//! Derives the names of the cross-process objects shared by every invocation.
//!
//! The namespace directory plays the role of a kernel object namespace: the
//! instance lock lives at `<namespace>/<base>.lock` and each command signal at
//! `<namespace>/<base><suffix>`. Primary and secondary processes must agree on
//! this layout, so both derive it from the same [`Config`].

use std::fs::DirBuilder;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Config;

/// Canonical paths of the named objects for one instance name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedObjects {
    namespace_dir: PathBuf,
    base_name: String,
    mutex_path: PathBuf,
}

impl NamedObjects {
    /// Derives the object names from the configuration and ensures the
    /// namespace directory exists with restrictive permissions.
    pub fn from_config(config: &Config) -> Result<Self, NamespaceError> {
        let objects = Self::new(
            config.namespace_dir().into_std_path_buf(),
            config.instance_name(),
        )?;
        objects.prepare_filesystem()?;
        Ok(objects)
    }

    /// Builds the object names without touching the filesystem.
    pub fn new(
        namespace_dir: impl Into<PathBuf>,
        base_name: &str,
    ) -> Result<Self, NamespaceError> {
        validate_base_name(base_name)?;
        let namespace_dir = namespace_dir.into();
        Ok(Self {
            mutex_path: namespace_dir.join(format!("{base_name}.lock")),
            base_name: base_name.to_owned(),
            namespace_dir,
        })
    }

    /// Directory acting as the object namespace.
    #[must_use]
    pub fn namespace_dir(&self) -> &Path {
        self.namespace_dir.as_path()
    }

    /// Base identifier the object names are derived from.
    #[must_use]
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Path of the lock file acting as the instance mutex.
    #[must_use]
    pub fn mutex_path(&self) -> &Path {
        self.mutex_path.as_path()
    }

    /// Path of the signal object named `<base><suffix>`.
    #[must_use]
    pub fn signal_path(&self, suffix: &str) -> PathBuf {
        self.namespace_dir
            .join(format!("{}{suffix}", self.base_name))
    }

    fn prepare_filesystem(&self) -> Result<(), NamespaceError> {
        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }

        if let Err(source) = builder.create(&self.namespace_dir)
            && source.kind() != io::ErrorKind::AlreadyExists
        {
            return Err(NamespaceError::CreateDirectory {
                path: self.namespace_dir.clone(),
                source,
            });
        }
        Ok(())
    }
}

fn validate_base_name(base_name: &str) -> Result<(), NamespaceError> {
    let invalid = base_name.is_empty()
        || base_name == "."
        || base_name == ".."
        || base_name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(NamespaceError::InvalidBaseName {
            name: base_name.to_owned(),
        });
    }
    Ok(())
}

/// Errors raised while deriving the object namespace.
#[derive(Debug, Error)]
pub enum NamespaceError {
    /// The instance name cannot be used as a file name component.
    #[error("instance name '{name}' is not a valid object name")]
    InvalidBaseName {
        /// Rejected instance name.
        name: String,
    },
    /// Creating the namespace directory failed.
    #[error("failed to prepare namespace directory '{}': {source}", path.display())]
    CreateDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn derives_lock_and_signal_names_from_base() {
        let objects =
            NamedObjects::new("/run/user/1000/proxymon", "proxymon").expect("valid base name");
        assert_eq!(
            objects.mutex_path(),
            Path::new("/run/user/1000/proxymon/proxymon.lock")
        );
        assert_eq!(
            objects.signal_path("_Start"),
            Path::new("/run/user/1000/proxymon/proxymon_Start")
        );
        assert_eq!(objects.base_name(), "proxymon");
    }

    #[rstest]
    #[case("")]
    #[case(".")]
    #[case("..")]
    #[case("a/b")]
    #[case("a\\b")]
    fn rejects_names_that_escape_the_namespace(#[case] name: &str) {
        let error = NamedObjects::new("/tmp", name).expect_err("name should be rejected");
        assert!(matches!(error, NamespaceError::InvalidBaseName { .. }));
    }

    #[test]
    fn from_config_creates_the_namespace_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let namespace = dir.path().join("nested").join("ns");
        let config = Config {
            namespace_dir: Some(
                camino::Utf8PathBuf::from_path_buf(namespace.clone()).expect("utf8 temp path"),
            ),
            ..Config::default()
        };
        let objects = NamedObjects::from_config(&config).expect("namespace should prepare");
        assert!(namespace.is_dir());
        assert_eq!(objects.namespace_dir(), namespace.as_path());
    }
}
