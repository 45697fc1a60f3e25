//! Error kinds surfaced by the chroot, APT and compression layers.
//!
//! Lower layers (process execution, virtual filesystem mounts) produce these
//! directly; [`crate::chroot`] and [`crate::apt`] add the command line or
//! target path before handing them up. Nothing is downgraded to a warning.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while building a root filesystem image.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration, detected before any process launch.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The bootstrap tool could not be launched or exited non-zero.
    #[error("bootstrap failed: {command}: {reason}")]
    Bootstrap { command: String, reason: String },

    /// A command run inside the root could not be launched or exited non-zero.
    ///
    /// `code` is `None` when the process never started.
    #[error("chrooted command {}: {}", describe_code(.code), join_argv(.argv))]
    ChrootCommand { code: Option<i32>, argv: Vec<String> },

    /// A virtual filesystem could not be mounted.
    #[error("failed to mount virtfs {target}: {reason}")]
    Mount { target: PathBuf, reason: String },

    /// One or more mount points could not be unmounted.
    ///
    /// Every candidate is attempted before this is returned.
    #[error("failed to umount virtfs: {}", describe_unmounts(.failed))]
    Unmount { failed: Vec<(PathBuf, String)> },

    /// Package index synchronization or archive download failed.
    #[error("apt failed to fetch: {0}")]
    PackageFetch(String),

    /// A package transaction could not be applied.
    #[error("apt encountered an error: {0}")]
    PackageCommit(String),

    /// A generated file could not be written.
    #[error("failed to write {path}: {source}")]
    FilesystemWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The root directory could not be removed.
    #[error("failed to nuke chroot {path}: {source}")]
    Teardown {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Fieldless classification of [`Error`], for retry-vs-abort decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Bootstrap,
    ChrootCommand,
    Mount,
    Unmount,
    PackageFetch,
    PackageCommit,
    FilesystemWrite,
    Teardown,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Bootstrap { .. } => ErrorKind::Bootstrap,
            Error::ChrootCommand { .. } => ErrorKind::ChrootCommand,
            Error::Mount { .. } => ErrorKind::Mount,
            Error::Unmount { .. } => ErrorKind::Unmount,
            Error::PackageFetch(_) => ErrorKind::PackageFetch,
            Error::PackageCommit(_) => ErrorKind::PackageCommit,
            Error::FilesystemWrite { .. } => ErrorKind::FilesystemWrite,
            Error::Teardown { .. } => ErrorKind::Teardown,
        }
    }

    /// Shorthand for [`Error::FilesystemWrite`].
    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::FilesystemWrite {
            path: path.into(),
            source,
        }
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("returncode={code}"),
        None => "could not be launched".to_string(),
    }
}

fn join_argv(argv: &[String]) -> String {
    argv.join(" ")
}

fn describe_unmounts(failed: &[(PathBuf, String)]) -> String {
    failed
        .iter()
        .map(|(mnt, reason)| format!("{} ({})", mnt.display(), reason))
        .collect::<Vec<_>>()
        .join(", ")
}
