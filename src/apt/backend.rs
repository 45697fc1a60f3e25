//! The package backend seam.
//!
//! [`super::PackageManager`] owns policy (sources, keys, what to mark); a
//! [`PackageBackend`] owns mechanism (index sync, dependency resolution,
//! download, unpack). The real backend drives the host's `apt-get` against
//! the alternate root; tests use an in-memory one.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::progress::AcquireObserver;
use crate::error::Result;

/// Settings bound to a backend before the first index sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    /// Target architecture, not the host's.
    pub architecture: String,
    /// Host-side path of the alternate root.
    pub rootdir: PathBuf,
    /// Free-form `key = value` backend options from the `apt.conf` table.
    pub overrides: BTreeMap<String, String>,
}

/// Package marks accumulated between commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    pub install: BTreeSet<String>,
    pub purge: BTreeSet<String>,
    pub dist_upgrade: bool,
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.purge.is_empty() && !self.dist_upgrade
    }

    /// Mark for installation, cancelling any purge mark.
    pub fn mark_install(&mut self, name: &str) {
        self.purge.remove(name);
        self.install.insert(name.to_string());
    }

    /// Mark for purge, cancelling any install mark.
    pub fn mark_purge(&mut self, name: &str) {
        self.install.remove(name);
        self.purge.insert(name.to_string());
    }
}

/// Totals for a pending transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionSummary {
    pub install_count: u64,
    pub delete_count: u64,
    /// Bytes still to download.
    pub download_bytes: u64,
    /// Disk space change in bytes; negative when space is freed.
    pub required_space: i64,
}

impl TransactionSummary {
    pub fn add(&mut self, other: TransactionSummary) {
        self.install_count += other.install_count;
        self.delete_count += other.delete_count;
        self.download_bytes += other.download_bytes;
        self.required_space += other.required_space;
    }
}

/// Package management engine operating on an alternate root.
pub trait PackageBackend {
    /// Bind architecture, root and overrides. Called once, before `update`.
    fn attach(&mut self, settings: &BackendSettings) -> Result<()>;

    /// Synchronize package indices, reporting each fetched item.
    fn update(&mut self, progress: &mut dyn AcquireObserver) -> Result<()>;

    /// (Re)load the package database of the root.
    fn open(&mut self) -> Result<()>;

    /// Resolve `tx` without applying it.
    fn summarize(&mut self, tx: &Transaction) -> Result<TransactionSummary>;

    /// Resolve `tx` and list the resulting package actions, one per line.
    fn changes(&mut self, tx: &Transaction) -> Result<Vec<String>>;

    /// Download and apply `tx`. Called with the virtual filesystems mounted.
    fn commit(&mut self, tx: &Transaction, progress: &mut dyn AcquireObserver) -> Result<()>;

    /// Installed package names as of the last `open`.
    fn installed(&self) -> Vec<String>;
}
