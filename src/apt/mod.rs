//! Package management inside the root.
//!
//! [`PackageManager`] writes APT sources, imports signing keys and
//! accumulates install/purge marks which [`PackageManager::commit`] applies
//! through a [`PackageBackend`]. Each commit runs with the virtual
//! filesystems mounted.

pub mod apt_get;
pub mod backend;
pub mod keys;
pub mod progress;
pub mod sources;

use std::fs::File;
use std::io;
use tracing::{debug, info};

use crate::chroot::ChrootEnvironment;
use crate::config::AptConfig;
use crate::error::{Error, Result};

pub use apt_get::AptGetBackend;
pub use backend::{BackendSettings, PackageBackend, Transaction, TransactionSummary};
pub use progress::{AcquireItem, AcquireObserver, AcquireProgress};

use keys::KeyPlan;
use progress::{human_size, human_size_signed};

/// APT session bound to one chroot.
pub struct PackageManager<'c, B: PackageBackend> {
    chroot: &'c ChrootEnvironment,
    config: AptConfig,
    backend: B,
    progress: AcquireProgress,
    pending: Transaction,
}

impl<'c, B: PackageBackend> PackageManager<'c, B> {
    /// Write provisional sources, attach the backend, sync indices and
    /// import keys.
    pub fn new(
        chroot: &'c ChrootEnvironment,
        config: &AptConfig,
        quiet: bool,
        backend: B,
    ) -> Result<Self> {
        if config.sources.is_empty() {
            return Err(Error::Configuration(
                "apt configuration defines no sources".into(),
            ));
        }

        let mut apt = Self {
            chroot,
            config: config.clone(),
            backend,
            progress: AcquireProgress::new(quiet),
            pending: Transaction::default(),
        };

        apt.sources_list(false, apt.config.src)?;

        let settings = BackendSettings {
            architecture: chroot.architecture().to_string(),
            rootdir: chroot.rootdir().to_path_buf(),
            overrides: apt.config.conf.clone(),
        };
        println!(
            "APT ARCH {} ROOT {}",
            settings.architecture,
            settings.rootdir.display()
        );
        apt.backend.attach(&settings)?;

        apt.update()?;
        apt.key(apt.config.key.disable)?;
        Ok(apt)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Marks not yet committed.
    pub fn transaction(&self) -> &Transaction {
        &self.pending
    }

    /// Write `sources.list` and one list file per source.
    ///
    /// With `final_uri`, sources that define a final URI use it instead of
    /// the build URI.
    pub fn sources_list(&self, final_uri: bool, src: bool) -> Result<()> {
        sources::write_sources(self.chroot.rootdir(), &self.config.sources, final_uri, src)
    }

    /// Import signing keys and install keyring packages.
    ///
    /// Indices are synced again if any key material was processed.
    pub fn key(&mut self, disable: bool) -> Result<()> {
        if disable {
            debug!("apt key handling disabled");
            return Ok(());
        }

        let plan = KeyPlan::collect(&self.config.sources);

        for path in &plan.files {
            self.import_key_file(path)?;
        }
        if let Some(args) = plan.recv_args(&self.config.key.server) {
            self.chroot.cmd(&keys::gpg_argv(&args))?;
        }
        if let Some(args) = plan.fetch_args() {
            self.chroot.cmd(&keys::gpg_argv(&args))?;
        }
        if !plan.keyrings.is_empty() {
            self.install(&plan.keyrings, true)?;
        }

        if !plan.is_empty() {
            self.update()?;
        }
        Ok(())
    }

    /// Copy a host key file into the root and import it there.
    fn import_key_file(&self, path: &std::path::Path) -> Result<()> {
        let rootdir = self.chroot.rootdir();
        let mut copy =
            tempfile::NamedTempFile::new_in(rootdir).map_err(|e| Error::write(rootdir, e))?;
        let mut source = File::open(path).map_err(|e| {
            Error::Configuration(format!("gpg key {}: {e}", path.display()))
        })?;
        io::copy(&mut source, copy.as_file_mut()).map_err(|e| Error::write(copy.path(), e))?;
        copy.as_file().sync_all().map_err(|e| Error::write(copy.path(), e))?;

        let rel = self.chroot.chroot_path_rel(copy.path());
        let rel = rel.to_string_lossy();
        self.chroot.cmd(&keys::gpg_argv(&["--import", &*rel]))
    }

    /// Synchronize package indices, then reload the package database.
    pub fn update(&mut self) -> Result<()> {
        println!("APT UPDATE");
        self.backend.update(&mut self.progress)?;
        self.open()
    }

    /// Reload the package database.
    pub fn open(&mut self) -> Result<()> {
        println!("APT CACHE");
        self.backend.open()
    }

    pub fn install<S: AsRef<str>>(&mut self, names: &[S], commit: bool) -> Result<()> {
        for name in names {
            self.pending.mark_install(name.as_ref());
        }
        if commit {
            self.commit()?;
        }
        Ok(())
    }

    /// Mark for removal including configuration files.
    pub fn purge<S: AsRef<str>>(&mut self, names: &[S], commit: bool) -> Result<()> {
        for name in names {
            self.pending.mark_purge(name.as_ref());
        }
        if commit {
            self.commit()?;
        }
        Ok(())
    }

    pub fn dist_upgrade(&mut self, commit: bool) -> Result<()> {
        self.pending.dist_upgrade = true;
        if commit {
            self.commit()?;
        }
        Ok(())
    }

    /// Totals for the marks not yet committed.
    pub fn pending(&mut self) -> Result<TransactionSummary> {
        self.backend.summarize(&self.pending)
    }

    /// Package actions the pending marks would cause.
    pub fn changes(&mut self) -> Result<Vec<String>> {
        self.backend.changes(&self.pending)
    }

    pub fn installed(&self) -> Vec<String> {
        self.backend.installed()
    }

    /// Apply pending marks with the virtual filesystems mounted, then
    /// reload the package database.
    ///
    /// Marks are consumed whether or not the commit succeeds.
    pub fn commit(&mut self) -> Result<()> {
        let tx = std::mem::take(&mut self.pending);
        let summary = self.backend.summarize(&tx)?;

        println!(
            "APT COMMIT INSTALL {} DELETE {} GET {} REQ {}",
            summary.install_count,
            summary.delete_count,
            human_size(summary.download_bytes),
            human_size_signed(summary.required_space)
        );

        let chroot = self.chroot;
        let backend = &mut self.backend;
        let progress = &mut self.progress;
        chroot.with_virtfs(|| backend.commit(&tx, progress))?;

        info!(
            "apt commit: {} installed, {} removed",
            summary.install_count, summary.delete_count
        );
        self.open()
    }

    /// Point sources at their final URIs for the shipped image.
    pub fn deinit(&self) -> Result<()> {
        self.sources_list(true, false)
    }
}
