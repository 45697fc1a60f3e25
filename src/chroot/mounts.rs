//! Virtual filesystem mounts beneath a chroot.
//!
//! `proc`, `sysfs` and `devpts` are mounted with `mount(8)` before a command
//! runs in the root and swept away afterwards. The sweep reads the kernel
//! mount table rather than reversing what was mounted, so mounts created by
//! tooling inside the root are released too.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process::{CommandRunner, Invocation};

/// Kernel mount table consulted by the unmount sweep.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// `(filesystem type, in-root mount point)` for every virtual filesystem.
pub const VIRTFS: &[(&str, &str)] = &[("proc", "proc"), ("sysfs", "sys"), ("devpts", "dev/pts")];

/// The set of virtual filesystem mounts under one root directory.
#[derive(Debug, Clone)]
pub struct VirtualMountSet {
    root: PathBuf,
    mount_table: PathBuf,
}

impl VirtualMountSet {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            mount_table: PathBuf::from(PROC_MOUNTS),
        }
    }

    /// Read mounts from `table` instead of [`PROC_MOUNTS`].
    pub fn with_mount_table(mut self, table: &Path) -> Self {
        self.mount_table = table.to_path_buf();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every mount at or below the root, deepest first.
    ///
    /// A mount point appears once per stacked mount.
    pub fn mounted(&self) -> Result<Vec<PathBuf>> {
        let table = fs::read_to_string(&self.mount_table).map_err(|e| Error::Unmount {
            failed: vec![(self.mount_table.clone(), format!("reading mount table: {e}"))],
        })?;
        Ok(nested_mounts(&table, &self.root))
    }

    /// Mount `proc`, `sysfs` and `devpts`, skipping any already mounted.
    pub fn mount(&self, runner: &dyn CommandRunner) -> Result<()> {
        let table = fs::read_to_string(&self.mount_table).map_err(|e| Error::Mount {
            target: self.root.clone(),
            reason: format!("reading {}: {e}", self.mount_table.display()),
        })?;
        let active = nested_mounts(&table, &self.root);

        for (vfstype, mnt) in VIRTFS {
            let target = self.root.join(mnt);
            if active.contains(&target) {
                debug!("{} already mounted", target.display());
                continue;
            }
            fs::create_dir_all(&target).map_err(|e| Error::Mount {
                target: target.clone(),
                reason: format!("creating mount point: {e}"),
            })?;

            let result = runner.run(
                &Invocation::new("mount")
                    .args(["-t", vfstype, "none"])
                    .arg_path(&target),
            );
            if !result.is_success() {
                return Err(Error::Mount {
                    target,
                    reason: result.reason(),
                });
            }
        }

        Ok(())
    }

    /// Unmount everything at or below the root, deepest first.
    ///
    /// Every candidate is attempted; failures are collected and returned
    /// together once the sweep is done. Anything still listed under the
    /// root afterwards is reported as a failure too.
    pub fn unmount(&self, runner: &dyn CommandRunner) -> Result<()> {
        let mut failed = Vec::new();

        for mnt in self.mounted()? {
            let result = runner.run(&Invocation::new("umount").arg_path(&mnt));
            if !result.is_success() {
                warn!("failed to umount {}: {}", mnt.display(), result.reason());
                failed.push((mnt, result.reason()));
            }
        }

        if failed.is_empty() {
            failed = self
                .mounted()?
                .into_iter()
                .map(|mnt| (mnt, "still mounted after sweep".to_string()))
                .collect();
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Unmount { failed })
        }
    }

    /// Mount, returning a guard that unmounts when released or dropped.
    ///
    /// If mounting fails part way, whatever was mounted is swept before the
    /// mount error is returned.
    pub fn acquire<'a>(&'a self, runner: &'a dyn CommandRunner) -> Result<VirtfsGuard<'a>> {
        if let Err(e) = self.mount(runner) {
            if let Err(sweep) = self.unmount(runner) {
                warn!("cleanup after failed mount: {}", sweep);
            }
            return Err(e);
        }
        Ok(VirtfsGuard {
            set: self,
            runner,
            released: false,
        })
    }

    /// Run `f` with the virtual filesystems mounted.
    ///
    /// The unmount sweep runs on every exit path. An error from `f` takes
    /// precedence over an unmount error, which is then only logged.
    pub fn scoped<T>(
        &self,
        runner: &dyn CommandRunner,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let guard = self.acquire(runner)?;
        let result = f();
        let released = guard.release();

        match (result, released) {
            (Err(e), Err(sweep)) => {
                warn!("{}", sweep);
                Err(e)
            }
            (Ok(_), Err(sweep)) => Err(sweep),
            (result, Ok(())) => result,
        }
    }
}

/// Mounted virtual filesystems; released explicitly or on drop.
pub struct VirtfsGuard<'a> {
    set: &'a VirtualMountSet,
    runner: &'a dyn CommandRunner,
    released: bool,
}

impl VirtfsGuard<'_> {
    /// Unmount now, reporting failures.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.set.unmount(self.runner)
    }
}

impl Drop for VirtfsGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.set.unmount(self.runner) {
                warn!("{}", e);
            }
        }
    }
}

/// Mount points from a `/proc/mounts`-format table at or below `root`,
/// ordered deepest first. Each table line is one mount to undo, so a
/// stacked mount point is listed once per layer.
pub fn nested_mounts(table: &str, root: &Path) -> Vec<PathBuf> {
    let mut mounts: Vec<PathBuf> = table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|mnt| PathBuf::from(unescape_mount_field(mnt)))
        .filter(|mnt| mnt.starts_with(root))
        .collect();

    mounts.sort_by_key(|mnt| std::cmp::Reverse(mnt.components().count()));
    mounts
}

/// Decode the octal escapes (`\040` for space etc.) used in mount tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
