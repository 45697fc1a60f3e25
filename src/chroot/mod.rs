//! Chroot lifecycle: bootstrap, configure, run commands inside, tear down.
//!
//! ```text
//! new() ─> bootstrap() ─> init() ─> cmd()* ─> deinit() ─> nuke()
//!                          │                    │           │
//!                          │ diversions +       │ reverse   │ skipped when
//!                          │ identity files     │ of init() │ `preserve` is set
//! ```
//!
//! Every command run inside the root is bracketed by mounting the virtual
//! filesystems and sweeping every mount under the root afterwards; see
//! [`mounts::VirtualMountSet`].

pub mod bootstrap;
pub mod files;
pub mod mounts;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{BootstrapConfig, ChrootConfig, Verbosity};
use crate::error::{Error, Result};
use crate::process::{CommandRunner, Invocation};

pub use bootstrap::Bootstrapper;
pub use files::DIVERSIONS;
pub use mounts::VirtualMountSet;

/// Host files copied into the root for the duration of the build.
pub const HOST_FILES: [&str; 2] = ["/etc/hosts", "/etc/resolv.conf"];

/// Identity files generated from templates by [`ChrootEnvironment::init`].
pub const GENERATED_FILES: [&str; 3] = ["/etc/fstab", "/etc/hostname", "/etc/network/interfaces"];

const DEBCONF_SET_SELECTIONS: &str = "/usr/bin/debconf-set-selections";
const MANDB: &str = "/usr/bin/mandb";

/// A target root directory and everything done to it.
pub struct ChrootEnvironment {
    rootdir: PathBuf,
    architecture: String,
    hostname: String,
    preserve: bool,
    bootstrap: BootstrapConfig,
    verbosity: Verbosity,
    host_etc: PathBuf,
    virtfs: VirtualMountSet,
    runner: Box<dyn CommandRunner>,
}

impl ChrootEnvironment {
    /// Create an environment for `rootdir`, which need not exist yet.
    ///
    /// `architecture` is the target architecture, not the host's.
    pub fn new(
        rootdir: &Path,
        architecture: &str,
        config: &ChrootConfig,
        verbosity: Verbosity,
        runner: Box<dyn CommandRunner>,
    ) -> Result<Self> {
        if rootdir.as_os_str().is_empty() {
            return Err(Error::Configuration("rootdir must be specified".into()));
        }
        if architecture.trim().is_empty() {
            return Err(Error::Configuration("architecture must be specified".into()));
        }
        if config.hostname.trim().is_empty() {
            return Err(Error::Configuration("hostname must not be empty".into()));
        }

        let rootdir = canonical_root(rootdir)?;

        Ok(Self {
            virtfs: VirtualMountSet::new(&rootdir),
            rootdir,
            architecture: architecture.to_string(),
            hostname: config.hostname.clone(),
            preserve: config.preserve,
            bootstrap: config.bootstrap.clone(),
            verbosity,
            host_etc: PathBuf::from("/etc"),
            runner,
        })
    }

    /// Copy `hosts` and `resolv.conf` from `dir` instead of the host's `/etc`.
    pub fn with_host_etc(mut self, dir: &Path) -> Self {
        self.host_etc = dir.to_path_buf();
        self
    }

    /// Consult `table` instead of `/proc/mounts` when sweeping mounts.
    pub fn with_mount_table(mut self, table: &Path) -> Self {
        self.virtfs = self.virtfs.with_mount_table(table);
        self
    }

    pub fn rootdir(&self) -> &Path {
        &self.rootdir
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn preserve(&self) -> bool {
        self.preserve
    }

    pub fn virtfs(&self) -> &VirtualMountSet {
        &self.virtfs
    }

    /// Host-side location of an in-root path.
    pub fn chroot_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.rootdir
            .join(path.strip_prefix("/").unwrap_or(path))
    }

    /// In-root path of a host-side location under the root.
    ///
    /// Paths outside the root are returned unchanged.
    pub fn chroot_path_rel(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match path.strip_prefix(&self.rootdir) {
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => path.to_path_buf(),
        }
    }

    /// Populate the root with a minimal OS tree.
    pub fn bootstrap(&self) -> Result<()> {
        let (tool, inv) = bootstrap::bootstrap_invocation(
            &self.bootstrap,
            &self.architecture,
            &self.rootdir,
            self.verbosity,
        )?;

        println!("{}", inv.command_line());
        let result = self.runner.run(&inv);
        if !result.is_success() {
            return Err(Error::Bootstrap {
                command: inv.command_line(),
                reason: result.reason(),
            });
        }

        if tool.leaves_helper_package() {
            self.cmd(&["dpkg", "--purge", bootstrap::CDEBOOTSTRAP_HELPER])?;
        }

        Ok(())
    }

    /// Prepare the root for package installation.
    pub fn init(&self) -> Result<()> {
        for fname in HOST_FILES {
            let target = self.chroot_path(fname);
            files::remove_if_present(&target)?;
            let source = self.host_etc.join(fname.trim_start_matches("/etc/"));
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::write(parent, e))?;
            }
            fs::copy(&source, &target).map_err(|e| Error::write(&target, e))?;
        }

        for fname in GENERATED_FILES {
            self.create_file(fname)?;
        }

        for fname in DIVERSIONS {
            let diverted = format!("{fname}{}", files::DIVERTED_SUFFIX);
            self.cmd(&[
                "dpkg-divert",
                "--add",
                "--local",
                "--divert",
                &diverted,
                "--rename",
                fname,
            ])?;
            self.create_file(fname)?;
        }

        self.debconf_set_selections(&["man-db man-db/auto-update boolean false"])?;
        info!("chroot initialised: {}", self.rootdir.display());
        Ok(())
    }

    /// Undo [`init`](Self::init) and make final configurations.
    pub fn deinit(&self) -> Result<()> {
        for fname in HOST_FILES {
            // May be a symlink to an absolute path; never clobber the host.
            if self.chroot_path(fname).is_symlink() {
                continue;
            }
            self.create_file(fname)?;
        }

        for fname in DIVERSIONS {
            let stub = self.chroot_path(fname);
            fs::remove_file(&stub).map_err(|e| Error::write(&stub, e))?;
            self.cmd(&["dpkg-divert", "--remove", "--rename", fname])?;
        }

        self.debconf_set_selections(&["man-db man-db/auto-update boolean true"])?;
        if self.chroot_path(MANDB).exists() {
            self.cmd(&[MANDB, "--create", "--quiet"])?;
        }

        info!("chroot deinitialised: {}", self.rootdir.display());
        Ok(())
    }

    /// Pre-seed debconf answers; skipped when the tool is absent.
    pub fn debconf_set_selections(&self, selections: &[&str]) -> Result<()> {
        if !self.chroot_path(DEBCONF_SET_SELECTIONS).exists() {
            debug!("{} not present, skipping selections", DEBCONF_SET_SELECTIONS);
            return Ok(());
        }

        let mut file = tempfile::NamedTempFile::new_in(&self.rootdir)
            .map_err(|e| Error::write(&self.rootdir, e))?;
        for line in selections {
            writeln!(file, "{line}").map_err(|e| Error::write(file.path(), e))?;
        }
        file.flush().map_err(|e| Error::write(file.path(), e))?;

        let rel = self.chroot_path_rel(file.path());
        self.cmd(&[DEBCONF_SET_SELECTIONS, &rel.to_string_lossy()])
    }

    /// Write the generated content for an in-root path.
    pub fn create_file(&self, fname: &str) -> Result<()> {
        let (content, mode) = files::generated(fname, &self.hostname);
        files::write_file_mode(&self.chroot_path(fname), &content, mode)
    }

    /// Run a command inside the root.
    pub fn cmd<S: AsRef<str>>(&self, argv: &[S]) -> Result<()> {
        self.run_in_root(argv, false).map(|_| ())
    }

    /// Run a command inside the root and return its standard output.
    pub fn cmd_output<S: AsRef<str>>(&self, argv: &[S]) -> Result<String> {
        self.run_in_root(argv, true)
    }

    fn run_in_root<S: AsRef<str>>(&self, argv: &[S], capture: bool) -> Result<String> {
        let argv_owned: Vec<String> = argv.iter().map(|a| a.as_ref().to_string()).collect();
        let mut inv = Invocation::from_argv(&argv_owned)
            .ok_or_else(|| Error::Configuration("empty command".into()))?
            .rooted(&self.rootdir);
        if capture {
            inv = inv.capture();
        }

        println!("chroot {} {}", self.rootdir.display(), inv.command_line());

        self.virtfs.scoped(self.runner.as_ref(), || {
            let result = self.runner.run(&inv);
            if result.is_success() {
                Ok(result.stdout)
            } else {
                debug!("{}: {}", inv.command_line(), result.reason());
                Err(Error::ChrootCommand {
                    code: result.code(),
                    argv: argv_owned.clone(),
                })
            }
        })
    }

    /// Run `f` with the virtual filesystems mounted, sweeping afterwards.
    pub fn with_virtfs<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.virtfs.scoped(self.runner.as_ref(), f)
    }

    pub fn mount_virtfs(&self) -> Result<()> {
        self.virtfs.mount(self.runner.as_ref())
    }

    /// Unmount every mount point under the root, deepest first.
    pub fn unmount_virtfs(&self) -> Result<()> {
        self.virtfs.unmount(self.runner.as_ref())
    }

    /// Unmount everything under the root and remove it.
    ///
    /// Does nothing when `preserve` is set or the root does not exist.
    /// Nothing is removed while a mount remains under the root.
    pub fn nuke(&self) -> Result<()> {
        if self.preserve {
            info!("preserving chroot: {}", self.rootdir.display());
            return Ok(());
        }
        if !self.rootdir.exists() {
            return Ok(());
        }

        self.unmount_virtfs()?;
        if self.rootdir.is_dir() {
            info!("removing chroot: {}", self.rootdir.display());
            fs::remove_dir_all(&self.rootdir).map_err(|e| Error::Teardown {
                path: self.rootdir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}

/// Absolute, symlink-resolved path of `rootdir`, which may not exist yet.
fn canonical_root(rootdir: &Path) -> Result<PathBuf> {
    if let Ok(path) = fs::canonicalize(rootdir) {
        return Ok(path);
    }
    let absolute = std::path::absolute(rootdir)
        .map_err(|e| Error::Configuration(format!("rootdir {}: {e}", rootdir.display())))?;
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => match fs::canonicalize(parent) {
            Ok(parent) => Ok(parent.join(name)),
            Err(_) => Ok(absolute),
        },
        _ => Ok(absolute),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandResult, SystemRunner};
    use tempfile::TempDir;

    struct Refuse;

    impl CommandRunner for Refuse {
        fn run(&self, _invocation: &Invocation) -> CommandResult {
            CommandResult::launch_failed("not permitted in tests")
        }
    }

    fn chroot_config(preserve: bool) -> ChrootConfig {
        ChrootConfig {
            hostname: "siduction".into(),
            preserve,
            bootstrap: BootstrapConfig {
                bootstrapper: "debootstrap".into(),
                uri: "http://deb.debian.org/debian".into(),
                suite: "sid".into(),
                flavour: "minimal".into(),
                include: Vec::new(),
                exclude: Vec::new(),
            },
        }
    }

    fn env(root: &Path, preserve: bool) -> ChrootEnvironment {
        ChrootEnvironment::new(
            root,
            "amd64",
            &chroot_config(preserve),
            Verbosity::default(),
            Box::new(SystemRunner),
        )
        .unwrap()
    }

    #[test]
    fn test_chroot_path_round_trip() {
        let temp = TempDir::new().unwrap();
        let chroot = env(&temp.path().join("root"), false);

        for p in ["/etc/hosts", "/usr/sbin/policy-rc.d", "/tmp/excludes", "/"] {
            let host = chroot.chroot_path(p);
            assert!(host.starts_with(chroot.rootdir()));
            assert_eq!(chroot.chroot_path_rel(&host), PathBuf::from(p));
        }
    }

    #[test]
    fn test_chroot_path_accepts_relative() {
        let temp = TempDir::new().unwrap();
        let chroot = env(&temp.path().join("root"), false);
        assert_eq!(
            chroot.chroot_path("tmp/squash.xz"),
            chroot.rootdir().join("tmp/squash.xz")
        );
    }

    #[test]
    fn test_rootdir_is_canonical_before_it_exists() {
        let temp = TempDir::new().unwrap();
        let chroot = env(&temp.path().join("a/../root"), false);
        let expected = fs::canonicalize(temp.path()).unwrap().join("root");
        assert_eq!(chroot.rootdir(), expected);
    }

    #[test]
    fn test_missing_architecture_is_configuration_error() {
        let temp = TempDir::new().unwrap();
        let err = ChrootEnvironment::new(
            temp.path(),
            "",
            &chroot_config(false),
            Verbosity::default(),
            Box::new(SystemRunner),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn test_nuke_missing_root_is_noop() {
        let temp = TempDir::new().unwrap();
        let chroot = env(&temp.path().join("never-created"), false);
        chroot.nuke().unwrap();
    }

    #[test]
    fn test_nuke_respects_preserve() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("etc")).unwrap();

        env(&root, true).nuke().unwrap();
        assert!(root.join("etc").is_dir());
    }

    #[test]
    fn test_bootstrap_launch_failure_is_bootstrap_error() {
        let temp = TempDir::new().unwrap();
        let chroot = ChrootEnvironment::new(
            &temp.path().join("root"),
            "amd64",
            &chroot_config(false),
            Verbosity::default(),
            Box::new(Refuse),
        )
        .unwrap();

        let err = chroot.bootstrap().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Bootstrap);
        assert!(err.to_string().contains("debootstrap --variant=minbase"));
    }

    #[test]
    fn test_debconf_skipped_without_tool() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let chroot = ChrootEnvironment::new(
            &root,
            "amd64",
            &chroot_config(false),
            Verbosity::default(),
            Box::new(Refuse),
        )
        .unwrap();

        chroot
            .debconf_set_selections(&["man-db man-db/auto-update boolean false"])
            .unwrap();
    }
}
