// tests/common/mod.rs

//! Shared fakes for integration tests.
//!
//! [`FakeRunner`] records every invocation and emulates the external tools
//! the builder drives: `mount`/`umount` edit a fake mount table file,
//! `dpkg-divert` renames files, the bootstrap tools lay out a skeleton root
//! and the archivers create their output file. [`MockBackend`] is an
//! in-memory package database.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use live_builder::apt::{
    AcquireItem, AcquireObserver, BackendSettings, PackageBackend, Transaction, TransactionSummary,
};
use live_builder::chroot::mounts::nested_mounts;
use live_builder::chroot::DIVERSIONS;
use live_builder::process::{CommandResult, CommandRunner, Invocation};
use live_builder::{BuildConfig, ChrootEnvironment, Error, Result};
use tempfile::TempDir;

/// Content of the binaries the fake bootstrap installs at diversion paths.
pub const ORIGINAL_BINARY: &str = "#!/bin/sh\n# original\nexit 0\n";

pub const CONFIG: &str = r#"
[chroot]
hostname = "siduction"

[chroot.bootstrap]
bootstrapper = "debootstrap"
uri = "http://deb.debian.org/debian"
suite = "sid"

[apt.sources.main]
uri = "http://deb.debian.org/debian"
final_uri = "http://ftp.debian.org/debian"
suites = ["sid"]
components = ["main"]
description = "Debian GNU/Linux"
"#;

#[derive(Default)]
struct FakeState {
    log: Vec<Invocation>,
    failing: Vec<String>,
}

/// Recording runner emulating mount, diversion and archiver tools.
#[derive(Clone)]
pub struct FakeRunner {
    state: Arc<Mutex<FakeState>>,
    mount_table: PathBuf,
}

impl FakeRunner {
    /// Create a runner backed by an empty mount table at `mount_table`.
    pub fn new(mount_table: &Path) -> Self {
        fs::write(mount_table, "").unwrap();
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            mount_table: mount_table.to_path_buf(),
        }
    }

    /// Make every later invocation of `program` exit 1.
    pub fn fail_program(&self, program: &str) {
        self.state.lock().unwrap().failing.push(program.to_string());
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(Invocation::command_line)
            .collect()
    }

    /// Invocations of `program`, in order.
    pub fn calls(&self, program: &str) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|inv| inv.program() == program)
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    pub fn mount_table(&self) -> String {
        fs::read_to_string(&self.mount_table).unwrap()
    }

    /// Mount points currently recorded at or below `root`.
    pub fn mounted_under(&self, root: &Path) -> Vec<PathBuf> {
        nested_mounts(&self.mount_table(), root)
    }

    fn mount(&self, args: &[String]) -> CommandResult {
        match args {
            [t, fstype, source, target] if t == "-t" => {
                let mut table = self.mount_table();
                table.push_str(&format!("{source} {target} {fstype} rw 0 0\n"));
                fs::write(&self.mount_table, table).unwrap();
                CommandResult::success("")
            }
            _ => CommandResult::failed(1),
        }
    }

    /// Pops the most recent mount at `target`, one layer per call.
    fn umount(&self, args: &[String]) -> CommandResult {
        let [target] = args else {
            return CommandResult::failed(1);
        };
        let table = self.mount_table();
        let mut lines: Vec<&str> = table.lines().collect();
        let Some(at) = lines
            .iter()
            .rposition(|line| line.split_whitespace().nth(1) == Some(target.as_str()))
        else {
            return CommandResult::failed(32);
        };
        lines.remove(at);

        let mut text = lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        fs::write(&self.mount_table, text).unwrap();
        CommandResult::success("")
    }

    fn dpkg_divert(&self, root: &Path, args: &[String]) -> CommandResult {
        let Some(path) = args.last() else {
            return CommandResult::failed(2);
        };
        let in_root = |p: &str| root.join(p.trim_start_matches('/'));

        if args.iter().any(|a| a == "--add") {
            let divert = args
                .iter()
                .position(|a| a == "--divert")
                .and_then(|i| args.get(i + 1))
                .cloned()
                .unwrap_or_else(|| format!("{path}.distrib"));
            if in_root(path).exists() {
                fs::rename(in_root(path), in_root(&divert)).unwrap();
            }
        } else if args.iter().any(|a| a == "--remove") {
            let diverted = in_root(&format!("{path}.REAL"));
            if diverted.exists() {
                fs::rename(diverted, in_root(path)).unwrap();
            }
        }
        CommandResult::success("")
    }

    fn bootstrap(&self, args: &[String]) -> CommandResult {
        let root = PathBuf::from(&args[args.len() - 2]);
        for dir in ["etc", "tmp", "usr/bin", "var/lib/dpkg"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        for path in DIVERSIONS {
            let target = root.join(path.trim_start_matches('/'));
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::write(target, ORIGINAL_BINARY).unwrap();
        }
        CommandResult::success("")
    }

    fn archive(&self, root: &Path, output: &str) -> CommandResult {
        let target = root.join(output);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(target, "image").unwrap();
        CommandResult::success("")
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, invocation: &Invocation) -> CommandResult {
        {
            let mut state = self.state.lock().unwrap();
            state.log.push(invocation.clone());
            if state.failing.iter().any(|p| p == invocation.program()) {
                return CommandResult::failed(1);
            }
        }

        let args = invocation.get_args();
        let root = invocation.root().map(Path::to_path_buf);

        match (invocation.program(), root) {
            ("mount", None) => self.mount(args),
            ("umount", None) => self.umount(args),
            ("debootstrap" | "cdebootstrap", None) => self.bootstrap(args),
            ("dpkg-divert", Some(root)) => self.dpkg_divert(&root, args),
            ("tar", Some(root)) => {
                let at = args.iter().position(|a| a == "-f").unwrap();
                self.archive(&root, &args[at + 1])
            }
            ("mksquashfs", Some(root)) => self.archive(&root, &args[1]),
            _ => CommandResult::success(""),
        }
    }
}

#[derive(Default)]
pub struct MockState {
    pub settings: Option<BackendSettings>,
    pub installed: BTreeSet<String>,
    pub updates: usize,
    pub opens: usize,
    pub commits: Vec<Transaction>,
    /// Mount points present under the root while each commit ran.
    pub mounts_during_commit: Vec<Vec<PathBuf>>,
    pub fail_commit: bool,
}

/// In-memory package database.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    mount_table: Option<PathBuf>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the mounts in `table` whenever a commit runs.
    pub fn watching(mut self, table: &Path) -> Self {
        self.mount_table = Some(table.to_path_buf());
        self
    }

    pub fn failing_commit(self) -> Self {
        self.state.lock().unwrap().fail_commit = true;
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl PackageBackend for MockBackend {
    fn attach(&mut self, settings: &BackendSettings) -> Result<()> {
        self.state().settings = Some(settings.clone());
        Ok(())
    }

    fn update(&mut self, progress: &mut dyn AcquireObserver) -> Result<()> {
        progress.start();
        progress.ims_hit(&AcquireItem::new("http://deb.debian.org/debian sid InRelease"));
        progress.stop();
        self.state().updates += 1;
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        self.state().opens += 1;
        Ok(())
    }

    fn summarize(&mut self, tx: &Transaction) -> Result<TransactionSummary> {
        let state = self.state();
        let install_count = tx
            .install
            .iter()
            .filter(|p| !state.installed.contains(*p))
            .count() as u64;
        let delete_count = tx
            .purge
            .iter()
            .filter(|p| state.installed.contains(*p))
            .count() as u64;
        Ok(TransactionSummary {
            install_count,
            delete_count,
            download_bytes: install_count * 1000,
            required_space: (install_count as i64 - delete_count as i64) * 4000,
        })
    }

    fn changes(&mut self, tx: &Transaction) -> Result<Vec<String>> {
        let mut changes: Vec<String> = tx.install.iter().map(|p| format!("Inst {p}")).collect();
        changes.extend(tx.purge.iter().map(|p| format!("Purg {p}")));
        Ok(changes)
    }

    fn commit(&mut self, tx: &Transaction, progress: &mut dyn AcquireObserver) -> Result<()> {
        let mounts = match &self.mount_table {
            Some(table) => {
                let text = fs::read_to_string(table).unwrap();
                let root = self.state().settings.as_ref().unwrap().rootdir.clone();
                nested_mounts(&text, &root)
            }
            None => Vec::new(),
        };

        let mut state = self.state();
        state.mounts_during_commit.push(mounts);
        state.commits.push(tx.clone());
        if state.fail_commit {
            return Err(Error::PackageCommit("dpkg returned an error code (1)".into()));
        }

        progress.start();
        for name in &tx.install {
            progress.fetch(&AcquireItem::new(format!("{name} 1.0")).with_size(1000));
        }
        progress.stop();

        for name in &tx.install {
            state.installed.insert(name.clone());
        }
        for name in &tx.purge {
            state.installed.remove(name);
        }
        Ok(())
    }

    fn installed(&self) -> Vec<String> {
        self.state().installed.iter().cloned().collect()
    }
}

/// Scratch directories, a fake runner and a parsed configuration.
pub struct Fixture {
    pub temp: TempDir,
    pub runner: FakeRunner,
    pub root: PathBuf,
    pub table: PathBuf,
    pub host_etc: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("mounts");
        let host_etc = temp.path().join("host-etc");
        fs::create_dir_all(&host_etc).unwrap();
        fs::write(host_etc.join("hosts"), "127.0.0.1\tlocalhost\n10.0.0.1\tbuildhost\n").unwrap();
        fs::write(host_etc.join("resolv.conf"), "nameserver 10.0.0.53\n").unwrap();

        Self {
            runner: FakeRunner::new(&table),
            root: temp.path().join("root"),
            table,
            host_etc,
            temp,
        }
    }

    pub fn config(&self) -> BuildConfig {
        BuildConfig::from_toml(CONFIG).unwrap()
    }

    pub fn config_with(&self, extra: &str) -> BuildConfig {
        BuildConfig::from_toml(&format!("{CONFIG}\n{extra}\n")).unwrap()
    }

    pub fn chroot(&self, config: &BuildConfig) -> ChrootEnvironment {
        ChrootEnvironment::new(
            &self.root,
            "amd64",
            &config.chroot,
            config.verbosity(),
            Box::new(self.runner.clone()),
        )
        .unwrap()
        .with_host_etc(&self.host_etc)
        .with_mount_table(&self.table)
    }

    /// A chroot whose root has been populated by the fake bootstrap.
    pub fn bootstrapped(&self, config: &BuildConfig) -> ChrootEnvironment {
        let chroot = self.chroot(config);
        chroot.bootstrap().unwrap();
        chroot
    }

    pub fn backend(&self) -> MockBackend {
        MockBackend::new().watching(&self.table)
    }
}
