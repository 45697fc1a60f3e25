//! [`PackageBackend`] driving the host's `apt-get` against an alternate root.
//!
//! Every call is the host `apt-get` with `Dir` pointed at the root and
//! `Dpkg::Chroot-Directory` set, so the host's APT resolves and downloads
//! while the root's `dpkg` unpacks and configures. Transaction totals come
//! from `apt-get -s`; the installed set from `dpkg-query --admindir`.

use tracing::debug;

use super::backend::{BackendSettings, PackageBackend, Transaction, TransactionSummary};
use super::progress::{AcquireItem, AcquireObserver};
use crate::error::{Error, Result};
use crate::process::{CommandResult, CommandRunner, Invocation};

/// dpkg database below the root.
const DPKG_ADMINDIR: &str = "var/lib/dpkg";

/// APT backend built on the `apt-get` and `dpkg-query` command line tools.
pub struct AptGetBackend {
    runner: Box<dyn CommandRunner>,
    settings: Option<BackendSettings>,
    installed: Vec<String>,
}

impl AptGetBackend {
    pub fn new(runner: Box<dyn CommandRunner>) -> Self {
        Self {
            runner,
            settings: None,
            installed: Vec::new(),
        }
    }

    fn settings(&self) -> Result<&BackendSettings> {
        self.settings
            .as_ref()
            .ok_or_else(|| Error::Configuration("apt backend used before attach".into()))
    }

    /// `apt-get` with the alternate root options applied.
    pub fn apt_get(&self) -> Result<Invocation> {
        let settings = self.settings()?;
        let root = settings.rootdir.display();

        let mut inv = Invocation::new("apt-get")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .env("LC_ALL", "C")
            .arg("-o")
            .arg(format!("Dir={root}"))
            .arg("-o")
            .arg(format!("APT::Architecture={}", settings.architecture))
            .arg("-o")
            .arg(format!("Dpkg::Chroot-Directory={root}"));

        for (key, value) in &settings.overrides {
            inv = inv.arg("-o").arg(format!("{key}={value}"));
        }
        Ok(inv)
    }

    fn run_captured(&self, inv: Invocation) -> (Invocation, CommandResult) {
        let inv = inv.capture();
        debug!("{}", inv.command_line());
        let result = self.runner.run(&inv);
        (inv, result)
    }

    fn simulate(&self, tx: &Transaction) -> Result<Vec<String>> {
        let mut outputs = Vec::new();
        for command in transaction_commands(tx) {
            let (inv, result) = self.run_captured(self.apt_get()?.arg("-s").args(&command));
            if !result.is_success() {
                return Err(Error::PackageCommit(format!(
                    "{}: {}",
                    inv.command_line(),
                    result.reason()
                )));
            }
            outputs.push(result.stdout);
        }
        Ok(outputs)
    }

    /// Run every command of `tx`, replaying each one's fetch lines once it exits.
    fn run_transaction(&self, tx: &Transaction, progress: &mut dyn AcquireObserver) -> Result<()> {
        for command in transaction_commands(tx) {
            let (inv, result) = self.run_captured(self.apt_get()?.arg("-y").args(&command));
            let failures = replay_progress(&result.stdout, progress);

            if !result.is_success() {
                let message = format!("{}: {}", inv.command_line(), result.reason());
                let fetch_failed = failures > 0
                    || result.stdout.contains("Unable to fetch")
                    || result.stdout.contains("Failed to fetch");
                return Err(if fetch_failed {
                    Error::PackageFetch(message)
                } else {
                    Error::PackageCommit(message)
                });
            }
        }
        Ok(())
    }
}

impl PackageBackend for AptGetBackend {
    fn attach(&mut self, settings: &BackendSettings) -> Result<()> {
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn update(&mut self, progress: &mut dyn AcquireObserver) -> Result<()> {
        let inv = self.apt_get()?.arg("update");
        progress.start();
        let (inv, result) = self.run_captured(inv);
        let failures = replay_progress(&result.stdout, progress);
        progress.stop();

        if !result.is_success() {
            return Err(Error::PackageFetch(format!(
                "{}: {}",
                inv.command_line(),
                result.reason()
            )));
        }
        if failures > 0 {
            return Err(Error::PackageFetch(format!(
                "{failures} index files failed to download"
            )));
        }
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        let settings = self.settings()?;
        let inv = Invocation::new("dpkg-query")
            .arg(format!(
                "--admindir={}",
                settings.rootdir.join(DPKG_ADMINDIR).display()
            ))
            .args(["-W", "-f", "${db:Status-Abbrev} ${Package}\\n"]);

        let (inv, result) = self.run_captured(inv);
        if !result.is_success() {
            return Err(Error::PackageCommit(format!(
                "reading package database: {}: {}",
                inv.command_line(),
                result.reason()
            )));
        }
        self.installed = parse_installed(&result.stdout);
        Ok(())
    }

    /// Totals of every simulated command, added together.
    ///
    /// A dist-upgrade and the install marks are simulated separately, so the
    /// install simulation does not see the upgrade's effect and a package
    /// touched by both is counted twice.
    fn summarize(&mut self, tx: &Transaction) -> Result<TransactionSummary> {
        let mut total = TransactionSummary::default();
        for output in self.simulate(tx)? {
            total.add(parse_simulation(&output));
        }
        Ok(total)
    }

    fn changes(&mut self, tx: &Transaction) -> Result<Vec<String>> {
        Ok(self
            .simulate(tx)?
            .iter()
            .flat_map(|output| simulated_actions(output))
            .collect())
    }

    fn commit(&mut self, tx: &Transaction, progress: &mut dyn AcquireObserver) -> Result<()> {
        progress.start();
        let committed = self.run_transaction(tx, progress);
        progress.stop();
        committed
    }

    fn installed(&self) -> Vec<String> {
        self.installed.clone()
    }
}

/// `apt-get` subcommands applying `tx`, in order.
///
/// A dist-upgrade runs first; install and purge marks share one `install`
/// call, with purges given as `name-`.
pub fn transaction_commands(tx: &Transaction) -> Vec<Vec<String>> {
    let mut commands = Vec::new();
    if tx.dist_upgrade {
        commands.push(vec!["dist-upgrade".to_string()]);
    }
    if !tx.install.is_empty() || !tx.purge.is_empty() {
        let mut command = vec!["install".to_string(), "--purge".to_string()];
        command.extend(tx.install.iter().cloned());
        command.extend(tx.purge.iter().map(|name| format!("{name}-")));
        commands.push(command);
    }
    commands
}

/// Replay `apt-get` fetch lines into `progress`.
///
/// The caller brackets the command with `start`/`stop` so the reported
/// duration covers the fetch itself. Returns the number of items that
/// failed outright.
pub fn replay_progress(output: &str, progress: &mut dyn AcquireObserver) -> usize {
    let mut failures = 0;
    let mut lines = output.lines().peekable();

    while let Some(line) = lines.next() {
        let Some((kind, mut item)) = parse_progress_line(line) else {
            debug!("apt: {}", line);
            continue;
        };

        let mut detail = Vec::new();
        while let Some(next) = lines.next_if(|next| next.starts_with("  ")) {
            detail.push(next.trim());
        }

        match kind {
            FetchEvent::Hit => progress.ims_hit(&item),
            FetchEvent::Get => progress.fetch(&item),
            FetchEvent::Ign => {
                item.done = true;
                progress.fail(&item);
            }
            FetchEvent::Err => {
                failures += 1;
                item.error_text = Some(detail.join(" "));
                progress.fail(&item);
            }
        }
    }

    failures
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchEvent {
    Hit,
    Get,
    Ign,
    Err,
}

/// Parse `Get:3 http://... Packages [9123 kB]` and friends.
fn parse_progress_line(line: &str) -> Option<(FetchEvent, AcquireItem)> {
    let (kind, rest) = [
        ("Hit:", FetchEvent::Hit),
        ("Get:", FetchEvent::Get),
        ("Ign:", FetchEvent::Ign),
        ("Err:", FetchEvent::Err),
    ]
    .into_iter()
    .find_map(|(prefix, kind)| line.strip_prefix(prefix).map(|rest| (kind, rest)))?;

    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
    let description = rest.strip_prefix(' ')?;

    if let Some(open) = description.rfind(" [") {
        if let Some(inner) = description[open + 2..].strip_suffix(']') {
            if let Some(size) = parse_size(inner) {
                let item = AcquireItem::new(&description[..open]).with_size(size);
                return Some((kind, item));
            }
        }
    }
    Some((kind, AcquireItem::new(description)))
}

/// Parse an APT size such as `12.3 kB` or `1,234 B` into bytes.
pub fn parse_size(text: &str) -> Option<u64> {
    let mut parts = text.split_whitespace();
    let number: f64 = parts.next()?.replace(',', "").parse().ok()?;
    let multiplier = match parts.next()? {
        "B" => 1.0,
        "kB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "PB" => 1e15,
        _ => return None,
    };
    if parts.next().is_some() || number < 0.0 {
        return None;
    }
    Some((number * multiplier).round() as u64)
}

/// Transaction totals from `apt-get -s` output.
pub fn parse_simulation(output: &str) -> TransactionSummary {
    let mut summary = TransactionSummary::default();
    let mut saw_counts = false;

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("Need to get ") {
            let size = rest.split(" of archives").next().unwrap_or_default();
            let still_needed = size.split('/').next().unwrap_or_default();
            summary.download_bytes = parse_size(still_needed).unwrap_or_default();
        } else if let Some(rest) = line.strip_prefix("After this operation, ") {
            let size = rest
                .split(" of additional")
                .next()
                .and_then(|s| s.split(" disk space").next())
                .unwrap_or_default();
            let bytes = parse_size(size).unwrap_or_default() as i64;
            summary.required_space = if rest.contains("freed") { -bytes } else { bytes };
        } else if line.contains(" newly installed") && line.contains(" to remove") {
            saw_counts = true;
            for part in line.trim_end_matches('.').split(',').flat_map(|p| p.split(" and ")) {
                let mut words = part.trim().splitn(2, ' ');
                let count: u64 = match words.next().and_then(|n| n.parse().ok()) {
                    Some(count) => count,
                    None => continue,
                };
                match words.next().unwrap_or_default() {
                    "upgraded" | "newly installed" | "reinstalled" => summary.install_count += count,
                    "to remove" => summary.delete_count += count,
                    _ => {}
                }
            }
        }
    }

    if !saw_counts {
        for action in simulated_actions(output) {
            if action.starts_with("Inst ") {
                summary.install_count += 1;
            } else {
                summary.delete_count += 1;
            }
        }
    }
    summary
}

/// `Inst`, `Remv` and `Purg` lines from `apt-get -s` output.
pub fn simulated_actions(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| {
            line.starts_with("Inst ") || line.starts_with("Remv ") || line.starts_with("Purg ")
        })
        .map(str::to_string)
        .collect()
}

/// Installed package names from `dpkg-query -f '${db:Status-Abbrev} ${Package}'`.
pub fn parse_installed(output: &str) -> Vec<String> {
    let mut names: Vec<String> = output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let status = fields.next()?;
            let name = fields.next()?;
            status.starts_with("ii").then(|| name.to_string())
        })
        .collect();
    names.sort();
    names.dedup();
    names
}
