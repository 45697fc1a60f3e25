//! Fetch progress reporting.
//!
//! The backend replays every acquire item it handles into an
//! [`AcquireObserver`]. [`AcquireProgress`] prints them the way the build log
//! expects:
//!
//! ```text
//! APT HIT http://deb.debian.org/debian sid InRelease
//! APT GET http://deb.debian.org/debian sid/main amd64 Packages [9.1 MB]
//! APT ERR http://example.org/debian sid/main amd64 Packages [404  Not Found]
//! APT GOT 3 items in 2.031400s [9.1 MB]
//! ```

use std::io::{self, Stdout, Write};
use std::time::Duration;
use time::OffsetDateTime;

/// One item handled by the package fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquireItem {
    pub description: String,
    pub filesize: Option<u64>,
    /// The item was already satisfied; a failure is only "ignored".
    pub done: bool,
    pub error_text: Option<String>,
}

impl AcquireItem {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.filesize = Some(size);
        self
    }
}

/// Receives fetch events from a package backend.
pub trait AcquireObserver {
    fn start(&mut self);
    /// Item was unchanged upstream (cache hit).
    fn ims_hit(&mut self, item: &AcquireItem);
    fn fetch(&mut self, item: &AcquireItem);
    fn fail(&mut self, item: &AcquireItem);
    fn stop(&mut self);
}

/// Prints fetch progress and a summary line when fetching stops.
pub struct AcquireProgress<W: Write = Stdout> {
    quiet: bool,
    out: W,
    started: Option<OffsetDateTime>,
    total_items: u64,
    total_bytes: u64,
}

impl AcquireProgress<Stdout> {
    pub fn new(quiet: bool) -> Self {
        Self::with_writer(quiet, io::stdout())
    }
}

impl<W: Write> AcquireProgress<W> {
    pub fn with_writer(quiet: bool, out: W) -> Self {
        Self {
            quiet,
            out,
            started: None,
            total_items: 0,
            total_bytes: 0,
        }
    }

    pub fn total_items(&self) -> u64 {
        self.total_items
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn item_line(&mut self, line: String) {
        if !self.quiet {
            let _ = writeln!(self.out, "{line}");
        }
    }

    /// Summary line for `elapsed`, or `None` if nothing was processed.
    pub fn summary(&self, elapsed: Duration) -> Option<String> {
        if self.total_items == 0 {
            return None;
        }
        Some(format!(
            "APT GOT {} items in {} [{}]",
            self.total_items,
            format_elapsed(elapsed),
            human_size(self.total_bytes)
        ))
    }
}

impl<W: Write> AcquireObserver for AcquireProgress<W> {
    fn start(&mut self) {
        self.started = Some(OffsetDateTime::now_utc());
        self.total_items = 0;
        self.total_bytes = 0;
    }

    fn ims_hit(&mut self, item: &AcquireItem) {
        self.total_items += 1;
        let mut line = format!("APT HIT {}", item.description);
        if let Some(size) = item.filesize.filter(|s| *s > 0) {
            line.push_str(&format!(" [{}]", human_size(size)));
        }
        self.item_line(line);
    }

    fn fetch(&mut self, item: &AcquireItem) {
        self.total_items += 1;
        let mut line = format!("APT GET {}", item.description);
        if let Some(size) = item.filesize.filter(|s| *s > 0) {
            self.total_bytes += size;
            line.push_str(&format!(" [{}]", human_size(size)));
        }
        self.item_line(line);
    }

    fn fail(&mut self, item: &AcquireItem) {
        self.total_items += 1;
        let line = if item.done {
            format!("APT IGN {}", item.description)
        } else {
            match item.error_text.as_deref().filter(|t| !t.is_empty()) {
                Some(text) => format!("APT ERR {} [{}]", item.description, text),
                None => format!("APT ERR {}", item.description),
            }
        };
        self.item_line(line);
    }

    fn stop(&mut self) {
        let elapsed = self
            .started
            .take()
            .map(|start| {
                let delta = OffsetDateTime::now_utc() - start;
                Duration::try_from(delta).unwrap_or_default()
            })
            .unwrap_or_default();

        if let Some(line) = self.summary(elapsed) {
            let _ = writeln!(self.out, "{line}");
        }
    }
}

/// `2m:05s` once a minute has passed, otherwise `seconds.microseconds`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m:{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}.{:06}s", secs, elapsed.subsec_micros())
    }
}

/// Size in APT's style: base 1000, one decimal below 100 of a unit, none
/// below 10000.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 9] = ["", "k", "M", "G", "T", "P", "E", "Z", "Y"];

    let mut size = bytes as f64;
    for (i, unit) in UNITS.iter().enumerate() {
        if size < 100.0 && i != 0 {
            return format!("{size:.1} {unit}B");
        }
        if size < 10000.0 {
            return format!("{size:.0} {unit}B");
        }
        size /= 1000.0;
    }
    format!("{size:.0} YB")
}

/// [`human_size`] for a signed quantity (freed disk space is negative).
pub fn human_size_signed(bytes: i64) -> String {
    if bytes < 0 {
        format!("-{}", human_size(bytes.unsigned_abs()))
    } else {
        human_size(bytes as u64)
    }
}
