//! Build configuration.
//!
//! One TOML document describes the whole build. It is parsed into typed
//! sections and validated once, before anything touches the filesystem.
//!
//! ```toml
//! [chroot]
//! hostname = "siduction"
//!
//! [chroot.bootstrap]
//! bootstrapper = "debootstrap"
//! uri = "http://deb.debian.org/debian"
//! suite = "sid"
//!
//! [apt.sources.main]
//! uri = "http://deb.debian.org/debian"
//! suites = ["sid"]
//! components = ["main"]
//!
//! [compression]
//! format = "squashfs"
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::compress::TAR_COMPRESSORS;
use crate::error::{Error, Result};

pub const DEFAULT_KEYSERVER: &str = "keyserver.ubuntu.com";
pub const DEFAULT_HOSTNAME: &str = "localhost";

/// Top-level build configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub debug: bool,
    pub chroot: ChrootConfig,
    #[serde(default)]
    pub apt: AptConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub profile: ProfileConfig,
}

/// Output verbosity shared by every component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verbosity {
    pub quiet: bool,
    pub verbose: bool,
    pub debug: bool,
}

/// `[chroot]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChrootConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Keep the root directory on disk after the build.
    #[serde(default)]
    pub preserve: bool,
    pub bootstrap: BootstrapConfig,
}

/// `[chroot.bootstrap]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
    /// `cdebootstrap` or `debootstrap`.
    #[serde(default = "default_bootstrapper")]
    pub bootstrapper: String,
    pub uri: String,
    #[serde(default = "default_suite")]
    pub suite: String,
    /// cdebootstrap vocabulary: `minimal`, `build` or `standard`.
    #[serde(default = "default_flavour")]
    pub flavour: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// `[apt]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AptConfig {
    /// Also write `deb-src` lines during the build.
    #[serde(default)]
    pub src: bool,
    #[serde(default)]
    pub key: KeyConfig,
    /// Backend preference overrides, applied verbatim as `-o key=value`.
    #[serde(default)]
    pub conf: BTreeMap<String, String>,
    #[serde(default)]
    pub sources: BTreeMap<String, PackageSource>,
}

/// `[apt.key]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    #[serde(default)]
    pub disable: bool,
    #[serde(default = "default_keyserver")]
    pub server: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            disable: false,
            server: default_keyserver(),
        }
    }
}

/// One `[apt.sources.<name>]` entry. The name is the map key.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSource {
    /// URI used while building.
    pub uri: String,
    /// URI written into the shipped image, if different.
    pub final_uri: Option<String>,
    pub suites: Vec<String>,
    pub components: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Key file path, 8-character key ID, or URL.
    pub gpgkey: Option<String>,
    /// Package whose installation supplies the trust key.
    pub keyring: Option<String>,
}

/// `[compression]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionConfig {
    /// `squashfs` or `tar`; anything else skips packaging.
    pub format: Option<String>,
    /// Job-level exclude patterns.
    pub exclude: Option<Vec<String>>,
    #[serde(default)]
    pub squashfs: FormatConfig,
    #[serde(default)]
    pub tar: FormatConfig,
}

/// Per-format settings (`[compression.squashfs]`, `[compression.tar]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatConfig {
    pub compressor: Option<String>,
    /// Host-side output path; its file name is also the in-root working name.
    pub file: Option<PathBuf>,
    /// Format-specific exclude patterns; win over everything else.
    pub exclude: Option<Vec<String>>,
}

/// `[profile]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    #[serde(default)]
    pub packages: Vec<String>,
}

fn default_hostname() -> String {
    DEFAULT_HOSTNAME.to_string()
}

fn default_bootstrapper() -> String {
    "cdebootstrap".to_string()
}

fn default_suite() -> String {
    "sid".to_string()
}

fn default_flavour() -> String {
    "minimal".to_string()
}

fn default_keyserver() -> String {
    DEFAULT_KEYSERVER.to_string()
}

impl BuildConfig {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("reading '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&text).map_err(|e| match e {
            Error::Configuration(msg) => {
                Error::Configuration(format!("'{}': {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse and validate a configuration document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: BuildConfig =
            toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn verbosity(&self) -> Verbosity {
        Verbosity {
            quiet: self.quiet,
            verbose: self.verbose,
            debug: self.debug,
        }
    }

    /// Check every section, reporting all problems in one error.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.chroot.hostname.trim().is_empty() {
            problems.push("chroot.hostname must not be empty".to_string());
        }
        let bootstrap = &self.chroot.bootstrap;
        if let Err(e) = bootstrap.bootstrapper.parse::<crate::chroot::Bootstrapper>() {
            problems.push(match e {
                Error::Configuration(msg) => msg,
                other => other.to_string(),
            });
        }
        if bootstrap.uri.trim().is_empty() {
            problems.push("chroot.bootstrap.uri must not be empty".to_string());
        }
        if bootstrap.suite.trim().is_empty() {
            problems.push("chroot.bootstrap.suite must not be empty".to_string());
        }

        for (name, source) in &self.apt.sources {
            if source.uri.trim().is_empty() {
                problems.push(format!("apt.sources.{name}: uri must not be empty"));
            }
            if source.suites.is_empty() {
                problems.push(format!("apt.sources.{name}: at least one suite is required"));
            }
            if source.components.is_empty() {
                problems.push(format!(
                    "apt.sources.{name}: at least one component is required"
                ));
            }
        }

        if let Some(compressor) = &self.compression.tar.compressor {
            if !TAR_COMPRESSORS.iter().any(|(name, _)| *name == compressor.as_str()) {
                problems.push(format!(
                    "compression.tar.compressor: unsupported '{}' (expected one of: {})",
                    compressor,
                    TAR_COMPRESSORS
                        .iter()
                        .map(|(name, _)| *name)
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(problems.join("; ")))
        }
    }
}
