//! Bootstrap tool selection and command line construction.
//!
//! Two interchangeable tools populate an empty root: `cdebootstrap` and
//! `debootstrap`. They take the same inputs under different flag names, and
//! debootstrap calls the flavour a "variant" with its own vocabulary.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::config::{BootstrapConfig, Verbosity};
use crate::error::Error;
use crate::process::Invocation;

/// Package cdebootstrap leaves behind to keep daemons from starting.
///
/// Purged after bootstrap so the diversion stub at `policy-rc.d` is the only
/// policy in force.
pub const CDEBOOTSTRAP_HELPER: &str = "cdebootstrap-helper-rc.d";

/// Supported bootstrap tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootstrapper {
    Cdebootstrap,
    Debootstrap,
}

impl Bootstrapper {
    pub fn program(self) -> &'static str {
        match self {
            Bootstrapper::Cdebootstrap => "cdebootstrap",
            Bootstrapper::Debootstrap => "debootstrap",
        }
    }

    /// Flavour flag in this tool's vocabulary.
    pub fn flavour_arg(self, flavour: &str) -> String {
        match self {
            Bootstrapper::Cdebootstrap => format!("--flavour={flavour}"),
            Bootstrapper::Debootstrap => format!("--variant={}", debootstrap_variant(flavour)),
        }
    }

    /// Whether the tool leaves [`CDEBOOTSTRAP_HELPER`] installed.
    pub fn leaves_helper_package(self) -> bool {
        self == Bootstrapper::Cdebootstrap
    }
}

impl FromStr for Bootstrapper {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cdebootstrap" => Ok(Bootstrapper::Cdebootstrap),
            "debootstrap" => Ok(Bootstrapper::Debootstrap),
            other => Err(Error::Configuration(format!(
                "unknown bootstrapper: {other} (expected 'cdebootstrap' or 'debootstrap')"
            ))),
        }
    }
}

impl fmt::Display for Bootstrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// Map cdebootstrap flavours onto debootstrap variants.
///
/// `minimal` becomes `minbase` and `build` becomes `buildd`; anything else
/// is passed through unchanged.
pub fn debootstrap_variant(flavour: &str) -> &str {
    match flavour {
        "minimal" => "minbase",
        "build" => "buildd",
        other => other,
    }
}

/// Build the bootstrap command for `rootdir`.
///
/// Fails with [`Error::Configuration`] for an unknown tool before anything
/// is launched.
pub fn bootstrap_invocation(
    config: &BootstrapConfig,
    architecture: &str,
    rootdir: &Path,
    verbosity: Verbosity,
) -> Result<(Bootstrapper, Invocation), Error> {
    let tool: Bootstrapper = config.bootstrapper.parse()?;

    let mut inv = Invocation::new(tool.program())
        .arg(tool.flavour_arg(&config.flavour))
        .arg(format!("--arch={architecture}"));

    if !config.include.is_empty() {
        inv = inv.arg(format!("--include={}", config.include.join(",")));
    }
    if !config.exclude.is_empty() {
        inv = inv.arg(format!("--exclude={}", config.exclude.join(",")));
    }
    if verbosity.verbose {
        inv = inv.arg("--verbose");
    }
    if tool == Bootstrapper::Cdebootstrap {
        if verbosity.debug {
            inv = inv.arg("--debug");
        }
        if verbosity.quiet {
            inv = inv.arg("--quiet");
        }
    }

    let inv = inv
        .arg(&config.suite)
        .arg_path(rootdir)
        .arg(&config.uri);

    Ok((tool, inv))
}
