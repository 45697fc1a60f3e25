//! Preflight checks for build validation.
//!
//! Validates that the host has the tools the build drives from outside the
//! root before anything is bootstrapped. Tools run inside the root (gpg,
//! dpkg-divert, the archiver) are provided by the bootstrap and by
//! [`ImageCompressor::depends`](crate::compress::ImageCompressor::depends).
//!
//! # Example
//!
//! ```rust
//! use live_builder::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("debootstrap") {
//!     println!("debootstrap not installed");
//! }
//!
//! let tools = &[("mount", "mount"), ("apt-get", "apt")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::chroot::Bootstrapper;
use crate::config::BuildConfig;
use crate::error::{Error, Result};

/// Check if a command exists on the host's PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools needed regardless of configuration.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mount", "mount"),
    ("umount", "mount"),
    ("apt-get", "apt"),
    ("dpkg-query", "dpkg"),
];

/// Every host tool `config` will drive.
pub fn required_tools(config: &BuildConfig) -> Result<Vec<(&'static str, &'static str)>> {
    let bootstrapper: Bootstrapper = config.chroot.bootstrap.bootstrapper.parse()?;
    let mut tools = vec![match bootstrapper {
        Bootstrapper::Cdebootstrap => ("cdebootstrap", "cdebootstrap"),
        Bootstrapper::Debootstrap => ("debootstrap", "debootstrap"),
    }];
    tools.extend_from_slice(REQUIRED_TOOLS);
    Ok(tools)
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` listing every missing tool and its package
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        return Err(Error::Configuration(format!(
            "missing required host tools:\n{}",
            missing.join("\n")
        )));
    }

    Ok(())
}

/// Check every host tool the configured build needs.
pub fn check_host_tools(config: &BuildConfig) -> Result<()> {
    check_required_tools(&required_tools(config)?)
}
