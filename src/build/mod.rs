//! Build orchestration.
//!
//! ```text
//! bootstrap ─> init ─> apt (sources, update, keys) ─> install profile
//!   ─> apt deinit ─> chroot deinit ─> compress ─> nuke
//! ```
//!
//! Any failure aborts the remaining steps. Teardown is attempted after both
//! success and failure; [`ChrootEnvironment::nuke`] itself honours
//! `preserve`.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::apt::{AptGetBackend, PackageBackend, PackageManager};
use crate::chroot::ChrootEnvironment;
use crate::compress::ImageCompressor;
use crate::config::BuildConfig;
use crate::error::Result;
use crate::process::SystemRunner;
use crate::profile::{ProfileSource, StaticProfile};

/// Build an image for `architecture` in `rootdir` using the host's tools.
///
/// Returns the image path, or `None` when no format is configured.
pub fn build(config: &BuildConfig, rootdir: &Path, architecture: &str) -> Result<Option<PathBuf>> {
    let chroot = ChrootEnvironment::new(
        rootdir,
        architecture,
        &config.chroot,
        config.verbosity(),
        Box::new(SystemRunner),
    )?;
    let backend = AptGetBackend::new(Box::new(SystemRunner));
    let profile = StaticProfile::from_config(&config.profile);

    run(config, &chroot, backend, &profile)
}

/// Run the whole build in `chroot`, then tear it down.
///
/// A build error takes precedence over a teardown error, which is then
/// only logged.
pub fn run<B, P>(
    config: &BuildConfig,
    chroot: &ChrootEnvironment,
    backend: B,
    profile: &P,
) -> Result<Option<PathBuf>>
where
    B: PackageBackend,
    P: ProfileSource + ?Sized,
{
    let built = build_image(config, chroot, backend, profile);
    let teardown = chroot.nuke();

    match (built, teardown) {
        (Ok(image), Ok(())) => Ok(image),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Err(teardown)) => {
            warn!("teardown after failed build: {}", teardown);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
    }
}

fn build_image<B, P>(
    config: &BuildConfig,
    chroot: &ChrootEnvironment,
    backend: B,
    profile: &P,
) -> Result<Option<PathBuf>>
where
    B: PackageBackend,
    P: ProfileSource + ?Sized,
{
    info!(
        "building {} image in {}",
        chroot.architecture(),
        chroot.rootdir().display()
    );

    chroot.bootstrap()?;
    chroot.init()?;

    let compressor = ImageCompressor::new(chroot, &config.compression);
    let mut apt = PackageManager::new(chroot, &config.apt, config.quiet, backend)?;

    let mut packages = profile.packages();
    packages.extend(compressor.depends());
    if !packages.is_empty() {
        let packages: Vec<String> = packages.into_iter().collect();
        apt.install(&packages, true)?;
    }

    apt.deinit()?;
    chroot.deinit()?;

    compressor.compress()
}
