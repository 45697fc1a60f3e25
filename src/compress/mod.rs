//! Serialize the finished root into a single image file.
//!
//! The archiver runs inside the root, so exclusion patterns are relative to
//! `/` of the target and the artifact is first written to the root's `tmp/`
//! before being moved to its host-side output path.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::chroot::files::{remove_if_present, write_file_mode, FILE_MODE};
use crate::chroot::ChrootEnvironment;
use crate::config::{CompressionConfig, FormatConfig};
use crate::error::{Error, Result};

/// Compressor name to `tar` flag.
pub const TAR_COMPRESSORS: &[(&str, &str)] = &[("gz", "-z"), ("bz", "-j"), ("xz", "-J"), ("pz", "-Ipixz")];

/// Packages providing each `tar` compressor inside the root.
const TAR_COMPRESSOR_PACKAGES: &[(&str, &str)] = &[("bz", "bzip2"), ("xz", "xz-utils"), ("pz", "pixz")];

/// `mksquashfs -comp` value when none is configured.
pub const DEFAULT_SQUASHFS_COMPRESSOR: &str = "gzip";

/// In-root pattern file handed to the archiver.
pub const EXCLUDES_FILE: &str = "tmp/excludes";

/// Transient or host-specific paths left out of every image unless the
/// configuration supplies its own list.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "etc/.*lock",
    "etc/*-",
    "etc/adjtime",
    "etc/apt/*~",
    "etc/blkid.tab",
    "etc/console-setup/*.gz",
    "etc/localtime",
    "etc/lvm/archive",
    "etc/lvm/backup",
    "etc/lvm/cache",
    "etc/timezone",
    "etc/ssh/ssh_host_*key*",
    "etc/udev/rules.d/70-persistent-*.rules",
    "etc/X11/xorg.conf",
    "lib/init/rw/*",
    "media/*",
    "media/.*",
    "mnt/*",
    "proc/*",
    "root/*",
    "root/.*",
    "run/*",
    "sys/*",
    "tmp/*",
    "tmp/.*",
    "usr/bin/qemu-*-static",
    "var/cache/apt/*.bin",
    "var/cache/apt-show-versions/*",
    "var/cache/debconf/*-old",
    "var/lib/alsa/asound.state",
    "var/lib/apt/extended_states",
    "var/lib/apt/lists/*_dists_*",
    "var/lib/dbus/machine-id",
    "var/lib/dpkg/*-old",
    "var/run/*",
];

/// `tar` flag for a compressor name.
pub fn tar_flag(compressor: &str) -> Option<&'static str> {
    TAR_COMPRESSORS
        .iter()
        .find(|(name, _)| *name == compressor)
        .map(|(_, flag)| *flag)
}

/// Supported image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Squashfs,
    Tar,
}

impl ImageFormat {
    /// `None` for an absent or unrecognized format name.
    pub fn from_config(format: Option<&str>) -> Option<Self> {
        match format? {
            "squashfs" => Some(ImageFormat::Squashfs),
            "tar" => Some(ImageFormat::Tar),
            _ => None,
        }
    }
}

/// Produces the image artifact from a chroot.
pub struct ImageCompressor<'c> {
    chroot: &'c ChrootEnvironment,
    config: CompressionConfig,
}

impl<'c> ImageCompressor<'c> {
    pub fn new(chroot: &'c ChrootEnvironment, config: &CompressionConfig) -> Self {
        Self {
            chroot,
            config: config.clone(),
        }
    }

    pub fn format(&self) -> Option<ImageFormat> {
        ImageFormat::from_config(self.config.format.as_deref())
    }

    /// Packages the configured archiver needs inside the root.
    pub fn depends(&self) -> Vec<String> {
        match self.format() {
            Some(ImageFormat::Squashfs) => vec!["squashfs-tools".to_string()],
            Some(ImageFormat::Tar) => self
                .config
                .tar
                .compressor
                .as_deref()
                .and_then(|c| TAR_COMPRESSOR_PACKAGES.iter().find(|(name, _)| *name == c))
                .map(|(_, package)| vec![package.to_string()])
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Build the configured image, returning its host-side path.
    ///
    /// An absent or unrecognized format skips packaging and returns `None`.
    pub fn compress(&self) -> Result<Option<PathBuf>> {
        match self.format() {
            Some(ImageFormat::Squashfs) => self.squash().map(Some),
            Some(ImageFormat::Tar) => self.tar().map(Some),
            None => {
                debug!("no image format configured: {:?}", self.config.format);
                Ok(None)
            }
        }
    }

    /// Build a squashfs image of the root.
    pub fn squash(&self) -> Result<PathBuf> {
        let config = &self.config.squashfs;
        let compressor = config
            .compressor
            .as_deref()
            .unwrap_or(DEFAULT_SQUASHFS_COMPRESSOR);

        let (filename, output) = match &config.file {
            Some(file) => (working_name(file)?, file.clone()),
            None => (
                format!("tmp/squash.{compressor}"),
                self.derived_output(&format!(".squash.{compressor}")),
            ),
        };

        let mut argv = vec![
            "mksquashfs".to_string(),
            ".".to_string(),
            filename.clone(),
            "-comp".to_string(),
            compressor.to_string(),
            "-noappend".to_string(),
        ];
        if compressor == "xz" && matches!(self.chroot.architecture(), "amd64" | "i386") {
            argv.extend(["-Xbcj".to_string(), "x86".to_string()]);
        }
        argv.extend([
            "-wildcards".to_string(),
            "-ef".to_string(),
            self.excludes_file(config, &filename)?,
        ]);

        self.chroot.cmd(&argv)?;
        self.finish(&filename, &output)
    }

    /// Build a tar archive of the root, compressed if a compressor is set.
    pub fn tar(&self) -> Result<PathBuf> {
        let config = &self.config.tar;
        let compressor = config.compressor.as_deref();

        let flag = match compressor {
            Some(name) => Some(tar_flag(name).ok_or_else(|| {
                Error::Configuration(format!("unknown tar compressor: {name}"))
            })?),
            None => None,
        };

        let (filename, output) = match &config.file {
            Some(file) => (working_name(file)?, file.clone()),
            None => {
                let suffix = match compressor {
                    Some(name) => format!(".tar.{name}"),
                    None => ".tar".to_string(),
                };
                (
                    format!("tmp/rootfs{suffix}"),
                    self.derived_output(&suffix),
                )
            }
        };

        let mut argv = vec!["tar".to_string(), "-c".to_string()];
        if let Some(flag) = flag {
            argv.push(flag.to_string());
        }
        argv.extend([
            "-f".to_string(),
            filename.clone(),
            "-X".to_string(),
            self.excludes_file(config, &filename)?,
            ".".to_string(),
        ]);

        self.chroot.cmd(&argv)?;
        self.finish(&filename, &output)
    }

    /// Exclusion patterns for `config`, ending with `filename`.
    ///
    /// The most specific list wins and lists are never merged: the format's
    /// own list, else the job-level list, else [`DEFAULT_EXCLUDES`].
    pub fn excludes(&self, config: &FormatConfig, filename: &str) -> Vec<String> {
        let mut excludes = config
            .exclude
            .clone()
            .or_else(|| self.config.exclude.clone())
            .unwrap_or_else(|| DEFAULT_EXCLUDES.iter().map(|p| p.to_string()).collect());
        excludes.push(filename.to_string());
        excludes
    }

    /// Write [`excludes`](Self::excludes) to [`EXCLUDES_FILE`] and return
    /// its in-root path.
    pub fn excludes_file(&self, config: &FormatConfig, filename: &str) -> Result<String> {
        let mut content = self.excludes(config, filename).join("\n");
        content.push('\n');
        write_file_mode(&self.chroot.chroot_path(EXCLUDES_FILE), &content, FILE_MODE)?;
        Ok(EXCLUDES_FILE.to_string())
    }

    /// `<rootdir><suffix>`, next to the root directory.
    fn derived_output(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.chroot.rootdir().as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Move the artifact out of the root and drop the pattern file.
    fn finish(&self, filename: &str, output: &Path) -> Result<PathBuf> {
        let produced = self.chroot.chroot_path(filename);
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::write(parent, e))?;
        }
        move_file(&produced, output)?;
        remove_if_present(&self.chroot.chroot_path(EXCLUDES_FILE))?;

        info!("image written: {}", output.display());
        Ok(output.to_path_buf())
    }
}

/// In-root working name for an explicitly configured output file.
fn working_name(file: &Path) -> Result<String> {
    let name = file.file_name().ok_or_else(|| {
        Error::Configuration(format!("output file has no name: {}", file.display()))
    })?;
    Ok(format!("tmp/{}", name.to_string_lossy()))
}

/// Rename, falling back to copy and remove across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| Error::write(to, e))?;
    fs::remove_file(from).map_err(|e| Error::write(from, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tar_flags() {
        assert_eq!(tar_flag("gz"), Some("-z"));
        assert_eq!(tar_flag("bz"), Some("-j"));
        assert_eq!(tar_flag("xz"), Some("-J"));
        assert_eq!(tar_flag("pz"), Some("-Ipixz"));
        assert_eq!(tar_flag("zstd"), None);
    }

    #[test]
    fn test_format_names() {
        assert_eq!(ImageFormat::from_config(Some("squashfs")), Some(ImageFormat::Squashfs));
        assert_eq!(ImageFormat::from_config(Some("tar")), Some(ImageFormat::Tar));
        assert_eq!(ImageFormat::from_config(Some("iso")), None);
        assert_eq!(ImageFormat::from_config(None), None);
    }

    #[test]
    fn test_working_name() {
        assert_eq!(
            working_name(Path::new("/srv/out/live.squashfs")).unwrap(),
            "tmp/live.squashfs"
        );
        assert!(working_name(Path::new("/")).is_err());
    }

    #[test]
    fn test_defaults_cover_transient_paths() {
        for pattern in ["proc/*", "sys/*", "tmp/*", "var/lib/dbus/machine-id", "etc/ssh/ssh_host_*key*"] {
            assert!(DEFAULT_EXCLUDES.contains(&pattern), "{pattern}");
        }
    }
}
