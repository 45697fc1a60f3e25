//! Live root filesystem image builder.
//!
//! Creates an isolated root directory, bootstraps a minimal Debian-family
//! system into it, installs a package profile through APT and serializes
//! the result into a squashfs image or tar archive.
//!
//! # Architecture
//!
//! ```text
//! build::run
//!     │
//!     ├── chroot::ChrootEnvironment   bootstrap, diversions, cmd(), nuke()
//!     │       └── chroot::VirtualMountSet   proc/sys/devpts around every cmd()
//!     │
//!     ├── apt::PackageManager         sources, keys, marks, commit()
//!     │       └── apt::PackageBackend       host apt-get on the alternate root
//!     │
//!     └── compress::ImageCompressor   mksquashfs / tar inside the root
//! ```
//!
//! Every external program goes through a [`process::CommandRunner`], so the
//! whole lifecycle can be driven against fakes.
//!
//! # Example
//!
//! ```rust,ignore
//! use live_builder::{build, BuildConfig};
//! use std::path::Path;
//!
//! let config = BuildConfig::load(Path::new("live.toml"))?;
//! let image = build::build(&config, Path::new("/srv/live/root"), "amd64")?;
//! ```

pub mod apt;
pub mod build;
pub mod chroot;
pub mod compress;
pub mod config;
pub mod error;
pub mod preflight;
pub mod process;
pub mod profile;

pub use apt::{PackageBackend, PackageManager};
pub use chroot::ChrootEnvironment;
pub use compress::ImageCompressor;
pub use config::BuildConfig;
pub use error::{Error, ErrorKind, Result};
pub use process::{CommandRunner, SystemRunner};
pub use profile::{ProfileSource, StaticProfile};
