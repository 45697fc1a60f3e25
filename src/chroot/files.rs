//! Files generated inside the root: host identity files and diversion stubs.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::{Error, Result};

/// Mode for generated configuration files.
pub const FILE_MODE: u32 = 0o644;
/// Mode for diversion stubs.
pub const STUB_MODE: u32 = 0o755;

/// Service and init affecting binaries replaced by refusing stubs while the
/// root is being built.
pub const DIVERSIONS: [&str; 7] = [
    "/usr/sbin/policy-rc.d",
    "/sbin/modprobe",
    "/sbin/insmod",
    "/usr/sbin/update-grub",
    "/usr/sbin/update-initramfs",
    "/sbin/initctl",
    "/sbin/start-stop-daemon",
];

/// Suffix under which `dpkg-divert` keeps the original binary.
pub const DIVERTED_SUFFIX: &str = ".REAL";

/// Exit status of the stub at `path`.
///
/// `policy-rc.d` answers 101 ("action forbidden"); everything else
/// pretends to succeed.
pub fn stub_exit_code(path: &str) -> i32 {
    if path.ends_with("policy-rc.d") {
        101
    } else {
        0
    }
}

/// Shell script installed in place of a diverted binary.
pub fn diversion_stub(path: &str) -> String {
    format!(
        "#!/bin/sh\n\
         echo 1>&2\n\
         echo \"Command denied: $0 $@\" 1>&2\n\
         echo 1>&2\n\
         exit {}\n",
        stub_exit_code(path)
    )
}

pub fn hosts(hostname: &str) -> String {
    format!(
        "127.0.0.1\tlocalhost\n\
         127.0.0.1\t{hostname}\n\
         \n\
         # Below lines are for IPv6 capable hosts\n\
         ::1     ip6-localhost ip6-loopback\n\
         fe00::0 ip6-localnet\n\
         ff00::0 ip6-mcastprefix\n\
         ff02::1 ip6-allnodes\n\
         ff02::2 ip6-allrouters\n\
         ff02::3 ip6-allhosts\n"
    )
}

pub fn fstab() -> String {
    "# /etc/fstab: static file system information.\n".to_string()
}

pub fn hostname(hostname: &str) -> String {
    format!("{hostname}\n")
}

pub fn network_interfaces() -> String {
    "auto lo\niface lo inet loopback\n".to_string()
}

/// Content generated for an in-root path.
///
/// Returns `(content, mode)`. Paths without a template get an empty file,
/// which is how `/etc/resolv.conf` is reset for the shipped image.
pub fn generated(path: &str, host: &str) -> (String, u32) {
    if DIVERSIONS.contains(&path) {
        return (diversion_stub(path), STUB_MODE);
    }
    let content = match path {
        "/etc/fstab" => fstab(),
        "/etc/hostname" => hostname(host),
        "/etc/hosts" => hosts(host),
        "/etc/network/interfaces" => network_interfaces(),
        _ => String::new(),
    };
    (content, FILE_MODE)
}

/// Write `content` to `path` with `mode`, creating parent directories.
pub fn write_file_mode(path: &Path, content: &str, mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::write(parent, e))?;
    }
    fs::write(path, content).map_err(|e| Error::write(path, e))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| Error::write(path, e))?;
    Ok(())
}

/// Remove a regular file or symlink if present.
pub fn remove_if_present(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(_) => fs::remove_file(path).map_err(|e| Error::write(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::write(path, e)),
    }
}
