// tests/chroot_lifecycle.rs

//! Integration tests for the chroot lifecycle against the fake runner.

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::process::Command;

use common::{Fixture, ORIGINAL_BINARY};
use live_builder::chroot::DIVERSIONS;
use live_builder::ErrorKind;

#[test]
fn test_init_installs_stubs_and_identity_files() {
    let fx = Fixture::new();
    let config = fx.config();
    let chroot = fx.bootstrapped(&config);

    chroot.init().unwrap();

    let hostname = fs::read_to_string(chroot.chroot_path("/etc/hostname")).unwrap();
    assert_eq!(hostname.trim_end(), "siduction");

    let resolv = fs::read_to_string(chroot.chroot_path("/etc/resolv.conf")).unwrap();
    assert_eq!(resolv, "nameserver 10.0.0.53\n");

    for path in DIVERSIONS {
        let stub = chroot.chroot_path(path);
        let mode = fs::metadata(&stub).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "{path} is not executable");

        let diverted = chroot.chroot_path(format!("{path}.REAL"));
        assert_eq!(fs::read_to_string(diverted).unwrap(), ORIGINAL_BINARY);

        let status = Command::new("sh").arg(&stub).status().unwrap();
        let expected = if path.ends_with("policy-rc.d") { 101 } else { 0 };
        assert_eq!(status.code(), Some(expected), "{path}");
    }
}

#[test]
fn test_deinit_restores_originals() {
    let fx = Fixture::new();
    let config = fx.config();
    let chroot = fx.bootstrapped(&config);

    chroot.init().unwrap();
    chroot.deinit().unwrap();

    for path in DIVERSIONS {
        assert_eq!(
            fs::read_to_string(chroot.chroot_path(path)).unwrap(),
            ORIGINAL_BINARY,
            "{path} not restored"
        );
        assert!(!chroot.chroot_path(format!("{path}.REAL")).exists());
    }

    let hosts = fs::read_to_string(chroot.chroot_path("/etc/hosts")).unwrap();
    assert!(hosts.contains("127.0.0.1\tsiduction"));
    assert!(!hosts.contains("buildhost"));
    assert!(fs::read_to_string(chroot.chroot_path("/etc/resolv.conf"))
        .unwrap()
        .is_empty());
}

#[test]
fn test_deinit_leaves_symlinked_resolv_conf() {
    let fx = Fixture::new();
    let config = fx.config();
    let chroot = fx.bootstrapped(&config);
    chroot.init().unwrap();

    let resolv = chroot.chroot_path("/etc/resolv.conf");
    fs::remove_file(&resolv).unwrap();
    std::os::unix::fs::symlink("/run/systemd/resolve/stub-resolv.conf", &resolv).unwrap();

    chroot.deinit().unwrap();
    assert!(resolv.is_symlink());
}

#[test]
fn test_every_cmd_is_bracketed_by_mounts() {
    let fx = Fixture::new();
    let config = fx.config();
    let chroot = fx.bootstrapped(&config);
    fx.runner.clear_log();

    chroot.cmd(&["dpkg", "--configure", "-a"]).unwrap();

    let programs: Vec<String> = fx
        .runner
        .invocations()
        .iter()
        .map(|inv| inv.program().to_string())
        .collect();
    assert_eq!(
        programs,
        ["mount", "mount", "mount", "dpkg", "umount", "umount", "umount"]
    );

    let dpkg = &fx.runner.calls("dpkg")[0];
    assert_eq!(dpkg.root(), Some(chroot.rootdir()));
    assert!(fx.runner.mounted_under(chroot.rootdir()).is_empty());
}

#[test]
fn test_failed_cmd_leaves_no_mounts() {
    let fx = Fixture::new();
    let config = fx.config();
    let chroot = fx.bootstrapped(&config);
    fx.runner.fail_program("locale-gen");

    let err = chroot.cmd(&["locale-gen", "en_US.UTF-8"]).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ChrootCommand);
    assert!(err.to_string().contains("locale-gen en_US.UTF-8"));
    assert!(fx.runner.mounted_under(chroot.rootdir()).is_empty());
}

#[test]
fn test_failed_mount_is_swept() {
    let fx = Fixture::new();
    let config = fx.config();
    let chroot = fx.bootstrapped(&config);

    fx.runner.fail_program("mount");

    let err = chroot.cmd(&["true"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Mount);
    assert!(fx.runner.calls("true").is_empty());
    assert!(fx.runner.mounted_under(chroot.rootdir()).is_empty());
}

#[test]
fn test_unmount_sweeps_nested_mounts_deepest_first() {
    let fx = Fixture::new();
    let config = fx.config();
    let chroot = fx.bootstrapped(&config);

    chroot.mount_virtfs().unwrap();
    let binfmt = chroot.chroot_path("/proc/sys/fs/binfmt_misc");
    let mut table = fx.runner.mount_table();
    table.push_str(&format!("binfmt_misc {} binfmt_misc rw 0 0\n", binfmt.display()));
    fs::write(&fx.table, table).unwrap();
    fx.runner.clear_log();

    chroot.unmount_virtfs().unwrap();

    let umounts = fx.runner.calls("umount");
    assert_eq!(umounts.len(), 4);
    assert_eq!(umounts[0].get_args(), [binfmt.display().to_string()]);
    assert!(fx.runner.mounted_under(chroot.rootdir()).is_empty());
}

#[test]
fn test_mount_is_idempotent() {
    let fx = Fixture::new();
    let config = fx.config();
    let chroot = fx.bootstrapped(&config);

    chroot.mount_virtfs().unwrap();
    chroot.mount_virtfs().unwrap();

    assert_eq!(fx.runner.calls("mount").len(), 3);
    assert_eq!(fx.runner.mounted_under(chroot.rootdir()).len(), 3);
    chroot.unmount_virtfs().unwrap();
}

#[test]
fn test_cdebootstrap_purges_helper() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.chroot.bootstrap.bootstrapper = "cdebootstrap".into();
    let chroot = fx.chroot(&config);

    chroot.bootstrap().unwrap();

    let boot = &fx.runner.calls("cdebootstrap")[0];
    assert!(boot.get_args().contains(&"--flavour=minimal".to_string()));
    let purge = &fx.runner.calls("dpkg")[0];
    assert_eq!(purge.get_args(), ["--purge", "cdebootstrap-helper-rc.d"]);
}

#[test]
fn test_bootstrap_failure() {
    let fx = Fixture::new();
    let config = fx.config();
    fx.runner.fail_program("debootstrap");

    let err = fx.chroot(&config).bootstrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Bootstrap);
    assert!(err.to_string().contains("exit code 1"));
}

#[test]
fn test_nuke_removes_root_and_mounts() {
    let fx = Fixture::new();
    let config = fx.config();
    let chroot = fx.bootstrapped(&config);
    chroot.mount_virtfs().unwrap();

    chroot.nuke().unwrap();

    assert!(!chroot.rootdir().exists());
    assert!(fx.runner.mounted_under(chroot.rootdir()).is_empty());
}

#[test]
fn test_nuke_unmounts_stacked_mount_points() {
    let fx = Fixture::new();
    let config = fx.config();
    let chroot = fx.bootstrapped(&config);
    chroot.mount_virtfs().unwrap();

    // Tooling inside the root mounted proc a second time.
    let proc = chroot.chroot_path("/proc");
    let mut table = fx.runner.mount_table();
    table.push_str(&format!("proc {} proc rw 0 0\n", proc.display()));
    fs::write(&fx.table, table).unwrap();
    fx.runner.clear_log();

    chroot.nuke().unwrap();

    let umounts = fx.runner.calls("umount");
    assert_eq!(umounts.len(), 4);
    assert_eq!(
        umounts
            .iter()
            .filter(|u| u.get_args() == [proc.display().to_string()])
            .count(),
        2
    );
    assert!(fx.runner.mounted_under(chroot.rootdir()).is_empty());
    assert!(!chroot.rootdir().exists());
}

#[test]
fn test_nuke_keeps_root_while_mounted() {
    let fx = Fixture::new();
    let config = fx.config();
    let chroot = fx.bootstrapped(&config);
    chroot.mount_virtfs().unwrap();
    fx.runner.fail_program("umount");

    let err = chroot.nuke().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unmount);
    assert!(chroot.rootdir().is_dir());
    assert_eq!(fx.runner.mounted_under(chroot.rootdir()).len(), 3);
}
