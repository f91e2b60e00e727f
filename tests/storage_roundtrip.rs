//! Privileged round-trip tests for the directory storage backend.
//!
//! These touch real mounts and therefore need CAP_SYS_ADMIN; without root
//! they log a skip and pass, so the suite stays runnable everywhere.

use rootbox::dir::DirectoryDriver;
use rootbox::storage::{BackingStoreSpec, StorageDriver};

use nix::unistd::Uid;
use serial_test::serial;
use std::fs;
use std::path::PathBuf;

fn requires_root() -> bool {
    let _ = env_logger::builder().is_test(true).try_init();
    if Uid::effective().is_root() {
        return false;
    }
    eprintln!("skipping: mount round-trip requires root");
    true
}

#[test]
#[serial]
fn test_create_mount_umount_destroy_round_trip() {
    if requires_root() {
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let srcdir = tmp.path().join("source");
    fs::create_dir_all(&srcdir).unwrap();
    fs::write(srcdir.join("marker"), "payload\n").unwrap();

    let driver = DirectoryDriver;
    let spec = BackingStoreSpec {
        dir: Some(srcdir.clone()),
        ..Default::default()
    };
    let dest = tmp.path().join("rootfs");
    let descriptor = driver.create(&dest, &spec).unwrap();

    driver.mount(&descriptor).unwrap();
    assert!(
        dest.join("marker").is_file(),
        "bind mount must expose the source contents at dest"
    );

    driver.umount(&descriptor).unwrap();
    assert!(
        !dest.join("marker").exists(),
        "no active mount may remain at dest after umount"
    );
    assert!(
        srcdir.join("marker").is_file(),
        "umount must not remove the directory tree"
    );

    driver.destroy(&descriptor).unwrap();
    assert!(!srcdir.exists(), "destroy removes the backing tree");
    assert!(dest.is_dir(), "the mount point itself is not the store");
}

#[test]
#[serial]
fn test_read_only_bind_rejects_writes() {
    if requires_root() {
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let srcdir = tmp.path().join("source");
    fs::create_dir_all(&srcdir).unwrap();

    let driver = DirectoryDriver;
    let spec = BackingStoreSpec {
        dir: Some(srcdir.clone()),
        ..Default::default()
    };
    let dest = tmp.path().join("rootfs");
    let mut descriptor = driver.create(&dest, &spec).unwrap();
    descriptor.mntopts = Some("ro".to_string());

    driver.mount(&descriptor).unwrap();

    let write_through_mount = fs::write(dest.join("scratch"), "x");
    let write_to_source = fs::write(srcdir.join("scratch"), "x");

    driver.umount(&descriptor).unwrap();

    assert!(
        write_through_mount.is_err(),
        "a read-only bind mount must reject writes"
    );
    assert!(
        write_to_source.is_ok(),
        "the underlying source stays writable directly"
    );
}

#[test]
fn test_clone_paths_round_trip_without_privileges() {
    let driver = DirectoryDriver;
    let tmp = tempfile::tempdir().unwrap();

    let orig = driver
        .create(&tmp.path().join("old/rootfs"), &BackingStoreSpec::default())
        .unwrap();
    let clone = driver
        .clone_paths(&orig, "new", tmp.path(), false)
        .unwrap();

    assert_eq!(
        PathBuf::from(&clone.dest),
        tmp.path().join("new/rootfs"),
        "clone paths derive from (name, base_path) only"
    );

    // The clone descriptor names a tree that does not exist yet; create
    // and copy populate it.
    let new = driver
        .create(&clone.dest, &BackingStoreSpec::default())
        .unwrap();
    fs::write(orig.src_path().join("marker"), "payload\n").unwrap();
    driver.copy(&orig, &new).unwrap();
    assert!(new.src_path().join("marker").is_file());
}
