/// Directory storage backend: the bind-mount based reference
/// implementation of [`StorageDriver`].
///
/// A plain directory tree is the backing store; mounting is a recursive
/// bind of the source onto the destination. Directories have no native
/// snapshot primitive, so every snapshot request is rejected without
/// touching the filesystem.
use crate::mntopts::{parse_mount_options, parse_propagation_options, required_remount_flags};
use crate::storage::{strip_storage_prefix, BackingStoreSpec, StorageDescriptor, StorageDriver};
use crate::types::{Result, RootboxError};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::mkfifo;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

pub const DIR_DRIVER: &str = "dir";

pub struct DirectoryDriver;

impl DirectoryDriver {
    /// `mount`/`umount` require the right backend type and both `src` and
    /// `dest` set.
    fn check_descriptor(&self, descriptor: &StorageDescriptor) -> Result<()> {
        if descriptor.driver != DIR_DRIVER {
            return Err(RootboxError::Unsupported(format!(
                "descriptor has backend type \"{}\", expected \"{}\"",
                descriptor.driver, DIR_DRIVER
            )));
        }
        if descriptor.src.is_empty() || descriptor.dest.as_os_str().is_empty() {
            return Err(RootboxError::Storage(
                "descriptor is missing a source or destination".to_string(),
            ));
        }
        Ok(())
    }
}

impl StorageDriver for DirectoryDriver {
    fn driver_type(&self) -> &'static str {
        DIR_DRIVER
    }

    fn can_backup(&self) -> bool {
        true
    }

    /// An explicit `"dir:"` prefix means the user declared this backend;
    /// an existing directory means it was inferred from filesystem state.
    fn detect(&self, path: &str) -> bool {
        if path.starts_with("dir:") {
            return true;
        }
        fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
    }

    fn create(&self, dest: &Path, spec: &BackingStoreSpec) -> Result<StorageDescriptor> {
        let src = spec.dir.as_deref().unwrap_or(dest);

        // Only stamp the default mode onto directories we created
        // ourselves; a pre-existing tree keeps whatever the admin set.
        let preexisting = dest.is_dir();
        fs::create_dir_all(dest).map_err(|e| {
            RootboxError::Storage(format!(
                "failed to create directory \"{}\": {}",
                dest.display(),
                e
            ))
        })?;
        if !preexisting {
            fs::set_permissions(dest, fs::Permissions::from_mode(0o755)).map_err(|e| {
                RootboxError::Storage(format!(
                    "failed to set permissions on \"{}\": {}",
                    dest.display(),
                    e
                ))
            })?;
        }

        log::trace!("created directory \"{}\"", dest.display());
        Ok(StorageDescriptor {
            driver: DIR_DRIVER.to_string(),
            src: format!("dir:{}", src.display()),
            dest: dest.to_path_buf(),
            mntopts: None,
        })
    }

    fn mount(&self, descriptor: &StorageDescriptor) -> Result<()> {
        self.check_descriptor(descriptor)?;

        let (mntflags, mntdata) = parse_mount_options(descriptor.mntopts.as_deref());
        let pflags = parse_propagation_options(descriptor.mntopts.as_deref());
        let src = descriptor.src_path();
        let dest = &descriptor.dest;

        let flags = MsFlags::MS_BIND | MsFlags::MS_REC | mntflags | pflags;
        mount(Some(src), dest, Some("bind"), flags, mntdata.as_deref()).map_err(|e| {
            RootboxError::Storage(format!(
                "failed to mount \"{}\" on \"{}\": {}",
                src.display(),
                dest.display(),
                e
            ))
        })?;

        // The first bind pass does not make the mount read-only by itself;
        // a remount carrying the flags already active on the source
        // filesystem is needed.
        if mntflags.contains(MsFlags::MS_RDONLY) {
            let mflags = required_remount_flags(src, dest, flags | MsFlags::MS_REMOUNT);
            mount(Some(src), dest, Some("bind"), mflags, mntdata.as_deref()).map_err(|e| {
                RootboxError::Storage(format!(
                    "failed to remount \"{}\" on \"{}\" read-only: {}",
                    src.display(),
                    dest.display(),
                    e
                ))
            })?;
            log::debug!(
                "remounted \"{}\" on \"{}\" read-only",
                src.display(),
                dest.display()
            );
        }

        log::trace!(
            "mounted \"{}\" on \"{}\" with options \"{}\"",
            src.display(),
            dest.display(),
            descriptor.mntopts.as_deref().unwrap_or("")
        );
        Ok(())
    }

    /// Lazy detach, so a transiently-busy mount does not block teardown.
    fn umount(&self, descriptor: &StorageDescriptor) -> Result<()> {
        self.check_descriptor(descriptor)?;
        umount2(&descriptor.dest, MntFlags::MNT_DETACH).map_err(|e| {
            RootboxError::Storage(format!(
                "failed to unmount \"{}\": {}",
                descriptor.dest.display(),
                e
            ))
        })
    }

    fn destroy(&self, descriptor: &StorageDescriptor) -> Result<()> {
        let src = descriptor.src_path();
        remove_tree_one_device(src)?;
        log::trace!("destroyed directory \"{}\"", src.display());
        Ok(())
    }

    /// Pure function of `(new_name, base_path)`: the clone's source and
    /// destination are rewritten to `dir:<base_path>/<new_name>/rootfs`,
    /// independent of the original descriptor's paths.
    fn clone_paths(
        &self,
        orig: &StorageDescriptor,
        new_name: &str,
        base_path: &Path,
        snapshot: bool,
    ) -> Result<StorageDescriptor> {
        if snapshot {
            return Err(RootboxError::Unsupported(
                "directories cannot be snapshotted".to_string(),
            ));
        }
        if orig.src.is_empty() || orig.dest.as_os_str().is_empty() {
            return Err(RootboxError::Storage(
                "original descriptor is missing a source or destination".to_string(),
            ));
        }

        let src = format!("dir:{}/{}/rootfs", base_path.display(), new_name);
        let dest = PathBuf::from(strip_storage_prefix(&src, DIR_DRIVER));
        log::trace!("created new path \"{}\" for dir storage driver", dest.display());
        Ok(StorageDescriptor {
            driver: DIR_DRIVER.to_string(),
            src,
            dest,
            mntopts: None,
        })
    }

    fn copy(&self, orig: &StorageDescriptor, new: &StorageDescriptor) -> Result<()> {
        copy_tree(orig.src_path(), new.src_path())
    }

    fn snapshot(
        &self,
        _orig: &StorageDescriptor,
        _new: &StorageDescriptor,
        _newsize: u64,
    ) -> Result<()> {
        Err(RootboxError::Unsupported(
            "the directory backend does not support snapshots".to_string(),
        ))
    }
}

/// Remove the tree rooted at `root` without crossing onto another
/// filesystem, so a mistakenly-wide path cannot take a mounted device's
/// contents with it.
fn remove_tree_one_device(root: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(root).map_err(|e| {
        RootboxError::Storage(format!("failed to delete \"{}\": {}", root.display(), e))
    })?;
    if !meta.is_dir() {
        return fs::remove_file(root).map_err(|e| {
            RootboxError::Storage(format!("failed to delete \"{}\": {}", root.display(), e))
        });
    }
    remove_dir_one_device(root, meta.dev())
}

fn remove_dir_one_device(dir: &Path, dev: u64) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| {
        RootboxError::Storage(format!("failed to read \"{}\": {}", dir.display(), e))
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| {
            RootboxError::Storage(format!("failed to read \"{}\": {}", dir.display(), e))
        })?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path).map_err(|e| {
            RootboxError::Storage(format!("failed to stat \"{}\": {}", path.display(), e))
        })?;

        if meta.dev() != dev {
            return Err(RootboxError::Storage(format!(
                "refusing to delete \"{}\": it resides on another device",
                path.display()
            )));
        }

        if meta.is_dir() {
            remove_dir_one_device(&path, dev)?;
        } else {
            fs::remove_file(&path).map_err(|e| {
                RootboxError::Storage(format!("failed to delete \"{}\": {}", path.display(), e))
            })?;
        }
    }

    fs::remove_dir(dir).map_err(|e| {
        RootboxError::Storage(format!("failed to delete \"{}\": {}", dir.display(), e))
    })
}

/// Recursive copy of a directory tree, preserving file modes and symlink
/// targets.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).map_err(|e| {
        RootboxError::Storage(format!("failed to create \"{}\": {}", to.display(), e))
    })?;

    let entries = fs::read_dir(from).map_err(|e| {
        RootboxError::Storage(format!("failed to read \"{}\": {}", from.display(), e))
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| {
            RootboxError::Storage(format!("failed to read \"{}\": {}", from.display(), e))
        })?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let meta = fs::symlink_metadata(&src).map_err(|e| {
            RootboxError::Storage(format!("failed to stat \"{}\": {}", src.display(), e))
        })?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(&src).map_err(|e| {
                RootboxError::Storage(format!("failed to read link \"{}\": {}", src.display(), e))
            })?;
            std::os::unix::fs::symlink(&target, &dst).map_err(|e| {
                RootboxError::Storage(format!("failed to link \"{}\": {}", dst.display(), e))
            })?;
        } else if meta.is_dir() {
            copy_tree(&src, &dst)?;
            fs::set_permissions(&dst, meta.permissions()).map_err(|e| {
                RootboxError::Storage(format!(
                    "failed to set permissions on \"{}\": {}",
                    dst.display(),
                    e
                ))
            })?;
        } else if meta.file_type().is_file() {
            // fs::copy carries the source permissions over.
            let _ = fs::copy(&src, &dst).map_err(|e| {
                RootboxError::Storage(format!(
                    "failed to copy \"{}\" to \"{}\": {}",
                    src.display(),
                    dst.display(),
                    e
                ))
            })?;
        } else if meta.file_type().is_fifo() {
            // Reading a FIFO would block until a writer shows up; recreate
            // the node instead of copying through it.
            mkfifo(&dst, Mode::from_bits_truncate(meta.mode())).map_err(|e| {
                RootboxError::Storage(format!("failed to create \"{}\": {}", dst.display(), e))
            })?;
        } else if meta.file_type().is_char_device() || meta.file_type().is_block_device() {
            let kind = if meta.file_type().is_char_device() {
                SFlag::S_IFCHR
            } else {
                SFlag::S_IFBLK
            };
            mknod(
                &dst,
                kind,
                Mode::from_bits_truncate(meta.mode()),
                meta.rdev(),
            )
            .map_err(|e| {
                RootboxError::Storage(format!("failed to create \"{}\": {}", dst.display(), e))
            })?;
        } else {
            return Err(RootboxError::Storage(format!(
                "cannot copy \"{}\": unsupported file type",
                src.display()
            )));
        }
    }
    Ok(())
}
