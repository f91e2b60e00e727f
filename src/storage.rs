/// Storage backend abstraction: the pluggable contract for detecting,
/// creating, mounting, and destroying the backing store of a container's
/// root filesystem.
///
/// Backends are tried in priority order from an explicit list; there is no
/// global registry. A source string carries its backend as a prefix
/// (`"dir:/var/lib/rootbox/foo/rootfs"`); a path with no recognized prefix
/// falls back to filesystem-based detection.
use crate::types::{Result, RootboxError};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_FSTYPE: &str = "ext4";
pub const DEFAULT_FS_SIZE: u64 = 1_073_741_824;

/// Creation parameters for a backing store, supplied by configuration
/// loading. Immutable once passed to [`StorageDriver::create`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackingStoreSpec {
    /// Filesystem type for block-device backends.
    pub fstype: Option<String>,
    /// Backing store size in bytes for backends that allocate one.
    pub size: Option<u64>,
    /// Explicit alternate source directory for the directory backend.
    pub dir: Option<PathBuf>,
    /// ZFS root dataset.
    pub zfsroot: Option<String>,
    /// LVM volume group.
    pub vg: Option<String>,
    /// LVM thin pool.
    pub thinpool: Option<String>,
    /// RBD image name.
    pub rbd_name: Option<String>,
    /// RBD pool name.
    pub rbd_pool: Option<String>,
}

/// A provisioned backing store. Created by a driver's `create`, mutated
/// only by that same driver's operations, released by `destroy`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    /// Backend type tag, e.g. `"dir"`.
    pub driver: String,
    /// Backend-qualified source, e.g. `"dir:/path"`.
    pub src: String,
    /// Mount point.
    pub dest: PathBuf,
    /// Generic mount-option string, parsed at mount time.
    pub mntopts: Option<String>,
}

impl StorageDescriptor {
    /// The source with its backend prefix stripped.
    pub fn src_path(&self) -> &Path {
        Path::new(strip_storage_prefix(&self.src, &self.driver))
    }
}

/// Strip a `"<driver>:"` prefix from a source string, if present.
pub fn strip_storage_prefix<'a>(src: &'a str, driver: &str) -> &'a str {
    src.strip_prefix(driver)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(src)
}

/// Capability set implemented by every storage backend.
pub trait StorageDriver {
    /// Backend type tag; also the source-string prefix.
    fn driver_type(&self) -> &'static str;

    /// Whether this backend has a native snapshot primitive.
    fn can_snapshot(&self) -> bool {
        false
    }

    /// Whether this backend can serve as a backup source.
    fn can_backup(&self) -> bool {
        false
    }

    /// Whether `path` belongs to this backend, either by explicit prefix
    /// or by inspecting filesystem state.
    fn detect(&self, path: &str) -> bool;

    /// Provision a backing store at `dest`.
    fn create(&self, dest: &Path, spec: &BackingStoreSpec) -> Result<StorageDescriptor>;

    /// Mount the store. Requires both `src` and `dest` set.
    fn mount(&self, descriptor: &StorageDescriptor) -> Result<()>;

    /// Unmount the store. Requires both `src` and `dest` set.
    fn umount(&self, descriptor: &StorageDescriptor) -> Result<()>;

    /// Release the backing store itself.
    fn destroy(&self, descriptor: &StorageDescriptor) -> Result<()>;

    /// Build the descriptor a clone of `orig` would use, rewriting source
    /// and destination for the new container name. `snapshot` requests a
    /// copy-on-write clone where the backend supports one.
    fn clone_paths(
        &self,
        orig: &StorageDescriptor,
        new_name: &str,
        base_path: &Path,
        snapshot: bool,
    ) -> Result<StorageDescriptor>;

    /// Copy the contents of `orig` into `new`'s backing store.
    fn copy(&self, orig: &StorageDescriptor, new: &StorageDescriptor) -> Result<()>;

    /// Take a copy-on-write snapshot of `orig` into `new`.
    fn snapshot(
        &self,
        orig: &StorageDescriptor,
        new: &StorageDescriptor,
        newsize: u64,
    ) -> Result<()>;
}

/// The backends tried by default, in priority order.
pub fn default_drivers() -> Vec<Box<dyn StorageDriver>> {
    vec![Box::new(crate::dir::DirectoryDriver)]
}

/// Dispatch by trial: an explicit `"<type>:"` prefix wins, otherwise each
/// driver's `detect` is consulted in list order.
pub fn find_driver<'a>(
    drivers: &'a [Box<dyn StorageDriver>],
    path: &str,
) -> Option<&'a dyn StorageDriver> {
    if let Some((prefix, _)) = path.split_once(':') {
        if let Some(driver) = drivers.iter().find(|d| d.driver_type() == prefix) {
            return Some(driver.as_ref());
        }
    }
    drivers.iter().map(|d| d.as_ref()).find(|d| d.detect(path))
}

/// Provision a backing store with an explicitly named backend, or with the
/// highest-priority backend when `driver_type` is `None`.
pub fn create_backing_store<'a>(
    drivers: &'a [Box<dyn StorageDriver>],
    driver_type: Option<&str>,
    dest: &Path,
    spec: &BackingStoreSpec,
) -> Result<(&'a dyn StorageDriver, StorageDescriptor)> {
    let driver = match driver_type {
        Some(name) => drivers
            .iter()
            .map(|d| d.as_ref())
            .find(|d| d.driver_type() == name)
            .ok_or_else(|| {
                RootboxError::Unsupported(format!("no storage backend named \"{}\"", name))
            })?,
        None => drivers
            .first()
            .map(|d| d.as_ref())
            .ok_or_else(|| RootboxError::Storage("no storage backends registered".to_string()))?,
    };

    let descriptor = driver.create(dest, spec)?;
    Ok((driver, descriptor))
}

/// An owned handle over a mounted store. Detaches the mount on every exit
/// path unless the caller takes over responsibility with [`release`].
///
/// [`release`]: MountedStore::release
pub struct MountedStore<'a> {
    driver: &'a dyn StorageDriver,
    descriptor: &'a StorageDescriptor,
    armed: bool,
}

impl<'a> MountedStore<'a> {
    pub fn mount(
        driver: &'a dyn StorageDriver,
        descriptor: &'a StorageDescriptor,
    ) -> Result<MountedStore<'a>> {
        driver.mount(descriptor)?;
        Ok(MountedStore {
            driver,
            descriptor,
            armed: true,
        })
    }

    pub fn descriptor(&self) -> &StorageDescriptor {
        self.descriptor
    }

    /// Leave the mount in place; the caller now owns its teardown.
    pub fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for MountedStore<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.driver.umount(self.descriptor) {
            log::warn!(
                "failed to unmount \"{}\": {}",
                self.descriptor.dest.display(),
                err
            );
        }
    }
}
