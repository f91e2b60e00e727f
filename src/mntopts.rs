/// Mount-option string parsing for storage backends.
///
/// A generic option string like `"ro,nosuid,size=10m"` is split into the
/// standard mount flags the kernel understands, the opaque data string
/// passed through to the filesystem, and the mount-propagation flags,
/// which the kernel requires in a separate mount call or combined with
/// the bind flags.
use nix::mount::MsFlags;
use nix::sys::statvfs::{statvfs, FsFlags};
use std::path::Path;

/// Keyword options that toggle standard mount flags. `clear` options
/// remove a flag a previous token may have set ("rw" undoes "ro").
fn flag_for(token: &str) -> Option<(bool, MsFlags)> {
    Some(match token {
        "async" => (true, MsFlags::MS_SYNCHRONOUS),
        "atime" => (true, MsFlags::MS_NOATIME),
        "bind" => (false, MsFlags::MS_BIND),
        "defaults" => (false, MsFlags::empty()),
        "dev" => (true, MsFlags::MS_NODEV),
        "diratime" => (true, MsFlags::MS_NODIRATIME),
        "dirsync" => (false, MsFlags::MS_DIRSYNC),
        "exec" => (true, MsFlags::MS_NOEXEC),
        "mand" => (false, MsFlags::MS_MANDLOCK),
        "noatime" => (false, MsFlags::MS_NOATIME),
        "nodev" => (false, MsFlags::MS_NODEV),
        "nodiratime" => (false, MsFlags::MS_NODIRATIME),
        "noexec" => (false, MsFlags::MS_NOEXEC),
        "nomand" => (true, MsFlags::MS_MANDLOCK),
        "norelatime" => (true, MsFlags::MS_RELATIME),
        "nostrictatime" => (true, MsFlags::MS_STRICTATIME),
        "nosuid" => (false, MsFlags::MS_NOSUID),
        "rbind" => (false, MsFlags::MS_BIND.union(MsFlags::MS_REC)),
        "relatime" => (false, MsFlags::MS_RELATIME),
        "remount" => (false, MsFlags::MS_REMOUNT),
        "ro" => (false, MsFlags::MS_RDONLY),
        "rw" => (true, MsFlags::MS_RDONLY),
        "strictatime" => (false, MsFlags::MS_STRICTATIME),
        "suid" => (true, MsFlags::MS_NOSUID),
        "sync" => (false, MsFlags::MS_SYNCHRONOUS),
        _ => return None,
    })
}

fn propagation_for(token: &str) -> Option<MsFlags> {
    Some(match token {
        "private" => MsFlags::MS_PRIVATE,
        "shared" => MsFlags::MS_SHARED,
        "slave" => MsFlags::MS_SLAVE,
        "unbindable" => MsFlags::MS_UNBINDABLE,
        "rprivate" => MsFlags::MS_PRIVATE.union(MsFlags::MS_REC),
        "rshared" => MsFlags::MS_SHARED.union(MsFlags::MS_REC),
        "rslave" => MsFlags::MS_SLAVE.union(MsFlags::MS_REC),
        "runbindable" => MsFlags::MS_UNBINDABLE.union(MsFlags::MS_REC),
        _ => return None,
    })
}

/// Split a comma-separated option string into standard mount flags and the
/// opaque data string for the filesystem. Propagation keywords are handled
/// by [`parse_propagation_options`] and do not leak into the data string.
pub fn parse_mount_options(mntopts: Option<&str>) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut data: Vec<&str> = Vec::new();

    for token in mntopts
        .unwrap_or("")
        .split(',')
        .filter(|t| !t.is_empty())
    {
        match flag_for(token) {
            Some((true, flag)) => flags.remove(flag),
            Some((false, flag)) => flags.insert(flag),
            None => {
                if propagation_for(token).is_none() {
                    data.push(token);
                }
            }
        }
    }

    let data = if data.is_empty() {
        None
    } else {
        Some(data.join(","))
    };
    (flags, data)
}

/// Collect the mount-propagation flags named by the option string.
pub fn parse_propagation_options(mntopts: Option<&str>) -> MsFlags {
    let mut pflags = MsFlags::empty();
    for token in mntopts
        .unwrap_or("")
        .split(',')
        .filter(|t| !t.is_empty())
    {
        if let Some(flag) = propagation_for(token) {
            pflags.insert(flag);
        }
    }
    pflags
}

/// A plain bind mount does not become read-only from `MS_RDONLY` alone on
/// the first pass; the remount must also carry every restricting flag
/// already active on the underlying filesystem or the kernel rejects it.
/// Consults the source (falling back to the destination) via `statvfs`.
pub fn required_remount_flags(src: &Path, dest: &Path, flags: MsFlags) -> MsFlags {
    let sb = match statvfs(src).or_else(|_| statvfs(dest)) {
        Ok(sb) => sb,
        Err(_) => return flags,
    };

    let mut required = flags;
    let active = sb.flags();
    if active.contains(FsFlags::ST_NOSUID) {
        required.insert(MsFlags::MS_NOSUID);
    }
    if active.contains(FsFlags::ST_NODEV) {
        required.insert(MsFlags::MS_NODEV);
    }
    if active.contains(FsFlags::ST_NOEXEC) {
        required.insert(MsFlags::MS_NOEXEC);
    }
    if active.contains(FsFlags::ST_RDONLY) {
        required.insert(MsFlags::MS_RDONLY);
    }
    required
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_options() {
        let (flags, data) = parse_mount_options(None);
        assert!(flags.is_empty());
        assert!(data.is_none());
    }

    #[test]
    fn test_flag_keywords() {
        let (flags, data) = parse_mount_options(Some("ro,nosuid,nodev"));
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert!(flags.contains(MsFlags::MS_NODEV));
        assert!(data.is_none());
    }

    #[test]
    fn test_clear_keywords_undo_earlier_flags() {
        let (flags, _) = parse_mount_options(Some("ro,rw"));
        assert!(!flags.contains(MsFlags::MS_RDONLY));

        let (flags, _) = parse_mount_options(Some("noexec,exec,noatime,atime"));
        assert!(flags.is_empty());
    }

    #[test]
    fn test_unknown_tokens_accumulate_as_data() {
        let (flags, data) = parse_mount_options(Some("ro,size=10m,mode=755"));
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert_eq!(data.as_deref(), Some("size=10m,mode=755"));
    }

    #[test]
    fn test_propagation_keywords_do_not_leak_into_data() {
        let (flags, data) = parse_mount_options(Some("rslave,ro"));
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert!(data.is_none());

        let pflags = parse_propagation_options(Some("rslave,ro"));
        assert!(pflags.contains(MsFlags::MS_SLAVE));
        assert!(pflags.contains(MsFlags::MS_REC));
    }

    #[test]
    fn test_rbind_is_recursive() {
        let (flags, _) = parse_mount_options(Some("rbind"));
        assert!(flags.contains(MsFlags::MS_BIND));
        assert!(flags.contains(MsFlags::MS_REC));
    }

    #[test]
    fn test_required_remount_flags_keeps_input_flags() {
        let flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
        let out = required_remount_flags(Path::new("/"), Path::new("/"), flags);
        assert!(out.contains(flags));
    }
}
