//! Path resolution.
//!
//! Walks a path component by component from a starting directory, calling
//! the backend `lookup` op per component. Mountpoints are crossed by
//! descending onto the mounted root; `..` at a mount root hops back to
//! the covered vnode's parent. Symlinks before the final component are
//! always followed; the final component follows only when the caller
//! asks. A bounded chain counter turns symlink cycles into `ELOOP`.

use alloc::string::String;
use alloc::vec::Vec;

use salern_abi::{Errno, SYMLINK_MAX};

use crate::path;
use crate::{VnodeRef, VnodeType};

/// Resolves `path` to a vnode.
///
/// Absolute paths start at `root`, relative paths at `start`. The
/// returned reference is the caller's to release.
///
/// # Errors
///
/// `ENOENT` for missing components, `ENOTDIR` when an intermediate is not
/// a directory, `ELOOP` past [`SYMLINK_MAX`] chained symlinks.
pub fn resolve(
    path: &str,
    root: &VnodeRef,
    start: &VnodeRef,
    follow_last: bool,
) -> Result<VnodeRef, Errno> {
    let mut depth = 0;
    resolve_bounded(path, root, start, follow_last, &mut depth)
}

fn resolve_bounded(
    path: &str,
    root: &VnodeRef,
    start: &VnodeRef,
    follow_last: bool,
    depth: &mut usize,
) -> Result<VnodeRef, Errno> {
    path::check(path)?;
    let mut cur = if path::is_absolute(path) {
        root.clone()
    } else {
        start.clone()
    };
    cur = descend_mounts(cur);

    let comps: Vec<&str> = path::components(path).collect();
    for (i, comp) in comps.iter().enumerate() {
        let is_last = i == comps.len() - 1;
        if cur.vtype != VnodeType::Directory {
            return Err(Errno::Enotdir);
        }

        let next = if *comp == ".." {
            // `..` at a mount root resolves in the covered directory.
            let base = cur.covered().unwrap_or_else(|| cur.clone());
            base.ops().lookup(&base, "..")?
        } else {
            cur.ops().lookup(&cur, comp)?
        };
        let next = descend_mounts(next);

        if next.vtype == VnodeType::Symlink && (!is_last || follow_last) {
            *depth += 1;
            if *depth > SYMLINK_MAX {
                return Err(Errno::Eloop);
            }
            let target: String = next.ops().readlink(&next)?;
            cur = if path::is_absolute(&target) {
                resolve_bounded(&target, root, root, true, depth)?
            } else {
                resolve_bounded(&target, root, &cur, true, depth)?
            };
        } else {
            cur = next;
        }
    }
    Ok(cur)
}

/// Follows mountpoint covers down to the topmost mounted filesystem root.
fn descend_mounts(mut vn: VnodeRef) -> VnodeRef {
    while let Some(mounted) = vn.mounted_here() {
        vn = mounted;
    }
    vn
}

/// Resolves the parent directory of `path` and returns it with the final
/// component name.
///
/// # Errors
///
/// `EINVAL` when the path has no usable final component (`/`, `..`).
pub fn resolve_parent<'a>(
    path: &'a str,
    root: &VnodeRef,
    start: &VnodeRef,
) -> Result<(VnodeRef, &'a str), Errno> {
    path::check(path)?;
    let (parent, name) = path::split_parent(path).ok_or(Errno::Einval)?;
    let parent_vn = if parent.is_empty() {
        if path::is_absolute(path) {
            descend_mounts(root.clone())
        } else {
            descend_mounts(start.clone())
        }
    } else {
        resolve(parent, root, start, true)?
    };
    if parent_vn.vtype != VnodeType::Directory {
        return Err(Errno::Enotdir);
    }
    Ok((parent_vn, name))
}

/// Resolves the parent of `path` and creates the final component with
/// `creator` (backend `create`, `mkdir`, …).
///
/// # Errors
///
/// `EEXIST` if the name exists and `exclusive` is set; otherwise an
/// existing vnode is returned as-is.
pub fn create_any(
    path: &str,
    root: &VnodeRef,
    start: &VnodeRef,
    exclusive: bool,
    creator: impl FnOnce(&VnodeRef, &str) -> Result<VnodeRef, Errno>,
) -> Result<VnodeRef, Errno> {
    let (parent, name) = resolve_parent(path, root, start)?;
    match parent.ops().lookup(&parent, name) {
        Ok(existing) => {
            if exclusive {
                Err(Errno::Eexist)
            } else {
                Ok(descend_mounts(existing))
            }
        }
        Err(Errno::Enoent) => creator(&parent, name),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TmpFs;
    use crate::{FileAttr, Filesystem, Vnode};
    use alloc::sync::Arc;

    fn fresh_root() -> VnodeRef {
        TmpFs::new(Arc::new(crate::tmpfs::tests::HostFrames::default())).root()
    }

    #[test]
    fn walks_nested_directories() {
        let root = fresh_root();
        let etc = root.ops().mkdir(&root, "etc", FileAttr::default()).unwrap();
        let _conf = etc
            .ops()
            .create(&etc, "motd", FileAttr::default())
            .unwrap();

        let found = resolve("/etc/motd", &root, &root, true).unwrap();
        assert_eq!(found.vtype, VnodeType::Regular);

        // Idempotence: a second lookup returns the same inode.
        let again = resolve("/etc/motd", &root, &root, true).unwrap();
        assert_eq!(found.inode, again.inode);
    }

    #[test]
    fn relative_and_dotdot() {
        let root = fresh_root();
        let a = root.ops().mkdir(&root, "a", FileAttr::default()).unwrap();
        let _b = a.ops().mkdir(&a, "b", FileAttr::default()).unwrap();
        root.ops().create(&root, "top", FileAttr::default()).unwrap();

        let found = resolve("b/../../top", &root, &a, true).unwrap();
        assert_eq!(found.vtype, VnodeType::Regular);
        // `..` above the root stays at the root.
        let still_root = resolve("/..", &root, &root, true).unwrap();
        assert_eq!(still_root.inode, root.inode);
    }

    #[test]
    fn missing_component_is_enoent() {
        let root = fresh_root();
        assert_eq!(
            resolve("/no/such", &root, &root, true).err(),
            Some(Errno::Enoent)
        );
    }

    #[test]
    fn file_as_directory_is_enotdir() {
        let root = fresh_root();
        root.ops().create(&root, "f", FileAttr::default()).unwrap();
        assert_eq!(
            resolve("/f/x", &root, &root, true).err(),
            Some(Errno::Enotdir)
        );
    }

    #[test]
    fn follows_symlinks_and_bounds_loops() {
        let root = fresh_root();
        root.ops().create(&root, "real", FileAttr::default()).unwrap();
        root.ops().symlink(&root, "link", "/real").unwrap();
        let via = resolve("/link", &root, &root, true).unwrap();
        assert_eq!(via.vtype, VnodeType::Regular);

        // Without follow_last, the link itself comes back.
        let raw = resolve("/link", &root, &root, false).unwrap();
        assert_eq!(raw.vtype, VnodeType::Symlink);

        // a -> b -> a must terminate with ELOOP.
        root.ops().symlink(&root, "a", "/b").unwrap();
        root.ops().symlink(&root, "b", "/a").unwrap();
        assert_eq!(
            resolve("/a", &root, &root, true).err(),
            Some(Errno::Eloop)
        );
    }

    #[test]
    fn crosses_mountpoints_both_ways() {
        let frames = Arc::new(crate::tmpfs::tests::HostFrames::default());
        let rootfs = TmpFs::new(frames.clone());
        let root = rootfs.root();
        let mnt = root.ops().mkdir(&root, "mnt", FileAttr::default()).unwrap();
        root.ops().create(&root, "outer", FileAttr::default()).unwrap();

        let subfs = TmpFs::new(frames);
        let sub_root = subfs.root();
        sub_root
            .ops()
            .create(&sub_root, "inner", FileAttr::default())
            .unwrap();
        Vnode::mount_on(&mnt, sub_root.clone()).unwrap();

        // Descending crosses onto the mounted fs.
        let inner = resolve("/mnt/inner", &root, &root, true).unwrap();
        assert_eq!(inner.vtype, VnodeType::Regular);

        // `..` from the mount root lands back in the parent fs.
        let outer = resolve("../outer", &root, &sub_root, true).unwrap();
        assert_eq!(outer.vtype, VnodeType::Regular);
    }

    #[test]
    fn create_any_exclusive_collision() {
        let root = fresh_root();
        let made = create_any("/x", &root, &root, true, |dir, name| {
            dir.ops().create(dir, name, FileAttr::default())
        })
        .unwrap();
        assert_eq!(made.vtype, VnodeType::Regular);

        let err = create_any("/x", &root, &root, true, |dir, name| {
            dir.ops().create(dir, name, FileAttr::default())
        })
        .err();
        assert_eq!(err, Some(Errno::Eexist));

        // Non-exclusive returns the existing vnode.
        let same = create_any("/x", &root, &root, false, |dir, name| {
            dir.ops().create(dir, name, FileAttr::default())
        })
        .unwrap();
        assert_eq!(same.inode, made.inode);
    }
}
