//! Kernel-side filesystem glue.
//!
//! The VFS model (vnodes, lookup, tmpfs, tar) lives in `salern-fs` for
//! host testability; this module wires it to the running kernel: the
//! root filesystem, the `/dev` and `/tmp` mounts, the initrd
//! extraction, and the fd-relative resolution helpers the syscall layer
//! uses.

pub mod devfs;
pub mod devices;
pub mod pipefs;
pub mod sockfs;

use alloc::string::String;
use alloc::sync::Arc;

use salern_abi::{AT_FDCWD, Errno};
use salern_core::sync::SpinLock;
use salern_fs::tmpfs::TmpFs;
use salern_fs::{Filesystem, FrameSource, Vnode, VnodeRef, VnodeType, lookup};

use crate::boot::BootInfo;
use crate::mm::pmm::PmmFrameSource;
use crate::proc::Process;

static ROOT: SpinLock<Option<VnodeRef>> = SpinLock::new(None);

/// The shared frame source every in-memory filesystem draws from.
static FRAME_SOURCE: SpinLock<Option<Arc<dyn FrameSource>>> = SpinLock::new(None);

/// The system root vnode.
///
/// # Panics
///
/// Panics before [`init`].
#[must_use]
pub fn root() -> VnodeRef {
    ROOT.lock().clone().expect("vfs not initialized")
}

/// The kernel's PMM-backed frame source.
#[must_use]
pub fn frame_source() -> Arc<dyn FrameSource> {
    FRAME_SOURCE.lock().clone().expect("vfs not initialized")
}

/// Builds the filesystem tree: tmpfs root populated from the initrd,
/// `/dev` (devfs) and `/tmp` (tmpfs) mounted on top, device nodes
/// registered.
pub fn init(boot: &impl BootInfo) {
    let frames: Arc<dyn FrameSource> = Arc::new(PmmFrameSource);
    *FRAME_SOURCE.lock() = Some(frames.clone());

    let rootfs = TmpFs::new(frames.clone());
    let root = rootfs.root();
    *ROOT.lock() = Some(root.clone());
    // The mount pin: the root filesystem lives as long as the kernel.
    core::mem::forget(rootfs);

    // Unpack the initrd into the root.
    match boot.module("/initrd") {
        Some(archive) => match salern_fs::tar::extract(archive, &root) {
            Ok(count) => crate::kinfo!("initrd: extracted {count} entries"),
            Err(e) => crate::kurgent!("initrd: extraction failed: {e}"),
        },
        None => crate::kurgent!("initrd: no /initrd module, root is empty"),
    }

    // `/tmp` — a fresh tmpfs.
    let tmp_mp = ensure_dir(&root, "tmp");
    let tmpfs = TmpFs::new(frames.clone());
    Vnode::mount_on(&tmp_mp, tmpfs.root()).expect("mounting /tmp");
    core::mem::forget(tmpfs);

    // `/dev` — the device filesystem.
    let dev_mp = ensure_dir(&root, "dev");
    let devfs = devfs::DevFs::new();
    Vnode::mount_on(&dev_mp, devfs.root()).expect("mounting /dev");
    devfs::install(devfs);

    devices::register_all(boot);
    crate::kinfo!("vfs: root + /dev + /tmp mounted");
}

fn ensure_dir(root: &VnodeRef, name: &str) -> VnodeRef {
    match root.ops().lookup(root, name) {
        Ok(vn) => vn,
        Err(_) => root
            .ops()
            .mkdir(root, name, salern_fs::FileAttr { mode: 0o755 })
            .expect("creating mountpoint"),
    }
}

// ---------------------------------------------------------------------------
// fd-relative resolution
// ---------------------------------------------------------------------------

/// Resolves `path` the `*at` way: absolute from the process root,
/// relative from `dirfd` (or the cwd for [`AT_FDCWD`]).
pub fn resolve_at(
    proc: &Arc<Process>,
    dirfd: i32,
    path: &str,
    follow: bool,
) -> Result<VnodeRef, Errno> {
    let root = proc.root.lock().clone();
    let start = start_dir(proc, dirfd, path)?;
    lookup::resolve(path, &root, &start, follow)
}

/// Resolves the parent directory for `*at` creation calls.
pub fn parent_at<'p>(
    proc: &Arc<Process>,
    dirfd: i32,
    path: &'p str,
) -> Result<(VnodeRef, &'p str), Errno> {
    let root = proc.root.lock().clone();
    let start = start_dir(proc, dirfd, path)?;
    lookup::resolve_parent(path, &root, &start)
}

fn start_dir(proc: &Arc<Process>, dirfd: i32, path: &str) -> Result<VnodeRef, Errno> {
    if salern_fs::path::is_absolute(path) || dirfd == AT_FDCWD {
        return Ok(proc.cwd.lock().clone());
    }
    let file = proc.fds.lock().get(dirfd)?;
    if file.vnode.vtype != VnodeType::Directory {
        return Err(Errno::Enotdir);
    }
    Ok(file.vnode.clone())
}

/// Normalizes `path` against `base` (both absolute), resolving `.` and
/// `..` textually for `getcwd` bookkeeping.
#[must_use]
pub fn join_paths(base: &str, path: &str) -> String {
    let mut parts: alloc::vec::Vec<&str> = alloc::vec::Vec::new();
    let full = if salern_fs::path::is_absolute(path) {
        path.into()
    } else {
        alloc::format!("{base}/{path}")
    };
    for comp in full.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        String::from("/")
    } else {
        let mut out = String::new();
        for part in parts {
            out.push('/');
            out.push_str(part);
        }
        out
    }
}
