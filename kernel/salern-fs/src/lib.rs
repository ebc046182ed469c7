//! Virtual filesystem layer.
//!
//! A [`Vnode`] is the polymorphic in-memory file handle every other
//! subsystem trades in. The backend behind a vnode implements
//! [`VnodeBackend`]; unimplemented operations fall through to `ENOSYS`
//! defaults so device backends only write the handful of ops they
//! support. Reference counting is `Arc`: the strong count *is* the vnode
//! refcount, and dropping the last reference runs the backend's `close`
//! exactly once.
//!
//! Hardware independence: backends that store file contents in page
//! frames (tmpfs) allocate them through the injected [`FrameSource`], so
//! the whole crate runs unmodified against a malloc'd arena in host
//! tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod lookup;
pub mod path;
pub mod tar;
pub mod tmpfs;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use salern_abi::stat::Stat;
use salern_abi::{Errno, PollEvents};
use salern_core::addr::PhysAddr;
use salern_core::sync::SpinLock;

/// A counted reference to a vnode.
pub type VnodeRef = Arc<Vnode>;

/// Vnode type, mirroring the `stat` file types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeType {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Character device.
    CharDevice,
    /// Block device.
    BlockDevice,
    /// Socket.
    Socket,
    /// Named pipe.
    Fifo,
}

impl VnodeType {
    /// The `st_mode` type bits for this vnode type.
    #[must_use]
    pub const fn mode_bits(self) -> u32 {
        use salern_abi::stat::mode;
        match self {
            Self::Regular => mode::S_IFREG,
            Self::Directory => mode::S_IFDIR,
            Self::Symlink => mode::S_IFLNK,
            Self::CharDevice => mode::S_IFCHR,
            Self::BlockDevice => mode::S_IFBLK,
            Self::Socket => mode::S_IFSOCK,
            Self::Fifo => mode::S_IFIFO,
        }
    }
}

/// Attributes for newly created files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAttr {
    /// Permission bits (no enforcement beyond the uid-0 boundary).
    pub mode: u32,
}

bitflags::bitflags! {
    /// Flags for [`VnodeBackend::unlink`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnlinkFlags: u32 {
        /// The entry must be a directory (`AT_REMOVEDIR`).
        const REMOVEDIR = 0x1;
    }
}

static NEXT_INODE: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh, process-wide-unique inode number.
pub fn alloc_inode() -> u64 {
    NEXT_INODE.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Frame source
// ---------------------------------------------------------------------------

/// Supplier of page frames for filesystem data.
///
/// The kernel implements this over the PMM + HHDM; host tests implement
/// it over the system allocator.
pub trait FrameSource: Send + Sync {
    /// Allocates one zeroed frame.
    fn alloc_zeroed(&self) -> Option<PhysAddr>;
    /// Releases a frame obtained from [`alloc_zeroed`](Self::alloc_zeroed).
    fn free(&self, frame: PhysAddr);
    /// Returns a writable window onto the frame's bytes.
    fn window(&self, frame: PhysAddr) -> *mut u8;
}

// ---------------------------------------------------------------------------
// Poll heads
// ---------------------------------------------------------------------------

/// Something that can be woken when a vnode becomes ready.
///
/// The kernel's pollers wrap a waitlist; tests use flags.
pub trait PollWaker: Send + Sync {
    /// Wakes the poller.
    fn wake(&self);
}

/// Registration point for pollers watching one vnode.
pub struct PollHead {
    waiters: SpinLock<Vec<Arc<dyn PollWaker>>>,
}

impl PollHead {
    /// Creates an empty poll head.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(Vec::new()),
        }
    }

    /// Attaches a poller. The caller must [`detach`](Self::detach) it when
    /// the poll completes.
    pub fn attach(&self, waker: Arc<dyn PollWaker>) {
        self.waiters.lock().push(waker);
    }

    /// Removes a previously attached poller.
    pub fn detach(&self, waker: &Arc<dyn PollWaker>) {
        let mut waiters = self.waiters.lock();
        waiters.retain(|w| !Arc::ptr_eq(w, waker));
    }

    /// Wakes every attached poller.
    pub fn notify(&self) {
        // Clone out so wakers run without the head lock held.
        let snapshot: Vec<_> = self.waiters.lock().iter().cloned().collect();
        for waker in snapshot {
            waker.wake();
        }
    }
}

impl Default for PollHead {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Vnode and backend ops
// ---------------------------------------------------------------------------

/// The per-type operations table.
///
/// Every default returns `ENOSYS` (or an inert value), matching a backend
/// that simply does not support the operation.
#[allow(unused_variables)]
pub trait VnodeBackend: Send + Sync {
    /// Reads up to `buf.len()` bytes at `off`; returns the count read.
    fn read(&self, vn: &VnodeRef, buf: &mut [u8], off: u64) -> Result<usize, Errno> {
        Err(Errno::Enosys)
    }

    /// Writes `buf` at `off`; returns the count written.
    fn write(&self, vn: &VnodeRef, buf: &[u8], off: u64) -> Result<usize, Errno> {
        Err(Errno::Enosys)
    }

    /// Resolves one path component in a directory.
    fn lookup(&self, vn: &VnodeRef, name: &str) -> Result<VnodeRef, Errno> {
        Err(Errno::Enotdir)
    }

    /// Creates a regular file in a directory.
    fn create(&self, vn: &VnodeRef, name: &str, attr: FileAttr) -> Result<VnodeRef, Errno> {
        Err(Errno::Enosys)
    }

    /// Creates a subdirectory.
    fn mkdir(&self, vn: &VnodeRef, name: &str, attr: FileAttr) -> Result<VnodeRef, Errno> {
        Err(Errno::Enosys)
    }

    /// Creates a symlink named `name` pointing at `target`.
    fn symlink(&self, vn: &VnodeRef, name: &str, target: &str) -> Result<(), Errno> {
        Err(Errno::Enosys)
    }

    /// Reads this symlink's target.
    fn readlink(&self, vn: &VnodeRef) -> Result<String, Errno> {
        Err(Errno::Einval)
    }

    /// Removes a directory entry.
    fn unlink(&self, vn: &VnodeRef, name: &str, flags: UnlinkFlags) -> Result<(), Errno> {
        Err(Errno::Enosys)
    }

    /// Device-specific control. `arg` is an opaque user pointer already
    /// validated by the syscall layer.
    fn ioctl(&self, vn: &VnodeRef, op: u64, arg: usize) -> Result<u64, Errno> {
        Err(Errno::Enotty)
    }

    /// Returns whether the vnode is a terminal.
    fn isatty(&self, vn: &VnodeRef) -> bool {
        false
    }

    /// Fills a `stat` structure.
    fn stat(&self, vn: &VnodeRef) -> Result<Stat, Errno> {
        let mut st = Stat::default();
        st.ino = vn.inode;
        st.mode = vn.vtype.mode_bits();
        st.nlink = 1;
        Ok(st)
    }

    /// Non-blocking readiness check.
    fn poll(&self, vn: &VnodeRef, events: PollEvents) -> PollEvents {
        // Plain files are always ready.
        events & (PollEvents::IN | PollEvents::OUT)
    }

    /// Returns the registration point for pollers, if the backend
    /// supports blocking polls.
    fn poll_head(&self, vn: &VnodeRef) -> Option<&PollHead> {
        None
    }

    /// Returns the frame backing file page `index` for memory mapping,
    /// allocating it if the backend supports that.
    fn mmap_frame(&self, vn: &VnodeRef, index: u64) -> Result<PhysAddr, Errno> {
        Err(Errno::Enodev)
    }

    /// Truncates the file to `len` bytes.
    fn truncate(&self, vn: &VnodeRef, len: u64) -> Result<(), Errno> {
        Err(Errno::Enosys)
    }

    /// Current file size in bytes.
    fn size(&self, vn: &VnodeRef) -> u64 {
        0
    }

    /// Number of directory entries, for emptiness checks.
    fn entry_count(&self, vn: &VnodeRef) -> usize {
        0
    }

    /// Opaque backend-private data, keyed by an agreed tag. The socket
    /// layer uses this to recover its object from a sockfs vnode
    /// without downcasting machinery.
    fn private(&self) -> Option<&(dyn core::any::Any + Sync + Send)> {
        None
    }

    /// Final-release hook; runs exactly once, when the last reference to
    /// the vnode is dropped.
    fn close(&self) {}
}

/// Mount linkage of a vnode.
#[derive(Default)]
struct MountState {
    /// Filesystem root covering this vnode (this vnode is a mountpoint).
    mounted_here: Option<VnodeRef>,
    /// Vnode this filesystem root covers (this vnode is a mount root).
    covered: Option<Weak<Vnode>>,
}

/// The polymorphic in-memory file handle.
pub struct Vnode {
    /// File type.
    pub vtype: VnodeType,
    /// Filesystem-unique inode number.
    pub inode: u64,
    backend: alloc::boxed::Box<dyn VnodeBackend>,
    mount: SpinLock<MountState>,
}

impl Vnode {
    /// Creates a vnode with the given backend.
    #[must_use]
    pub fn new(vtype: VnodeType, backend: alloc::boxed::Box<dyn VnodeBackend>) -> VnodeRef {
        Arc::new(Self {
            vtype,
            inode: alloc_inode(),
            backend,
            mount: SpinLock::new(MountState::default()),
        })
    }

    /// Returns the backend ops table.
    #[must_use]
    pub fn ops(&self) -> &dyn VnodeBackend {
        &*self.backend
    }

    /// Follows a mountpoint to the filesystem root mounted on it, if any.
    #[must_use]
    pub fn mounted_here(&self) -> Option<VnodeRef> {
        self.mount.lock().mounted_here.clone()
    }

    /// Returns the vnode this mount root covers, if this is one.
    #[must_use]
    pub fn covered(&self) -> Option<VnodeRef> {
        self.mount.lock().covered.as_ref().and_then(Weak::upgrade)
    }

    /// Mounts `root` (a filesystem root vnode) on `mountpoint`.
    ///
    /// # Errors
    ///
    /// `EBUSY` if something is already mounted there, `ENOTDIR` if the
    /// mountpoint is not a directory.
    pub fn mount_on(mountpoint: &VnodeRef, root: VnodeRef) -> Result<(), Errno> {
        if mountpoint.vtype != VnodeType::Directory {
            return Err(Errno::Enotdir);
        }
        let mut mp_state = mountpoint.mount.lock();
        if mp_state.mounted_here.is_some() {
            return Err(Errno::Ebusy);
        }
        root.mount.lock().covered = Some(Arc::downgrade(mountpoint));
        mp_state.mounted_here = Some(root);
        Ok(())
    }
}

impl Drop for Vnode {
    fn drop(&mut self) {
        self.backend.close();
    }
}

/// A mountable filesystem.
pub trait Filesystem: Send + Sync {
    /// Backend name for diagnostics (`"tmpfs"`, `"devfs"`, …).
    fn name(&self) -> &'static str;
    /// The root directory vnode; the mount pins one reference.
    fn root(&self) -> VnodeRef;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct CountingBackend(Arc<AtomicUsize>);

    impl VnodeBackend for CountingBackend {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn close_runs_exactly_once_at_refcount_zero() {
        let closes = Arc::new(AtomicUsize::new(0));
        let vn = Vnode::new(
            VnodeType::Regular,
            alloc::boxed::Box::new(CountingBackend(closes.clone())),
        );
        let extra = vn.clone();
        drop(vn);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        drop(extra);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inode_numbers_are_unique() {
        struct Nop;
        impl VnodeBackend for Nop {}
        let a = Vnode::new(VnodeType::Regular, alloc::boxed::Box::new(Nop));
        let b = Vnode::new(VnodeType::Regular, alloc::boxed::Box::new(Nop));
        assert_ne!(a.inode, b.inode);
    }

    #[test]
    fn default_ops_refuse() {
        struct Nop;
        impl VnodeBackend for Nop {}
        let vn = Vnode::new(VnodeType::Regular, alloc::boxed::Box::new(Nop));
        assert_eq!(vn.ops().read(&vn, &mut [0; 4], 0), Err(Errno::Enosys));
        assert_eq!(vn.ops().lookup(&vn, "x").err(), Some(Errno::Enotdir));
        assert!(!vn.ops().isatty(&vn));
        let st = vn.ops().stat(&vn).unwrap();
        assert_eq!(st.ino, vn.inode);
    }

    struct FlagWaker(AtomicUsize);
    impl PollWaker for FlagWaker {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn poll_head_notify_and_detach() {
        let head = PollHead::new();
        let concrete = Arc::new(FlagWaker(AtomicUsize::new(0)));
        let waker: Arc<dyn PollWaker> = concrete.clone();
        head.attach(waker.clone());
        head.notify();
        assert_eq!(concrete.0.load(Ordering::SeqCst), 1);
        head.detach(&waker);
        head.notify();
        assert_eq!(concrete.0.load(Ordering::SeqCst), 1);
    }
}
