//! Device filesystem.
//!
//! `/dev` maps names to device objects. A device implements [`DevOps`]
//! — the `{read, write, ioctl, isatty, poll, stat}` table — and carries
//! its own state, so registration is just "name + ops object".

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use salern_abi::stat::Stat;
use salern_abi::{Errno, PollEvents};
use salern_core::addr::PhysAddr;
use salern_core::sync::SpinLock;
use salern_fs::{
    FileAttr, Filesystem, PollHead, Vnode, VnodeBackend, VnodeRef, VnodeType,
};

/// The per-device operations table.
#[allow(unused_variables)]
pub trait DevOps: Send + Sync {
    /// Reads from the device.
    fn read(&self, buf: &mut [u8], off: u64) -> Result<usize, Errno> {
        Err(Errno::Enosys)
    }

    /// Writes to the device.
    fn write(&self, buf: &[u8], off: u64) -> Result<usize, Errno> {
        Err(Errno::Enosys)
    }

    /// Device control.
    fn ioctl(&self, op: u64, arg: usize) -> Result<u64, Errno> {
        Err(Errno::Enotty)
    }

    /// Terminal test.
    fn isatty(&self) -> bool {
        false
    }

    /// Readiness snapshot.
    fn poll(&self, events: PollEvents) -> PollEvents {
        events & (PollEvents::IN | PollEvents::OUT)
    }

    /// Poller registration point.
    fn poll_head(&self) -> Option<&PollHead> {
        None
    }

    /// Frame for memory-mapping the device (framebuffers).
    fn mmap_frame(&self, index: u64) -> Result<PhysAddr, Errno> {
        Err(Errno::Enodev)
    }
}

/// Vnode backend wrapping one device.
struct DevNode {
    ops: Arc<dyn DevOps>,
}

impl VnodeBackend for DevNode {
    fn read(&self, _vn: &VnodeRef, buf: &mut [u8], off: u64) -> Result<usize, Errno> {
        self.ops.read(buf, off)
    }

    fn write(&self, _vn: &VnodeRef, buf: &[u8], off: u64) -> Result<usize, Errno> {
        self.ops.write(buf, off)
    }

    fn ioctl(&self, _vn: &VnodeRef, op: u64, arg: usize) -> Result<u64, Errno> {
        self.ops.ioctl(op, arg)
    }

    fn isatty(&self, _vn: &VnodeRef) -> bool {
        self.ops.isatty()
    }

    fn poll(&self, _vn: &VnodeRef, events: PollEvents) -> PollEvents {
        self.ops.poll(events)
    }

    fn poll_head(&self, _vn: &VnodeRef) -> Option<&PollHead> {
        self.ops.poll_head()
    }

    fn mmap_frame(&self, _vn: &VnodeRef, index: u64) -> Result<PhysAddr, Errno> {
        self.ops.mmap_frame(index)
    }

    fn stat(&self, vn: &VnodeRef) -> Result<Stat, Errno> {
        let mut st = Stat::default();
        st.ino = vn.inode;
        st.mode = vn.vtype.mode_bits() | 0o666;
        st.nlink = 1;
        Ok(st)
    }
}

/// Shared entry map of a devfs directory.
type DirEntries = Arc<SpinLock<BTreeMap<String, VnodeRef>>>;

/// Registry from directory inode to its entry map, so [`register`] can
/// insert nodes without downcasting through the backend trait.
static DIRS: SpinLock<BTreeMap<u64, DirEntries>> = SpinLock::new(BTreeMap::new());

/// Directory of device nodes.
struct DevDir {
    entries: DirEntries,
}

fn new_dev_dir() -> VnodeRef {
    let entries: DirEntries = Arc::new(SpinLock::new(BTreeMap::new()));
    let node = Vnode::new(
        VnodeType::Directory,
        Box::new(DevDir {
            entries: entries.clone(),
        }),
    );
    DIRS.lock().insert(node.inode, entries);
    node
}

impl VnodeBackend for DevDir {
    fn lookup(&self, vn: &VnodeRef, name: &str) -> Result<VnodeRef, Errno> {
        if name == ".." {
            // devfs is flat; `..` stays at its root, the mount covering
            // logic hops to the parent filesystem.
            return Ok(vn.clone());
        }
        self.entries
            .lock()
            .get(name)
            .cloned()
            .ok_or(Errno::Enoent)
    }

    fn mkdir(&self, _vn: &VnodeRef, name: &str, _attr: FileAttr) -> Result<VnodeRef, Errno> {
        let mut entries = self.entries.lock();
        if entries.contains_key(name) {
            return Err(Errno::Eexist);
        }
        let node = new_dev_dir();
        entries.insert(name.to_string(), node.clone());
        Ok(node)
    }

    fn entry_count(&self, _vn: &VnodeRef) -> usize {
        self.entries.lock().len()
    }

    fn stat(&self, vn: &VnodeRef) -> Result<Stat, Errno> {
        let mut st = Stat::default();
        st.ino = vn.inode;
        st.mode = vn.vtype.mode_bits() | 0o755;
        st.nlink = 1;
        Ok(st)
    }
}

/// The device filesystem.
pub struct DevFs {
    root: VnodeRef,
}

impl DevFs {
    /// Creates an empty devfs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: new_dev_dir(),
        }
    }
}

impl Default for DevFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for DevFs {
    fn name(&self) -> &'static str {
        "devfs"
    }

    fn root(&self) -> VnodeRef {
        self.root.clone()
    }
}

static DEVFS_ROOT: SpinLock<Option<VnodeRef>> = SpinLock::new(None);

/// Records the mounted devfs instance for later registrations.
pub fn install(fs: DevFs) {
    *DEVFS_ROOT.lock() = Some(fs.root());
    core::mem::forget(fs);
}

/// Registers a device node.
///
/// `dir` defaults to the devfs root. The returned vnode is also kept in
/// the directory, so devices live until unregistered (never, today).
pub fn register(
    dir: Option<&VnodeRef>,
    name: &str,
    ops: Arc<dyn DevOps>,
    vtype: VnodeType,
) -> Result<VnodeRef, Errno> {
    let root = DEVFS_ROOT.lock().clone().ok_or(Errno::Enodev)?;
    let dir = dir.unwrap_or(&root);
    let node = Vnode::new(vtype, Box::new(DevNode { ops }));

    let entries = DIRS.lock().get(&dir.inode).cloned().ok_or(Errno::Enotdir)?;
    let mut entries = entries.lock();
    if entries.contains_key(name) {
        return Err(Errno::Eexist);
    }
    entries.insert(name.to_string(), node.clone());
    crate::kdebug!("devfs: registered /dev/{name}");
    Ok(node)
}

/// Creates (or finds) a subdirectory under the devfs root.
pub fn register_dir(name: &str) -> Result<VnodeRef, Errno> {
    let root = DEVFS_ROOT.lock().clone().ok_or(Errno::Enodev)?;
    match root.ops().mkdir(&root, name, FileAttr { mode: 0o755 }) {
        Ok(dir) => Ok(dir),
        Err(Errno::Eexist) => root.ops().lookup(&root, name),
        Err(e) => Err(e),
    }
}

/// Inserts a fully built vnode (TTY nodes carry their own backend).
pub fn register_node(name: &str, node: VnodeRef) -> Result<VnodeRef, Errno> {
    let root = DEVFS_ROOT.lock().clone().ok_or(Errno::Enodev)?;
    let entries = DIRS.lock().get(&root.inode).cloned().ok_or(Errno::Enotdir)?;
    let mut entries = entries.lock();
    if entries.contains_key(name) {
        return Err(Errno::Eexist);
    }
    entries.insert(name.to_string(), node.clone());
    crate::kdebug!("devfs: registered /dev/{name}");
    Ok(node)
}
