//! In-memory filesystem.
//!
//! Files are sparse page lists held in a [`PageCache`]; unwritten pages
//! read as zeros and are only materialized on the first write. Used for
//! `/tmp` and, populated from the initrd archive, as the root filesystem.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use salern_abi::stat::Stat;
use salern_abi::Errno;
use salern_core::addr::{PAGE_SIZE, PhysAddr};
use salern_core::sync::SpinLock;
use salern_mm::pagecache::PageCache;

use crate::{
    FileAttr, Filesystem, FrameSource, UnlinkFlags, Vnode, VnodeBackend, VnodeRef, VnodeType,
};

/// A tmpfs instance.
pub struct TmpFs {
    root: VnodeRef,
}

impl TmpFs {
    /// Creates an empty tmpfs drawing data pages from `frames`.
    #[must_use]
    pub fn new(frames: Arc<dyn FrameSource>) -> Self {
        let root = Vnode::new(
            VnodeType::Directory,
            Box::new(TmpDir {
                frames,
                parent: Weak::new(),
                entries: SpinLock::new(BTreeMap::new()),
            }),
        );
        Self { root }
    }
}

impl Filesystem for TmpFs {
    fn name(&self) -> &'static str {
        "tmpfs"
    }

    fn root(&self) -> VnodeRef {
        self.root.clone()
    }
}

// ---------------------------------------------------------------------------
// Directories
// ---------------------------------------------------------------------------

struct TmpDir {
    frames: Arc<dyn FrameSource>,
    /// Parent directory vnode; dangling for the filesystem root.
    parent: Weak<Vnode>,
    entries: SpinLock<BTreeMap<String, VnodeRef>>,
}

impl TmpDir {
    fn insert_new(
        &self,
        name: &str,
        node: VnodeRef,
    ) -> Result<VnodeRef, Errno> {
        let mut entries = self.entries.lock();
        if entries.contains_key(name) {
            return Err(Errno::Eexist);
        }
        entries.insert(name.to_string(), node.clone());
        Ok(node)
    }
}

impl VnodeBackend for TmpDir {
    fn lookup(&self, vn: &VnodeRef, name: &str) -> Result<VnodeRef, Errno> {
        if name == ".." {
            // The root's parent is the root itself.
            return Ok(self.parent.upgrade().unwrap_or_else(|| vn.clone()));
        }
        self.entries
            .lock()
            .get(name)
            .cloned()
            .ok_or(Errno::Enoent)
    }

    fn create(&self, _vn: &VnodeRef, name: &str, attr: FileAttr) -> Result<VnodeRef, Errno> {
        let node = Vnode::new(
            VnodeType::Regular,
            Box::new(TmpFile {
                frames: self.frames.clone(),
                mode: attr.mode,
                inner: SpinLock::new(FileInner {
                    pages: PageCache::new(),
                    size: 0,
                }),
            }),
        );
        self.insert_new(name, node)
    }

    fn mkdir(&self, vn: &VnodeRef, name: &str, _attr: FileAttr) -> Result<VnodeRef, Errno> {
        let node = Vnode::new(
            VnodeType::Directory,
            Box::new(TmpDir {
                frames: self.frames.clone(),
                parent: Arc::downgrade(vn),
                entries: SpinLock::new(BTreeMap::new()),
            }),
        );
        self.insert_new(name, node)
    }

    fn symlink(&self, _vn: &VnodeRef, name: &str, target: &str) -> Result<(), Errno> {
        let node = Vnode::new(
            VnodeType::Symlink,
            Box::new(TmpSymlink {
                target: target.to_string(),
            }),
        );
        self.insert_new(name, node).map(|_| ())
    }

    fn unlink(&self, _vn: &VnodeRef, name: &str, flags: UnlinkFlags) -> Result<(), Errno> {
        let mut entries = self.entries.lock();
        let node = entries.get(name).ok_or(Errno::Enoent)?;
        let is_dir = node.vtype == VnodeType::Directory;
        if flags.contains(UnlinkFlags::REMOVEDIR) {
            if !is_dir {
                return Err(Errno::Enotdir);
            }
            // Only empty directories can go.
            if node.ops().entry_count(node) > 0 {
                return Err(Errno::Enotempty);
            }
        } else if is_dir {
            return Err(Errno::Eisdir);
        }
        entries.remove(name);
        Ok(())
    }

    fn stat(&self, vn: &VnodeRef) -> Result<Stat, Errno> {
        let mut st = Stat::default();
        st.ino = vn.inode;
        st.mode = vn.vtype.mode_bits() | 0o755;
        st.nlink = 1 + self.entries.lock().len() as u32;
        st.blksize = PAGE_SIZE as u64;
        Ok(st)
    }

    fn entry_count(&self, _vn: &VnodeRef) -> usize {
        self.entries.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Regular files
// ---------------------------------------------------------------------------

struct FileInner {
    pages: PageCache,
    size: u64,
}

struct TmpFile {
    frames: Arc<dyn FrameSource>,
    mode: u32,
    inner: SpinLock<FileInner>,
}

impl TmpFile {
    /// Copies bytes out of the sparse page list; holes read as zeros.
    fn read_inner(&self, inner: &FileInner, buf: &mut [u8], off: u64) -> usize {
        if off >= inner.size {
            return 0;
        }
        let want = buf.len().min((inner.size - off) as usize);
        let mut done = 0;
        while done < want {
            let pos = off + done as u64;
            let index = pos / PAGE_SIZE as u64;
            let page_off = (pos % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - page_off).min(want - done);
            match inner.pages.get(index) {
                Some(frame) => {
                    let src = self.frames.window(frame);
                    // SAFETY: The window spans a full page owned by this
                    // file; page_off + chunk <= PAGE_SIZE.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            src.add(page_off),
                            buf[done..].as_mut_ptr(),
                            chunk,
                        );
                    }
                }
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        want
    }
}

impl VnodeBackend for TmpFile {
    fn read(&self, _vn: &VnodeRef, buf: &mut [u8], off: u64) -> Result<usize, Errno> {
        let inner = self.inner.lock();
        Ok(self.read_inner(&inner, buf, off))
    }

    fn write(&self, _vn: &VnodeRef, buf: &[u8], off: u64) -> Result<usize, Errno> {
        let mut inner = self.inner.lock();
        let mut done = 0;
        while done < buf.len() {
            let pos = off + done as u64;
            let index = pos / PAGE_SIZE as u64;
            let page_off = (pos % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            let frame = inner
                .pages
                .get_or_default(index, || self.frames.alloc_zeroed())
                .ok_or(Errno::Enomem)?;
            let dst = self.frames.window(frame);
            // SAFETY: The window spans a full page owned by this file;
            // page_off + chunk <= PAGE_SIZE.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    buf[done..].as_ptr(),
                    dst.add(page_off),
                    chunk,
                );
            }
            done += chunk;
        }
        inner.size = inner.size.max(off + buf.len() as u64);
        Ok(buf.len())
    }

    fn truncate(&self, _vn: &VnodeRef, len: u64) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        if len < inner.size {
            // Drop whole pages past the new end and zero the tail of the
            // page the new end lands in, so a later extension reads zeros.
            let keep_pages = len.div_ceil(PAGE_SIZE as u64);
            let mut doomed: Vec<u64> = Vec::new();
            inner.pages.for_each(|index, _| {
                if index >= keep_pages {
                    doomed.push(index);
                }
            });
            for index in doomed {
                if let Some(frame) = inner.pages.remove(index) {
                    self.frames.free(frame);
                }
            }
            let tail_off = (len % PAGE_SIZE as u64) as usize;
            if tail_off != 0 {
                if let Some(frame) = inner.pages.get(len / PAGE_SIZE as u64) {
                    let ptr = self.frames.window(frame);
                    // SAFETY: zeroing within one owned page.
                    unsafe {
                        core::ptr::write_bytes(ptr.add(tail_off), 0, PAGE_SIZE - tail_off);
                    }
                }
            }
        }
        inner.size = len;
        Ok(())
    }

    fn mmap_frame(&self, _vn: &VnodeRef, index: u64) -> Result<PhysAddr, Errno> {
        let mut inner = self.inner.lock();
        inner
            .pages
            .get_or_default(index, || self.frames.alloc_zeroed())
            .ok_or(Errno::Enomem)
    }

    fn size(&self, _vn: &VnodeRef) -> u64 {
        self.inner.lock().size
    }

    fn stat(&self, vn: &VnodeRef) -> Result<Stat, Errno> {
        let inner = self.inner.lock();
        let mut st = Stat::default();
        st.ino = vn.inode;
        st.mode = vn.vtype.mode_bits() | (self.mode & 0o7777);
        st.nlink = 1;
        st.size = inner.size;
        st.blksize = PAGE_SIZE as u64;
        st.blocks = (inner.pages.len() as u64 * PAGE_SIZE as u64) / 512;
        Ok(st)
    }

    fn close(&self) {
        // Last reference gone: hand every data frame back.
        let mut inner = self.inner.lock();
        let frames = self.frames.clone();
        inner.pages.release(|frame| frames.free(frame));
    }
}

// ---------------------------------------------------------------------------
// Symlinks
// ---------------------------------------------------------------------------

struct TmpSymlink {
    target: String,
}

impl VnodeBackend for TmpSymlink {
    fn readlink(&self, _vn: &VnodeRef) -> Result<String, Errno> {
        Ok(self.target.clone())
    }

    fn stat(&self, vn: &VnodeRef) -> Result<Stat, Errno> {
        let mut st = Stat::default();
        st.ino = vn.inode;
        st.mode = vn.vtype.mode_bits() | 0o777;
        st.nlink = 1;
        st.size = self.target.len() as u64;
        Ok(st)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Frame source backed by the host allocator, for unit tests.
    #[derive(Default)]
    pub struct HostFrames {
        live: Mutex<HashMap<u64, usize>>,
    }

    impl FrameSource for HostFrames {
        fn alloc_zeroed(&self) -> Option<PhysAddr> {
            let layout =
                std::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: valid non-zero layout.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            self.live.lock().unwrap().insert(ptr as u64, PAGE_SIZE);
            Some(PhysAddr::new(ptr as u64))
        }

        fn free(&self, frame: PhysAddr) {
            let removed = self.live.lock().unwrap().remove(&frame.as_u64());
            assert!(removed.is_some(), "free of unknown frame");
            let layout =
                std::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: the frame came from alloc_zeroed with this layout.
            unsafe { std::alloc::dealloc(frame.as_u64() as *mut u8, layout) };
        }

        fn window(&self, frame: PhysAddr) -> *mut u8 {
            frame.as_u64() as *mut u8
        }
    }

    impl HostFrames {
        /// Number of frames currently allocated.
        pub fn live_count(&self) -> usize {
            self.live.lock().unwrap().len()
        }
    }

    fn fs() -> (Arc<HostFrames>, TmpFs) {
        let frames = Arc::new(HostFrames::default());
        let fs = TmpFs::new(frames.clone());
        (frames, fs)
    }

    #[test]
    fn create_write_read() {
        let (_frames, fs) = fs();
        let root = fs.root();
        let f = root
            .ops()
            .create(&root, "hello", FileAttr { mode: 0o644 })
            .unwrap();
        assert_eq!(f.ops().write(&f, b"world!", 0).unwrap(), 6);

        let again = root.ops().lookup(&root, "hello").unwrap();
        let mut buf = [0u8; 16];
        let n = again.ops().read(&again, &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"world!");
    }

    #[test]
    fn sparse_holes_read_as_zeros() {
        let (_frames, fs) = fs();
        let root = fs.root();
        let f = root
            .ops()
            .create(&root, "sparse", FileAttr::default())
            .unwrap();
        // Write one byte far into the file; everything before is a hole.
        let far = 3 * PAGE_SIZE as u64 + 7;
        f.ops().write(&f, b"X", far).unwrap();
        assert_eq!(f.ops().size(&f), far + 1);

        let mut buf = [0xAAu8; 32];
        let n = f.ops().read(&f, &mut buf, far - 16).unwrap();
        assert_eq!(n, 17);
        assert!(buf[..16].iter().all(|&b| b == 0));
        assert_eq!(buf[16], b'X');
    }

    #[test]
    fn cross_page_write() {
        let (_frames, fs) = fs();
        let root = fs.root();
        let f = root.ops().create(&root, "big", FileAttr::default()).unwrap();
        let data: Vec<u8> = (0..(PAGE_SIZE * 2 + 100)).map(|i| (i % 251) as u8).collect();
        f.ops().write(&f, &data, 10).unwrap();
        let mut back = vec![0u8; data.len()];
        assert_eq!(f.ops().read(&f, &mut back, 10).unwrap(), data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn unlink_and_rmdir_rules() {
        let (_frames, fs) = fs();
        let root = fs.root();
        let d = root.ops().mkdir(&root, "d", FileAttr::default()).unwrap();
        d.ops().create(&d, "f", FileAttr::default()).unwrap();

        // Non-empty dir cannot be removed.
        assert_eq!(
            root.ops().unlink(&root, "d", UnlinkFlags::REMOVEDIR).err(),
            Some(Errno::Enotempty)
        );
        // Plain unlink refuses directories.
        assert_eq!(
            root.ops().unlink(&root, "d", UnlinkFlags::empty()).err(),
            Some(Errno::Eisdir)
        );
        d.ops().unlink(&d, "f", UnlinkFlags::empty()).unwrap();
        root.ops().unlink(&root, "d", UnlinkFlags::REMOVEDIR).unwrap();
        assert_eq!(
            root.ops().lookup(&root, "d").err(),
            Some(Errno::Enoent)
        );
    }

    #[test]
    fn frames_released_on_last_drop() {
        let (frames, fs) = fs();
        let root = fs.root();
        let f = root.ops().create(&root, "f", FileAttr::default()).unwrap();
        f.ops().write(&f, &[1u8; PAGE_SIZE * 2], 0).unwrap();
        assert_eq!(frames.live_count(), 2);

        root.ops().unlink(&root, "f", UnlinkFlags::empty()).unwrap();
        // Directory entry dropped, but `f` still holds a reference.
        assert_eq!(frames.live_count(), 2);
        drop(f);
        assert_eq!(frames.live_count(), 0);
    }

    #[test]
    fn stat_reports_size_and_type() {
        let (_frames, fs) = fs();
        let root = fs.root();
        let f = root
            .ops()
            .create(&root, "f", FileAttr { mode: 0o600 })
            .unwrap();
        f.ops().write(&f, b"12345", 0).unwrap();
        let st = f.ops().stat(&f).unwrap();
        assert_eq!(st.size, 5);
        assert_eq!(st.mode, salern_abi::stat::mode::S_IFREG | 0o600);
        let st = root.ops().stat(&root).unwrap();
        assert_eq!(st.mode & salern_abi::stat::mode::S_IFMT,
                   salern_abi::stat::mode::S_IFDIR);
    }
}
