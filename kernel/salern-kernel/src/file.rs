//! Open files and per-process descriptor tables.
//!
//! A [`File`] is the open-file state shared by duplicated descriptors
//! and across `fork`: one vnode reference, one seek offset, one set of
//! status flags. The descriptor table is a fixed array of
//! [`OPEN_MAX`] slots, each holding a file reference plus the
//! per-descriptor close-on-exec bit.

use alloc::sync::Arc;

use salern_abi::{Errno, OPEN_MAX, OpenFlags};
use salern_core::sync::SpinLock;
use salern_fs::VnodeRef;

/// Shared open-file state.
pub struct File {
    /// The open vnode; holds one reference for the file's lifetime.
    pub vnode: VnodeRef,
    /// Seek offset, with its own lock (offsets move independently of
    /// the table).
    pub offset: SpinLock<u64>,
    /// Status flags (`O_APPEND`, `O_NONBLOCK`, …).
    pub flags: SpinLock<OpenFlags>,
}

/// Shared handle to an open file.
pub type FileRef = Arc<File>;

impl File {
    /// Opens a vnode into a fresh file object.
    #[must_use]
    pub fn new(vnode: VnodeRef, flags: OpenFlags) -> FileRef {
        Arc::new(Self {
            vnode,
            offset: SpinLock::new(0),
            flags: SpinLock::new(flags),
        })
    }

    /// Whether the file was opened readable.
    #[must_use]
    pub fn readable(&self) -> bool {
        let flags = *self.flags.lock();
        !flags.contains(OpenFlags::WRONLY) || flags.contains(OpenFlags::RDWR)
    }

    /// Whether the file was opened writable.
    #[must_use]
    pub fn writable(&self) -> bool {
        let flags = *self.flags.lock();
        flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

/// One descriptor-table slot.
#[derive(Clone)]
pub struct FdEntry {
    /// The open file.
    pub file: FileRef,
    /// Close this descriptor on `execve`.
    pub cloexec: bool,
}

/// Per-process descriptor table.
pub struct FdTable {
    slots: [Option<FdEntry>; OPEN_MAX],
}

impl FdTable {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; OPEN_MAX],
        }
    }

    /// Installs `file` in the lowest free slot at or above `min`.
    ///
    /// # Errors
    ///
    /// `EMFILE` when the table is full.
    pub fn insert(&mut self, file: FileRef, cloexec: bool, min: usize) -> Result<i32, Errno> {
        for (fd, slot) in self.slots.iter_mut().enumerate().skip(min) {
            if slot.is_none() {
                *slot = Some(FdEntry { file, cloexec });
                return Ok(fd as i32);
            }
        }
        Err(Errno::Emfile)
    }

    /// Installs `file` at a specific descriptor, closing what was there.
    pub fn insert_at(&mut self, fd: usize, file: FileRef, cloexec: bool) -> Result<(), Errno> {
        if fd >= OPEN_MAX {
            return Err(Errno::Ebadf);
        }
        self.slots[fd] = Some(FdEntry { file, cloexec });
        Ok(())
    }

    /// Looks up an open file.
    pub fn get(&self, fd: i32) -> Result<FileRef, Errno> {
        self.entry(fd).map(|e| e.file.clone())
    }

    /// Looks up a slot.
    pub fn entry(&self, fd: i32) -> Result<&FdEntry, Errno> {
        if fd < 0 || fd as usize >= OPEN_MAX {
            return Err(Errno::Ebadf);
        }
        self.slots[fd as usize].as_ref().ok_or(Errno::Ebadf)
    }

    /// Mutable slot access (fcntl `FD_CLOEXEC` updates).
    pub fn entry_mut(&mut self, fd: i32) -> Result<&mut FdEntry, Errno> {
        if fd < 0 || fd as usize >= OPEN_MAX {
            return Err(Errno::Ebadf);
        }
        self.slots[fd as usize].as_mut().ok_or(Errno::Ebadf)
    }

    /// Closes a descriptor.
    pub fn close(&mut self, fd: i32) -> Result<(), Errno> {
        if fd < 0 || fd as usize >= OPEN_MAX {
            return Err(Errno::Ebadf);
        }
        self.slots[fd as usize].take().ok_or(Errno::Ebadf)?;
        Ok(())
    }

    /// `dup3`: duplicates `old` onto `new`, closing `new` first.
    pub fn dup3(&mut self, old: i32, new: i32, cloexec: bool) -> Result<i32, Errno> {
        if old == new {
            return Err(Errno::Einval);
        }
        let file = self.get(old)?;
        self.insert_at(new as usize, file, cloexec)?;
        Ok(new)
    }

    /// Drops every descriptor marked close-on-exec.
    pub fn close_cloexec(&mut self) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|e| e.cloexec) {
                *slot = None;
            }
        }
    }

    /// Clones the table for `fork`; every file's refcount goes up by
    /// way of the shared `Arc`s.
    #[must_use]
    pub fn fork_clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }

    /// Number of open descriptors.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salern_fs::{Vnode, VnodeBackend, VnodeType};

    struct Nop;
    impl VnodeBackend for Nop {}

    fn file() -> FileRef {
        File::new(
            Vnode::new(VnodeType::Regular, alloc::boxed::Box::new(Nop)),
            OpenFlags::RDWR,
        )
    }

    #[test]
    fn inserts_use_lowest_free_slot() {
        let mut table = FdTable::new();
        assert_eq!(table.insert(file(), false, 0).unwrap(), 0);
        assert_eq!(table.insert(file(), false, 0).unwrap(), 1);
        table.close(0).unwrap();
        assert_eq!(table.insert(file(), false, 0).unwrap(), 0);
        assert_eq!(table.insert(file(), false, 3).unwrap(), 3);
    }

    #[test]
    fn table_fills_at_open_max() {
        let mut table = FdTable::new();
        for _ in 0..OPEN_MAX {
            table.insert(file(), false, 0).unwrap();
        }
        assert_eq!(table.insert(file(), false, 0).err(), Some(Errno::Emfile));
    }

    #[test]
    fn bad_descriptors() {
        let mut table = FdTable::new();
        assert_eq!(table.get(-1).err(), Some(Errno::Ebadf));
        assert_eq!(table.get(0).err(), Some(Errno::Ebadf));
        assert_eq!(table.get(OPEN_MAX as i32).err(), Some(Errno::Ebadf));
        assert_eq!(table.close(7).err(), Some(Errno::Ebadf));
    }

    #[test]
    fn dup3_shares_the_file_object() {
        let mut table = FdTable::new();
        let fd = table.insert(file(), false, 0).unwrap();
        table.dup3(fd, 5, false).unwrap();
        let a = table.get(fd).unwrap();
        let b = table.get(5).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        // Offsets are shared too.
        *a.offset.lock() = 42;
        assert_eq!(*b.offset.lock(), 42);
    }

    #[test]
    fn cloexec_sweep() {
        let mut table = FdTable::new();
        let keep = table.insert(file(), false, 0).unwrap();
        let drop_ = table.insert(file(), true, 0).unwrap();
        table.close_cloexec();
        assert!(table.get(keep).is_ok());
        assert_eq!(table.get(drop_).err(), Some(Errno::Ebadf));
    }

    #[test]
    fn fork_clone_shares_files() {
        let mut table = FdTable::new();
        let fd = table.insert(file(), false, 0).unwrap();
        let child = table.fork_clone();
        let a = table.get(fd).unwrap();
        let b = child.get(fd).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(Arc::strong_count(&a), 4); // both tables + both locals
    }

    #[test]
    fn readable_writable_flags() {
        let vn = Vnode::new(VnodeType::Regular, alloc::boxed::Box::new(Nop));
        let ro = File::new(vn.clone(), OpenFlags::RDONLY);
        assert!(ro.readable());
        assert!(!ro.writable());
        let wo = File::new(vn.clone(), OpenFlags::WRONLY);
        assert!(!wo.readable());
        assert!(wo.writable());
        let rw = File::new(vn, OpenFlags::RDWR);
        assert!(rw.readable());
        assert!(rw.writable());
    }
}
