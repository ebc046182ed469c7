//! Iterator over user-supplied scatter/gather lists.
//!
//! `readv`/`writev`, `sendmsg`/`recvmsg`, and the VFS `readv`/`writev` ops
//! all consume an [`IovIter`] instead of a flat buffer. The iterator hands
//! out contiguous `(address, length)` windows; actually touching the
//! memory they describe is the caller's job (and, for user pointers, the
//! caller's safety obligation).

use salern_abi::sockaddr::IoVec;

/// Cursor over an I/O vector array.
pub struct IovIter<'a> {
    iovs: &'a [IoVec],
    /// Index of the current iovec.
    cur: usize,
    /// Byte offset within the current iovec.
    cur_off: u64,
    /// Total bytes consumed so far.
    consumed: usize,
    /// Sum of all iovec lengths.
    total: usize,
}

impl<'a> IovIter<'a> {
    /// Creates an iterator positioned at the start of `iovs`.
    #[must_use]
    pub fn new(iovs: &'a [IoVec]) -> Self {
        let total = iovs.iter().map(|iov| iov.len as usize).sum();
        Self {
            iovs,
            cur: 0,
            cur_off: 0,
            consumed: 0,
            total,
        }
    }

    /// Total size of the vector in bytes.
    #[must_use]
    pub const fn total_len(&self) -> usize {
        self.total
    }

    /// Bytes consumed so far.
    #[must_use]
    pub const fn consumed(&self) -> usize {
        self.consumed
    }

    /// Bytes left to consume.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.total - self.consumed
    }

    /// Returns the next contiguous window, at most `max` bytes, and
    /// advances past it. Zero-length iovecs are skipped.
    pub fn next_window(&mut self, max: usize) -> Option<(u64, usize)> {
        if max == 0 {
            return None;
        }
        while self.cur < self.iovs.len() {
            let iov = &self.iovs[self.cur];
            let left = iov.len - self.cur_off;
            if left == 0 {
                self.cur += 1;
                self.cur_off = 0;
                continue;
            }
            let take = (left as usize).min(max);
            let addr = iov.base + self.cur_off;
            self.cur_off += take as u64;
            self.consumed += take;
            if self.cur_off == iov.len {
                self.cur += 1;
                self.cur_off = 0;
            }
            return Some((addr, take));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iov(base: u64, len: u64) -> IoVec {
        IoVec { base, len }
    }

    #[test]
    fn totals_and_traversal() {
        let iovs = [iov(0x1000, 10), iov(0x2000, 0), iov(0x3000, 5)];
        let mut it = IovIter::new(&iovs);
        assert_eq!(it.total_len(), 15);
        assert_eq!(it.remaining(), 15);

        assert_eq!(it.next_window(usize::MAX), Some((0x1000, 10)));
        // The empty iovec is skipped.
        assert_eq!(it.next_window(usize::MAX), Some((0x3000, 5)));
        assert_eq!(it.next_window(usize::MAX), None);
        assert_eq!(it.consumed(), 15);
        assert_eq!(it.remaining(), 0);
    }

    #[test]
    fn bounded_windows_split_an_iovec() {
        let iovs = [iov(0x1000, 10)];
        let mut it = IovIter::new(&iovs);
        assert_eq!(it.next_window(4), Some((0x1000, 4)));
        assert_eq!(it.next_window(4), Some((0x1004, 4)));
        assert_eq!(it.next_window(4), Some((0x1008, 2)));
        assert_eq!(it.next_window(4), None);
    }

    #[test]
    fn zero_max_yields_nothing() {
        let iovs = [iov(0x1000, 10)];
        let mut it = IovIter::new(&iovs);
        assert_eq!(it.next_window(0), None);
        assert_eq!(it.consumed(), 0);
    }

    #[test]
    fn empty_vector() {
        let mut it = IovIter::new(&[]);
        assert_eq!(it.total_len(), 0);
        assert_eq!(it.next_window(16), None);
    }
}
