//! USTAR / GNU tar reader.
//!
//! The initrd module is a GNU tar archive; this module walks its 512-byte
//! header blocks and extracts the contents into a directory vnode.
//! Handled header types: regular files, directories, symlinks, and the
//! GNU `L` (long name) / `K` (long link target) extension records. The
//! archive's own ordering guarantees parents before children, but
//! extraction also creates missing intermediate directories so damaged
//! orderings still unpack.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use salern_abi::Errno;

use crate::{path, FileAttr, UnlinkFlags, VnodeRef, VnodeType};

/// Size of one archive block.
const BLOCK: usize = 512;

/// What one archive member is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// One archive member.
pub struct TarEntry<'a> {
    /// Full path within the archive.
    pub name: String,
    /// Member type.
    pub kind: TarKind,
    /// File contents (empty for directories and symlinks).
    pub data: &'a [u8],
    /// Symlink target.
    pub link_target: String,
    /// Permission bits from the header.
    pub mode: u32,
}

/// Iterator over archive members.
pub struct TarIter<'a> {
    archive: &'a [u8],
    off: usize,
}

/// Returns an iterator over the members of `archive`.
#[must_use]
pub fn entries(archive: &[u8]) -> TarIter<'_> {
    TarIter { archive, off: 0 }
}

impl<'a> Iterator for TarIter<'a> {
    type Item = Result<TarEntry<'a>, Errno>;

    fn next(&mut self) -> Option<Self::Item> {
        // GNU extension records carry the oversized name/target for the
        // *following* header.
        let mut long_name: Option<String> = None;
        let mut long_link: Option<String> = None;

        loop {
            let header = match self.take_block() {
                Some(h) => h,
                None => return None,
            };
            // Two zero blocks mark the end; one is enough to stop.
            if header.iter().all(|&b| b == 0) {
                return None;
            }

            let size = match parse_octal(&header[124..136]) {
                Some(s) => s as usize,
                None => return Some(Err(Errno::Einval)),
            };
            let data = match self.take_data(size) {
                Some(d) => d,
                None => return Some(Err(Errno::Einval)),
            };
            let typeflag = header[156];

            match typeflag {
                b'L' => {
                    long_name = Some(cstr(data).to_string());
                }
                b'K' => {
                    long_link = Some(cstr(data).to_string());
                }
                b'0' | 0 | b'5' | b'2' => {
                    let name = long_name
                        .take()
                        .unwrap_or_else(|| header_name(header));
                    let link_target = long_link
                        .take()
                        .unwrap_or_else(|| cstr(&header[157..257]).to_string());
                    let kind = match typeflag {
                        b'5' => TarKind::Directory,
                        b'2' => TarKind::Symlink,
                        _ => TarKind::File,
                    };
                    let mode =
                        parse_octal(&header[100..108]).unwrap_or(0o644) as u32;
                    return Some(Ok(TarEntry {
                        name,
                        kind,
                        data,
                        link_target,
                        mode,
                    }));
                }
                // Hard links, FIFOs, char/block devices: not carried by
                // the initrd; skip them.
                _ => {
                    long_name = None;
                    long_link = None;
                }
            }
        }
    }
}

impl<'a> TarIter<'a> {
    fn take_block(&mut self) -> Option<&'a [u8]> {
        if self.off + BLOCK > self.archive.len() {
            return None;
        }
        let block = &self.archive[self.off..self.off + BLOCK];
        self.off += BLOCK;
        Some(block)
    }

    fn take_data(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.off + size > self.archive.len() {
            return None;
        }
        let data = &self.archive[self.off..self.off + size];
        self.off += size.div_ceil(BLOCK) * BLOCK;
        Some(data)
    }
}

/// Assembles the member path from the ustar `prefix` and `name` fields.
fn header_name(header: &[u8]) -> String {
    let name = cstr(&header[0..100]);
    let prefix = if &header[257..262] == b"ustar" {
        cstr(&header[345..500])
    } else {
        ""
    };
    if prefix.is_empty() {
        name.to_string()
    } else {
        let mut full = String::with_capacity(prefix.len() + 1 + name.len());
        full.push_str(prefix);
        full.push('/');
        full.push_str(name);
        full
    }
}

/// Interprets a NUL-terminated byte field as UTF-8 (lossy fields are
/// rejected by returning the valid prefix).
fn cstr(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

/// Parses an octal-ASCII numeric field (NUL or space padded).
fn parse_octal(field: &[u8]) -> Option<u64> {
    let mut value = 0u64;
    let mut seen = false;
    for &b in field {
        match b {
            b'0'..=b'7' => {
                value = value.checked_mul(8)? + u64::from(b - b'0');
                seen = true;
            }
            b' ' | 0 => {
                if seen {
                    break;
                }
            }
            _ => return None,
        }
    }
    seen.then_some(value)
}

/// Extracts every member of `archive` under `root`.
///
/// Missing intermediate directories are created on demand; the `.`
/// directory entry is skipped. Returns the number of members created.
///
/// # Errors
///
/// Propagates backend errors and `EINVAL` for a truncated archive.
pub fn extract(archive: &[u8], root: &VnodeRef) -> Result<usize, Errno> {
    let mut created = 0;
    for entry in entries(archive) {
        let entry = entry?;
        let name = entry
            .name
            .trim_start_matches("./")
            .trim_start_matches('/')
            .trim_end_matches('/');
        if name.is_empty() || name == "." {
            continue;
        }

        let comps: Vec<&str> = path::components(name).collect();
        let (dirs, last) = comps.split_at(comps.len() - 1);
        let mut cur = root.clone();
        for comp in dirs {
            cur = match cur.ops().lookup(&cur, comp) {
                Ok(existing) => existing,
                Err(Errno::Enoent) => {
                    cur.ops().mkdir(&cur, comp, FileAttr { mode: 0o755 })?
                }
                Err(e) => return Err(e),
            };
        }
        let last = last[0];

        match entry.kind {
            TarKind::Directory => {
                match cur.ops().mkdir(&cur, last, FileAttr { mode: entry.mode }) {
                    Ok(_) | Err(Errno::Eexist) => {}
                    Err(e) => return Err(e),
                }
            }
            TarKind::File => {
                // Replace an existing file wholesale (archive wins).
                if let Ok(existing) = cur.ops().lookup(&cur, last) {
                    if existing.vtype == VnodeType::Regular {
                        cur.ops().unlink(&cur, last, UnlinkFlags::empty())?;
                    }
                }
                let file =
                    cur.ops().create(&cur, last, FileAttr { mode: entry.mode })?;
                let written = file.ops().write(&file, entry.data, 0)?;
                if written != entry.data.len() {
                    return Err(Errno::Eio);
                }
            }
            TarKind::Symlink => {
                cur.ops().symlink(&cur, last, &entry.link_target)?;
            }
        }
        created += 1;
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup;
    use crate::tmpfs::{tests::HostFrames, TmpFs};
    use crate::Filesystem;
    use alloc::sync::Arc;

    /// Builds one valid tar header block.
    fn header(name: &str, size: usize, typeflag: u8, link: &str) -> [u8; BLOCK] {
        let mut h = [0u8; BLOCK];
        h[..name.len()].copy_from_slice(name.as_bytes());
        h[100..107].copy_from_slice(b"0000644");
        let size_field = format!("{size:011o}");
        h[124..124 + 11].copy_from_slice(size_field.as_bytes());
        h[136..147].copy_from_slice(b"00000000000");
        h[156] = typeflag;
        h[157..157 + link.len()].copy_from_slice(link.as_bytes());
        h[257..263].copy_from_slice(b"ustar\0");
        h[263..265].copy_from_slice(b"00");
        // Checksum: field treated as spaces while summing.
        h[148..156].copy_from_slice(b"        ");
        let sum: u32 = h.iter().map(|&b| u32::from(b)).sum();
        let chk = format!("{sum:06o}\0 ");
        h[148..156].copy_from_slice(chk.as_bytes());
        h
    }

    fn push_entry(out: &mut Vec<u8>, name: &str, data: &[u8], typeflag: u8, link: &str) {
        out.extend_from_slice(&header(name, data.len(), typeflag, link));
        out.extend_from_slice(data);
        let pad = data.len().div_ceil(BLOCK) * BLOCK - data.len();
        out.extend(core::iter::repeat_n(0u8, pad));
    }

    fn sample_archive() -> Vec<u8> {
        let mut ar = Vec::new();
        push_entry(&mut ar, "./", &[], b'5', "");
        push_entry(&mut ar, "boot/", &[], b'5', "");
        push_entry(&mut ar, "boot/init", b"\x7fELF-fake", b'0', "");
        push_entry(&mut ar, "etc/", &[], b'5', "");
        push_entry(&mut ar, "etc/motd", b"welcome to salernos\n", b'0', "");
        push_entry(&mut ar, "etc/motd.link", &[], b'2', "motd");
        ar.extend(core::iter::repeat_n(0u8, BLOCK * 2));
        ar
    }

    #[test]
    fn parses_members_in_order() {
        let ar = sample_archive();
        let names: Vec<String> = entries(&ar)
            .map(|e| e.unwrap().name)
            .collect();
        assert_eq!(
            names,
            ["./", "boot/", "boot/init", "etc/", "etc/motd", "etc/motd.link"]
        );
    }

    #[test]
    fn octal_fields() {
        assert_eq!(parse_octal(b"0000644\0"), Some(0o644));
        assert_eq!(parse_octal(b"00000000000\0"), Some(0));
        assert_eq!(parse_octal(b"        "), None);
        assert_eq!(parse_octal(b"12x"), None);
    }

    #[test]
    fn gnu_long_name_record() {
        let long = "d/".repeat(80) + "leaf"; // 164 chars, past the 100 limit
        let mut ar = Vec::new();
        let mut name_data = long.clone().into_bytes();
        name_data.push(0);
        push_entry(&mut ar, "././@LongLink", &name_data, b'L', "");
        push_entry(&mut ar, &long[..100], b"payload", b'0', "");
        ar.extend(core::iter::repeat_n(0u8, BLOCK * 2));

        let entry = entries(&ar).next().unwrap().unwrap();
        assert_eq!(entry.name, long);
        assert_eq!(entry.data, b"payload");
    }

    #[test]
    fn extract_then_walk_roundtrip() {
        let fs = TmpFs::new(Arc::new(HostFrames::default()));
        let root = fs.root();
        let ar = sample_archive();
        let created = extract(&ar, &root).unwrap();
        assert_eq!(created, 5); // "." skipped

        let motd = lookup::resolve("/etc/motd", &root, &root, true).unwrap();
        let mut buf = [0u8; 64];
        let n = motd.ops().read(&motd, &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"welcome to salernos\n");

        // The symlink resolves to the same contents.
        let via = lookup::resolve("/etc/motd.link", &root, &root, true).unwrap();
        assert_eq!(via.inode, motd.inode);

        let init = lookup::resolve("/boot/init", &root, &root, true).unwrap();
        assert_eq!(init.ops().size(&init), 9);
    }

    #[test]
    fn extract_creates_missing_parents() {
        let fs = TmpFs::new(Arc::new(HostFrames::default()));
        let root = fs.root();
        let mut ar = Vec::new();
        // No directory entries at all.
        push_entry(&mut ar, "a/b/c.txt", b"deep", b'0', "");
        ar.extend(core::iter::repeat_n(0u8, BLOCK * 2));
        extract(&ar, &root).unwrap();
        let f = lookup::resolve("/a/b/c.txt", &root, &root, true).unwrap();
        assert_eq!(f.vtype, VnodeType::Regular);
    }

    #[test]
    fn truncated_archive_is_einval() {
        let mut ar = Vec::new();
        push_entry(&mut ar, "f", b"data", b'0', "");
        ar.truncate(BLOCK + 1); // header + torn data
        let err = entries(&ar).next().unwrap().err();
        assert_eq!(err, Some(Errno::Einval));
    }
}
