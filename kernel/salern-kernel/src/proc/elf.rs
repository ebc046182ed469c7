//! ELF-64 loader.
//!
//! Parses the header and program headers out of a fully read image and
//! maps every `PT_LOAD` segment into a target address space with
//! permissions taken from the segment flags. The interpreter path
//! (`PT_INTERP`) and the `AT_PHDR` triple are recorded for the stack
//! preparation step.

use alloc::string::String;
use alloc::sync::Arc;

use salern_abi::Errno;
use salern_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};

use crate::arch::x86_64::mmu::PteFlags;
use crate::mm::hhdm;
use crate::mm::vmm::{AddressSpace, VmmFlags};

/// ELF magic.
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// 64-bit class.
const ELFCLASS64: u8 = 2;
/// Little-endian data.
const ELFDATA2LSB: u8 = 1;
/// x86-64 machine.
const EM_X86_64: u16 = 62;

/// Loadable segment.
const PT_LOAD: u32 = 1;
/// Interpreter path.
const PT_INTERP: u32 = 3;
/// Program-header table segment.
const PT_PHDR: u32 = 6;

/// Segment flag: executable.
const PF_X: u32 = 1;
/// Segment flag: writable.
const PF_W: u32 = 2;

/// File header.
#[derive(Clone, Copy)]
#[repr(C)]
struct Ehdr {
    ident: [u8; 16],
    etype: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

/// Program header.
#[derive(Clone, Copy)]
#[repr(C)]
struct Phdr {
    ptype: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

/// What the loader learned about an image.
pub struct LoadedElf {
    /// Entry point.
    pub entry: u64,
    /// Virtual address of the program-header table.
    pub phdr_addr: u64,
    /// Size of one program header.
    pub phent_size: u64,
    /// Number of program headers.
    pub phent_num: u64,
    /// Interpreter path, if the image requests one.
    pub interp: Option<String>,
}

fn read_struct<T: Copy>(image: &[u8], off: usize) -> Result<T, Errno> {
    let end = off.checked_add(size_of::<T>()).ok_or(Errno::Einval)?;
    if end > image.len() {
        return Err(Errno::Einval);
    }
    // SAFETY: Range-checked; T is a plain #[repr(C)] value type and the
    // read is unaligned-tolerant.
    Ok(unsafe { core::ptr::read_unaligned(image.as_ptr().add(off).cast()) })
}

/// Maps every loadable segment of `image` into `space`.
///
/// # Errors
///
/// `EINVAL` for anything that is not a 64-bit little-endian x86-64 ELF,
/// `ENOMEM` when the backing allocation fails.
pub fn load(image: &[u8], space: &Arc<AddressSpace>) -> Result<LoadedElf, Errno> {
    let ehdr: Ehdr = read_struct(image, 0)?;
    if ehdr.ident[..4] != ELF_MAGIC
        || ehdr.ident[4] != ELFCLASS64
        || ehdr.ident[5] != ELFDATA2LSB
        || ehdr.machine != EM_X86_64
    {
        return Err(Errno::Einval);
    }

    let mut out = LoadedElf {
        entry: ehdr.entry,
        phdr_addr: 0,
        phent_size: u64::from(ehdr.phentsize),
        phent_num: u64::from(ehdr.phnum),
        interp: None,
    };

    for i in 0..usize::from(ehdr.phnum) {
        let phdr: Phdr = read_struct(
            image,
            ehdr.phoff as usize + i * usize::from(ehdr.phentsize),
        )?;
        match phdr.ptype {
            PT_PHDR => out.phdr_addr = phdr.vaddr,
            PT_INTERP => {
                let start = phdr.offset as usize;
                let end = start
                    .checked_add(phdr.filesz as usize)
                    .filter(|&e| e <= image.len())
                    .ok_or(Errno::Einval)?;
                let raw = &image[start..end];
                let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                out.interp = Some(
                    core::str::from_utf8(&raw[..nul])
                        .map_err(|_| Errno::Einval)?
                        .into(),
                );
            }
            PT_LOAD => load_segment(image, space, &phdr)?,
            _ => {}
        }
    }

    if out.phdr_addr == 0 && ehdr.phoff != 0 {
        // No PT_PHDR: the table usually sits inside the first load
        // segment at its file offset.
        out.phdr_addr = ehdr.phoff; // relative; fixed up by loaders that care
    }
    Ok(out)
}

fn load_segment(image: &[u8], space: &Arc<AddressSpace>, phdr: &Phdr) -> Result<(), Errno> {
    if phdr.memsz == 0 {
        return Ok(());
    }
    let file_end = phdr
        .offset
        .checked_add(phdr.filesz)
        .filter(|&e| e as usize <= image.len())
        .ok_or(Errno::Einval)?;

    let start = VirtAddr::new(phdr.vaddr).page_base();
    let span = (phdr.vaddr - start.as_u64()) + phdr.memsz;

    let mut prot = PteFlags::USER;
    if phdr.flags & PF_W != 0 {
        prot |= PteFlags::WRITE;
    }
    if phdr.flags & PF_X == 0 {
        prot |= PteFlags::NOEXEC;
    }

    // Segments are populated eagerly: the image buffer does not survive
    // the exec, so there is nothing to fault against later. Copy with
    // write access, then drop the write bit for read-only segments.
    space.map(
        start,
        PhysAddr::zero(),
        span as usize,
        VmmFlags::ANONYMOUS | VmmFlags::EXACT | VmmFlags::ALLOCATE,
        prot | PteFlags::WRITE,
        None,
        0,
    )?;

    copy_into_space(
        space,
        VirtAddr::new(phdr.vaddr),
        &image[phdr.offset as usize..file_end as usize],
    )?;
    // memsz > filesz is BSS; ALLOCATE already zeroed it.

    if phdr.flags & PF_W == 0 {
        let pages = (span as usize).div_ceil(PAGE_SIZE);
        for i in 0..pages {
            let virt = start + ((i * PAGE_SIZE) as u64);
            space.table().chflags(virt, prot);
        }
    }
    Ok(())
}

/// Copies bytes into a (not necessarily active) address space through
/// the HHDM.
pub fn copy_into_space(
    space: &Arc<AddressSpace>,
    mut virt: VirtAddr,
    mut data: &[u8],
) -> Result<(), Errno> {
    while !data.is_empty() {
        let page = virt.page_base();
        let off = (virt - page) as usize;
        let chunk = (PAGE_SIZE - off).min(data.len());
        let (frame, _) = space.table().translate(page).ok_or(Errno::Efault)?;
        // SAFETY: The frame belongs to this segment mapping and the
        // chunk stays within one page.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                hhdm::frame_window(frame).add(off),
                chunk,
            );
        }
        virt = page + PAGE_SIZE as u64;
        data = &data[chunk..];
    }
    Ok(())
}
