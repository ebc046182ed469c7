//! Program execution.
//!
//! `execve` builds a fresh address space from an ELF image, lays out
//! argv/envp and the auxiliary vector on a new user stack, swaps the
//! spaces, and rewrites the trap frame so the return to ring 3 lands on
//! the new entry point.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use salern_abi::signal::{SIG_DFL, SIG_IGN};
use salern_abi::{Errno, auxv};
use salern_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use salern_fs::lookup;

use crate::arch::x86_64::context::CpuContext;
use crate::arch::x86_64::mmu::PteFlags;
use crate::config::USTACK_PAGES;
use crate::mm::vmm::{AddressSpace, VmmFlags};
use crate::proc::{Process, elf};

/// Top of the user stack mapping.
const USER_STACK_TOP: u64 = 0x0000_7fff_ffff_0000;

/// Reads a whole file through the VFS.
fn read_image(proc: &Arc<Process>, path: &str) -> Result<Vec<u8>, Errno> {
    let root = proc.root.lock().clone();
    let cwd = proc.cwd.lock().clone();
    let vnode = lookup::resolve(path, &root, &cwd, true)?;
    let size = vnode.ops().size(&vnode) as usize;
    let mut image = alloc::vec![0u8; size];
    let mut done = 0;
    while done < size {
        let n = vnode.ops().read(&vnode, &mut image[done..], done as u64)?;
        if n == 0 {
            return Err(Errno::Eio);
        }
        done += n;
    }
    Ok(image)
}

/// Builds a fresh user image for `path` in a new address space.
///
/// Returns the space and the initial user context (entry + stack).
pub fn build_image(
    proc: &Arc<Process>,
    path: &str,
    argv: &[String],
    envp: &[String],
) -> Result<(Arc<AddressSpace>, CpuContext), Errno> {
    let image = read_image(proc, path)?;
    let space = AddressSpace::new()?;
    let loaded = elf::load(&image, &space)?;
    if let Some(interp) = &loaded.interp {
        // Static binaries only; the dynamic linker path is recorded for
        // diagnostics.
        crate::kdebug!("exec: {path} requests interpreter {interp}");
    }

    // The stack, eagerly populated (the argv block is written now).
    let stack_len = USTACK_PAGES * PAGE_SIZE;
    let stack_base = VirtAddr::new(USER_STACK_TOP - stack_len as u64);
    space.map(
        stack_base,
        PhysAddr::zero(),
        stack_len,
        VmmFlags::ANONYMOUS | VmmFlags::EXACT | VmmFlags::ALLOCATE,
        PteFlags::USER | PteFlags::WRITE | PteFlags::NOEXEC,
        None,
        0,
    )?;

    let rsp = prepare_stack(&space, &loaded, argv, envp)?;
    Ok((space, CpuContext::new_user(loaded.entry, rsp)))
}

/// Replaces the current image of `proc` (the execve body).
///
/// On success the caller's trap frame has been rewritten wholesale; the
/// syscall return must be discarded.
pub fn execve(
    proc: &Arc<Process>,
    path: &str,
    argv: &[String],
    envp: &[String],
    ctx: &mut CpuContext,
) -> Result<(), Errno> {
    let (space, user_ctx) = build_image(proc, path, argv, envp)?;

    // Point of no return: swap spaces, retire the old image.
    let old = proc.replace_space(space.clone());
    space.switch();
    old.destroy();

    proc.fds.lock().close_cloexec();

    // Dispositions with user handlers reset to default; DFL/IGN stay.
    {
        let mut actions = proc.sigactions.lock();
        for action in actions.iter_mut() {
            if action.handler != SIG_DFL && action.handler != SIG_IGN {
                *action = salern_abi::signal::SigAction::default_action();
            }
        }
    }

    if let Some(thread) = crate::percpu::cpu_get().current_thread() {
        thread.fpu.lock().reset();
    }

    *ctx = user_ctx;
    Ok(())
}

/// Lays out the initial stack: strings, auxv, envp, argv, argc.
///
/// Returns the user RSP to start with.
fn prepare_stack(
    space: &Arc<AddressSpace>,
    loaded: &elf::LoadedElf,
    argv: &[String],
    envp: &[String],
) -> Result<u64, Errno> {
    let mut sp = USER_STACK_TOP;

    // String data, pushed top-down.
    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        sp -= arg.len() as u64 + 1;
        elf::copy_into_space(space, VirtAddr::new(sp), arg.as_bytes())?;
        elf::copy_into_space(space, VirtAddr::new(sp + arg.len() as u64), &[0])?;
        argv_ptrs.push(sp);
    }
    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for env in envp.iter().rev() {
        sp -= env.len() as u64 + 1;
        elf::copy_into_space(space, VirtAddr::new(sp), env.as_bytes())?;
        elf::copy_into_space(space, VirtAddr::new(sp + env.len() as u64), &[0])?;
        envp_ptrs.push(sp);
    }
    argv_ptrs.reverse();
    envp_ptrs.reverse();

    // Vector area, built low-to-high then written at its final place:
    // argc, argv[]..NULL, envp[]..NULL, auxv pairs, AT_NULL.
    let mut vec_words: Vec<u64> = Vec::new();
    vec_words.push(argv.len() as u64);
    vec_words.extend_from_slice(&argv_ptrs);
    vec_words.push(0);
    vec_words.extend_from_slice(&envp_ptrs);
    vec_words.push(0);
    for (tag, value) in [
        (auxv::AT_PHDR, loaded.phdr_addr),
        (auxv::AT_PHENT, loaded.phent_size),
        (auxv::AT_PHNUM, loaded.phent_num),
        (auxv::AT_ENTRY, loaded.entry),
        (auxv::AT_NULL, 0),
    ] {
        vec_words.push(tag);
        vec_words.push(value);
    }

    // 16-byte alignment of the final RSP, with argc at the very top.
    sp &= !0xf;
    let vec_bytes = vec_words.len() * 8;
    sp -= vec_bytes as u64;
    sp &= !0xf;
    for (i, word) in vec_words.iter().enumerate() {
        write_user_u64(space, sp + (i * 8) as u64, *word)?;
    }
    Ok(sp)
}

fn write_user_u64(space: &Arc<AddressSpace>, virt: u64, value: u64) -> Result<(), Errno> {
    elf::copy_into_space(space, VirtAddr::new(virt), &value.to_le_bytes())
}
