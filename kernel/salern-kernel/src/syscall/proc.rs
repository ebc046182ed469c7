//! Process, thread, and signal syscalls.

use alloc::string::String;
use alloc::vec::Vec;

use salern_abi::signal::{
    NSIG, SIG_BLOCK, SIG_SETMASK, SIG_UNBLOCK, SigAction, SigSet,
};
use salern_abi::stat::Timespec;
use salern_abi::{Errno, wait};

use crate::arch::x86_64::context::CpuContext;
use crate::percpu;
use crate::proc::{self, exec, signal, thread::Thread};
use crate::sched;
use crate::syscall::{SyscallResult, userptr};

pub fn sys_fork(ctx: &mut CpuContext, _a1: u64, _a2: u64, _a3: u64, _a4: u64) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let pid = proc::fork(&proc, ctx)?;
        Ok(u64::from(pid))
    })();
    SyscallResult::from_result(result)
}

/// Reads a NULL-terminated array of string pointers from user memory.
fn read_string_vec(ptr: u64) -> Result<Vec<String>, Errno> {
    let mut out = Vec::new();
    if ptr == 0 {
        return Ok(out);
    }
    let mut cursor = ptr;
    loop {
        if out.len() > 256 {
            return Err(Errno::Einval);
        }
        let entry: u64 = userptr::read_struct(cursor)?;
        if entry == 0 {
            break;
        }
        out.push(userptr::read_cstr(entry)?);
        cursor += 8;
    }
    Ok(out)
}

pub fn sys_execve(
    ctx: &mut CpuContext,
    path_ptr: u64,
    argv_ptr: u64,
    envp_ptr: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let path = userptr::read_cstr(path_ptr)?;
        let argv = read_string_vec(argv_ptr)?;
        let envp = read_string_vec(envp_ptr)?;
        exec::execve(&proc, &path, &argv, &envp, ctx)
    })();
    match result {
        // The context was rebuilt wholesale; registers must stay put.
        Ok(()) => SyscallResult::discarded(),
        Err(e) => SyscallResult::err(e),
    }
}

pub fn sys_exit(_ctx: &mut CpuContext, status: u64, _a2: u64, _a3: u64, _a4: u64) -> SyscallResult {
    proc::exit_current(wait::exited(status as u8));
}

pub fn sys_exit_thread(
    _ctx: &mut CpuContext,
    _a1: u64,
    _a2: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    let current = percpu::cpu_get().current_thread();
    if let (Some(proc), Some(thread)) = (proc::current(), current) {
        let mut threads = proc.threads.lock();
        let only_thread = threads.len() == 1;
        threads.retain(|t| !alloc::sync::Arc::ptr_eq(t, &thread));
        drop(threads);
        if only_thread {
            // Last thread out turns off the lights.
            proc::exit_current(wait::exited(0));
        }
    }
    sched::exit_current();
}

pub fn sys_waitpid(
    _ctx: &mut CpuContext,
    pid: u64,
    status_ptr: u64,
    flags: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let (child, status) = proc::waitpid(pid as i64 as i32, flags as u32)?;
        if status_ptr != 0 && child != 0 {
            userptr::write_struct(status_ptr, &status)?;
        }
        Ok(u64::from(child))
    })();
    SyscallResult::from_result(result)
}

/// `clone(entry, stack, arg)` — creates a thread in the calling process.
pub fn sys_clone(
    _ctx: &mut CpuContext,
    entry: u64,
    stack: u64,
    arg: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        if entry == 0 || stack == 0 {
            return Err(Errno::Einval);
        }
        let mut ctx = CpuContext::new_user(entry, stack);
        ctx.rdi = arg;
        let thread = Thread::new_user(&proc, ctx).ok_or(Errno::Enomem)?;
        let tid = thread.tid;
        proc.attach_thread(thread.clone());
        sched::enqueue(thread);
        Ok(u64::from(tid))
    })();
    SyscallResult::from_result(result)
}

pub fn sys_getpid(_ctx: &mut CpuContext, _a1: u64, _a2: u64, _a3: u64, _a4: u64) -> SyscallResult {
    match proc::current() {
        Some(p) => SyscallResult::ok(u64::from(p.pid)),
        None => SyscallResult::err(Errno::Esrch),
    }
}

pub fn sys_getppid(_ctx: &mut CpuContext, _a1: u64, _a2: u64, _a3: u64, _a4: u64) -> SyscallResult {
    match proc::current() {
        Some(p) => SyscallResult::ok(u64::from(*p.ppid.lock())),
        None => SyscallResult::err(Errno::Esrch),
    }
}

pub fn sys_getpgid(_ctx: &mut CpuContext, pid: u64, _a2: u64, _a3: u64, _a4: u64) -> SyscallResult {
    SyscallResult::from_result(proc::getpgid(pid as u32).map(u64::from))
}

pub fn sys_setpgid(
    _ctx: &mut CpuContext,
    pid: u64,
    pgid: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    SyscallResult::from_result(proc::setpgid(pid as u32, pgid as u32).map(|()| 0))
}

pub fn sys_getsid(_ctx: &mut CpuContext, pid: u64, _a2: u64, _a3: u64, _a4: u64) -> SyscallResult {
    SyscallResult::from_result(proc::getsid(pid as u32).map(u64::from))
}

pub fn sys_setsid(_ctx: &mut CpuContext, _a1: u64, _a2: u64, _a3: u64, _a4: u64) -> SyscallResult {
    SyscallResult::from_result(proc::setsid().map(u64::from))
}

pub fn sys_kill(_ctx: &mut CpuContext, pid: u64, sig: u64, _a3: u64, _a4: u64) -> SyscallResult {
    let result = (|| {
        let me = proc::current().ok_or(Errno::Esrch)?;
        let pid = pid as i64;
        match pid {
            0 => {
                signal::send_to_group(*me.pgid.lock(), sig as u8);
                Ok(0)
            }
            p if p < 0 => {
                signal::send_to_group((-p) as u32, sig as u8);
                Ok(0)
            }
            p => signal::send_to_proc(p as u32, sig as u8, Some(&me)).map(|()| 0),
        }
    })();
    SyscallResult::from_result(result)
}

pub fn sys_kill_thread(
    _ctx: &mut CpuContext,
    pid: u64,
    tid: u64,
    sig: u64,
    _a4: u64,
) -> SyscallResult {
    SyscallResult::from_result(
        signal::send_to_thread(pid as u32, tid as u32, sig as u8).map(|()| 0),
    )
}

fn apply_mask(mask: &mut SigSet, how: i32, set: SigSet) -> Result<(), Errno> {
    match how {
        SIG_BLOCK => *mask = mask.union(set),
        SIG_UNBLOCK => *mask = mask.difference(set),
        SIG_SETMASK => *mask = set,
        _ => return Err(Errno::Einval),
    }
    // SIGKILL and SIGSTOP are never maskable.
    mask.remove(salern_abi::signal::SIGKILL);
    mask.remove(salern_abi::signal::SIGSTOP);
    Ok(())
}

pub fn sys_sigprocmask(
    _ctx: &mut CpuContext,
    how: u64,
    set_ptr: u64,
    old_ptr: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let mut sig = proc.sig.lock();
        if old_ptr != 0 {
            userptr::write_struct(old_ptr, &sig.mask)?;
        }
        if set_ptr != 0 {
            let set: SigSet = userptr::read_struct(set_ptr)?;
            apply_mask(&mut sig.mask, how as i32, set)?;
        }
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_sigthreadmask(
    _ctx: &mut CpuContext,
    how: u64,
    set_ptr: u64,
    old_ptr: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let thread = percpu::cpu_get().current_thread().ok_or(Errno::Esrch)?;
        let mut signals = thread.signals.lock();
        if old_ptr != 0 {
            userptr::write_struct(old_ptr, &signals.mask)?;
        }
        if set_ptr != 0 {
            let set: SigSet = userptr::read_struct(set_ptr)?;
            apply_mask(&mut signals.mask, how as i32, set)?;
        }
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_sigpending(
    _ctx: &mut CpuContext,
    set_ptr: u64,
    _a2: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let thread = percpu::cpu_get().current_thread().ok_or(Errno::Esrch)?;
        let pending = proc
            .sig
            .lock()
            .pending
            .union(thread.signals.lock().pending);
        userptr::write_struct(set_ptr, &pending)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_sigaction(
    _ctx: &mut CpuContext,
    sig: u64,
    act_ptr: u64,
    old_ptr: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let sig = sig as usize;
        if sig == 0 || sig > NSIG {
            return Err(Errno::Einval);
        }
        // KILL and STOP dispositions are fixed.
        if sig == usize::from(salern_abi::signal::SIGKILL)
            || sig == usize::from(salern_abi::signal::SIGSTOP)
        {
            return Err(Errno::Einval);
        }
        let mut actions = proc.sigactions.lock();
        if old_ptr != 0 {
            userptr::write_struct(old_ptr, &actions[sig - 1])?;
        }
        if act_ptr != 0 {
            let action: SigAction = userptr::read_struct(act_ptr)?;
            actions[sig - 1] = action;
        }
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_sigreturn(
    ctx: &mut CpuContext,
    _a1: u64,
    _a2: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    let Some(thread) = percpu::cpu_get().current_thread() else {
        return SyscallResult::err(Errno::Esrch);
    };
    match signal::sigreturn(ctx, &thread) {
        // The register file was restored from the frame; do not clobber
        // RAX/RDX with a return value.
        Ok(()) => SyscallResult::discarded(),
        Err(e) => SyscallResult::err(e),
    }
}

pub fn sys_clock_get(
    _ctx: &mut CpuContext,
    _clock: u64,
    ts_ptr: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let ts = Timespec::from_ns(crate::time::now_ns());
        userptr::write_struct(ts_ptr, &ts)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}
