//! System-call dispatch.
//!
//! Entry comes through the `int 0x80` gate: RAX carries the number,
//! RDI/RSI/RDX/R10 the four arguments. The handler returns a
//! [`SyscallResult`]; unless the result is `discarded` (sigreturn,
//! execve — the whole frame was replaced), the value lands in RAX and
//! the errno word in RDX. Every dispatch is bracketed by the profiler.

mod io;
mod mm;
mod proc;
mod socket;
pub mod userptr;
mod vfs;

use core::sync::atomic::{AtomicPtr, Ordering};

use salern_abi::Errno;
use salern_abi::syscall::SYSCALL_MAX;

use crate::arch::x86_64::context::CpuContext;
use crate::config;
use crate::profiler;

/// Outcome of a syscall handler.
pub struct SyscallResult {
    /// Value returned in RAX.
    pub value: u64,
    /// Error returned in RDX (0 = success).
    pub errno: Option<Errno>,
    /// Skip the register writeback entirely.
    pub discarded: bool,
}

impl SyscallResult {
    /// Success with a value.
    #[must_use]
    pub fn ok(value: u64) -> Self {
        Self {
            value,
            errno: None,
            discarded: false,
        }
    }

    /// Failure with an errno.
    #[must_use]
    pub fn err(errno: Errno) -> Self {
        Self {
            value: u64::MAX,
            errno: Some(errno),
            discarded: false,
        }
    }

    /// The in-kernel context was replaced; touch nothing.
    #[must_use]
    pub fn discarded() -> Self {
        Self {
            value: 0,
            errno: None,
            discarded: true,
        }
    }

    /// Folds a `Result` into a syscall result.
    #[must_use]
    pub fn from_result(result: Result<u64, Errno>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(errno) => Self::err(errno),
        }
    }
}

/// Handler signature: trap frame plus the four raw arguments.
pub type Handler = fn(&mut CpuContext, u64, u64, u64, u64) -> SyscallResult;

static TABLE: [AtomicPtr<()>; SYSCALL_MAX] =
    [const { AtomicPtr::new(core::ptr::null_mut()) }; SYSCALL_MAX];

/// Installs a handler.
pub fn register(num: usize, handler: Handler) {
    TABLE[num].store(handler as *mut (), Ordering::Release);
}

/// The trap-side entry, called from the interrupt dispatcher.
pub fn dispatch_trap(ctx: &mut CpuContext) {
    let num = ctx.rax as usize;
    let (a1, a2, a3, a4) = (ctx.rdi, ctx.rsi, ctx.rdx, ctx.r10);

    if config::LOG_SYSCALLS {
        crate::ksyscall!(
            "syscall {num} ({a1:#x}, {a2:#x}, {a3:#x}, {a4:#x})"
        );
    }

    let result = if num >= SYSCALL_MAX {
        SyscallResult::err(Errno::Enosys)
    } else {
        let handler = TABLE[num].load(Ordering::Acquire);
        if handler.is_null() {
            SyscallResult::err(Errno::Enosys)
        } else {
            // SAFETY: Only valid `Handler` pointers are stored.
            let handler: Handler = unsafe { core::mem::transmute(handler) };
            let bracket = profiler::enter(num);
            let result = handler(ctx, a1, a2, a3, a4);
            profiler::leave(num, bracket);
            result
        }
    };

    if !result.discarded {
        ctx.rax = result.value;
        ctx.rdx = result.errno.map_or(0, |e| u64::from(e.as_u32()));
    }
}

/// Registers every handler.
pub fn init() {
    use salern_abi::syscall as nr;

    register(nr::SYS_READ, io::sys_read);
    register(nr::SYS_WRITE, io::sys_write);
    register(nr::SYS_READV, io::sys_readv);
    register(nr::SYS_WRITEV, io::sys_writev);
    register(nr::SYS_KPRINT, io::sys_kprint);

    register(nr::SYS_OPENAT, vfs::sys_openat);
    register(nr::SYS_CLOSE, vfs::sys_close);
    register(nr::SYS_DUP3, vfs::sys_dup3);
    register(nr::SYS_FCNTL, vfs::sys_fcntl);
    register(nr::SYS_IOCTL, vfs::sys_ioctl);
    register(nr::SYS_SEEK, vfs::sys_seek);
    register(nr::SYS_TRUNCATE, vfs::sys_truncate);
    register(nr::SYS_ISATTY, vfs::sys_isatty);
    register(nr::SYS_PIPE, vfs::sys_pipe);
    register(nr::SYS_FSTATAT, vfs::sys_fstatat);
    register(nr::SYS_FACCESSAT, vfs::sys_faccessat);
    register(nr::SYS_MKDIRAT, vfs::sys_mkdirat);
    register(nr::SYS_UNLINKAT, vfs::sys_unlinkat);
    register(nr::SYS_READLINKAT, vfs::sys_readlinkat);
    register(nr::SYS_SYMLINKAT, vfs::sys_symlinkat);
    register(nr::SYS_CHDIR, vfs::sys_chdir);
    register(nr::SYS_GETCWD, vfs::sys_getcwd);

    register(nr::SYS_MMAP, mm::sys_mmap);
    register(nr::SYS_MUNMAP, mm::sys_munmap);
    register(nr::SYS_SYSINFO, mm::sys_sysinfo);

    register(nr::SYS_FORK, proc::sys_fork);
    register(nr::SYS_EXECVE, proc::sys_execve);
    register(nr::SYS_EXIT, proc::sys_exit);
    register(nr::SYS_EXIT_THREAD, proc::sys_exit_thread);
    register(nr::SYS_WAITPID, proc::sys_waitpid);
    register(nr::SYS_CLONE, proc::sys_clone);
    register(nr::SYS_GETPID, proc::sys_getpid);
    register(nr::SYS_GETPPID, proc::sys_getppid);
    register(nr::SYS_GETPGID, proc::sys_getpgid);
    register(nr::SYS_SETPGID, proc::sys_setpgid);
    register(nr::SYS_GETSID, proc::sys_getsid);
    register(nr::SYS_SETSID, proc::sys_setsid);
    register(nr::SYS_KILL, proc::sys_kill);
    register(nr::SYS_KILL_THREAD, proc::sys_kill_thread);
    register(nr::SYS_SIGPROCMASK, proc::sys_sigprocmask);
    register(nr::SYS_SIGTHREADMASK, proc::sys_sigthreadmask);
    register(nr::SYS_SIGPENDING, proc::sys_sigpending);
    register(nr::SYS_SIGACTION, proc::sys_sigaction);
    register(nr::SYS_SIGRETURN, proc::sys_sigreturn);
    register(nr::SYS_CLOCK_GET, proc::sys_clock_get);

    register(nr::SYS_SOCKET, socket::sys_socket);
    register(nr::SYS_BIND, socket::sys_bind);
    register(nr::SYS_LISTEN, socket::sys_listen);
    register(nr::SYS_ACCEPT, socket::sys_accept);
    register(nr::SYS_CONNECT, socket::sys_connect);
    register(nr::SYS_SENDMSG, socket::sys_sendmsg);
    register(nr::SYS_RECVMSG, socket::sys_recvmsg);
    register(nr::SYS_GETPEERNAME, socket::sys_getpeername);
}
