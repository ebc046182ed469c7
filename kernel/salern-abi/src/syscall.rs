//! Syscall numbers.
//!
//! The dispatch table in the kernel is indexed by these values; libc uses
//! them in its syscall stubs. Renumbering is an ABI break.

/// Read from a file descriptor.
pub const SYS_READ: usize = 0;
/// Write to a file descriptor.
pub const SYS_WRITE: usize = 1;
/// Open a path relative to a directory fd.
pub const SYS_OPENAT: usize = 2;
/// Close a file descriptor.
pub const SYS_CLOSE: usize = 3;
/// Stat a path relative to a directory fd.
pub const SYS_FSTATAT: usize = 4;
/// Reposition a file offset.
pub const SYS_SEEK: usize = 5;
/// Map memory.
pub const SYS_MMAP: usize = 6;
/// Unmap memory.
pub const SYS_MUNMAP: usize = 7;
/// Duplicate a file descriptor onto a chosen slot.
pub const SYS_DUP3: usize = 8;
/// Manipulate a file descriptor.
pub const SYS_FCNTL: usize = 9;
/// Device-specific control.
pub const SYS_IOCTL: usize = 10;
/// Create a pipe.
pub const SYS_PIPE: usize = 11;
/// Scatter-gather read.
pub const SYS_READV: usize = 12;
/// Scatter-gather write.
pub const SYS_WRITEV: usize = 13;
/// Truncate an open file.
pub const SYS_TRUNCATE: usize = 14;
/// Terminal test.
pub const SYS_ISATTY: usize = 15;
/// Check path accessibility.
pub const SYS_FACCESSAT: usize = 16;
/// Create a directory.
pub const SYS_MKDIRAT: usize = 17;
/// Remove a directory entry.
pub const SYS_UNLINKAT: usize = 18;
/// Read a symlink target.
pub const SYS_READLINKAT: usize = 19;
/// Create a symlink.
pub const SYS_SYMLINKAT: usize = 20;
/// Change working directory.
pub const SYS_CHDIR: usize = 21;
/// Get working directory.
pub const SYS_GETCWD: usize = 22;

/// Create a child process.
pub const SYS_FORK: usize = 30;
/// Execute a program image.
pub const SYS_EXECVE: usize = 31;
/// Terminate the calling process.
pub const SYS_EXIT: usize = 32;
/// Wait for a child to change state.
pub const SYS_WAITPID: usize = 33;
/// Create a thread.
pub const SYS_CLONE: usize = 34;
/// Terminate the calling thread.
pub const SYS_EXIT_THREAD: usize = 35;
/// Get process id.
pub const SYS_GETPID: usize = 36;
/// Get parent process id.
pub const SYS_GETPPID: usize = 37;
/// Get process-group id.
pub const SYS_GETPGID: usize = 38;
/// Set process-group id.
pub const SYS_SETPGID: usize = 39;
/// Create a session.
pub const SYS_SETSID: usize = 40;
/// Get session id.
pub const SYS_GETSID: usize = 41;

/// Send a signal to a process.
pub const SYS_KILL: usize = 50;
/// Send a signal to a specific thread.
pub const SYS_KILL_THREAD: usize = 51;
/// Change the process signal mask.
pub const SYS_SIGPROCMASK: usize = 52;
/// Change the calling thread's signal mask.
pub const SYS_SIGTHREADMASK: usize = 53;
/// Query pending signals.
pub const SYS_SIGPENDING: usize = 54;
/// Install a signal disposition.
pub const SYS_SIGACTION: usize = 55;
/// Return from a signal handler.
pub const SYS_SIGRETURN: usize = 56;

/// Create a socket.
pub const SYS_SOCKET: usize = 60;
/// Bind a socket to an address.
pub const SYS_BIND: usize = 61;
/// Mark a socket passive.
pub const SYS_LISTEN: usize = 62;
/// Accept a pending connection.
pub const SYS_ACCEPT: usize = 63;
/// Initiate a connection.
pub const SYS_CONNECT: usize = 64;
/// Send a message on a socket.
pub const SYS_SENDMSG: usize = 65;
/// Receive a message from a socket.
pub const SYS_RECVMSG: usize = 66;
/// Get the peer address of a connected socket.
pub const SYS_GETPEERNAME: usize = 67;

/// Read the monotonic or realtime clock.
pub const SYS_CLOCK_GET: usize = 70;
/// System information (memory statistics).
pub const SYS_SYSINFO: usize = 71;
/// Write to the kernel log.
pub const SYS_KPRINT: usize = 72;

/// Number of syscall table slots.
pub const SYSCALL_MAX: usize = 128;
