//! Processes, process groups, and sessions.
//!
//! The process table maps pids to live processes; groups and sessions
//! are separate maps keyed by pgid/sid. Exit reparents children to
//! init, stores the wait status, and hands the address space to the VMM
//! reaper; `waitpid` reaps the zombie entry.

pub mod elf;
pub mod exec;
pub mod fault;
pub mod signal;
pub mod thread;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use salern_abi::signal::{NSIG, SIGCHLD, SigAction, SigSet};
use salern_abi::{Errno, wait};
use salern_core::sync::SpinLock;
use salern_fs::VnodeRef;

use crate::config::PROC_MAX;
use crate::file::FdTable;
use crate::mm::vmm::AddressSpace;
use crate::percpu;
use crate::sched;
use crate::sync::Waitlist;
use thread::{Thread, ThreadState};

/// Process-wide signal state.
#[derive(Default)]
pub struct ProcSignals {
    /// Process-directed pending signals no thread has claimed.
    pub pending: SigSet,
    /// Process-wide blocked set.
    pub mask: SigSet,
}

/// A process.
pub struct Process {
    /// Process id.
    pub pid: u32,
    /// Parent pid; 0 for init.
    pub ppid: SpinLock<u32>,
    space: SpinLock<Arc<AddressSpace>>,
    /// Descriptor table.
    pub fds: SpinLock<FdTable>,
    /// Filesystem root.
    pub root: SpinLock<VnodeRef>,
    /// Working directory vnode and its absolute path (for `getcwd`).
    pub cwd: SpinLock<VnodeRef>,
    /// Absolute path of the working directory.
    pub cwd_path: SpinLock<String>,
    /// Live threads.
    pub threads: SpinLock<Vec<Arc<Thread>>>,
    /// Per-signal dispositions.
    pub sigactions: SpinLock<[SigAction; NSIG]>,
    /// Process-wide pending/masked signals.
    pub sig: SpinLock<ProcSignals>,
    /// Exit status once the process died.
    pub exit_status: SpinLock<Option<i32>>,
    /// Parents sleep here for their children.
    pub child_wait: Waitlist,
    /// Process group id.
    pub pgid: SpinLock<u32>,
    /// Session id.
    pub sid: SpinLock<u32>,
}

/// A process group.
pub struct ProcessGroup {
    /// Group id (pid of the creator).
    pub pgid: u32,
    /// Owning session.
    pub sid: u32,
    /// Member pids.
    pub members: Vec<u32>,
}

/// A session.
pub struct Session {
    /// Session id.
    pub sid: u32,
    /// Controlling terminal index, if one was acquired.
    pub ctty: Option<usize>,
}

static PROC_TABLE: SpinLock<BTreeMap<u32, Arc<Process>>> = SpinLock::new(BTreeMap::new());
static PGROUPS: SpinLock<BTreeMap<u32, ProcessGroup>> = SpinLock::new(BTreeMap::new());
static SESSIONS: SpinLock<BTreeMap<u32, Session>> = SpinLock::new(BTreeMap::new());

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

fn alloc_pid() -> u32 {
    loop {
        let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed) % PROC_MAX;
        if pid == 0 {
            continue;
        }
        if !PROC_TABLE.lock().contains_key(&pid) {
            return pid;
        }
    }
}

impl Process {
    /// Creates a process in its own fresh group and session.
    pub fn new(
        space: Arc<AddressSpace>,
        ppid: u32,
        root: VnodeRef,
        cwd: VnodeRef,
    ) -> Arc<Self> {
        let pid = alloc_pid();
        let proc = Arc::new(Self {
            pid,
            ppid: SpinLock::new(ppid),
            space: SpinLock::new(space),
            fds: SpinLock::new(FdTable::new()),
            root: SpinLock::new(root),
            cwd: SpinLock::new(cwd),
            cwd_path: SpinLock::new(String::from("/")),
            threads: SpinLock::new(Vec::new()),
            sigactions: SpinLock::new([SigAction::default_action(); NSIG]),
            sig: SpinLock::new(ProcSignals::default()),
            exit_status: SpinLock::new(None),
            child_wait: Waitlist::new(),
            pgid: SpinLock::new(pid),
            sid: SpinLock::new(pid),
        });
        PROC_TABLE.lock().insert(pid, proc.clone());
        SESSIONS.lock().insert(pid, Session { sid: pid, ctty: None });
        PGROUPS.lock().insert(
            pid,
            ProcessGroup {
                pgid: pid,
                sid: pid,
                members: alloc::vec![pid],
            },
        );
        proc
    }

    /// The current address space.
    #[must_use]
    pub fn space(&self) -> Arc<AddressSpace> {
        self.space.lock().clone()
    }

    /// Swaps in a new address space (execve); returns the old one.
    pub fn replace_space(&self, space: Arc<AddressSpace>) -> Arc<AddressSpace> {
        core::mem::replace(&mut *self.space.lock(), space)
    }

    /// Adds a thread to the process.
    pub fn attach_thread(&self, thread: Arc<Thread>) {
        self.threads.lock().push(thread);
    }
}

/// Looks up a process by pid.
#[must_use]
pub fn lookup(pid: u32) -> Option<Arc<Process>> {
    PROC_TABLE.lock().get(&pid).cloned()
}

/// The currently running process, if the current thread has one.
#[must_use]
pub fn current() -> Option<Arc<Process>> {
    percpu::cpu_get().current_thread()?.process()
}

/// Pids of the live children of `ppid`.
#[must_use]
pub fn children_of(ppid: u32) -> Vec<u32> {
    PROC_TABLE
        .lock()
        .values()
        .filter(|p| *p.ppid.lock() == ppid)
        .map(|p| p.pid)
        .collect()
}

// ---------------------------------------------------------------------------
// fork
// ---------------------------------------------------------------------------

/// Forks the current process.
///
/// The child inherits the fd table (bumping each file's refcount), the
/// signal dispositions, the process group, and a copy-on-write
/// duplicate of the address space. Its single thread resumes from the
/// parent's trap frame with RAX zeroed.
pub fn fork(
    parent: &Arc<Process>,
    trap: &crate::arch::x86_64::context::CpuContext,
) -> Result<u32, Errno> {
    let child_space = parent.space().duplicate()?;
    let child = Process::new(
        child_space,
        parent.pid,
        parent.root.lock().clone(),
        parent.cwd.lock().clone(),
    );
    *child.fds.lock() = parent.fds.lock().fork_clone();
    *child.sigactions.lock() = *parent.sigactions.lock();
    *child.cwd_path.lock() = parent.cwd_path.lock().clone();
    child.sig.lock().mask = parent.sig.lock().mask;

    // Child joins the parent's group (Process::new made a fresh one).
    let parent_pgid = *parent.pgid.lock();
    let parent_sid = *parent.sid.lock();
    move_to_group(&child, parent_pgid, parent_sid);

    let mut ctx = *trap;
    ctx.rax = 0;
    let thread = Thread::new_user(&child, ctx).ok_or(Errno::Enomem)?;

    // The child resumes mid-computation; it needs the parent's live FPU
    // state, not a zeroed one.
    if let Some(parent_thread) = percpu::cpu_get().current_thread() {
        let mut parent_fpu = parent_thread.fpu.lock();
        parent_fpu.save();
        thread
            .fpu
            .lock()
            .area_bytes_mut()
            .copy_from_slice(parent_fpu.area_bytes());
    }

    child.attach_thread(thread.clone());
    sched::enqueue(thread);
    Ok(child.pid)
}

fn move_to_group(proc: &Arc<Process>, pgid: u32, sid: u32) {
    let old_pgid = *proc.pgid.lock();
    let mut groups = PGROUPS.lock();
    if let Some(old) = groups.get_mut(&old_pgid) {
        old.members.retain(|&p| p != proc.pid);
        if old.members.is_empty() && old.pgid != pgid {
            groups.remove(&old_pgid);
        }
    }
    let group = groups.entry(pgid).or_insert_with(|| ProcessGroup {
        pgid,
        sid,
        members: Vec::new(),
    });
    group.members.push(proc.pid);
    drop(groups);

    let old_sid = *proc.sid.lock();
    *proc.pgid.lock() = pgid;
    *proc.sid.lock() = sid;

    // Garbage-collect a session nobody references anymore (the fresh
    // one Process::new makes is usually abandoned right here).
    if old_sid != sid {
        let still_used = PROC_TABLE
            .lock()
            .values()
            .any(|p| *p.sid.lock() == old_sid);
        if !still_used {
            SESSIONS.lock().remove(&old_sid);
        }
    }
}

// ---------------------------------------------------------------------------
// exit / waitpid
// ---------------------------------------------------------------------------

/// Terminates the current process with the encoded wait `status`.
pub fn exit_current(status: i32) -> ! {
    let proc = current().expect("exit without a process");
    let current_thread = percpu::cpu_get().current_thread().expect("no thread");

    // Reparent children to init.
    {
        let table = PROC_TABLE.lock();
        for child in table.values() {
            let mut ppid = child.ppid.lock();
            if *ppid == proc.pid {
                *ppid = 1;
            }
        }
    }

    *proc.exit_status.lock() = Some(status);

    // Drop the file table now; vnode releases must not wait for reap.
    *proc.fds.lock() = FdTable::new();

    // The address space goes to the reaper.
    let space = proc.space();
    space.destroy();

    // Tear down sibling threads; the exiting one goes last.
    {
        let mut threads = proc.threads.lock();
        for t in threads.iter() {
            if !Arc::ptr_eq(t, &current_thread) && t.state() != ThreadState::Exited {
                // Re-route any thread-directed pending signals back to
                // the process so they are not lost with the thread.
                let sigs = t.signals.lock().pending;
                let mut psig = proc.sig.lock();
                psig.pending = psig.pending.union(sigs);
            }
        }
        threads.clear();
    }

    // Tell the parent.
    if let Some(parent) = lookup(*proc.ppid.lock()) {
        signal::send_to_proc(parent.pid, SIGCHLD, None).ok();
        parent.child_wait.notify_all();
    }

    sched::exit_current();
}

/// Waits for a child to exit.
///
/// `pid == -1` waits for any child. Returns `(pid, status)`; with
/// [`wait::WNOHANG`] and no zombie child, returns `Ok((0, 0))`.
pub fn waitpid(pid: i32, flags: u32) -> Result<(u32, i32), Errno> {
    let proc = current().ok_or(Errno::Esrch)?;
    loop {
        let children = children_of(proc.pid);
        let candidates: Vec<u32> = match pid {
            -1 => children,
            p if p > 0 => {
                let p = p as u32;
                if !children.contains(&p) {
                    return Err(Errno::Echild);
                }
                alloc::vec![p]
            }
            _ => return Err(Errno::Einval),
        };
        if candidates.is_empty() {
            return Err(Errno::Echild);
        }

        for child_pid in candidates {
            let Some(child) = lookup(child_pid) else { continue };
            let status = *child.exit_status.lock();
            if let Some(status) = status {
                reap(&child);
                return Ok((child_pid, status));
            }
        }

        if flags & wait::WNOHANG != 0 {
            return Ok((0, 0));
        }
        proc.child_wait.wait();
    }
}

/// Removes a zombie from every table.
fn reap(child: &Arc<Process>) {
    PROC_TABLE.lock().remove(&child.pid);
    let pgid = *child.pgid.lock();
    let mut groups = PGROUPS.lock();
    if let Some(group) = groups.get_mut(&pgid) {
        group.members.retain(|&p| p != child.pid);
        if group.members.is_empty() {
            groups.remove(&pgid);
        }
    }
    drop(groups);
    let sid = *child.sid.lock();
    let orphan_session = !PGROUPS.lock().values().any(|g| g.sid == sid);
    if orphan_session {
        SESSIONS.lock().remove(&sid);
    }
}

// ---------------------------------------------------------------------------
// Sessions and groups
// ---------------------------------------------------------------------------

/// `setsid`: detach into a brand-new session and group.
pub fn setsid() -> Result<u32, Errno> {
    let proc = current().ok_or(Errno::Esrch)?;
    // A group leader may not create a session.
    if *proc.pgid.lock() == proc.pid && PGROUPS.lock().get(&proc.pid).is_some_and(|g| g.members.len() > 1) {
        return Err(Errno::Eperm);
    }
    SESSIONS.lock().insert(
        proc.pid,
        Session {
            sid: proc.pid,
            ctty: None,
        },
    );
    move_to_group(&proc, proc.pid, proc.pid);
    Ok(proc.pid)
}

/// `setpgid`: move `pid` (0 = self) into group `pgid` (0 = own pid).
pub fn setpgid(pid: u32, pgid: u32) -> Result<(), Errno> {
    let me = current().ok_or(Errno::Esrch)?;
    let target = if pid == 0 { me.clone() } else { lookup(pid).ok_or(Errno::Esrch)? };
    // Only self or a child may be moved.
    if target.pid != me.pid && *target.ppid.lock() != me.pid {
        return Err(Errno::Eperm);
    }
    let pgid = if pgid == 0 { target.pid } else { pgid };
    let sid = *target.sid.lock();
    // The destination group must live in the same session, if it exists.
    if let Some(group) = PGROUPS.lock().get(&pgid) {
        if group.sid != sid {
            return Err(Errno::Eperm);
        }
    }
    move_to_group(&target, pgid, sid);
    Ok(())
}

/// `getpgid` for `pid` (0 = self).
pub fn getpgid(pid: u32) -> Result<u32, Errno> {
    let proc = if pid == 0 {
        current().ok_or(Errno::Esrch)?
    } else {
        lookup(pid).ok_or(Errno::Esrch)?
    };
    Ok(*proc.pgid.lock())
}

/// `getsid` for `pid` (0 = self).
pub fn getsid(pid: u32) -> Result<u32, Errno> {
    let proc = if pid == 0 {
        current().ok_or(Errno::Esrch)?
    } else {
        lookup(pid).ok_or(Errno::Esrch)?
    };
    Ok(*proc.sid.lock())
}

/// Every member pid of a process group.
#[must_use]
pub fn group_members(pgid: u32) -> Vec<u32> {
    PGROUPS
        .lock()
        .get(&pgid)
        .map(|g| g.members.clone())
        .unwrap_or_default()
}

/// Records the controlling terminal of a session.
pub fn set_session_ctty(sid: u32, tty_index: usize) {
    if let Some(session) = SESSIONS.lock().get_mut(&sid) {
        session.ctty = Some(tty_index);
    }
}
