//! UNIX-domain stream sockets.
//!
//! Each socket owns its receive ring buffer; a connected peer writes
//! into it. Rendezvous goes through a path-keyed binding registry:
//! `bind` claims a path, `connect` finds the listener, enqueues a fresh
//! server-side socket on its backlog, and `accept` pops it.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, Ordering};

use salern_abi::sockaddr::SockaddrUn;
use salern_abi::{Errno, PollEvents};
use salern_core::sync::SpinLock;
use salern_fs::PollHead;

use crate::config::UNIX_SOCK_RB_SIZE;
use crate::sync::ringbuffer::{NOATOMIC, RingBuffer};
use crate::sync::{Mutex, Waitlist};

/// Socket connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockState {
    /// Fresh socket.
    Unbound,
    /// Owns a registry path.
    Bound,
    /// Paired with a peer.
    Connected,
    /// Passive, accepting connections.
    Listening,
}

/// The per-family socket operations.
///
/// Only `AF_UNIX` exists today; a second family plugs in by
/// implementing this and extending `sys_socket`.
pub trait SocketOps: Send + Sync {
    /// Binds to an address.
    fn bind(&self, addr: &SockaddrUn) -> Result<(), Errno>;
    /// Starts listening with the given backlog bound.
    fn listen(&self, backlog: usize) -> Result<(), Errno>;
    /// Accepts one pending connection.
    fn accept(&self) -> Result<SocketRef, Errno>;
    /// Connects to a listening address.
    fn connect(&self, addr: &SockaddrUn) -> Result<(), Errno>;
    /// Sends bytes to the peer.
    fn send(&self, buf: &[u8], blocking: bool) -> Result<usize, Errno>;
    /// Receives bytes from the peer.
    fn recv(&self, buf: &mut [u8], blocking: bool) -> Result<usize, Errno>;
    /// The bound local address, if any.
    fn local_path(&self) -> Option<String>;
    /// The peer's bound address, if connected.
    fn peer_path(&self) -> Result<String, Errno>;
    /// Readiness snapshot.
    fn poll(&self, events: PollEvents) -> PollEvents;
    /// Poller registration point.
    fn poll_head(&self) -> &PollHead;
    /// Final-close teardown.
    fn destroy(&self);
}

/// Shared socket handle.
pub type SocketRef = Arc<dyn SocketOps>;

/// Path-keyed rendezvous registry.
static BINDINGS: SpinLock<BTreeMap<String, Weak<UnixSocket>>> = SpinLock::new(BTreeMap::new());

struct UnixInner {
    state: SockState,
    bound_path: Option<String>,
    /// Connected peer (weak: the vnodes own the sockets).
    peer: Weak<UnixSocket>,
    /// Pending connections (listening sockets).
    backlog: VecDeque<Arc<UnixSocket>>,
    backlog_max: usize,
}

/// A UNIX-domain stream socket.
pub struct UnixSocket {
    inner: Mutex<UnixInner>,
    /// Bytes the peer sent us.
    recv: RingBuffer,
    /// Listener: woken when the backlog gains an entry.
    accept_wait: Waitlist,
    poll: PollHead,
    hung_up: AtomicBool,
}

impl UnixSocket {
    /// Creates an unbound socket.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(UnixInner {
                state: SockState::Unbound,
                bound_path: None,
                peer: Weak::new(),
                backlog: VecDeque::new(),
                backlog_max: 0,
            }),
            recv: RingBuffer::with_capacity(UNIX_SOCK_RB_SIZE),
            accept_wait: Waitlist::new(),
            poll: PollHead::new(),
            hung_up: AtomicBool::new(false),
        })
    }

    fn peer(&self) -> Result<Arc<UnixSocket>, Errno> {
        self.inner.lock().peer.upgrade().ok_or(Errno::Enotconn)
    }
}

/// Locks two sockets' inner state in address order, returning the
/// guards as `(a, b)`.
fn lock_pair<'a>(
    a: &'a Arc<UnixSocket>,
    b: &'a Arc<UnixSocket>,
) -> (
    crate::sync::MutexGuard<'a, UnixInner>,
    crate::sync::MutexGuard<'a, UnixInner>,
) {
    if (Arc::as_ptr(a) as usize) < (Arc::as_ptr(b) as usize) {
        let ga = a.inner.lock();
        let gb = b.inner.lock();
        (ga, gb)
    } else {
        let gb = b.inner.lock();
        let ga = a.inner.lock();
        (ga, gb)
    }
}

/// Arc-receiver wrappers: the ops trait works on `&self`, but connect
/// and accept need to hand out owned references.
pub struct UnixHandle(pub Arc<UnixSocket>);

impl SocketOps for UnixHandle {
    fn bind(&self, addr: &SockaddrUn) -> Result<(), Errno> {
        let path = core::str::from_utf8(addr.path_bytes())
            .map_err(|_| Errno::Einval)?
            .to_string();
        if path.is_empty() {
            return Err(Errno::Einval);
        }
        let mut inner = self.0.inner.lock();
        if inner.state != SockState::Unbound {
            return Err(Errno::Einval);
        }
        let mut bindings = BINDINGS.lock();
        if bindings.get(&path).is_some_and(|w| w.upgrade().is_some()) {
            return Err(Errno::Eaddrinuse);
        }
        bindings.insert(path.clone(), Arc::downgrade(&self.0));
        drop(bindings);
        inner.bound_path = Some(path);
        inner.state = SockState::Bound;
        Ok(())
    }

    fn listen(&self, backlog: usize) -> Result<(), Errno> {
        let mut inner = self.0.inner.lock();
        if inner.state != SockState::Bound {
            return Err(Errno::Einval);
        }
        inner.state = SockState::Listening;
        inner.backlog_max = backlog.clamp(1, 128);
        Ok(())
    }

    fn accept(&self) -> Result<SocketRef, Errno> {
        loop {
            {
                let mut inner = self.0.inner.lock();
                if inner.state != SockState::Listening {
                    return Err(Errno::Einval);
                }
                if let Some(conn) = inner.backlog.pop_front() {
                    return Ok(Arc::new(UnixHandle(conn)));
                }
            }
            self.0.accept_wait.wait();
        }
    }

    fn connect(&self, addr: &SockaddrUn) -> Result<(), Errno> {
        let path = core::str::from_utf8(addr.path_bytes()).map_err(|_| Errno::Einval)?;
        let listener = BINDINGS
            .lock()
            .get(path)
            .and_then(Weak::upgrade)
            .ok_or(Errno::Econnrefused)?;
        if Arc::ptr_eq(&listener, &self.0) {
            return Err(Errno::Einval);
        }

        // The server-side half of the new connection.
        let server = UnixSocket::new();
        {
            // Both locks are needed; take them in address order so two
            // sockets connecting at each other cannot deadlock.
            let (mut inner, mut listener_inner) = lock_pair(&self.0, &listener);
            if inner.state == SockState::Connected || inner.state == SockState::Listening {
                return Err(Errno::Einval);
            }
            if listener_inner.state != SockState::Listening {
                return Err(Errno::Econnrefused);
            }
            if listener_inner.backlog.len() >= listener_inner.backlog_max {
                return Err(Errno::Eagain);
            }
            {
                let mut server_inner = server.inner.lock();
                server_inner.state = SockState::Connected;
                server_inner.peer = Arc::downgrade(&self.0);
                server_inner.bound_path = listener_inner.bound_path.clone();
            }
            inner.peer = Arc::downgrade(&server);
            inner.state = SockState::Connected;
            listener_inner.backlog.push_back(server);
        }
        listener.accept_wait.notify_one();
        listener.poll.notify();
        Ok(())
    }

    fn send(&self, buf: &[u8], blocking: bool) -> Result<usize, Errno> {
        let peer = self.peer()?;
        if peer.hung_up.load(Ordering::Acquire) {
            return Err(Errno::Epipe);
        }
        let n = peer.recv.write(buf, NOATOMIC, blocking, None)?;
        peer.poll.notify();
        Ok(n)
    }

    fn recv(&self, buf: &mut [u8], blocking: bool) -> Result<usize, Errno> {
        {
            let inner = self.0.inner.lock();
            if inner.state != SockState::Connected {
                return Err(Errno::Enotconn);
            }
        }
        let n = self.0.recv.read(buf, NOATOMIC, blocking, None)?;
        if let Ok(peer) = self.peer() {
            peer.poll.notify();
        }
        Ok(n)
    }

    fn local_path(&self) -> Option<String> {
        self.0.inner.lock().bound_path.clone()
    }

    fn peer_path(&self) -> Result<String, Errno> {
        let peer = self.peer()?;
        Ok(peer.inner.lock().bound_path.clone().unwrap_or_default())
    }

    fn poll(&self, events: PollEvents) -> PollEvents {
        let mut ready = PollEvents::empty();
        let inner = self.0.inner.lock();
        match inner.state {
            SockState::Listening => {
                if events.contains(PollEvents::IN) && !inner.backlog.is_empty() {
                    ready |= PollEvents::IN;
                }
            }
            SockState::Connected => {
                if events.contains(PollEvents::IN) && !self.0.recv.is_empty() {
                    ready |= PollEvents::IN;
                }
                if let Some(peer) = inner.peer.upgrade() {
                    if events.contains(PollEvents::OUT) && peer.recv.space() > 0 {
                        ready |= PollEvents::OUT;
                    }
                } else {
                    ready |= PollEvents::HUP;
                }
            }
            _ => {}
        }
        ready
    }

    fn poll_head(&self) -> &PollHead {
        &self.0.poll
    }

    fn destroy(&self) {
        self.0.hung_up.store(true, Ordering::Release);
        let (path, peer) = {
            let mut inner = self.0.inner.lock();
            (inner.bound_path.take(), inner.peer.upgrade())
        };
        if let Some(path) = path {
            BINDINGS.lock().remove(&path);
        }
        if let Some(peer) = peer {
            // The peer drains its buffer, then reads EOF.
            peer.recv.set_eof();
            peer.poll.notify();
        }
        self.0.recv.set_eof();
    }
}
