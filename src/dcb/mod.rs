//! The Descriptor Control Block subsystem: the per-socket state object
//! (C1 state machine, §3.1 fields) and its collaborators — registry
//! (C2), write queue (C3), read path (C4), zombie reaper (C5).

pub mod protocol;
pub mod reaper;
pub mod read;
pub mod registry;
pub mod state;
pub mod writeq;

use std::any::Any;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::BufferChain;
use crate::session::Session;

pub use protocol::ProtocolOps;
pub use registry::{DcbId, Registry};
pub use state::State;

/// Immutable after allocation: what kind of endpoint this DCB represents.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    RequestHandler,
    Listener,
    Internal,
}

/// Monotonic counters, updated without locking per spec's invariant.
#[derive(Debug, Default)]
pub struct DcbStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub buffered_writes: AtomicU64,
    pub accepts: AtomicU64,
}

impl DcbStats {
    fn snapshot(&self) -> DcbStatsSnapshot {
        DcbStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            buffered_writes: self.buffered_writes.load(Ordering::Relaxed),
            accepts: self.accepts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct DcbStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub buffered_writes: u64,
    pub accepts: u64,
}

/// Bitmask of worker-thread ids that must still clear the DCB before it
/// may be finally freed. Only meaningful while `state == Zombie`. Bits
/// may only be cleared after being set; capped at 64 workers.
#[derive(Debug, Default)]
pub struct ThreadMask(AtomicU64);

impl ThreadMask {
    pub fn new() -> ThreadMask {
        ThreadMask(AtomicU64::new(0))
    }

    /// Set exactly once, at the moment of transition into Nopolling, to
    /// the snapshot of the live-worker bitmask.
    pub fn set(&self, mask: u64) {
        self.0.store(mask, Ordering::Release);
    }

    pub fn clear_bit(&self, tid: u32) {
        self.0.fetch_and(!(1u64 << tid), Ordering::AcqRel);
    }

    pub fn is_clear(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn popcount(&self) -> u32 {
        self.get().count_ones()
    }
}

/// The init-lock's guarded content: everything the state-transition
/// critical section in `close`/`reaper` touches.
struct DcbInner {
    state: State,
}

/// Descriptor Control Block: the per-socket state object. Shared between
/// the registry and (once closed) the zombie list; both refer to it
/// through `Arc<Dcb>`.
pub struct Dcb {
    pub id: DcbId,
    pub role: Role,
    fd: AtomicI32,
    inner: Mutex<DcbInner>,
    protocol_ops: Mutex<Option<Arc<dyn ProtocolOps>>>,
    protocol_data: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    session: Mutex<Option<Arc<Session>>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    app_data: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    writeq: Mutex<BufferChain>,
    delayq: Mutex<BufferChain>,
    authq: Mutex<BufferChain>,
    pub stats: DcbStats,
    thread_mask: ThreadMask,
}

impl Dcb {
    pub(crate) fn new(id: DcbId, role: Role, fd: RawFd) -> Dcb {
        Dcb {
            id,
            role,
            fd: AtomicI32::new(fd),
            inner: Mutex::new(DcbInner {
                state: State::Alloc,
            }),
            protocol_ops: Mutex::new(None),
            protocol_data: Mutex::new(None),
            session: Mutex::new(None),
            remote_addr: Mutex::new(None),
            app_data: Mutex::new(None),
            writeq: Mutex::new(BufferChain::new()),
            delayq: Mutex::new(BufferChain::new()),
            authq: Mutex::new(BufferChain::new()),
            stats: DcbStats::default(),
            thread_mask: ThreadMask::new(),
        }
    }

    /// The live file descriptor, or a negative value once the DCB has
    /// passed through `close`. Valid to read lock-free per spec: the
    /// descriptor's validity is scoped to the four live states, not
    /// serialised against reads of it.
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    pub(crate) fn take_fd(&self) -> RawFd {
        self.fd.swap(-1, Ordering::AcqRel)
    }

    /// Used once by `Runtime::connect`, after the protocol's `connect`
    /// implementation has produced a live fd for a DCB allocated
    /// without one yet (role `RequestHandler` dialing out).
    pub(crate) fn set_fd(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::Release);
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Invoked under the DCB's init-lock. Returns the previous state on
    /// success (mutating to `to` unless the transition is one of the two
    /// idempotent no-ops), or the current state on failure, unchanged.
    pub fn transition(&self, to: State) -> Result<State, State> {
        let mut inner = self.inner.lock();
        match state::transition(inner.state, to) {
            Ok(prev) => {
                if !state::is_noop(prev, to) {
                    inner.state = to;
                }
                Ok(prev)
            }
            Err(prev) => Err(prev),
        }
    }

    /// Used only by the zombie reaper's push-if-not-zombie check: done
    /// under the zombie-list lock (held by the caller), so this must not
    /// take any lock broader than the init-lock itself. Returns `true`
    /// if the DCB was already `Zombie` (a duplicate close), else marks
    /// it `Zombie` and returns `false`.
    pub(crate) fn mark_zombie_once(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == State::Zombie {
            true
        } else {
            inner.state = State::Zombie;
            false
        }
    }

    pub fn set_protocol_ops(&self, ops: Arc<dyn ProtocolOps>) {
        *self.protocol_ops.lock() = Some(ops);
    }

    pub fn protocol_ops(&self) -> Option<Arc<dyn ProtocolOps>> {
        self.protocol_ops.lock().clone()
    }

    pub fn set_session(&self, session: Arc<Session>) {
        *self.session.lock() = Some(session);
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    pub fn set_remote_addr(&self, addr: SocketAddr) {
        *self.remote_addr.lock() = Some(addr);
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    pub fn set_app_data(&self, data: Box<dyn Any + Send + Sync>) {
        *self.app_data.lock() = Some(data);
    }

    pub fn set_protocol_data(&self, data: Box<dyn Any + Send + Sync>) {
        *self.protocol_data.lock() = Some(data);
    }

    /// Borrow the protocol-owned data as a concrete type, e.g. the
    /// `std::net::TcpListener` a protocol module stashed there at
    /// `listen` time so its `accept` implementation can call straight
    /// through to the standard library instead of parsing `sockaddr`.
    pub fn with_protocol_data<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.protocol_data.lock();
        guard.as_ref().and_then(|b| b.downcast_ref::<T>()).map(f)
    }

    pub fn delayq(&self) -> &Mutex<BufferChain> {
        &self.delayq
    }

    pub fn authq(&self) -> &Mutex<BufferChain> {
        &self.authq
    }

    pub(crate) fn writeq(&self) -> &Mutex<BufferChain> {
        &self.writeq
    }

    pub(crate) fn thread_mask(&self) -> &ThreadMask {
        &self.thread_mask
    }

    /// C3: append `chain` to the write queue, or attempt a direct send
    /// if the queue was empty. See `dcb::writeq::write`.
    pub fn write(&self, chain: BufferChain) -> std::io::Result<usize> {
        writeq::write(self, chain)
    }

    /// C3: send buffers from the head of the write queue. See
    /// `dcb::writeq::drain`.
    pub fn drain(&self) -> std::io::Result<usize> {
        writeq::drain(self)
    }

    /// C4: pull everything immediately available into `out`. See
    /// `dcb::read::read`.
    pub fn read_into(&self, out: &mut BufferChain, max_buffer_size: usize) -> std::io::Result<usize> {
        read::read(self, out, max_buffer_size)
    }

    fn take_protocol_data(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.protocol_data.lock().take()
    }

    fn take_app_data(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.app_data.lock().take()
    }

    fn take_session(&self) -> Option<Arc<Session>> {
        self.session.lock().take()
    }

    pub fn describe(&self) -> DcbSnapshot {
        DcbSnapshot {
            id: self.id,
            fd: self.fd(),
            role: self.role,
            state: self.state(),
            stats: self.stats.snapshot(),
            thread_mask_popcount: self.thread_mask.popcount(),
        }
    }
}

/// A point-in-time, lock-free-to-produce view of one DCB, for the
/// diagnostics surface (§4.9: "enumerate-all and print-one").
#[derive(Debug, Clone)]
pub struct DcbSnapshot {
    pub id: DcbId,
    pub fd: RawFd,
    pub role: Role,
    pub state: State,
    pub stats: DcbStatsSnapshot,
    pub thread_mask_popcount: u32,
}
