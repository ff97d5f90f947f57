//! The worker event loop and the `Runtime` that composes the DCB core
//! into something runnable: one shared `Epoll`, the registry, the
//! zombie reaper, and the protocol table.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::WorkerConfig;
use crate::dcb::registry::Registry;
use crate::dcb::reaper::ZombieReaper;
use crate::dcb::protocol::ProtocolRegistry;
use crate::dcb::{self, Dcb, DcbSnapshot, Role};
use crate::epoll::{Epoll, EpollOpt, Events, Ready, Token};
use crate::error::DcbError;
use crate::session::Session;

/// A backend the protocol's `connect` implementation dials. Owns the
/// per-server connection counter incremented by `Runtime::connect`.
#[derive(Debug)]
pub struct ServerSpec {
    pub addr: SocketAddr,
    pub connections: AtomicU64,
}

impl ServerSpec {
    pub fn new(addr: SocketAddr) -> ServerSpec {
        ServerSpec {
            addr,
            connections: AtomicU64::new(0),
        }
    }
}

/// Everything the DCB core needs to actually run: the poll set, the
/// registry, the zombie reaper, and the protocol table, plus the
/// bitmask of currently-running worker threads.
pub struct Runtime {
    epoll: Arc<Epoll>,
    registry: Registry,
    reaper: ZombieReaper,
    protocols: ProtocolRegistry,
    live_workers: AtomicU64,
    config: WorkerConfig,
}

impl Runtime {
    pub fn new(config: WorkerConfig) -> io::Result<Arc<Runtime>> {
        assert!(
            config.worker_threads as usize <= 64,
            "thread_mask is a 64-bit bitmask; worker_threads must be <= 64"
        );

        Ok(Arc::new(Runtime {
            epoll: Arc::new(Epoll::new()?),
            registry: Registry::new(config.max_dcbs),
            reaper: ZombieReaper::new(),
            protocols: ProtocolRegistry::new(),
            live_workers: AtomicU64::new(0),
            config,
        }))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn reaper(&self) -> &ZombieReaper {
        &self.reaper
    }

    pub fn protocols(&self) -> &ProtocolRegistry {
        &self.protocols
    }

    pub fn poll_add(&self, fd: RawFd, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        self.epoll.add(&fd, token, interest, opts)
    }

    pub fn poll_remove(&self, fd: RawFd) -> io::Result<()> {
        self.epoll.delete(&fd)
    }

    pub fn poll_live_worker_mask(&self) -> u64 {
        self.live_workers.load(Ordering::Acquire)
    }

    fn worker_enter(&self, tid: u32) {
        self.live_workers.fetch_or(1u64 << tid, Ordering::AcqRel);
    }

    fn worker_leave(&self, tid: u32) {
        self.live_workers.fetch_and(!(1u64 << tid), Ordering::AcqRel);
    }

    /// §4.6: allocate a REQUEST_HANDLER DCB, resolve the named protocol,
    /// link the session, call the protocol's `connect`, and bump the
    /// server's connection counter. The protocol's own `connect` is
    /// responsible for registering the new fd with the poll set. Returns
    /// the specific taxonomy variant (§7) at each failure site rather
    /// than collapsing them to a bare `None`.
    pub fn connect(
        self: &Arc<Self>,
        server: &ServerSpec,
        session: Arc<Session>,
        protocol_name: &str,
    ) -> crate::Result<Arc<Dcb>> {
        let dcb = self
            .registry
            .allocate_with(|id| Dcb::new(id, Role::RequestHandler, -1))
            .ok_or(DcbError::Alloc)?;

        let ops = match self.protocols.resolve(protocol_name) {
            Some(ops) => ops,
            None => {
                tracing::warn!(protocol = protocol_name, "protocol module not found");
                self.close_and_free_unlinked(&dcb);
                return Err(DcbError::ProtocolNotFound(protocol_name.to_string()));
            }
        };

        if !session.is_linked() {
            tracing::warn!(protocol = protocol_name, "session torn down before connect could link it");
            self.close_and_free_unlinked(&dcb);
            return Err(DcbError::SessionUnlinked);
        }

        dcb.set_protocol_ops(ops.clone());
        dcb.set_session(session.clone());

        let fd = match ops.connect(&dcb, server, &session) {
            Ok(fd) => fd,
            Err(err) => {
                tracing::warn!(error = %err, "protocol connect failed");
                let _ = dcb.transition(dcb::state::State::Disconnected);
                self.close_and_free_unlinked(&dcb);
                return Err(DcbError::Io(err));
            }
        };

        dcb.set_fd(fd);
        let _ = dcb.transition(dcb::state::State::Polling);
        server.connections.fetch_add(1, Ordering::Relaxed);

        Ok(dcb)
    }

    /// Bind a listener and register it with the poll set. Not named in
    /// spec.md, which treats "connect" as the only way a DCB comes into
    /// being; a runnable server needs a symmetric way to start listening.
    pub fn listen(self: &Arc<Self>, addr: SocketAddr, protocol_name: &str) -> crate::Result<Arc<Dcb>> {
        let ops = self
            .protocols
            .resolve(protocol_name)
            .ok_or_else(|| DcbError::ProtocolNotFound(protocol_name.to_string()))?;

        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let fd = {
            use std::os::unix::io::AsRawFd;
            listener.as_raw_fd()
        };

        let dcb = self
            .registry
            .allocate_with(|id| Dcb::new(id, Role::Listener, fd))
            .ok_or_else(|| {
                unsafe {
                    libc::close(fd);
                }
                DcbError::Alloc
            })?;
        dcb.set_protocol_ops(ops);
        dcb.set_protocol_data(Box::new(listener));
        let _ = dcb.transition(dcb::state::State::Listening);

        if let Err(err) = self.poll_add(fd, Token(dcb.id.into()), Ready::readable(), EpollOpt::edge()) {
            tracing::warn!(error = %err, "poll_add failed for listener");
            dcb::reaper::final_free(&dcb, self);
            return Err(DcbError::Io(err));
        }

        Ok(dcb)
    }

    /// §4.7: accept on a LISTENING DCB, allocate a fresh REQUEST_HANDLER
    /// DCB for the new connection, and register it with the poll set.
    /// The protocol's `accept` only produces the raw materials (fd,
    /// peer address) — it cannot register the new DCB itself, since the
    /// DCB does not exist until this function allocates it.
    pub fn accept(self: &Arc<Self>, listener: &Arc<Dcb>) -> crate::Result<Arc<Dcb>> {
        let ops = listener
            .protocol_ops()
            .ok_or_else(|| DcbError::ProtocolNotFound("<unregistered listener>".to_string()))?;

        let (fd, addr) = match ops.accept(listener) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                return Err(DcbError::Io(err));
            }
        };

        let dcb = self
            .registry
            .allocate_with(|id| Dcb::new(id, Role::RequestHandler, fd))
            .ok_or_else(|| {
                unsafe {
                    libc::close(fd);
                }
                DcbError::Alloc
            })?;
        dcb.set_protocol_ops(ops);
        dcb.set_remote_addr(addr);
        let _ = dcb.transition(dcb::state::State::Polling);

        if let Err(err) = self.poll_add(
            fd,
            Token(dcb.id.into()),
            Ready::readable() | Ready::writable(),
            EpollOpt::edge(),
        ) {
            tracing::warn!(error = %err, "poll_add failed for accepted dcb");
            dcb::reaper::final_free(&dcb, self);
            return Err(DcbError::Io(err));
        }

        listener.stats.accepts.fetch_add(1, Ordering::Relaxed);
        Ok(dcb)
    }

    pub fn close(self: &Arc<Self>, dcb: &Arc<Dcb>) -> io::Result<()> {
        dcb::reaper::close(dcb, self)
    }

    pub fn process_zombies(self: &Arc<Self>, tid: u32) {
        dcb::reaper::process_zombies(self, tid);
    }

    /// Enumerate-all diagnostics (§4.9).
    pub fn diagnostics(&self) -> Vec<DcbSnapshot> {
        let mut out = Vec::new();
        self.registry.enumerate(|dcb| out.push(dcb.describe()));
        out
    }

    fn close_and_free_unlinked(&self, dcb: &Arc<Dcb>) {
        dcb::reaper::final_free(dcb, self);
    }
}

/// One poll-dispatch-reap loop. Real deployments run several, one per
/// OS thread, sharing a `Runtime`.
pub struct Worker {
    pub tid: u32,
    runtime: Arc<Runtime>,
}

impl Worker {
    pub fn new(tid: u32, runtime: Arc<Runtime>) -> Worker {
        Worker { tid, runtime }
    }

    /// Block on poll, dispatch ready DCBs, reap zombies once, repeat.
    /// Stops when `should_stop` returns true, checked once per
    /// iteration (a blocking `wait` may still delay noticing it by up
    /// to `WorkerConfig::poll_timeout`).
    pub fn run(&self, mut should_stop: impl FnMut() -> bool) -> io::Result<()> {
        self.runtime.worker_enter(self.tid);
        let mut events = Events::with_capacity(self.runtime.config.poll_capacity);

        let result = (|| {
            while !should_stop() {
                self.tick(&mut events)?;
            }
            Ok(())
        })();

        self.runtime.worker_leave(self.tid);
        result
    }

    pub fn tick(&self, events: &mut Events) -> io::Result<()> {
        self.runtime
            .epoll
            .wait(events, Some(self.runtime.config.poll_timeout))?;

        for event in events.iter() {
            let id = dcb::registry::DcbId::from(usize::from(event.token()));
            if let Some(dcb) = self.runtime.registry.get(id) {
                self.dispatch(&dcb, event.readiness());
            }
        }

        self.runtime.process_zombies(self.tid);
        Ok(())
    }

    fn dispatch(&self, dcb: &Arc<Dcb>, ready: Ready) {
        let Some(ops) = dcb.protocol_ops() else {
            return;
        };

        if ready.is_error() || ready.is_hup() {
            ops.hangup_handler(dcb);
        }

        if ready.is_readable() {
            if dcb.role == Role::Listener {
                let _ = self.runtime.accept(dcb);
            } else if let Err(err) = ops.read(dcb) {
                ops.error_handler(dcb, &err);
            }
        }

        if ready.is_writable() {
            if let Err(err) = dcb.drain() {
                ops.error_handler(dcb, &err);
            }
        }
    }
}

