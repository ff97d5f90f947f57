use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::BufferChain;
use crate::session::Session;
use crate::worker::ServerSpec;

use super::Dcb;

/// The protocol module contract (§6): a fixed operation table resolved
/// by name at connect/accept. Real deployments plug in a MySQL client or
/// backend parser here; this crate ships one test double, `EchoProtocol`.
pub trait ProtocolOps: Send + Sync {
    fn connect(&self, dcb: &Dcb, server: &ServerSpec, session: &Session) -> io::Result<RawFd>;
    fn accept(&self, listener: &Dcb) -> io::Result<(RawFd, SocketAddr)>;
    fn read(&self, dcb: &Dcb) -> io::Result<usize>;
    fn write(&self, dcb: &Dcb, chain: BufferChain) -> io::Result<usize>;
    fn close(&self, dcb: &Dcb);
    fn session_write(&self, dcb: &Dcb, chain: BufferChain) -> io::Result<usize>;
    fn error_handler(&self, dcb: &Dcb, err: &io::Error);
    fn hangup_handler(&self, dcb: &Dcb);
}

/// Module-level table of protocol implementations, resolved by name.
/// Populated before any worker starts (§9: "module-level singletons
/// initialised before any worker starts").
#[derive(Default)]
pub struct ProtocolRegistry {
    inner: Mutex<HashMap<&'static str, Arc<dyn ProtocolOps>>>,
}

impl ProtocolRegistry {
    pub fn new() -> ProtocolRegistry {
        ProtocolRegistry::default()
    }

    pub fn register(&self, name: &'static str, ops: Arc<dyn ProtocolOps>) {
        self.inner.lock().insert(name, ops);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ProtocolOps>> {
        self.inner.lock().get(name).cloned()
    }
}
