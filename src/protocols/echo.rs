use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::{Arc, Weak};

use crate::buffer::BufferChain;
use crate::dcb::protocol::ProtocolOps;
use crate::dcb::Dcb;
use crate::epoll::{EpollOpt, Ready, Token};
use crate::session::Session;
use crate::worker::{Runtime, ServerSpec};

/// A test double that writes back whatever it reads. Enough to drive
/// connect/accept/read/write/close through the whole DCB lifecycle
/// without parsing a real wire protocol (out of scope).
pub struct EchoProtocol {
    runtime: Weak<Runtime>,
}

impl EchoProtocol {
    pub const NAME: &'static str = "echo";

    pub fn new(runtime: &Arc<Runtime>) -> Arc<EchoProtocol> {
        Arc::new(EchoProtocol {
            runtime: Arc::downgrade(runtime),
        })
    }

    fn runtime(&self) -> io::Result<Arc<Runtime>> {
        self.runtime
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "runtime shut down"))
    }
}

impl ProtocolOps for EchoProtocol {
    fn connect(&self, dcb: &Dcb, server: &ServerSpec, _session: &Session) -> io::Result<RawFd> {
        let stream = TcpStream::connect(server.addr)?;
        stream.set_nonblocking(true)?;
        let fd = stream.into_raw_fd();

        self.runtime()?
            .poll_add(fd, Token(dcb.id.into()), Ready::readable(), EpollOpt::edge())?;

        Ok(fd)
    }

    fn accept(&self, listener: &Dcb) -> io::Result<(RawFd, SocketAddr)> {
        let accepted = listener
            .with_protocol_data::<TcpListener, io::Result<(TcpStream, SocketAddr)>>(|l| l.accept())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "listener has no bound socket"))?;
        let (stream, addr) = accepted?;
        stream.set_nonblocking(true)?;
        Ok((stream.into_raw_fd(), addr))
    }

    fn read(&self, dcb: &Dcb) -> io::Result<usize> {
        let runtime = self.runtime()?;
        let mut chain = BufferChain::new();
        let n = dcb.read_into(&mut chain, runtime.config().max_buffer_size)?;
        if n == 0 {
            return Ok(0);
        }
        dcb.write(chain)?;
        Ok(n)
    }

    fn write(&self, dcb: &Dcb, chain: BufferChain) -> io::Result<usize> {
        dcb.write(chain)
    }

    fn close(&self, dcb: &Dcb) {
        let fd = dcb.fd();
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }

    fn session_write(&self, dcb: &Dcb, chain: BufferChain) -> io::Result<usize> {
        dcb.write(chain)
    }

    fn error_handler(&self, dcb: &Dcb, err: &io::Error) {
        tracing::debug!(id = ?dcb.id, error = %err, "echo protocol error");
    }

    fn hangup_handler(&self, dcb: &Dcb) {
        tracing::trace!(id = ?dcb.id, "echo protocol hangup");
    }
}
