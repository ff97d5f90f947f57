use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;

use crate::buffer::BufferChain;

use super::Dcb;

/// C3: if the write queue is non-empty, append and return (a later
/// `drain` will send it). Otherwise attempt a direct send; on a short
/// write or EAGAIN the remainder becomes the new write queue; on any
/// other error the remainder is retained and the call reports failure.
pub fn write(dcb: &Dcb, chain: BufferChain) -> io::Result<usize> {
    let mut q = dcb.writeq().lock();

    if !q.is_empty() {
        q.append(chain);
        dcb.stats.buffered_writes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id = ?dcb.id, qlen = q.len(), "write appended to non-empty queue");
        return Ok(0);
    }

    let fd = dcb.fd();
    let total = chain.len();
    match send_chain(fd, &chain) {
        Ok(sent) if sent >= total => {
            dcb.stats.writes.fetch_add(1, Ordering::Relaxed);
            Ok(sent)
        }
        Ok(sent) => {
            let mut remainder = chain;
            remainder.consume(sent);
            let remaining = remainder.len();
            *q = remainder;
            dcb.stats.buffered_writes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(id = ?dcb.id, sent, total, remaining, "short write, remainder queued");
            Ok(sent)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            *q = chain;
            dcb.stats.buffered_writes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(id = ?dcb.id, total, "write would block, whole chain queued");
            Ok(0)
        }
        Err(e) => {
            *q = chain;
            tracing::warn!(id = ?dcb.id, error = %e, "write failed, chain retained on queue");
            Err(e)
        }
    }
}

/// C3: called by the poll layer on writable events. Sends from the head
/// of the queue until either it empties or a short/EAGAIN write occurs.
pub fn drain(dcb: &Dcb) -> io::Result<usize> {
    let mut q = dcb.writeq().lock();

    if q.is_empty() {
        return Ok(0);
    }

    let fd = dcb.fd();
    match send_chain(fd, &q) {
        Ok(sent) => {
            q.consume(sent);
            tracing::trace!(id = ?dcb.id, sent, remaining = q.len(), "drained write queue");
            Ok(sent)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

fn send_chain(fd: RawFd, chain: &BufferChain) -> io::Result<usize> {
    let slices = chain.io_slices();
    if slices.is_empty() {
        return Ok(0);
    }

    let n = unsafe { libc::writev(fd, slices.as_ptr() as *const libc::iovec, slices.len() as i32) };
    if n == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcb::{registry::DcbId, Role};
    use std::os::unix::io::AsRawFd;

    fn loopback_dcb() -> (Dcb, std::os::unix::net::UnixStream) {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let dcb = Dcb::new(DcbId(0), Role::RequestHandler, a.as_raw_fd());
        std::mem::forget(a); // Dcb now owns the fd
        (dcb, b)
    }

    #[test]
    fn direct_send_on_empty_queue() {
        let (dcb, mut peer) = loopback_dcb();
        use std::io::Read;

        let mut chain = BufferChain::new();
        chain.push_back(b"HELLO".to_vec());
        let sent = write(&dcb, chain).unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"HELLO");
        assert!(dcb.writeq().lock().is_empty());
    }

    #[test]
    fn write_appends_when_queue_already_non_empty() {
        let dcb = Dcb::new(DcbId(0), Role::RequestHandler, -1);
        dcb.writeq().lock().push_back(b"AAAA".to_vec());

        let mut chain = BufferChain::new();
        chain.push_back(b"BBBB".to_vec());
        let sent = write(&dcb, chain).unwrap();

        assert_eq!(sent, 0);
        assert_eq!(dcb.writeq().lock().len(), 8);
    }

    /// S2: a chain too large for the socket's send buffer to absorb in
    /// one `writev` must retain exactly the unsent remainder on the
    /// queue, not the whole chain and not nothing.
    #[test]
    fn short_write_retains_remainder_on_queue() {
        let (dcb, _peer) = loopback_dcb();

        // Large enough that no unix socket send buffer on a sane system
        // absorbs it in one writev, but small enough to allocate cheaply.
        let total = 8 * 1024 * 1024;
        let mut chain = BufferChain::new();
        chain.push_back(vec![7u8; total]);

        let sent = write(&dcb, chain).unwrap();
        assert!(sent > 0, "some bytes should have gone out before the buffer filled");
        assert!(sent < total, "a short write was expected to leave a remainder");

        let remaining = dcb.writeq().lock().len();
        assert_eq!(remaining, total - sent);
        assert_eq!(dcb.stats.buffered_writes.load(Ordering::Relaxed), 1);
    }
}
