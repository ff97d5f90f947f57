use std::cmp;
use std::io;
use std::sync::atomic::Ordering;

use crate::buffer::BufferChain;

use super::Dcb;

/// C4: query the kernel for the number of immediately readable bytes and
/// drain them into `out` in `max_buffer_size`-sized chunks until the
/// kernel count is exhausted. Stops on a peer close (0), on
/// EAGAIN/EWOULDBLOCK (returns bytes read so far), or on any other error.
///
/// Touches only `dcb.fd()` and the caller-owned `out` — no DCB lock is
/// held across the `read(2)` syscall.
pub fn read(dcb: &Dcb, out: &mut BufferChain, max_buffer_size: usize) -> io::Result<usize> {
    let fd = dcb.fd();
    let mut total = 0usize;

    loop {
        let mut available: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available as *mut libc::c_int) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        if available <= 0 {
            break;
        }

        let want = cmp::min(available as usize, max_buffer_size);
        let mut buf = vec![0u8; want];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, want) };

        match n {
            0 => break,
            n if n > 0 => {
                buf.truncate(n as usize);
                total += n as usize;
                out.push_back(buf);
                dcb.stats.reads.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(total);
                }
                return Err(err);
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcb::{registry::DcbId, Role};
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn drains_available_bytes_in_chunks() {
        let (a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let payload = vec![7u8; 10 * 1024];
        b.write_all(&payload).unwrap();

        let dcb = Dcb::new(DcbId(0), Role::RequestHandler, a.as_raw_fd());
        std::mem::forget(a);

        let mut out = BufferChain::new();
        let total = read(&dcb, &mut out, 4096).unwrap();

        assert_eq!(total, payload.len());
        assert_eq!(out.len(), payload.len());
    }

    #[test]
    fn returns_zero_when_peer_closed() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        drop(b);

        let dcb = Dcb::new(DcbId(0), Role::RequestHandler, a.as_raw_fd());
        std::mem::forget(a);

        let mut out = BufferChain::new();
        let total = read(&dcb, &mut out, 4096).unwrap();
        assert_eq!(total, 0);
    }
}
