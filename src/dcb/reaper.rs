use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::worker::Runtime;

use super::state::State;
use super::Dcb;

/// C5, the hard core: tracks DCBs that have been closed but may still be
/// mid-dispatch on some worker, and frees them only once every worker
/// live at close time has passed a safe point.
#[derive(Default)]
pub struct ZombieReaper {
    list: Mutex<VecDeque<Arc<Dcb>>>,
    len: AtomicUsize,
}

impl ZombieReaper {
    pub fn new() -> ZombieReaper {
        ZombieReaper::default()
    }

    /// Append `dcb` to the zombie list and transition it to `Zombie`,
    /// unless it is already there. The check happens inside the
    /// zombie-list critical section so a racing second close can never
    /// double-insert the same DCB (§9's resolved open question). Lock
    /// order here is zombie-list < init-lock, matching §5.
    fn push_if_not_zombie(&self, dcb: Arc<Dcb>) {
        let mut list = self.list.lock();
        if dcb.mark_zombie_once() {
            tracing::trace!(id = ?dcb.id, "dcb already on zombie list, duplicate push rejected");
            return;
        }
        list.push_back(dcb);
        self.len.store(list.len(), Ordering::Release);
        tracing::trace!(len = list.len(), "dcb pushed onto zombie list");
    }

    /// Dirty-read the list head; if empty, the fast path returns
    /// immediately without taking the lock.
    pub fn process(&self, tid: u32) -> Vec<Arc<Dcb>> {
        if self.len.load(Ordering::Acquire) == 0 {
            return Vec::new();
        }

        let mut victims = Vec::new();
        let mut list = self.list.lock();
        let mut i = 0;
        while i < list.len() {
            list[i].thread_mask().clear_bit(tid);
            if list[i].thread_mask().is_clear() {
                let dcb = list.remove(i).unwrap();
                tracing::trace!(id = ?dcb.id, tid, "zombie's thread mask cleared, queued for reap");
                victims.push(dcb);
            } else {
                i += 1;
            }
        }
        self.len.store(list.len(), Ordering::Release);

        victims
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

/// Close protocol (§4.5): under the init-lock, transition to Nopolling,
/// ask the poll layer to remove the descriptor, and snapshot the live
/// worker mask. If another thread already closed this DCB the
/// transition fails and the call is a safe no-op.
pub fn close(dcb: &Arc<Dcb>, runtime: &Runtime) -> std::io::Result<()> {
    if dcb.transition(State::Nopolling).is_err() {
        tracing::trace!(id = ?dcb.id, "close on dcb already past Nopolling, no-op");
        return Ok(());
    }

    runtime.poll_remove(dcb.fd())?;
    let mask = runtime.poll_live_worker_mask();
    dcb.thread_mask().set(mask);
    tracing::debug!(id = ?dcb.id, mask, "dcb closed, snapshotted live worker mask");

    runtime.reaper().push_if_not_zombie(dcb.clone());
    Ok(())
}

/// Reaping protocol (§4.5): clear `tid`'s bit on every zombie; any whose
/// mask is now all-clear gets closed, transitioned, and finally freed,
/// outside the zombie-list lock.
pub fn process_zombies(runtime: &Arc<Runtime>, tid: u32) {
    let victims = runtime.reaper().process(tid);
    if !victims.is_empty() {
        tracing::debug!(tid, count = victims.len(), "reaping zombies");
    }
    for dcb in victims {
        reap_one(&dcb, runtime);
    }
}

fn reap_one(dcb: &Arc<Dcb>, runtime: &Runtime) {
    let fd = dcb.take_fd();
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }

    let _ = dcb.transition(State::Disconnected);
    tracing::debug!(id = ?dcb.id, "dcb reaped, disconnected");

    final_free(dcb, runtime);
}

/// Under no locks held by the caller: unlink from the registry, run the
/// router's close-session callback exactly once, and drop the DCB's
/// owned buffers. Infallible, per §7.
pub(crate) fn final_free(dcb: &Arc<Dcb>, runtime: &Runtime) {
    runtime.registry().unlink(dcb.id);

    if let Some(session) = dcb.take_session() {
        if let Some(router_session) = session.take_router_session() {
            tracing::trace!(id = ?dcb.id, "closing router session on final free");
            session.router().close_session(router_session);
        }
    }

    dcb.take_protocol_data();
    dcb.take_app_data();
    tracing::trace!(id = ?dcb.id, "dcb freed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::dcb::{registry::DcbId, Role};
    use crate::epoll::{EpollOpt, Ready, Token};
    use crate::worker::Runtime;
    use std::os::unix::io::AsRawFd;
    use std::sync::Barrier;

    fn mask_dcb(mask: u64) -> Arc<Dcb> {
        let dcb = Arc::new(Dcb::new(DcbId(0), Role::RequestHandler, -1));
        dcb.thread_mask().set(mask);
        dcb
    }

    /// S4: bits must clear one worker at a time, and the dcb is only
    /// handed back once the mask is entirely clear.
    #[test]
    fn zombie_cleared_one_worker_at_a_time() {
        let reaper = ZombieReaper::new();
        let dcb = mask_dcb(0b101); // tids 0 and 2 still outstanding

        reaper.push_if_not_zombie(dcb.clone());
        assert_eq!(reaper.len(), 1);

        let victims = reaper.process(1); // tid 1 was never in the mask
        assert!(victims.is_empty());
        assert_eq!(dcb.thread_mask().get(), 0b101);

        let victims = reaper.process(0);
        assert!(victims.is_empty());
        assert_eq!(dcb.thread_mask().get(), 0b100);
        assert_eq!(reaper.len(), 1);

        let victims = reaper.process(2);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].id, dcb.id);
        assert_eq!(reaper.len(), 0);
    }

    #[test]
    fn duplicate_push_is_rejected() {
        let reaper = ZombieReaper::new();
        let dcb = mask_dcb(1);

        reaper.push_if_not_zombie(dcb.clone());
        assert_eq!(reaper.len(), 1);

        reaper.push_if_not_zombie(dcb.clone());
        assert_eq!(reaper.len(), 1, "second push of the same dcb must be rejected");
    }

    /// S3: two threads racing `close` on the same dcb must produce
    /// exactly one Nopolling transition and exactly one zombie entry.
    #[test]
    fn concurrent_close_creates_exactly_one_zombie_entry() {
        let runtime = Runtime::new(WorkerConfig::default()).unwrap();
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();
        std::mem::forget(a); // dcb now owns the fd

        let dcb = Arc::new(Dcb::new(DcbId(0), Role::RequestHandler, fd));
        runtime
            .poll_add(fd, Token(0), Ready::readable(), EpollOpt::edge())
            .unwrap();
        let _ = dcb.transition(State::Polling);

        let barrier = Arc::new(Barrier::new(2));
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let runtime = runtime.clone();
                let dcb = dcb.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    close(&dcb, &runtime)
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap().unwrap();
        }

        assert_eq!(runtime.reaper().len(), 1, "exactly one zombie entry should be created");
        assert_eq!(dcb.state(), State::Zombie);
    }
}
