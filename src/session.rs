use std::sync::Arc;

use parking_lot::Mutex;

/// The query-routing layer above the DCB core. Opaque from the DCB's
/// perspective beyond this one callback.
pub trait Router: Send + Sync {
    fn close_session(&self, session: Box<dyn RouterSession>);
}

/// Per-session state owned by the router/filter pipeline. The DCB core
/// never inspects it, only hands it back to `Router::close_session`.
pub trait RouterSession: Send + Sync {}

/// The opaque handle a DCB links to. Owns its `router_session`; the DCB
/// holds a non-owning `Arc<Session>`. During final free the DCB swaps the
/// router_session handle out under this struct's own lock, then the
/// router's callback runs exactly once.
pub struct Session {
    router_instance: Arc<dyn Router>,
    router_session: Mutex<Option<Box<dyn RouterSession>>>,
}

impl Session {
    pub fn new(router_instance: Arc<dyn Router>, router_session: Box<dyn RouterSession>) -> Arc<Session> {
        Arc::new(Session {
            router_instance,
            router_session: Mutex::new(Some(router_session)),
        })
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router_instance
    }

    /// Swap the router session handle out. Returns `None` if it was
    /// already taken (teardown already ran).
    pub fn take_router_session(&self) -> Option<Box<dyn RouterSession>> {
        self.router_session.lock().take()
    }

    /// Whether the session still owns a router session, i.e. has not
    /// already gone through `take_router_session`/final-free once.
    /// `Runtime::connect` checks this before linking a new DCB to a
    /// session that has already been torn down.
    pub fn is_linked(&self) -> bool {
        self.router_session.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRouter {
        closes: AtomicUsize,
    }

    impl Router for CountingRouter {
        fn close_session(&self, _session: Box<dyn RouterSession>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NullSession;
    impl RouterSession for NullSession {}

    #[test]
    fn take_router_session_is_one_shot() {
        let router = Arc::new(CountingRouter {
            closes: AtomicUsize::new(0),
        });
        let session = Session::new(router.clone(), Box::new(NullSession));

        let first = session.take_router_session();
        assert!(first.is_some());
        let second = session.take_router_session();
        assert!(second.is_none());

        router.close_session(first.unwrap());
        assert_eq!(router.closes.load(Ordering::SeqCst), 1);
    }
}
