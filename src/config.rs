use std::time::Duration;

/// Values passed into [`crate::worker::Runtime::new`]. The DCB core keeps
/// no persisted configuration of its own — there is nothing here to load
/// from a file, only a value the caller constructs once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker threads that will call [`crate::worker::Worker::run`].
    /// Bounded by the width of the thread-mask bitmask (64).
    pub worker_threads: u32,
    /// Capacity of the `Events` buffer each worker reuses across
    /// `Epoll::wait` calls.
    pub poll_capacity: usize,
    /// Upper bound on a single read-path allocation (spec's `MAX_BUFFER_SIZE`).
    pub max_buffer_size: usize,
    /// How long a worker may block in `Epoll::wait` before it re-checks
    /// its shutdown flag.
    pub poll_timeout: Duration,
    /// Upper bound on the number of live DCBs the registry will hand
    /// out. `Runtime::connect`/`listen`/`accept` report `DcbError::Alloc`
    /// once this is reached, standing in for the reference taxonomy's
    /// out-of-memory allocation failure.
    pub max_dcbs: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_threads: 4,
            poll_capacity: 1024,
            max_buffer_size: 4096,
            poll_timeout: Duration::from_millis(250),
            max_dcbs: 65_536,
        }
    }
}
