//! Descriptor Control Block subsystem for a multiplexing database proxy.
//!
//! A DCB is the per-socket state object worker threads dispatch events
//! against; this crate provides the state machine that governs its
//! lifecycle (C1), the registry that tracks every live DCB (C2), the
//! per-DCB write queue (C3) and read path (C4), and the zombie reaper
//! that reclaims a closed DCB only once no worker can still be
//! mid-dispatch on it (C5) — the part of a proxy like this that is hard
//! to get right, because closing is common and the memory a worker
//! dereferences must not disappear out from under it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use dcb_core::config::WorkerConfig;
//! use dcb_core::worker::{Runtime, Worker};
//! use dcb_core::protocols::echo::EchoProtocol;
//!
//! let runtime = Runtime::new(WorkerConfig::default()).unwrap();
//! runtime.protocols().register(EchoProtocol::NAME, EchoProtocol::new(&runtime));
//!
//! let listener = runtime
//!     .listen("127.0.0.1:0".parse().unwrap(), EchoProtocol::NAME)
//!     .unwrap();
//! let _ = listener;
//!
//! let worker = Worker::new(0, runtime.clone());
//! let mut ticks = 0;
//! worker.run(|| { ticks += 1; ticks > 1 }).unwrap();
//! ```

pub mod buffer;
pub mod config;
pub mod dcb;
pub mod epoll;
pub mod error;
pub mod protocols;
pub mod session;
mod sys;
pub mod worker;

pub use buffer::BufferChain;
pub use config::WorkerConfig;
pub use dcb::{Dcb, DcbSnapshot, Role};
pub use error::{DcbError, Result};
pub use session::{Router, RouterSession, Session};
pub use worker::{Runtime, ServerSpec, Worker};
