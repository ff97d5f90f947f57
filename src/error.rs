use crate::dcb::state::State;

/// Errors surfaced at the DCB core's entry points (`connect`, `read`,
/// `write`). Internal paths never raise across component boundaries —
/// see the close/reap protocol in `dcb::reaper`, which is infallible.
#[derive(thiserror::Error, Debug)]
pub enum DcbError {
    #[error("allocation failed")]
    Alloc,
    #[error("invalid state transition from {from:?}")]
    InvalidTransition { from: State },
    #[error("protocol module not found: {0}")]
    ProtocolNotFound(String),
    #[error("session unavailable")]
    SessionUnlinked,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DcbError>;
