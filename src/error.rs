//! Transport error types.
//!
//! Grounded on `gecko_core::error::EngineError` in the retrieval pack: a
//! `thiserror` enum covering state violations, transport plumbing failures,
//! and a pass-through slot for the opaque engine's own error codes. The two
//! call sites the specification calls out as returning a literal `-1`/`0`
//! (`start`, `stop`) keep that literal `i32` return instead of this enum;
//! everywhere else a `Result<T, TransportError>` replaces raw sentinels.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport already initialized")]
    AlreadyInitialized,

    #[error("transport not initialized: no engine instance has been created")]
    NotInitialized,

    #[error("operation not valid in current play state: {0:?}")]
    InvalidPlayState(crate::play_state::PlayState),

    #[error("engine returned error code {0}")]
    Engine(i32),

    #[error("callback RPC failed: {0}")]
    Callback(#[from] crate::callback::CallbackError),

    #[error("control channel closed: worker thread exited")]
    ChannelClosed,

    #[error("filesystem bridge operation is not implemented by this transport")]
    Unsupported,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type TransportResult<T> = Result<T, TransportError>;
