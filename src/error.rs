//! Error taxonomy for the propagation engine.
//!
//! Mirrors the misuse classes the engine itself can detect: sending on a sink
//! while inside a listener callback, and forward-declared loops used before or
//! after their binding call. Exceptions raised by *user* handler closures during
//! listener replay are caught and logged at the call site (see `stream::Stream`)
//! rather than surfaced here, matching the propagation policy in spec §7.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FrpError>;

/// Errors the engine can raise when a caller misuses the transaction or loop
/// APIs.
#[derive(Debug, Error)]
pub enum FrpError {
    /// `StreamSink::send` / `CellSink::send` was called while a listener
    /// callback for the same (or an outer) transaction was still on the stack.
    #[error("send() called while inside a listener callback (InCallback > 0)")]
    SendDuringCallback,

    /// A `StreamLoop`/`CellLoop` was sampled, or had something routed through
    /// it, before `loop_to` bound it to a real stream or cell.
    #[error("loop {what} used before loop_to() bound it to a real source")]
    LoopNotLooped {
        /// What was being accessed (`"StreamLoop"` or `"CellLoop"`).
        what: &'static str,
    },

    /// `loop_to` was called a second time on the same forward declaration.
    #[error("loop {what} was already bound by a previous loop_to() call")]
    LoopAlreadyLooped {
        /// What was being bound (`"StreamLoop"` or `"CellLoop"`).
        what: &'static str,
    },
}

impl FrpError {
    pub(crate) fn loop_not_looped(what: &'static str) -> Self {
        FrpError::LoopNotLooped { what }
    }

    pub(crate) fn loop_already_looped(what: &'static str) -> Self {
        FrpError::LoopAlreadyLooped { what }
    }
}
