//! Typed errors for queue construction, producer and consumer operations.
//!
//! Contract breaches (calling `get` while a message is outstanding, calling
//! `done` without one) are not represented here: they panic.

use thiserror::Error;

/// Errors produced by the async message queue and its event loop adapter.
#[derive(Debug, Error)]
pub enum AsyncMsgQError {
    /// No message was queued, or the queue was closed while waiting.
    #[error("no message available")]
    NotAvailable,
    /// Non-blocking enqueue found every slot occupied.
    #[error("message queue full")]
    Full,
    /// The queue was closed or its reader was dropped.
    #[error("message queue closed")]
    Closed,
    /// The reader was destroyed before replying to a sent message.
    #[error("message queue reader dropped before replying")]
    ReplyDropped,
    /// The readiness socket pair could not be created or configured.
    #[error("failed to set up queue readiness notifier: {source}")]
    Notifier {
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// Event loop polling failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
