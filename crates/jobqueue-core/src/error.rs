//! Public error boundary.
//!
//! Only conditions a caller can synchronously act on are modeled here.
//! Everything behind a spawned task (store I/O, webhook delivery) stays on
//! `anyhow::Result` and never crosses back out as a `QueueError` — those
//! failures are logged and swallowed, per the background-failure contract.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("priority must be between 1 and 10, got {0}")]
    InvalidPriority(u8),

    #[error("store operation failed: {0}")]
    Store(#[source] anyhow::Error),
}
