//! Persistent job queue core.
//!
//! Four cooperating pieces, each documented in its own module:
//!
//! - [`model`] — the job record and its supporting types.
//! - [`store`] — the `JobStore` trait and the in-memory `VolatileStore`. The
//!   Redis-backed Durable store lives in the sibling `jobqueue-redis` crate.
//! - [`queue`] — `JobQueue`: priority scheduling, the worker pool, the
//!   lifecycle state machine, progress fan-out, webhook delivery, eviction.
//! - [`webhook`] — SSRF-gated webhook delivery.
//!
//! ```text
//! enqueue ──▶ pending (priority queue) ──▶ dispatch ──▶ running ──┬─▶ completed
//!                                               ▲                 ├─▶ failed
//!                                               └────(retry)──────┤
//!                                                                 └─▶ cancelled
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod progress;
pub mod queue;
pub mod store;
pub mod webhook;

pub use config::QueueConfig;
pub use error::QueueError;
pub use model::{Job, JobOptions, JobStatus, JobType, ListFilter};
pub use progress::{ProgressEvent, ProgressStream};
pub use queue::{CancelSignal, JobHandler, JobQueue, ProgressReporter, Stats};
pub use store::{JobStore, VolatileStore};
pub use webhook::{AllowAllValidator, SsrfBlocked, WebhookPayload, WebhookUrlValidator};
