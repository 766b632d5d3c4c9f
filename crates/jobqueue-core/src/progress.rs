//! Live progress fan-out.
//!
//! `stream_progress` hands back a `ProgressStream`, a thin `futures::Stream`
//! wrapper over an unbounded mpsc channel. Fan-out isolation is structural
//! here rather than catch-guarded the way a callback-based subscriber list
//! would need to be: a slow or dropped receiver can only ever affect its own
//! channel, never its neighbours.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::model::Job;

/// One event in a job's progress sequence. The first event delivered to a
/// fresh subscription is always a `Status` snapshot; if the job is already
/// terminal at subscribe time, that snapshot doubles as the final event and
/// no further events follow.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ProgressEvent {
    Status(Job),
    Progress { percent: u8, message: Option<String> },
    Complete { result: Option<serde_json::Value> },
    Error { error: String },
}

impl ProgressEvent {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Complete { .. } | ProgressEvent::Error { .. }
        ) || matches!(self, ProgressEvent::Status(job) if job.status.is_terminal())
    }
}

/// A subscription to one job's progress events.
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<ProgressEvent>) -> Self {
        Self { rx }
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
