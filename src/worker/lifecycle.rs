//! Worker states and the lifecycle events a worker publishes.
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::{JobId, QueueEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Running,
    Draining,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Ready,
    Error {
        message: String,
    },
    StateChanged(WorkerState),
    JobCompleted {
        job_id: JobId,
    },
    JobFailed {
        job_id: JobId,
        attempts_made: u32,
        error: String,
        dead_lettered: bool,
    },
    JobStalled {
        job_id: JobId,
    },
    JobProgress {
        job_id: JobId,
        progress: u8,
    },
    JobRejected {
        job_id: JobId,
    },
    FlushStarted {
        count: usize,
    },
    FlushCompleted {
        count: usize,
        duration: Duration,
        throughput: u64,
    },
    FlushFailed {
        count: usize,
        duration: Duration,
        error: String,
    },
    Closed,
}

impl From<QueueEventKind> for WorkerEvent {
    fn from(kind: QueueEventKind) -> Self {
        match kind {
            QueueEventKind::Ready => WorkerEvent::Ready,
            QueueEventKind::Error { message } => WorkerEvent::Error { message },
            QueueEventKind::Completed { job_id } => WorkerEvent::JobCompleted { job_id },
            QueueEventKind::Failed {
                job_id,
                attempts_made,
                reason,
                dead_lettered,
            } => WorkerEvent::JobFailed {
                job_id,
                attempts_made,
                error: reason,
                dead_lettered,
            },
            QueueEventKind::Stalled { job_id } => WorkerEvent::JobStalled { job_id },
            QueueEventKind::Progress { job_id, progress } => {
                WorkerEvent::JobProgress { job_id, progress }
            }
        }
    }
}

/// Turns the events of one worker into log records, until the worker goes away
pub fn spawn_event_logger(
    queue: String,
    mut events: broadcast::Receiver<WorkerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&queue, event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(queue = %queue, skipped, "event logger fell behind, events dropped")
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(queue: &str, event: WorkerEvent) {
    match event {
        WorkerEvent::Ready => info!(queue, "Worker ready"),
        WorkerEvent::Error { message } => error!(queue, error = %message, "Worker error"),
        WorkerEvent::StateChanged(state) => debug!(queue, ?state, "Worker state changed"),
        WorkerEvent::JobCompleted { job_id } => debug!(queue, job_id = %job_id, "Job completed"),
        WorkerEvent::JobFailed {
            job_id,
            attempts_made,
            error,
            dead_lettered,
        } => error!(
            queue,
            job_id = %job_id,
            attempts_made,
            dead_lettered,
            error = %error,
            "Job failed"
        ),
        WorkerEvent::JobStalled { job_id } => warn!(queue, job_id = %job_id, "Job stalled"),
        WorkerEvent::JobProgress { job_id, progress } => {
            debug!(queue, job_id = %job_id, progress, "Job progress")
        }
        WorkerEvent::JobRejected { job_id } => {
            warn!(queue, job_id = %job_id, "Worker rejecting job during shutdown")
        }
        WorkerEvent::FlushStarted { count } => info!(queue, count, "Batch flush started"),
        WorkerEvent::FlushCompleted {
            count,
            duration,
            throughput,
        } => info!(
            queue,
            count,
            duration_ms = duration.as_millis() as u64,
            throughput,
            "Batch flush completed"
        ),
        WorkerEvent::FlushFailed {
            count,
            duration,
            error,
        } => error!(
            queue,
            count,
            duration_ms = duration.as_millis() as u64,
            error = %error,
            "Batch flush failed"
        ),
        WorkerEvent::Closed => info!(queue, "Worker closed"),
    }
}
