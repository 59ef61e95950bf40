//! Durable job queues the workers consume from.
//!
//! A queue connection hands out [Job]s for a named queue, and is told about
//! their fate through [QueueConnection::ack] and [QueueConnection::fail].
//! Failed jobs are rescheduled according to a [RetryPolicy] or dead-lettered
//! once the policy is exhausted.
pub mod kafka;
pub mod memory;
pub mod retry;

mod offsets;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::error::QueueError;

pub use retry::{Backoff, BackoffKind, FailOutcome, RetryPolicy};

pub type JobId = String;

/// Position of a job inside a partitioned log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// Queue bookkeeping attached to every job
#[derive(Debug, Clone, PartialEq)]
pub struct JobMeta {
    pub id: JobId,
    /// number of failed attempts so far
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
    pub delivery: Option<Delivery>,
}

/// One unit of queued work carrying a single payload
#[derive(Debug, Clone)]
pub struct Job<E> {
    pub meta: JobMeta,
    pub data: E,
}

impl<E> Job<E> {
    pub fn new(id: impl Into<JobId>, data: E) -> Job<E> {
        Job {
            meta: JobMeta {
                id: id.into(),
                attempts_made: 0,
                enqueued_at: Utc::now(),
                delivery: None,
            },
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEventKind {
    Ready,
    Error {
        message: String,
    },
    Completed {
        job_id: JobId,
    },
    Failed {
        job_id: JobId,
        attempts_made: u32,
        reason: String,
        dead_lettered: bool,
    },
    Stalled {
        job_id: JobId,
    },
    Progress {
        job_id: JobId,
        progress: u8,
    },
}

/// Lifecycle notification published by a queue connection
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEvent {
    pub queue: String,
    pub kind: QueueEventKind,
}

impl QueueEvent {
    pub fn new(queue: &str, kind: QueueEventKind) -> QueueEvent {
        QueueEvent {
            queue: queue.to_owned(),
            kind,
        }
    }
}

/// Capacity of the lifecycle broadcast channels
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Shared connection resource, released once every worker has closed
#[async_trait]
pub trait Connection: Send + Sync {
    async fn close(&self) -> Result<(), QueueError>;
}

/// At-least-once job queue, one logical queue per event type
#[async_trait]
pub trait QueueConnection<E>: Connection {
    /// Appends a new job to the queue
    async fn enqueue(&self, queue: &str, data: E) -> Result<JobId, QueueError>;

    /// Waits for the next job of the queue.
    /// Returns `None` once delivery for the queue has been stopped.
    async fn receive(&self, queue: &str) -> Result<Option<Job<E>>, QueueError>;

    /// Marks a delivered job as completed
    async fn ack(&self, queue: &str, job: &JobMeta) -> Result<(), QueueError>;

    /// Marks a delivered job as failed, scheduling a retry or dead-lettering it
    async fn fail(&self, queue: &str, job: Job<E>, reason: &str)
        -> Result<FailOutcome, QueueError>;

    /// Stops delivery for a single queue, pending `receive` calls return `None`
    async fn stop(&self, queue: &str) -> Result<(), QueueError>;

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;
}
