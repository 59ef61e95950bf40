//! In-process queue with retry, dead-letter and stalled-job handling.
//!
//! Used by the test-suite and for local runs without a broker.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    Connection, FailOutcome, Job, JobId, JobMeta, QueueConnection, QueueEvent, QueueEventKind,
    RetryPolicy, EVENT_CHANNEL_CAPACITY,
};
use crate::error::QueueError;

const STALLED_REASON: &str = "job stalled more than allowable limit";

#[derive(Debug, Clone)]
pub struct MemoryQueueOptions {
    pub retry: RetryPolicy,
    /// how long a delivered job may stay unacknowledged before it counts as stalled
    pub stalled_interval: Duration,
    /// stalls tolerated before the job is failed instead of redelivered
    pub max_stalled_count: u32,
    /// dead letters kept per queue, the oldest are dropped first
    pub dead_letter_retention: usize,
}

impl Default for MemoryQueueOptions {
    fn default() -> Self {
        MemoryQueueOptions {
            retry: RetryPolicy::default(),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
            dead_letter_retention: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: u64,
    pub dead: usize,
}

/// Job that exhausted its retry budget
#[derive(Debug, Clone)]
pub struct DeadLetter<E> {
    pub job: Job<E>,
    pub reason: String,
}

struct Active<E> {
    job: Job<E>,
    since: Instant,
}

struct QueueState<E> {
    waiting: VecDeque<Job<E>>,
    delayed: Vec<(Instant, Job<E>)>,
    active: HashMap<JobId, Active<E>>,
    stalls: HashMap<JobId, u32>,
    dead: VecDeque<DeadLetter<E>>,
    completed: u64,
    stopped: bool,
}

impl<E> Default for QueueState<E> {
    fn default() -> Self {
        QueueState {
            waiting: VecDeque::new(),
            delayed: Vec::new(),
            active: HashMap::new(),
            stalls: HashMap::new(),
            dead: VecDeque::new(),
            completed: 0,
            stopped: false,
        }
    }
}

impl<E> QueueState<E> {
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        // keep due order stable so retries come back in the order they failed
        self.delayed.sort_by_key(|(due, _)| *due);
        while self.delayed.first().is_some_and(|(due, _)| *due <= now) {
            let (_, job) = self.delayed.remove(0);
            self.waiting.push_back(job);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }
}

struct Inner<E> {
    queues: HashMap<String, QueueState<E>>,
    closed: bool,
}

pub struct MemoryQueue<E> {
    options: MemoryQueueOptions,
    inner: Mutex<Inner<E>>,
    notify: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl<E: Clone> MemoryQueue<E> {
    pub fn new(options: MemoryQueueOptions) -> MemoryQueue<E> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MemoryQueue {
            options,
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
            events,
        }
    }

    pub fn counts(&self, queue: &str) -> QueueCounts {
        let inner = self.inner.lock();
        match inner.queues.get(queue) {
            None => QueueCounts::default(),
            Some(state) => QueueCounts {
                waiting: state.waiting.len(),
                delayed: state.delayed.len(),
                active: state.active.len(),
                completed: state.completed,
                dead: state.dead.len(),
            },
        }
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<DeadLetter<E>> {
        let inner = self.inner.lock();
        inner
            .queues
            .get(queue)
            .map(|state| state.dead.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Publishes a progress update for an active job
    pub fn update_progress(&self, queue: &str, job_id: &str, progress: u8) {
        let is_active = {
            let inner = self.inner.lock();
            inner
                .queues
                .get(queue)
                .is_some_and(|state| state.active.contains_key(job_id))
        };
        if is_active {
            self.emit(
                queue,
                QueueEventKind::Progress {
                    job_id: job_id.to_owned(),
                    progress: progress.min(100),
                },
            );
        }
    }

    /// Redelivers or fails active jobs that were not acknowledged within the stalled interval
    pub fn check_stalled(&self) {
        let now = Instant::now();
        let mut emitted = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (name, state) in inner.queues.iter_mut() {
                let stalled: Vec<JobId> = state
                    .active
                    .iter()
                    .filter(|(_, active)| now.duration_since(active.since) >= self.options.stalled_interval)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in stalled {
                    let Some(active) = state.active.remove(&id) else {
                        continue;
                    };
                    let stalls = state.stalls.entry(id.clone()).or_insert(0);
                    *stalls += 1;
                    if *stalls > self.options.max_stalled_count {
                        state.stalls.remove(&id);
                        let (_, failed) = self.fail_locked(state, active.job, STALLED_REASON, now);
                        emitted.push(QueueEvent::new(name, failed));
                    } else {
                        state.waiting.push_front(active.job);
                        emitted.push(QueueEvent::new(name, QueueEventKind::Stalled { job_id: id }));
                    }
                }
            }
        }
        if !emitted.is_empty() {
            self.notify.notify_waiters();
        }
        for event in emitted {
            let _ = self.events.send(event);
        }
    }

    fn emit(&self, queue: &str, kind: QueueEventKind) {
        // no subscribers is fine
        let _ = self.events.send(QueueEvent::new(queue, kind));
    }

    fn fail_locked(
        &self,
        state: &mut QueueState<E>,
        mut job: Job<E>,
        reason: &str,
        now: Instant,
    ) -> (FailOutcome, QueueEventKind) {
        job.meta.attempts_made += 1;
        let attempts_made = job.meta.attempts_made;
        let job_id = job.meta.id.clone();
        let outcome = self.options.retry.next(attempts_made);
        match outcome {
            FailOutcome::Retrying { delay, .. } => state.delayed.push((now + delay, job)),
            FailOutcome::DeadLettered => {
                state.dead.push_back(DeadLetter {
                    job,
                    reason: reason.to_owned(),
                });
                while state.dead.len() > self.options.dead_letter_retention {
                    state.dead.pop_front();
                }
            }
        }
        let kind = QueueEventKind::Failed {
            job_id,
            attempts_made,
            reason: reason.to_owned(),
            dead_lettered: outcome == FailOutcome::DeadLettered,
        };
        (outcome, kind)
    }
}

impl<E: Clone + Send + Sync + 'static> MemoryQueue<E> {
    /// Runs [MemoryQueue::check_stalled] every stalled interval until cancelled
    pub fn spawn_stall_watchdog(self: &Arc<Self>, ct: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.options.stalled_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ct.cancelled() => break,
                    _ = ticker.tick() => queue.check_stalled(),
                }
            }
        })
    }
}

#[async_trait]
impl<E: Clone + Send + Sync> Connection for MemoryQueue<E> {
    async fn close(&self) -> Result<(), QueueError> {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl<E: Clone + Send + Sync> QueueConnection<E> for MemoryQueue<E> {
    async fn enqueue(&self, queue: &str, data: E) -> Result<JobId, QueueError> {
        let id = Uuid::new_v4().to_string();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            let state = inner.queues.entry(queue.to_owned()).or_default();
            state.waiting.push_back(Job::new(id.clone(), data));
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(&self, queue: &str) -> Result<Option<Job<E>>, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Ok(None);
                }
                let state = inner.queues.entry(queue.to_owned()).or_default();
                if state.stopped {
                    return Ok(None);
                }
                let now = Instant::now();
                state.promote_due(now);
                if let Some(job) = state.waiting.pop_front() {
                    state.active.insert(
                        job.meta.id.clone(),
                        Active {
                            job: job.clone(),
                            since: now,
                        },
                    );
                    return Ok(Some(job));
                }
                state.next_due()
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, queue: &str, job: &JobMeta) -> Result<(), QueueError> {
        let completed = {
            let mut inner = self.inner.lock();
            match inner.queues.get_mut(queue) {
                Some(state) => {
                    if state.active.remove(&job.id).is_some() {
                        state.stalls.remove(&job.id);
                        state.completed += 1;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if completed {
            self.emit(
                queue,
                QueueEventKind::Completed {
                    job_id: job.id.clone(),
                },
            );
        } else {
            tracing::debug!(queue, job_id = %job.id, "ignoring ack for a job that is no longer active");
        }
        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        job: Job<E>,
        reason: &str,
    ) -> Result<FailOutcome, QueueError> {
        let (outcome, kind) = {
            let mut inner = self.inner.lock();
            let state = inner.queues.entry(queue.to_owned()).or_default();
            state.active.remove(&job.meta.id);
            state.stalls.remove(&job.meta.id);
            self.fail_locked(state, job, reason, Instant::now())
        };
        // a waiting receiver may need to pick up the new retry deadline
        self.notify.notify_waiters();
        self.emit(queue, kind);
        Ok(outcome)
    }

    async fn stop(&self, queue: &str) -> Result<(), QueueError> {
        self.inner
            .lock()
            .queues
            .entry(queue.to_owned())
            .or_default()
            .stopped = true;
        self.notify.notify_waiters();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "Events";

    fn queue(options: MemoryQueueOptions) -> Arc<MemoryQueue<String>> {
        Arc::new(MemoryQueue::new(options))
    }

    #[tokio::test]
    async fn delivers_in_enqueue_order() -> Result<(), QueueError> {
        let queue = queue(MemoryQueueOptions::default());
        for item in ["a", "b", "c"] {
            queue.enqueue(QUEUE, item.to_owned()).await?;
        }
        let mut received = Vec::new();
        for _ in 0..3 {
            let job = queue.receive(QUEUE).await?.expect("job");
            received.push(job.data);
        }
        assert_eq!(received, vec!["a", "b", "c"]);
        assert_eq!(queue.counts(QUEUE).active, 3);
        Ok(())
    }

    #[tokio::test]
    async fn ack_completes_active_job() -> Result<(), QueueError> {
        let queue = queue(MemoryQueueOptions::default());
        let mut events = queue.subscribe();
        queue.enqueue(QUEUE, "a".to_owned()).await?;
        let job = queue.receive(QUEUE).await?.expect("job");
        queue.ack(QUEUE, &job.meta).await?;

        let counts = queue.counts(QUEUE);
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 1);
        let event = events.recv().await.expect("event");
        assert_eq!(
            event.kind,
            QueueEventKind::Completed {
                job_id: job.meta.id.clone()
            }
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_is_redelivered_after_backoff() -> Result<(), QueueError> {
        let queue = queue(MemoryQueueOptions::default());
        queue.enqueue(QUEUE, "a".to_owned()).await?;
        let job = queue.receive(QUEUE).await?.expect("job");

        let failed_at = Instant::now();
        let outcome = queue.fail(QUEUE, job, "sink down").await?;
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(queue.counts(QUEUE).delayed, 1);

        let retried = queue.receive(QUEUE).await?.expect("retried job");
        assert_eq!(retried.meta.attempts_made, 1);
        assert!(failed_at.elapsed() >= Duration::from_secs(1));
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_job_is_dead_lettered() -> Result<(), QueueError> {
        let options = MemoryQueueOptions {
            retry: RetryPolicy::fixed(1, Duration::ZERO),
            ..MemoryQueueOptions::default()
        };
        let queue = queue(options);
        queue.enqueue(QUEUE, "a".to_owned()).await?;
        let job = queue.receive(QUEUE).await?.expect("job");
        let outcome = queue.fail(QUEUE, job, "bad row").await?;

        assert_eq!(outcome, FailOutcome::DeadLettered);
        let dead = queue.dead_letters(QUEUE);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "bad row");
        assert_eq!(dead[0].job.data, "a");
        Ok(())
    }

    #[tokio::test]
    async fn dead_letters_keep_only_the_most_recent() -> Result<(), QueueError> {
        let options = MemoryQueueOptions {
            retry: RetryPolicy::fixed(1, Duration::ZERO),
            dead_letter_retention: 2,
            ..MemoryQueueOptions::default()
        };
        let queue = queue(options);
        for item in ["a", "b", "c"] {
            queue.enqueue(QUEUE, item.to_owned()).await?;
            let job = queue.receive(QUEUE).await?.expect("job");
            queue.fail(QUEUE, job, "bad row").await?;
        }

        let dead: Vec<String> = queue
            .dead_letters(QUEUE)
            .into_iter()
            .map(|letter| letter.job.data)
            .collect();
        assert_eq!(dead, vec!["b", "c"]);
        assert_eq!(queue.counts(QUEUE).dead, 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_job_is_redelivered_once_then_failed() -> Result<(), QueueError> {
        let options = MemoryQueueOptions {
            stalled_interval: Duration::from_secs(30),
            ..MemoryQueueOptions::default()
        };
        let queue = queue(options);
        let mut events = queue.subscribe();
        queue.enqueue(QUEUE, "a".to_owned()).await?;
        let job = queue.receive(QUEUE).await?.expect("job");

        tokio::time::advance(Duration::from_secs(31)).await;
        queue.check_stalled();
        assert_eq!(
            events.recv().await.expect("event").kind,
            QueueEventKind::Stalled {
                job_id: job.meta.id.clone()
            }
        );
        let again = queue.receive(QUEUE).await?.expect("redelivered");
        assert_eq!(again.meta.id, job.meta.id);

        tokio::time::advance(Duration::from_secs(31)).await;
        queue.check_stalled();
        match events.recv().await.expect("event").kind {
            QueueEventKind::Failed { reason, .. } => assert_eq!(reason, STALLED_REASON),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(queue.counts(QUEUE).delayed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn stop_releases_pending_receivers() -> Result<(), QueueError> {
        let queue = queue(MemoryQueueOptions::default());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(QUEUE).await })
        };
        tokio::task::yield_now().await;
        queue.stop(QUEUE).await?;
        let received = receiver.await.expect("receiver task")?;
        assert!(received.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn closed_queue_rejects_enqueue() -> Result<(), QueueError> {
        let queue = queue(MemoryQueueOptions::default());
        queue.close().await?;
        assert!(matches!(
            queue.enqueue(QUEUE, "a".to_owned()).await,
            Err(QueueError::Closed)
        ));
        assert!(queue.receive(QUEUE).await?.is_none());
        Ok(())
    }
}
