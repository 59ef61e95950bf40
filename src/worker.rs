//! Batch worker supervising one queue.
//!
//! A [Worker] runs `concurrency` slots pulling jobs from its queue and a single
//! batcher task owning the [BatchAccumulator]. Slots hand jobs over through a
//! bounded channel, the batcher flushes when the buffer reaches `batch_size`
//! or once no job arrived for `flush_interval`. Slots take turns on a shared
//! gate spanning receive and hand-off, so the batcher sees jobs in delivery order.
//! [Worker::close] drains everything already handed over into one final flush.
pub mod accumulator;
pub mod flush;
pub mod lifecycle;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

use crate::error::WorkerError;
use crate::queue::{Job, QueueConnection, QueueEvent, EVENT_CHANNEL_CAPACITY};

pub use accumulator::BatchAccumulator;
pub use flush::{FlushExecutor, FlushResult};
pub use lifecycle::{spawn_event_logger, WorkerEvent, WorkerState};

pub(crate) const SHUTDOWN_REASON: &str = "worker is shutting down";
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Writes a batch of payloads somewhere. A returned error fails every job of the batch.
#[async_trait]
pub trait Processor<E>: Send + Sync {
    async fn process(&self, batch: &[E]) -> anyhow::Result<()>;
}

/// configuration of a single queue worker
pub struct WorkerConfig<E> {
    pub queue_name: String,
    /// buffered jobs that trigger an immediate flush
    pub batch_size: usize,
    /// quiet period after the last buffered job before a flush
    pub flush_interval: Duration,
    /// number of slots pulling from the queue
    pub concurrency: usize,
    pub processor: Arc<dyn Processor<E>>,
}

impl<E> WorkerConfig<E> {
    pub fn validate(&self) -> Result<(), WorkerError> {
        let invalid = |reason| WorkerError::InvalidConfig {
            queue: self.queue_name.clone(),
            reason,
        };
        if self.queue_name.is_empty() {
            return Err(invalid("queue name is empty"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch size must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1"));
        }
        if self.flush_interval.is_zero() {
            return Err(invalid("flush interval must be positive"));
        }
        Ok(())
    }
}

/// Lifecycle surface the orchestrator needs from a worker, whatever its payload type
#[async_trait]
pub trait Supervised: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> WorkerState;
    fn start(&self);
    async fn close(&self);
}

struct RunningTasks {
    slots: TaskTracker,
    batcher: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    forwarder_stop: CancellationToken,
}

pub struct Worker<E> {
    name: String,
    batch_size: usize,
    flush_interval: Duration,
    concurrency: usize,
    processor: Arc<dyn Processor<E>>,
    queue: Arc<dyn QueueConnection<E>>,
    state: watch::Sender<WorkerState>,
    events: broadcast::Sender<WorkerEvent>,
    stop: CancellationToken,
    tasks: Mutex<Option<RunningTasks>>,
}

impl<E: Send + Sync + 'static> Worker<E> {
    pub fn new(
        config: WorkerConfig<E>,
        queue: Arc<dyn QueueConnection<E>>,
    ) -> Result<Worker<E>, WorkerError> {
        config.validate()?;
        let (state, _) = watch::channel(WorkerState::Starting);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Worker {
            name: config.queue_name,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            concurrency: config.concurrency,
            processor: config.processor,
            queue,
            state,
            events,
            stop: CancellationToken::new(),
            tasks: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Spawns the batcher, the slots and the queue event forwarder.
    /// Only the first call on a fresh worker does anything.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if self.state() != WorkerState::Starting {
            return;
        }

        let forwarder_stop = CancellationToken::new();
        let forwarder = tokio::spawn(forward_queue_events(
            self.name.clone(),
            self.queue.subscribe(),
            self.events.clone(),
            forwarder_stop.clone(),
        ));

        let executor = FlushExecutor::new(
            self.name.clone(),
            Arc::clone(&self.processor),
            Arc::clone(&self.queue),
            self.events.clone(),
        );
        let (handoff, jobs) = mpsc::channel(self.concurrency);
        let batcher = tokio::spawn(run_batcher(
            jobs,
            self.batch_size,
            self.flush_interval,
            executor.clone(),
        ));

        let slots = TaskTracker::new();
        let gate = Arc::new(AsyncMutex::new(()));
        for _ in 0..self.concurrency {
            slots.spawn(run_slot(
                self.name.clone(),
                Arc::clone(&self.queue),
                Arc::clone(&gate),
                handoff.clone(),
                executor.clone(),
                self.stop.clone(),
            ));
        }
        slots.close();

        *tasks = Some(RunningTasks {
            slots,
            batcher,
            forwarder,
            forwarder_stop,
        });
        self.emit(WorkerEvent::Ready);
        self.set_state(WorkerState::Running);
    }

    /// Stops taking jobs, flushes everything buffered and stops consumption of the queue.
    /// Resolves once the worker is closed, also when another close is already draining it.
    pub async fn close(&self) {
        let running = {
            let mut tasks = self.tasks.lock();
            let running = tasks.take();
            if running.is_none() && self.state() == WorkerState::Starting {
                self.set_state(WorkerState::Closed);
                self.emit(WorkerEvent::Closed);
                return;
            }
            running
        };
        let Some(running) = running else {
            let mut state = self.state.subscribe();
            let _ = state.wait_for(|s| *s == WorkerState::Closed).await;
            return;
        };

        self.set_state(WorkerState::Draining);
        self.stop.cancel();
        running.slots.wait().await;
        // the slots held the last senders, the batcher now drains and runs the final flush
        if let Err(e) = running.batcher.await {
            self.emit(WorkerEvent::Error {
                message: format!("batcher task failed: {e}"),
            });
        }
        if let Err(e) = self.queue.stop(&self.name).await {
            self.emit(WorkerEvent::Error {
                message: format!("stopping queue consumption: {e}"),
            });
        }
        running.forwarder_stop.cancel();
        let _ = running.forwarder.await;

        self.set_state(WorkerState::Closed);
        self.emit(WorkerEvent::Closed);
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
        self.emit(WorkerEvent::StateChanged(state));
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl<E: Send + Sync + 'static> Supervised for Worker<E> {
    fn name(&self) -> &str {
        Worker::name(self)
    }

    fn state(&self) -> WorkerState {
        Worker::state(self)
    }

    fn start(&self) {
        Worker::start(self)
    }

    async fn close(&self) {
        Worker::close(self).await
    }
}

async fn run_batcher<E: Send + Sync + 'static>(
    mut jobs: mpsc::Receiver<Job<E>>,
    batch_size: usize,
    flush_interval: Duration,
    executor: FlushExecutor<E>,
) {
    let mut buffer = BatchAccumulator::new(batch_size);
    // pushed back by every append below the threshold
    let mut deadline: Option<Instant> = None;
    loop {
        let timer = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            received = jobs.recv() => match received {
                Some(job) => {
                    if buffer.append(job) >= batch_size {
                        deadline = None;
                        executor.flush(&mut buffer).await;
                    } else {
                        deadline = Some(Instant::now() + flush_interval);
                    }
                }
                None => break,
            },
            _ = timer => {
                deadline = None;
                executor.flush(&mut buffer).await;
            }
        }
    }
    executor.flush(&mut buffer).await;
}

async fn run_slot<E: Send + Sync + 'static>(
    queue_name: String,
    queue: Arc<dyn QueueConnection<E>>,
    gate: Arc<AsyncMutex<()>>,
    handoff: mpsc::Sender<Job<E>>,
    executor: FlushExecutor<E>,
    stop: CancellationToken,
) {
    loop {
        // held until the job sits in the channel, another slot cannot overtake it
        let turn = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            turn = gate.lock() => turn,
        };
        let received = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            received = queue.receive(&queue_name) => received,
        };
        match received {
            Ok(Some(job)) => {
                let handed = hand_off(job, &handoff, &executor, &stop).await;
                drop(turn);
                if !handed {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                drop(turn);
                executor.emit(WorkerEvent::Error {
                    message: format!("receiving from queue: {e}"),
                });
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = sleep(RECEIVE_BACKOFF) => {}
                }
            }
        }
    }
}

/// Passes a delivered job to the batcher, or rejects it once shutdown has begun.
/// Returns false when the slot should stop.
async fn hand_off<E: Send + Sync + 'static>(
    job: Job<E>,
    handoff: &mpsc::Sender<Job<E>>,
    executor: &FlushExecutor<E>,
    stop: &CancellationToken,
) -> bool {
    if stop.is_cancelled() {
        reject(job, executor).await;
        return false;
    }
    match handoff.send(job).await {
        Ok(()) => true,
        Err(mpsc::error::SendError(job)) => {
            reject(job, executor).await;
            false
        }
    }
}

async fn reject<E: Send + Sync + 'static>(job: Job<E>, executor: &FlushExecutor<E>) {
    executor.emit(WorkerEvent::JobRejected {
        job_id: job.meta.id.clone(),
    });
    executor.fail(job, SHUTDOWN_REASON).await;
}

async fn forward_queue_events(
    queue_name: String,
    mut queue_events: broadcast::Receiver<QueueEvent>,
    events: broadcast::Sender<WorkerEvent>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            received = queue_events.recv() => match received {
                Ok(event) if event.queue == queue_name => {
                    let _ = events.send(WorkerEvent::from(event.kind));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(queue = %queue_name, skipped, "queue events dropped")
                }
                Err(RecvError::Closed) => break,
            },
            _ = stop.cancelled() => break,
        }
    }
}
