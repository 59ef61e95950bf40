use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use super::accumulator::BatchAccumulator;
use super::lifecycle::WorkerEvent;
use super::Processor;
use crate::queue::{FailOutcome, Job, QueueConnection};

/// Outcome of one non-empty flush
#[derive(Debug, Clone, PartialEq)]
pub enum FlushResult {
    Completed {
        count: usize,
        duration: Duration,
        throughput: u64,
    },
    Failed {
        count: usize,
        duration: Duration,
        error: String,
    },
}

/// Items per second, a zero duration counts as one millisecond
pub fn throughput(count: usize, duration: Duration) -> u64 {
    let millis = duration.as_millis().max(1) as f64;
    (count as f64 / (millis / 1000.0)).round() as u64
}

/// Hands accumulated batches to the processor and settles their jobs with the queue
pub struct FlushExecutor<E> {
    queue_name: String,
    processor: Arc<dyn Processor<E>>,
    queue: Arc<dyn QueueConnection<E>>,
    events: broadcast::Sender<WorkerEvent>,
}

impl<E> Clone for FlushExecutor<E> {
    fn clone(&self) -> Self {
        FlushExecutor {
            queue_name: self.queue_name.clone(),
            processor: Arc::clone(&self.processor),
            queue: Arc::clone(&self.queue),
            events: self.events.clone(),
        }
    }
}

impl<E: Send + Sync + 'static> FlushExecutor<E> {
    pub fn new(
        queue_name: String,
        processor: Arc<dyn Processor<E>>,
        queue: Arc<dyn QueueConnection<E>>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> FlushExecutor<E> {
        FlushExecutor {
            queue_name,
            processor,
            queue,
            events,
        }
    }

    /// Flushes whatever is buffered. An empty buffer is left alone and yields `None`.
    pub async fn flush(&self, buffer: &mut BatchAccumulator<Job<E>>) -> Option<FlushResult> {
        if buffer.is_empty() {
            return None;
        }
        let jobs = buffer.drain();
        let count = jobs.len();
        self.emit(WorkerEvent::FlushStarted { count });

        let started = Instant::now();
        let (metas, payloads): (Vec<_>, Vec<_>) =
            jobs.into_iter().map(|job| (job.meta, job.data)).unzip();
        let processed = self.processor.process(&payloads).await;
        let duration = started.elapsed();

        match processed {
            Ok(()) => {
                let throughput = throughput(count, duration);
                self.emit(WorkerEvent::FlushCompleted {
                    count,
                    duration,
                    throughput,
                });
                for meta in &metas {
                    if let Err(e) = self.queue.ack(&self.queue_name, meta).await {
                        self.emit(WorkerEvent::Error {
                            message: format!("acknowledging job {}: {e}", meta.id),
                        });
                    }
                }
                Some(FlushResult::Completed {
                    count,
                    duration,
                    throughput,
                })
            }
            Err(e) => {
                let error = format!("{e:#}");
                self.emit(WorkerEvent::FlushFailed {
                    count,
                    duration,
                    error: error.clone(),
                });
                // every job that fed the batch goes back through the retry policy
                for (meta, data) in metas.into_iter().zip(payloads) {
                    self.fail(Job { meta, data }, &error).await;
                }
                Some(FlushResult::Failed {
                    count,
                    duration,
                    error,
                })
            }
        }
    }

    /// Reports a single job as failed to the queue
    pub async fn fail(&self, job: Job<E>, reason: &str) -> Option<FailOutcome> {
        let job_id = job.meta.id.clone();
        match self.queue.fail(&self.queue_name, job, reason).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.emit(WorkerEvent::Error {
                    message: format!("failing job {job_id}: {e}"),
                });
                None
            }
        }
    }

    pub(crate) fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::queue::memory::{MemoryQueue, MemoryQueueOptions};

    const QUEUE: &str = "Events";

    #[derive(Default)]
    struct Recording {
        batches: Mutex<Vec<Vec<u32>>>,
        fail: bool,
    }

    #[async_trait]
    impl Processor<u32> for Recording {
        async fn process(&self, batch: &[u32]) -> anyhow::Result<()> {
            self.batches.lock().push(batch.to_vec());
            if self.fail {
                return Err(anyhow!("clickhouse unavailable"));
            }
            Ok(())
        }
    }

    async fn delivered(queue: &MemoryQueue<u32>, items: &[u32]) -> BatchAccumulator<Job<u32>> {
        let mut buffer = BatchAccumulator::new(items.len());
        for item in items {
            queue.enqueue(QUEUE, *item).await.expect("enqueue");
            let job = queue.receive(QUEUE).await.expect("receive").expect("job");
            buffer.append(job);
        }
        buffer
    }

    fn executor(
        processor: Arc<Recording>,
        queue: Arc<MemoryQueue<u32>>,
    ) -> (FlushExecutor<u32>, broadcast::Receiver<WorkerEvent>) {
        let (events, rx) = broadcast::channel(16);
        (
            FlushExecutor::new(QUEUE.to_owned(), processor, queue, events),
            rx,
        )
    }

    #[test]
    fn throughput_rounds_and_guards_zero_duration() {
        assert_eq!(throughput(3, Duration::from_millis(2000)), 2);
        assert_eq!(throughput(5, Duration::ZERO), 5000);
        assert_eq!(throughput(1, Duration::from_millis(3)), 333);
    }

    #[tokio::test]
    async fn empty_flush_does_not_call_processor() {
        let processor = Arc::new(Recording::default());
        let queue = Arc::new(MemoryQueue::new(MemoryQueueOptions::default()));
        let (executor, mut events) = executor(processor.clone(), queue);

        let mut buffer = BatchAccumulator::new(4);
        assert_eq!(executor.flush(&mut buffer).await, None);
        assert!(processor.batches.lock().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn successful_flush_acks_every_job() {
        let processor = Arc::new(Recording::default());
        let queue = Arc::new(MemoryQueue::new(MemoryQueueOptions::default()));
        let (executor, mut events) = executor(processor.clone(), queue.clone());

        let mut buffer = delivered(&queue, &[1, 2, 3]).await;
        let result = executor.flush(&mut buffer).await;

        assert!(matches!(result, Some(FlushResult::Completed { count: 3, .. })));
        assert!(buffer.is_empty());
        assert_eq!(*processor.batches.lock(), vec![vec![1, 2, 3]]);
        let counts = queue.counts(QUEUE);
        assert_eq!(counts.completed, 3);
        assert_eq!(counts.active, 0);
        assert_eq!(
            events.recv().await.expect("event"),
            WorkerEvent::FlushStarted { count: 3 }
        );
        assert!(matches!(
            events.recv().await.expect("event"),
            WorkerEvent::FlushCompleted { count: 3, .. }
        ));
    }

    #[tokio::test]
    async fn failed_flush_fails_every_job() {
        let processor = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let queue = Arc::new(MemoryQueue::new(MemoryQueueOptions::default()));
        let (executor, mut events) = executor(processor, queue.clone());

        let mut buffer = delivered(&queue, &[1, 2]).await;
        match executor.flush(&mut buffer).await {
            Some(FlushResult::Failed { count, error, .. }) => {
                assert_eq!(count, 2);
                assert_eq!(error, "clickhouse unavailable");
            }
            other => panic!("unexpected flush result {other:?}"),
        }
        let counts = queue.counts(QUEUE);
        assert_eq!(counts.delayed, 2);
        assert_eq!(counts.completed, 0);
        let _started = events.recv().await.expect("event");
        assert!(matches!(
            events.recv().await.expect("event"),
            WorkerEvent::FlushFailed { count: 2, .. }
        ));
    }
}
