//! Kafka-backed queue connection.
//!
//! Every queue maps to a topic of the same name. Job metadata travels in
//! message headers, offsets are committed only up to the oldest job that
//! is still in flight. Retries are produced back onto the topic once their
//! backoff elapsed, exhausted jobs go to `<topic><dead_letter_suffix>`.
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Message, Offset, TopicPartitionList};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::offsets::OffsetTracker;
use super::{
    Connection, Delivery, FailOutcome, Job, JobId, JobMeta, QueueConnection, QueueEvent,
    QueueEventKind, RetryPolicy, EVENT_CHANNEL_CAPACITY,
};
use crate::error::QueueError;

const JOB_ID_HEADER: &str = "job-id";
const ATTEMPTS_HEADER: &str = "attempts-made";
const ENQUEUED_AT_HEADER: &str = "enqueued-at";
const FAILED_REASON_HEADER: &str = "failed-reason";

const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);
/// produce attempts for a retry before it is dead-lettered instead
const REQUEUE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct KafkaQueueOptions {
    /// bootstrap brokers, comma separated
    pub brokers: String,
    pub group_id: String,
    pub retry: RetryPolicy,
    pub dead_letter_suffix: String,
    pub produce_timeout: Duration,
}

struct QueueConsumer {
    consumer: StreamConsumer,
    offsets: Mutex<OffsetTracker>,
    stop: CancellationToken,
    ready: AtomicBool,
}

pub struct KafkaQueue<E> {
    options: KafkaQueueOptions,
    producer: FutureProducer,
    consumers: HashMap<String, Arc<QueueConsumer>>,
    events: broadcast::Sender<QueueEvent>,
    retries: TaskTracker,
    closing: CancellationToken,
    _payload: PhantomData<fn() -> E>,
}

/// Owned copy of the fields we need from a consumed message
struct Received {
    partition: i32,
    offset: i64,
    payload: Option<Vec<u8>>,
    id: Option<JobId>,
    attempts_made: Option<u32>,
    enqueued_at: Option<DateTime<Utc>>,
    timestamp: Option<DateTime<Utc>>,
}

impl Received {
    fn read(message: &BorrowedMessage<'_>) -> Received {
        let mut received = Received {
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec),
            id: None,
            attempts_made: None,
            enqueued_at: None,
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
        };
        if let Some(headers) = message.headers() {
            for header in headers.iter() {
                let Some(value) = header.value.and_then(|v| std::str::from_utf8(v).ok()) else {
                    continue;
                };
                match header.key {
                    JOB_ID_HEADER => received.id = Some(value.to_owned()),
                    ATTEMPTS_HEADER => received.attempts_made = value.parse().ok(),
                    ENQUEUED_AT_HEADER => {
                        received.enqueued_at = DateTime::parse_from_rfc3339(value)
                            .ok()
                            .map(|t| t.with_timezone(&Utc))
                    }
                    _ => {}
                }
            }
        }
        received
    }

    fn delivery(&self) -> Delivery {
        Delivery {
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Message about to be produced
#[derive(Clone)]
struct Outgoing {
    id: JobId,
    attempts_made: u32,
    enqueued_at: DateTime<Utc>,
    payload: Vec<u8>,
    reason: Option<String>,
}

async fn produce(
    producer: &FutureProducer,
    topic: &str,
    job: &Outgoing,
    timeout: Duration,
) -> Result<(), QueueError> {
    let attempts = job.attempts_made.to_string();
    let enqueued_at = job.enqueued_at.to_rfc3339();
    let mut headers = OwnedHeaders::new()
        .insert(Header {
            key: JOB_ID_HEADER,
            value: Some(job.id.as_str()),
        })
        .insert(Header {
            key: ATTEMPTS_HEADER,
            value: Some(attempts.as_str()),
        })
        .insert(Header {
            key: ENQUEUED_AT_HEADER,
            value: Some(enqueued_at.as_str()),
        });
    if let Some(reason) = &job.reason {
        headers = headers.insert(Header {
            key: FAILED_REASON_HEADER,
            value: Some(reason.as_str()),
        });
    }
    let record = FutureRecord::to(topic)
        .key(job.id.as_str())
        .payload(job.payload.as_slice())
        .headers(headers);
    producer
        .send(record, timeout)
        .await
        .map(|_| ())
        .map_err(|(error, _)| QueueError::Kafka(error))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Requeue,
    DeadLetter,
}

/// Where a failed job ended up after its retry was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parked {
    Requeued,
    DeadLettered,
    /// nothing was produced before the queue closed, the offset stays uncommitted
    Abandoned,
}

/// Produces a retry back onto its topic. After [REQUEUE_ATTEMPTS] failed
/// produces the job goes to the dead-letter topic, which is retried until it
/// succeeds or `closing` is cancelled. Waits `backoff` between attempts.
async fn park_retry<F, Fut>(backoff: Duration, closing: &CancellationToken, mut send: F) -> Parked
where
    F: FnMut(Target) -> Fut,
    Fut: Future<Output = Result<(), QueueError>>,
{
    let mut attempt = 0;
    loop {
        let target = if attempt < REQUEUE_ATTEMPTS {
            Target::Requeue
        } else {
            Target::DeadLetter
        };
        attempt += 1;
        match send(target).await {
            Ok(()) if target == Target::Requeue => return Parked::Requeued,
            Ok(()) => return Parked::DeadLettered,
            Err(error) => {
                tracing::warn!(?target, attempt, error = %error, "failed to produce job retry");
            }
        }
        if target == Target::DeadLetter && closing.is_cancelled() {
            return Parked::Abandoned;
        }
        tokio::select! {
            _ = sleep(backoff) => {}
            _ = closing.cancelled(), if target == Target::DeadLetter => return Parked::Abandoned,
        }
    }
}

/// Marks an offset done and commits the partition if its position advanced
fn complete(topic: &str, consumer: &QueueConsumer, delivery: Delivery) -> Result<(), QueueError> {
    let Some(position) = consumer
        .offsets
        .lock()
        .complete(delivery.partition, delivery.offset)
    else {
        return Ok(());
    };
    let mut positions = HashMap::new();
    positions.insert(
        (topic.to_owned(), delivery.partition),
        Offset::Offset(position),
    );
    let tpl = TopicPartitionList::from_topic_map(&positions)?;
    consumer.consumer.commit(&tpl, CommitMode::Async)?;
    Ok(())
}

impl<E> KafkaQueue<E> {
    /// Creates the producer and one subscribed consumer per queue
    pub fn connect(options: KafkaQueueOptions, queues: &[String]) -> Result<KafkaQueue<E>, QueueError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &options.brokers)
            .set("message.timeout.ms", "30000")
            .create()?;

        let mut consumers = HashMap::new();
        for queue in queues {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &options.brokers)
                .set("group.id", &options.group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", "earliest")
                .create()?;
            consumer.subscribe(&[queue.as_str()])?;
            consumers.insert(
                queue.clone(),
                Arc::new(QueueConsumer {
                    consumer,
                    offsets: Mutex::new(OffsetTracker::default()),
                    stop: CancellationToken::new(),
                    ready: AtomicBool::new(false),
                }),
            );
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(KafkaQueue {
            options,
            producer,
            consumers,
            events,
            retries: TaskTracker::new(),
            closing: CancellationToken::new(),
            _payload: PhantomData,
        })
    }

    fn consumer(&self, queue: &str) -> Result<Arc<QueueConsumer>, QueueError> {
        self.consumers
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_owned()))
    }

    fn dead_letter_topic(&self, queue: &str) -> String {
        format!("{}{}", queue, self.options.dead_letter_suffix)
    }

    fn emit(&self, queue: &str, kind: QueueEventKind) {
        let _ = self.events.send(QueueEvent::new(queue, kind));
    }

    /// Parks a message that cannot be decoded into a job
    async fn dead_letter_raw(
        &self,
        queue: &str,
        consumer: &QueueConsumer,
        received: Received,
        reason: String,
    ) {
        let delivery = received.delivery();
        let outgoing = Outgoing {
            id: received
                .id
                .unwrap_or_else(|| format!("{}:{}:{}", queue, delivery.partition, delivery.offset)),
            attempts_made: received.attempts_made.unwrap_or(0),
            enqueued_at: received.enqueued_at.unwrap_or_else(Utc::now),
            payload: received.payload.unwrap_or_default(),
            reason: Some(reason.clone()),
        };
        let topic = self.dead_letter_topic(queue);
        if let Err(error) = produce(&self.producer, &topic, &outgoing, self.options.produce_timeout).await {
            // offset stays pending, the message comes back after a restart
            tracing::error!(queue, job_id = %outgoing.id, error = %error, "failed to dead-letter undecodable message");
            self.emit(queue, QueueEventKind::Error { message: error.to_string() });
            return;
        }
        if let Err(error) = complete(queue, consumer, delivery) {
            tracing::warn!(queue, error = %error, "failed to commit offsets");
        }
        self.emit(
            queue,
            QueueEventKind::Failed {
                job_id: outgoing.id,
                attempts_made: outgoing.attempts_made,
                reason,
                dead_lettered: true,
            },
        );
    }
}

fn decode_job<E: DeserializeOwned>(queue: &str, received: &Received) -> Result<Job<E>, QueueError> {
    let payload = received.payload.as_deref().unwrap_or_default();
    let data = serde_json::from_slice(payload)?;
    let delivery = received.delivery();
    Ok(Job {
        meta: JobMeta {
            id: received
                .id
                .clone()
                .unwrap_or_else(|| format!("{}:{}:{}", queue, delivery.partition, delivery.offset)),
            attempts_made: received.attempts_made.unwrap_or(0),
            enqueued_at: received
                .enqueued_at
                .or(received.timestamp)
                .unwrap_or_else(Utc::now),
            delivery: Some(delivery),
        },
        data,
    })
}

#[async_trait]
impl<E: Send + Sync + 'static> Connection for KafkaQueue<E> {
    async fn close(&self) -> Result<(), QueueError> {
        for consumer in self.consumers.values() {
            consumer.stop.cancel();
        }

        // scheduled retries must reach the topic before their offsets can be committed
        self.closing.cancel();
        self.retries.close();
        self.retries.wait().await;

        for (topic, consumer) in &self.consumers {
            let positions: HashMap<(String, i32), Offset> = consumer
                .offsets
                .lock()
                .positions()
                .into_iter()
                .map(|(partition, position)| ((topic.clone(), partition), Offset::Offset(position)))
                .collect();
            if !positions.is_empty() {
                let tpl = TopicPartitionList::from_topic_map(&positions)?;
                if let Err(error) = consumer.consumer.commit(&tpl, CommitMode::Sync) {
                    tracing::warn!(queue = %topic, error = %error, "final offset commit failed");
                }
            }
            consumer.consumer.unsubscribe();
        }

        self.producer.flush(self.options.produce_timeout)?;
        Ok(())
    }
}

#[async_trait]
impl<E> QueueConnection<E> for KafkaQueue<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn enqueue(&self, queue: &str, data: E) -> Result<JobId, QueueError> {
        let outgoing = Outgoing {
            id: Uuid::new_v4().to_string(),
            attempts_made: 0,
            enqueued_at: Utc::now(),
            payload: serde_json::to_vec(&data)?,
            reason: None,
        };
        produce(&self.producer, queue, &outgoing, self.options.produce_timeout).await?;
        Ok(outgoing.id)
    }

    async fn receive(&self, queue: &str) -> Result<Option<Job<E>>, QueueError> {
        let consumer = self.consumer(queue)?;
        loop {
            let received = tokio::select! {
                _ = consumer.stop.cancelled() => return Ok(None),
                message = consumer.consumer.recv() => message.map(|m| Received::read(&m)),
            };
            let received = match received {
                Ok(received) => {
                    if !consumer.ready.swap(true, Ordering::SeqCst) {
                        self.emit(queue, QueueEventKind::Ready);
                    }
                    received
                }
                Err(error) => {
                    // librdkafka reconnects on its own
                    tracing::warn!(queue, error = %error, "error receiving message");
                    self.emit(queue, QueueEventKind::Error { message: error.to_string() });
                    sleep(RECEIVE_BACKOFF).await;
                    continue;
                }
            };

            consumer
                .offsets
                .lock()
                .begin(received.partition, received.offset);
            match decode_job(queue, &received) {
                Ok(job) => return Ok(Some(job)),
                Err(error) => {
                    let reason = format!("undecodable payload: {error}");
                    self.dead_letter_raw(queue, &consumer, received, reason).await;
                }
            }
        }
    }

    async fn ack(&self, queue: &str, job: &JobMeta) -> Result<(), QueueError> {
        let consumer = self.consumer(queue)?;
        if let Some(delivery) = job.delivery {
            complete(queue, &consumer, delivery)?;
        }
        self.emit(queue, QueueEventKind::Completed { job_id: job.id.clone() });
        Ok(())
    }

    async fn fail(&self, queue: &str, job: Job<E>, reason: &str) -> Result<FailOutcome, QueueError> {
        let consumer = self.consumer(queue)?;
        let attempts_made = job.meta.attempts_made + 1;
        let outcome = self.options.retry.next(attempts_made);
        let delivery = job.meta.delivery;
        let outgoing = Outgoing {
            id: job.meta.id.clone(),
            attempts_made,
            enqueued_at: job.meta.enqueued_at,
            payload: serde_json::to_vec(&job.data)?,
            reason: None,
        };

        match outcome {
            FailOutcome::Retrying { delay, .. } => {
                let producer = self.producer.clone();
                let events = self.events.clone();
                let topic = queue.to_owned();
                let dead_letter_topic = self.dead_letter_topic(queue);
                let timeout = self.options.produce_timeout;
                let backoff = self.options.retry.backoff.delay;
                let closing = self.closing.clone();
                let dead_letter = Outgoing {
                    reason: Some(reason.to_owned()),
                    ..outgoing.clone()
                };
                self.retries.spawn(async move {
                    sleep(delay).await;
                    let parked = park_retry(backoff, &closing, |target| {
                        let producer = producer.clone();
                        let (topic, record) = match target {
                            Target::Requeue => (topic.clone(), outgoing.clone()),
                            Target::DeadLetter => (dead_letter_topic.clone(), dead_letter.clone()),
                        };
                        async move { produce(&producer, &topic, &record, timeout).await }
                    })
                    .await;
                    match parked {
                        Parked::Requeued => {}
                        Parked::DeadLettered => {
                            tracing::error!(queue = %topic, job_id = %outgoing.id, "retry could not be requeued, job dead-lettered");
                            let _ = events.send(QueueEvent::new(
                                &topic,
                                QueueEventKind::Failed {
                                    job_id: outgoing.id.clone(),
                                    attempts_made: outgoing.attempts_made,
                                    reason: "retry could not be requeued".to_owned(),
                                    dead_lettered: true,
                                },
                            ));
                        }
                        Parked::Abandoned => {
                            tracing::error!(queue = %topic, job_id = %outgoing.id, "retry abandoned on close, job is redelivered after restart");
                            let _ = events.send(QueueEvent::new(
                                &topic,
                                QueueEventKind::Error {
                                    message: format!("retry of job {} abandoned on close", outgoing.id),
                                },
                            ));
                            return;
                        }
                    }
                    if let Some(delivery) = delivery {
                        if let Err(error) = complete(&topic, &consumer, delivery) {
                            tracing::warn!(queue = %topic, error = %error, "failed to commit offsets");
                        }
                    }
                });
            }
            FailOutcome::DeadLettered => {
                let outgoing = Outgoing {
                    reason: Some(reason.to_owned()),
                    ..outgoing
                };
                let topic = self.dead_letter_topic(queue);
                produce(&self.producer, &topic, &outgoing, self.options.produce_timeout).await?;
                if let Some(delivery) = delivery {
                    complete(queue, &consumer, delivery)?;
                }
            }
        }

        self.emit(
            queue,
            QueueEventKind::Failed {
                job_id: job.meta.id,
                attempts_made,
                reason: reason.to_owned(),
                dead_lettered: outcome == FailOutcome::DeadLettered,
            },
        );
        Ok(outcome)
    }

    async fn stop(&self, queue: &str) -> Result<(), QueueError> {
        self.consumer(queue)?.stop.cancel();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}
