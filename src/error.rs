//! Error types shared by the queue, sink and worker layers.
use thiserror::Error;

/// Errors raised by a queue connection
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection is closed")]
    Closed,

    #[error("no consumer registered for queue {0}")]
    UnknownQueue(String),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors raised while writing a batch into ClickHouse
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("clickhouse rejected insert into {table} ({status}): {body}")]
    Rejected {
        table: String,
        status: u16,
        body: String,
    },

    #[error("clickhouse error: {0}")]
    Native(#[from] clickhouse_rs::errors::Error),

    #[error("unsupported value in column {column}: {reason}")]
    UnsupportedValue { column: String, reason: &'static str },

    #[error("row is not a JSON object")]
    NotAnObject,

    #[error("row encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("write into {0} failed")]
    Injected(String),
}

/// Errors raised by worker supervisors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid configuration for queue {queue}: {reason}")]
    InvalidConfig { queue: String, reason: &'static str },
}
