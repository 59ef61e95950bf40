//! ## hopper
//! Batching ingestion of analytics events from durable queues into ClickHouse.
//!
//! ## Installation
//! Just use cargo.
//!
//! ## Configuration
//! Example config:
//! ```toml
//! [queue]
//! kind = "kafka"                          # or "memory" for local runs
//! brokers = "localhost:9092"
//! attempts = 3                            # deliveries per job before dead-lettering
//! backoff = "exponential"
//! backoff_delay_ms = 1000
//!
//! [sink]
//! kind = "http"                           # JSONEachRow over HTTP, or "native"
//! url = "http://localhost:8123"
//! request_timeout_ms = 30000             # a slower insert counts as failed
//!
//! [server]
//! listen = "0.0.0.0:4000"                 # GET /health
//!
//! [workers.events]
//! batch_size = 2000
//! flush_interval_ms = 5000
//! concurrency = 2
//! table = "analytics.events"
//! ```
//! Every setting may be overridden from the environment, e.g.
//! `HOPPER__WORKERS__ERRORS__BATCH_SIZE=100`.
//!
//! ## Batching
//! Each event type has its own queue and its own [worker]. Jobs are buffered
//! until `batch_size` of them are waiting, or until no new job arrived for
//! `flush_interval_ms`, whichever comes first. Within a queue a batch keeps
//! delivery order. A batch is written with a single insert; its jobs are
//! acknowledged only after the insert succeeded, and are handed back to the
//! queue for a retry otherwise.
//! Jobs exhausting their attempts are dead-lettered.
//!
//! ## Shutdown
//! On SIGTERM or SIGINT every worker stops taking jobs and flushes what it
//! buffered, then the queue connection is closed. A second signal, or a drain
//! running past `shutdown.timeout_seconds`, exits with status 1.
//!
//! [worker]: worker::Worker

pub mod error;
pub mod events;
pub mod fatal;
pub mod health;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod settings;
pub mod sink;
pub mod worker;
