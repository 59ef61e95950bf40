use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use hopper::error::SinkError;
use hopper::events::{Event, EventKind};
use hopper::fatal::FatalHandler;
use hopper::health;
use hopper::logging::init_logging;
use hopper::orchestrator::{Orchestrator, ShutdownOutcome};
use hopper::queue::kafka::{KafkaQueue, KafkaQueueOptions};
use hopper::queue::memory::{MemoryQueue, MemoryQueueOptions};
use hopper::queue::{Connection, QueueConnection};
use hopper::settings::{QueueKind, QueueSettings, Settings, SinkKind, SinkSettings, WorkerSettings};
use hopper::sink::{HttpSink, NativeSink, Sink, TableProcessor};
use hopper::worker::{spawn_event_logger, Supervised, Worker, WorkerConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const PRODUCE_TIMEOUT: Duration = Duration::from_secs(10);

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let settings = match Settings::new(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("cannot load config {}: {e}", args.config);
            process::exit(1);
        }
    };
    init_logging(&settings.log);

    let code = match run(settings).await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            error!(error = %format!("{e:#}"), "hopper failed");
            1
        }
    };
    process::exit(code);
}

async fn run(settings: Settings) -> anyhow::Result<ShutdownOutcome> {
    let fatal = FatalHandler::new(CancellationToken::new());
    fatal.install_panic_hook();
    let background = CancellationToken::new();

    let enabled: Vec<(EventKind, WorkerSettings)> = settings
        .workers
        .iter()
        .filter(|(_, worker)| worker.enabled)
        .map(|(kind, worker)| (*kind, worker.clone()))
        .collect();
    let queue_names: Vec<String> = enabled
        .iter()
        .map(|(kind, _)| kind.queue_name().to_owned())
        .collect();

    let sink = build_sink(&settings.sink).context("creating clickhouse sink")?;
    let (queue, connection) = connect_queue(&settings.queue, &queue_names, &background)?;

    let mut workers: Vec<Arc<dyn Supervised>> = Vec::with_capacity(enabled.len());
    for (kind, cfg) in enabled {
        let worker = Worker::<Event>::new(
            WorkerConfig {
                queue_name: kind.queue_name().to_owned(),
                batch_size: cfg.batch_size,
                flush_interval: cfg.flush_interval,
                concurrency: cfg.concurrency,
                processor: Arc::new(TableProcessor::new(
                    Arc::clone(&sink),
                    &cfg.table,
                    kind.label(),
                )),
            },
            Arc::clone(&queue),
        )?;
        spawn_event_logger(worker.name().to_owned(), worker.subscribe());
        workers.push(Arc::new(worker));
    }

    let orchestrator = Arc::new(Orchestrator::new(
        workers,
        connection,
        settings.shutdown.timeout(),
    ));
    orchestrator.start();

    let listener = TcpListener::bind(settings.server.listen)
        .await
        .with_context(|| format!("binding health endpoint on {}", settings.server.listen))?;
    let server = {
        let fatal = fatal.clone();
        let orchestrator = Arc::clone(&orchestrator);
        let ct = background.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(listener, orchestrator, ct).await {
                fatal.trigger("health endpoint", &e.into());
            }
        })
    };

    let outcome = orchestrator.run(fatal.token()).await?;
    background.cancel();
    let _ = server.await;
    if let Some(reason) = fatal.reason() {
        error!(reason = %reason, "stopped after fatal error");
    }
    info!(?outcome, exit_code = outcome.exit_code(), "hopper stopped");
    Ok(outcome)
}

fn build_sink(settings: &SinkSettings) -> Result<Arc<dyn Sink<Event>>, SinkError> {
    let sink: Arc<dyn Sink<Event>> = match settings.kind {
        SinkKind::Http => Arc::new(HttpSink::new(
            &settings.url,
            settings.database.clone(),
            settings.user.clone(),
            settings.password.clone(),
            settings.request_timeout(),
        )?),
        SinkKind::Native => Arc::new(NativeSink::new(&settings.url)),
    };
    Ok(sink)
}

fn connect_queue(
    settings: &QueueSettings,
    queue_names: &[String],
    background: &CancellationToken,
) -> anyhow::Result<(Arc<dyn QueueConnection<Event>>, Arc<dyn Connection>)> {
    match settings.kind {
        QueueKind::Kafka => {
            let brokers = settings
                .brokers
                .clone()
                .ok_or_else(|| anyhow!("queue.brokers is required for kafka"))?;
            let options = KafkaQueueOptions {
                brokers,
                group_id: settings.group_id.clone(),
                retry: settings.retry_policy(),
                dead_letter_suffix: settings.dead_letter_suffix.clone(),
                produce_timeout: PRODUCE_TIMEOUT,
            };
            let queue = Arc::new(
                KafkaQueue::<Event>::connect(options, queue_names)
                    .context("connecting to kafka")?,
            );
            info!(queues = ?queue_names, "Connected to kafka");
            let jobs: Arc<dyn QueueConnection<Event>> = queue.clone();
            let connection: Arc<dyn Connection> = queue;
            Ok((jobs, connection))
        }
        QueueKind::Memory => {
            let queue = Arc::new(MemoryQueue::<Event>::new(MemoryQueueOptions {
                retry: settings.retry_policy(),
                stalled_interval: settings.stalled_interval(),
                ..MemoryQueueOptions::default()
            }));
            queue.spawn_stall_watchdog(background.clone());
            info!(queues = ?queue_names, "Using in-memory queue");
            let jobs: Arc<dyn QueueConnection<Event>> = queue.clone();
            let connection: Arc<dyn Connection> = queue;
            Ok((jobs, connection))
        }
    }
}
