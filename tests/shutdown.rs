use std::sync::Arc;
use std::time::Duration;

use hopper::health::{self, HealthReport, WorkerStatus};
use hopper::orchestrator::{Orchestrator, ShutdownOutcome, DEFAULT_SHUTDOWN_TIMEOUT};
use hopper::queue::memory::{MemoryQueue, MemoryQueueOptions};
use hopper::queue::QueueConnection;
use hopper::sink::{MemorySink, TableProcessor};
use hopper::worker::{Supervised, Worker, WorkerConfig};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

struct Service {
    queue: Arc<MemoryQueue<u32>>,
    sink: Arc<MemorySink<u32>>,
    orchestrator: Arc<Orchestrator>,
}

fn service(queues: &[&str], batch_size: usize, timeout: Duration) -> Service {
    let queue = Arc::new(MemoryQueue::new(MemoryQueueOptions::default()));
    let sink = Arc::new(MemorySink::new());
    let workers: Vec<Arc<dyn Supervised>> = queues
        .iter()
        .map(|name| {
            let worker = Worker::<u32>::new(
                WorkerConfig {
                    queue_name: (*name).to_owned(),
                    batch_size,
                    flush_interval: Duration::from_secs(5),
                    concurrency: 2,
                    processor: Arc::new(TableProcessor::<u32>::new(
                        sink.clone(),
                        &format!("analytics.{}", name.to_lowercase()),
                        name,
                    )),
                },
                queue.clone(),
            )
            .expect("valid worker config");
            Arc::new(worker) as Arc<dyn Supervised>
        })
        .collect();
    let orchestrator = Arc::new(Orchestrator::new(workers, queue.clone(), timeout));
    Service {
        queue,
        sink,
        orchestrator,
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_forces_one_flush_of_buffered_jobs() {
    let service = service(&["Events"], 500, DEFAULT_SHUTDOWN_TIMEOUT);
    service.orchestrator.start();
    for item in [1, 2] {
        service.queue.enqueue("Events", item).await.expect("enqueue");
    }
    sleep(Duration::from_millis(10)).await;
    assert_eq!(service.sink.calls(), 0);

    let outcome = service.orchestrator.shutdown("SIGTERM").await;
    assert_eq!(outcome, ShutdownOutcome::Completed);
    assert_eq!(outcome.exit_code(), 0);

    let writes = service.sink.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].rows, vec![1, 2]);

    let health = service.orchestrator.health();
    assert_eq!(health.status, "ok");
    assert_eq!(health.workers.len(), 1);
    assert_eq!(health.workers[0].name, "Events");
    assert_eq!(health.workers[0].state, WorkerStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn queues_drain_independently() {
    let service = service(&["Events", "Errors"], 500, DEFAULT_SHUTDOWN_TIMEOUT);
    service.orchestrator.start();
    service.queue.enqueue("Events", 1).await.expect("enqueue");
    service.queue.enqueue("Errors", 2).await.expect("enqueue");
    sleep(Duration::from_millis(10)).await;

    assert_eq!(
        service.orchestrator.shutdown("SIGINT").await,
        ShutdownOutcome::Completed
    );
    let mut tables: Vec<String> = service.sink.writes().into_iter().map(|w| w.table).collect();
    tables.sort();
    assert_eq!(tables, vec!["analytics.errors", "analytics.events"]);
}

#[tokio::test(start_paused = true)]
async fn slow_final_flush_times_out() {
    let service = service(&["Events"], 500, Duration::from_secs(5));
    service.sink.set_delay(Duration::from_secs(60));
    service.orchestrator.start();
    service.queue.enqueue("Events", 1).await.expect("enqueue");
    sleep(Duration::from_millis(10)).await;

    let outcome = service.orchestrator.shutdown("SIGTERM").await;
    assert_eq!(outcome, ShutdownOutcome::TimedOut);
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn second_signal_during_drain_forces_exit() {
    let service = service(&["Events"], 500, DEFAULT_SHUTDOWN_TIMEOUT);
    service.sink.set_delay(Duration::from_secs(3));
    service.orchestrator.start();
    service.queue.enqueue("Events", 1).await.expect("enqueue");
    sleep(Duration::from_millis(10)).await;

    let first = {
        let orchestrator = Arc::clone(&service.orchestrator);
        tokio::spawn(async move { orchestrator.shutdown("SIGTERM").await })
    };
    tokio::task::yield_now().await;
    assert_eq!(
        service.orchestrator.shutdown("SIGTERM").await,
        ShutdownOutcome::DoubleSignal
    );
    // the first drain is not restarted and still completes
    assert_eq!(first.await.expect("first shutdown"), ShutdownOutcome::Completed);
    assert_eq!(service.sink.calls(), 1);
}

#[tokio::test]
async fn health_endpoint_reports_worker_states() {
    let service = service(&["Events", "Errors"], 10, DEFAULT_SHUTDOWN_TIMEOUT);
    service.orchestrator.start();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("http://{}/health", listener.local_addr().expect("addr"));
    let ct = CancellationToken::new();
    let server = tokio::spawn(health::serve(
        listener,
        Arc::clone(&service.orchestrator),
        ct.clone(),
    ));

    let body: serde_json::Value = reqwest::get(&url)
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["workers"][0]["name"], "Events");
    assert_eq!(body["workers"][0]["state"], "running");

    service.orchestrator.shutdown("SIGTERM").await;
    let report: HealthReport = service.orchestrator.health();
    assert!(report.workers.iter().all(|w| w.state == WorkerStatus::Stopped));
    let body: serde_json::Value = reqwest::get(&url)
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["workers"][1]["state"], "stopped");

    ct.cancel();
    server.await.expect("server task").expect("serve");
}
