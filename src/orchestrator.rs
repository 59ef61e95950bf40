//! Owns the workers of the process and shuts them down on signals
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::health::{HealthReport, WorkerHealth};
use crate::queue::Connection;
use crate::worker::{Supervised, WorkerState};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How a shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// every worker drained and the connection closed
    Completed,
    /// workers or the connection did not close within the timeout
    TimedOut,
    /// closing the queue connection failed
    Failed,
    /// shutdown was requested while one was already running
    DoubleSignal,
}

impl ShutdownOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownOutcome::Completed => 0,
            ShutdownOutcome::TimedOut | ShutdownOutcome::Failed | ShutdownOutcome::DoubleSignal => 1,
        }
    }
}

pub struct Orchestrator {
    workers: Vec<Arc<dyn Supervised>>,
    connection: Arc<dyn Connection>,
    timeout: Duration,
    version: String,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        workers: Vec<Arc<dyn Supervised>>,
        connection: Arc<dyn Connection>,
        timeout: Duration,
    ) -> Orchestrator {
        Orchestrator {
            workers,
            connection,
            timeout,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        for worker in &self.workers {
            worker.start();
        }
        info!(workers = self.workers.len(), "Workers started");
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::new(
            &self.version,
            self.workers
                .iter()
                .map(|w| WorkerHealth::new(w.name(), w.state() == WorkerState::Running))
                .collect(),
        )
    }

    /// Drains every worker, then closes the queue connection, both under one deadline.
    /// Only the first call drains, any later call reports a double signal.
    pub async fn shutdown(&self, signal: &str) -> ShutdownOutcome {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            error!(signal, "Shutdown already in progress, forcing exit");
            return ShutdownOutcome::DoubleSignal;
        }
        info!(signal, timeout_seconds = self.timeout.as_secs(), "Shutting down workers");
        let deadline = Instant::now() + self.timeout;

        let mut drains = JoinSet::new();
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            drains.spawn(async move {
                worker.close().await;
                worker.name().to_owned()
            });
        }
        let drained = timeout_at(deadline, async {
            while let Some(joined) = drains.join_next().await {
                match joined {
                    Ok(name) => info!(worker = %name, "Worker drained"),
                    Err(e) => error!(error = %e, "Worker close task failed"),
                }
            }
        })
        .await;
        if drained.is_err() {
            error!(
                pending = drains.len(),
                "Shutdown timed out before all workers drained"
            );
            return ShutdownOutcome::TimedOut;
        }

        match timeout_at(deadline, self.connection.close()).await {
            Err(_) => {
                error!("Shutdown timed out closing the queue connection");
                ShutdownOutcome::TimedOut
            }
            Ok(Ok(())) => {
                info!("Queue connection closed, shutdown complete");
                ShutdownOutcome::Completed
            }
            Ok(Err(e)) => {
                error!(error = %e, "Closing queue connection failed");
                ShutdownOutcome::Failed
            }
        }
    }

    /// Waits for SIGTERM, SIGINT or the fatal token and shuts down.
    /// A second signal during the drain ends it with [ShutdownOutcome::DoubleSignal].
    pub async fn run(&self, fatal: CancellationToken) -> anyhow::Result<ShutdownOutcome> {
        let mut signals = Signals::new()?;
        let first = tokio::select! {
            name = signals.recv() => name,
            _ = fatal.cancelled() => "fatal error",
        };

        let drain = self.shutdown(first);
        tokio::pin!(drain);
        let outcome = tokio::select! {
            outcome = &mut drain => outcome,
            second = signals.recv() => {
                warn!(signal = second, "Received second signal during shutdown");
                self.shutdown(second).await
            }
        };
        Ok(outcome)
    }
}

struct Signals {
    term: Signal,
    interrupt: Signal,
}

impl Signals {
    fn new() -> std::io::Result<Signals> {
        Ok(Signals {
            term: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::error::QueueError;

    struct Stub {
        name: String,
        state: Mutex<WorkerState>,
        drain: Duration,
    }

    impl Stub {
        fn new(name: &str, drain: Duration) -> Arc<Stub> {
            Arc::new(Stub {
                name: name.to_owned(),
                state: Mutex::new(WorkerState::Starting),
                drain,
            })
        }
    }

    #[async_trait]
    impl Supervised for Stub {
        fn name(&self) -> &str {
            &self.name
        }

        fn state(&self) -> WorkerState {
            *self.state.lock()
        }

        fn start(&self) {
            *self.state.lock() = WorkerState::Running;
        }

        async fn close(&self) {
            *self.state.lock() = WorkerState::Draining;
            tokio::time::sleep(self.drain).await;
            *self.state.lock() = WorkerState::Closed;
        }
    }

    struct Conn {
        fail: bool,
        delay: Duration,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Connection for Conn {
        async fn close(&self) -> Result<(), QueueError> {
            tokio::time::sleep(self.delay).await;
            self.closed.store(true, Ordering::SeqCst);
            if self.fail {
                return Err(QueueError::Closed);
            }
            Ok(())
        }
    }

    fn conn(fail: bool) -> Arc<Conn> {
        Arc::new(Conn {
            fail,
            delay: Duration::ZERO,
            closed: AtomicBool::new(false),
        })
    }

    fn orchestrator(workers: &[Arc<Stub>], conn: Arc<Conn>, timeout: Duration) -> Orchestrator {
        let workers = workers
            .iter()
            .map(|w| Arc::clone(w) as Arc<dyn Supervised>)
            .collect();
        Orchestrator::new(workers, conn, timeout)
    }

    #[tokio::test(start_paused = true)]
    async fn drains_workers_then_closes_connection() {
        let workers = [
            Stub::new("Events", Duration::from_secs(2)),
            Stub::new("Errors", Duration::from_secs(3)),
        ];
        let conn = conn(false);
        let orchestrator = orchestrator(&workers, conn.clone(), DEFAULT_SHUTDOWN_TIMEOUT);
        orchestrator.start();
        assert!(orchestrator.health().workers.iter().all(|w| w.is_running()));

        let started = tokio::time::Instant::now();
        let outcome = orchestrator.shutdown("SIGTERM").await;
        assert_eq!(outcome, ShutdownOutcome::Completed);
        assert_eq!(outcome.exit_code(), 0);
        // drains run concurrently
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(conn.closed.load(Ordering::SeqCst));
        assert!(orchestrator.health().workers.iter().all(|w| !w.is_running()));
    }

    #[tokio::test(start_paused = true)]
    async fn second_shutdown_is_double_signal() {
        let workers = [Stub::new("Events", Duration::from_secs(5))];
        let orchestrator = Arc::new(orchestrator(&workers, conn(false), DEFAULT_SHUTDOWN_TIMEOUT));
        orchestrator.start();

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.shutdown("SIGTERM").await })
        };
        tokio::task::yield_now().await;
        let second = orchestrator.shutdown("SIGINT").await;
        assert_eq!(second, ShutdownOutcome::DoubleSignal);
        assert_eq!(second.exit_code(), 1);
        assert_eq!(first.await.expect("first shutdown"), ShutdownOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_drain_times_out() {
        let workers = [Stub::new("Events", Duration::from_secs(60))];
        let conn = conn(false);
        let orchestrator = orchestrator(&workers, conn.clone(), Duration::from_secs(30));
        orchestrator.start();
        assert_eq!(orchestrator.shutdown("SIGTERM").await, ShutdownOutcome::TimedOut);
        assert!(!conn.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connection_close_shares_the_deadline() {
        let workers = [Stub::new("Events", Duration::from_secs(20))];
        let conn = Arc::new(Conn {
            fail: false,
            delay: Duration::from_secs(120),
            closed: AtomicBool::new(false),
        });
        let orchestrator = orchestrator(&workers, conn.clone(), Duration::from_secs(30));
        orchestrator.start();

        let started = tokio::time::Instant::now();
        assert_eq!(orchestrator.shutdown("SIGTERM").await, ShutdownOutcome::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));
        assert!(!conn.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn connection_failure_fails_shutdown() {
        let orchestrator = orchestrator(&[], conn(true), DEFAULT_SHUTDOWN_TIMEOUT);
        assert_eq!(orchestrator.shutdown("SIGTERM").await, ShutdownOutcome::Failed);
    }

    #[tokio::test]
    async fn fatal_token_triggers_shutdown() -> anyhow::Result<()> {
        let workers = [Stub::new("Events", Duration::ZERO)];
        let orchestrator = orchestrator(&workers, conn(false), DEFAULT_SHUTDOWN_TIMEOUT);
        orchestrator.start();
        let fatal = CancellationToken::new();
        fatal.cancel();
        assert_eq!(orchestrator.run(fatal).await?, ShutdownOutcome::Completed);
        Ok(())
    }
}
