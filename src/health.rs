//! Health endpoint
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    pub name: String,
    pub state: WorkerStatus,
}

impl WorkerHealth {
    pub fn new(name: &str, running: bool) -> WorkerHealth {
        WorkerHealth {
            name: name.to_owned(),
            state: if running {
                WorkerStatus::Running
            } else {
                WorkerStatus::Stopped
            },
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkerStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: String,
    pub workers: Vec<WorkerHealth>,
}

impl HealthReport {
    pub fn new(version: &str, workers: Vec<WorkerHealth>) -> HealthReport {
        HealthReport {
            status: "ok",
            version: version.to_owned(),
            workers,
        }
    }
}

async fn health_handler(State(orchestrator): State<Arc<Orchestrator>>) -> Json<HealthReport> {
    Json(orchestrator.health())
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(orchestrator)
}

/// Serves the health endpoint until `ct` is cancelled
pub async fn serve(
    listener: TcpListener,
    orchestrator: Arc<Orchestrator>,
    ct: CancellationToken,
) -> std::io::Result<()> {
    let address: Option<SocketAddr> = listener.local_addr().ok();
    info!(?address, "Health endpoint listening");
    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(async move {
            ct.cancelled().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_serializes_worker_states() {
        let report = HealthReport::new(
            "0.2.1",
            vec![
                WorkerHealth::new("Events", true),
                WorkerHealth::new("Errors", false),
            ],
        );
        assert_eq!(
            serde_json::to_value(&report).expect("json"),
            serde_json::json!({
                "status": "ok",
                "version": "0.2.1",
                "workers": [
                    {"name": "Events", "state": "running"},
                    {"name": "Errors", "state": "stopped"},
                ],
            })
        );
    }
}
