//! Fatal faults turned into a graceful shutdown
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Records the first fatal fault and cancels the shutdown token.
/// The orchestrator treats the cancelled token like a termination signal.
#[derive(Clone)]
pub struct FatalHandler {
    inner: Arc<FatalInner>,
}

struct FatalInner {
    triggered: AtomicBool,
    shutdown: CancellationToken,
    reason: Mutex<Option<String>>,
}

impl FatalHandler {
    pub fn new(shutdown: CancellationToken) -> FatalHandler {
        FatalHandler {
            inner: Arc::new(FatalInner {
                triggered: AtomicBool::new(false),
                shutdown,
                reason: Mutex::new(None),
            }),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Returns false if a fault was already recorded
    pub fn trigger(&self, context: &str, error: &anyhow::Error) -> bool {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::error!(context, error = %format!("{error:#}"), "fatal error; initiating shutdown");
        self.capture(format!("{context}: {error:#}"))
    }

    /// Chains a hook onto the panic handler that logs the panic location and triggers shutdown
    pub fn install_panic_hook(&self) {
        let handler = self.clone();
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_else(|| "unknown".to_owned());
            let message = info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            if !handler.inner.triggered.swap(true, Ordering::SeqCst) {
                tracing::error!(%location, panic = %message, "panic; initiating shutdown");
                handler.capture(format!("panic at {location}: {message}"));
            }
            previous(info);
        }));
    }

    fn capture(&self, reason: String) -> bool {
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.shutdown.cancel();
        true
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }
}
