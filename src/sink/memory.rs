//! Recording sink for tests and dry runs
use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

use super::Sink;
use crate::error::SinkError;

/// One successful write
#[derive(Debug, Clone)]
pub struct Write<E> {
    pub table: String,
    pub rows: Vec<E>,
    /// when the write started
    pub at: Instant,
}

struct State<E> {
    writes: Vec<Write<E>>,
    calls: usize,
    call_times: Vec<Instant>,
    failing_calls: HashSet<usize>,
    delay: Duration,
}

/// Keeps every written batch in memory, and can be told to fail chosen calls
pub struct MemorySink<E> {
    state: Mutex<State<E>>,
}

impl<E> Default for MemorySink<E> {
    fn default() -> Self {
        MemorySink {
            state: Mutex::new(State {
                writes: Vec::new(),
                calls: 0,
                call_times: Vec::new(),
                failing_calls: HashSet::new(),
                delay: Duration::ZERO,
            }),
        }
    }
}

impl<E: Clone> MemorySink<E> {
    pub fn new() -> MemorySink<E> {
        MemorySink::default()
    }

    /// Makes the given calls fail, counting from 1
    pub fn fail_on_calls(&self, calls: &[usize]) {
        self.state.lock().failing_calls.extend(calls.iter().copied());
    }

    /// Makes every write take `delay` before it completes
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    pub fn writes(&self) -> Vec<Write<E>> {
        self.state.lock().writes.clone()
    }

    /// Rows of every successful write, in write order
    pub fn rows(&self) -> Vec<E> {
        self.state
            .lock()
            .writes
            .iter()
            .flat_map(|w| w.rows.iter().cloned())
            .collect()
    }

    /// Number of write calls, failed ones included
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    /// Start time of every write call
    pub fn call_times(&self) -> Vec<Instant> {
        self.state.lock().call_times.clone()
    }
}

#[async_trait]
impl<E: Clone + Send + Sync> Sink<E> for MemorySink<E> {
    async fn write(&self, table: &str, rows: &[E]) -> Result<(), SinkError> {
        let at = Instant::now();
        let (call, delay) = {
            let mut state = self.state.lock();
            state.calls += 1;
            state.call_times.push(at);
            (state.calls, state.delay)
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.failing_calls.contains(&call) {
            return Err(SinkError::Injected(table.to_owned()));
        }
        state.writes.push(Write {
            table: table.to_owned(),
            rows: rows.to_vec(),
            at,
        });
        Ok(())
    }
}
