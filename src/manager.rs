use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SystemProfile {
    pub logical_cores: usize,
    pub worker_threads: usize,
    /// Concurrent oracle executions
    pub execution_slots: usize,
    pub max_blocking_threads: usize,
}

impl SystemProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        // CASE 1: Single core. Keep one async worker for CRUD and a single
        // execution slot so an oracle can never take every thread.
        if cores <= 1 {
            tracing::warn!(cores, "CPU constraint detected, running with a single execution slot");

            Self {
                logical_cores: cores,
                worker_threads: 2,
                execution_slots: 1,
                max_blocking_threads: 8,
            }
        }
        // CASE 2: Desktop / laptop
        else if cores < 6 {
            Self {
                logical_cores: cores,
                worker_threads: cores,
                execution_slots: cores,
                max_blocking_threads: cores + 8,
            }
        }
        // CASE 3: Server. Leave headroom for the CRUD workers.
        else {
            Self {
                logical_cores: cores,
                worker_threads: cores,
                execution_slots: cores - 2,
                max_blocking_threads: cores + 16,
            }
        }
    }
}

/// Advances the wasmtime epoch on a fixed period.
///
/// Every isolate checks its wall-clock deadline and cancel flag on each
/// tick, which is what lets a non-cooperative oracle be stopped. The thread
/// stops when the ticker is dropped.
pub struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    pub fn start(engine: wasmtime::Engine, tick: Duration) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("oracle-epoch".into())
            .spawn(move || {
                tracing::debug!(?tick, "epoch ticker started");
                while !flag.load(Ordering::Acquire) {
                    thread::sleep(tick);
                    engine.increment_epoch();
                }
            })?;

        Ok(Self { stop, handle: Some(handle) })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_never_starves_crud() {
        let profile = SystemProfile::detect();
        assert!(profile.execution_slots >= 1);
        assert!(profile.worker_threads >= 1);
        assert!(profile.max_blocking_threads > profile.execution_slots);
    }

    #[test]
    fn ticker_stops_on_drop() {
        let engine = wasmtime::Engine::default();
        let ticker = EpochTicker::start(engine, Duration::from_millis(1)).unwrap();
        thread::sleep(Duration::from_millis(10));
        drop(ticker);
    }
}
