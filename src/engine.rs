//! Execution engine: slots, cancellation and result encoding around the
//! sandbox.
//!
//! Per-call lifecycle: Pending (waiting for a slot) -> Running (on the
//! blocking pool) -> Succeeded | Failed. There are no retries here.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::codec::PayloadCodec;
use crate::config::DEFAULT_MAX_FRAME_BYTES;
use crate::error::{Error, ExecutionError, Result};
use crate::manager::EpochTicker;
use crate::model::{CallResult, Oracle, OracleId};
use crate::protocol::payload_budget;
use crate::sandbox::{result_too_large, CompiledOracle, Sandbox, SandboxLimits};
use crate::storage::RecordSource;

pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_EPOCH_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub limits: SandboxLimits,
    pub max_concurrent: usize,
    /// How long a call may wait for a free slot
    pub queue_timeout: Duration,
    pub epoch_tick: Duration,
    /// Ceiling on the encoded payload, so a result always fits a response frame
    pub max_payload_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: SandboxLimits::default(),
            max_concurrent: 4,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            epoch_tick: DEFAULT_EPOCH_TICK,
            max_payload_bytes: payload_budget(DEFAULT_MAX_FRAME_BYTES),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed(ExecutionError),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running => write!(f, "running"),
            RunState::Succeeded => write!(f, "succeeded"),
            RunState::Failed(e) => write!(f, "failed ({})", e),
        }
    }
}

#[derive(Debug, Default)]
struct EngineStats {
    started: AtomicU64,
    running: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub started: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

impl EngineStats {
    fn begin(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    fn end(&self, state: &RunState) {
        self.running.fetch_sub(1, Ordering::AcqRel);
        let counter = match state {
            RunState::Succeeded => &self.succeeded,
            RunState::Failed(ExecutionError::Timeout(_)) => &self.timed_out,
            RunState::Failed(ExecutionError::Cancelled) => &self.cancelled,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Acquire),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Flags the isolate for termination if the caller stops waiting.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct ExecutionEngine {
    sandbox: Arc<Sandbox>,
    programs: Arc<DashMap<OracleId, Arc<CompiledOracle>>>,
    records: Arc<dyn RecordSource>,
    codec: PayloadCodec,
    max_payload: usize,
    slots: Arc<Semaphore>,
    queue_timeout: Duration,
    stats: Arc<EngineStats>,
    ticker: Arc<EpochTicker>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, codec: PayloadCodec, records: Arc<dyn RecordSource>) -> Result<Self> {
        if config.max_concurrent == 0 {
            return Err(Error::Validation("at least one execution slot is required".into()));
        }
        let sandbox = Arc::new(Sandbox::new(config.limits)?);
        let ticker = EpochTicker::start(sandbox.engine().clone(), config.epoch_tick)?;

        Ok(Self {
            sandbox,
            programs: Arc::new(DashMap::new()),
            records,
            codec,
            max_payload: config.max_payload_bytes,
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            queue_timeout: config.queue_timeout,
            stats: Arc::new(EngineStats::default()),
            ticker: Arc::new(ticker),
        })
    }

    /// Validates and compiles oracle code without registering anything.
    pub fn compile(&self, name: &str, code: &str) -> Result<CompiledOracle> {
        self.sandbox.compile(name, code)
    }

    pub fn install(&self, id: OracleId, program: CompiledOracle) {
        self.programs.insert(id, Arc::new(program));
    }

    /// Runs `oracle` with `args` and returns its codec-wrapped JSON result.
    ///
    /// Dropping the returned future cancels the execution at the next epoch
    /// tick and releases its slot.
    pub async fn run(&self, oracle: &Oracle, args: Vec<String>) -> Result<CallResult> {
        // a cache miss is compiled on the blocking pool, not here
        let program = match self.programs.get(&oracle.id) {
            Some(p) => Ok(Arc::clone(p.value())),
            None => Err((oracle.name.clone(), oracle.code.clone())),
        };

        tracing::debug!(oracle = oracle.id, state = %RunState::Pending, "run queued");
        let permit = match tokio::time::timeout(self.queue_timeout, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::ResourceExhausted("execution engine is closed".into())),
            Err(_) => {
                return Err(Error::ResourceExhausted(format!(
                    "no execution slot became free within {:?}",
                    self.queue_timeout
                )))
            }
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(Arc::clone(&cancel));

        let sandbox = Arc::clone(&self.sandbox);
        let programs = Arc::clone(&self.programs);
        let records = Arc::clone(&self.records);
        let stats = Arc::clone(&self.stats);
        // keeps the epoch advancing until this isolate has exited
        let ticker = Arc::clone(&self.ticker);
        let codec = self.codec;
        let max_payload = self.max_payload;
        let oracle_id = oracle.id;

        let task = tokio::task::spawn_blocking(move || -> Result<CallResult> {
            let _permit = permit;
            let _ticker = ticker;

            let program = match program {
                Ok(program) => program,
                Err((name, code)) => {
                    let program = Arc::new(sandbox.compile(&name, &code)?);
                    programs.insert(oracle_id, Arc::clone(&program));
                    program
                }
            };

            let started = Instant::now();
            stats.begin();
            tracing::debug!(oracle = oracle_id, state = %RunState::Running, "run started");

            let outcome = sandbox
                .execute(&program, args, records, cancel)
                .and_then(|bytes| encode_within(codec, bytes, max_payload));
            let state = match &outcome {
                Ok(_) => RunState::Succeeded,
                Err(e) => RunState::Failed(e.clone()),
            };
            stats.end(&state);
            tracing::info!(oracle = oracle_id, state = %state, elapsed = ?started.elapsed(), "run finished");

            Ok(outcome?)
        });

        task.await
            .map_err(|e| ExecutionError::Exception(format!("execution task failed: {}", e)))?
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

fn encode_within(codec: PayloadCodec, bytes: Vec<u8>, max_payload: usize) -> std::result::Result<CallResult, ExecutionError> {
    let result = codec.encode(bytes);
    if result.payload.len() > max_payload {
        return Err(result_too_large(result.payload.len(), max_payload));
    }
    Ok(result)
}
