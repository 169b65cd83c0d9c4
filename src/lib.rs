pub mod error;
pub mod model;
pub mod codec;
pub mod storage;
pub mod registry;
pub mod vector;
pub mod sandbox;
pub mod manager;
pub mod engine;
pub mod config;
pub mod protocol;
pub mod server;
pub mod http;
pub mod client;
pub mod parser;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::config::DbConfig;
use crate::engine::ExecutionEngine;
use crate::error::Result;
use crate::model::{CallResult, MetaEntry, Oracle, OracleId, OracleSummary, Page, Record, RecordId};
use crate::protocol::ServerInfo;
use crate::registry::OracleRegistry;
use crate::storage::{RecordSource, RecordStore};

pub use crate::error::{Error, ExecutionError};

/// The database: records, the oracle registry and the engine that runs
/// oracles against the records.
pub struct OracleDb {
    records: Arc<RecordStore>,
    oracles: OracleRegistry,
    engine: ExecutionEngine,
    started: Instant,
}

impl fmt::Debug for OracleDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OracleDb")
        .field("records", &self.records.len())
        .field("oracles", &self.oracles.len())
        .finish()
    }
}

impl OracleDb {
    pub fn new(config: DbConfig) -> Result<Self> {
        let records = Arc::new(RecordStore::new(config.max_records));
        let source: Arc<dyn RecordSource> = records.clone();
        let engine = ExecutionEngine::new(config.engine, config.codec, source)?;

        Ok(Self {
            records,
            oracles: OracleRegistry::new(),
            engine,
            started: Instant::now(),
        })
    }

    // --- RECORDS ---

    pub fn create_record(&self, data: Vec<f64>, meta: Vec<MetaEntry>) -> Result<RecordId> {
        self.records.create(data, meta)
    }

    pub fn read_record(&self, id: RecordId) -> Result<Record> {
        self.records.read(id)
    }

    pub fn update_record(&self, id: RecordId, data: Option<Vec<f64>>, meta: Option<Vec<MetaEntry>>) -> Result<()> {
        self.records.update(id, data, meta)
    }

    pub fn delete_record(&self, id: RecordId) -> Result<()> {
        self.records.delete(id)
    }

    pub fn list_records(&self, page: u64, per_page: u64) -> Page<Record> {
        self.records.list(page, per_page)
    }

    pub fn create_records(&self, batch: Vec<(Vec<f64>, Vec<MetaEntry>)>) -> Result<Vec<RecordId>> {
        self.records.create_many(batch)
    }

    /// Returns how many of `ids` existed and were removed.
    pub fn delete_records(&self, ids: &[RecordId]) -> usize {
        self.records.delete_many(ids)
    }

    pub fn find_records(&self, name: &str, value: &str) -> Result<Vec<Record>> {
        self.records.find_by_meta(name, value)
    }

    // --- ORACLES ---

    /// Zero or one summaries; names are unique.
    pub fn find_oracle(&self, name: &str) -> Vec<OracleSummary> {
        self.oracles
            .find_by_name(name)
            .map(|o| vec![OracleSummary::from(o.as_ref())])
            .unwrap_or_default()
    }

    /// Registers `code` under `name`, or returns the existing id when the
    /// name is taken. Only code for a new name is validated.
    pub fn create_oracle(&self, name: &str, code: &str) -> Result<OracleId> {
        if let Some(existing) = self.oracles.find_by_name(name) {
            return Ok(existing.id);
        }
        if name.trim().is_empty() {
            return Err(Error::Validation("oracle name must not be empty".into()));
        }

        let program = self.engine.compile(name, code)?;
        let (oracle, created) = self.oracles.insert_or_get(name, code)?;
        if created {
            self.engine.install(oracle.id, program);
        }
        Ok(oracle.id)
    }

    pub fn read_oracle(&self, id: OracleId) -> Result<Oracle> {
        self.oracles.get(id).map(|o| o.as_ref().clone())
    }

    pub fn list_oracles(&self, page: u64, per_page: u64) -> Page<OracleSummary> {
        self.oracles.list(page, per_page)
    }

    /// Executes oracle `id`. An unknown id fails before anything runs.
    pub async fn run(&self, id: OracleId, args: Vec<String>) -> Result<CallResult> {
        let oracle = self.oracles.get(id)?;
        self.engine.run(&oracle, args).await
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
            pid: std::process::id(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpus: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            records: self.records.len(),
            oracles: self.oracles.len(),
            engine: self.engine.stats(),
        }
    }
}
