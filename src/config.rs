use std::time::Duration;

use clap::Parser;

use crate::codec::{PayloadCodec, DEFAULT_COMPRESSION_LEVEL, DEFAULT_COMPRESSION_THRESHOLD};
use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::manager::SystemProfile;
use crate::protocol::payload_budget;
use crate::sandbox::{SandboxLimits, DEFAULT_MAX_RESULT_BYTES, DEFAULT_MAX_RESULT_ITEMS, DEFAULT_MAX_WASM_STACK};
use crate::storage::DEFAULT_MAX_RECORDS;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// The smallest frame limit that still carries a 10 MiB oracle result once
/// base64 has expanded it.
const MIN_FRAME_BYTES: usize = 14 * 1024 * 1024;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Vector record store with sandboxed oracles", long_about = None)]
pub struct Args {
    /// TCP gateway address
    #[clap(long, env = "ORACLEDB_ADDR", default_value = "127.0.0.1:9000")]
    pub addr: String,

    /// Port of the HTTP health/info endpoint (0 disables it)
    #[clap(long, env = "ORACLEDB_HTTP_PORT", default_value = "9080")]
    pub http_port: u16,

    #[clap(long, env = "ORACLEDB_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    #[clap(long, env = "ORACLEDB_MAX_RECORDS", default_value_t = DEFAULT_MAX_RECORDS)]
    pub max_records: usize,

    /// Wall-clock budget of one oracle run, in milliseconds
    #[clap(long, env = "ORACLEDB_EXEC_TIMEOUT_MS", default_value = "5000")]
    pub exec_timeout_ms: u64,

    /// Linear-memory ceiling per isolate, in MiB
    #[clap(long, env = "ORACLEDB_MAX_MEMORY_MB", default_value = "64")]
    pub max_memory_mb: usize,

    /// Entries or list items a single oracle result may hold
    #[clap(long, env = "ORACLEDB_MAX_RESULT_ITEMS", default_value_t = DEFAULT_MAX_RESULT_ITEMS)]
    pub max_result_items: usize,

    /// Concurrent oracle runs; defaults to the detected system profile
    #[clap(long, env = "ORACLEDB_EXEC_SLOTS")]
    pub exec_slots: Option<usize>,

    #[clap(long, env = "ORACLEDB_QUEUE_TIMEOUT_MS", default_value = "1000")]
    pub queue_timeout_ms: u64,

    #[clap(long, env = "ORACLEDB_EPOCH_TICK_MS", default_value = "10")]
    pub epoch_tick_ms: u64,

    #[clap(long, env = "ORACLEDB_COMPRESSION_THRESHOLD", default_value_t = DEFAULT_COMPRESSION_THRESHOLD)]
    pub compression_threshold: usize,

    #[clap(long, env = "ORACLEDB_COMPRESSION_LEVEL", default_value_t = DEFAULT_COMPRESSION_LEVEL)]
    pub compression_level: i32,
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(Error::Validation(format!(
                "max frame size must be at least {} bytes",
                MIN_FRAME_BYTES
            )));
        }
        if u32::try_from(self.max_frame_bytes).is_err() {
            return Err(Error::Validation("max frame size must fit in a 32-bit length prefix".into()));
        }
        if self.max_records == 0 {
            return Err(Error::Validation("max records must be positive".into()));
        }
        if self.exec_timeout_ms == 0 || self.epoch_tick_ms == 0 {
            return Err(Error::Validation("execution timeout and epoch tick must be positive".into()));
        }
        if self.epoch_tick_ms > self.exec_timeout_ms {
            return Err(Error::Validation("epoch tick must not exceed the execution timeout".into()));
        }
        if self.max_memory_mb == 0 {
            return Err(Error::Validation("memory ceiling must be positive".into()));
        }
        if self.max_memory_bytes().is_none() {
            return Err(Error::Validation(format!("memory ceiling of {} MiB is too large", self.max_memory_mb)));
        }
        if self.max_result_items == 0 {
            return Err(Error::Validation("result item limit must be positive".into()));
        }
        if self.exec_slots == Some(0) {
            return Err(Error::Validation("at least one execution slot is required".into()));
        }
        if !zstd::compression_level_range().contains(&self.compression_level) {
            return Err(Error::Validation(format!(
                "compression level {} is out of range",
                self.compression_level
            )));
        }
        Ok(())
    }

    fn max_memory_bytes(&self) -> Option<usize> {
        self.max_memory_mb.checked_mul(1024 * 1024)
    }

    /// Expects `validate` to have passed.
    pub fn db_config(&self, profile: &SystemProfile) -> DbConfig {
        DbConfig {
            max_records: self.max_records,
            engine: EngineConfig {
                limits: SandboxLimits {
                    timeout: Duration::from_millis(self.exec_timeout_ms),
                    max_memory_bytes: self.max_memory_bytes().unwrap_or(usize::MAX),
                    max_wasm_stack: DEFAULT_MAX_WASM_STACK,
                    max_result_items: self.max_result_items,
                    max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
                },
                max_concurrent: self.exec_slots.unwrap_or(profile.execution_slots),
                queue_timeout: Duration::from_millis(self.queue_timeout_ms),
                epoch_tick: Duration::from_millis(self.epoch_tick_ms),
                max_payload_bytes: payload_budget(self.max_frame_bytes),
            },
            codec: PayloadCodec::new(self.compression_threshold, self.compression_level),
        }
    }
}

/// Everything `OracleDb` needs to start.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub max_records: usize,
    pub engine: EngineConfig,
    pub codec: PayloadCodec,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            engine: EngineConfig::default(),
            codec: PayloadCodec::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["oracledb"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_are_valid() {
        let args = parse(&[]);
        args.validate().unwrap();
        assert_eq!(args.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn rejects_small_frames_and_zero_slots() {
        assert!(parse(&["--max-frame-bytes", "65536"]).validate().is_err());
        assert!(parse(&["--exec-slots", "0"]).validate().is_err());
        assert!(parse(&["--exec-timeout-ms", "5", "--epoch-tick-ms", "10"]).validate().is_err());
        assert!(parse(&["--compression-level", "99"]).validate().is_err());
        assert!(parse(&["--max-result-items", "0"]).validate().is_err());
    }

    #[test]
    fn rejects_memory_ceiling_that_overflows() {
        let huge = (usize::MAX / 1024).to_string();
        let err = parse(&["--max-memory-mb", &huge]).validate().unwrap_err();
        assert!(err.to_string().contains("too large"), "{}", err);

        let profile = SystemProfile::detect();
        let config = parse(&["--max-memory-mb", &huge]).db_config(&profile);
        assert_eq!(config.engine.limits.max_memory_bytes, usize::MAX);
    }

    #[test]
    fn result_payload_budget_follows_frame_size() {
        let profile = SystemProfile::detect();
        let small = parse(&[]).db_config(&profile).engine.max_payload_bytes;
        let large = parse(&["--max-frame-bytes", "33554432"]).db_config(&profile).engine.max_payload_bytes;
        assert_eq!(small, payload_budget(DEFAULT_MAX_FRAME_BYTES));
        assert!(large > small);
        // a 10 MiB incompressible result still fits the default frame
        assert!(small >= 10 * 1024 * 1024);
    }

    #[test]
    fn db_config_uses_profile_slots_unless_overridden() {
        let profile = SystemProfile { logical_cores: 8, worker_threads: 8, execution_slots: 6, max_blocking_threads: 24 };

        let config = parse(&["--exec-timeout-ms", "250"]).db_config(&profile);
        assert_eq!(config.engine.max_concurrent, 6);
        assert_eq!(config.engine.limits.timeout, Duration::from_millis(250));

        let config = parse(&["--exec-slots", "2", "--max-memory-mb", "8"]).db_config(&profile);
        assert_eq!(config.engine.max_concurrent, 2);
        assert_eq!(config.engine.limits.max_memory_bytes, 8 * 1024 * 1024);
    }
}
