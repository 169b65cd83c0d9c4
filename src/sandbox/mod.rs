//! Isolated oracle execution on wasmtime.
//!
//! Each invocation gets a fresh `Store` (the isolate) with a memory ceiling
//! and an epoch deadline. The epoch is advanced by a background ticker, so a
//! run that never yields is still trapped from outside; the store is dropped
//! on every exit path.

pub mod host;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use wasmtime::{Config, Engine, ExternType, InstancePre, Linker, Store, StoreLimitsBuilder, Trap, UpdateDeadline, Val, ValType};

use crate::error::{Error, ExecutionError, Result};
use crate::storage::RecordSource;
use host::{define_host_abi, json_number, HostState};

pub use host::HOST_MODULE;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_MEMORY_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_MAX_WASM_STACK: usize = 512 * 1024;
pub const DEFAULT_MAX_RESULT_ITEMS: usize = 1_000_000;
pub const DEFAULT_MAX_RESULT_BYTES: usize = 64 * 1024 * 1024;

/// Export used when the module has no export named after the oracle.
pub const FALLBACK_ENTRY: &str = "run";

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub max_memory_bytes: usize,
    pub max_wasm_stack: usize,
    /// Entries or list items one run may add to its result
    pub max_result_items: usize,
    /// Size of the result JSON before compression
    pub max_result_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_wasm_stack: DEFAULT_MAX_WASM_STACK,
            max_result_items: DEFAULT_MAX_RESULT_ITEMS,
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }
}

/// A validated, linked oracle ready to be instantiated.
#[derive(Clone)]
pub struct CompiledOracle {
    pre: InstancePre<HostState>,
    entry: String,
}

impl CompiledOracle {
    pub fn entry(&self) -> &str {
        &self.entry
    }
}

pub struct Sandbox {
    engine: Engine,
    linker: Linker<HostState>,
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Result<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        config.max_wasm_stack(limits.max_wasm_stack);
        config.wasm_memory64(false);
        config.wasm_multi_memory(false);
        let engine = Engine::new(&config)
            .map_err(|e| Error::Validation(format!("wasm engine init failed: {}", e)))?;

        let mut linker = Linker::new(&engine);
        define_host_abi(&mut linker)
            .map_err(|e| Error::Validation(format!("host ABI definition failed: {}", e)))?;

        Ok(Self { engine, linker, limits })
    }

    /// The wasmtime engine; the epoch ticker advances it.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    /// Compiles `code` (WAT text or a binary module) and checks that it only
    /// imports host functions and exports a usable entry point.
    pub fn compile(&self, name: &str, code: &str) -> Result<CompiledOracle> {
        let module = wasmtime::Module::new(&self.engine, code.as_bytes())
            .map_err(|e| Error::Validation(format!("invalid oracle code: {}", e)))?;

        for import in module.imports() {
            if import.module() != HOST_MODULE {
                return Err(Error::Validation(format!(
                    "import {}::{} is not allowed, oracles may only import from '{}'",
                    import.module(),
                    import.name(),
                    HOST_MODULE
                )));
            }
        }

        let entry = [name, FALLBACK_ENTRY]
            .into_iter()
            .find(|e| matches!(module.get_export(e), Some(ExternType::Func(_))))
            .ok_or_else(|| {
                Error::Validation(format!("oracle must export a function named '{}' or '{}'", name, FALLBACK_ENTRY))
            })?;

        if let Some(ExternType::Func(ty)) = module.get_export(entry) {
            let results: Vec<ValType> = ty.results().collect();
            let numeric = results
                .iter()
                .all(|t| matches!(t, ValType::I32 | ValType::I64 | ValType::F32 | ValType::F64));
            if ty.params().len() != 0 || results.len() > 1 || !numeric {
                return Err(Error::Validation(format!(
                    "entry '{}' must take no parameters and return at most one number",
                    entry
                )));
            }
        }

        // Resolves every import against the host ABI, catching unknown names
        // and signature mismatches at registration time.
        let pre = self
            .linker
            .instantiate_pre(&module)
            .map_err(|e| Error::Validation(format!("oracle imports do not match the host ABI: {}", e)))?;

        Ok(CompiledOracle { pre, entry: entry.to_string() })
    }

    /// Runs one invocation to completion inside a fresh isolate.
    pub fn execute(
        &self,
        oracle: &CompiledOracle,
        args: Vec<String>,
        source: Arc<dyn RecordSource>,
        cancel: Arc<AtomicBool>,
    ) -> std::result::Result<Vec<u8>, ExecutionError> {
        let timeout = self.limits.timeout;
        let deadline = Instant::now() + timeout;

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.limits.max_memory_bytes)
            .instances(1)
            .memories(1)
            .tables(1)
            .build();
        let mut store = Store::new(&self.engine, HostState::new(limits, &self.limits, args, source));
        store.limiter(|state| &mut state.limits);

        // Checked on every epoch tick, whether or not the guest cooperates.
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(move |mut ctx| {
            if cancel.load(Ordering::Acquire) {
                ctx.data_mut().fail_with(ExecutionError::Cancelled);
                return Err(wasmtime::Error::msg("execution cancelled"));
            }
            if Instant::now() >= deadline {
                ctx.data_mut().fail_with(ExecutionError::Timeout(timeout));
                return Err(wasmtime::Error::msg("deadline exceeded"));
            }
            Ok(UpdateDeadline::Continue(1))
        });

        let instance = oracle
            .pre
            .instantiate(&mut store)
            .map_err(|e| classify(&store, e, timeout))?;
        let func = instance
            .get_func(&mut store, &oracle.entry)
            .ok_or_else(|| ExecutionError::Exception(format!("entry '{}' not found", oracle.entry)))?;

        let arity = func.ty(&store).results().len();
        let mut results = vec![Val::I32(0); arity];
        func.call(&mut store, &[], &mut results)
            .map_err(|e| classify(&store, e, timeout))?;

        let returned = match results.first() {
            Some(val) => Some(returned_value(val)?),
            None => None,
        };

        let state = store.into_data();
        if let Some(failure) = state.failure {
            return Err(failure);
        }
        let bytes = state.output.finish(returned)?;
        if bytes.len() > self.limits.max_result_bytes {
            return Err(result_too_large(bytes.len(), self.limits.max_result_bytes));
        }
        Ok(bytes)
    }
}

pub(crate) fn result_too_large(len: usize, max: usize) -> ExecutionError {
    ExecutionError::Serialize(format!("result of {} bytes exceeds the {} byte limit", len, max))
}

fn returned_value(val: &Val) -> std::result::Result<Value, ExecutionError> {
    match val {
        Val::I32(v) => Ok(Value::from(*v)),
        Val::I64(v) => Ok(Value::from(*v)),
        Val::F32(_) => json_number(val.unwrap_f32() as f64),
        Val::F64(_) => json_number(val.unwrap_f64()),
        _ => Err(ExecutionError::Serialize("entry returned a non-numeric value".into())),
    }
}

fn classify(store: &Store<HostState>, err: wasmtime::Error, timeout: Duration) -> ExecutionError {
    if let Some(failure) = store.data().failure.clone() {
        return failure;
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => ExecutionError::Timeout(timeout),
        Some(trap) => ExecutionError::Exception(format!("wasm trap: {}", trap)),
        None => ExecutionError::Exception(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::EpochTicker;
    use crate::model::MetaEntry;
    use crate::storage::RecordStore;

    fn sandbox(timeout: Duration) -> (Sandbox, EpochTicker) {
        let sandbox = Sandbox::new(SandboxLimits { timeout, ..SandboxLimits::default() }).unwrap();
        let ticker = EpochTicker::start(sandbox.engine().clone(), Duration::from_millis(5)).unwrap();
        (sandbox, ticker)
    }

    fn run(sandbox: &Sandbox, code: &str, args: &[&str], store: Arc<RecordStore>) -> std::result::Result<Value, ExecutionError> {
        let oracle = sandbox.compile("test", code).unwrap();
        let args = args.iter().map(|a| a.to_string()).collect();
        let bytes = sandbox.execute(&oracle, args, store, Arc::new(AtomicBool::new(false)))?;
        Ok(serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_return_value_becomes_result() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let code = r#"(module (func (export "run") (result f64) f64.const 2.5))"#;
        let value = run(&sb, code, &[], Arc::new(RecordStore::default())).unwrap();
        assert_eq!(value, 2.5);
    }

    #[test]
    fn test_entry_named_after_oracle_wins() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let code = r#"(module
            (func (export "run") (result i32) i32.const 1)
            (func (export "test") (result i32) i32.const 2))"#;
        let compiled = sb.compile("test", code).unwrap();
        assert_eq!(compiled.entry(), "test");
    }

    #[test]
    fn test_missing_entry_rejected() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let code = r#"(module (func (export "other")))"#;
        assert!(matches!(sb.compile("test", code), Err(Error::Validation(_))));
    }

    #[test]
    fn test_entry_with_params_rejected() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let code = r#"(module (func (export "run") (param i32)))"#;
        assert!(matches!(sb.compile("test", code), Err(Error::Validation(_))));
    }

    #[test]
    fn test_wasi_imports_rejected() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let code = r#"(module
            (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
            (func (export "run")))"#;
        assert!(matches!(sb.compile("test", code), Err(Error::Validation(_))));
    }

    #[test]
    fn test_unknown_host_function_rejected() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let code = r#"(module
            (import "oracle" "record_delete" (func (param i64)))
            (func (export "run")))"#;
        assert!(matches!(sb.compile("test", code), Err(Error::Validation(_))));
    }

    #[test]
    fn test_wrong_host_signature_rejected() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let code = r#"(module
            (import "oracle" "records_count" (func (result i32)))
            (func (export "run")))"#;
        assert!(matches!(sb.compile("test", code), Err(Error::Validation(_))));
    }

    #[test]
    fn test_garbage_code_rejected() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        assert!(matches!(sb.compile("test", "function x() {}"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let (sb, _t) = sandbox(Duration::from_millis(100));
        let code = r#"(module (func (export "run") (loop $forever (br $forever))))"#;
        let started = Instant::now();
        let err = run(&sb, code, &[], Arc::new(RecordStore::default())).unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(_)), "got {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_cancel_flag_interrupts() {
        let (sb, _t) = sandbox(Duration::from_secs(30));
        let code = r#"(module (func (export "run") (loop $forever (br $forever))))"#;
        let oracle = sb.compile("test", code).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&cancel);
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::Release);
        });

        let started = Instant::now();
        let err = sb.execute(&oracle, vec![], Arc::new(RecordStore::default()), cancel).unwrap_err();
        canceller.join().unwrap();
        assert_eq!(err, ExecutionError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_trap_is_an_exception() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let code = r#"(module (func (export "run") unreachable))"#;
        let err = run(&sb, code, &[], Arc::new(RecordStore::default())).unwrap_err();
        assert!(matches!(err, ExecutionError::Exception(_)));
    }

    #[test]
    fn test_fail_carries_message() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let code = r#"(module
            (import "oracle" "fail" (func $fail (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "boom")
            (func (export "run") (call $fail (i32.const 0) (i32.const 4))))"#;
        let err = run(&sb, code, &[], Arc::new(RecordStore::default())).unwrap_err();
        assert_eq!(err, ExecutionError::Exception("boom".into()));
    }

    #[test]
    fn test_invalid_json_result_is_serialize_error() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let code = r#"(module
            (import "oracle" "result_json" (func $json (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "{not json")
            (func (export "run") (call $json (i32.const 0) (i32.const 9))))"#;
        let err = run(&sb, code, &[], Arc::new(RecordStore::default())).unwrap_err();
        assert!(matches!(err, ExecutionError::Serialize(_)));
    }

    #[test]
    fn test_nan_result_is_serialize_error() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let code = r#"(module (func (export "run") (result f64) f64.const nan))"#;
        let err = run(&sb, code, &[], Arc::new(RecordStore::default())).unwrap_err();
        assert!(matches!(err, ExecutionError::Serialize(_)));
    }

    #[test]
    fn test_memory_ceiling_enforced() {
        let sb = Sandbox::new(SandboxLimits { max_memory_bytes: 2 * 65536, ..SandboxLimits::default() }).unwrap();
        let _t = EpochTicker::start(sb.engine().clone(), Duration::from_millis(5)).unwrap();
        // growing past the ceiling fails inside the guest (memory.grow yields -1)
        let code = r#"(module
            (memory 1)
            (func (export "run") (result i32) (memory.grow (i32.const 16))))"#;
        let value = run(&sb, code, &[], Arc::new(RecordStore::default())).unwrap();
        assert_eq!(value, -1);

        // a module that needs more than the ceiling up front cannot start
        let code = r#"(module (memory 8) (func (export "run")))"#;
        let err = run(&sb, code, &[], Arc::new(RecordStore::default())).unwrap_err();
        assert!(matches!(err, ExecutionError::Exception(_)));
    }

    #[test]
    fn test_record_access_and_args() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let store = Arc::new(RecordStore::default());
        let id = store.create(vec![3.0, 4.0], vec![MetaEntry::new("k", "v")]).unwrap();

        let code = r#"(module
            (import "oracle" "arg_i64" (func $arg_i64 (param i32) (result i64)))
            (import "oracle" "record_magnitude" (func $mag (param i64) (result f64)))
            (func (export "run") (result f64)
                (call $mag (call $arg_i64 (i32.const 0)))))"#;
        let value = run(&sb, code, &[&id.to_string()], Arc::clone(&store)).unwrap();
        assert_eq!(value, 5.0);

        let err = run(&sb, code, &["12345"], Arc::clone(&store)).unwrap_err();
        assert_eq!(err, ExecutionError::Exception("record 12345 not found".into()));

        let err = run(&sb, code, &["abc"], store).unwrap_err();
        assert!(matches!(err, ExecutionError::Exception(msg) if msg.contains("not an integer")));
    }

    #[test]
    fn test_mixed_result_shapes_rejected() {
        let (sb, _t) = sandbox(DEFAULT_TIMEOUT);
        let code = r#"(module
            (import "oracle" "result_number" (func $num (param f64)))
            (import "oracle" "result_push" (func $push (param i64 f64)))
            (func (export "run")
                (call $num (f64.const 1))
                (call $push (i64.const 1) (f64.const 1))))"#;
        let err = run(&sb, code, &[], Arc::new(RecordStore::default())).unwrap_err();
        assert!(matches!(err, ExecutionError::Exception(_)));
    }

    const PUSH_LOOP: &str = r#"(module
        (import "oracle" "result_push" (func $push (param i64 f64)))
        (func (export "run") (local $i i32)
            (loop $l
                (call $push (i64.const 1) (f64.const 0.5))
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (br_if $l (i32.lt_u (local.get $i) (i32.const 100))))))"#;

    #[test]
    fn test_result_item_cap() {
        let limits = SandboxLimits { max_result_items: 10, ..SandboxLimits::default() };
        let sb = Sandbox::new(limits).unwrap();
        let _t = EpochTicker::start(sb.engine().clone(), Duration::from_millis(5)).unwrap();

        let err = run(&sb, PUSH_LOOP, &[], Arc::new(RecordStore::default())).unwrap_err();
        assert!(matches!(err, ExecutionError::Serialize(msg) if msg.contains("more than 10 items")));

        let code = r#"(module
            (import "oracle" "result_entry" (func $entry (param i64 f64)))
            (func (export "run") (local $i i32)
                (loop $l
                    (call $entry (i64.extend_i32_u (local.get $i)) (f64.const 1))
                    (local.set $i (i32.add (local.get $i) (i32.const 1)))
                    (br_if $l (i32.lt_u (local.get $i) (i32.const 11))))))"#;
        let err = run(&sb, code, &[], Arc::new(RecordStore::default())).unwrap_err();
        assert!(matches!(err, ExecutionError::Serialize(_)));

        // exactly at the cap is fine
        let limits = SandboxLimits { max_result_items: 100, ..SandboxLimits::default() };
        let sb = Sandbox::new(limits).unwrap();
        let _t = EpochTicker::start(sb.engine().clone(), Duration::from_millis(5)).unwrap();
        let value = run(&sb, PUSH_LOOP, &[], Arc::new(RecordStore::default())).unwrap();
        assert_eq!(value.as_array().map(|a| a.len()), Some(100));
    }

    #[test]
    fn test_result_byte_cap() {
        let limits = SandboxLimits { max_result_bytes: 64, ..SandboxLimits::default() };
        let sb = Sandbox::new(limits).unwrap();
        let _t = EpochTicker::start(sb.engine().clone(), Duration::from_millis(5)).unwrap();

        // 100 items serialize to well over 64 bytes
        let err = run(&sb, PUSH_LOOP, &[], Arc::new(RecordStore::default())).unwrap_err();
        assert!(matches!(err, ExecutionError::Serialize(msg) if msg.contains("byte limit")));

        // oversized JSON is refused before it is copied out of the guest
        let code = r#"(module
            (import "oracle" "result_json" (func $json (param i32 i32)))
            (memory (export "memory") 1)
            (func (export "run") (call $json (i32.const 0) (i32.const 65))))"#;
        let err = run(&sb, code, &[], Arc::new(RecordStore::default())).unwrap_err();
        assert!(matches!(err, ExecutionError::Serialize(msg) if msg.contains("65 bytes")));
    }
}
