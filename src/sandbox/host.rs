//! Host ABI linked into every oracle isolate.
//!
//! Everything an oracle can touch goes through the functions defined here:
//! its own arguments, a read-only view of the records, and a result
//! builder. No WASI is linked, so there is no filesystem, network, clock or
//! environment access.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Number, Value};
use wasmtime::{Caller, Extern, Linker, StoreLimits};

use crate::error::ExecutionError;
use crate::model::{Record, RecordId};
use crate::storage::RecordSource;
use crate::vector;

use super::{result_too_large, SandboxLimits};

/// Import module name every oracle uses.
pub const HOST_MODULE: &str = "oracle";

/// Largest string `log`/`fail` will copy out of guest memory.
const MAX_MESSAGE_BYTES: usize = 64 * 1024;

pub(crate) struct HostState {
    pub(crate) limits: StoreLimits,
    pub(crate) failure: Option<ExecutionError>,
    pub(crate) output: Output,
    max_result_items: usize,
    max_result_bytes: usize,
    args: Vec<String>,
    records: RecordsView,
}

impl HostState {
    pub(crate) fn new(
        limits: StoreLimits,
        bounds: &SandboxLimits,
        args: Vec<String>,
        source: Arc<dyn RecordSource>,
    ) -> Self {
        Self {
            limits,
            failure: None,
            output: Output::Empty,
            max_result_items: bounds.max_result_items,
            max_result_bytes: bounds.max_result_bytes,
            args,
            records: RecordsView::new(source),
        }
    }

    /// First failure wins; later traps are consequences of it.
    pub(crate) fn fail_with(&mut self, err: ExecutionError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }
}

/// Stable per-invocation view over the store.
///
/// Enumeration snapshots the store once; point lookups are memoised so an
/// oracle never sees a record change under it mid-run.
struct RecordsView {
    source: Arc<dyn RecordSource>,
    listing: Option<Vec<RecordId>>,
    seen: HashMap<RecordId, Option<Arc<Record>>>,
}

impl RecordsView {
    fn new(source: Arc<dyn RecordSource>) -> Self {
        Self { source, listing: None, seen: HashMap::new() }
    }

    fn listing(&mut self) -> &[RecordId] {
        if self.listing.is_none() {
            let snapshot = self.source.snapshot();
            let mut ids = Vec::with_capacity(snapshot.len());
            for record in snapshot {
                ids.push(record.id);
                self.seen.entry(record.id).or_insert(Some(record));
            }
            self.listing = Some(ids);
        }
        self.listing.as_deref().unwrap_or_default()
    }

    fn get(&mut self, id: i64) -> Option<Arc<Record>> {
        let id = RecordId::try_from(id).ok()?;
        if let Some(known) = self.seen.get(&id) {
            return known.clone();
        }
        // after a snapshot, anything not in it does not exist for this run
        let found = match self.listing {
            Some(_) => None,
            None => self.source.get(id),
        };
        self.seen.insert(id, found.clone());
        found
    }
}

/// Result being assembled by the oracle.
#[derive(Debug, Default)]
pub(crate) enum Output {
    #[default]
    Empty,
    Number(f64),
    Entries(Vec<(RecordId, f64)>),
    List(Vec<(RecordId, f64)>),
    Json(Value),
}

impl Output {
    fn items(&self) -> usize {
        match self {
            Output::Entries(items) | Output::List(items) => items.len(),
            _ => 0,
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            Output::Empty => "empty",
            Output::Number(_) => "number",
            Output::Entries(_) => "entries",
            Output::List(_) => "list",
            Output::Json(_) => "json",
        }
    }

    /// Builds the final JSON document. `returned` is the entry point's return
    /// value, used only when the oracle produced no explicit result.
    pub(crate) fn finish(self, returned: Option<Value>) -> Result<Vec<u8>, ExecutionError> {
        let value = match self {
            Output::Empty => returned.unwrap_or(Value::Null),
            Output::Number(x) => json_number(x)?,
            Output::Entries(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (id, score) in entries {
                    map.insert(id.to_string(), json_number(score)?);
                }
                Value::Object(map)
            }
            Output::List(items) => {
                let mut list = Vec::with_capacity(items.len());
                for (id, score) in items {
                    let mut item = Map::with_capacity(2);
                    item.insert("id".into(), Value::from(id));
                    item.insert("score".into(), json_number(score)?);
                    list.push(Value::Object(item));
                }
                Value::Array(list)
            }
            Output::Json(v) => v,
        };
        serde_json::to_vec(&value).map_err(|e| ExecutionError::Serialize(e.to_string()))
    }
}

pub(crate) fn json_number(x: f64) -> Result<Value, ExecutionError> {
    Number::from_f64(x)
        .map(Value::Number)
        .ok_or_else(|| ExecutionError::Serialize(format!("{} is not representable in JSON", x)))
}

fn raise<T>(caller: &mut Caller<'_, HostState>, err: ExecutionError) -> wasmtime::Result<T> {
    let msg = err.to_string();
    caller.data_mut().fail_with(err);
    Err(wasmtime::Error::msg(msg))
}

fn exception<T>(caller: &mut Caller<'_, HostState>, msg: String) -> wasmtime::Result<T> {
    raise(caller, ExecutionError::Exception(msg))
}

fn memory_range(caller: &mut Caller<'_, HostState>, ptr: i32, len: usize) -> wasmtime::Result<(wasmtime::Memory, usize)> {
    if ptr < 0 {
        return exception(caller, "negative pointer".into());
    }
    let ptr = ptr as usize;
    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => memory,
        _ => return exception(caller, "oracle does not export its memory".into()),
    };
    let end = match ptr.checked_add(len) {
        Some(end) => end,
        None => return exception(caller, "pointer overflow".into()),
    };
    if end > memory.data_size(&*caller) {
        return exception(caller, "memory access out of bounds".into());
    }
    Ok((memory, ptr))
}

fn read_memory(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    if len < 0 {
        return exception(caller, "negative length".into());
    }
    let (memory, ptr) = memory_range(caller, ptr, len as usize)?;
    let mut data = vec![0_u8; len as usize];
    if memory.read(&*caller, ptr, &mut data).is_err() {
        return exception(caller, "memory read failed".into());
    }
    Ok(data)
}

fn write_memory(caller: &mut Caller<'_, HostState>, ptr: i32, bytes: &[u8]) -> wasmtime::Result<()> {
    let (memory, ptr) = memory_range(caller, ptr, bytes.len())?;
    if memory.write(&mut *caller, ptr, bytes).is_err() {
        return exception(caller, "memory write failed".into());
    }
    Ok(())
}

fn read_text(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<String> {
    let len = len.min(MAX_MESSAGE_BYTES as i32);
    let bytes = read_memory(caller, ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn arg(caller: &Caller<'_, HostState>, index: i32) -> Option<String> {
    usize::try_from(index).ok().and_then(|i| caller.data().args.get(i).cloned())
}

fn require_arg(caller: &mut Caller<'_, HostState>, index: i32) -> wasmtime::Result<String> {
    match arg(caller, index) {
        Some(a) => Ok(a),
        None => exception(caller, format!("argument {} was not supplied", index)),
    }
}

fn require_record(caller: &mut Caller<'_, HostState>, id: i64) -> wasmtime::Result<Arc<Record>> {
    match caller.data_mut().records.get(id) {
        Some(record) => Ok(record),
        None => exception(caller, format!("record {} not found", id)),
    }
}

fn pair(
    caller: &mut Caller<'_, HostState>,
    a: i64,
    b: i64,
    op: fn(&[f64], &[f64]) -> f64,
) -> wasmtime::Result<f64> {
    let ra = require_record(caller, a)?;
    let rb = require_record(caller, b)?;
    if ra.data.len() != rb.data.len() {
        return exception(
            caller,
            format!(
                "dimension mismatch: record {} has {} elements, record {} has {}",
                ra.id,
                ra.data.len(),
                rb.id,
                rb.data.len()
            ),
        );
    }
    Ok(op(&ra.data, &rb.data))
}

fn set_output(caller: &mut Caller<'_, HostState>, wanted: &'static str, apply: impl FnOnce(&mut Output)) -> wasmtime::Result<()> {
    let current = caller.data().output.shape();
    if current != "empty" && current != wanted {
        return exception(caller, format!("result is already a {}, cannot add a {}", current, wanted));
    }
    apply(&mut caller.data_mut().output);
    Ok(())
}

/// Refuses to grow an entries or list result past its item cap.
fn ensure_room(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<()> {
    let max = caller.data().max_result_items;
    if caller.data().output.items() >= max {
        return raise(caller, ExecutionError::Serialize(format!("result has more than {} items", max)));
    }
    Ok(())
}

pub(crate) fn define_host_abi(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    // --- Arguments ---

    linker.func_wrap(HOST_MODULE, "arg_count", |caller: Caller<'_, HostState>| -> i32 {
        caller.data().args.len() as i32
    })?;

    linker.func_wrap(HOST_MODULE, "arg_len", |caller: Caller<'_, HostState>, index: i32| -> i32 {
        arg(&caller, index).map_or(-1, |a| a.len() as i32)
    })?;

    linker.func_wrap(
        HOST_MODULE,
        "arg_read",
        |mut caller: Caller<'_, HostState>, index: i32, ptr: i32, cap: i32| -> wasmtime::Result<i32> {
            let Some(text) = arg(&caller, index) else { return Ok(-1) };
            let n = text.len().min(cap.max(0) as usize);
            write_memory(&mut caller, ptr, &text.as_bytes()[..n])?;
            Ok(n as i32)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "arg_i64",
        |mut caller: Caller<'_, HostState>, index: i32| -> wasmtime::Result<i64> {
            let text = require_arg(&mut caller, index)?;
            match text.trim().parse::<i64>() {
                Ok(v) => Ok(v),
                Err(_) => exception(&mut caller, format!("argument {} is not an integer: '{}'", index, text)),
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "arg_f64",
        |mut caller: Caller<'_, HostState>, index: i32| -> wasmtime::Result<f64> {
            let text = require_arg(&mut caller, index)?;
            match text.trim().parse::<f64>() {
                Ok(v) => Ok(v),
                Err(_) => exception(&mut caller, format!("argument {} is not a number: '{}'", index, text)),
            }
        },
    )?;

    // --- Records (read-only) ---

    linker.func_wrap(HOST_MODULE, "records_count", |mut caller: Caller<'_, HostState>| -> i64 {
        caller.data_mut().records.listing().len() as i64
    })?;

    linker.func_wrap(
        HOST_MODULE,
        "records_id_at",
        |mut caller: Caller<'_, HostState>, index: i64| -> i64 {
            let listing = caller.data_mut().records.listing();
            usize::try_from(index)
                .ok()
                .and_then(|i| listing.get(i))
                .map_or(-1, |id| *id as i64)
        },
    )?;

    linker.func_wrap(HOST_MODULE, "record_exists", |mut caller: Caller<'_, HostState>, id: i64| -> i32 {
        caller.data_mut().records.get(id).is_some() as i32
    })?;

    linker.func_wrap(HOST_MODULE, "record_len", |mut caller: Caller<'_, HostState>, id: i64| -> i32 {
        caller.data_mut().records.get(id).map_or(-1, |r| r.data.len() as i32)
    })?;

    linker.func_wrap(
        HOST_MODULE,
        "record_get",
        |mut caller: Caller<'_, HostState>, id: i64, index: i32| -> wasmtime::Result<f64> {
            let record = require_record(&mut caller, id)?;
            match usize::try_from(index).ok().and_then(|i| record.data.get(i)) {
                Some(v) => Ok(*v),
                None => exception(
                    &mut caller,
                    format!("index {} out of range for record {} ({} elements)", index, id, record.data.len()),
                ),
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "record_meta",
        |mut caller: Caller<'_, HostState>, id: i64, name_ptr: i32, name_len: i32, out_ptr: i32, out_cap: i32| -> wasmtime::Result<i32> {
            let record = require_record(&mut caller, id)?;
            let name = read_text(&mut caller, name_ptr, name_len)?;
            let Some(value) = record.meta(&name) else { return Ok(-1) };
            let n = value.len().min(out_cap.max(0) as usize);
            write_memory(&mut caller, out_ptr, &value.as_bytes()[..n])?;
            Ok(value.len() as i32)
        },
    )?;

    linker.func_wrap(HOST_MODULE, "record_dot", |mut caller: Caller<'_, HostState>, a: i64, b: i64| {
        pair(&mut caller, a, b, vector::dot)
    })?;

    linker.func_wrap(HOST_MODULE, "record_cosine", |mut caller: Caller<'_, HostState>, a: i64, b: i64| {
        pair(&mut caller, a, b, vector::cosine)
    })?;

    linker.func_wrap(HOST_MODULE, "record_distance", |mut caller: Caller<'_, HostState>, a: i64, b: i64| {
        pair(&mut caller, a, b, vector::distance)
    })?;

    linker.func_wrap(HOST_MODULE, "record_jaccard", |mut caller: Caller<'_, HostState>, a: i64, b: i64| {
        pair(&mut caller, a, b, vector::jaccard)
    })?;

    linker.func_wrap(
        HOST_MODULE,
        "record_magnitude",
        |mut caller: Caller<'_, HostState>, id: i64| -> wasmtime::Result<f64> {
            let record = require_record(&mut caller, id)?;
            Ok(vector::magnitude(&record.data))
        },
    )?;

    // --- Results ---

    linker.func_wrap(
        HOST_MODULE,
        "result_number",
        |mut caller: Caller<'_, HostState>, value: f64| -> wasmtime::Result<()> {
            set_output(&mut caller, "number", |out| *out = Output::Number(value))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "result_entry",
        |mut caller: Caller<'_, HostState>, id: i64, value: f64| -> wasmtime::Result<()> {
            let Ok(id) = RecordId::try_from(id) else {
                return exception(&mut caller, format!("invalid record id {}", id));
            };
            ensure_room(&mut caller)?;
            set_output(&mut caller, "entries", |out| match out {
                Output::Entries(entries) => entries.push((id, value)),
                other => *other = Output::Entries(vec![(id, value)]),
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "result_push",
        |mut caller: Caller<'_, HostState>, id: i64, score: f64| -> wasmtime::Result<()> {
            let Ok(id) = RecordId::try_from(id) else {
                return exception(&mut caller, format!("invalid record id {}", id));
            };
            ensure_room(&mut caller)?;
            set_output(&mut caller, "list", |out| match out {
                Output::List(items) => items.push((id, score)),
                other => *other = Output::List(vec![(id, score)]),
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "result_json",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let max = caller.data().max_result_bytes;
            if usize::try_from(len).is_ok_and(|n| n > max) {
                return raise(&mut caller, result_too_large(len as usize, max));
            }
            let bytes = read_memory(&mut caller, ptr, len)?;
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => set_output(&mut caller, "json", |out| *out = Output::Json(value)),
                Err(e) => raise(&mut caller, ExecutionError::Serialize(format!("invalid JSON result: {}", e))),
            }
        },
    )?;

    // --- Control ---

    linker.func_wrap(
        HOST_MODULE,
        "fail",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let msg = read_text(&mut caller, ptr, len)?;
            exception(&mut caller, msg)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let msg = read_text(&mut caller, ptr, len)?;
            tracing::debug!(target: "oracledb::oracle", "{}", msg);
            Ok(())
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_output_uses_return_value() {
        let bytes = Output::Empty.finish(Some(Value::from(3))).unwrap();
        assert_eq!(bytes, b"3");
        let bytes = Output::Empty.finish(None).unwrap();
        assert_eq!(bytes, b"null");
    }

    #[test]
    fn entries_become_an_object() {
        let out = Output::Entries(vec![(2, 0.5), (9, 1.0)]);
        let value: Value = serde_json::from_slice(&out.finish(None).unwrap()).unwrap();
        assert_eq!(value["2"], 0.5);
        assert_eq!(value["9"], 1.0);
    }

    #[test]
    fn list_items_carry_id_and_score() {
        let out = Output::List(vec![(4, 0.25)]);
        let value: Value = serde_json::from_slice(&out.finish(None).unwrap()).unwrap();
        assert_eq!(value[0]["id"], 4);
        assert_eq!(value[0]["score"], 0.25);
    }

    #[test]
    fn non_finite_numbers_fail_to_serialize() {
        assert!(matches!(Output::Number(f64::NAN).finish(None), Err(ExecutionError::Serialize(_))));
        let out = Output::List(vec![(1, f64::INFINITY)]);
        assert!(matches!(out.finish(None), Err(ExecutionError::Serialize(_))));
    }
}
