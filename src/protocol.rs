//! Wire format of the TCP gateway.
//!
//! Request frame: `[opcode u8][length u32 LE][JSON body]`.
//! Response frame: `[length u32 LE][JSON body]`.
//! Every response body carries `success` and `msg`.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::engine::EngineStatsSnapshot;
use crate::error::{Error, Result};
use crate::model::{CallResult, MetaEntry, OracleId, OracleSummary, Page, Record, RecordId};

// --- OpCodes ---
pub const OP_CREATE_RECORD: u8 = 0x01;
pub const OP_READ_RECORD: u8   = 0x02;
pub const OP_UPDATE_RECORD: u8 = 0x03;
pub const OP_DELETE_RECORD: u8 = 0x04;
pub const OP_LIST_RECORDS: u8  = 0x05;
pub const OP_CREATE_RECORDS: u8 = 0x06;
pub const OP_DELETE_RECORDS: u8 = 0x07;
pub const OP_FIND_RECORDS: u8  = 0x08;
pub const OP_CREATE_ORACLE: u8 = 0x10;
pub const OP_FIND_ORACLE: u8   = 0x11;
pub const OP_READ_ORACLE: u8   = 0x12;
pub const OP_LIST_ORACLES: u8  = 0x13;
pub const OP_RUN: u8           = 0x20;
pub const OP_INFO: u8          = 0x30;

pub const HEADER_LEN: usize = 5;

/// Room left in a frame for everything around a run result's payload.
const RUN_ENVELOPE_BYTES: usize = 1024;

/// Largest encoded result payload whose `RunResponse` still fits in a
/// `max_frame` byte frame once base64 has expanded it.
pub fn payload_budget(max_frame: usize) -> usize {
    max_frame.saturating_sub(RUN_ENVELOPE_BYTES) / 4 * 3
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CreateRecordRequest {
    pub data: Vec<f64>,
    #[serde(default)]
    pub meta: Vec<MetaEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CreateRecordsRequest {
    pub records: Vec<CreateRecordRequest>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IdsRequest {
    pub ids: Vec<RecordId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FindRecordsRequest {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRequest {
    pub id: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpdateRecordRequest {
    pub id: RecordId,
    #[serde(default)]
    pub data: Option<Vec<f64>>,
    #[serde(default)]
    pub meta: Option<Vec<MetaEntry>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListRequest {
    #[serde(default = "first_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

fn first_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    50
}

impl Default for ListRequest {
    fn default() -> Self {
        Self { page: first_page(), per_page: default_per_page() }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateOracleRequest {
    pub name: String,
    pub code: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FindOracleRequest {
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub id: OracleId,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Plain acknowledgement. `id` is set by the create calls.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub success: bool,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// Answer to a batch create: the new ids in request order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IdsResponse {
    pub success: bool,
    pub msg: String,
    #[serde(default)]
    pub ids: Vec<RecordId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FoundRecordsResponse {
    pub success: bool,
    pub msg: String,
    #[serde(default)]
    pub records: Vec<Record>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecordResponse {
    pub success: bool,
    pub msg: String,
    #[serde(default)]
    pub record: Option<Record>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecordsResponse {
    pub success: bool,
    pub msg: String,
    #[serde(default)]
    pub page: Option<Page<Record>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OraclesResponse {
    pub success: bool,
    pub msg: String,
    #[serde(default)]
    pub oracles: Vec<OracleSummary>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub pages: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OracleResponse {
    pub success: bool,
    pub msg: String,
    #[serde(default)]
    pub oracle: Option<crate::model::Oracle>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunResponse {
    pub success: bool,
    pub msg: String,
    #[serde(default)]
    pub result: Option<CallResult>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: String,
    pub uptime_secs: u64,
    pub pid: u32,
    pub os: String,
    pub arch: String,
    pub cpus: usize,
    pub records: usize,
    pub oracles: usize,
    pub engine: EngineStatsSnapshot,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    pub success: bool,
    pub msg: String,
    #[serde(default)]
    pub info: Option<ServerInfo>,
}

/// Builds the error body for any response type.
pub trait Reply: Serialize {
    fn failure(msg: String) -> Self;
}

macro_rules! impl_reply {
    ($($ty:ty => { $($field:ident: $default:expr),* }),* $(,)?) => {
        $(impl Reply for $ty {
            fn failure(msg: String) -> Self {
                Self { success: false, msg, $($field: $default),* }
            }
        })*
    };
}

impl_reply! {
    StatusResponse => { id: None },
    IdsResponse => { ids: Vec::new() },
    FoundRecordsResponse => { records: Vec::new() },
    RecordResponse => { record: None },
    RecordsResponse => { page: None },
    OraclesResponse => { oracles: Vec::new(), total: 0, pages: 0 },
    OracleResponse => { oracle: None },
    RunResponse => { result: None },
    InfoResponse => { info: None },
}

/// Writes one request frame on a blocking stream.
pub fn write_request<W: Write>(w: &mut W, op: u8, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| Error::Protocol("request body too large".into()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.push(op);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(body);
    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

/// Reads one response frame on a blocking stream.
pub fn read_response<R: Read>(r: &mut R, max_frame: usize) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(Error::Protocol(format!("response of {} bytes exceeds the {} byte limit", len, max_frame)));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(body)
}
