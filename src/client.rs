//! Blocking client for the TCP gateway.
//!
//! Transport failures surface as `Err`; domain failures come back as
//! `success == false` in the typed response, exactly as the server sent them.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::DEFAULT_MAX_FRAME_BYTES;
use crate::error::{Error, Result};
use crate::model::{MetaEntry, OracleId, RecordId};
use crate::protocol::*;

pub struct Client {
    stream: TcpStream,
    max_frame: usize,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, max_frame: DEFAULT_MAX_FRAME_BYTES })
    }

    /// Bounds how long any single call may block; `None` waits forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Sends one request frame and decodes the response body.
    pub fn call<Req: Serialize, Resp: DeserializeOwned>(&mut self, op: u8, req: &Req) -> Result<Resp> {
        let body = serde_json::to_vec(req)?;
        write_request(&mut self.stream, op, &body)?;
        let response = read_response(&mut self.stream, self.max_frame)?;
        serde_json::from_slice(&response).map_err(|e| Error::Protocol(format!("bad response: {}", e)))
    }

    // --- RECORDS ---

    pub fn create_record(&mut self, data: Vec<f64>, meta: Vec<MetaEntry>) -> Result<StatusResponse> {
        self.call(OP_CREATE_RECORD, &CreateRecordRequest { data, meta })
    }

    pub fn read_record(&mut self, id: RecordId) -> Result<RecordResponse> {
        self.call(OP_READ_RECORD, &IdRequest { id })
    }

    pub fn update_record(&mut self, id: RecordId, data: Option<Vec<f64>>, meta: Option<Vec<MetaEntry>>) -> Result<StatusResponse> {
        self.call(OP_UPDATE_RECORD, &UpdateRecordRequest { id, data, meta })
    }

    pub fn delete_record(&mut self, id: RecordId) -> Result<StatusResponse> {
        self.call(OP_DELETE_RECORD, &IdRequest { id })
    }

    pub fn list_records(&mut self, page: u64, per_page: u64) -> Result<RecordsResponse> {
        self.call(OP_LIST_RECORDS, &ListRequest { page, per_page })
    }

    pub fn create_records(&mut self, records: Vec<(Vec<f64>, Vec<MetaEntry>)>) -> Result<IdsResponse> {
        let records = records.into_iter().map(|(data, meta)| CreateRecordRequest { data, meta }).collect();
        self.call(OP_CREATE_RECORDS, &CreateRecordsRequest { records })
    }

    /// `msg` carries the number of records actually removed.
    pub fn delete_records(&mut self, ids: Vec<RecordId>) -> Result<StatusResponse> {
        self.call(OP_DELETE_RECORDS, &IdsRequest { ids })
    }

    pub fn find_records(&mut self, name: &str, value: &str) -> Result<FoundRecordsResponse> {
        self.call(OP_FIND_RECORDS, &FindRecordsRequest { name: name.into(), value: value.into() })
    }

    // --- ORACLES ---

    pub fn create_oracle(&mut self, name: &str, code: &str) -> Result<StatusResponse> {
        self.call(OP_CREATE_ORACLE, &CreateOracleRequest { name: name.into(), code: code.into() })
    }

    pub fn find_oracle(&mut self, name: &str) -> Result<OraclesResponse> {
        self.call(OP_FIND_ORACLE, &FindOracleRequest { name: name.into() })
    }

    pub fn read_oracle(&mut self, id: OracleId) -> Result<OracleResponse> {
        self.call(OP_READ_ORACLE, &IdRequest { id })
    }

    pub fn list_oracles(&mut self, page: u64, per_page: u64) -> Result<OraclesResponse> {
        self.call(OP_LIST_ORACLES, &ListRequest { page, per_page })
    }

    pub fn run(&mut self, id: OracleId, args: Vec<String>) -> Result<RunResponse> {
        self.call(OP_RUN, &RunRequest { id, args })
    }

    pub fn info(&mut self) -> Result<InfoResponse> {
        self.call(OP_INFO, &serde_json::json!({}))
    }
}
