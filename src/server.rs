use std::io;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::DEFAULT_MAX_FRAME_BYTES;
use crate::error::{Error, Result};
use crate::protocol::*;
use crate::OracleDb;

pub struct OracleServer {
    db: Arc<OracleDb>,
    max_frame: usize,
}

impl OracleServer {
    pub fn new(db: Arc<OracleDb>) -> Self {
        Self { db, max_frame: DEFAULT_MAX_FRAME_BYTES }
    }

    /// Caps request and response bodies. Clamped to what a `u32` length
    /// prefix can express.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.min(u32::MAX as usize);
        self
    }

    pub async fn run(&self, addr: &str) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "gateway listening");
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let db = self.db.clone();
                    let max_frame = self.max_frame;
                    tokio::spawn(async move {
                        tracing::debug!(%peer, "client connected");
                        if let Err(e) = handle_client(socket, db, max_frame).await {
                            // Ignore expected disconnections to keep logs clean
                            if e.kind() != io::ErrorKind::UnexpectedEof {
                                tracing::warn!(%peer, error = %e, "client error");
                            }
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "connection failed"),
            }
        }
    }
}

async fn handle_client(mut stream: TcpStream, db: Arc<OracleDb>, max_frame: usize) -> io::Result<()> {
    stream.set_nodelay(true)?;

    loop {
        // 1. Read OpCode + Length
        let mut header = [0u8; HEADER_LEN];
        if stream.read_exact(&mut header).await.is_err() {
            return Ok(());
        }
        let op_code = header[0];
        let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;

        // 2. Read Body
        if length > max_frame {
            tracing::warn!(length, max_frame, "payload too large, closing connection");
            return Ok(());
        }
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await?;

        // 3. Process Command
        let response = match op_code {
            OP_CREATE_RECORD => encode(reply(create_record(&db, &body)), max_frame),
            OP_READ_RECORD   => encode(reply(read_record(&db, &body)), max_frame),
            OP_UPDATE_RECORD => encode(reply(update_record(&db, &body)), max_frame),
            OP_DELETE_RECORD => encode(reply(delete_record(&db, &body)), max_frame),
            OP_LIST_RECORDS  => encode(reply(list_records(&db, &body)), max_frame),
            OP_CREATE_RECORDS => encode(reply(create_records(&db, &body)), max_frame),
            OP_DELETE_RECORDS => encode(reply(delete_records(&db, &body)), max_frame),
            OP_FIND_RECORDS  => encode(reply(find_records(&db, &body)), max_frame),

            OP_CREATE_ORACLE => encode(reply(create_oracle(&db, &body).await), max_frame),
            OP_FIND_ORACLE   => encode(reply(find_oracle(&db, &body)), max_frame),
            OP_READ_ORACLE   => encode(reply(read_oracle(&db, &body)), max_frame),
            OP_LIST_ORACLES  => encode(reply(list_oracles(&db, &body)), max_frame),

            OP_RUN => {
                let outcome = tokio::select! {
                    outcome = run(&db, &body) => outcome,
                    _ = wait_for_disconnect(&stream) => {
                        // dropping the run future cancels the isolate
                        tracing::info!("client left during run, execution cancelled");
                        return Ok(());
                    }
                };
                encode(reply(outcome), max_frame)
            }

            OP_INFO => encode(InfoResponse { success: true, msg: "OK".into(), info: Some(db.info()) }, max_frame),

            _ => {
                tracing::warn!("unknown opcode: 0x{:02X}", op_code);
                encode(StatusResponse::failure(format!("unknown opcode 0x{:02X}", op_code)), max_frame)
            }
        };

        stream.write_all(&response).await?;
        stream.flush().await?;
    }
}

/// Resolves once the peer has closed its half of the connection.
///
/// Pipelined request bytes are left in the socket for the next frame; while
/// they are pending a disconnect cannot be observed and this never resolves.
async fn wait_for_disconnect(stream: &TcpStream) {
    let mut byte = [0u8; 1];
    match stream.peek(&mut byte).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending::<()>().await,
    }
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Protocol(format!("malformed request: {}", e)))
}

fn reply<R: Reply>(outcome: Result<R>) -> R {
    outcome.unwrap_or_else(|e| {
        if e.is_not_found() {
            tracing::trace!(error = %e, "lookup missed");
        } else {
            tracing::debug!(error = %e, "request failed");
        }
        R::failure(e.to_string())
    })
}

/// `[length u32 LE][JSON]`
///
/// A body that would not fit in `max_frame` is replaced by a failure of the
/// same response type, so the client always gets a frame it will accept.
fn encode<R: Reply>(response: R, max_frame: usize) -> Vec<u8> {
    let json = serde_json::to_vec(&response).unwrap_or_else(|e| {
        tracing::error!(error = %e, "response serialization failed");
        failure_body::<R>(format!("serialization error: {}", e))
    });
    let json = if json.len() > max_frame {
        tracing::warn!(len = json.len(), max_frame, "response exceeds the frame limit");
        failure_body::<R>(format!("response of {} bytes exceeds the {} byte frame limit", json.len(), max_frame))
    } else {
        json
    };

    let len = u32::try_from(json.len()).unwrap_or(u32::MAX);
    let mut frame = Vec::with_capacity(4 + json.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&json);
    frame
}

fn failure_body<R: Reply>(msg: String) -> Vec<u8> {
    serde_json::to_vec(&R::failure(msg)).unwrap_or_else(|_| br#"{"success":false,"msg":"internal error"}"#.to_vec())
}

fn created(id: u64) -> StatusResponse {
    StatusResponse { success: true, msg: id.to_string(), id: Some(id) }
}

fn ok(msg: &str) -> StatusResponse {
    StatusResponse { success: true, msg: msg.into(), id: None }
}

// --- RECORD HANDLERS ---

fn create_record(db: &OracleDb, body: &[u8]) -> Result<StatusResponse> {
    let req: CreateRecordRequest = parse(body)?;
    db.create_record(req.data, req.meta).map(created)
}

fn read_record(db: &OracleDb, body: &[u8]) -> Result<RecordResponse> {
    let req: IdRequest = parse(body)?;
    let record = db.read_record(req.id)?;
    Ok(RecordResponse { success: true, msg: "OK".into(), record: Some(record) })
}

fn update_record(db: &OracleDb, body: &[u8]) -> Result<StatusResponse> {
    let req: UpdateRecordRequest = parse(body)?;
    db.update_record(req.id, req.data, req.meta)?;
    Ok(ok("updated"))
}

fn delete_record(db: &OracleDb, body: &[u8]) -> Result<StatusResponse> {
    let req: IdRequest = parse(body)?;
    db.delete_record(req.id)?;
    Ok(ok("deleted"))
}

fn list_records(db: &OracleDb, body: &[u8]) -> Result<RecordsResponse> {
    let req: ListRequest = if body.is_empty() { ListRequest::default() } else { parse(body)? };
    let page = db.list_records(req.page, req.per_page);
    Ok(RecordsResponse { success: true, msg: "OK".into(), page: Some(page) })
}

fn create_records(db: &OracleDb, body: &[u8]) -> Result<IdsResponse> {
    let req: CreateRecordsRequest = parse(body)?;
    let batch = req.records.into_iter().map(|r| (r.data, r.meta)).collect();
    let ids = db.create_records(batch)?;
    Ok(IdsResponse { success: true, msg: ids.len().to_string(), ids })
}

fn delete_records(db: &OracleDb, body: &[u8]) -> Result<StatusResponse> {
    let req: IdsRequest = parse(body)?;
    let deleted = db.delete_records(&req.ids);
    Ok(StatusResponse { success: true, msg: deleted.to_string(), id: None })
}

fn find_records(db: &OracleDb, body: &[u8]) -> Result<FoundRecordsResponse> {
    let req: FindRecordsRequest = parse(body)?;
    let records = db.find_records(&req.name, &req.value)?;
    Ok(FoundRecordsResponse { success: true, msg: records.len().to_string(), records })
}

// --- ORACLE HANDLERS ---

async fn create_oracle(db: &Arc<OracleDb>, body: &[u8]) -> Result<StatusResponse> {
    let req: CreateOracleRequest = parse(body)?;
    // compilation is CPU-bound; keep it off the async workers
    let db = Arc::clone(db);
    let id = tokio::task::spawn_blocking(move || db.create_oracle(&req.name, &req.code))
        .await
        .map_err(|e| Error::Protocol(format!("registration task failed: {}", e)))??;
    Ok(created(id))
}

fn find_oracle(db: &OracleDb, body: &[u8]) -> Result<OraclesResponse> {
    let req: FindOracleRequest = parse(body)?;
    let oracles = db.find_oracle(&req.name);
    let total = oracles.len() as u64;
    Ok(OraclesResponse { success: true, msg: "OK".into(), oracles, total, pages: total.min(1) })
}

fn read_oracle(db: &OracleDb, body: &[u8]) -> Result<OracleResponse> {
    let req: IdRequest = parse(body)?;
    let oracle = db.read_oracle(req.id)?;
    Ok(OracleResponse { success: true, msg: "OK".into(), oracle: Some(oracle) })
}

fn list_oracles(db: &OracleDb, body: &[u8]) -> Result<OraclesResponse> {
    let req: ListRequest = if body.is_empty() { ListRequest::default() } else { parse(body)? };
    let page = db.list_oracles(req.page, req.per_page);
    Ok(OraclesResponse { success: true, msg: "OK".into(), oracles: page.items, total: page.total, pages: page.pages })
}

async fn run(db: &OracleDb, body: &[u8]) -> Result<RunResponse> {
    let req: RunRequest = parse(body)?;
    let result = db.run(req.id, req.args).await?;
    Ok(RunResponse { success: true, msg: "OK".into(), result: Some(result) })
}
