//! Shared helpers for the gateway integration suites.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use oracledb::client::Client;
use oracledb::codec::PayloadCodec;
use oracledb::config::{DbConfig, DEFAULT_MAX_FRAME_BYTES};
use oracledb::model::CallResult;
use oracledb::server::OracleServer;
use oracledb::OracleDb;
use tokio::net::TcpListener;

pub const FIND_SIMILAR: &str = include_str!("../../demos/oracles/find_similar.wat");
pub const DOT_ALL: &str = include_str!("../../demos/oracles/dot_all.wat");
pub const SPIN: &str = r#"(module (func (export "run") (loop $l (br $l))))"#;

/// Pushes 4096 identical list items.
pub const WIDE_LIST: &str = r#"(module
    (import "oracle" "result_push" (func $push (param i64 f64)))
    (func (export "run") (local $i i32)
        (loop $l
            (call $push (i64.const 1) (f64.const 0.5))
            (local.set $i (i32.add (local.get $i) (i32.const 1)))
            (br_if $l (i32.lt_u (local.get $i) (i32.const 4096))))))"#;

/// Starts a gateway on an ephemeral port in its own runtime thread.
pub fn start_server(config: DbConfig) -> SocketAddr {
    start_server_with_frame(config, DEFAULT_MAX_FRAME_BYTES)
}

pub fn start_server_with_frame(config: DbConfig, max_frame: usize) -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            let db = Arc::new(OracleDb::new(config).unwrap());
            OracleServer::new(db).with_max_frame(max_frame).serve(listener).await.unwrap();
        });
    });
    rx.recv().unwrap()
}

pub fn connect(addr: SocketAddr) -> Client {
    let client = Client::connect(addr).unwrap();
    client.set_timeout(Some(Duration::from_secs(30))).unwrap();
    client
}

pub fn decode_json(result: &CallResult) -> serde_json::Value {
    let bytes = PayloadCodec::decode(result).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn config_with_timeout(timeout: Duration) -> DbConfig {
    let mut config = DbConfig::default();
    config.engine.limits.timeout = timeout;
    config
}
