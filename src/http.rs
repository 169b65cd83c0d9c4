use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use warp::Filter;

use crate::OracleDb;

#[derive(Serialize)]
struct Health {
    status: &'static str,
    records: usize,
    oracles: usize,
}

/// `GET /health` and `GET /info`.
pub fn routes(db: Arc<OracleDb>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    // 1. GET /health
    let health = warp::get()
    .and(warp::path("health"))
    .and(warp::path::end())
    .and(with_db(db.clone()))
    .map(|db: Arc<OracleDb>| {
        let info = db.info();
        warp::reply::json(&Health { status: "ok", records: info.records, oracles: info.oracles })
    });

    // 2. GET /info
    let info = warp::get()
    .and(warp::path("info"))
    .and(warp::path::end())
    .and(with_db(db))
    .map(|db: Arc<OracleDb>| warp::reply::json(&db.info()));

    health.or(info)
}

pub async fn start_http_api(db: Arc<OracleDb>, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "HTTP API listening");
    warp::serve(routes(db)).run(addr).await;
}

fn with_db(db: Arc<OracleDb>) -> impl Filter<Extract = (Arc<OracleDb>,), Error = Infallible> + Clone {
    warp::any().map(move || db.clone())
}
