use std::sync::Arc;

use clap::Parser;
use oracledb::config::Args;
use oracledb::http::start_http_api;
use oracledb::manager::SystemProfile;
use oracledb::server::OracleServer;
use oracledb::OracleDb;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_target(false)
    .with_level(true)
    .init();

    let args = Args::parse();
    if let Err(e) = args.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(2);
    }

    let profile = SystemProfile::detect();
    tracing::info!(
        cores = profile.logical_cores,
        workers = profile.worker_threads,
        slots = args.exec_slots.unwrap_or(profile.execution_slots),
        blocking = profile.max_blocking_threads,
        "resource profile detected"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
    .worker_threads(profile.worker_threads)
    .max_blocking_threads(profile.max_blocking_threads)
    .thread_name("oracledb-worker")
    .enable_all()
    .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(args, profile)) {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn async_main(args: Args, profile: SystemProfile) -> oracledb::error::Result<()> {
    let db = Arc::new(OracleDb::new(args.db_config(&profile))?);

    if args.http_port != 0 {
        let http_db = db.clone();
        let http_port = args.http_port;
        tokio::spawn(async move {
            start_http_api(http_db, http_port).await;
        });
    }

    let server = OracleServer::new(db.clone()).with_max_frame(args.max_frame_bytes);
    let addr = args.addr.clone();

    tokio::select! {
        res = server.run(&addr) => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
