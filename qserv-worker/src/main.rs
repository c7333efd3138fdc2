//! `worker` binary: binds the `WorkerDispatch` RPC service and starts the
//! `Foreman`'s scan-tier dispatch loops (spec.md section 1 lists CLIs/config
//! loading/logging as external ambient concerns; this binary is that entry
//! point, in the style of `apollo-router/src/main.rs`).

use clap::Parser;
use qserv_common::config::Config;
use qserv_common::logging::{self, LogFormat};
use qserv_worker::foreman::Foreman;
use qserv_worker::scheduler::BlendScheduler;
use qserv_worker::server::{self, UnimplementedExecutor};
use qserv_worker::sql_conn_mgr::SqlConnMgr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "worker", about = "Qserv dispatch worker")]
struct Args {
    /// Path to a YAML config file; defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address the `WorkerDispatch` RPC service binds to; overrides the
    /// config file's `worker.bind_addr` when given.
    #[arg(long)]
    bind_addr: Option<String>,

    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormatArg,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogFormatArg {
    Pretty,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(match args.log_format {
        LogFormatArg::Pretty => LogFormat::Pretty,
        LogFormatArg::Json => LogFormat::Json,
    });

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let blend = BlendScheduler::new(&config.scheduler);
    let conn_mgr = SqlConnMgr::new(config.worker.sql_conn_mgr.max_connections);
    // Production deployments provide a `QueryExecutor` backed by a real
    // MySQL connector (spec.md section 1); this binary ships the
    // unimplemented placeholder so it still links and serves without one.
    let foreman = Foreman::new(blend, conn_mgr, Arc::new(UnimplementedExecutor), config.worker.desired_limit_bytes);

    let bind_addr = args.bind_addr.unwrap_or(config.worker.bind_addr);
    let addr: std::net::SocketAddr = bind_addr.parse()?;
    tracing::info!(%addr, "worker dispatch service listening");
    server::serve(addr, foreman, config.worker.response_buffer, config.worker.transmit_concurrency).await?;
    Ok(())
}
