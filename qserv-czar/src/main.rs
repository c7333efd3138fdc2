//! `czar` binary: binds the admin HTTP surface and the dispatch RPC client
//! pool (spec.md section 1 lists CLIs/config loading/logging as external
//! ambient concerns; this binary is that entry point, in the style of
//! `apollo-router/src/main.rs`).

use clap::Parser;
use qserv_czar::admin::{self, AdminState};
use qserv_czar::qdisp::{Executive, ExecutiveConfig, PseudoFifo, QdispPool};
use qserv_czar::rproc::{InMemoryMergeSink, InfileMerger, InfileMergerConfig as MergeSinkConfig};
use qserv_czar::transport::tonic_transport::TonicTransport;
use qserv_common::config::Config;
use qserv_common::logging::{self, LogFormat};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "czar", about = "Qserv dispatch/merge czar")]
struct Args {
    /// Path to a YAML config file; defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address the admin HTTP surface binds to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    admin_addr: String,

    /// Worker addresses this czar may dispatch to, e.g.
    /// `http://worker-1:50051`. Repeat the flag for more than one.
    #[arg(long = "worker")]
    workers: Vec<String>,

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

    let pool = QdispPool::new(
        config.dispatch.qdisp_pool.num_threads,
        config.dispatch.qdisp_pool.min_running_per_class.clone(),
    );
    let pseudo_fifo = PseudoFifo::new(config.dispatch.pseudo_fifo.max_concurrent);
    let transport: qserv_czar::transport::SharedTransport = Arc::new(TonicTransport::new());

    let max_job_attempts = config.dispatch.max_job_attempts;
    let max_merged_bytes = config.infile_merger.max_merged_bytes;
    let max_connections = config.infile_merger.sql_conn_mgr.max_connections;
    let pool_for_factory = pool.clone();
    let fifo_for_factory = pseudo_fifo.clone();
    let transport_for_factory = transport.clone();

    let new_executive: admin::ExecutiveFactory = Arc::new(move |query_id, row_limit| {
        // Production deployments back this with `MySqlMergeSink`; swapping
        // the sink is the Open Question resolution recorded in DESIGN.md —
        // this binary ships the in-memory sink so it runs without a MySQL
        // server attached.
        let sink = InMemoryMergeSink::new();
        let merger = InfileMerger::new(
            sink,
            MergeSinkConfig {
                max_job_attempts,
                max_merged_bytes,
                max_connections,
            },
        );
        Executive::new(
            query_id,
            ExecutiveConfig {
                max_job_attempts,
                row_limit,
            },
            transport_for_factory.clone(),
            merger,
            pool_for_factory.clone(),
            fifo_for_factory.clone(),
        )
    });

    let admin_state = AdminState::new(args.workers, new_executive);
    let app = admin::router(admin_state);
    let listener = tokio::net::TcpListener::bind(&args.admin_addr).await?;
    tracing::info!(addr = %args.admin_addr, "czar admin surface listening");
    axum::serve(listener, app).await?;

    pool.shutdown().await;
    Ok(())
}
