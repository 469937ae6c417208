//! Control plane binary: wires the database pool, ledger, cron scheduler,
//! metrics recorder, agent RPC server, queue worker, and the admin HTTP
//! surface together under one lifecycle supervisor.

mod config;
mod http;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use arcade_core::auth::StaticVerifier;
use arcade_core::ledger::PgLedger;
use arcade_core::lifecycle::{ShutdownFlag, Stage, Supervisor};
use arcade_core::queue::{Broker, HandlerRegistry, Worker, WorkerConfig};
use arcade_db::pool::{create_pool, run_migrations};
use arcade_rpc::server::AppState;

use crate::config::ResolvedConfig;
use crate::http::AdminState;

#[derive(Parser)]
#[command(name = "arcade-server", about = "arcade control plane")]
struct Cli {
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (default when no subcommand is given).
    Start,
    /// Apply pending database migrations and exit.
    Migrate,
}

struct JobDispatchHandler;

#[async_trait]
impl arcade_core::queue::TaskHandler for JobDispatchHandler {
    async fn handle(&self, entry: &arcade_db::models::QueueEntry) -> Result<()> {
        // Steps for this job were already persisted by the compiler at
        // pipeline-submission time; agents pick them up by polling
        // FetchStepRun. Dispatch just marks the entry handled so the
        // broker can ack it.
        tracing::debug!(job_id = %entry.task_id, "job dispatched, awaiting agent step claims");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let resolved = ResolvedConfig::resolve(cli.database_url.as_deref())
        .context("failed to resolve configuration")?;

    match cli.command.unwrap_or(Command::Start) {
        Command::Migrate => run_migrate(&resolved).await,
        Command::Start => run_start(resolved).await,
    }
}

async fn run_migrate(resolved: &ResolvedConfig) -> Result<()> {
    let pool = create_pool(&resolved.db_config).await?;
    run_migrations(&pool).await?;
    tracing::info!("migrations applied");
    Ok(())
}

async fn run_start(resolved: ResolvedConfig) -> Result<()> {
    let pool = create_pool(&resolved.db_config).await?;
    run_migrations(&pool).await.context("failed to run migrations on startup")?;

    let metrics_handle = arcade_core::metrics::install_recorder().context("failed to install metrics recorder")?;
    let ledger = Arc::new(PgLedger::new(pool.clone()));
    let shutdown = ShutdownFlag::new();

    let mut supervisor = Supervisor::new(shutdown.clone());

    // Periodic sweep: agents that stopped heartbeating get flipped offline
    // so the scheduler stops routing step claims to them.
    let stale_pool = pool.clone();
    let stale_after_secs = resolved.server.stale_agent_after_secs;
    supervisor.add_stage(Stage::new("stale-agent-sweep", Duration::from_secs(5), move |cancel| async move {
        let mut scheduler = arcade_core::cron::CronScheduler::new();
        let pool = stale_pool.clone();
        scheduler.schedule("stale-agent-sweep", arcade_core::cron::Schedule::every(Duration::from_secs(30)), move || {
            let pool = pool.clone();
            async move {
                let marked = arcade_db::queries::agents::mark_stale_agents_offline(
                    &pool,
                    chrono::Duration::seconds(stale_after_secs),
                )
                .await?;
                if marked > 0 {
                    tracing::info!(marked, "marked stale agents offline");
                }
                Ok(())
            }
        });
        cancel.cancelled().await;
        scheduler.stop();
    }));

    let broker = Broker::new(pool.clone());
    let mut registry = HandlerRegistry::new();
    registry.register(arcade_db::models::TaskType::Job, JobDispatchHandler);
    let registry = Arc::new(registry);
    let worker = Worker::new(broker, registry, ledger.clone(), WorkerConfig {
        queue_name: resolved.server.queue_name.clone(),
        ..WorkerConfig::default()
    });
    supervisor.add_stage(Stage::new("queue-worker", Duration::from_secs(30), move |cancel| async move {
        worker.run(cancel).await;
    }));

    let verifier = Arc::new(StaticVerifier::new(resolved.api_key.clone()));
    let rpc_state = AppState {
        pool: pool.clone(),
        verifier,
        api_key: resolved.api_key.clone(),
    };
    let rpc_bind = resolved.server.bind.clone();
    let rpc_port = resolved.server.rpc_port;
    let rpc_pool = pool.clone();
    supervisor.add_stage(Stage::new("rpc-server", Duration::from_secs(10), move |cancel| async move {
        let shutdown_fut = async move { cancel.cancelled().await };
        if let Err(e) = arcade_rpc::server::serve(rpc_pool, rpc_state, &rpc_bind, rpc_port, shutdown_fut).await {
            tracing::error!(error = %e, "rpc server exited with error");
        }
    }));

    let admin_state = AdminState {
        shutdown: shutdown.clone(),
        metrics: metrics_handle,
        version: env!("CARGO_PKG_VERSION"),
    };
    let admin_bind = resolved.server.bind.clone();
    let admin_port = resolved.server.http_port;
    supervisor.add_stage(Stage::new("admin-http", Duration::from_secs(10), move |cancel| async move {
        let app = http::build_router(admin_state);
        let addr: std::net::SocketAddr = match format!("{admin_bind}:{admin_port}").parse() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, "invalid admin bind address");
                return;
            }
        };
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(error = %e, "failed to bind admin http listener");
                return;
            }
        };
        tracing::info!("admin http listening on http://{addr}");
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "admin http server exited with error");
        }
    }));

    supervisor.run().await;
    Ok(())
}
