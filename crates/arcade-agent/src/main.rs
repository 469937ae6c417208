//! Agent binary: registers with a control plane, then runs the heartbeat
//! loop and step dispatch loop under one lifecycle supervisor.

mod config;
mod dispatch;
mod heartbeat;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use arcade_core::lifecycle::{ShutdownFlag, Stage, Supervisor};
use arcade_core::steps::StepRegistry;
use arcade_rpc::client::RpcClient;
use arcade_rpc::proto::RegisterRequest;

use crate::config::ConfigFile;
use crate::heartbeat::RunningJobs;

const MAX_RECONNECT_ATTEMPTS: u32 = 10;

#[derive(Parser)]
#[command(name = "arcade-agent", about = "arcade pipeline execution agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the control plane and run the heartbeat/dispatch loops.
    /// The default action when no subcommand is given.
    Start {
        #[arg(short = 'c', long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Register this agent with a control plane and save the resulting
    /// credentials to the config file.
    Register {
        #[arg(short = 't', long, value_name = "API_KEY")]
        token: String,
        #[arg(short = 'u', long, value_name = "HOST[:PORT]")]
        url: String,
        #[arg(short = 'c', long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Start { config: None }) {
        Command::Register { token, url, config } => run_register(token, url, config).await,
        Command::Start { config } => run_start(config).await,
    }
}

async fn run_register(api_key: String, url: String, config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.unwrap_or_else(config::config_path);
    let mut cfg = config::load_config(&path).unwrap_or_default();

    let server_addr = arcade_rpc::client::normalize_addr(&url);
    let client = RpcClient::new(&server_addr, MAX_RECONNECT_ATTEMPTS);

    let req = RegisterRequest {
        api_key,
        hostname: local_hostname(),
        local_ip: local_ip(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        max_concurrent_jobs: cfg.agent.max_concurrent_jobs,
        installed_plugin_ids: Vec::new(),
        labels: cfg.agent.labels.clone(),
    };

    let response: arcade_rpc::proto::RegisterResponse = client
        .call("Register", &req)
        .await
        .context("registration call failed")?;

    cfg.grpc.server_addr = server_addr;
    cfg.grpc.token = response.token;
    cfg.agent.id = Some(response.agent_id);

    config::save_config(&path, &cfg).context("failed to save agent config")?;
    println!("registered agent {} ({})", response.agent_id, path.display());
    Ok(())
}

async fn run_start(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.unwrap_or_else(config::config_path);
    let cfg: ConfigFile = config::load_config(&path)
        .with_context(|| format!("no agent config at {}; run `arcade-agent register` first", path.display()))?;

    let agent_id = cfg
        .agent
        .id
        .context("config has no agent.id; run `arcade-agent register` first")?;

    let client = RpcClient::new(&cfg.grpc.server_addr, MAX_RECONNECT_ATTEMPTS);
    client.set_token(cfg.grpc.token.clone()).await;

    let shutdown = ShutdownFlag::new();
    let mut supervisor = Supervisor::new(shutdown.clone());

    let supervision_cancel = tokio_util::sync::CancellationToken::new();
    client.spawn_supervision(supervision_cancel.clone());
    supervisor.add_stage(Stage::new("rpc-supervision", Duration::from_secs(5), move |cancel| async move {
        cancel.cancelled().await;
        supervision_cancel.cancel();
    }));

    let running_jobs = RunningJobs::new();
    let heartbeat_client = client.clone();
    let heartbeat_agent_id = agent_id;
    let agent_name = local_hostname();
    let heartbeat_interval = cfg.agent.interval;
    let heartbeat_jobs = running_jobs.clone();
    supervisor.add_stage(Stage::new("heartbeat", Duration::from_secs(5), move |cancel| async move {
        let mut scheduler = arcade_core::cron::CronScheduler::new();
        if let Err(e) = heartbeat::start(
            heartbeat_client,
            &mut scheduler,
            heartbeat_agent_id,
            agent_name,
            heartbeat_jobs,
            heartbeat_interval,
        )
        .await
        {
            tracing::error!(error = %e, "heartbeat loop failed to start");
        }
        cancel.cancelled().await;
        scheduler.stop();
    }));

    let registry = Arc::new(StepRegistry::with_builtins());
    let workspace_root = workspace_root_dir();
    let dispatcher = Arc::new(dispatch::Dispatcher::new(
        client,
        registry,
        agent_id,
        running_jobs,
        workspace_root,
        Duration::from_secs(2),
        cfg.agent.max_concurrent_jobs as i64,
    ));
    supervisor.add_stage(Stage::new("dispatch", Duration::from_secs(10), move |cancel| async move {
        dispatcher.run(cancel).await;
    }));

    supervisor.run().await;
    Ok(())
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Best-effort local IP discovery: opens a UDP socket toward a public
/// address (no packets are actually sent) and reads back the address the
/// kernel would route through.
fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn workspace_root_dir() -> PathBuf {
    std::env::var("ARCADE_AGENT_WORKSPACE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("arcade-agent"))
}
