//! boxrun Agent Daemon

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use boxrun_daemon::config::{DEFAULT_DAEMON_PORT, DEFAULT_LOG_DIR};
use boxrun_daemon::{DaemonConfig, DaemonService};

/// boxrun agent daemon - runs coding-agent tasks inside a sandbox
#[derive(Parser)]
#[command(name = "boxrun-daemon")]
#[command(about = "Agent daemon for boxrun sandboxes", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_DAEMON_PORT)))]
    listen: SocketAddr,

    /// Directory for per-task log files
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// Keep task output in memory only
    #[arg(long)]
    no_log_files: bool,

    /// Agent executable
    #[arg(long, default_value = "claude")]
    agent: String,

    /// Agent argument template ({prompt}, {model}, {work_dir} are substituted)
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,

    /// Model used when a task does not name one
    #[arg(long, default_value = "sonnet")]
    model: String,

    /// Finished tasks kept in memory for status and log replay
    #[arg(long, default_value_t = 100)]
    max_finished_tasks: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    let mut config = DaemonConfig::default().with_bind_addr(args.listen);
    config.log_dir = (!args.no_log_files).then_some(args.log_dir);
    config.agent_program = args.agent;
    if !args.agent_args.is_empty() {
        config.agent_args = args.agent_args;
    }
    config.default_model = args.model;
    config.max_finished_tasks = args.max_finished_tasks;

    info!(
        addr = %config.bind_addr,
        agent = %config.agent_program,
        log_dir = ?config.log_dir,
        "Starting boxrun daemon"
    );

    let service = DaemonService::new(&config).into_server();

    Server::builder()
        .add_service(service)
        .serve_with_shutdown(config.bind_addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    Ok(())
}
