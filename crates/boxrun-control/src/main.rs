//! boxrun CLI - manage sandboxes and run coding-agent tasks in them.

use std::io::Write;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use boxrun_control::orchestrator::TaskRequest;
use boxrun_control::relay::FnSink;
use boxrun_control::{ControlConfig, ControlPlane, RelayOutcome, StreamRequest};
use boxrun_core::{
    ListFilter, Locality, LogEvent, LogEventType, SandboxRecord, SandboxSpec, TaskId, TaskRecord,
};

/// boxrun - sandboxes for coding agents
#[derive(Parser)]
#[command(name = "boxrun")]
#[command(about = "Run coding-agent tasks in local or cloud sandboxes", long_about = None)]
struct Cli {
    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a sandbox
    Create {
        /// Sandbox name (derived from --branch when omitted)
        name: Option<String>,

        /// Branch the sandbox works on
        #[arg(short, long)]
        branch: Option<String>,

        /// Create a cloud sandbox instead of a local container
        #[arg(long)]
        remote: bool,

        /// Container image or cloud snapshot
        #[arg(long)]
        image: Option<String>,

        /// Group tag
        #[arg(short, long)]
        group: Option<String>,

        /// CPU cores (remote only)
        #[arg(long, allow_negative_numbers = true)]
        cpu: Option<i64>,

        /// Memory in GiB (remote only)
        #[arg(long, allow_negative_numbers = true)]
        memory: Option<i64>,

        /// Disk in GiB (remote only)
        #[arg(long, allow_negative_numbers = true)]
        disk: Option<i64>,

        /// Environment variables (KEY=VALUE)
        #[arg(short, long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
    },

    /// List sandboxes
    List {
        /// Only local sandboxes
        #[arg(long, conflicts_with = "remote")]
        local: bool,

        /// Only remote sandboxes
        #[arg(long)]
        remote: bool,

        /// Only sandboxes in this group
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Show one sandbox by name or id
    Get {
        sandbox: String,
    },

    /// Start a stopped sandbox
    Start {
        sandbox: String,
    },

    /// Delete a sandbox
    Delete {
        sandbox: String,

        /// Remove even if running
        #[arg(short, long)]
        force: bool,
    },

    /// Start a task and print its id
    Task {
        sandbox: String,
        prompt: String,

        /// Model override
        #[arg(short, long)]
        model: Option<String>,

        /// Environment variables (KEY=VALUE)
        #[arg(short, long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// Stream the task's output until it finishes
        #[arg(short, long)]
        follow: bool,
    },

    /// Run a task and wait for its aggregated output
    Run {
        sandbox: String,
        prompt: String,

        /// Model override
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Show a task's status
    Status {
        sandbox: String,
        task_id: String,

        /// Poll until the task finishes
        #[arg(short, long)]
        wait: bool,

        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },

    /// Stream a task's logs
    Logs {
        sandbox: String,
        task_id: String,

        /// Keep streaming until the task finishes
        #[arg(short, long)]
        follow: bool,

        /// Skip output produced before now
        #[arg(long)]
        no_history: bool,

        /// Only output at or after this unix timestamp (ms)
        #[arg(long)]
        since_ms: Option<i64>,
    },

    /// Check a sandbox's daemon
    Daemon {
        sandbox: String,
    },

    /// Tail the daemon's log files inside a sandbox
    DaemonLogs {
        sandbox: String,

        /// Only this task's log
        #[arg(short, long)]
        task: Option<String>,

        /// Number of lines
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so command output stays pipeable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("boxrun=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let control = ControlPlane::from_config(ControlConfig::from_env())?;
    let json = cli.json;

    let result = run(&control, cli.command, json).await;
    control.close().await;
    result
}

async fn run(
    control: &ControlPlane,
    command: Commands,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Create {
            name,
            branch,
            remote,
            image,
            group,
            cpu,
            memory,
            disk,
            env,
        } => {
            let spec = SandboxSpec {
                name,
                branch,
                locality: Some(if remote { Locality::Remote } else { Locality::Local }),
                image,
                group,
                cpu,
                memory_gb: memory,
                disk_gb: disk,
                env: env.into_iter().collect(),
            };
            let record = control.create_sandbox(&spec).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("Sandbox created:");
                print_sandbox(&record);
            }
        }

        Commands::List {
            local,
            remote,
            group,
        } => {
            let mut filter = match (local, remote) {
                (true, false) => ListFilter::local_only(),
                (false, true) => ListFilter::remote_only(),
                _ => ListFilter::all(),
            };
            filter.group = group;
            let records = control.list_sandboxes(&filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_sandbox_table(&records);
            }
        }

        Commands::Get { sandbox } => {
            let record = control.find_sandbox(&sandbox).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_sandbox(&record);
            }
        }

        Commands::Start { sandbox } => {
            let record = control.start_sandbox(&sandbox).await?;
            println!("Sandbox {} is {}", record.name, record.state);
        }

        Commands::Delete { sandbox, force } => {
            let record = control.delete_sandbox(&sandbox, force).await?;
            println!("Sandbox {} deleted", record.name);
        }

        Commands::Task {
            sandbox,
            prompt,
            model,
            env,
            follow,
        } => {
            let mut request = TaskRequest::new(prompt);
            request.model = model;
            request.env = env.into_iter().collect();

            let task_id = control.create_task(&sandbox, request).await?;
            if json && !follow {
                println!("{}", serde_json::json!({ "task_id": task_id }));
            } else {
                println!("{task_id}");
            }
            if follow {
                stream_logs(control, &sandbox, StreamRequest::new(task_id), json).await?;
            }
        }

        Commands::Run {
            sandbox,
            prompt,
            model,
        } => {
            let mut request = TaskRequest::new(prompt);
            request.model = model;

            let output = control.run_task(&sandbox, request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                print!("{}", output.output);
                if !output.error.is_empty() {
                    eprint!("{}", output.error);
                }
            }
            if !output.success {
                std::process::exit(output.exit_code.filter(|c| *c != 0).unwrap_or(1));
            }
        }

        Commands::Status {
            sandbox,
            task_id,
            wait,
            interval_ms,
        } => {
            let task_id = TaskId::new(task_id);
            let record = if wait {
                control
                    .wait_task(&sandbox, &task_id, Duration::from_millis(interval_ms))
                    .await?
            } else {
                control.get_task_status(&sandbox, &task_id).await?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_task(&record);
            }
        }

        Commands::Logs {
            sandbox,
            task_id,
            follow,
            no_history,
            since_ms,
        } => {
            let mut request = StreamRequest::new(TaskId::new(task_id))
                .with_follow(follow)
                .with_history(!no_history);
            request.from_timestamp_ms = since_ms;
            stream_logs(control, &sandbox, request, json).await?;
        }

        Commands::Daemon { sandbox } => {
            let status = control.daemon_status(&sandbox).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("  Sandbox:    {}", status.sandbox);
                println!("  Endpoint:   {}", status.endpoint);
                println!("  Version:    {}", status.info.version);
                println!("  Hostname:   {}", status.info.hostname);
                println!("  Uptime:     {}s", status.info.uptime_secs);
                println!("  Active:     {}", status.info.active_tasks);
            }
        }

        Commands::DaemonLogs {
            sandbox,
            task,
            lines,
        } => {
            let task = task.map(TaskId::new);
            let output = control.daemon_logs(&sandbox, task.as_ref(), lines).await?;
            print!("{}", output.stdout);
        }
    }

    Ok(())
}

async fn stream_logs(
    control: &ControlPlane,
    sandbox: &str,
    request: StreamRequest,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut sink = FnSink(move |event: LogEvent| print_event(&event, json));
    let outcome = control.stream_task_logs(sandbox, &request, &mut sink).await?;

    match outcome {
        RelayOutcome::Completed { status, .. } => {
            if status.as_deref() == Some("FAILED") {
                std::process::exit(1);
            }
        }
        RelayOutcome::EndOfStream { .. } => {}
        RelayOutcome::TransportError { .. } => std::process::exit(2),
    }
    Ok(())
}

fn print_event(event: &LogEvent, json: bool) -> std::io::Result<()> {
    if json {
        let line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{line}")?;
        return out.flush();
    }

    match event.event_type {
        LogEventType::Stdout => {
            let mut out = std::io::stdout().lock();
            out.write_all(event.content.as_bytes())?;
            out.flush()
        }
        LogEventType::Stderr => {
            let mut err = std::io::stderr().lock();
            err.write_all(event.content.as_bytes())?;
            err.flush()
        }
        LogEventType::Error => {
            writeln!(std::io::stderr(), "error: {}", event.content)
        }
        LogEventType::Status => {
            let status = event.task_status.as_deref().unwrap_or("STATUS");
            writeln!(std::io::stderr(), "[{status}] {}", event.content)
        }
    }
}

fn print_sandbox(record: &SandboxRecord) {
    println!("  ID:         {}", record.id);
    println!("  Name:       {}", record.name);
    println!("  Locality:   {}", record.locality);
    println!("  State:      {}", record.state);
    println!("  Created:    {}", record.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(group) = &record.group {
        println!("  Group:      {group}");
    }
    for (key, value) in &record.metadata {
        println!("  {:<11} {}", format!("{key}:"), value);
    }
}

fn print_sandbox_table(records: &[SandboxRecord]) {
    println!("Sandboxes ({}):", records.len());
    println!(
        "{:<24}  {:<8}  {:<10}  {:<12}  {}",
        "NAME", "WHERE", "STATE", "GROUP", "CREATED"
    );
    println!("{}", "-".repeat(80));
    for record in records {
        println!(
            "{:<24}  {:<8}  {:<10}  {:<12}  {}",
            record.name,
            record.locality.to_string(),
            record.state,
            record.group.as_deref().unwrap_or("-"),
            record.created_at.format("%Y-%m-%d %H:%M")
        );
    }
}

fn print_task(task: &TaskRecord) {
    println!("  ID:         {}", task.id);
    println!("  Sandbox:    {}", task.sandbox_id);
    println!("  State:      {}", task.state);
    if !task.message.is_empty() {
        println!("  Message:    {}", task.message);
    }
    if let Some(code) = task.exit_code {
        println!("  Exit code:  {code}");
    }
    if let Some(started) = task.started_at {
        println!("  Started:    {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(duration) = task.duration() {
        println!("  Duration:   {}s", duration.num_seconds());
    }
    if let Some(error) = &task.error {
        println!("  Error:      {error}");
    }
}
