mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sparkq", version, about = "Local-first task queue for a developer cockpit")]
struct Cli {
    /// Path to sparkq.yml; overrides the normal discovery order.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the singleton project from the active configuration.
    Setup,
    /// Run the HTTP service with both janitors.
    Run,
    /// Ask a running server to shut down gracefully.
    Stop,
    /// Probe a running server's health and version.
    Status,
    /// Ask a running server to reload its configuration.
    Reload,
    /// Manage sessions.
    #[command(subcommand)]
    Session(SessionCommand),
    /// Manage queues.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Enqueue a task on a queue.
    Enqueue {
        /// Queue id, or queue name when --session is given.
        #[arg(long)]
        queue: String,
        /// Session id or name, required to resolve a queue by name.
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        tool: String,
        /// Task class; defaults to the tools.<name>.task_class mapping.
        #[arg(long)]
        class: Option<String>,
        /// Task payload as inline JSON.
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Timeout in seconds; defaults to the class timeout.
        #[arg(long)]
        timeout: Option<i64>,
    },
    /// Show the oldest queued task without claiming it.
    Peek {
        #[arg(long)]
        queue: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Claim the oldest queued task in a queue.
    Claim {
        #[arg(long)]
        queue: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Report a running task as succeeded.
    Complete {
        task_id: String,
        /// Result as inline JSON; must carry a non-empty "summary".
        #[arg(long)]
        result: String,
        #[arg(long)]
        stdout: Option<String>,
        #[arg(long)]
        stderr: Option<String>,
    },
    /// Report a running task as failed.
    Fail {
        task_id: String,
        #[arg(long)]
        error: String,
        #[arg(long)]
        stdout: Option<String>,
        #[arg(long)]
        stderr: Option<String>,
    },
    /// List tasks.
    Tasks {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
    },
    /// Show one task.
    Task { task_id: String },
    /// Copy a failed task into a fresh queued one.
    Requeue { task_id: String },
    /// Purge old terminal tasks now.
    Purge {
        /// Age threshold in days; defaults to purge.older_than_days.
        #[arg(long)]
        older_than_days: Option<i64>,
    },
    /// Run the queue runner bound to one queue.
    Runner {
        #[arg(long)]
        queue: String,
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    List {
        /// Filter: active or ended.
        #[arg(long)]
        status: Option<String>,
    },
    End { session: String },
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    Create {
        name: String,
        #[arg(long)]
        session: String,
        #[arg(long)]
        instructions: Option<String>,
        #[arg(long)]
        model_profile: Option<String>,
    },
    List {
        #[arg(long)]
        session: Option<String>,
        /// Include archived queues.
        #[arg(long)]
        all: bool,
    },
    End { queue: String, #[arg(long)] session: Option<String> },
    Archive { queue: String, #[arg(long)] session: Option<String> },
    Unarchive { queue: String, #[arg(long)] session: Option<String> },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(commands::run(cli)) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
