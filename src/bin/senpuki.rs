//! Operator CLI.
//!
//! Exit codes: 0 on success, 1 on failure, 2 on usage errors (clap).

use clap::{Args, Parser, Subcommand};
use senpuki::backend::{backend_from_url, Backend};
use senpuki::{Client, ExecutionState, FunctionRegistry};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "senpuki", about = "Operate a senpuki deployment", version)]
struct Cli {
    /// Backend connection string (sqlite://path or postgresql://...).
    #[arg(long, env = "SENPUKI_DATABASE_URL", global = true, default_value = "sqlite://senpuki.db")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print counts per execution state and the DLQ depth.
    Stats,
    /// Periodically refresh the same counts.
    Watch {
        /// Refresh interval in seconds.
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
    /// Dead-letter queue operations.
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    /// List executions.
    List(ListArgs),
    /// Show one execution with its tasks.
    Show {
        execution_id: Uuid,
    },
}

#[derive(Args)]
struct ListArgs {
    /// Filter by state (pending, running, completed, failed, timed_out, cancelled).
    #[arg(long)]
    state: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: u32,
}

#[derive(Subcommand)]
enum DlqCommand {
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    Show {
        task_id: Uuid,
    },
    /// Re-create a pending task from the snapshot, optionally on another
    /// queue.
    Replay {
        task_id: Uuid,
        #[arg(long)]
        queue: Option<String>,
    },
    Delete {
        task_id: Uuid,
    },
}

fn fmt_age(now: i64, then: i64) -> String {
    let secs = ((now - then).max(0)) / 1000;
    if secs >= 3600 {
        format!("{}h{}m ago", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{}s ago", secs / 60, secs % 60)
    } else {
        format!("{secs}s ago")
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn print_stats(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
    let stats = client.stats().await?;
    println!("{:<12} {:>8}", "state", "count");
    println!("{}", "-".repeat(21));
    for state in ExecutionState::ALL {
        println!("{:<12} {:>8}", state.as_str(), stats.executions.get(&state).copied().unwrap_or(0));
    }
    println!("{}", "-".repeat(21));
    println!("{:<12} {:>8}", "total", stats.total_executions());
    println!("{:<12} {:>8}", "dlq", stats.dead_tasks);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let backend = backend_from_url(&cli.database_url).await?;
    backend.init_db().await?;
    let registry = Arc::new(FunctionRegistry::builder().build().map_err(std::io::Error::other)?);
    let client = Client::new(backend.clone(), registry);

    match cli.command {
        Command::Stats => print_stats(&client).await?,
        Command::Watch { interval } => loop {
            print!("\x1b[2J\x1b[H");
            print_stats(&client).await?;
            tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
        },
        Command::Dlq { command } => match command {
            DlqCommand::List { limit } => {
                let letters = client.list_dead_letters(limit).await?;
                if letters.is_empty() {
                    println!("dead-letter queue is empty");
                    return Ok(());
                }
                let now = now_ms();
                println!("{:<36}  {:<30} {:<8} {:<12} {}", "task_id", "step", "attempt", "when", "error");
                for letter in letters {
                    println!(
                        "{:<36}  {:<30} {:<8} {:<12} {}",
                        letter.task_id,
                        letter.task.step_name,
                        letter.task.attempt,
                        fmt_age(now, letter.created_at),
                        letter.error,
                    );
                }
            }
            DlqCommand::Show { task_id } => {
                let letter = client
                    .get_dead_letter(task_id)
                    .await?
                    .ok_or_else(|| std::io::Error::other(format!("no dead letter {task_id}")))?;
                println!("task_id:      {}", letter.task_id);
                println!("execution_id: {}", letter.task.execution_id);
                println!("step:         {}", letter.task.step_name);
                println!("queue:        {}", letter.task.queue);
                println!("attempt:      {}/{}", letter.task.attempt, letter.task.max_attempts);
                println!("tags:         {}", letter.task.tags.join(", "));
                println!("error:        {}", letter.error);
                println!("dead since:   {}", fmt_age(now_ms(), letter.created_at));
            }
            DlqCommand::Replay { task_id, queue } => {
                let task = client.replay_dead_letter(task_id, queue.as_deref()).await?;
                println!("replayed {} as task {} on queue {}", task_id, task.id, task.queue);
            }
            DlqCommand::Delete { task_id } => {
                if client.delete_dead_letter(task_id).await? {
                    println!("deleted {task_id}");
                } else {
                    return Err(std::io::Error::other(format!("no dead letter {task_id}")).into());
                }
            }
        },
        Command::List(args) => {
            let state = match args.state.as_deref() {
                Some(s) => Some(
                    ExecutionState::parse(s)
                        .ok_or_else(|| std::io::Error::other(format!("unknown state: {s}")))?,
                ),
                None => None,
            };
            let executions = client.list_executions(state, args.limit).await?;
            if executions.is_empty() {
                println!("no executions found");
                return Ok(());
            }
            let now = now_ms();
            println!("{:<36}  {:<10} {:<12} {}", "execution_id", "state", "started", "step");
            for exc in executions {
                println!(
                    "{:<36}  {:<10} {:<12} {}",
                    exc.id,
                    exc.state.as_str(),
                    fmt_age(now, exc.created_at),
                    exc.step_name,
                );
            }
        }
        Command::Show { execution_id } => {
            let view = client.state_of(execution_id).await?;
            println!("execution_id: {}", view.execution.id);
            println!("step:         {}", view.execution.step_name);
            println!("state:        {}", view.execution.state);
            if let Some(error) = &view.execution.error {
                println!("error:        {error}");
            }
            if !view.counters.is_empty() {
                println!("counters:");
                let mut counters: Vec<_> = view.counters.iter().collect();
                counters.sort();
                for (name, value) in counters {
                    println!("  {name} = {value}");
                }
            }
            println!("tasks:");
            let now = now_ms();
            for task in client.list_tasks(execution_id).await? {
                println!(
                    "  [{}] {:<30} {:<10} attempt {}/{} ({})",
                    task.kind.as_str(),
                    task.step_name,
                    task.state.as_str(),
                    task.attempt,
                    task.max_attempts,
                    fmt_age(now, task.updated_at),
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
