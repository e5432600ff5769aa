//! Command-line producer against a running queue: submit jobs and groups,
//! inspect them, and block on completion.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use queue_core::{GroupConcurrencySetting, NewJob};
use queue_postgres::Queue;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "producer-cli", about = "Submit and wait on scrape jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Insert a new job with the given JSON payload.
    AddJob {
        #[arg(long)]
        data: String,
        #[arg(long)]
        owner: Option<Uuid>,
        #[arg(long)]
        group: Option<Uuid>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Create a group for a batch of related jobs.
    AddGroup {
        #[arg(long)]
        owner: Uuid,
        #[arg(long, default_value_t = 300_000)]
        ttl_ms: i64,
        #[arg(long)]
        max_concurrency: Option<i32>,
    },
    /// Cancel a group's queued jobs; running jobs finish normally.
    CancelGroup { id: Uuid },
    /// Print a job's current row.
    GetJob { id: Uuid },
    /// Block until a job reaches a terminal state.
    Wait {
        id: Uuid,
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let queue = Queue::from_env(None)
        .await
        .context("connecting to the queue")?;

    match cli.command {
        Command::AddJob {
            data,
            owner,
            group,
            priority,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&data).context("parsing --data as JSON")?;
            let job = queue
                .submitter()
                .add_job(NewJob {
                    id: Uuid::new_v4(),
                    data: payload,
                    priority,
                    owner_id: owner,
                    group_id: group,
                    listen_channel_id: None,
                    times_out_at: None,
                    pending_admission: false,
                })
                .await?;
            println!("{}", job.id);
        }
        Command::AddGroup {
            owner,
            ttl_ms,
            max_concurrency,
        } => {
            let group = queue
                .groups()
                .add_group(
                    Uuid::new_v4(),
                    owner,
                    ttl_ms,
                    vec![GroupConcurrencySetting {
                        queue_name: "scrape".to_string(),
                        max_concurrency,
                    }],
                )
                .await?;
            println!("{}", group.id);
        }
        Command::CancelGroup { id } => {
            let cancelled = queue.groups().cancel_group(id).await?;
            if !cancelled {
                anyhow::bail!("group {id} was not active");
            }
        }
        Command::GetJob { id } => {
            let job = queue
                .submitter()
                .get_job(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no such job {id}"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Wait { id, timeout_ms } => {
            let result = queue
                .waiter()
                .wait_for_job(id, Duration::from_millis(timeout_ms))
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
