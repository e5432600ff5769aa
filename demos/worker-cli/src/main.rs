//! Worker-loop CLI: claims jobs, "processes" them, and reports the outcome.
//!
//! Wires in the NATS Prefetch Bridge automatically when `QUEUE_BUS_URL` is
//! set; otherwise the Dispatcher's own CTE-based claim is the only path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use queue_core::{PrefetchBridge, QueueConfig};
use queue_postgres::Queue;

#[derive(Parser)]
#[command(name = "worker-cli", about = "Run a worker loop against the queue")]
struct Cli {
    /// Exit after this many jobs instead of running forever.
    #[arg(long)]
    limit: Option<u64>,
    /// Poll interval when the queue is empty.
    #[arg(long, default_value_t = 500)]
    idle_poll_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = QueueConfig::from_env().context("loading queue configuration")?;
    let bridge: Option<Arc<dyn PrefetchBridge>> = match &config.bus_url {
        Some(bus_url) => {
            let bridge = queue_nats::NatsBridge::connect(bus_url, &config.queue_name, &config.channel_id)
                .await
                .context("connecting to the prefetch bus")?;
            Some(Arc::new(bridge))
        }
        None => None,
    };

    let queue = Queue::connect(config, bridge)
        .await
        .context("connecting to the queue")?;

    let mut processed = 0u64;
    loop {
        if cli.limit.is_some_and(|limit| processed >= limit) {
            break;
        }

        match queue.worker().get_job_to_process().await? {
            Some(job) => {
                tracing::info!(job_id = %job.id, "claimed job");
                let lock = job.lock.expect("a claimed job always carries a lock");

                // Real scrape work can run well past the lease TTL; keep the
                // lock alive with a background renewal while it runs, and
                // stop renewing the moment the job itself is done.
                let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
                let renew_worker = queue.worker();
                let renew_job_id = job.id;
                let renewal = tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(15)) => {
                                if !renew_worker.renew_lock(renew_job_id, lock).await.unwrap_or(false) {
                                    tracing::warn!(job_id = %renew_job_id, "lease renewal rejected, abandoning");
                                    return;
                                }
                            }
                            _ = stop_rx.changed() => return,
                        }
                    }
                });

                let outcome = run_job(&job.data);
                let finished = match outcome {
                    Ok(return_value) => {
                        queue
                            .worker()
                            .job_finish(job.id, lock, return_value)
                            .await?
                    }
                    Err(reason) => queue.worker().job_fail(job.id, lock, reason).await?,
                };
                let _ = stop_tx.send(true);
                renewal.abort();
                if !finished {
                    tracing::warn!(job_id = %job.id, "lock expired before the result could be recorded");
                }
                processed += 1;
            }
            None => tokio::time::sleep(Duration::from_millis(cli.idle_poll_ms)).await,
        }
    }

    queue.shutdown();
    Ok(())
}

/// Stand-in for real scrape work: echoes the job payload back as the result.
/// A production worker would dispatch on `data`'s shape and perform the
/// actual fetch here.
fn run_job(data: &serde_json::Value) -> Result<serde_json::Value, String> {
    Ok(serde_json::json!({ "echo": data }))
}
