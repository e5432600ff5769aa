//! Lease reaper: reclaims `active` jobs whose lock expired
//! without a `RenewLock`, `JobFinish`, or `JobFail` call, a crashed or
//! partitioned worker otherwise holds its slot forever. Also force-fails
//! `active`/`backlog` jobs whose own `times_out_at` deadline has passed,
//! independent of lease state.

use std::sync::Arc;

use queue_core::{CompletionNotice, PrefetchBridge, Status};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::{Duration as TokioDuration, MissedTickBehavior};
use uuid::Uuid;

/// One reclaim pass. Returns the number of jobs flipped back to `queued`.
pub async fn reap_expired_leases(pool: &PgPool, lease_ttl_ms: i64) -> Result<usize, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        WITH expired AS (
            SELECT id FROM jobs
            WHERE status = 'active' AND locked_at < now() - ($1 * interval '1 millisecond')
            FOR UPDATE SKIP LOCKED
        ),
        reclaimed AS (
            UPDATE jobs j
            SET status = 'queued', lock = NULL, locked_at = NULL
            FROM expired
            WHERE j.id = expired.id
            RETURNING j.owner_id, j.group_id
        ),
        owner_counts AS (
            SELECT owner_id, count(*) AS cnt FROM reclaimed
            WHERE owner_id IS NOT NULL GROUP BY owner_id
        ),
        group_counts AS (
            SELECT group_id, count(*) AS cnt FROM reclaimed
            WHERE group_id IS NOT NULL GROUP BY group_id
        ),
        owner_bump AS (
            UPDATE owner_concurrency oc
            SET current_concurrency = GREATEST(0, current_concurrency - owner_counts.cnt)
            FROM owner_counts
            WHERE oc.id = owner_counts.owner_id
            RETURNING 1
        ),
        group_bump AS (
            UPDATE group_concurrency gc
            SET current_concurrency = GREATEST(0, current_concurrency - group_counts.cnt)
            FROM group_counts
            WHERE gc.id = group_counts.group_id
            RETURNING 1
        )
        SELECT count(*) FROM reclaimed
        "#,
    )
    .bind(lease_ttl_ms)
    .fetch_one(pool)
    .await?;

    Ok(count as usize)
}

/// A job force-failed by [`reap_timed_out_jobs`], carried out far enough to
/// let the caller fan the completion out over a bus.
#[derive(Debug, sqlx::FromRow)]
pub struct TimedOutJob {
    pub job_id: Uuid,
    pub listen_channel_id: Option<String>,
}

/// Force-fails `active` and `backlog` rows whose `times_out_at` has passed,
/// regardless of lease state, a job can time out well before its lease
/// would ever expire. `active` rows release their owner/group concurrency
/// slot; `backlog` rows hold none to release. Both kinds pg_notify their DB
/// listen channel so a cooperating `WaitForJob` wakes up immediately.
pub async fn reap_timed_out_jobs(pool: &PgPool) -> Result<Vec<TimedOutJob>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        WITH active_timed_out AS (
            SELECT id FROM jobs
            WHERE status = 'active' AND times_out_at < now()
            FOR UPDATE SKIP LOCKED
        ),
        failed_active AS (
            UPDATE jobs j
            SET status = 'failed', finished_at = now(), lock = NULL, locked_at = NULL,
                failed_reason = '{TIMED_OUT_REASON}'
            FROM active_timed_out
            WHERE j.id = active_timed_out.id
            RETURNING j.id, j.owner_id, j.group_id, j.listen_channel_id
        ),
        owner_counts AS (
            SELECT owner_id, count(*) AS cnt FROM failed_active
            WHERE owner_id IS NOT NULL GROUP BY owner_id
        ),
        group_counts AS (
            SELECT group_id, count(*) AS cnt FROM failed_active
            WHERE group_id IS NOT NULL GROUP BY group_id
        ),
        owner_bump AS (
            UPDATE owner_concurrency oc
            SET current_concurrency = GREATEST(0, current_concurrency - owner_counts.cnt)
            FROM owner_counts
            WHERE oc.id = owner_counts.owner_id
            RETURNING 1
        ),
        group_bump AS (
            UPDATE group_concurrency gc
            SET current_concurrency = GREATEST(0, current_concurrency - group_counts.cnt)
            FROM group_counts
            WHERE gc.id = group_counts.group_id
            RETURNING 1
        ),
        failed_backlog AS (
            UPDATE jobs_backlog
            SET status = 'failed', finished_at = now(), failed_reason = '{TIMED_OUT_REASON}'
            WHERE status = 'backlog' AND times_out_at < now()
            RETURNING id, listen_channel_id
        ),
        terminated AS (
            SELECT id, listen_channel_id AS channel FROM failed_active
            UNION ALL
            SELECT id, listen_channel_id AS channel FROM failed_backlog
        ),
        notified AS (
            SELECT pg_notify('queue_job_' || channel, id::text || '|failed') AS notify_result
            FROM terminated
            WHERE channel IS NOT NULL
        )
        SELECT t.id AS job_id, t.channel AS listen_channel_id,
               (SELECT count(*) FROM notified) AS notified_count
        FROM terminated t
        "#,
        TIMED_OUT_REASON = queue_core::TIMED_OUT_REASON,
    ))
    .fetch_all(pool)
    .await
}

/// Runs [`reap_expired_leases`] and [`reap_timed_out_jobs`] on a fixed
/// interval until `shutdown_rx` fires. The interval is a quarter of the
/// lease TTL, floored at one second, so a lease rarely outlives its nominal
/// TTL by more than that.
pub async fn run(
    pool: PgPool,
    lease_ttl_ms: i64,
    bridge: Option<Arc<dyn PrefetchBridge>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let tick_ms = (lease_ttl_ms / 4).max(1_000) as u64;
    let mut ticker = tokio::time::interval(TokioDuration::from_millis(tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match reap_expired_leases(&pool, lease_ttl_ms).await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(reclaimed = n, "reaped expired leases"),
                    Err(err) => tracing::warn!(error = %err, "lease reap failed"),
                }

                match reap_timed_out_jobs(&pool).await {
                    Ok(timed_out) if timed_out.is_empty() => {}
                    Ok(timed_out) => {
                        tracing::debug!(count = timed_out.len(), "force-failed timed-out jobs");
                        if let Some(bridge) = &bridge {
                            for job in timed_out {
                                if job.listen_channel_id.is_none() {
                                    continue;
                                }
                                let notice = CompletionNotice {
                                    job_id: job.job_id,
                                    terminal_status: Status::Failed,
                                    listen_channel_id: job.listen_channel_id,
                                };
                                if let Err(err) = bridge.publish_completion(notice).await {
                                    tracing::warn!(error = %err, "completion publish failed for timed-out job");
                                }
                            }
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "times_out_at reap failed"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}
