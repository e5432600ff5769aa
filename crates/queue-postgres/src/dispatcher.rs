//! Dispatcher: flips `queued` rows to `active` under a fresh
//! lock token, respecting whatever [`ConcurrencyLimit`] mode is configured.

use std::sync::Arc;

use queue_core::{ConcurrencyLimit, Dispatcher as DispatcherTrait, Job, PrefetchBridge, QueueConfig, QueueResult};
use sqlx::PgPool;
use uuid::Uuid;

use crate::accountant::{self, PartitionCandidate};
use crate::qe;
use crate::store::{JobRow, JOB_COLUMNS, JOB_COLUMNS_J};

pub struct PgDispatcher {
    pool: PgPool,
    config: QueueConfig,
    /// Best-effort fan-out to the optional bus. A publish failure here must
    /// never undo or fail the dispatch that produced the job.
    bridge: Option<Arc<dyn PrefetchBridge>>,
}

impl PgDispatcher {
    pub fn new(pool: PgPool, config: QueueConfig, bridge: Option<Arc<dyn PrefetchBridge>>) -> Self {
        Self { pool, config, bridge }
    }

    /// Partition key used for the advisory lock: hashed so NULL owner/group
    /// still produces a stable, distinct lock id from any concrete job.
    fn partition_lock_key(owner_id: Option<Uuid>, group_id: Option<Uuid>) -> String {
        format!(
            "queue-dispatch:{}:{}",
            owner_id.map(|u| u.to_string()).unwrap_or_else(|| "*".into()),
            group_id.map(|u| u.to_string()).unwrap_or_else(|| "*".into()),
        )
    }

    async fn claim_partition(
        &self,
        partition: PartitionCandidate,
        limit: i64,
    ) -> Result<Vec<Job>, sqlx::Error> {
        if limit <= 0 {
            return Ok(vec![]);
        }
        let lock_key = Self::partition_lock_key(partition.owner_id, partition.group_id);

        let sql = format!(
            r#"
            WITH lock_acquired AS (
                SELECT pg_try_advisory_xact_lock(hashtext($1)) AS ok
            ),
            claimable AS (
                SELECT j.id
                FROM jobs j, lock_acquired
                WHERE lock_acquired.ok
                  AND j.status = 'queued'
                  AND j.owner_id IS NOT DISTINCT FROM $2
                  AND j.group_id IS NOT DISTINCT FROM $3
                ORDER BY j.priority ASC, j.created_at ASC, j.id ASC
                LIMIT $4
                FOR UPDATE OF j SKIP LOCKED
            ),
            dispatched AS (
                UPDATE jobs j
                SET status = 'active', lock = gen_random_uuid(), locked_at = now()
                FROM claimable
                WHERE j.id = claimable.id
                RETURNING {JOB_COLUMNS_J}
            ),
            owner_bump AS (
                UPDATE owner_concurrency oc
                SET current_concurrency = current_concurrency + (SELECT count(*) FROM dispatched)
                WHERE oc.id = $2 AND (SELECT count(*) FROM dispatched) > 0
                RETURNING 1
            ),
            group_bump AS (
                UPDATE group_concurrency gc
                SET current_concurrency = current_concurrency + (SELECT count(*) FROM dispatched)
                WHERE gc.id = $3 AND (SELECT count(*) FROM dispatched) > 0
                RETURNING 1
            )
            SELECT {JOB_COLUMNS} FROM dispatched
            "#
        );

        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(&lock_key)
            .bind(partition.owner_id)
            .bind(partition.group_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn publish_best_effort(&self, job: &Job) {
        if let Some(bridge) = &self.bridge {
            if let Err(err) = bridge.publish_job(job).await {
                tracing::warn!(job_id = %job.id, error = %err, "prefetch bridge publish failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl DispatcherTrait for PgDispatcher {
    async fn prefetch_jobs(&self) -> QueueResult<usize> {
        accountant::self_heal_owner_rows(&self.pool, "jobs").await.map_err(qe)?;
        let partitions =
            accountant::candidate_partitions(&self.pool, self.config.concurrency_limit, "jobs")
                .await
                .map_err(qe)?;

        let mut remaining_budget = self.config.prefetch_batch;
        let mut dispatched_total = 0usize;

        for partition in partitions {
            if remaining_budget <= 0 {
                break;
            }
            let take = partition.slots.min(remaining_budget);
            if take <= 0 {
                continue;
            }
            let jobs = self.claim_partition(partition, take).await.map_err(qe)?;
            remaining_budget -= jobs.len() as i64;
            dispatched_total += jobs.len();
            for job in &jobs {
                self.publish_best_effort(job).await;
            }
        }

        Ok(dispatched_total)
    }

    async fn get_job_to_process(&self) -> QueueResult<Option<Job>> {
        accountant::self_heal_owner_rows(&self.pool, "jobs").await.map_err(qe)?;

        let job = match self.config.concurrency_limit {
            ConcurrencyLimit::Off => {
                let row: Option<JobRow> = sqlx::query_as(&format!(
                    r#"
                    WITH claimable AS (
                        SELECT j.id FROM jobs j
                        WHERE j.status = 'queued'
                        ORDER BY j.priority ASC, j.created_at ASC, j.id ASC
                        LIMIT 1
                        FOR UPDATE OF j SKIP LOCKED
                    ),
                    dispatched AS (
                        UPDATE jobs j
                        SET status = 'active', lock = gen_random_uuid(), locked_at = now()
                        FROM claimable
                        WHERE j.id = claimable.id
                        RETURNING {JOB_COLUMNS_J}
                    )
                    SELECT {JOB_COLUMNS} FROM dispatched
                    "#
                ))
                .fetch_optional(&self.pool)
                .await
                .map_err(qe)?;
                row.map(Job::from)
            }
            // PerOwner / PerOwnerPerGroup: a single-job claim still touches
            // an owner's (or group's) concurrency counter, so it needs the
            // same per-partition advisory lock `claim_partition` uses,
            // otherwise two concurrent callers can both read the same
            // under-the-cap snapshot and both claim a slot. Reuse
            // `claim_partition` itself rather than duplicate the gate.
            ConcurrencyLimit::PerOwner | ConcurrencyLimit::PerOwnerPerGroup => {
                let partitions = accountant::candidate_partitions(
                    &self.pool,
                    self.config.concurrency_limit,
                    "jobs",
                )
                .await
                .map_err(qe)?;

                let mut claimed = None;
                for partition in partitions {
                    if partition.slots <= 0 {
                        continue;
                    }
                    let mut jobs = self.claim_partition(partition, 1).await.map_err(qe)?;
                    if let Some(job) = jobs.pop() {
                        claimed = Some(job);
                        break;
                    }
                }
                claimed
            }
        };

        // This method is the Worker API's own non-bus fallback, not the
        // prefetch path: the job it returns already belongs to the caller,
        // and publishing it to the bus here would let a second worker pull
        // the same (job, lock) pair off `.prefetch` and believe it owns the
        // job too. Only `prefetch_jobs` publishes.
        Ok(job)
    }

    async fn promote_backlog(&self, limit: i64) -> QueueResult<usize> {
        if limit <= 0 {
            return Ok(0);
        }
        let sql = format!(
            r#"
            WITH promoted AS (
                DELETE FROM jobs_backlog
                WHERE id IN (
                    SELECT id FROM jobs_backlog
                    ORDER BY priority ASC, created_at ASC, id ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING {JOB_COLUMNS}
            )
            INSERT INTO jobs ({JOB_COLUMNS})
            SELECT id, 'queued', priority, data, created_at, finished_at,
                   return_value, failed_reason, lock, locked_at, owner_id,
                   group_id, listen_channel_id, times_out_at
            FROM promoted
            "#
        );
        let result = sqlx::query(&sql)
            .bind(limit)
            .execute(&self.pool)
            .await
            .map_err(qe)?;
        Ok(result.rows_affected() as usize)
    }
}
