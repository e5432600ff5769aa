//! Worker API: the surface a scrape worker process calls
//! directly once it holds a job.

use std::sync::Arc;

use queue_core::{CompletionNotice, Job, PrefetchBridge, QueueResult, WorkerApi as WorkerApiTrait};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::dispatcher::PgDispatcher;
use crate::qe;
use crate::store::{JobRow, JOB_COLUMNS};

pub struct PgWorkerApi {
    pool: PgPool,
    dispatcher: Arc<PgDispatcher>,
    bridge: Option<Arc<dyn PrefetchBridge>>,
}

impl PgWorkerApi {
    pub fn new(
        pool: PgPool,
        dispatcher: Arc<PgDispatcher>,
        bridge: Option<Arc<dyn PrefetchBridge>>,
    ) -> Self {
        Self {
            pool,
            dispatcher,
            bridge,
        }
    }

    async fn finish_transition(
        &self,
        job_id: Uuid,
        lock: Uuid,
        new_status: &str,
        return_value: Option<Value>,
        failed_reason: Option<String>,
    ) -> QueueResult<bool> {
        let sql = format!(
            r#"
            WITH updated AS (
                UPDATE jobs j
                SET status = $3::job_status, finished_at = now(), lock = NULL,
                    locked_at = NULL, return_value = $4, failed_reason = $5
                WHERE j.id = $1 AND j.lock = $2 AND j.status = 'active'
                RETURNING {JOB_COLUMNS}
            ),
            owner_bump AS (
                UPDATE owner_concurrency oc
                SET current_concurrency = GREATEST(0, current_concurrency - 1)
                FROM updated
                WHERE oc.id = updated.owner_id
                RETURNING 1
            ),
            group_bump AS (
                UPDATE group_concurrency gc
                SET current_concurrency = GREATEST(0, current_concurrency - 1)
                FROM updated
                WHERE gc.id = updated.group_id
                RETURNING 1
            ),
            notified AS (
                SELECT pg_notify(
                    'queue_job_' || updated.listen_channel_id,
                    updated.id::text || '|' || updated.status::text
                ) AS notify_result
                FROM updated
                WHERE updated.listen_channel_id IS NOT NULL
            )
            SELECT {JOB_COLUMNS}, (SELECT count(*) FROM notified) AS notified_count FROM updated
            "#
        );

        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_id)
            .bind(lock)
            .bind(new_status)
            .bind(&return_value)
            .bind(&failed_reason)
            .fetch_optional(&self.pool)
            .await
            .map_err(qe)?;

        match row {
            None => Ok(false),
            Some(row) => {
                let job: Job = row.into();
                if let Some(bridge) = &self.bridge {
                    let notice = CompletionNotice {
                        job_id: job.id,
                        terminal_status: job.status,
                        listen_channel_id: job.listen_channel_id.clone(),
                    };
                    if let Err(err) = bridge.publish_completion(notice).await {
                        tracing::warn!(job_id = %job.id, error = %err, "completion publish failed");
                    }
                }
                Ok(true)
            }
        }
    }
}

#[async_trait::async_trait]
impl WorkerApiTrait for PgWorkerApi {
    async fn get_job_to_process(&self) -> QueueResult<Option<Job>> {
        if let Some(bridge) = &self.bridge {
            if let Some(job) = bridge.try_receive_job().await? {
                return Ok(Some(job));
            }
        }
        self.dispatcher.get_job_to_process().await
    }

    async fn renew_lock(&self, job_id: Uuid, lock: Uuid) -> QueueResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET locked_at = now() WHERE id = $1 AND lock = $2 AND status = 'active'",
        )
        .bind(job_id)
        .bind(lock)
        .execute(&self.pool)
        .await
        .map_err(qe)?;
        Ok(result.rows_affected() == 1)
    }

    async fn job_finish(&self, job_id: Uuid, lock: Uuid, return_value: Value) -> QueueResult<bool> {
        self.finish_transition(job_id, lock, "completed", Some(return_value), None)
            .await
    }

    async fn job_fail(&self, job_id: Uuid, lock: Uuid, failed_reason: String) -> QueueResult<bool> {
        self.finish_transition(job_id, lock, "failed", None, Some(failed_reason))
            .await
    }
}
