//! Group Manager: logical batches of jobs sharing an owner, a
//! TTL, and an optional per-group concurrency cap.

use chrono::{Duration as ChronoDuration, Utc};
use queue_core::{
    CANCELLED_REASON, Group, GroupConcurrencySetting, GroupManager as GroupManagerTrait,
    QueueResult,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::qe;
use crate::store::GroupRow;

pub struct PgGroupManager {
    pool: PgPool,
    queue_name: String,
}

impl PgGroupManager {
    pub fn new(pool: PgPool, queue_name: String) -> Self {
        Self { pool, queue_name }
    }

    /// Finds the cap that applies to this queue among the settings a caller
    /// may have supplied for several sibling queues at once.
    fn resolve_own_cap(&self, settings: &[GroupConcurrencySetting]) -> Option<Option<i32>> {
        settings
            .iter()
            .find(|s| s.queue_name == self.queue_name)
            .map(|s| s.max_concurrency)
    }

    /// Drops groups past their TTL with no active jobs left. Intended to be
    /// called periodically by the same background task that runs the lease
    /// expiry sweeper.
    pub async fn sweep_expired(&self) -> Result<usize, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE groups
            SET status = 'completed', finished_at = now()
            WHERE status = 'active'
              AND expires_at <= now()
              AND NOT EXISTS (
                  SELECT 1 FROM jobs WHERE jobs.group_id = groups.id AND jobs.status = 'active'
              )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait::async_trait]
impl GroupManagerTrait for PgGroupManager {
    async fn add_group(
        &self,
        id: Uuid,
        owner_id: Uuid,
        ttl_ms: i64,
        concurrency_settings: Vec<GroupConcurrencySetting>,
    ) -> QueueResult<Group> {
        let expires_at = Utc::now() + ChronoDuration::milliseconds(ttl_ms.max(0));
        let mut tx = self.pool.begin().await.map_err(qe)?;

        let row: GroupRow = sqlx::query_as(
            r#"
            INSERT INTO groups (id, status, expires_at, owner_id, ttl_ms)
            VALUES ($1, 'active', $2, $3, $4)
            RETURNING id, status, created_at, finished_at, expires_at, owner_id, ttl_ms
            "#,
        )
        .bind(id)
        .bind(expires_at)
        .bind(owner_id)
        .bind(ttl_ms)
        .fetch_one(&mut *tx)
        .await
        .map_err(qe)?;

        let own_cap = self.resolve_own_cap(&concurrency_settings);
        sqlx::query(
            "INSERT INTO group_concurrency (id, max_concurrency, current_concurrency) VALUES ($1, $2, 0)",
        )
        .bind(id)
        .bind(own_cap.flatten())
        .execute(&mut *tx)
        .await
        .map_err(qe)?;

        tx.commit().await.map_err(qe)?;
        Ok(row.into())
    }

    async fn get_group(&self, id: Uuid) -> QueueResult<Option<Group>> {
        let row: Option<GroupRow> = sqlx::query_as(
            "SELECT id, status, created_at, finished_at, expires_at, owner_id, ttl_ms FROM groups WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(qe)?;
        Ok(row.map(Into::into))
    }

    async fn get_ongoing_by_owner(&self, owner_id: Uuid) -> QueueResult<Vec<Group>> {
        let rows: Vec<GroupRow> = sqlx::query_as(
            "SELECT id, status, created_at, finished_at, expires_at, owner_id, ttl_ms \
             FROM groups WHERE owner_id = $1 AND status = 'active'",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(qe)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn cancel_group(&self, id: Uuid) -> QueueResult<bool> {
        let mut tx = self.pool.begin().await.map_err(qe)?;

        let result = sqlx::query(
            "UPDATE groups SET status = 'cancelled', finished_at = now() WHERE id = $1 AND status = 'active'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(qe)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(qe)?;
            return Ok(false);
        }

        // Notify in the same statement as the bulk fail, the way
        // `finish_transition`/`reap_timed_out_jobs` notify alongside their
        // own status flips, so a listen-mode `WaitForJob` on one of these
        // jobs wakes up immediately instead of only at its timeout.
        sqlx::query(
            r#"
            WITH failed AS (
                UPDATE jobs
                SET status = 'failed', failed_reason = $2, finished_at = now()
                WHERE group_id = $1 AND status = 'queued'
                RETURNING id, listen_channel_id
            )
            SELECT pg_notify('queue_job_' || listen_channel_id, id::text || '|failed')
            FROM failed
            WHERE listen_channel_id IS NOT NULL
            "#,
        )
        .bind(id)
        .bind(CANCELLED_REASON)
        .execute(&mut *tx)
        .await
        .map_err(qe)?;

        tx.commit().await.map_err(qe)?;
        Ok(true)
    }
}
