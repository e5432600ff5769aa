//! Row shapes and Postgres enum mappings for the Durable Store.
//!
//! `queue-core`'s domain types stay sqlx-free; this module is the seam that
//! translates between them and the `job_status`/`group_status` columns.

use chrono::{DateTime, Utc};
use queue_core::{Group, GroupStatus, Job, Status};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum DbStatus {
    Queued,
    Active,
    Completed,
    Failed,
    Backlog,
}

impl From<DbStatus> for Status {
    fn from(v: DbStatus) -> Self {
        match v {
            DbStatus::Queued => Status::Queued,
            DbStatus::Active => Status::Active,
            DbStatus::Completed => Status::Completed,
            DbStatus::Failed => Status::Failed,
            DbStatus::Backlog => Status::Backlog,
        }
    }
}

impl From<Status> for DbStatus {
    fn from(v: Status) -> Self {
        match v {
            Status::Queued => DbStatus::Queued,
            Status::Active => DbStatus::Active,
            Status::Completed => DbStatus::Completed,
            Status::Failed => DbStatus::Failed,
            Status::Backlog => DbStatus::Backlog,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "group_status", rename_all = "snake_case")]
pub enum DbGroupStatus {
    Active,
    Completed,
    Cancelled,
}

impl From<DbGroupStatus> for GroupStatus {
    fn from(v: DbGroupStatus) -> Self {
        match v {
            DbGroupStatus::Active => GroupStatus::Active,
            DbGroupStatus::Completed => GroupStatus::Completed,
            DbGroupStatus::Cancelled => GroupStatus::Cancelled,
        }
    }
}

/// Row shape shared by `jobs` and `jobs_backlog`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub status: DbStatus,
    pub priority: i32,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub return_value: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub lock: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    pub owner_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub listen_channel_id: Option<String>,
    pub times_out_at: Option<DateTime<Utc>>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            status: row.status.into(),
            priority: row.priority,
            data: row.data,
            created_at: row.created_at,
            finished_at: row.finished_at,
            return_value: row.return_value,
            failed_reason: row.failed_reason,
            lock: row.lock,
            locked_at: row.locked_at,
            owner_id: row.owner_id,
            group_id: row.group_id,
            listen_channel_id: row.listen_channel_id,
            times_out_at: row.times_out_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupRow {
    pub id: Uuid,
    pub status: DbGroupStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub owner_id: Uuid,
    pub ttl_ms: i64,
}

impl From<GroupRow> for Group {
    fn from(row: GroupRow) -> Self {
        Group {
            id: row.id,
            status: row.status.into(),
            created_at: row.created_at,
            finished_at: row.finished_at,
            expires_at: row.expires_at,
            owner_id: row.owner_id,
            ttl_ms: row.ttl_ms,
        }
    }
}

pub const JOB_COLUMNS: &str = "id, status, priority, data, created_at, finished_at, \
    return_value, failed_reason, lock, locked_at, owner_id, group_id, listen_channel_id, times_out_at";

/// Same columns, qualified with the `j` alias. `UPDATE ... FROM` statements
/// that join the jobs table against a same-named CTE (both expose an `id`
/// column) need this in their `RETURNING` list to avoid an ambiguous
/// column reference.
pub const JOB_COLUMNS_J: &str = "j.id, j.status, j.priority, j.data, j.created_at, j.finished_at, \
    j.return_value, j.failed_reason, j.lock, j.locked_at, j.owner_id, j.group_id, j.listen_channel_id, j.times_out_at";
