//! Domain types shared by every backend of the scrape job queue.
//!
//! Nothing in this module performs I/O; it describes the shapes the
//! Dispatcher, Worker API, Waiter API, and Group Manager agree on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a [`Job`].
///
/// `Backlog` is a pre-queue holding state for jobs subject to team-level
/// admission control; it is never observed by the Dispatcher directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Active,
    Completed,
    Failed,
    Backlog,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "queued",
            Status::Active => "active",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Backlog => "backlog",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Status {
    type Err = crate::error::QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Status::Queued),
            "active" => Ok(Status::Active),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            "backlog" => Ok(Status::Backlog),
            other => Err(crate::error::QueueError::Decode(format!(
                "unknown job status {other:?}"
            ))),
        }
    }
}

/// A single unit of scrape work.
///
/// Invariants: `status = active` implies a non-null `lock`;
/// `status` in `{completed, failed}` implies a null `lock` and a set
/// `finished_at`; terminal states are monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: Status,
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

/// Reason string stamped on jobs failed in bulk by [`crate::traits::GroupManager::cancel_group`].
pub const CANCELLED_REASON: &str = "CANCELLED";

/// Reason string stamped on jobs force-failed because `times_out_at` passed
/// before the job reached a terminal state.
pub const TIMED_OUT_REASON: &str = "TIMEOUT";

/// Input to `AddJob`/`AddJobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub id: Uuid,
    pub data: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    pub owner_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub listen_channel_id: Option<String>,
    pub times_out_at: Option<DateTime<Utc>>,
    /// When true, the job is inserted into `jobs_backlog` with `status = backlog`
    /// instead of `jobs` with `status = queued`.
    #[serde(default)]
    pub pending_admission: bool,
}

/// Lifecycle state of a [`Group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Active,
    Completed,
    Cancelled,
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GroupStatus::Active => "active",
            GroupStatus::Completed => "completed",
            GroupStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for GroupStatus {
    type Err = crate::error::QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(GroupStatus::Active),
            "completed" => Ok(GroupStatus::Completed),
            "cancelled" => Ok(GroupStatus::Cancelled),
            other => Err(crate::error::QueueError::Decode(format!(
                "unknown group status {other:?}"
            ))),
        }
    }
}

/// A logical batch of related jobs (typically one crawl).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub status: GroupStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub owner_id: Uuid,
    pub ttl_ms: i64,
}

/// A per-queue concurrency cap to install for a new [`Group`].
///
/// `queue_name` lets `AddGroup` be called once for a crawl that fans out
/// across sibling queues (e.g. the billing/index/webhook side-queues
/// mentioned above); a given `Queue` instance only materializes the
/// setting whose `queue_name` matches its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConcurrencySetting {
    pub queue_name: String,
    pub max_concurrency: Option<i32>,
}

/// Per-owner live concurrency counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerConcurrency {
    pub id: Uuid,
    pub max_concurrency: Option<i32>,
    pub current_concurrency: i32,
}

/// Per-group live concurrency counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupConcurrency {
    pub id: Uuid,
    pub max_concurrency: Option<i32>,
    pub current_concurrency: i32,
}

/// Terminal outcome delivered to a waiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobOutcome {
    Completed(serde_json::Value),
    Failed(String),
}

/// Wakeup payload carried by the DB notify channel or the bus completion subject.
///
/// This is only a signal: the listener re-reads the row to
/// obtain the actual result or failure reason. `listen_channel_id` is the
/// producer-chosen routing key; a bus-backed [`crate::traits::PrefetchBridge`]
/// uses it to address the subject the waiting process subscribed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionNotice {
    pub job_id: Uuid,
    pub terminal_status: Status,
    pub listen_channel_id: Option<String>,
}
