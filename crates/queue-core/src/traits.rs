//! Public trait surface shared by every backend.
//!
//! `queue-postgres` is the one concrete implementation in this workspace,
//! but the traits are the seam a second backend (or a test double) would
//! implement against.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueResult;
use crate::model::{Group, GroupConcurrencySetting, Job, NewJob};

/// Reads queued rows and flips them to `active` under a fresh lock token.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Best-effort batch dispatch of up to `prefetch_batch` newly-active jobs.
    /// Returns the number of jobs dispatched; never blocks on an empty queue.
    async fn prefetch_jobs(&self) -> QueueResult<usize>;

    /// Non-blocking batch-of-1 dispatch, used as the Worker API's fallback
    /// when no Prefetch Bridge delivers a job first.
    async fn get_job_to_process(&self) -> QueueResult<Option<Job>>;

    /// Promote up to `limit` `jobs_backlog` rows to `queued`, in the same
    /// `(priority, created_at, id)` order the main queue dispatches in.
    async fn promote_backlog(&self, limit: i64) -> QueueResult<usize>;
}

/// Operations a scrape worker process calls directly.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Acquire the next job, preferring the Prefetch Bridge and falling back
    /// to the Dispatcher's CTE selector.
    async fn get_job_to_process(&self) -> QueueResult<Option<Job>>;

    /// Extend a held lease. Returns `false` if the lock no longer matches
    /// (another dispatcher already reclaimed the job), not an error.
    async fn renew_lock(&self, job_id: Uuid, lock: Uuid) -> QueueResult<bool>;

    /// Atomically transition `active -> completed`, stamp `finished_at`,
    /// store `return_value`, decrement counters, and notify waiters.
    /// Returns `false` if `lock` no longer matches.
    async fn job_finish(&self, job_id: Uuid, lock: Uuid, return_value: Value) -> QueueResult<bool>;

    /// Symmetric with [`WorkerApi::job_finish`] for the `failed` transition.
    async fn job_fail(
        &self,
        job_id: Uuid,
        lock: Uuid,
        failed_reason: String,
    ) -> QueueResult<bool>;
}

/// Lets producers block on a job's terminal state.
#[async_trait]
pub trait WaiterApi: Send + Sync {
    /// Resolves with the job's `return_value` on `completed`, or
    /// [`crate::error::QueueError::Failed`] on `failed`, or
    /// [`crate::error::QueueError::Timeout`] if `timeout` elapses first.
    async fn wait_for_job(&self, job_id: Uuid, timeout: Duration) -> QueueResult<Value>;
}

/// Create, inspect, and cancel logical groups of jobs.
#[async_trait]
pub trait GroupManager: Send + Sync {
    async fn add_group(
        &self,
        id: Uuid,
        owner_id: Uuid,
        ttl_ms: i64,
        concurrency_settings: Vec<GroupConcurrencySetting>,
    ) -> QueueResult<Group>;

    async fn get_group(&self, id: Uuid) -> QueueResult<Option<Group>>;

    /// Active groups for an owner, used by the admission layer to prevent
    /// runaway parallel crawls.
    async fn get_ongoing_by_owner(&self, owner_id: Uuid) -> QueueResult<Vec<Group>>;

    /// Flip `active -> cancelled` and bulk-fail queued member jobs with
    /// reason `"CANCELLED"`. Active jobs are left to finish naturally.
    /// Returns `false` if the group was already non-active.
    async fn cancel_group(&self, id: Uuid) -> QueueResult<bool>;
}

/// Producer-facing job submission, independent of which component executes it.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn add_job(&self, job: NewJob) -> QueueResult<Job>;

    /// Like [`JobSubmitter::add_job`] but returns `Ok(None)` instead of a
    /// conflict error when `job.id` already exists.
    async fn try_add_job(&self, job: NewJob) -> QueueResult<Option<Job>>;

    async fn add_jobs(&self, jobs: Vec<NewJob>) -> QueueResult<Vec<Job>>;

    async fn get_job(&self, id: Uuid) -> QueueResult<Option<Job>>;
}

/// The optional message-bus tier that moves dispatched jobs to workers with
/// low latency and fans completion notices back out.
///
/// A Queue configured without a bus simply has no `PrefetchBridge`; the
/// Dispatcher's CTE path is always correct on its own.
#[async_trait]
pub trait PrefetchBridge: Send + Sync {
    /// Publish a freshly-dispatched job for workers to consume without
    /// polling the database. Best-effort: failure here must never fail the
    /// dispatch that produced `job`.
    async fn publish_job(&self, job: &Job) -> QueueResult<()>;

    /// Non-blocking attempt to receive one job the bridge already holds.
    async fn try_receive_job(&self) -> QueueResult<Option<Job>>;

    /// Publish a completion notice for `job_id` on this process's listen
    /// channel so a cooperating `WaitForJob` wakes up.
    async fn publish_completion(&self, notice: crate::model::CompletionNotice) -> QueueResult<()>;

    /// Registers interest in `job_id`'s completion on the bus channel, for a
    /// Waiter API that has no direct DB listen session of its own. Returns
    /// `None` when this bridge has no bus-based wait support, in which case
    /// the caller falls back to polling.
    fn register_wait(
        &self,
        _job_id: Uuid,
    ) -> Option<tokio::sync::oneshot::Receiver<crate::model::CompletionNotice>> {
        None
    }

    /// Withdraws a [`PrefetchBridge::register_wait`] registration, e.g. once
    /// a wait times out or resolves through another path.
    fn cancel_wait(&self, _job_id: Uuid) {}
}
