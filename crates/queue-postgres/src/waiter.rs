//! Waiter API: lets producers block on a job reaching a
//! terminal state, in either poll or listen mode.

use std::sync::Arc;
use std::time::Duration;

use queue_core::{PrefetchBridge, QueueError, QueueResult, Status, WaiterApi as WaiterApiTrait};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::qe;
use crate::session::ListenerSession;
use crate::store::JobRow;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct PgWaiterApi {
    pool: PgPool,
    session: Option<Arc<ListenerSession>>,
    /// Used only when `session` is `None` and a bus is configured, rides the
    /// Prefetch Bridge's completion channel instead of `LISTEN`/`NOTIFY`.
    bridge: Option<Arc<dyn PrefetchBridge>>,
}

impl PgWaiterApi {
    pub fn new(
        pool: PgPool,
        session: Option<Arc<ListenerSession>>,
        bridge: Option<Arc<dyn PrefetchBridge>>,
    ) -> Self {
        Self {
            pool,
            session,
            bridge,
        }
    }

    async fn read_job(&self, job_id: Uuid) -> QueueResult<Option<JobRow>> {
        sqlx::query_as(&format!(
            "SELECT {} FROM jobs WHERE id = $1",
            crate::store::JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(qe)
    }

    fn terminal_outcome(row: JobRow) -> Option<QueueResult<Value>> {
        match Status::from(row.status) {
            Status::Completed => Some(Ok(row.return_value.unwrap_or(Value::Null))),
            Status::Failed => Some(Err(QueueError::Failed(
                row.id,
                row.failed_reason.unwrap_or_default(),
            ))),
            _ => None,
        }
    }

    async fn poll_for_job(&self, job_id: Uuid, timeout: Duration) -> QueueResult<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(row) = self.read_job(job_id).await? {
                if let Some(outcome) = Self::terminal_outcome(row) {
                    return outcome;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(QueueError::Timeout(job_id));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(remaining.min(POLL_INTERVAL)).await;
        }
    }

    async fn listen_for_job(
        &self,
        session: &Arc<ListenerSession>,
        job_id: Uuid,
        timeout: Duration,
    ) -> QueueResult<Value> {
        let rx = session.register(job_id);

        // Re-read after registering: a completion racing the registration
        // would otherwise never reach this waiter.
        if let Some(row) = self.read_job(job_id).await? {
            if let Some(outcome) = Self::terminal_outcome(row) {
                session.cancel(job_id);
                return outcome;
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(_notice)) => match self.read_job(job_id).await? {
                Some(row) => match Self::terminal_outcome(row) {
                    Some(outcome) => outcome,
                    None => Err(QueueError::Timeout(job_id)),
                },
                None => Err(QueueError::Timeout(job_id)),
            },
            Ok(Err(_recv_error)) => {
                // Sender dropped without sending, fall back to a single
                // poll rather than declaring the wait failed outright.
                self.poll_for_job(job_id, Duration::ZERO).await
            }
            Err(_elapsed) => {
                session.cancel(job_id);
                // The job may have completed on a channel this session never
                // saw (e.g. `listen_channel_id` pointed elsewhere); check
                // once more before reporting a timeout.
                match self.read_job(job_id).await? {
                    Some(row) => Self::terminal_outcome(row).unwrap_or(Err(QueueError::Timeout(job_id))),
                    None => Err(QueueError::Timeout(job_id)),
                }
            }
        }
    }

    /// Symmetric with [`PgWaiterApi::listen_for_job`] but wakes off the bus
    /// completion channel instead of a DB `LISTEN` connection.
    async fn listen_for_job_bus(
        &self,
        bridge: &Arc<dyn PrefetchBridge>,
        job_id: Uuid,
        timeout: Duration,
    ) -> QueueResult<Value> {
        let Some(rx) = bridge.register_wait(job_id) else {
            return self.poll_for_job(job_id, timeout).await;
        };

        if let Some(row) = self.read_job(job_id).await? {
            if let Some(outcome) = Self::terminal_outcome(row) {
                bridge.cancel_wait(job_id);
                return outcome;
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(_notice)) => match self.read_job(job_id).await? {
                Some(row) => match Self::terminal_outcome(row) {
                    Some(outcome) => outcome,
                    None => Err(QueueError::Timeout(job_id)),
                },
                None => Err(QueueError::Timeout(job_id)),
            },
            Ok(Err(_recv_error)) => self.poll_for_job(job_id, Duration::ZERO).await,
            Err(_elapsed) => {
                bridge.cancel_wait(job_id);
                match self.read_job(job_id).await? {
                    Some(row) => Self::terminal_outcome(row).unwrap_or(Err(QueueError::Timeout(job_id))),
                    None => Err(QueueError::Timeout(job_id)),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl WaiterApiTrait for PgWaiterApi {
    async fn wait_for_job(&self, job_id: Uuid, timeout: Duration) -> QueueResult<Value> {
        match (&self.session, &self.bridge) {
            (Some(session), _) => self.listen_for_job(session, job_id, timeout).await,
            (None, Some(bridge)) => self.listen_for_job_bus(bridge, job_id, timeout).await,
            (None, None) => self.poll_for_job(job_id, timeout).await,
        }
    }
}
