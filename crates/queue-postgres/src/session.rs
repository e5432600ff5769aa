//! Listener session: owns the `LISTEN`/`NOTIFY` connection a
//! process's Waiter API rides on, independent of the pooled connections used
//! for everything else.
//!
//! The state machine is `Disconnected -> Connecting -> Ready -> {Closing,
//! Disconnected}`. Shutdown is a single `tokio::sync::watch` fired once and
//! observed by the listen loop, rather than a recursive close handler.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use queue_core::{CompletionNotice, Job, Status};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::store::{JobRow, JOB_COLUMNS};

const RECONNECT_MIN: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(3);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
    Closing = 3,
}

impl From<u8> for SessionState {
    fn from(v: u8) -> Self {
        match v {
            1 => SessionState::Connecting,
            2 => SessionState::Ready,
            3 => SessionState::Closing,
            _ => SessionState::Disconnected,
        }
    }
}

/// A process-local registry of in-flight `WaitForJob` calls, woken by
/// notifications this session receives on its own channel.
pub struct ListenerSession {
    pool: PgPool,
    database_url: String,
    channel: String,
    state: AtomicU8,
    waiters: Arc<DashMap<Uuid, oneshot::Sender<CompletionNotice>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ListenerSession {
    /// Spawns the background listen loop and returns a handle. `channel_id`
    /// is this process's logical channel name; the Postgres
    /// channel itself is namespaced as `queue_job_<channel_id>`. `pool` is
    /// used only to re-read rows for [`ListenerSession::sweep_terminal_waiters`],
    /// never for the `LISTEN` connection itself (that needs its own
    /// dedicated connection, outside the pool).
    pub fn spawn(pool: PgPool, database_url: String, channel_id: &str) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Arc::new(Self {
            pool,
            database_url,
            channel: format!("queue_job_{channel_id}"),
            state: AtomicU8::new(SessionState::Disconnected as u8),
            waiters: Arc::new(DashMap::new()),
            shutdown_tx,
        });

        let task_session = session.clone();
        tokio::spawn(async move { task_session.run(shutdown_rx).await });

        session
    }

    pub fn state(&self) -> SessionState {
        self.state.load(Ordering::Acquire).into()
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Registers interest in `job_id`'s completion. Callers must re-read the
    /// job row after registering: a completion that lands
    /// between the caller's last read and this registration would otherwise
    /// be missed forever.
    pub fn register(&self, job_id: Uuid) -> oneshot::Receiver<CompletionNotice> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(job_id, tx);
        rx
    }

    pub fn cancel(&self, job_id: Uuid) {
        self.waiters.remove(&job_id);
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = RECONNECT_MIN;

        loop {
            if *shutdown_rx.borrow() {
                self.set_state(SessionState::Disconnected);
                return;
            }

            self.set_state(SessionState::Connecting);
            match PgListener::connect(&self.database_url).await {
                Ok(mut listener) => {
                    if listener.listen(&self.channel).await.is_err() {
                        self.set_state(SessionState::Disconnected);
                        if Self::backoff_or_shutdown(&mut backoff, &mut shutdown_rx).await {
                            return;
                        }
                        continue;
                    }

                    self.set_state(SessionState::Ready);
                    backoff = RECONNECT_MIN;
                    // A reconnect may have missed notifications for waiters
                    // registered just before the drop; sweep once on entry.
                    self.sweep_terminal_waiters().await;

                    loop {
                        tokio::select! {
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    self.set_state(SessionState::Closing);
                                    return;
                                }
                            }
                            notification = listener.recv() => {
                                match notification {
                                    Ok(notification) => self.dispatch(notification.payload()),
                                    Err(_) => {
                                        self.set_state(SessionState::Disconnected);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                Err(_) => {
                    self.set_state(SessionState::Disconnected);
                    if Self::backoff_or_shutdown(&mut backoff, &mut shutdown_rx).await {
                        return;
                    }
                }
            }
        }
    }

    async fn backoff_or_shutdown(backoff: &mut Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(*backoff) => {
                *backoff = (*backoff * 2).min(RECONNECT_MAX);
                false
            }
            _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
        }
    }

    fn dispatch(&self, payload: &str) {
        let Some((id_part, status_part)) = payload.split_once('|') else {
            tracing::warn!(%payload, "malformed completion notification");
            return;
        };
        let Ok(job_id) = Uuid::parse_str(id_part) else {
            tracing::warn!(%payload, "malformed job id in notification");
            return;
        };
        let Ok(terminal_status) = status_part.parse::<Status>() else {
            tracing::warn!(%payload, "malformed status in notification");
            return;
        };

        if let Some((_, tx)) = self.waiters.remove(&job_id) {
            let _ = tx.send(CompletionNotice {
                job_id,
                terminal_status,
                listen_channel_id: None,
            });
        }
    }

    /// Re-reads every job with a waiter currently registered and fires any
    /// that already reached a terminal state. Called once on entry to
    /// `Ready`, so a completion delivered while the listen connection was
    /// down (reconnecting, or missed entirely) still wakes its waiter
    /// promptly instead of only on that waiter's own timeout.
    async fn sweep_terminal_waiters(&self) {
        let ids: Vec<Uuid> = self.waiters.iter().map(|entry| *entry.key()).collect();
        if ids.is_empty() {
            return;
        }

        let rows: Vec<JobRow> = match sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ANY($1)"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "waiter sweep query failed");
                return;
            }
        };

        for row in rows {
            let job: Job = row.into();
            if !job.status.is_terminal() {
                continue;
            }
            if let Some((_, tx)) = self.waiters.remove(&job.id) {
                let _ = tx.send(CompletionNotice {
                    job_id: job.id,
                    terminal_status: job.status,
                    listen_channel_id: None,
                });
            }
        }
    }
}
