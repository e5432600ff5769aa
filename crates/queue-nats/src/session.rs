//! Listener session for the bus-backed Waiter API: subscribes
//! to this process's completion subject and wakes registered waiters.
//!
//! Mirrors `queue-postgres::session::ListenerSession`, same state machine,
//! same `tokio::sync::watch` shutdown signal, same reconnect backoff, but
//! rides NATS core pub/sub instead of `LISTEN`/`NOTIFY`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use queue_core::CompletionNotice;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

const RECONNECT_MIN: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(3);

pub fn channel_subject(queue_name: &str, channel_id: &str) -> String {
    format!("{queue_name}.listen.{channel_id}")
}

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

pub struct NatsListenerSession {
    nats_url: String,
    subject: String,
    state: AtomicU8,
    waiters: Arc<DashMap<Uuid, oneshot::Sender<CompletionNotice>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl NatsListenerSession {
    pub fn spawn(nats_url: String, queue_name: &str, channel_id: &str) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Arc::new(Self {
            nats_url,
            subject: channel_subject(queue_name, channel_id),
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
            match async_nats::connect(&self.nats_url).await {
                Ok(client) => match client.subscribe(self.subject.clone()).await {
                    Ok(mut subscriber) => {
                        self.set_state(SessionState::Ready);
                        backoff = RECONNECT_MIN;

                        loop {
                            tokio::select! {
                                _ = shutdown_rx.changed() => {
                                    if *shutdown_rx.borrow() {
                                        self.set_state(SessionState::Closing);
                                        return;
                                    }
                                }
                                message = subscriber.next() => {
                                    match message {
                                        Some(message) => self.dispatch(&message.payload),
                                        None => {
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
                },
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

    fn dispatch(&self, payload: &[u8]) {
        let notice: CompletionNotice = match serde_json::from_slice(payload) {
            Ok(notice) => notice,
            Err(err) => {
                tracing::warn!(error = %err, "malformed completion notice payload");
                return;
            }
        };
        if let Some((_, tx)) = self.waiters.remove(&notice.job_id) {
            let _ = tx.send(notice);
        }
    }
}
