//! Top-level `Queue` handle: wires the Durable Store, Dispatcher, Worker
//! API, Waiter API, Group Manager, Listener session, lease reaper, and
//! metrics exporter into one object a caller constructs once per process.

use std::sync::Arc;

use queue_core::{
    Dispatcher as DispatcherTrait, GroupManager as GroupManagerTrait,
    JobSubmitter as JobSubmitterTrait, PrefetchBridge, QueueConfig, QueueError, QueueResult,
    WaiterApi as WaiterApiTrait, WaitMode, WorkerApi as WorkerApiTrait,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::{interval, Duration};

use crate::dispatcher::PgDispatcher;
use crate::groups::PgGroupManager;
use crate::metrics::QueueMetrics;
use crate::session::ListenerSession;
use crate::submitter::PgJobSubmitter;
use crate::waiter::PgWaiterApi;
use crate::worker::PgWorkerApi;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

pub struct Queue {
    pool: PgPool,
    dispatcher: Arc<PgDispatcher>,
    worker: Arc<PgWorkerApi>,
    waiter: Arc<PgWaiterApi>,
    groups: Arc<PgGroupManager>,
    submitter: Arc<PgJobSubmitter>,
    metrics: Arc<QueueMetrics>,
    session: Option<Arc<ListenerSession>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Queue {
    /// Connects, applies pending migrations, and starts the background
    /// lease reaper, group-expiry sweeper, and metrics refresh loop.
    /// `bridge` is `None` for a DB-only deployment; a concrete bus-backed
    /// implementation (e.g. `queue-nats`) is passed in by the caller so
    /// this crate never depends on a specific bus.
    pub async fn connect(
        config: QueueConfig,
        bridge: Option<Arc<dyn PrefetchBridge>>,
    ) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .map_err(crate::qe)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| QueueError::Transport(err.into()))?;

        // A DB listen session is only needed when there is no bus to carry
        // completion notices instead; with a bus configured, the Waiter API
        // rides the Prefetch Bridge's own wait channel.
        let session = match (config.wait_mode, &bridge) {
            (WaitMode::Listen, None) => Some(ListenerSession::spawn(
                pool.clone(),
                config.database_url.clone(),
                &config.channel_id,
            )),
            _ => None,
        };
        let waiter_bridge = match (config.wait_mode, session.is_some()) {
            (WaitMode::Listen, false) => bridge.clone(),
            _ => None,
        };

        let dispatcher = Arc::new(PgDispatcher::new(pool.clone(), config.clone(), bridge.clone()));
        let worker = Arc::new(PgWorkerApi::new(pool.clone(), dispatcher.clone(), bridge.clone()));
        let waiter = Arc::new(PgWaiterApi::new(pool.clone(), session.clone(), waiter_bridge));
        let groups = Arc::new(PgGroupManager::new(pool.clone(), config.queue_name.clone()));
        let submitter = Arc::new(PgJobSubmitter::new(pool.clone()));
        let metrics = Arc::new(QueueMetrics::install(config.queue_name.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(crate::reaper::run(
            pool.clone(),
            config.lease_ttl_ms,
            bridge.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(Self::run_maintenance(
            pool.clone(),
            dispatcher.clone(),
            groups.clone(),
            metrics.clone(),
            bridge.is_some(),
            shutdown_rx,
        ));

        Ok(Self {
            pool,
            dispatcher,
            worker,
            waiter,
            groups,
            submitter,
            metrics,
            session,
            shutdown_tx,
        })
    }

    /// Loads [`QueueConfig::from_env`] and connects.
    pub async fn from_env(bridge: Option<Arc<dyn PrefetchBridge>>) -> QueueResult<Self> {
        let config =
            QueueConfig::from_env().map_err(|err| QueueError::Decode(err.to_string()))?;
        Self::connect(config, bridge).await
    }

    pub fn dispatcher(&self) -> Arc<dyn DispatcherTrait> {
        self.dispatcher.clone()
    }

    pub fn worker(&self) -> Arc<dyn WorkerApiTrait> {
        self.worker.clone()
    }

    pub fn waiter(&self) -> Arc<dyn WaiterApiTrait> {
        self.waiter.clone()
    }

    pub fn groups(&self) -> Arc<dyn GroupManagerTrait> {
        self.groups.clone()
    }

    pub fn submitter(&self) -> Arc<dyn JobSubmitterTrait> {
        self.submitter.clone()
    }

    /// Current Prometheus scrape text.
    pub fn metrics_text(&self) -> String {
        self.metrics.render()
    }

    pub async fn health_check(&self) -> bool {
        crate::health::check(&self.pool).await
    }

    /// Stops the reaper, maintenance loop, and (if running) the listener
    /// session. Does not close the pool; callers that want that should
    /// drop the last `Queue` handle.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(session) = &self.session {
            session.shutdown();
        }
    }

    async fn run_maintenance(
        pool: PgPool,
        dispatcher: Arc<PgDispatcher>,
        groups: Arc<PgGroupManager>,
        metrics: Arc<QueueMetrics>,
        prefetch_enabled: bool,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if prefetch_enabled {
                        if let Err(err) = dispatcher.prefetch_jobs().await {
                            tracing::warn!(error = %err, "prefetch pass failed");
                        }
                    }
                    if let Err(err) = groups.sweep_expired().await {
                        tracing::warn!(error = %err, "group expiry sweep failed");
                    }
                    if let Err(err) = metrics.refresh(&pool).await {
                        tracing::warn!(error = %err, "metrics refresh failed");
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
}
