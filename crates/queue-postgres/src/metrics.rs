//! Prometheus exposition: job counts by status, a synthetic
//! `concurrency-limited` gauge, and connection-pool occupancy.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::PgPool;

static RECORDER_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub struct QueueMetrics {
    handle: PrometheusHandle,
    queue_name: String,
}

impl QueueMetrics {
    /// Installs the process-wide Prometheus recorder the first time any
    /// `Queue` in this process is constructed, then hands every later caller
    /// a clone of the same handle. The spec's side-queues (billing, index,
    /// webhook) each build their own `Queue` in the same process, and the
    /// underlying `install_recorder()` call can only succeed once, so the
    /// `OnceLock` - not the builder - is what makes a second `Queue` safe to
    /// construct.
    pub fn install(queue_name: String) -> Self {
        let handle = RECORDER_HANDLE
            .get_or_init(|| {
                PrometheusBuilder::new()
                    .install_recorder()
                    .expect("prometheus recorder installs exactly once per process")
            })
            .clone();
        Self { handle, queue_name }
    }

    /// Re-derives the `<queue>_job_count{status="..."}` gauges from a fresh
    /// count query. Called on a timer by [`crate::queue::Queue`]'s
    /// background task rather than on every mutation, so a missed update
    /// never wedges a counter.
    pub async fn refresh(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status::text, count(*) FROM jobs GROUP BY status
             UNION ALL
             SELECT 'backlog', count(*) FROM jobs_backlog",
        )
        .fetch_all(pool)
        .await?;

        for (status, count) in rows {
            metrics::gauge!(
                format!("{}_job_count", self.queue_name),
                "status" => status
            )
            .set(count as f64);
        }

        let limited: (i64,) = sqlx::query_as(
            r#"
            SELECT count(*) FROM jobs j
            JOIN owner_concurrency oc ON oc.id = j.owner_id
            WHERE j.status = 'queued'
              AND oc.max_concurrency IS NOT NULL
              AND oc.current_concurrency >= oc.max_concurrency
            "#,
        )
        .fetch_one(pool)
        .await?;
        metrics::gauge!(format!("{}_job_count", self.queue_name), "status" => "concurrency-limited")
            .set(limited.0 as f64);

        metrics::gauge!(format!("{}_pool_size", self.queue_name)).set(pool.size() as f64);
        metrics::gauge!(format!("{}_pool_idle", self.queue_name)).set(pool.num_idle() as f64);

        Ok(())
    }

    /// Renders the current scrape text for an HTTP `/metrics` handler to
    /// return verbatim.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
