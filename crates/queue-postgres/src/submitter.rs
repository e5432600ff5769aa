//! Producer-facing job submission: `AddJob`/`AddJobs`/`GetJob`.

use queue_core::{Job, JobSubmitter as JobSubmitterTrait, NewJob, QueueError, QueueResult};
use sqlx::PgPool;
use uuid::Uuid;

use crate::qe;
use crate::store::{JobRow, JOB_COLUMNS};

pub struct PgJobSubmitter {
    pool: PgPool,
}

impl PgJobSubmitter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn target_table(job: &NewJob) -> &'static str {
        if job.pending_admission {
            "jobs_backlog"
        } else {
            "jobs"
        }
    }

    fn initial_status(job: &NewJob) -> &'static str {
        if job.pending_admission {
            "backlog"
        } else {
            "queued"
        }
    }

    async fn insert_one(&self, job: NewJob, on_conflict_do_nothing: bool) -> QueueResult<Option<Job>> {
        let table = Self::target_table(&job);
        let status = Self::initial_status(&job);
        let conflict_clause = if on_conflict_do_nothing {
            "ON CONFLICT (id) DO NOTHING"
        } else {
            ""
        };

        let sql = format!(
            r#"
            INSERT INTO {table}
                (id, status, priority, data, owner_id, group_id, listen_channel_id, times_out_at)
            VALUES ($1, $2::job_status, $3, $4, $5, $6, $7, $8)
            {conflict_clause}
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job.id)
            .bind(status)
            .bind(job.priority)
            .bind(&job.data)
            .bind(job.owner_id)
            .bind(job.group_id)
            .bind(&job.listen_channel_id)
            .bind(job.times_out_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(qe)?;

        Ok(row.map(Into::into))
    }
}

#[async_trait::async_trait]
impl JobSubmitterTrait for PgJobSubmitter {
    async fn add_job(&self, job: NewJob) -> QueueResult<Job> {
        let id = job.id;
        match self.insert_one(job, false).await {
            Ok(Some(created)) => Ok(created),
            Ok(None) => unreachable!("insert without ON CONFLICT always returns a row or an error"),
            Err(QueueError::Transport(err)) if is_unique_violation(&err) => {
                Err(QueueError::Conflict(id))
            }
            Err(other) => Err(other),
        }
    }

    async fn try_add_job(&self, job: NewJob) -> QueueResult<Option<Job>> {
        self.insert_one(job, true).await
    }

    async fn add_jobs(&self, jobs: Vec<NewJob>) -> QueueResult<Vec<Job>> {
        let mut created = Vec::with_capacity(jobs.len());
        for job in jobs {
            created.push(self.add_job(job).await?);
        }
        Ok(created)
    }

    async fn get_job(&self, id: Uuid) -> QueueResult<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1
             UNION ALL
             SELECT {JOB_COLUMNS} FROM jobs_backlog WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(qe)?;
        Ok(row.map(Into::into))
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .map(|db_err| db_err.is_unique_violation())
        .unwrap_or(false)
}
