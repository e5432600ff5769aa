//! End-to-end scenarios S1-S6 against a real, ephemeral Postgres.

use std::time::Duration;

use queue_core::{ConcurrencyLimit, QueueConfig, QueueError, Status, WaitMode};
use queue_postgres::Queue;
use queue_testing::{ephemeral_postgres, grouped_job, owned_job, sample_job};
use sqlx::PgPool;
use uuid::Uuid;

fn config(database_url: String, concurrency_limit: ConcurrencyLimit) -> QueueConfig {
    QueueConfig {
        queue_name: "scrape".to_string(),
        database_url,
        bus_url: None,
        concurrency_limit,
        wait_mode: WaitMode::Poll,
        lease_ttl_ms: 60_000,
        prefetch_batch: 100,
        channel_id: "main".to_string(),
    }
}

#[tokio::test]
async fn s1_simple_round_trip() {
    let (_container, database_url) = ephemeral_postgres().await.unwrap();
    let queue = Queue::connect(config(database_url, ConcurrencyLimit::Off), None)
        .await
        .unwrap();

    let job_id = Uuid::new_v4();
    queue.submitter().add_job(sample_job(job_id)).await.unwrap();

    let job = queue
        .dispatcher()
        .get_job_to_process()
        .await
        .unwrap()
        .expect("a job should be available");
    assert_eq!(job.id, job_id);
    let lock = job.lock.expect("dispatched job carries a lock");

    let waiter = queue.waiter();
    let wait_job_id = job_id;
    let wait = tokio::spawn(async move { waiter.wait_for_job(wait_job_id, Duration::from_secs(5)).await });

    let finished = queue
        .worker()
        .job_finish(job_id, lock, serde_json::json!({ "ok": true }))
        .await
        .unwrap();
    assert!(finished);

    let result = wait.await.unwrap().unwrap();
    assert_eq!(result, serde_json::json!({ "ok": true }));
}

#[tokio::test]
async fn s2_per_owner_cap() {
    let (_container, database_url) = ephemeral_postgres().await.unwrap();
    let queue = Queue::connect(
        config(database_url.clone(), ConcurrencyLimit::PerOwner),
        None,
    )
    .await
    .unwrap();

    let owner = Uuid::new_v4();
    set_owner_cap(&database_url, owner, 2).await;

    let j1 = Uuid::new_v4();
    let j2 = Uuid::new_v4();
    let j3 = Uuid::new_v4();
    for id in [j1, j2, j3] {
        queue.submitter().add_job(owned_job(id, owner)).await.unwrap();
    }

    let first = queue.dispatcher().get_job_to_process().await.unwrap().unwrap();
    let second = queue.dispatcher().get_job_to_process().await.unwrap().unwrap();
    let third = queue.dispatcher().get_job_to_process().await.unwrap();
    assert!(third.is_none(), "owner is at cap, third dispatch must be empty");

    let first_lock = first.lock.unwrap();
    queue
        .worker()
        .job_finish(first.id, first_lock, serde_json::Value::Null)
        .await
        .unwrap();

    let fourth = queue
        .dispatcher()
        .get_job_to_process()
        .await
        .unwrap()
        .expect("capacity freed up after a finish");
    let dispatched_ids = [first.id, second.id, fourth.id];
    assert!(dispatched_ids.contains(&j1));
    assert!(dispatched_ids.contains(&j2));
    assert!(dispatched_ids.contains(&j3));
}

#[tokio::test]
async fn s3_per_group_cap_within_owner_cap() {
    let (_container, database_url) = ephemeral_postgres().await.unwrap();
    let queue = Queue::connect(
        config(database_url.clone(), ConcurrencyLimit::PerOwnerPerGroup),
        None,
    )
    .await
    .unwrap();

    let owner = Uuid::new_v4();
    set_owner_cap(&database_url, owner, 5).await;

    let group = Uuid::new_v4();
    queue
        .groups()
        .add_group(group, owner, 60_000, vec![queue_testing::group_cap("scrape", Some(1))])
        .await
        .unwrap();

    for _ in 0..3 {
        let id = Uuid::new_v4();
        queue
            .submitter()
            .add_job(grouped_job(id, owner, group))
            .await
            .unwrap();
    }

    let first = queue.dispatcher().get_job_to_process().await.unwrap();
    assert!(first.is_some(), "the group's one slot should dispatch once");
    let second = queue.dispatcher().get_job_to_process().await.unwrap();
    assert!(second.is_none(), "the group cap must hold even though the owner has slack");
}

#[tokio::test]
async fn s4_lost_lock_is_reclaimed() {
    let (_container, database_url) = ephemeral_postgres().await.unwrap();
    let mut cfg = config(database_url, ConcurrencyLimit::Off);
    cfg.lease_ttl_ms = 100;
    let queue = Queue::connect(cfg, None).await.unwrap();

    let job_id = Uuid::new_v4();
    queue.submitter().add_job(sample_job(job_id)).await.unwrap();

    let first = queue.dispatcher().get_job_to_process().await.unwrap().unwrap();
    let first_lock = first.lock.unwrap();

    // Let the lease expire and the background reaper reclaim it.
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let second = queue
        .dispatcher()
        .get_job_to_process()
        .await
        .unwrap()
        .expect("the reaper should have re-queued the expired lease");
    assert_eq!(second.id, job_id);
    let second_lock = second.lock.unwrap();
    assert_ne!(first_lock, second_lock);

    let stale_finish = queue
        .worker()
        .job_finish(job_id, first_lock, serde_json::Value::Null)
        .await
        .unwrap();
    assert!(!stale_finish, "the first worker's lock no longer matches");
}

#[tokio::test]
async fn s5_group_cancel_fails_queued_not_active() {
    let (_container, database_url) = ephemeral_postgres().await.unwrap();
    let queue = Queue::connect(config(database_url, ConcurrencyLimit::Off), None)
        .await
        .unwrap();

    let owner = Uuid::new_v4();
    let group = Uuid::new_v4();
    queue.groups().add_group(group, owner, 60_000, vec![]).await.unwrap();

    let j1 = Uuid::new_v4();
    let j2 = Uuid::new_v4();
    let j3 = Uuid::new_v4();
    for id in [j1, j2, j3] {
        queue
            .submitter()
            .add_job(grouped_job(id, owner, group))
            .await
            .unwrap();
    }

    // Dispatch j2 so it is active when the group is cancelled.
    let active = queue.dispatcher().get_job_to_process().await.unwrap().unwrap();
    let active_lock = active.lock.unwrap();

    let cancelled = queue.groups().cancel_group(group).await.unwrap();
    assert!(cancelled);

    for id in [j1, j2, j3] {
        if id == active.id {
            continue;
        }
        let job = queue.submitter().get_job(id).await.unwrap().unwrap();
        assert_eq!(job.failed_reason.as_deref(), Some("CANCELLED"));
    }

    let finished = queue
        .worker()
        .job_finish(active.id, active_lock, serde_json::Value::Null)
        .await
        .unwrap();
    assert!(finished, "the active job runs to completion despite cancellation");
}

#[tokio::test]
async fn s6_priority_ordering() {
    let (_container, database_url) = ephemeral_postgres().await.unwrap();
    let queue = Queue::connect(config(database_url, ConcurrencyLimit::Off), None)
        .await
        .unwrap();

    let owner = Uuid::new_v4();
    let low = Uuid::new_v4();
    let mid = Uuid::new_v4();
    let high = Uuid::new_v4();

    let mut j1 = owned_job(high, owner);
    j1.priority = 10;
    let mut j2 = owned_job(low, owner);
    j2.priority = 0;
    let mut j3 = owned_job(mid, owner);
    j3.priority = 5;

    queue.submitter().add_job(j1).await.unwrap();
    queue.submitter().add_job(j2).await.unwrap();
    queue.submitter().add_job(j3).await.unwrap();

    let first = queue.dispatcher().get_job_to_process().await.unwrap().unwrap();
    let second = queue.dispatcher().get_job_to_process().await.unwrap().unwrap();
    let third = queue.dispatcher().get_job_to_process().await.unwrap().unwrap();

    assert_eq!(first.id, low);
    assert_eq!(second.id, mid);
    assert_eq!(third.id, high);
}

#[tokio::test]
async fn renew_lock_extends_the_lease_and_rejects_a_stale_token() {
    let (_container, database_url) = ephemeral_postgres().await.unwrap();
    let mut cfg = config(database_url, ConcurrencyLimit::Off);
    cfg.lease_ttl_ms = 300;
    let queue = Queue::connect(cfg, None).await.unwrap();

    let job_id = Uuid::new_v4();
    queue.submitter().add_job(sample_job(job_id)).await.unwrap();

    let job = queue.dispatcher().get_job_to_process().await.unwrap().unwrap();
    let lock = job.lock.unwrap();

    // Keep renewing past what the lease would tolerate unrenewed; the
    // reaper must never reclaim a job whose lock is actively renewed.
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let renewed = queue.worker().renew_lock(job_id, lock).await.unwrap();
        assert!(renewed, "renewal must succeed while the lock still matches");
    }

    let still_active = queue.submitter().get_job(job_id).await.unwrap().unwrap();
    assert_eq!(still_active.status, Status::Active);

    let finished = queue
        .worker()
        .job_finish(job_id, lock, serde_json::Value::Null)
        .await
        .unwrap();
    assert!(finished);

    let stale_renew = queue.worker().renew_lock(job_id, lock).await.unwrap();
    assert!(!stale_renew, "renewal after completion must fail silently");
}

#[tokio::test]
async fn add_job_rejects_duplicate_id_and_try_add_job_tolerates_it() {
    let (_container, database_url) = ephemeral_postgres().await.unwrap();
    let queue = Queue::connect(config(database_url, ConcurrencyLimit::Off), None)
        .await
        .unwrap();

    let id = Uuid::new_v4();
    queue.submitter().add_job(sample_job(id)).await.unwrap();

    let err = queue.submitter().add_job(sample_job(id)).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(conflicting) if conflicting == id));

    let retried = queue.submitter().try_add_job(sample_job(id)).await.unwrap();
    assert!(retried.is_none());
}

/// Upserts an `owner_concurrency` row directly, ahead of the Dispatcher's
/// self-healing (whose stored-procedure stub always resolves to zero), so a
/// scenario can pin a cap before any job is queued for that owner.
async fn set_owner_cap(database_url: &str, owner: Uuid, max_concurrency: i32) {
    let pool = PgPool::connect(database_url).await.unwrap();
    sqlx::query(
        "INSERT INTO owner_concurrency (id, max_concurrency, current_concurrency) \
         VALUES ($1, $2, 0) \
         ON CONFLICT (id) DO UPDATE SET max_concurrency = excluded.max_concurrency",
    )
    .bind(owner)
    .bind(max_concurrency)
    .execute(&pool)
    .await
    .unwrap();
}
