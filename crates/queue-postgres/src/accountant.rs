//! Concurrency Accountant.
//!
//! Not an independent process: this module is the set of CTE fragments and
//! partition-slot math that every dispatch and termination query builds on.
//! Configurations are declarative (`queue_core::ConcurrencyLimit`); there is
//! no plug-in point beyond these three modes.

use queue_core::ConcurrencyLimit;
use sqlx::PgPool;
use uuid::Uuid;

/// Treated as "unlimited" when a cap is absent, so slot arithmetic never
/// has to special-case `None` beyond this one clamp.
const UNLIMITED: i64 = i64::MAX / 2;

/// A (owner, group) dispatch partition with queued jobs and room to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionCandidate {
    pub owner_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub slots: i64,
}

/// Ensure every owner with a queued job has an `owner_concurrency` row,
/// resolving missing ones via the installed stored procedure. A NULL
/// resolution fails closed to `max_concurrency = 0`.
pub async fn self_heal_owner_rows(pool: &PgPool, source_table: &str) -> Result<(), sqlx::Error> {
    let sql = format!(
        r#"
        INSERT INTO owner_concurrency (id, max_concurrency, current_concurrency)
        SELECT DISTINCT owner_id,
               COALESCE(queue_owner_resolve_max_concurrency(owner_id), 0),
               0
        FROM {source_table}
        WHERE status = 'queued' AND owner_id IS NOT NULL
        ON CONFLICT (id) DO NOTHING
        "#
    );
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

/// List the (owner[, group]) partitions with queued jobs and their current
/// slot budget. Ordering here is not load-bearing,
/// only the per-partition dispatch query's `ORDER BY priority, created_at,
/// id` is.
pub async fn candidate_partitions(
    pool: &PgPool,
    mode: ConcurrencyLimit,
    source_table: &str,
) -> Result<Vec<PartitionCandidate>, sqlx::Error> {
    match mode {
        ConcurrencyLimit::Off => {
            let any: Option<(i32,)> = sqlx::query_as(&format!(
                "SELECT 1 FROM {source_table} WHERE status = 'queued' LIMIT 1"
            ))
            .fetch_optional(pool)
            .await?;
            Ok(if any.is_some() {
                vec![PartitionCandidate {
                    owner_id: None,
                    group_id: None,
                    slots: UNLIMITED,
                }]
            } else {
                vec![]
            })
        }
        ConcurrencyLimit::PerOwner => {
            let rows: Vec<(Option<Uuid>, Option<i32>, Option<i32>)> = sqlx::query_as(&format!(
                r#"
                SELECT DISTINCT j.owner_id, oc.max_concurrency, oc.current_concurrency
                FROM {source_table} j
                LEFT JOIN owner_concurrency oc ON oc.id = j.owner_id
                WHERE j.status = 'queued'
                "#
            ))
            .fetch_all(pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|(owner_id, max_c, cur_c)| PartitionCandidate {
                    owner_id,
                    group_id: None,
                    slots: owner_slots(owner_id, max_c, cur_c),
                })
                .collect())
        }
        ConcurrencyLimit::PerOwnerPerGroup => {
            let rows: Vec<(
                Option<Uuid>,
                Option<Uuid>,
                Option<i32>,
                Option<i32>,
                Option<i32>,
                Option<i32>,
            )> = sqlx::query_as(&format!(
                r#"
                SELECT DISTINCT j.owner_id, j.group_id,
                       oc.max_concurrency, oc.current_concurrency,
                       gc.max_concurrency, gc.current_concurrency
                FROM {source_table} j
                LEFT JOIN owner_concurrency oc ON oc.id = j.owner_id
                LEFT JOIN group_concurrency gc ON gc.id = j.group_id
                WHERE j.status = 'queued'
                "#
            ))
            .fetch_all(pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(
                    |(owner_id, group_id, o_max, o_cur, g_max, g_cur)| PartitionCandidate {
                        owner_id,
                        group_id,
                        slots: owner_slots(owner_id, o_max, o_cur)
                            .min(group_slots(group_id, g_max, g_cur)),
                    },
                )
                .collect())
        }
    }
}

fn owner_slots(owner_id: Option<Uuid>, max_c: Option<i32>, cur_c: Option<i32>) -> i64 {
    if owner_id.is_none() {
        return UNLIMITED;
    }
    match max_c {
        None => UNLIMITED,
        Some(max) => ((max as i64) - cur_c.unwrap_or(0) as i64).max(0),
    }
}

fn group_slots(group_id: Option<Uuid>, max_c: Option<i32>, cur_c: Option<i32>) -> i64 {
    if group_id.is_none() {
        return UNLIMITED;
    }
    match max_c {
        None => UNLIMITED,
        Some(max) => ((max as i64) - cur_c.unwrap_or(0) as i64).max(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_owner_is_unlimited() {
        assert_eq!(owner_slots(None, Some(0), Some(0)), UNLIMITED);
    }

    #[test]
    fn unset_cap_is_unlimited() {
        let owner = Some(Uuid::new_v4());
        assert_eq!(owner_slots(owner, None, Some(5)), UNLIMITED);
    }

    #[test]
    fn slots_never_go_negative() {
        let owner = Some(Uuid::new_v4());
        assert_eq!(owner_slots(owner, Some(2), Some(5)), 0);
    }

    #[test]
    fn partition_limit_is_the_minimum_of_owner_and_group() {
        let owner = Some(Uuid::new_v4());
        let group = Some(Uuid::new_v4());
        let o = owner_slots(owner, Some(5), Some(0));
        let g = group_slots(group, Some(1), Some(0));
        assert_eq!(o.min(g), 1);
    }
}
