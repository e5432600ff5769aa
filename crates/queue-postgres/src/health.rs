//! Health probe: a single round trip confirming the pool can
//! still reach Postgres.

use sqlx::PgPool;

pub async fn check(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
