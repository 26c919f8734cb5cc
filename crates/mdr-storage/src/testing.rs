//! Helpers for crates that test against a real PostgreSQL server.

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

use crate::PgStore;

pub const TEST_DATABASE_URL_VAR: &str = "MDR_TEST_DATABASE_URL";

/// A migrated store confined to a fresh schema, or `None` when no test database is configured.
pub async fn isolated_pg_store() -> Option<PgStore> {
    let url = std::env::var(TEST_DATABASE_URL_VAR).ok()?;
    let schema = format!("mdr_test_{}", uuid::Uuid::new_v4().simple());

    let admin = PgPool::connect(&url).await.expect("connect admin pool");
    admin
        .execute(format!("CREATE SCHEMA {schema}").as_str())
        .await
        .expect("create test schema");
    admin.close().await;

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .after_connect(move |conn, _meta| {
            let sql = format!("SET search_path TO {schema}");
            Box::pin(async move {
                conn.execute(sql.as_str()).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .expect("connect schema pool");

    let store = PgStore::new(pool);
    store.migrate().await.expect("run migrations");
    Some(store)
}
