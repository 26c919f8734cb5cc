//! PostgreSQL backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdr_core::{
    DuplicateCandidate, MergeHistoryEntry, MerchantRecord, NewCandidate, NewMerchant,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::{stored_distance, MerchantStore, StoreError, UnitOfWork};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const MERCHANT_COLUMNS: &str = "id, name, creation_date, is_active, created_at, updated_at";

/// `cosine_distance` is NUMERIC(10, 8); the cast hands back the nearest f64.
const CANDIDATE_COLUMNS: &str = "\
    id, merchant_id_1, merchant_name_1, creation_date_1, \
    merchant_id_2, merchant_name_2, creation_date_2, \
    cosine_distance::DOUBLE PRECISION AS cosine_distance, is_processed, created_at";

const HISTORY_COLUMNS: &str =
    "id, kept_merchant_id, discarded_merchant_id, merged_at, merged_by";

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MerchantStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnit { tx }))
    }

    async fn list_unprocessed_candidates(&self) -> Result<Vec<DuplicateCandidate>, StoreError> {
        let query = format!(
            "SELECT {CANDIDATE_COLUMNS} FROM merchant_pairs
             WHERE is_processed = FALSE
             ORDER BY id"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(candidate_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?)
    }

    async fn list_candidates(&self) -> Result<Vec<DuplicateCandidate>, StoreError> {
        let query = format!("SELECT {CANDIDATE_COLUMNS} FROM merchant_pairs ORDER BY id");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(candidate_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?)
    }

    async fn get_merchant(&self, id: &str) -> Result<Option<MerchantRecord>, StoreError> {
        let query = format!("SELECT {MERCHANT_COLUMNS} FROM merchants WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(merchant_from_row).transpose()?)
    }

    async fn list_merge_history(&self) -> Result<Vec<MergeHistoryEntry>, StoreError> {
        let query = format!("SELECT {HISTORY_COLUMNS} FROM merge_history ORDER BY id");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(history_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?)
    }
}

/// Rolls back on drop unless committed.
struct PgUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnit {
    async fn lock_merchants(&mut self, ids: &[&str]) -> Result<Vec<MerchantRecord>, StoreError> {
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        // Fixed lock order keeps merge(a, b) and merge(b, a) from deadlocking.
        let query = format!(
            "SELECT {MERCHANT_COLUMNS} FROM merchants
             WHERE id = ANY($1)
             ORDER BY id
             FOR UPDATE"
        );
        let rows = sqlx::query(&query)
            .bind(ids.as_slice())
            .fetch_all(&mut *self.tx)
            .await?;
        debug!(requested = ids.len(), found = rows.len(), "locked merchant rows");
        Ok(rows
            .iter()
            .map(merchant_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?)
    }

    async fn deactivate_merchant(
        &mut self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE merchants
                SET is_active = FALSE,
                    updated_at = $2
              WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn append_history(
        &mut self,
        kept_merchant_id: &str,
        discarded_merchant_id: &str,
        merged_at: DateTime<Utc>,
    ) -> Result<MergeHistoryEntry, StoreError> {
        let query = format!(
            "INSERT INTO merge_history (kept_merchant_id, discarded_merchant_id, merged_at)
             VALUES ($1, $2, $3)
             RETURNING {HISTORY_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(kept_merchant_id)
            .bind(discarded_merchant_id)
            .bind(merged_at)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(history_from_row(&row)?)
    }

    async fn mark_pair_processed(&mut self, a: &str, b: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE merchant_pairs
                SET is_processed = TRUE
              WHERE is_processed = FALSE
                AND ((merchant_id_1 = $1 AND merchant_id_2 = $2)
                  OR (merchant_id_1 = $2 AND merchant_id_2 = $1))",
        )
        .bind(a)
        .bind(b)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_merchant(
        &mut self,
        merchant: &NewMerchant,
    ) -> Result<MerchantRecord, StoreError> {
        let query = format!(
            "INSERT INTO merchants (id, name, creation_date, is_active)
             VALUES ($1, $2, $3, $4)
             RETURNING {MERCHANT_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(&merchant.id)
            .bind(&merchant.name)
            .bind(merchant.creation_date)
            .bind(merchant.is_active)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|err| {
                let duplicate = matches!(
                    &err,
                    sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION)
                );
                if duplicate {
                    StoreError::Conflict(format!("merchant '{}' already exists", merchant.id))
                } else {
                    StoreError::Database(err)
                }
            })?;
        Ok(merchant_from_row(&row)?)
    }

    async fn insert_candidate(
        &mut self,
        candidate: &NewCandidate,
    ) -> Result<DuplicateCandidate, StoreError> {
        if candidate.is_self_pair() {
            return Err(StoreError::InvalidCandidate(candidate.merchant_id_1.clone()));
        }
        let cosine_distance = stored_distance(candidate.cosine_distance)?;
        let query = format!(
            "INSERT INTO merchant_pairs
                (merchant_id_1, merchant_name_1, creation_date_1,
                 merchant_id_2, merchant_name_2, creation_date_2,
                 cosine_distance, is_processed)
             VALUES ($1, $2, $3, $4, $5, $6, $7::NUMERIC(10, 8), $8)
             RETURNING {CANDIDATE_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(&candidate.merchant_id_1)
            .bind(&candidate.merchant_name_1)
            .bind(candidate.creation_date_1)
            .bind(&candidate.merchant_id_2)
            .bind(&candidate.merchant_name_2)
            .bind(candidate.creation_date_2)
            .bind(cosine_distance)
            .bind(candidate.is_processed)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(candidate_from_row(&row)?)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

fn merchant_from_row(row: &PgRow) -> Result<MerchantRecord, sqlx::Error> {
    Ok(MerchantRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        creation_date: row.try_get("creation_date")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn candidate_from_row(row: &PgRow) -> Result<DuplicateCandidate, sqlx::Error> {
    Ok(DuplicateCandidate {
        id: row.try_get("id")?,
        merchant_id_1: row.try_get("merchant_id_1")?,
        merchant_name_1: row.try_get("merchant_name_1")?,
        creation_date_1: row.try_get("creation_date_1")?,
        merchant_id_2: row.try_get("merchant_id_2")?,
        merchant_name_2: row.try_get("merchant_name_2")?,
        creation_date_2: row.try_get("creation_date_2")?,
        cosine_distance: row.try_get("cosine_distance")?,
        is_processed: row.try_get("is_processed")?,
        created_at: row.try_get("created_at")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<MergeHistoryEntry, sqlx::Error> {
    Ok(MergeHistoryEntry {
        id: row.try_get("id")?,
        kept_merchant_id: row.try_get("kept_merchant_id")?,
        discarded_merchant_id: row.try_get("discarded_merchant_id")?,
        merged_at: row.try_get("merged_at")?,
        merged_by: row.try_get("merged_by")?,
    })
}

/// These run only when `MDR_TEST_DATABASE_URL` points at a PostgreSQL server; each test gets
/// its own schema.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::isolated_pg_store;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, d, 0, 0, 0).single().unwrap()
    }

    fn new_candidate(a: &str, b: &str, distance: f64, processed: bool) -> NewCandidate {
        NewCandidate {
            merchant_id_1: a.to_string(),
            merchant_name_1: format!("Merchant {a}"),
            creation_date_1: day(1),
            merchant_id_2: b.to_string(),
            merchant_name_2: format!("Merchant {b}"),
            creation_date_2: day(2),
            cosine_distance: distance,
            is_processed: processed,
        }
    }

    #[tokio::test]
    async fn distance_round_trips_eight_decimal_places() {
        let Some(store) = isolated_pg_store().await else {
            return;
        };
        let mut unit = store.begin().await.unwrap();
        unit.insert_candidate(&new_candidate("p1", "p2", 0.12345678, false))
            .await
            .unwrap();
        unit.insert_candidate(&new_candidate("p3", "p4", 0.92, true))
            .await
            .unwrap();
        unit.commit().await.unwrap();

        let open = store.list_unprocessed_candidates().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].cosine_distance, 0.12345678);
        assert_eq!(open[0].creation_date_1, day(1));
    }

    #[tokio::test]
    async fn uncommitted_unit_rolls_back() {
        let Some(store) = isolated_pg_store().await else {
            return;
        };
        {
            let mut unit = store.begin().await.unwrap();
            unit.insert_merchant(&NewMerchant {
                id: "m1".into(),
                name: "Shop".into(),
                creation_date: day(1),
                is_active: true,
            })
            .await
            .unwrap();
        }
        assert!(store.get_merchant("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_merchant_maps_to_conflict() {
        let Some(store) = isolated_pg_store().await else {
            return;
        };
        let merchant = NewMerchant {
            id: "m1".into(),
            name: "Shop".into(),
            creation_date: day(1),
            is_active: true,
        };
        let mut unit = store.begin().await.unwrap();
        unit.insert_merchant(&merchant).await.unwrap();
        unit.commit().await.unwrap();

        let mut unit = store.begin().await.unwrap();
        let err = unit.insert_merchant(&merchant).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn symmetric_update_touches_both_orders() {
        let Some(store) = isolated_pg_store().await else {
            return;
        };
        let mut unit = store.begin().await.unwrap();
        unit.insert_candidate(&new_candidate("m1", "m2", 0.85, false))
            .await
            .unwrap();
        unit.insert_candidate(&new_candidate("m2", "m1", 0.90, false))
            .await
            .unwrap();
        unit.insert_candidate(&new_candidate("m3", "m4", 0.70, false))
            .await
            .unwrap();
        assert_eq!(unit.mark_pair_processed("m1", "m2").await.unwrap(), 2);
        unit.commit().await.unwrap();

        let open = store.list_unprocessed_candidates().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].merchant_id_1, "m3");
    }

    #[tokio::test]
    async fn distance_bounds_match_numeric_column() {
        let Some(store) = isolated_pg_store().await else {
            return;
        };
        let mut unit = store.begin().await.unwrap();
        let widest = unit
            .insert_candidate(&new_candidate("w1", "w2", 99.99999999, false))
            .await
            .unwrap();
        assert_eq!(widest.cosine_distance, 99.99999999);
        let err = unit
            .insert_candidate(&new_candidate("w3", "w4", 100.0, false))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DistanceOutOfRange(_)));
    }
}
