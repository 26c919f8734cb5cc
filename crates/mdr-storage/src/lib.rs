//! Merchant, candidate and merge-history storage for MDR.
//!
//! Every write goes through a [`UnitOfWork`]: callers stage changes on it and call
//! [`UnitOfWork::commit`]. Dropping a unit without committing discards everything it staged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdr_core::{
    DuplicateCandidate, MergeHistoryEntry, MerchantRecord, NewCandidate, NewMerchant,
};
use thiserror::Error;

mod memory;
mod postgres;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[cfg(any(test, feature = "test-util"))]
pub use memory::FailPoint;
pub use memory::MemoryStore;
pub use postgres::{PgStore, MIGRATOR};

pub const CRATE_NAME: &str = "mdr-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("candidate pairs merchant '{0}' with itself")]
    InvalidCandidate(String),
    #[error("cosine distance {0} does not fit NUMERIC(10, 8)")]
    DistanceOutOfRange(f64),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Exclusive magnitude bound of a NUMERIC(10, 8) column.
const DISTANCE_LIMIT: f64 = 100.0;

/// Round a distance to the eight decimal places the column keeps, rejecting values it cannot hold.
pub(crate) fn stored_distance(value: f64) -> Result<f64, StoreError> {
    let rounded = (value * 1e8).round() / 1e8;
    if !rounded.is_finite() || rounded.abs() >= DISTANCE_LIMIT {
        return Err(StoreError::DistanceOutOfRange(value));
    }
    Ok(rounded)
}

/// Read access plus the entry point for transactional writes.
#[async_trait]
pub trait MerchantStore: Send + Sync {
    /// Open a unit of work. Backends isolate it from concurrent units until it ends.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Candidates with `is_processed == false`, in storage order.
    async fn list_unprocessed_candidates(&self) -> Result<Vec<DuplicateCandidate>, StoreError>;

    async fn list_candidates(&self) -> Result<Vec<DuplicateCandidate>, StoreError>;

    async fn get_merchant(&self, id: &str) -> Result<Option<MerchantRecord>, StoreError>;

    /// History entries, oldest first.
    async fn list_merge_history(&self) -> Result<Vec<MergeHistoryEntry>, StoreError>;
}

/// A single transactional scope over all three tables.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Fetch the given merchants and hold them against concurrent units until this one ends.
    /// Ids with no row are simply absent from the result.
    async fn lock_merchants(&mut self, ids: &[&str]) -> Result<Vec<MerchantRecord>, StoreError>;

    /// Flip `is_active` to false and stamp `updated_at`. Returns affected row count.
    async fn deactivate_merchant(
        &mut self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn append_history(
        &mut self,
        kept_merchant_id: &str,
        discarded_merchant_id: &str,
        merged_at: DateTime<Utc>,
    ) -> Result<MergeHistoryEntry, StoreError>;

    /// Mark every unprocessed candidate whose pair is `{a, b}`, in either slot order.
    /// Returns the number of rows that changed.
    async fn mark_pair_processed(&mut self, a: &str, b: &str) -> Result<u64, StoreError>;

    async fn insert_merchant(&mut self, merchant: &NewMerchant)
        -> Result<MerchantRecord, StoreError>;

    async fn insert_candidate(
        &mut self,
        candidate: &NewCandidate,
    ) -> Result<DuplicateCandidate, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
