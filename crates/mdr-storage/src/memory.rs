//! In-process backend used by tests and local demos.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdr_core::{
    DuplicateCandidate, MergeHistoryEntry, MerchantRecord, NewCandidate, NewMerchant,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{stored_distance, MerchantStore, StoreError, UnitOfWork};

/// Step at which the in-memory backend injects a storage fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Begin,
    LockMerchants,
    DeactivateMerchant,
    AppendHistory,
    MarkProcessed,
    Commit,
    Reads,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    merchants: BTreeMap<String, MerchantRecord>,
    candidates: Vec<DuplicateCandidate>,
    history: Vec<MergeHistoryEntry>,
    next_candidate_id: i64,
    next_history_id: i64,
    fail_point: Option<FailPoint>,
}

impl MemoryState {
    fn check(&self, point: FailPoint) -> Result<(), StoreError> {
        if self.fail_point == Some(point) {
            return Err(StoreError::Unavailable(format!(
                "injected fault at {point:?}"
            )));
        }
        Ok(())
    }
}

/// Units of work hold the store lock for their whole lifetime and mutate a private copy of the
/// state, which only replaces the shared state on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn set_fail_point(&self, point: Option<FailPoint>) {
        self.state.lock().await.fail_point = point;
    }
}

#[async_trait]
impl MerchantStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        guard.check(FailPoint::Begin)?;
        let working = guard.clone();
        Ok(Box::new(MemoryUnit { guard, working }))
    }

    async fn list_unprocessed_candidates(&self) -> Result<Vec<DuplicateCandidate>, StoreError> {
        let state = self.state.lock().await;
        state.check(FailPoint::Reads)?;
        Ok(state
            .candidates
            .iter()
            .filter(|c| !c.is_processed)
            .cloned()
            .collect())
    }

    async fn list_candidates(&self) -> Result<Vec<DuplicateCandidate>, StoreError> {
        let state = self.state.lock().await;
        state.check(FailPoint::Reads)?;
        Ok(state.candidates.clone())
    }

    async fn get_merchant(&self, id: &str) -> Result<Option<MerchantRecord>, StoreError> {
        let state = self.state.lock().await;
        state.check(FailPoint::Reads)?;
        Ok(state.merchants.get(id).cloned())
    }

    async fn list_merge_history(&self) -> Result<Vec<MergeHistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        state.check(FailPoint::Reads)?;
        Ok(state.history.clone())
    }
}

struct MemoryUnit {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn lock_merchants(&mut self, ids: &[&str]) -> Result<Vec<MerchantRecord>, StoreError> {
        self.working.check(FailPoint::LockMerchants)?;
        Ok(self
            .working
            .merchants
            .values()
            .filter(|m| ids.contains(&m.id.as_str()))
            .cloned()
            .collect())
    }

    async fn deactivate_merchant(
        &mut self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.working.check(FailPoint::DeactivateMerchant)?;
        match self.working.merchants.get_mut(id) {
            Some(merchant) => {
                merchant.is_active = false;
                merchant.updated_at = at;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn append_history(
        &mut self,
        kept_merchant_id: &str,
        discarded_merchant_id: &str,
        merged_at: DateTime<Utc>,
    ) -> Result<MergeHistoryEntry, StoreError> {
        self.working.check(FailPoint::AppendHistory)?;
        self.working.next_history_id += 1;
        let entry = MergeHistoryEntry {
            id: self.working.next_history_id,
            kept_merchant_id: kept_merchant_id.to_string(),
            discarded_merchant_id: discarded_merchant_id.to_string(),
            merged_at,
            merged_by: None,
        };
        self.working.history.push(entry.clone());
        Ok(entry)
    }

    async fn mark_pair_processed(&mut self, a: &str, b: &str) -> Result<u64, StoreError> {
        self.working.check(FailPoint::MarkProcessed)?;
        let mut changed = 0;
        for candidate in &mut self.working.candidates {
            if !candidate.is_processed && candidate.matches_pair(a, b) {
                candidate.is_processed = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn insert_merchant(
        &mut self,
        merchant: &NewMerchant,
    ) -> Result<MerchantRecord, StoreError> {
        if self.working.merchants.contains_key(&merchant.id) {
            return Err(StoreError::Conflict(format!(
                "merchant '{}' already exists",
                merchant.id
            )));
        }
        let now = Utc::now();
        let record = MerchantRecord {
            id: merchant.id.clone(),
            name: merchant.name.clone(),
            creation_date: merchant.creation_date,
            is_active: merchant.is_active,
            created_at: now,
            updated_at: now,
        };
        self.working
            .merchants
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn insert_candidate(
        &mut self,
        candidate: &NewCandidate,
    ) -> Result<DuplicateCandidate, StoreError> {
        if candidate.is_self_pair() {
            return Err(StoreError::InvalidCandidate(candidate.merchant_id_1.clone()));
        }
        let cosine_distance = stored_distance(candidate.cosine_distance)?;
        self.working.next_candidate_id += 1;
        let row = DuplicateCandidate {
            id: self.working.next_candidate_id,
            merchant_id_1: candidate.merchant_id_1.clone(),
            merchant_name_1: candidate.merchant_name_1.clone(),
            creation_date_1: candidate.creation_date_1,
            merchant_id_2: candidate.merchant_id_2.clone(),
            merchant_name_2: candidate.merchant_name_2.clone(),
            creation_date_2: candidate.creation_date_2,
            cosine_distance,
            is_processed: candidate.is_processed,
            created_at: Utc::now(),
        };
        self.working.candidates.push(row.clone());
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryUnit { mut guard, working } = *self;
        working.check(FailPoint::Commit)?;
        *guard = working;
        Ok(())
    }
}
