//! Core domain model and merge rules for MDR.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "mdr-core";

pub const MERGE_SUCCEEDED_MESSAGE: &str = "Merchants merged successfully";

/// Merchant row as persisted by the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantRecord {
    pub id: String,
    pub name: String,
    /// Business creation time, not the storage timestamp.
    pub creation_date: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ingestion handoff for a merchant row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMerchant {
    pub id: String,
    pub name: String,
    pub creation_date: DateTime<Utc>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// A stored duplicate candidate.
///
/// The two slots describe an unordered pair; which merchant lands in slot 1 is an artifact of
/// the upstream similarity run and carries no meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub id: i64,
    pub merchant_id_1: String,
    pub merchant_name_1: String,
    pub creation_date_1: DateTime<Utc>,
    pub merchant_id_2: String,
    pub merchant_name_2: String,
    pub creation_date_2: DateTime<Utc>,
    pub cosine_distance: f64,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
}

impl DuplicateCandidate {
    /// True when `{a, b}` equals this candidate's pair, in either slot order.
    pub fn matches_pair(&self, a: &str, b: &str) -> bool {
        (self.merchant_id_1 == a && self.merchant_id_2 == b)
            || (self.merchant_id_1 == b && self.merchant_id_2 == a)
    }
}

/// Ingestion handoff for a candidate row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCandidate {
    pub merchant_id_1: String,
    pub merchant_name_1: String,
    pub creation_date_1: DateTime<Utc>,
    pub merchant_id_2: String,
    pub merchant_name_2: String,
    pub creation_date_2: DateTime<Utc>,
    pub cosine_distance: f64,
    #[serde(default)]
    pub is_processed: bool,
}

impl NewCandidate {
    pub fn is_self_pair(&self) -> bool {
        self.merchant_id_1 == self.merchant_id_2
    }
}

/// Append-only record of a completed merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeHistoryEntry {
    pub id: i64,
    pub kept_merchant_id: String,
    pub discarded_merchant_id: String,
    pub merged_at: DateTime<Utc>,
    /// Reserved for attribution; never populated.
    pub merged_by: Option<String>,
}

/// Operator decision: which of two merchants survives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub keep_merchant_id: String,
    pub discard_merchant_id: String,
}

impl MergeRequest {
    pub fn new(keep: impl Into<String>, discard: impl Into<String>) -> Self {
        Self {
            keep_merchant_id: keep.into(),
            discard_merchant_id: discard.into(),
        }
    }

    /// Rule 1: a record cannot be merged into itself.
    pub fn check_distinct(&self) -> Result<(), MergeRejection> {
        if self.keep_merchant_id == self.discard_merchant_id {
            return Err(MergeRejection::SelfMerge);
        }
        Ok(())
    }

    /// Rules 2 and 3, evaluated against the rows found by a single lookup of both ids.
    ///
    /// Only the discard side's activity is checked. A keep record that was itself discarded
    /// earlier is still accepted.
    pub fn check_records(&self, found: &[MerchantRecord]) -> Result<(), MergeRejection> {
        let keep = found.iter().find(|m| m.id == self.keep_merchant_id);
        let discard = found.iter().find(|m| m.id == self.discard_merchant_id);

        if keep.is_none() {
            return Err(MergeRejection::KeepNotFound(self.keep_merchant_id.clone()));
        }
        let Some(discard) = discard else {
            return Err(MergeRejection::DiscardNotFound(
                self.discard_merchant_id.clone(),
            ));
        };
        if !discard.is_active {
            return Err(MergeRejection::DiscardInactive);
        }
        Ok(())
    }
}

/// Every reason a merge can end without committing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeRejection {
    #[error("Cannot merge merchant with itself")]
    SelfMerge,
    #[error("Merchant to keep with ID '{0}' not found")]
    KeepNotFound(String),
    #[error("Merchant to discard with ID '{0}' not found")]
    DiscardNotFound(String),
    #[error("Merchant to discard is already inactive")]
    DiscardInactive,
    #[error("Database operation failed during merchant merge")]
    OperationFailed,
}

/// Result shape returned to callers for every merge attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub message: String,
    pub kept_merchant_id: String,
    pub discarded_merchant_id: String,
}

impl MergeOutcome {
    pub fn merged(request: &MergeRequest) -> Self {
        Self {
            success: true,
            message: MERGE_SUCCEEDED_MESSAGE.to_string(),
            kept_merchant_id: request.keep_merchant_id.clone(),
            discarded_merchant_id: request.discard_merchant_id.clone(),
        }
    }

    pub fn rejected(request: &MergeRequest, reason: &MergeRejection) -> Self {
        Self {
            success: false,
            message: reason.to_string(),
            kept_merchant_id: request.keep_merchant_id.clone(),
            discarded_merchant_id: request.discard_merchant_id.clone(),
        }
    }
}
