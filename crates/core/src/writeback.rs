//! Writeback data model shared by the engine executors and storage.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{BackupId, PatchItemId, PlanId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritebackStrategy {
    Overlay,
    InPlace,
    CreateNew,
}

impl WritebackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overlay => "overlay",
            Self::InPlace => "in_place",
            Self::CreateNew => "create_new",
        }
    }
}

impl fmt::Display for WritebackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritebackStatus {
    #[default]
    Pending,
    InProgress,
    Success,
    Failed,
    RolledBack,
    Verified,
}

impl WritebackStatus {
    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::InProgress, Self::Failed],
            Self::InProgress => &[Self::Success, Self::Failed],
            Self::Success => &[Self::Verified, Self::RolledBack],
            Self::Failed => &[Self::RolledBack],
            Self::Verified => &[Self::RolledBack],
            Self::RolledBack => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        self.valid_transitions().contains(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Verified => "verified",
        }
    }
}

impl fmt::Display for WritebackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending write of one language file into one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritebackPlan {
    pub plan_id: PlanId,
    pub strategy: WritebackStrategy,
    pub target_path: PathBuf,
    pub content: BTreeMap<String, String>,
    /// Hash of `content` as it should read back from disk.
    pub expected_hash: Option<String>,
    /// Hash the target file must have right before a destructive write.
    pub expected_pre_image_hash: Option<String>,
    pub namespace: String,
    pub locale: String,
    pub member_path: String,
    pub merge_existing: bool,
    pub backup_required: bool,
    pub status: WritebackStatus,
    pub patch_item_id: Option<PatchItemId>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl WritebackPlan {
    pub fn transition(&mut self, next: WritebackStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(&next) {
            return Err(CoreError::InvalidTransition {
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Pending,
    Completed,
}

impl BackupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: BackupId,
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub backup_type: BackupType,
    pub size_bytes: u64,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub state: BackupState,
}

/// Append-only record of one plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub plan_id: PlanId,
    pub success: bool,
    pub strategy: WritebackStrategy,
    pub target_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub before_hash: Option<String>,
    pub after_hash: Option<String>,
    pub expected_hash: Option<String>,
    pub hash_verified: bool,
    pub entries_written: usize,
    pub entries_skipped: usize,
    pub entries_failed: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub rollback_available: bool,
    pub rollback_performed: bool,
    pub backup: Option<BackupInfo>,
}

impl ApplyResult {
    pub fn started(plan: &WritebackPlan) -> Self {
        Self::blank(plan.plan_id, plan.strategy, plan.target_path.clone(), plan.expected_hash.clone())
    }

    /// A finished, failed result for work that was refused before a plan
    /// existed. It gets a fresh plan id of its own.
    pub fn rejected(strategy: WritebackStrategy, target_path: impl Into<PathBuf>, error: impl Into<String>) -> Self {
        let mut result = Self::blank(PlanId::new(), strategy, target_path.into(), None);
        result.fail(error);
        result.finish();
        result
    }

    fn blank(plan_id: PlanId, strategy: WritebackStrategy, target_path: PathBuf, expected_hash: Option<String>) -> Self {
        Self {
            plan_id,
            success: false,
            strategy,
            target_path,
            output_path: None,
            before_hash: None,
            after_hash: None,
            expected_hash,
            hash_verified: false,
            entries_written: 0,
            entries_skipped: 0,
            entries_failed: 0,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            rollback_available: false,
            rollback_performed: false,
            backup: None,
        }
    }

    /// Stamp completion time and duration.
    pub fn finish(&mut self) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.errors.push(error.into());
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
