//! Plan bookkeeping, precondition checks, dispatch and history.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use modlocale_core::cid::ContentHasher;
use modlocale_core::ids::{BackupId, PatchItemId, PlanId};
use modlocale_core::patch::{PatchItem, PatchPolicy};
use modlocale_core::writeback::{ApplyResult, WritebackPlan, WritebackStatus, WritebackStrategy};

use super::backup::BackupStore;
use super::create_new::CreateNewExecutor;
use super::failpoints::Failpoints;
use super::in_place::InPlaceExecutor;
use super::lang::{self, LanguageContent};
use super::overlay::OverlayExecutor;
use super::WritebackExecutor;
use crate::config::WritebackConfig;
use crate::error::EngineError;

/// Input to [`WritebackManager::create_plan`].
///
/// For overlay plans `target_path` names the source container; the plan
/// itself targets the pack directory under the overlay root.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub strategy: WritebackStrategy,
    pub target_path: PathBuf,
    pub namespace: String,
    pub locale: String,
    pub content: LanguageContent,
    /// Defaults to `assets/{namespace}/lang/{locale}.json`.
    pub member_path: Option<String>,
    pub merge_existing: bool,
    /// Content hash the written member must read back as. Computed from
    /// `content` when unset and `merge_existing` is false.
    pub expected_hash: Option<String>,
    /// Defaults to the manager's configured value.
    pub backup_required: Option<bool>,
    pub expected_pre_image_hash: Option<String>,
    pub patch_item_id: Option<PatchItemId>,
}

impl PlanRequest {
    pub fn new(
        strategy: WritebackStrategy,
        target_path: impl Into<PathBuf>,
        namespace: impl Into<String>,
        locale: impl Into<String>,
        content: LanguageContent,
    ) -> Self {
        Self {
            strategy,
            target_path: target_path.into(),
            namespace: namespace.into(),
            locale: locale.into(),
            content,
            member_path: None,
            merge_existing: false,
            expected_hash: None,
            backup_required: None,
            expected_pre_image_hash: None,
            patch_item_id: None,
        }
    }
}

/// Executor strategy a patch policy is carried out with.
pub fn strategy_for(policy: PatchPolicy) -> WritebackStrategy {
    match policy {
        PatchPolicy::Overlay => WritebackStrategy::Overlay,
        PatchPolicy::Replace | PatchPolicy::Merge => WritebackStrategy::InPlace,
        PatchPolicy::CreateIfMissing => WritebackStrategy::CreateNew,
    }
}

pub enum RollbackTarget<'a> {
    /// Roll back the latest result recorded for a plan.
    Plan(PlanId),
    Result(&'a ApplyResult),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WritebackStatistics {
    pub total_operations: usize,
    pub successful: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub verified: usize,
    pub success_rate: f64,
    pub strategy_usage: BTreeMap<WritebackStrategy, usize>,
    pub total_entries_written: usize,
    pub average_duration_ms: f64,
}

pub struct WritebackManager {
    overlay_root: PathBuf,
    backup_required: bool,
    hasher: ContentHasher,
    backups: Arc<BackupStore>,
    failpoints: Failpoints,
    overlay: OverlayExecutor,
    in_place: InPlaceExecutor,
    create_new: CreateNewExecutor,
    plans: Mutex<BTreeMap<PlanId, WritebackPlan>>,
    history: Mutex<Vec<ApplyResult>>,
    rolled_back: Mutex<HashSet<PlanId>>,
}

impl WritebackManager {
    /// Both `overlay_root` and `backup_dir` must be set in `config`.
    pub fn new(config: &WritebackConfig, hasher: ContentHasher) -> Result<Self, EngineError> {
        let overlay_root = config
            .overlay_root
            .clone()
            .ok_or_else(|| EngineError::Config("writeback.overlay_root is not set".into()))?;
        let backup_dir = config
            .backup_dir
            .clone()
            .ok_or_else(|| EngineError::Config("writeback.backup_dir is not set".into()))?;

        let failpoints = Failpoints::new();
        let backups = Arc::new(BackupStore::new(backup_dir, hasher));
        Ok(Self {
            overlay_root,
            backup_required: config.backup_required,
            hasher,
            overlay: OverlayExecutor::new(config.pack_format, config.pack_description.clone(), hasher, failpoints.clone()),
            in_place: InPlaceExecutor::new(Arc::clone(&backups), hasher, failpoints.clone()),
            create_new: CreateNewExecutor::new(hasher, failpoints.clone()),
            backups,
            failpoints,
            plans: Mutex::new(BTreeMap::new()),
            history: Mutex::new(Vec::new()),
            rolled_back: Mutex::new(HashSet::new()),
        })
    }

    pub fn failpoints(&self) -> &Failpoints {
        &self.failpoints
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn overlay_root(&self) -> &Path {
        &self.overlay_root
    }

    fn executor(&self, strategy: WritebackStrategy) -> &dyn WritebackExecutor {
        match strategy {
            WritebackStrategy::Overlay => &self.overlay,
            WritebackStrategy::InPlace => &self.in_place,
            WritebackStrategy::CreateNew => &self.create_new,
        }
    }

    // ========================================================================
    // Planning
    // ========================================================================

    pub fn create_plan(&self, request: PlanRequest) -> Result<WritebackPlan, EngineError> {
        if request.content.is_empty() {
            return Err(EngineError::Validation("plan has no content".into()));
        }
        let target_path = match request.strategy {
            WritebackStrategy::Overlay => OverlayExecutor::pack_dir(&self.overlay_root, &request.namespace, &request.locale),
            WritebackStrategy::InPlace | WritebackStrategy::CreateNew => request.target_path,
        };
        let member_path = request
            .member_path
            .unwrap_or_else(|| format!("assets/{}/lang/{}.json", request.namespace, request.locale));
        // A layered write can only be checked once the existing content is known.
        let expected_hash = match request.expected_hash {
            Some(hash) => Some(hash),
            None if request.merge_existing => None,
            None => Some(lang::content_hash(&request.content)?),
        };

        let plan = WritebackPlan {
            plan_id: PlanId::new(),
            strategy: request.strategy,
            target_path,
            content: request.content,
            expected_hash,
            expected_pre_image_hash: request.expected_pre_image_hash,
            namespace: request.namespace,
            locale: request.locale,
            member_path,
            merge_existing: request.merge_existing,
            backup_required: request.backup_required.unwrap_or(self.backup_required),
            status: WritebackStatus::Pending,
            patch_item_id: request.patch_item_id,
            error_message: None,
            created_at: Utc::now(),
            applied_at: None,
        };
        info!(
            plan = %plan.plan_id,
            strategy = %plan.strategy,
            target = %plan.target_path.display(),
            entries = plan.content.len(),
            "writeback plan created"
        );
        self.plans.lock().insert(plan.plan_id, plan.clone());
        Ok(plan)
    }

    /// Resolve a patch item against the container at `container`.
    pub fn plan_patch_item(&self, item: &PatchItem, container: &Path) -> Result<WritebackPlan, EngineError> {
        let member_path = item.target_path();
        let live = if container.is_file() {
            lang::read_member_content(container, &member_path)?
        } else {
            None
        };
        let current_hash = match item.policy {
            PatchPolicy::CreateIfMissing => self.hasher.compute_file_if_exists(container)?.map(|c| c.hash_value),
            _ => live.as_ref().map(lang::content_hash).transpose()?,
        };
        if !item.validate_preconditions(current_hash.as_deref()) {
            return Err(EngineError::Validation(format!(
                "preconditions failed for patch item {} on {}",
                item.id,
                container.display()
            )));
        }

        let strategy = strategy_for(item.policy);
        let merge_existing = item.policy == PatchPolicy::Merge;
        let expected_pre_image_hash = match strategy {
            WritebackStrategy::InPlace => Some(self.hasher.compute_file(container)?.hash_value),
            WritebackStrategy::Overlay | WritebackStrategy::CreateNew => None,
        };

        let mut request = PlanRequest::new(strategy, container, &item.namespace, &item.locale, item.content.clone());
        request.member_path = Some(member_path);
        request.merge_existing = merge_existing;
        request.expected_pre_image_hash = expected_pre_image_hash;
        request.patch_item_id = Some(item.id);
        self.create_plan(request)
    }

    pub fn get_plan(&self, id: PlanId) -> Option<WritebackPlan> {
        self.plans.lock().get(&id).cloned()
    }

    pub fn plans(&self) -> Vec<WritebackPlan> {
        self.plans.lock().values().cloned().collect()
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run a pending plan.
    ///
    /// Precondition failures are returned as errors and leave the target
    /// untouched. Failures during the write come back as an unsuccessful
    /// [`ApplyResult`] after the executor restored what it could.
    pub fn execute_plan(&self, id: PlanId) -> Result<ApplyResult, EngineError> {
        let mut plan = self.get_plan(id).ok_or_else(|| EngineError::PlanNotFound(id.to_string()))?;
        if plan.status != WritebackStatus::Pending {
            return Err(EngineError::Validation(format!("plan {id} is {}, not pending", plan.status)));
        }

        if let Err(e) = self.check_preconditions(&plan) {
            warn!(plan = %id, error = %e, "writeback preconditions failed");
            let mut result = ApplyResult::started(&plan);
            result.fail(e.to_string());
            result.finish();
            plan.transition(WritebackStatus::Failed)?;
            plan.error_message = Some(e.to_string());
            self.plans.lock().insert(id, plan);
            self.history.lock().push(result);
            return Err(e);
        }

        plan.transition(WritebackStatus::InProgress)?;
        self.plans.lock().insert(id, plan.clone());
        info!(plan = %id, strategy = %plan.strategy, target = %plan.target_path.display(), "writeback started");

        let result = self.executor(plan.strategy).execute(&plan);

        if result.success {
            plan.transition(WritebackStatus::Success)?;
            if result.hash_verified {
                plan.transition(WritebackStatus::Verified)?;
            }
            plan.applied_at = result.completed_at;
            info!(plan = %id, duration_ms = result.duration_ms, verified = result.hash_verified, "writeback finished");
        } else {
            plan.transition(WritebackStatus::Failed)?;
            plan.error_message = result.errors.first().cloned();
            if result.rollback_performed {
                plan.transition(WritebackStatus::RolledBack)?;
            }
            warn!(plan = %id, rolled_back = result.rollback_performed, errors = ?result.errors, "writeback failed");
        }
        self.plans.lock().insert(id, plan);
        self.history.lock().push(result.clone());
        Ok(result)
    }

    fn check_preconditions(&self, plan: &WritebackPlan) -> Result<(), EngineError> {
        let target = &plan.target_path;
        match plan.strategy {
            WritebackStrategy::InPlace => {
                if !target.is_file() {
                    return Err(EngineError::Validation(format!("target {} does not exist", target.display())));
                }
                let parent = target
                    .parent()
                    .ok_or_else(|| EngineError::Validation(format!("no parent directory for {}", target.display())))?;
                if fs::metadata(parent)?.permissions().readonly() {
                    return Err(EngineError::Validation(format!("{} is not writable", parent.display())));
                }
                if let Some(expected) = &plan.expected_pre_image_hash {
                    let actual = self.hasher.compute_file(target)?.hash_value;
                    if &actual != expected {
                        return Err(EngineError::Integrity {
                            path: target.display().to_string(),
                            expected: expected.clone(),
                            actual,
                        });
                    }
                }
            }
            WritebackStrategy::CreateNew => {
                if target.exists() {
                    return Err(EngineError::Validation(format!("target {} already exists", target.display())));
                }
                match target.parent() {
                    Some(parent) if parent.is_dir() => {}
                    _ => {
                        return Err(EngineError::Validation(format!(
                            "parent directory of {} does not exist",
                            target.display()
                        )));
                    }
                }
            }
            WritebackStrategy::Overlay => {
                if let Some(expected) = &plan.expected_pre_image_hash {
                    let lang_path = target.join(&plan.member_path);
                    let actual = self.hasher.compute_file_if_exists(&lang_path)?.map(|c| c.hash_value);
                    if actual.as_deref() != Some(expected.as_str()) {
                        return Err(EngineError::Integrity {
                            path: lang_path.display().to_string(),
                            expected: expected.clone(),
                            actual: actual.unwrap_or_else(|| "missing".into()),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Rollback
    // ========================================================================

    /// Undo a successful write. Returns false when there is nothing left to
    /// undo, including a second call for the same plan.
    pub fn rollback(&self, target: RollbackTarget<'_>) -> Result<bool, EngineError> {
        let result = match target {
            RollbackTarget::Plan(id) => self
                .history
                .lock()
                .iter()
                .rev()
                .find(|r| r.plan_id == id)
                .cloned()
                .ok_or_else(|| EngineError::PlanNotFound(id.to_string()))?,
            RollbackTarget::Result(result) => result.clone(),
        };
        if !result.success || result.rollback_performed || self.rolled_back.lock().contains(&result.plan_id) {
            return Ok(false);
        }

        let undone = self.executor(result.strategy).rollback(&result)?;
        if undone {
            self.rolled_back.lock().insert(result.plan_id);
            if let Some(plan) = self.plans.lock().get_mut(&result.plan_id) {
                if let Err(e) = plan.transition(WritebackStatus::RolledBack) {
                    warn!(plan = %result.plan_id, error = %e, "plan status not updated after rollback");
                }
            }
            info!(plan = %result.plan_id, strategy = %result.strategy, "writeback rolled back");
        }
        Ok(undone)
    }

    // ========================================================================
    // History
    // ========================================================================

    pub fn history(&self) -> Vec<ApplyResult> {
        self.history.lock().clone()
    }

    pub fn results_for_plan(&self, id: PlanId) -> Vec<ApplyResult> {
        self.history.lock().iter().filter(|r| r.plan_id == id).cloned().collect()
    }

    pub fn get_statistics(&self) -> WritebackStatistics {
        let history = self.history.lock();
        let mut stats = WritebackStatistics {
            total_operations: history.len(),
            ..WritebackStatistics::default()
        };
        let mut total_duration = 0u64;
        for result in history.iter() {
            if result.success {
                stats.successful += 1;
                if result.hash_verified {
                    stats.verified += 1;
                }
            } else {
                stats.failed += 1;
            }
            if result.rollback_performed {
                stats.rolled_back += 1;
            }
            *stats.strategy_usage.entry(result.strategy).or_default() += 1;
            stats.total_entries_written += result.entries_written;
            total_duration += result.duration_ms;
        }
        drop(history);

        stats.rolled_back += self.rolled_back.lock().len();
        if stats.total_operations > 0 {
            stats.success_rate = stats.successful as f64 / stats.total_operations as f64;
            stats.average_duration_ms = total_duration as f64 / stats.total_operations as f64;
        }
        stats
    }

    pub fn cleanup_old_backups(&self, days: u32) -> Vec<BackupId> {
        let removed = self.backups.cleanup_older_than(days);
        if !removed.is_empty() {
            info!(removed = removed.len(), days, "old backups cleaned up");
        }
        removed
    }
}
