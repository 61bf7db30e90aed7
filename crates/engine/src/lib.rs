pub mod config;
pub mod error;
pub mod merge;
pub mod resolve;
pub mod writeback;

pub use config::EngineConfig;
pub use error::EngineError;
pub use merge::{BatchOutcome, ConflictPolicy, MergeContext, MergeEngine, MergeResult, MergeStrategy, NoBaseFallback};
pub use resolve::{ConflictResolution, ConflictResolver, ConflictResolverChain, ResolutionStrategy};
pub use writeback::{PlanRequest, RollbackTarget, WritebackManager, WritebackStatistics, strategy_for};

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};

use modlocale_core::{
    cid::{AddresserStats, Content, ContentAddresser, ContentId},
    codec::{DeltaCodec, EncodedPayload},
    entry::{EntryDelta, EntryStatus, TranslationEntry},
    ids::*,
    patch::{PatchItem, PatchPolicy, PatchSet, PatchStatus},
    writeback::{ApplyResult, WritebackPlan},
};
use modlocale_storage::{SqliteStorage, Storage};

/// Host service object: one instance of every component, wired to one
/// storage handle.
pub struct Engine {
    config: EngineConfig,
    addresser: ContentAddresser,
    codec: DeltaCodec,
    merge: MergeEngine,
    writeback: WritebackManager,
    storage: SqliteStorage,
}

impl Engine {
    /// Fails with [`EngineError::Config`] when the writeback directories are
    /// not set; see [`EngineConfig::with_workspace`].
    pub fn new(storage: SqliteStorage, config: EngineConfig) -> Result<Self, EngineError> {
        let addresser = ContentAddresser::new(config.addressing.algorithm, config.addressing.cache_capacity);
        let hasher = addresser.hasher();
        let codec = DeltaCodec::new(hasher, config.codec.limits());
        let merge = MergeEngine::new(
            config.merge.no_base_fallback,
            config.merge.conflict_policy,
            config.merge.prefer_newest,
        );
        let writeback = WritebackManager::new(&config.writeback, hasher)?;
        for backup in storage.list_backups()? {
            writeback.backups().register(backup);
        }
        Ok(Self {
            config,
            addresser,
            codec,
            merge,
            writeback,
            storage,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut SqliteStorage {
        &mut self.storage
    }

    pub fn addresser(&self) -> &ContentAddresser {
        &self.addresser
    }

    pub fn codec(&self) -> &DeltaCodec {
        &self.codec
    }

    pub fn merge_engine(&self) -> &MergeEngine {
        &self.merge
    }

    pub fn writeback(&self) -> &WritebackManager {
        &self.writeback
    }

    // ========================================================================
    // Entries
    // ========================================================================

    pub fn create_entry(
        &mut self,
        language_file: LanguageFileId,
        key: &str,
        src_text: &str,
    ) -> Result<TranslationEntry, EngineError> {
        let entry = TranslationEntry::new(language_file, key, src_text);
        self.storage.put_entry(&entry)?;
        Ok(entry)
    }

    pub fn put_entry(&mut self, entry: &TranslationEntry) -> Result<(), EngineError> {
        self.storage.put_entry(entry)?;
        Ok(())
    }

    pub fn get_entry(&self, uid: EntryUid) -> Result<Option<TranslationEntry>, EngineError> {
        Ok(self.storage.get_entry(uid)?)
    }

    /// Set the translated text of an existing entry.
    pub fn translate(&mut self, uid: EntryUid, dst_text: &str) -> Result<TranslationEntry, EngineError> {
        let mut entry = self
            .storage
            .get_entry(uid)?
            .ok_or_else(|| EngineError::EntryNotFound(uid.to_string()))?;
        entry.translate(dst_text);
        self.storage.put_entry(&entry)?;
        Ok(entry)
    }

    pub fn delete_entry(&mut self, uid: EntryUid) -> Result<bool, EngineError> {
        Ok(self.storage.delete_entry(uid)?)
    }

    pub fn entries_for_language_file(&self, language_file: LanguageFileId) -> Result<Vec<TranslationEntry>, EngineError> {
        Ok(self.storage.entries_for_language_file(language_file)?)
    }

    // ========================================================================
    // Content addressing
    // ========================================================================

    pub fn compute_cid<'a>(&self, content: impl Into<Content<'a>>) -> Result<ContentId, EngineError> {
        Ok(self.addresser.compute_cid(content)?)
    }

    pub fn entry_cid(&self, entry: &TranslationEntry) -> Result<ContentId, EngineError> {
        Ok(self.addresser.compute_record_cid(entry)?)
    }

    pub fn addresser_stats(&self) -> AddresserStats {
        self.addresser.stats()
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Deltas turning the last-synced base into the live entries, ordered by
    /// entry uid. Entries waiting for conflict review are held back.
    pub fn local_changes(&self) -> Result<Vec<EntryDelta>, EngineError> {
        let mut bases: BTreeMap<EntryUid, TranslationEntry> =
            self.storage.list_bases()?.into_iter().map(|b| (b.uid, b)).collect();
        let mut changes = BTreeMap::new();

        for entry in self.storage.list_entries()? {
            if entry.status == EntryStatus::Conflict {
                bases.remove(&entry.uid);
                continue;
            }
            match bases.remove(&entry.uid) {
                None => {
                    changes.insert(entry.uid, EntryDelta::create(&entry));
                }
                Some(base) if base != entry => {
                    changes.insert(entry.uid, EntryDelta::update(&entry));
                }
                Some(_) => {}
            }
        }
        for (uid, base) in bases {
            changes.insert(uid, EntryDelta::delete(&base));
        }

        debug!(changes = changes.len(), "local changes collected");
        Ok(changes.into_values().collect())
    }

    /// Encode local changes into payloads that fit the codec limits.
    pub fn export_changes(&self) -> Result<(Vec<EntryDelta>, Vec<EncodedPayload>), EngineError> {
        let changes = self.local_changes()?;
        if changes.is_empty() {
            return Ok((changes, Vec::new()));
        }
        let payloads = self.codec.split(&changes)?;
        info!(changes = changes.len(), payloads = payloads.len(), "local changes exported");
        Ok((changes, payloads))
    }

    /// Record `deltas` as agreed with the remote side.
    pub fn mark_synced(&mut self, deltas: &[EntryDelta]) -> Result<(), EngineError> {
        for delta in deltas {
            match delta.to_entry() {
                Some(entry) => self.storage.put_base(&entry)?,
                None => {
                    self.storage.delete_base(delta.entry_uid)?;
                }
            }
        }
        Ok(())
    }

    /// Verify, reassemble and merge payloads received from a peer.
    pub fn import_changes(
        &mut self,
        payloads: &[EncodedPayload],
        strategy: &MergeStrategy,
    ) -> Result<BatchOutcome, EngineError> {
        let deltas = self.codec.merge_batches(payloads)?;
        Ok(self.merge.batch_process_deltas(&mut self.storage, &deltas, strategy))
    }

    pub fn merge_entry(&self, ctx: &MergeContext) -> MergeResult {
        self.merge.perform_3way_merge(ctx)
    }

    // ========================================================================
    // Patches
    // ========================================================================

    /// Fold the translated entries of one language file into a patch item
    /// keyed by translation key. Entries in conflict or without text are left
    /// out.
    pub fn build_patch_item(
        &self,
        patch_set: PatchSetId,
        language_file: LanguageFileId,
        container_id: &str,
        namespace: &str,
        locale: &str,
        policy: PatchPolicy,
    ) -> Result<PatchItem, EngineError> {
        let content: BTreeMap<String, String> = self
            .storage
            .entries_for_language_file(language_file)?
            .into_iter()
            .filter(TranslationEntry::is_translated)
            .map(|e| (e.key, e.dst_text))
            .collect();
        if content.is_empty() {
            return Err(EngineError::Validation(format!(
                "language file {language_file} has no translated entries"
            )));
        }
        let mut item = PatchItem::new(patch_set, container_id, namespace, locale, policy);
        item.set_content(content)?;
        Ok(item)
    }

    pub fn save_patch_set(&mut self, set: &PatchSet) -> Result<(), EngineError> {
        self.storage.save_patch_set(set)?;
        Ok(())
    }

    pub fn get_patch_set(&self, id: PatchSetId) -> Result<Option<PatchSet>, EngineError> {
        Ok(self.storage.get_patch_set(id)?)
    }

    fn require_patch_set(&self, id: PatchSetId) -> Result<PatchSet, EngineError> {
        self.storage
            .get_patch_set(id)?
            .ok_or_else(|| EngineError::PatchSetNotFound(id.to_string()))
    }

    pub fn publish_patch_set(&mut self, id: PatchSetId) -> Result<PatchSet, EngineError> {
        let mut set = self.require_patch_set(id)?;
        set.publish()?;
        self.storage.save_patch_set(&set)?;
        info!(patch_set = %id, items = set.items().len(), "patch set published");
        Ok(set)
    }

    /// Plan and execute every item of a published set. Containers are
    /// resolved as `containers_dir/{target_container_id}`.
    ///
    /// An item that cannot be planned or fails its preconditions yields an
    /// unsuccessful result and the remaining items still run, so the list
    /// always has one result per item. The set is marked applied only when
    /// every item succeeded.
    pub fn apply_patch_set(&mut self, id: PatchSetId, containers_dir: &Path) -> Result<Vec<ApplyResult>, EngineError> {
        let mut set = self.require_patch_set(id)?;
        if set.status != PatchStatus::Published {
            return Err(EngineError::Validation(format!(
                "patch set {id} is {}, not published",
                set.status.as_str()
            )));
        }

        let mut results = Vec::with_capacity(set.items().len());
        for item in set.items() {
            let container = containers_dir.join(&item.target_container_id);
            let result = match self.writeback.plan_patch_item(item, &container) {
                Ok(plan) => self.execute_item_plan(plan.plan_id)?,
                Err(e) => {
                    warn!(patch_set = %id, item = %item.id, error = %e, "patch item not planned");
                    let result = ApplyResult::rejected(strategy_for(item.policy), &container, e.to_string());
                    self.persist_result(&result)?;
                    result
                }
            };
            results.push(result);
        }

        if results.iter().all(|r| r.success) {
            set.mark_applied()?;
            self.storage.save_patch_set(&set)?;
            info!(patch_set = %id, items = results.len(), "patch set applied");
        } else {
            warn!(patch_set = %id, "patch set only partially applied");
        }
        Ok(results)
    }

    // ========================================================================
    // Writeback
    // ========================================================================

    pub fn create_plan(&self, request: PlanRequest) -> Result<WritebackPlan, EngineError> {
        self.writeback.create_plan(request)
    }

    /// Execute a plan and persist its result and backup record, including
    /// the failed result of a precondition error.
    pub fn execute_plan(&mut self, id: PlanId) -> Result<ApplyResult, EngineError> {
        match self.writeback.execute_plan(id) {
            Ok(result) => {
                self.persist_result(&result)?;
                Ok(result)
            }
            Err(e) => {
                if let Some(result) = self.writeback.results_for_plan(id).pop() {
                    self.persist_result(&result)?;
                }
                Err(e)
            }
        }
    }

    /// Like [`Engine::execute_plan`], but a refused plan comes back as its
    /// failed result. Storage errors still propagate.
    fn execute_item_plan(&mut self, id: PlanId) -> Result<ApplyResult, EngineError> {
        match self.execute_plan(id) {
            Ok(result) => Ok(result),
            Err(e @ EngineError::Storage(_)) => Err(e),
            Err(e) => match self.writeback.results_for_plan(id).pop() {
                Some(result) => Ok(result),
                None => Err(e),
            },
        }
    }

    fn persist_result(&mut self, result: &ApplyResult) -> Result<(), EngineError> {
        self.storage.append_apply_result(result)?;
        if let Some(backup) = &result.backup {
            self.storage.save_backup(backup)?;
        }
        Ok(())
    }

    /// Undo a successful write. Plans are looked up in this session's
    /// history first, then in stored history, and a rollback is recorded as
    /// a further result with `rollback_performed` set, so a plan is only
    /// undone once across restarts.
    pub fn rollback(&mut self, target: RollbackTarget<'_>) -> Result<bool, EngineError> {
        let (plan_id, given) = match target {
            RollbackTarget::Plan(id) => (id, None),
            RollbackTarget::Result(result) => (result.plan_id, Some(result.clone())),
        };
        let stored = self.storage.apply_results_for_plan(plan_id)?.pop();
        if stored.as_ref().is_some_and(|r| r.rollback_performed) {
            return Ok(false);
        }
        let Some(result) = given
            .or_else(|| self.writeback.results_for_plan(plan_id).pop())
            .or(stored)
        else {
            return Err(EngineError::PlanNotFound(plan_id.to_string()));
        };

        let undone = self.writeback.rollback(RollbackTarget::Result(&result))?;
        if undone {
            let mut record = result;
            record.rollback_available = false;
            record.rollback_performed = true;
            self.storage.append_apply_result(&record)?;
        }
        Ok(undone)
    }

    pub fn apply_history_for_target(&self, target: &Path) -> Result<Vec<ApplyResult>, EngineError> {
        Ok(self.storage.apply_results_for_target(target)?)
    }

    pub fn statistics(&self) -> WritebackStatistics {
        self.writeback.get_statistics()
    }

    /// Remove completed backups older than `days`, or the configured
    /// retention when `None`, from disk and from storage.
    pub fn cleanup_old_backups(&mut self, days: Option<u32>) -> Result<Vec<BackupId>, EngineError> {
        let days = days.unwrap_or(self.config.writeback.backup_retention_days);
        let removed = self.writeback.cleanup_old_backups(days);
        for id in &removed {
            self.storage.delete_backup(*id)?;
        }
        Ok(removed)
    }
}
