use std::path::Path;

use modlocale_core::{
    entry::TranslationEntry,
    ids::*,
    patch::PatchSet,
    writeback::{ApplyResult, BackupInfo},
};

use crate::error::StorageError;

/// Persistence for live entries, their last-synced base, patch sets,
/// writeback history and backup records.
pub trait Storage {
    fn get_entry(&self, uid: EntryUid) -> Result<Option<TranslationEntry>, StorageError>;

    fn put_entry(&mut self, entry: &TranslationEntry) -> Result<(), StorageError>;

    fn delete_entry(&mut self, uid: EntryUid) -> Result<bool, StorageError>;

    fn list_entries(&self) -> Result<Vec<TranslationEntry>, StorageError>;

    fn entries_for_language_file(
        &self,
        language_file_uid: LanguageFileId,
    ) -> Result<Vec<TranslationEntry>, StorageError>;

    /// The version of an entry both sides last agreed on.
    fn get_base(&self, uid: EntryUid) -> Result<Option<TranslationEntry>, StorageError>;

    fn put_base(&mut self, entry: &TranslationEntry) -> Result<(), StorageError>;

    fn delete_base(&mut self, uid: EntryUid) -> Result<bool, StorageError>;

    fn list_bases(&self) -> Result<Vec<TranslationEntry>, StorageError>;

    /// Write a merge outcome atomically: the live entry (or its deletion)
    /// together with the new base (or its deletion).
    fn apply_merge(
        &mut self,
        uid: EntryUid,
        merged: Option<&TranslationEntry>,
        base: Option<&TranslationEntry>,
    ) -> Result<(), StorageError>;

    fn save_patch_set(&mut self, set: &PatchSet) -> Result<(), StorageError>;

    fn get_patch_set(&self, id: PatchSetId) -> Result<Option<PatchSet>, StorageError>;

    fn list_patch_sets(&self) -> Result<Vec<PatchSet>, StorageError>;

    fn append_apply_result(&mut self, result: &ApplyResult) -> Result<(), StorageError>;

    fn apply_results_for_plan(&self, plan_id: PlanId) -> Result<Vec<ApplyResult>, StorageError>;

    fn apply_results_for_target(&self, target: &Path) -> Result<Vec<ApplyResult>, StorageError>;

    fn apply_result_count(&self) -> Result<u64, StorageError>;

    fn save_backup(&mut self, info: &BackupInfo) -> Result<(), StorageError>;

    fn get_backup(&self, id: BackupId) -> Result<Option<BackupInfo>, StorageError>;

    fn list_backups(&self) -> Result<Vec<BackupInfo>, StorageError>;

    fn delete_backup(&mut self, id: BackupId) -> Result<bool, StorageError>;
}
