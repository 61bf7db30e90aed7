//! Three-way merge of translation entries and batch application of
//! incoming deltas against storage.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use modlocale_core::entry::{EntryDelta, EntryStatus, TranslationEntry};
use modlocale_core::field_value::FieldValue;
use modlocale_core::ids::EntryUid;
use modlocale_storage::Storage;

use crate::resolve::{
    ConflictItem, ConflictResolution, ConflictResolver, ConflictResolverChain, FieldPolicy,
    ResolutionStrategy, ThreeWayMergeResolver,
};

pub const MERGE_CONFLICT_FLAG: &str = "merge_conflict";

/// What to do when both sides hold an entry with no common base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoBaseFallback {
    #[default]
    TakeRemote,
    TakeLocal,
    MarkConflict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    MarkForReview,
    AutoResolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeField {
    DstText,
    Status,
    QaFlags,
}

impl MergeField {
    pub const ALL: [MergeField; 3] = [MergeField::DstText, MergeField::Status, MergeField::QaFlags];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DstText => "dst_text",
            Self::Status => "status",
            Self::QaFlags => "qa_flags",
        }
    }

    fn read(&self, entry: &TranslationEntry) -> FieldValue {
        match self {
            Self::DstText => FieldValue::Text(entry.dst_text.clone()),
            Self::Status => FieldValue::Text(entry.status.as_str().to_string()),
            Self::QaFlags => FieldValue::Map(entry.qa_flags.clone()),
        }
    }

    /// Store `value` into `entry`; false when the value has the wrong shape.
    fn write(&self, entry: &mut TranslationEntry, value: &FieldValue) -> bool {
        match (self, value) {
            (Self::DstText, FieldValue::Text(t)) => {
                entry.dst_text = t.clone();
                true
            }
            (Self::Status, FieldValue::Text(t)) => match EntryStatus::parse(t) {
                Some(status) => {
                    entry.status = status;
                    true
                }
                None => false,
            },
            (Self::QaFlags, FieldValue::Map(m)) => {
                entry.qa_flags = m.clone();
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for MergeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum MergeStrategy {
    #[default]
    ThreeWay,
    TakeRemote,
    TakeLocal,
    FieldLevel(BTreeMap<MergeField, FieldPolicy>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeContext {
    pub base_entry: Option<TranslationEntry>,
    /// `None` when this side never had the entry or deleted it.
    pub local_entry: Option<TranslationEntry>,
    /// `None` when the remote side deleted the entry.
    pub remote_entry: Option<TranslationEntry>,
    pub merge_strategy: MergeStrategy,
    pub conflict_resolution_policy: ConflictPolicy,
}

impl MergeContext {
    pub fn new(
        base_entry: Option<TranslationEntry>,
        local_entry: Option<TranslationEntry>,
        remote_entry: Option<TranslationEntry>,
    ) -> Self {
        Self {
            base_entry,
            local_entry,
            remote_entry,
            merge_strategy: MergeStrategy::default(),
            conflict_resolution_policy: ConflictPolicy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_resolution_policy = policy;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub success: bool,
    /// `None` means the entry is deleted.
    pub merged_entry: Option<TranslationEntry>,
    pub has_conflict: bool,
    pub conflict_reason: Option<String>,
    pub conflicting_fields: Vec<MergeField>,
    pub resolutions: BTreeMap<MergeField, ConflictResolution>,
    pub error: Option<String>,
}

impl MergeResult {
    fn clean(merged_entry: Option<TranslationEntry>) -> Self {
        Self {
            success: true,
            merged_entry,
            has_conflict: false,
            conflict_reason: None,
            conflicting_fields: Vec::new(),
            resolutions: BTreeMap::new(),
            error: None,
        }
    }

    fn conflicted(merged_entry: Option<TranslationEntry>, reason: impl Into<String>, fields: Vec<MergeField>) -> Self {
        Self {
            has_conflict: true,
            conflict_reason: Some(reason.into()),
            conflicting_fields: fields,
            ..Self::clean(merged_entry)
        }
    }

    /// True when the merged entry was left for a human to decide.
    pub fn needs_review(&self) -> bool {
        self.merged_entry
            .as_ref()
            .is_some_and(|e| e.status == EntryStatus::Conflict && e.qa_flags.contains_key(MERGE_CONFLICT_FLAG))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub errors: usize,
    pub conflict_uids: Vec<EntryUid>,
    pub error_messages: Vec<String>,
}

pub struct MergeEngine {
    no_base_fallback: NoBaseFallback,
    conflict_policy: ConflictPolicy,
    prefer_newest: bool,
    chain: ConflictResolverChain,
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new(NoBaseFallback::default(), ConflictPolicy::default(), true)
    }
}

impl MergeEngine {
    pub fn new(no_base_fallback: NoBaseFallback, conflict_policy: ConflictPolicy, prefer_newest: bool) -> Self {
        Self {
            no_base_fallback,
            conflict_policy,
            prefer_newest,
            chain: ConflictResolverChain::standard(prefer_newest),
        }
    }

    pub fn with_chain(mut self, chain: ConflictResolverChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.conflict_policy
    }

    pub fn perform_3way_merge(&self, ctx: &MergeContext) -> MergeResult {
        let strategy = &ctx.merge_strategy;
        match (&ctx.base_entry, &ctx.local_entry, &ctx.remote_entry) {
            (_, None, None) => MergeResult::clean(None),
            (None, Some(local), None) => MergeResult::clean(Some(local.clone())),
            (None, None, Some(remote)) => MergeResult::clean(Some(remote.clone())),
            (None, Some(local), Some(remote)) => self.merge_without_base(local, remote),
            (Some(base), Some(local), None) => merge_remote_delete(base, local, strategy),
            (Some(base), None, Some(remote)) => merge_local_delete(base, remote, strategy),
            (Some(base), Some(local), Some(remote)) => {
                self.merge_fields(base, local, remote, strategy, ctx.conflict_resolution_policy)
            }
        }
    }

    fn merge_without_base(&self, local: &TranslationEntry, remote: &TranslationEntry) -> MergeResult {
        if !local.content_differs(remote) {
            return MergeResult::clean(Some(local.clone()));
        }
        match self.no_base_fallback {
            NoBaseFallback::TakeRemote => MergeResult::clean(Some(remote.clone())),
            NoBaseFallback::TakeLocal => MergeResult::clean(Some(local.clone())),
            NoBaseFallback::MarkConflict => {
                let fields = differing_fields(local, remote);
                let merged = mark_for_review(local.clone(), remote, &fields, "no common base");
                MergeResult::conflicted(Some(merged), "both sides created the entry without a common base", fields)
            }
        }
    }

    fn merge_fields(
        &self,
        base: &TranslationEntry,
        local: &TranslationEntry,
        remote: &TranslationEntry,
        strategy: &MergeStrategy,
        policy: ConflictPolicy,
    ) -> MergeResult {
        let mut merged = local.clone();
        // non-mergeable fields follow upstream unless changed locally
        if local.src_text == base.src_text {
            merged.src_text = remote.src_text.clone();
        }
        if local.key == base.key {
            merged.key = remote.key.clone();
        }
        merged.updated_at = local.updated_at.max(remote.updated_at);

        let mut conflicts = Vec::new();
        for field in MergeField::ALL {
            let (b, l, r) = (field.read(base), field.read(local), field.read(remote));
            let local_changed = l != b;
            let remote_changed = r != b;
            match (local_changed, remote_changed) {
                (false, true) => {
                    field.write(&mut merged, &r);
                }
                (true, true) if l != r => conflicts.push(field),
                _ => {}
            }
        }

        if conflicts.is_empty() {
            return MergeResult::clean(Some(merged));
        }
        debug!(
            uid = %local.uid,
            key = %local.key,
            fields = ?conflicts,
            "conflicting field changes"
        );

        let mut resolutions = BTreeMap::new();
        let mut unresolved = Vec::new();
        for field in &conflicts {
            let item = ConflictItem::new(field.as_str(), field.read(local), field.read(remote))
                .with_base(field.read(base))
                .with_timestamps(local.updated_at, remote.updated_at);
            let resolution = match strategy {
                MergeStrategy::TakeRemote => Some(ConflictResolution {
                    resolved_value: item.remote_value.clone(),
                    strategy_used: ResolutionStrategy::TakeRemote,
                    confidence: 1.0,
                    manual_review_required: false,
                    notes: None,
                }),
                MergeStrategy::TakeLocal => Some(ConflictResolution {
                    resolved_value: item.local_value.clone(),
                    strategy_used: ResolutionStrategy::TakeLocal,
                    confidence: 1.0,
                    manual_review_required: false,
                    notes: None,
                }),
                MergeStrategy::ThreeWay => match policy {
                    ConflictPolicy::AutoResolve => Some(self.chain.resolve(&item)),
                    ConflictPolicy::MarkForReview => None,
                },
                MergeStrategy::FieldLevel(policies) => {
                    policies.get(field).map(|p| self.apply_field_policy(*p, &item))
                }
            };

            match resolution {
                Some(res) if res.is_accepted() && field.write(&mut merged, &res.resolved_value) => {
                    resolutions.insert(*field, res);
                }
                Some(res) => {
                    resolutions.insert(*field, res);
                    unresolved.push(*field);
                }
                None => unresolved.push(*field),
            }
        }

        if !unresolved.is_empty() {
            merged = mark_for_review(merged, remote, &unresolved, "conflicting edits");
        }
        let reason = format!(
            "both sides changed {}",
            conflicts.iter().map(MergeField::as_str).collect::<Vec<_>>().join(", ")
        );
        MergeResult {
            resolutions,
            ..MergeResult::conflicted(Some(merged), reason, conflicts)
        }
    }

    fn apply_field_policy(&self, policy: FieldPolicy, item: &ConflictItem) -> ConflictResolution {
        let fixed = |value: &FieldValue, strategy| ConflictResolution {
            resolved_value: value.clone(),
            strategy_used: strategy,
            confidence: 1.0,
            manual_review_required: false,
            notes: None,
        };
        match policy {
            FieldPolicy::Local => fixed(&item.local_value, ResolutionStrategy::TakeLocal),
            FieldPolicy::Remote => fixed(&item.remote_value, ResolutionStrategy::TakeRemote),
            FieldPolicy::Newest => {
                let local_newer = match (item.local_timestamp, item.remote_timestamp) {
                    (Some(l), Some(r)) => {
                        if self.prefer_newest {
                            l > r
                        } else {
                            l < r
                        }
                    }
                    _ => false,
                };
                let value = if local_newer { &item.local_value } else { &item.remote_value };
                fixed(value, ResolutionStrategy::Newest)
            }
            FieldPolicy::Merge => match ThreeWayMergeResolver.resolve(item) {
                Ok(res) => res,
                Err(e) => ConflictResolution {
                    resolved_value: item.local_value.clone(),
                    strategy_used: ResolutionStrategy::ChainFailed,
                    confidence: 0.0,
                    manual_review_required: true,
                    notes: Some(e.to_string()),
                },
            },
        }
    }

    /// Merge each incoming delta against the live entry and its stored base,
    /// write the outcome and advance the base to the remote version.
    pub fn batch_process_deltas<S: Storage>(
        &self,
        storage: &mut S,
        deltas: &[EntryDelta],
        strategy: &MergeStrategy,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for delta in deltas {
            outcome.processed += 1;
            if let Err(message) = self.process_delta(storage, delta, strategy, &mut outcome) {
                warn!(uid = %delta.entry_uid, key = %delta.key, error = %message, "delta failed");
                outcome.errors += 1;
                outcome.error_messages.push(format!("{}: {message}", delta.entry_uid));
            }
        }
        info!(
            processed = outcome.processed,
            created = outcome.created,
            updated = outcome.updated,
            deleted = outcome.deleted,
            conflicts = outcome.conflicts,
            errors = outcome.errors,
            "batch merge finished"
        );
        outcome
    }

    fn process_delta<S: Storage>(
        &self,
        storage: &mut S,
        delta: &EntryDelta,
        strategy: &MergeStrategy,
        outcome: &mut BatchOutcome,
    ) -> Result<(), String> {
        let uid = delta.entry_uid;
        let local = storage.get_entry(uid).map_err(|e| e.to_string())?;
        let base = storage.get_base(uid).map_err(|e| e.to_string())?;
        let remote = delta.to_entry();

        let ctx = MergeContext::new(base, local, remote)
            .with_strategy(strategy.clone())
            .with_policy(self.conflict_policy);
        let result = self.perform_3way_merge(&ctx);
        if !result.success {
            return Err(result.error.unwrap_or_else(|| "merge failed".to_string()));
        }

        storage
            .apply_merge(uid, result.merged_entry.as_ref(), ctx.remote_entry.as_ref())
            .map_err(|e| e.to_string())?;

        if result.has_conflict {
            outcome.conflicts += 1;
            outcome.conflict_uids.push(uid);
            return Ok(());
        }
        match (&ctx.local_entry, &result.merged_entry) {
            (None, Some(_)) => outcome.created += 1,
            (Some(_), None) => outcome.deleted += 1,
            (Some(before), Some(after)) if before != after => outcome.updated += 1,
            _ => outcome.unchanged += 1,
        }
        Ok(())
    }
}

fn differing_fields(a: &TranslationEntry, b: &TranslationEntry) -> Vec<MergeField> {
    MergeField::ALL
        .into_iter()
        .filter(|f| f.read(a) != f.read(b))
        .collect()
}

/// Keep `entry` as is, set status `conflict` and record both sides under
/// the `merge_conflict` flag.
fn mark_for_review(
    mut entry: TranslationEntry,
    remote: &TranslationEntry,
    fields: &[MergeField],
    reason: &str,
) -> TranslationEntry {
    let mut detail = BTreeMap::new();
    detail.insert("reason".to_string(), FieldValue::Text(reason.to_string()));
    detail.insert("local_dst_text".to_string(), FieldValue::Text(entry.dst_text.clone()));
    detail.insert("remote_dst_text".to_string(), FieldValue::Text(remote.dst_text.clone()));
    detail.insert(
        "remote_status".to_string(),
        FieldValue::Text(remote.status.as_str().to_string()),
    );
    detail.insert(
        "remote_updated_at".to_string(),
        FieldValue::Text(remote.updated_at.to_rfc3339()),
    );
    detail.insert(
        "fields".to_string(),
        FieldValue::List(fields.iter().map(|f| FieldValue::from(f.as_str())).collect()),
    );
    entry.status = EntryStatus::Conflict;
    entry.qa_flags.insert(MERGE_CONFLICT_FLAG.to_string(), FieldValue::Map(detail));
    entry
}

fn merge_remote_delete(base: &TranslationEntry, local: &TranslationEntry, strategy: &MergeStrategy) -> MergeResult {
    if !local.content_differs(base) {
        return MergeResult::clean(None);
    }
    let fields = differing_fields(base, local);
    let reason = "deleted remotely but modified locally";
    match strategy {
        MergeStrategy::TakeRemote => MergeResult::conflicted(None, reason, fields),
        MergeStrategy::TakeLocal => MergeResult::conflicted(Some(local.clone()), reason, fields),
        MergeStrategy::ThreeWay | MergeStrategy::FieldLevel(_) => {
            let merged = mark_for_review(local.clone(), base, &fields, "remote deleted");
            MergeResult::conflicted(Some(merged), reason, fields)
        }
    }
}

fn merge_local_delete(base: &TranslationEntry, remote: &TranslationEntry, strategy: &MergeStrategy) -> MergeResult {
    if !remote.content_differs(base) {
        return MergeResult::clean(None);
    }
    let fields = differing_fields(base, remote);
    let reason = "deleted locally but modified remotely";
    match strategy {
        MergeStrategy::TakeLocal => MergeResult::conflicted(None, reason, fields),
        MergeStrategy::TakeRemote => MergeResult::conflicted(Some(remote.clone()), reason, fields),
        MergeStrategy::ThreeWay | MergeStrategy::FieldLevel(_) => {
            let merged = mark_for_review(remote.clone(), remote, &fields, "local deleted");
            MergeResult::conflicted(Some(merged), reason, fields)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use modlocale_core::ids::LanguageFileId;
    use modlocale_storage::SqliteStorage;

    fn base_entry() -> TranslationEntry {
        let mut e = TranslationEntry::new(LanguageFileId::new(), "item.examplemod.ruby", "Ruby");
        e.translate("Rubin");
        e
    }

    fn edited(base: &TranslationEntry, dst: &str, secs: i64) -> TranslationEntry {
        let mut e = base.clone();
        e.dst_text = dst.to_string();
        e.updated_at = base.updated_at + Duration::seconds(secs);
        e
    }

    #[test]
    fn unchanged_everywhere_keeps_local() {
        let entry = base_entry();
        let ctx = MergeContext::new(Some(entry.clone()), Some(entry.clone()), Some(entry.clone()));
        for strategy in [MergeStrategy::ThreeWay, MergeStrategy::TakeRemote, MergeStrategy::TakeLocal] {
            let result = MergeEngine::default().perform_3way_merge(&ctx.clone().with_strategy(strategy));
            assert!(result.success);
            assert!(!result.has_conflict);
            assert!(result.conflicting_fields.is_empty());
            assert_eq!(result.merged_entry, Some(entry.clone()));
        }
    }

    #[test]
    fn one_sided_change_is_taken() {
        let base = base_entry();
        let remote = edited(&base, "Roter Rubin", 1);
        let ctx = MergeContext::new(Some(base.clone()), Some(base.clone()), Some(remote.clone()));
        let result = MergeEngine::default().perform_3way_merge(&ctx);
        assert!(result.success);
        assert!(!result.has_conflict);
        assert_eq!(result.merged_entry.unwrap().dst_text, "Roter Rubin");
    }

    #[test]
    fn identical_changes_do_not_conflict() {
        let base = base_entry();
        let local = edited(&base, "Rubinstein", 1);
        let remote = edited(&base, "Rubinstein", 2);
        let result = MergeEngine::default().perform_3way_merge(&MergeContext::new(
            Some(base),
            Some(local),
            Some(remote.clone()),
        ));
        assert!(!result.has_conflict);
        let merged = result.merged_entry.unwrap();
        assert_eq!(merged.dst_text, "Rubinstein");
        assert_eq!(merged.updated_at, remote.updated_at);
    }

    #[test]
    fn disjoint_fields_merge_cleanly() {
        let base = base_entry();
        let local = edited(&base, "Roter Rubin", 1);
        let mut remote = base.clone();
        remote.status = EntryStatus::Approved;
        let result = MergeEngine::default().perform_3way_merge(&MergeContext::new(
            Some(base),
            Some(local),
            Some(remote),
        ));
        assert!(!result.has_conflict);
        let merged = result.merged_entry.unwrap();
        assert_eq!(merged.dst_text, "Roter Rubin");
        assert_eq!(merged.status, EntryStatus::Approved);
    }

    #[test]
    fn conflict_marks_for_review_and_keeps_local() {
        let base = base_entry();
        let local = edited(&base, "Roter Rubin", 1);
        let remote = edited(&base, "Edelrubin", 2);
        let result = MergeEngine::default().perform_3way_merge(&MergeContext::new(
            Some(base),
            Some(local),
            Some(remote),
        ));
        assert!(result.success);
        assert!(result.has_conflict);
        assert_eq!(result.conflicting_fields, vec![MergeField::DstText]);
        assert!(result.needs_review());
        let merged = result.merged_entry.unwrap();
        assert_eq!(merged.dst_text, "Roter Rubin");
        assert_eq!(merged.status, EntryStatus::Conflict);
        let flag = merged.qa_flags.get(MERGE_CONFLICT_FLAG).and_then(|f| f.as_map()).unwrap();
        assert_eq!(flag.get("remote_dst_text"), Some(&FieldValue::from("Edelrubin")));
        assert_eq!(flag.get("local_dst_text"), Some(&FieldValue::from("Roter Rubin")));
    }

    #[test]
    fn take_remote_and_take_local_still_report_conflict() {
        let base = base_entry();
        let local = edited(&base, "Roter Rubin", 1);
        let remote = edited(&base, "Edelrubin", 2);
        let engine = MergeEngine::default();

        let ctx = MergeContext::new(Some(base.clone()), Some(local.clone()), Some(remote.clone()))
            .with_strategy(MergeStrategy::TakeRemote);
        let result = engine.perform_3way_merge(&ctx);
        assert!(result.has_conflict);
        assert!(!result.needs_review());
        assert_eq!(result.merged_entry.unwrap().dst_text, "Edelrubin");

        let ctx = MergeContext::new(Some(base), Some(local), Some(remote)).with_strategy(MergeStrategy::TakeLocal);
        let merged = engine.perform_3way_merge(&ctx).merged_entry.unwrap();
        assert_eq!(merged.dst_text, "Roter Rubin");
        assert_eq!(merged.status, EntryStatus::Translated);
    }

    #[test]
    fn auto_resolve_uses_chain() {
        let base = base_entry();
        let local = edited(&base, "Roter Rubin", 1);
        let remote = edited(&base, "Edelrubin", 2);
        let ctx = MergeContext::new(Some(base), Some(local), Some(remote)).with_policy(ConflictPolicy::AutoResolve);
        let result = MergeEngine::default().perform_3way_merge(&ctx);
        assert!(result.has_conflict);
        assert!(!result.needs_review());
        assert_eq!(result.merged_entry.unwrap().dst_text, "Edelrubin");
        let res = &result.resolutions[&MergeField::DstText];
        assert_eq!(res.strategy_used, ResolutionStrategy::Newest);
    }

    #[test]
    fn field_level_policies() {
        let base = base_entry();
        let mut local = edited(&base, "Roter Rubin", 1);
        local.status = EntryStatus::Reviewed;
        let mut remote = edited(&base, "Edelrubin", 2);
        remote.status = EntryStatus::Approved;

        let strategy = MergeStrategy::FieldLevel(BTreeMap::from([(MergeField::DstText, FieldPolicy::Local)]));
        let ctx = MergeContext::new(Some(base), Some(local), Some(remote)).with_strategy(strategy);
        let result = MergeEngine::default().perform_3way_merge(&ctx);
        assert_eq!(result.conflicting_fields, vec![MergeField::DstText, MergeField::Status]);
        let merged = result.merged_entry.unwrap();
        assert_eq!(merged.dst_text, "Roter Rubin");
        // status had no policy
        assert_eq!(merged.status, EntryStatus::Conflict);
        assert!(result.resolutions.contains_key(&MergeField::DstText));
    }

    #[test]
    fn no_base_cases() {
        let engine = MergeEngine::default();
        let local = base_entry();
        let mut remote = local.clone();
        remote.dst_text = "Rubin!".into();

        let only_local = engine.perform_3way_merge(&MergeContext::new(None, Some(local.clone()), None));
        assert_eq!(only_local.merged_entry, Some(local.clone()));

        let same = engine.perform_3way_merge(&MergeContext::new(None, Some(local.clone()), Some(local.clone())));
        assert_eq!(same.merged_entry, Some(local.clone()));

        let fallback = engine.perform_3way_merge(&MergeContext::new(None, Some(local.clone()), Some(remote.clone())));
        assert_eq!(fallback.merged_entry, Some(remote.clone()));

        let marking = MergeEngine::new(NoBaseFallback::MarkConflict, ConflictPolicy::MarkForReview, true);
        let marked = marking.perform_3way_merge(&MergeContext::new(None, Some(local), Some(remote)));
        assert!(marked.has_conflict);
        assert!(marked.needs_review());
    }

    #[test]
    fn remote_delete() {
        let base = base_entry();
        let engine = MergeEngine::default();
        let clean = engine.perform_3way_merge(&MergeContext::new(Some(base.clone()), Some(base.clone()), None));
        assert!(clean.success);
        assert!(clean.merged_entry.is_none());

        let local = edited(&base, "Roter Rubin", 1);
        let kept = engine.perform_3way_merge(&MergeContext::new(Some(base), Some(local), None));
        assert!(kept.has_conflict);
        let merged = kept.merged_entry.unwrap();
        assert_eq!(merged.dst_text, "Roter Rubin");
        assert_eq!(merged.status, EntryStatus::Conflict);
    }

    fn seeded() -> (SqliteStorage, TranslationEntry) {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let base = base_entry();
        storage.apply_merge(base.uid, Some(&base), Some(&base)).unwrap();
        (storage, base)
    }

    #[test]
    fn batch_counts_and_advances_base() {
        let (mut storage, base) = seeded();
        let engine = MergeEngine::default();

        let remote_update = edited(&base, "Roter Rubin", 1);
        let fresh = TranslationEntry::new(base.language_file_uid, "item.examplemod.opal", "Opal");
        let deltas = vec![EntryDelta::update(&remote_update), EntryDelta::create(&fresh)];
        let outcome = engine.batch_process_deltas(&mut storage, &deltas, &MergeStrategy::ThreeWay);

        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.conflicts, 0);
        assert_eq!(storage.get_entry(base.uid).unwrap().unwrap().dst_text, "Roter Rubin");
        assert_eq!(storage.get_base(base.uid).unwrap(), Some(remote_update));
        assert!(storage.get_entry(fresh.uid).unwrap().is_some());

        let outcome = engine.batch_process_deltas(&mut storage, &[EntryDelta::delete(&fresh)], &MergeStrategy::ThreeWay);
        assert_eq!(outcome.deleted, 1);
        assert!(storage.get_entry(fresh.uid).unwrap().is_none());
        assert!(storage.get_base(fresh.uid).unwrap().is_none());
    }

    #[test]
    fn batch_records_conflicts() {
        let (mut storage, base) = seeded();
        storage.put_entry(&edited(&base, "Lokal", 1)).unwrap();
        let remote = edited(&base, "Entfernt", 2);

        let outcome = MergeEngine::default().batch_process_deltas(
            &mut storage,
            &[EntryDelta::update(&remote)],
            &MergeStrategy::ThreeWay,
        );
        assert_eq!(outcome.conflicts, 1);
        assert_eq!(outcome.conflict_uids, vec![base.uid]);
        assert_eq!(outcome.updated, 0);
        let stored = storage.get_entry(base.uid).unwrap().unwrap();
        assert_eq!(stored.status, EntryStatus::Conflict);
        assert_eq!(stored.dst_text, "Lokal");
    }
}
