//! Declarative patch model: a `PatchSet` groups `PatchItem`s, each one a
//! pending write of translated keys into a single language file.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cid::ContentHasher;
use crate::error::CoreError;
use crate::ids::{PatchItemId, PatchSetId};

pub const MANIFEST_FORMAT: &str = "modlocale.patch_set/1";

/// Hash of a language key map, independent of key insertion order.
pub fn language_content_hash(content: &BTreeMap<String, String>) -> Result<String, CoreError> {
    let value = Value::Object(
        content
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    );
    Ok(ContentHasher::default().compute_structured(&value)?.hash_value)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchPolicy {
    #[default]
    Overlay,
    Replace,
    Merge,
    CreateIfMissing,
}

impl PatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overlay => "overlay",
            Self::Replace => "replace",
            Self::Merge => "merge",
            Self::CreateIfMissing => "create_if_missing",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    #[default]
    Draft,
    Published,
    Applied,
    Archived,
}

impl PatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Applied => "applied",
            Self::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchValidationError {
    NoItems,
    DuplicateTarget {
        container: String,
        namespace: String,
        locale: String,
    },
    MissingContent(PatchItemId),
    MissingAnchor(PatchItemId),
}

impl fmt::Display for PatchValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoItems => write!(f, "patch set has no items"),
            Self::DuplicateTarget { container, namespace, locale } => {
                write!(f, "duplicate target {container} {namespace}:{locale}")
            }
            Self::MissingContent(id) => write!(f, "item {id} has neither content nor expected hash"),
            Self::MissingAnchor(id) => write!(f, "merge item {id} has no upstream anchor hash"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchItem {
    pub id: PatchItemId,
    pub patch_set_id: PatchSetId,
    pub target_container_id: String,
    pub namespace: String,
    pub locale: String,
    pub policy: PatchPolicy,
    pub expected_pre_image_hash: Option<String>,
    pub expected_entry_count: Option<usize>,
    pub target_member_path: Option<String>,
    pub upstream_anchor_hash: Option<String>,
    #[serde(default)]
    pub content: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PatchItem {
    pub fn new(
        patch_set_id: PatchSetId,
        target_container_id: impl Into<String>,
        namespace: impl Into<String>,
        locale: impl Into<String>,
        policy: PatchPolicy,
    ) -> Self {
        Self {
            id: PatchItemId::new(),
            patch_set_id,
            target_container_id: target_container_id.into(),
            namespace: namespace.into(),
            locale: locale.into(),
            policy,
            expected_pre_image_hash: None,
            expected_entry_count: None,
            target_member_path: None,
            upstream_anchor_hash: None,
            content: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_anchor(mut self, anchor: impl Into<String>) -> Self {
        self.upstream_anchor_hash = Some(anchor.into());
        self
    }

    pub fn with_member_path(mut self, path: impl Into<String>) -> Self {
        self.target_member_path = Some(path.into());
        self
    }

    /// Replace the content and freeze its hash and entry count.
    pub fn set_content(&mut self, entries: BTreeMap<String, String>) -> Result<(), CoreError> {
        self.expected_pre_image_hash = Some(language_content_hash(&entries)?);
        self.expected_entry_count = Some(entries.len());
        self.content = entries;
        Ok(())
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.expected_pre_image_hash.as_deref()
    }

    pub fn target_path(&self) -> String {
        match &self.target_member_path {
            Some(path) => path.clone(),
            None => format!("assets/{}/lang/{}.json", self.namespace, self.locale),
        }
    }

    /// `current_hash` is the hash of the live language content, `None` when
    /// the target does not exist yet.
    pub fn validate_preconditions(&self, current_hash: Option<&str>) -> bool {
        if self.policy == PatchPolicy::CreateIfMissing {
            return current_hash.is_none();
        }
        match &self.upstream_anchor_hash {
            Some(anchor) => current_hash == Some(anchor.as_str()),
            None => true,
        }
    }

    fn target_key(&self) -> (&str, &str, &str) {
        (&self.target_container_id, &self.namespace, &self.locale)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchSet {
    pub id: PatchSetId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub signature: Option<String>,
    pub version: u32,
    pub status: PatchStatus,
    items: Vec<PatchItem>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    format: String,
    exported_at: DateTime<Utc>,
    patch_set: PatchSet,
}

impl PatchSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PatchSetId::new(),
            name: name.into(),
            description: None,
            created_at: Utc::now(),
            signature: None,
            version: 1,
            status: PatchStatus::Draft,
            items: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    fn ensure_draft(&self) -> Result<(), CoreError> {
        if self.status != PatchStatus::Draft {
            return Err(CoreError::PatchSetFrozen(self.id.to_string(), self.status.as_str()));
        }
        Ok(())
    }

    pub fn items(&self) -> &[PatchItem] {
        &self.items
    }

    pub fn add_item(&mut self, mut item: PatchItem) -> Result<PatchItemId, CoreError> {
        self.ensure_draft()?;
        item.patch_set_id = self.id;
        let id = item.id;
        self.items.push(item);
        Ok(id)
    }

    pub fn remove_item(&mut self, id: PatchItemId) -> Result<bool, CoreError> {
        self.ensure_draft()?;
        let before = self.items.len();
        self.items.retain(|i| i.id != id);
        Ok(self.items.len() != before)
    }

    pub fn item_mut(&mut self, id: PatchItemId) -> Result<Option<&mut PatchItem>, CoreError> {
        self.ensure_draft()?;
        Ok(self.items.iter_mut().find(|i| i.id == id))
    }

    pub fn set_description(&mut self, description: impl Into<String>) -> Result<(), CoreError> {
        self.ensure_draft()?;
        self.description = Some(description.into());
        Ok(())
    }

    pub fn item(&self, id: PatchItemId) -> Option<&PatchItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn items_by_container(&self, container: &str) -> Vec<&PatchItem> {
        self.items.iter().filter(|i| i.target_container_id == container).collect()
    }

    pub fn items_by_locale(&self, locale: &str) -> Vec<&PatchItem> {
        self.items.iter().filter(|i| i.locale == locale).collect()
    }

    pub fn affected_containers(&self) -> BTreeSet<String> {
        self.items.iter().map(|i| i.target_container_id.clone()).collect()
    }

    pub fn affected_locales(&self) -> BTreeSet<String> {
        self.items.iter().map(|i| i.locale.clone()).collect()
    }

    pub fn validate(&self) -> Vec<PatchValidationError> {
        let mut errors = Vec::new();
        if self.items.is_empty() {
            errors.push(PatchValidationError::NoItems);
        }

        let mut seen = BTreeSet::new();
        for item in &self.items {
            if !seen.insert(item.target_key()) {
                let (container, namespace, locale) = item.target_key();
                errors.push(PatchValidationError::DuplicateTarget {
                    container: container.to_string(),
                    namespace: namespace.to_string(),
                    locale: locale.to_string(),
                });
            }
            if item.content.is_empty() && item.expected_pre_image_hash.is_none() {
                errors.push(PatchValidationError::MissingContent(item.id));
            }
            if item.policy == PatchPolicy::Merge && item.upstream_anchor_hash.is_none() {
                errors.push(PatchValidationError::MissingAnchor(item.id));
            }
        }
        errors
    }

    /// Hash over the sorted item content hashes joined with `|`.
    pub fn compute_signature(&self) -> String {
        let mut hashes: Vec<&str> = self.items.iter().filter_map(|i| i.content_hash()).collect();
        hashes.sort_unstable();
        ContentHasher::default().compute_text(&hashes.join("|")).hash_value
    }

    pub fn verify_signature(&self) -> bool {
        match &self.signature {
            Some(sig) => *sig == self.compute_signature(),
            None => false,
        }
    }

    /// Freeze content hashes that were never set, then validate and sign.
    pub fn publish(&mut self) -> Result<(), CoreError> {
        self.ensure_draft()?;
        for item in &mut self.items {
            if item.expected_pre_image_hash.is_none() && !item.content.is_empty() {
                let entries = std::mem::take(&mut item.content);
                item.set_content(entries)?;
            }
        }
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(CoreError::PatchValidation(errors));
        }
        self.signature = Some(self.compute_signature());
        self.status = PatchStatus::Published;
        Ok(())
    }

    pub fn mark_applied(&mut self) -> Result<(), CoreError> {
        self.transition(PatchStatus::Applied)
    }

    pub fn archive(&mut self) -> Result<(), CoreError> {
        self.transition(PatchStatus::Archived)
    }

    fn transition(&mut self, to: PatchStatus) -> Result<(), CoreError> {
        let allowed = matches!(
            (self.status, to),
            (PatchStatus::Published, PatchStatus::Applied)
                | (PatchStatus::Applied, PatchStatus::Applied)
                | (PatchStatus::Draft, PatchStatus::Archived)
                | (PatchStatus::Published, PatchStatus::Archived)
                | (PatchStatus::Applied, PatchStatus::Archived)
        );
        if !allowed {
            return Err(CoreError::InvalidTransition {
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// A new draft carrying copies of every item, ready for editing.
    pub fn derive_revision(&self) -> PatchSet {
        let id = PatchSetId::new();
        let items = self
            .items
            .iter()
            .map(|item| PatchItem {
                id: PatchItemId::new(),
                patch_set_id: id,
                ..item.clone()
            })
            .collect();
        let mut metadata = self.metadata.clone();
        metadata.insert("derived_from".into(), self.id.to_string());
        PatchSet {
            id,
            name: self.name.clone(),
            description: self.description.clone(),
            created_at: Utc::now(),
            signature: None,
            version: self.version + 1,
            status: PatchStatus::Draft,
            items,
            metadata,
        }
    }

    pub fn export_manifest(&self) -> Result<String, CoreError> {
        let manifest = Manifest {
            format: MANIFEST_FORMAT.to_string(),
            exported_at: Utc::now(),
            patch_set: self.clone(),
        };
        serde_json::to_string_pretty(&manifest).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_manifest(json: &str) -> Result<PatchSet, CoreError> {
        let manifest: Manifest =
            serde_json::from_str(json).map_err(|e| CoreError::Serialization(e.to_string()))?;
        if manifest.format != MANIFEST_FORMAT {
            return Err(CoreError::Serialization(format!(
                "unsupported manifest format {}",
                manifest.format
            )));
        }
        let set = manifest.patch_set;
        for item in set.items.iter().filter(|i| !i.content.is_empty()) {
            let actual = language_content_hash(&item.content)?;
            match &item.expected_pre_image_hash {
                Some(expected) if *expected != actual => {
                    return Err(CoreError::Integrity {
                        expected: expected.clone(),
                        actual,
                    });
                }
                // A signed set has every content hash frozen.
                None if set.signature.is_some() => {
                    return Err(CoreError::Integrity {
                        expected: format!("content hash for item {}", item.id),
                        actual,
                    });
                }
                _ => {}
            }
        }
        if let Some(sig) = &set.signature {
            let actual = set.compute_signature();
            if *sig != actual {
                return Err(CoreError::Integrity {
                    expected: sig.clone(),
                    actual,
                });
            }
        }
        Ok(set)
    }
}
