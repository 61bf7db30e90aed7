use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::field_value::FieldValue;
use crate::ids::{EntryUid, LanguageFileId};

pub type QaFlags = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Untranslated,
    Translated,
    Reviewed,
    Approved,
    Conflict,
    Deprecated,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Untranslated => "untranslated",
            Self::Translated => "translated",
            Self::Reviewed => "reviewed",
            Self::Approved => "approved",
            Self::Conflict => "conflict",
            Self::Deprecated => "deprecated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "untranslated" => Self::Untranslated,
            "translated" => Self::Translated,
            "reviewed" => Self::Reviewed,
            "approved" => Self::Approved,
            "conflict" => Self::Conflict,
            "deprecated" => Self::Deprecated,
            _ => return None,
        })
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single translatable key inside one language file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationEntry {
    pub uid: EntryUid,
    pub key: String,
    pub src_text: String,
    pub dst_text: String,
    pub status: EntryStatus,
    pub language_file_uid: LanguageFileId,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub qa_flags: QaFlags,
}

impl TranslationEntry {
    pub fn new(language_file_uid: LanguageFileId, key: impl Into<String>, src_text: impl Into<String>) -> Self {
        Self {
            uid: EntryUid::new(),
            key: key.into(),
            src_text: src_text.into(),
            dst_text: String::new(),
            status: EntryStatus::Untranslated,
            language_file_uid,
            updated_at: Utc::now(),
            qa_flags: QaFlags::new(),
        }
    }

    /// Set the translated text, bumping status and timestamp.
    pub fn translate(&mut self, dst_text: impl Into<String>) {
        self.dst_text = dst_text.into();
        if self.status == EntryStatus::Untranslated {
            self.status = EntryStatus::Translated;
        }
        self.updated_at = Utc::now();
    }

    /// True when the mergeable fields differ from `other`.
    pub fn content_differs(&self, other: &TranslationEntry) -> bool {
        self.dst_text != other.dst_text || self.status != other.status || self.qa_flags != other.qa_flags
    }

    pub fn is_translated(&self) -> bool {
        !self.dst_text.is_empty() && !matches!(self.status, EntryStatus::Conflict | EntryStatus::Deprecated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOperation {
    Create,
    Update,
    Delete,
}

impl DeltaOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Unit of exchange between peers. For `Delete` the remaining fields carry
/// the last known state of the entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDelta {
    pub entry_uid: EntryUid,
    pub operation: DeltaOperation,
    pub key: String,
    pub src_text: String,
    pub dst_text: String,
    pub status: EntryStatus,
    pub language_file_uid: LanguageFileId,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub qa_flags: QaFlags,
}

impl EntryDelta {
    pub fn from_entry(entry: &TranslationEntry, operation: DeltaOperation) -> Self {
        Self {
            entry_uid: entry.uid,
            operation,
            key: entry.key.clone(),
            src_text: entry.src_text.clone(),
            dst_text: entry.dst_text.clone(),
            status: entry.status,
            language_file_uid: entry.language_file_uid,
            updated_at: entry.updated_at,
            qa_flags: entry.qa_flags.clone(),
        }
    }

    pub fn create(entry: &TranslationEntry) -> Self {
        Self::from_entry(entry, DeltaOperation::Create)
    }

    pub fn update(entry: &TranslationEntry) -> Self {
        Self::from_entry(entry, DeltaOperation::Update)
    }

    pub fn delete(entry: &TranslationEntry) -> Self {
        Self::from_entry(entry, DeltaOperation::Delete)
    }

    pub fn is_delete(&self) -> bool {
        self.operation == DeltaOperation::Delete
    }

    /// The remote version of the entry this delta describes, `None` for deletes.
    pub fn to_entry(&self) -> Option<TranslationEntry> {
        if self.is_delete() {
            return None;
        }
        Some(self.as_entry())
    }

    /// Entry view regardless of operation.
    pub fn as_entry(&self) -> TranslationEntry {
        TranslationEntry {
            uid: self.entry_uid,
            key: self.key.clone(),
            src_text: self.src_text.clone(),
            dst_text: self.dst_text.clone(),
            status: self.status,
            language_file_uid: self.language_file_uid,
            updated_at: self.updated_at,
            qa_flags: self.qa_flags.clone(),
        }
    }
}
