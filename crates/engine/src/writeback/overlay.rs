//! Overlay writeback: a resource pack directory that shadows the mod's
//! own language file without touching the archive.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use modlocale_core::cid::ContentHasher;
use modlocale_core::writeback::{ApplyResult, WritebackPlan, WritebackStrategy};

use super::failpoints::{Failpoints, OVERLAY_WRITE};
use super::{WritebackExecutor, lang, record_verification};
use crate::error::EngineError;

pub const PACK_META_FILE: &str = "pack.mcmeta";

pub struct OverlayExecutor {
    pack_format: u32,
    description: String,
    hasher: ContentHasher,
    failpoints: Failpoints,
}

impl OverlayExecutor {
    pub fn new(pack_format: u32, description: impl Into<String>, hasher: ContentHasher, failpoints: Failpoints) -> Self {
        Self {
            pack_format,
            description: description.into(),
            hasher,
            failpoints,
        }
    }

    /// Directory of the overlay pack for one namespace and locale.
    pub fn pack_dir(root: &Path, namespace: &str, locale: &str) -> PathBuf {
        root.join(format!("{namespace}_{locale}"))
    }

    fn pack_meta(&self) -> Result<Vec<u8>, EngineError> {
        let meta = serde_json::json!({
            "pack": {
                "pack_format": self.pack_format,
                "description": self.description,
            }
        });
        serde_json::to_vec_pretty(&meta).map_err(|e| EngineError::Validation(e.to_string()))
    }

    fn write(&self, plan: &WritebackPlan, result: &mut ApplyResult) -> Result<(), EngineError> {
        let pack_dir = &plan.target_path;
        let lang_path = pack_dir.join(&plan.member_path);
        result.before_hash = self.hasher.compute_file_if_exists(&lang_path)?.map(|c| c.hash_value);

        let lang_dir = lang_path
            .parent()
            .ok_or_else(|| EngineError::Validation(format!("bad member path {}", plan.member_path)))?;
        fs::create_dir_all(lang_dir)?;

        let content = if plan.merge_existing {
            lang::layer(lang::read_file_content(&lang_path)?.unwrap_or_default(), &plan.content)
        } else {
            plan.content.clone()
        };

        self.failpoints.check(OVERLAY_WRITE)?;
        lang::write_atomic(&pack_dir.join(PACK_META_FILE), &self.pack_meta()?)?;
        lang::write_atomic(&lang_path, &lang::render(&content)?)?;

        result.output_path = Some(pack_dir.clone());
        result.entries_written = plan.content.len();
        result.entries_skipped = content.len() - plan.content.len();
        let readback = lang::read_file_content(&lang_path)?;
        record_verification(&self.hasher, plan, result, &lang_path, &content, readback)
    }
}

impl WritebackExecutor for OverlayExecutor {
    fn strategy(&self) -> WritebackStrategy {
        WritebackStrategy::Overlay
    }

    fn execute(&self, plan: &WritebackPlan) -> ApplyResult {
        let mut result = ApplyResult::started(plan);
        match self.write(plan, &mut result) {
            Ok(()) => {
                result.success = true;
                result.rollback_available = true;
                info!(
                    plan = %plan.plan_id,
                    pack = %plan.target_path.display(),
                    entries = result.entries_written,
                    "overlay written"
                );
            }
            Err(e) => {
                error!(plan = %plan.plan_id, error = %e, "overlay write failed");
                result.fail(e.to_string());
            }
        }
        result.finish();
        result
    }

    fn rollback(&self, result: &ApplyResult) -> Result<bool, EngineError> {
        let Some(pack_dir) = &result.output_path else {
            return Ok(false);
        };
        if !pack_dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(pack_dir)?;
        info!(pack = %pack_dir.display(), "overlay removed");
        Ok(true)
    }
}
