//! In-place writeback: replace one language member inside a mod archive.
//!
//! The archive is rebuilt into a temp file next to the target. Every other
//! member is copied raw, so its compressed bytes and metadata are unchanged.
//! The temp file only replaces the target after it has been synced.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use modlocale_core::cid::ContentHasher;
use modlocale_core::writeback::{ApplyResult, WritebackPlan, WritebackStrategy};

use super::backup::BackupStore;
use super::failpoints::{BEFORE_RENAME, BEFORE_REWRITE, Failpoints, MID_REWRITE};
use super::lang::{self, LanguageContent};
use super::{WritebackExecutor, record_verification};
use crate::error::EngineError;

pub struct InPlaceExecutor {
    backups: Arc<BackupStore>,
    hasher: ContentHasher,
    failpoints: Failpoints,
}

impl InPlaceExecutor {
    pub fn new(backups: Arc<BackupStore>, hasher: ContentHasher, failpoints: Failpoints) -> Self {
        Self {
            backups,
            hasher,
            failpoints,
        }
    }

    fn write(&self, plan: &WritebackPlan, result: &mut ApplyResult) -> Result<(), EngineError> {
        let target = &plan.target_path;
        result.before_hash = Some(self.hasher.compute_file(target)?.hash_value);
        if plan.backup_required {
            result.backup = Some(self.backups.create(target)?);
        }

        self.failpoints.check(BEFORE_REWRITE)?;
        let content = if plan.merge_existing {
            let existing = lang::read_member_content(target, &plan.member_path)?.unwrap_or_default();
            lang::layer(existing, &plan.content)
        } else {
            plan.content.clone()
        };
        self.rewrite(target, &plan.member_path, &content)?;

        result.output_path = Some(target.clone());
        result.entries_written = plan.content.len();
        result.entries_skipped = content.len() - plan.content.len();
        let readback = lang::read_member_content(target, &plan.member_path)?;
        record_verification(&self.hasher, plan, result, target, &content, readback)
    }

    fn rewrite(&self, target: &Path, member: &str, content: &LanguageContent) -> Result<(), EngineError> {
        let rendered = lang::render(content)?;
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut archive = ZipArchive::new(File::open(target)?)?;
        let mut writer = ZipWriter::new(lang::temp_beside(target)?);
        let mut replaced = false;
        for index in 0..archive.len() {
            let file = archive.by_index_raw(index)?;
            if file.name() == member {
                drop(file);
                writer.start_file(member, options)?;
                writer.write_all(&rendered)?;
                replaced = true;
            } else {
                writer.raw_copy_file(file)?;
            }
        }
        if !replaced {
            writer.start_file(member, options)?;
            writer.write_all(&rendered)?;
        }
        self.failpoints.check(MID_REWRITE)?;

        let tmp = writer.finish()?;
        tmp.as_file().sync_all()?;
        self.failpoints.check(BEFORE_RENAME)?;
        tmp.persist(target).map_err(|e| e.error)?;
        Ok(())
    }
}

impl WritebackExecutor for InPlaceExecutor {
    fn strategy(&self) -> WritebackStrategy {
        WritebackStrategy::InPlace
    }

    fn execute(&self, plan: &WritebackPlan) -> ApplyResult {
        let mut result = ApplyResult::started(plan);
        match self.write(plan, &mut result) {
            Ok(()) => {
                result.success = true;
                result.rollback_available = result.backup.is_some();
                info!(
                    plan = %plan.plan_id,
                    target = %plan.target_path.display(),
                    member = %plan.member_path,
                    entries = result.entries_written,
                    "archive member replaced"
                );
            }
            Err(e) => {
                error!(plan = %plan.plan_id, target = %plan.target_path.display(), error = %e, "in-place write failed");
                result.fail(e.to_string());
                if let Some(backup) = result.backup.clone() {
                    match self.backups.restore(&backup) {
                        Ok(()) => {
                            warn!(plan = %plan.plan_id, "target restored from backup");
                            result.rollback_performed = true;
                        }
                        Err(restore_err) => {
                            result.errors.push(format!("restore from backup failed: {restore_err}"));
                        }
                    }
                }
            }
        }
        result.finish();
        result
    }

    fn rollback(&self, result: &ApplyResult) -> Result<bool, EngineError> {
        let Some(backup) = &result.backup else {
            return Ok(false);
        };
        self.backups.restore(backup)?;
        info!(plan = %result.plan_id, target = %backup.original_path.display(), "in-place write rolled back");
        Ok(true)
    }
}
