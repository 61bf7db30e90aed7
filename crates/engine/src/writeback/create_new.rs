//! Create-new writeback: a fresh archive holding only the language member.

use std::fs;
use std::io::Write;

use tracing::{error, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use modlocale_core::cid::ContentHasher;
use modlocale_core::writeback::{ApplyResult, WritebackPlan, WritebackStrategy};

use super::failpoints::{CREATE_NEW_WRITE, Failpoints};
use super::{WritebackExecutor, lang, record_verification};
use crate::error::EngineError;

pub struct CreateNewExecutor {
    hasher: ContentHasher,
    failpoints: Failpoints,
}

impl CreateNewExecutor {
    pub fn new(hasher: ContentHasher, failpoints: Failpoints) -> Self {
        Self { hasher, failpoints }
    }

    fn write(&self, plan: &WritebackPlan, result: &mut ApplyResult) -> Result<(), EngineError> {
        let target = &plan.target_path;
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut writer = ZipWriter::new(lang::temp_beside(target)?);
        writer.start_file(plan.member_path.as_str(), options)?;
        writer.write_all(&lang::render(&plan.content)?)?;
        self.failpoints.check(CREATE_NEW_WRITE)?;

        let tmp = writer.finish()?;
        tmp.as_file().sync_all()?;
        // Fails if something appeared at the target since validation.
        tmp.persist_noclobber(target).map_err(|e| e.error)?;

        result.output_path = Some(target.clone());
        result.entries_written = plan.content.len();
        let readback = lang::read_member_content(target, &plan.member_path)?;
        record_verification(&self.hasher, plan, result, target, &plan.content, readback)
    }
}

impl WritebackExecutor for CreateNewExecutor {
    fn strategy(&self) -> WritebackStrategy {
        WritebackStrategy::CreateNew
    }

    fn execute(&self, plan: &WritebackPlan) -> ApplyResult {
        let mut result = ApplyResult::started(plan);
        match self.write(plan, &mut result) {
            Ok(()) => {
                result.success = true;
                result.rollback_available = true;
                info!(plan = %plan.plan_id, target = %plan.target_path.display(), "archive created");
            }
            Err(e) => {
                error!(plan = %plan.plan_id, target = %plan.target_path.display(), error = %e, "archive creation failed");
                result.fail(e.to_string());
            }
        }
        result.finish();
        result
    }

    fn rollback(&self, result: &ApplyResult) -> Result<bool, EngineError> {
        let Some(created) = &result.output_path else {
            return Ok(false);
        };
        match fs::remove_file(created) {
            Ok(()) => {
                info!(plan = %result.plan_id, target = %created.display(), "created archive removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
