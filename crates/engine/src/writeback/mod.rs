//! Writeback: turning planned language content into files on disk.

pub mod backup;
pub mod create_new;
pub mod failpoints;
pub mod in_place;
pub mod lang;
pub mod manager;
pub mod overlay;

pub use backup::BackupStore;
pub use create_new::CreateNewExecutor;
pub use failpoints::{FailpointAction, Failpoints};
pub use in_place::InPlaceExecutor;
pub use manager::{PlanRequest, RollbackTarget, WritebackManager, WritebackStatistics, strategy_for};
pub use overlay::OverlayExecutor;

use std::path::Path;

use tracing::warn;

use modlocale_core::cid::ContentHasher;
use modlocale_core::writeback::{ApplyResult, WritebackPlan, WritebackStrategy};

use self::lang::LanguageContent;
use crate::error::EngineError;

/// One way of getting a plan's content onto disk.
///
/// `execute` never returns an error: failures are reported in the
/// `ApplyResult`, after any automatic rollback has been attempted.
pub trait WritebackExecutor: Send + Sync {
    fn strategy(&self) -> WritebackStrategy;

    fn execute(&self, plan: &WritebackPlan) -> ApplyResult;

    /// Undo a previous execution. `Ok(false)` when there was nothing to undo.
    fn rollback(&self, result: &ApplyResult) -> Result<bool, EngineError>;
}

/// Fill the hash fields of `result` from what is actually on disk.
/// `written_file` is the file that was replaced, `readback` the language
/// content read back out of it.
pub(crate) fn record_verification(
    hasher: &ContentHasher,
    plan: &WritebackPlan,
    result: &mut ApplyResult,
    written_file: &Path,
    written: &LanguageContent,
    readback: Option<LanguageContent>,
) -> Result<(), EngineError> {
    result.after_hash = Some(hasher.compute_file(written_file)?.hash_value);
    let expected = match &plan.expected_hash {
        Some(hash) => hash.clone(),
        None => lang::content_hash(written)?,
    };
    let actual = readback.as_ref().map(lang::content_hash).transpose()?;
    result.hash_verified = actual.as_deref() == Some(expected.as_str());
    if !result.hash_verified {
        warn!(
            plan = %plan.plan_id,
            expected = %expected,
            actual = ?actual,
            "written content does not match expected hash"
        );
        result.warnings.push(format!(
            "Hash verification failed: expected {expected}, found {}",
            actual.as_deref().unwrap_or("nothing")
        ));
    }
    result.expected_hash = Some(expected);
    Ok(())
}
