use modlocale_core::CoreError;
use modlocale_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("patch set not found: {0}")]
    PatchSetNotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("integrity check failed for {path}: expected {expected}, found {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("config error: {0}")]
    Config(String),
}
