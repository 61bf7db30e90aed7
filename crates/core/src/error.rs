use thiserror::Error;

use crate::patch::PatchValidationError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported content: {0}")]
    UnsupportedContent(String),

    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("invalid data: {0}")]
    Validation(String),

    #[error("patch set failed validation: {}", join_errors(.0))]
    PatchValidation(Vec<PatchValidationError>),

    #[error("patch set {0} is {1} and can no longer be modified")]
    PatchSetFrozen(String, &'static str),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

fn join_errors(errors: &[PatchValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
