use thiserror::Error;

/// Failure modes for operation submission.
///
/// Validation and business-rule failures are recovered at the gateway and
/// reported only to the requesting connection; `Storage` is additionally
/// logged for operators. The sequencer guarantees the version counter never
/// advances on any of these.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("duplicate operation")]
    DuplicateOperation,

    #[error("document not found")]
    DocumentNotFound,

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
}
