//! Domain error types.

use crate::domain::document::{Document, DocumentId};

/// Top-level error type for tickstore.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {id}")]
    NotFound { id: DocumentId },

    #[error("identity conflict for {id}: {reason}")]
    IdentityConflict { id: DocumentId, reason: String },

    #[error("version conflict for {id}: stored version {expected}, document version {found}")]
    VersionConflict {
        id: DocumentId,
        expected: u64,
        found: u64,
    },

    #[error("document {id} is locked by another holder")]
    Locked { id: DocumentId },

    #[error("invalid value in {id}: {reason}")]
    InvalidValue { id: DocumentId, reason: String },

    #[error("invalid sample: {reason}")]
    InvalidSample { reason: String },

    #[error("corrupt snapshot {path}: {reason}")]
    CorruptSnapshot { path: String, reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn invalid_sample(reason: impl Into<String>) -> Self {
        StoreError::InvalidSample {
            reason: reason.into(),
        }
    }

    /// `InvalidValue` when the document holds a float a snapshot cannot encode.
    pub fn check_finite(document: &Document) -> Result<(), Self> {
        match document.fields().non_finite_path() {
            Some(path) => Err(StoreError::InvalidValue {
                id: document.id().clone(),
                reason: format!("field {path} is not a finite number"),
            }),
            None => Ok(()),
        }
    }

    /// True for failures worth retrying: only I/O, never a corrupt blob.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

impl From<&StoreError> for std::process::ExitCode {
    fn from(err: &StoreError) -> Self {
        let code: u8 = match err {
            StoreError::Io(_) => 1,
            StoreError::ConfigParse { .. }
            | StoreError::ConfigMissing { .. }
            | StoreError::ConfigInvalid { .. } => 2,
            StoreError::CorruptSnapshot { .. } => 3,
            StoreError::InvalidSample { .. } | StoreError::InvalidValue { .. } => 4,
            StoreError::NotFound { .. }
            | StoreError::IdentityConflict { .. }
            | StoreError::VersionConflict { .. }
            | StoreError::Locked { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}
