use serde::Serialize;
use std::sync::Arc;

use crate::storage::access::AccessError;

/// All errors surfaced by the supervisor, the document store and the local provider.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Failed to start dev server: {0}")]
    Spawn(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Result of a single-flight operation, shared by every caller that awaited it.
    #[error(transparent)]
    Shared(Arc<WorkspaceError>),

    #[error("{0}")]
    Custom(String),
}

impl WorkspaceError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True when this error (or the shared error it wraps) is a missing document.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }
}

// The UI layer transports errors as plain strings.
impl Serialize for WorkspaceError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_display_string() {
        let err = WorkspaceError::not_found("canvas", "abc");
        let json = serde_json::to_string(&err).expect("error should serialize");
        assert_eq!(json, "\"canvas not found: abc\"");
    }

    #[test]
    fn shared_errors_keep_not_found_classification() {
        let err = WorkspaceError::Shared(Arc::new(WorkspaceError::not_found("project", "p1")));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "project not found: p1");
    }
}
