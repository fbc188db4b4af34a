use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyErrorCode {
    WriteConflict,
    NamespaceNotFound,
    UpdateOperationFailed,
    PreconditionFailed,
    InvalidEntry,
    Storage,
    WorkerPanicked,
}

impl ApplyErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyErrorCode::WriteConflict => "write_conflict",
            ApplyErrorCode::NamespaceNotFound => "namespace_not_found",
            ApplyErrorCode::UpdateOperationFailed => "update_operation_failed",
            ApplyErrorCode::PreconditionFailed => "precondition_failed",
            ApplyErrorCode::InvalidEntry => "invalid_entry",
            ApplyErrorCode::Storage => "storage",
            ApplyErrorCode::WorkerPanicked => "worker_panicked",
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    /// Transient storage-level conflict. Never surfaced from the apply path;
    /// the retry wrapper loops on it.
    #[error("write conflict")]
    WriteConflict,
    #[error("namespace not found: {ns}")]
    NamespaceNotFound { ns: String },
    #[error("update target missing in {ns}")]
    UpdateOperationFailed { ns: String },
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("malformed oplog entry: {0}")]
    InvalidEntry(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("apply worker panicked")]
    WorkerPanicked,
    #[error("failed to apply {op}: {source}")]
    OpContext {
        op: String,
        #[source]
        source: Box<ApplyError>,
    },
}

impl ApplyError {
    pub fn code(&self) -> ApplyErrorCode {
        match self {
            ApplyError::WriteConflict => ApplyErrorCode::WriteConflict,
            ApplyError::NamespaceNotFound { .. } => ApplyErrorCode::NamespaceNotFound,
            ApplyError::UpdateOperationFailed { .. } => ApplyErrorCode::UpdateOperationFailed,
            ApplyError::PreconditionFailed(_) => ApplyErrorCode::PreconditionFailed,
            ApplyError::InvalidEntry(_) => ApplyErrorCode::InvalidEntry,
            ApplyError::Storage(_) => ApplyErrorCode::Storage,
            ApplyError::WorkerPanicked => ApplyErrorCode::WorkerPanicked,
            ApplyError::OpContext { source, .. } => source.code(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn is_write_conflict(&self) -> bool {
        self.code() == ApplyErrorCode::WriteConflict
    }

    /// Wraps the error with a redacted summary of the entry that failed to
    /// apply. The original code stays visible through `code()`.
    pub fn with_op_context(self, op: String) -> Self {
        ApplyError::OpContext {
            op,
            source: Box::new(self),
        }
    }
}
