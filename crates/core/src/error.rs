/// Domain error shared by every dispatch crate.
///
/// Router code turns these into `error` / `job_rejected` wire messages; the
/// HTTP layer maps them onto status codes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Lock contention on {0}")]
    LockContention(String),

    #[error("Shared state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code used in wire and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::Unauthorized(_) => "UNAUTHORIZED",
            CoreError::Forbidden(_) => "FORBIDDEN",
            CoreError::LockContention(_) => "LOCK_CONTENTION",
            CoreError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Shorthand for a `NotFound` on a job.
    pub fn job_not_found(id: impl ToString) -> Self {
        CoreError::NotFound {
            entity: "Job",
            id: id.to_string(),
        }
    }

    /// Shorthand for a `NotFound` on a connection.
    pub fn connection_not_found(id: impl ToString) -> Self {
        CoreError::NotFound {
            entity: "Connection",
            id: id.to_string(),
        }
    }

    /// Whether the error came from a dependency being down rather than the
    /// caller doing something wrong.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, CoreError::StoreUnavailable(_) | CoreError::Internal(_))
    }
}

impl From<validator::ValidationErrors> for CoreError {
    fn from(errors: validator::ValidationErrors) -> Self {
        CoreError::Validation(errors.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("serialization failed: {err}"))
    }
}
