use std::time::Duration;

/// The closed set of error kinds surfaced by every core subsystem.
///
/// Callers branch on the kind, not the message: `Transient` means retry with
/// backoff, `Conflict` means re-read and merge, everything else is terminal
/// for the attempted operation.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed request; retrying will not help.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Idempotency or version conflict; caller may re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Retryable failure: network, rate limit, resource saturation.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        /// Hint for the caller's backoff; `None` means "use your own schedule".
        retry_after: Option<Duration>,
    },

    /// Retry will not help: corrupted file, unsupported format, schema violation.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// An external service failed in a way the core cannot paper over.
    #[error("dependency failure in {dependency}: {message}")]
    DependencyFailure { dependency: String, message: String },

    /// Deadline expired or the caller cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transient_after(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn dependency(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DependencyFailure {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Stable machine-readable kind label, used in response metadata and
    /// stream error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Transient { .. } => "transient",
            Self::Permanent(_) => "permanent",
            Self::DependencyFailure { .. } => "dependency_failure",
            Self::Cancelled(_) => "cancelled",
        }
    }

    /// Collapse a retry-exhausted transient error into a permanent one,
    /// keeping the original message.
    pub fn into_permanent(self) -> Self {
        match self {
            Self::Transient { message, .. } => Self::Permanent(message),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let err = CoreError::transient("rate limited");
        assert!(err.is_transient());
        assert_eq!(err.kind(), "transient");
        assert!(!CoreError::Permanent("bad file".into()).is_transient());
    }

    #[test]
    fn retry_exhaustion_becomes_permanent() {
        let err = CoreError::transient_after("timeout", Duration::from_secs(1));
        let collapsed = err.into_permanent();
        assert_eq!(collapsed.kind(), "permanent");
        assert!(collapsed.to_string().contains("timeout"));
    }

    #[test]
    fn non_transient_survives_collapse() {
        let err = CoreError::NotFound("doc".into()).into_permanent();
        assert_eq!(err.kind(), "not_found");
    }
}
