use crate::cache_layer::CacheError;
use thiserror::Error;

/// Failure of a single job attempt. The queue retries only retryable variants.
#[derive(Debug, Error)]
pub enum JobError {
    /// Upstream fetch failed; another attempt may succeed
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("job exceeded its {0}ms budget")]
    Timeout(u64),

    /// A cache entry this job reads from is absent
    #[error("missing dependency {key}: {hint}")]
    MissingDependency { key: String, hint: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Cache or queue backend failure
    #[error("broker error: {0}")]
    Broker(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Transient(_) | JobError::Timeout(_) | JobError::Broker(_)
        )
    }

    pub fn missing(key: impl Into<String>, hint: impl Into<String>) -> Self {
        JobError::MissingDependency {
            key: key.into(),
            hint: hint.into(),
        }
    }

    /// Short label used in metrics and events.
    pub fn label(&self) -> &'static str {
        match self {
            JobError::Transient(_) => "transient",
            JobError::Timeout(_) => "timeout",
            JobError::MissingDependency { .. } => "missing_dependency",
            JobError::InvalidPayload(_) => "invalid_payload",
            JobError::Broker(_) => "broker",
        }
    }
}

impl From<CacheError> for JobError {
    fn from(err: CacheError) -> Self {
        JobError::Broker(err.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::InvalidPayload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(JobError::Transient("x".into()).is_retryable());
        assert!(JobError::Timeout(10).is_retryable());
        assert!(!JobError::missing("scan:0x:ethereum", "run wallet-scan first").is_retryable());
        assert!(!JobError::InvalidPayload("bad".into()).is_retryable());
    }

    #[test]
    fn test_missing_dependency_message_names_key() {
        let err = JobError::missing("scan:0xabc:base", "run wallet-scan first");
        assert!(err.to_string().contains("scan:0xabc:base"));
        assert_eq!(err.label(), "missing_dependency");
    }
}
