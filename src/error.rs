use std::fmt;

use thiserror::Error;

/// Optional backend features that callers must query instead of assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Clear,
    Dependencies,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Clear => f.write_str("clear"),
            Capability::Dependencies => f.write_str("dependencies"),
        }
    }
}

/// Programmer mistakes. These are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("lock handle for `{key}` is already held")]
    AlreadyHeld { key: String },
    #[error("lock handle for `{key}` was disposed while still held")]
    DisposedWhileHeld { key: String },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),
    #[error("backend does not support {capability}")]
    Unsupported { capability: Capability },
    #[error("store failure: {message}")]
    Store { message: String },
    #[error("internal consistency failure: {message}")]
    InternalConsistency { message: String },
    #[error("value codec failed: {0}")]
    Codec(#[from] serde_json::Error),
}

impl CacheError {
    pub fn unsupported(capability: Capability) -> Self {
        Self::Unsupported { capability }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::InternalConsistency {
            message: message.into(),
        }
    }

    /// True for failures that a caller might reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { .. })
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_convert_into_cache_errors() {
        let err: CacheError = UsageError::AlreadyHeld {
            key: "k".to_string(),
        }
        .into();
        assert!(matches!(err, CacheError::Usage(UsageError::AlreadyHeld { .. })));
        assert!(!err.is_transient());
    }

    #[test]
    fn only_store_failures_are_transient() {
        assert!(CacheError::store("connection reset").is_transient());
        assert!(!CacheError::consistency("mismatch").is_transient());
        assert!(!CacheError::unsupported(Capability::Clear).is_transient());
    }

    #[test]
    fn unsupported_message_names_capability() {
        let err = CacheError::unsupported(Capability::Clear);
        assert_eq!(err.to_string(), "backend does not support clear");
    }
}
