//! Query error types
//!
//! Provides structured error handling for statement preparation and
//! iterator construction, plus the outcomes surfaced during consumption
//! (cancellation, resource limits).

use std::fmt;

/// Query error with context
#[derive(Debug)]
pub struct QueryError {
    /// Error kind for programmatic handling
    pub kind: QueryErrorKind,
    /// Human-readable message
    pub message: String,
    /// Optional source error
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl QueryError {
    /// Create a new query error
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Add source error for error chaining
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Create a type error (an expression's static type cannot be resolved)
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::TypeError, message)
    }

    /// Create an argument-shape error (wrong arity or literal kind)
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::InvalidArguments, message)
    }

    /// Create an unsupported-call error
    pub fn unsupported_call(name: impl fmt::Display) -> Self {
        Self::new(
            QueryErrorKind::UnsupportedCall,
            format!("unsupported call: {}", name),
        )
    }

    /// Create a storage collaborator error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Storage, message)
    }

    /// Create a cancellation outcome
    pub fn cancelled() -> Self {
        Self::new(QueryErrorKind::Cancelled, "query interrupted")
    }

    /// Create a resource-limit error
    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::ResourceLimit, message)
    }

    /// Create an internal error (bug, unexpected state)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Internal, message)
    }

    /// Whether this error is the cooperative cancellation outcome rather
    /// than a hard failure
    pub fn is_cancellation(&self) -> bool {
        self.kind == QueryErrorKind::Cancelled
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Categories of query errors for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// An expression's static type cannot be resolved
    TypeError,
    /// Wrong arity or wrong literal kind for a function argument
    InvalidArguments,
    /// Unrecognized call name
    UnsupportedCall,
    /// The storage layer failed to produce an iterator
    Storage,
    /// Query was interrupted cooperatively
    Cancelled,
    /// Point budget or another resource limit was exceeded during reads
    ResourceLimit,
    /// Internal error (bug, unexpected state)
    Internal,
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryErrorKind::TypeError => write!(f, "TypeError"),
            QueryErrorKind::InvalidArguments => write!(f, "InvalidArguments"),
            QueryErrorKind::UnsupportedCall => write!(f, "UnsupportedCall"),
            QueryErrorKind::Storage => write!(f, "Storage"),
            QueryErrorKind::Cancelled => write!(f, "Cancelled"),
            QueryErrorKind::ResourceLimit => write!(f, "ResourceLimit"),
            QueryErrorKind::Internal => write!(f, "Internal"),
        }
    }
}

/// Result type alias for query operations
pub type QueryResult<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = QueryError::unsupported_call("frobnicate");
        assert_eq!(err.kind, QueryErrorKind::UnsupportedCall);
        assert!(err.message.contains("frobnicate"));
    }

    #[test]
    fn test_error_display() {
        let err = QueryError::invalid_arguments("top() requires 2 or more arguments, got 1");
        let display = format!("{}", err);
        assert!(display.contains("InvalidArguments"));
        assert!(display.contains("top()"));
    }

    #[test]
    fn test_cancellation_is_not_a_failure_kind() {
        let err = QueryError::cancelled();
        assert!(err.is_cancellation());
        assert!(!QueryError::storage("boom").is_cancellation());
    }

    #[test]
    fn test_error_with_source() {
        use std::error::Error;
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "shard missing");
        let err = QueryError::storage("failed to create iterator").with_source(io_err);
        assert!(err.source().is_some());
    }
}
