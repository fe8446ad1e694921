//! Error types for the query engine

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Query planning or execution error
    #[error("Query error: {0}")]
    Query(#[from] crate::query::error::QueryError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// General error
    #[error("{0}")]
    General(String),
}

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::error::QueryError;

    #[test]
    fn test_query_error_conversion() {
        let err: Error = QueryError::unsupported_call("nope").into();
        assert!(matches!(err, Error::Query(_)));
        assert!(err.to_string().contains("nope"));
    }
}
