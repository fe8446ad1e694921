//! Meridian TSDB - query planning and execution engine for time-series data
//!
//! This library turns parsed, type-checked SELECT statements into trees of
//! composable, lazily-evaluated sample iterators:
//! - Symbol mapping so repeated sub-expressions are computed once
//! - Per-function windowing, grouping, and selector policy from a closed registry
//! - Scanner/cursor assembly with fill substitution and row alignment
//! - Cooperative cancellation and point budgets during reads
//!
//! Physical sample retrieval is an external collaborator reached through
//! the [`query::ShardGroup`] contract.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;

/// Query engine: statement preparation, iterator construction, cursors
pub mod query;

// Re-export main types
pub use config::SelectConfig;
pub use error::{Error, Result};
pub use types::{FieldType, TagSet, TimeRange};

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_sanity() {
        assert_eq!(2 + 2, 4);
    }
}
