//! Query planning and execution engine
//!
//! Turns a parsed, type-checked SELECT statement into a tree of
//! composable, lazily-evaluated sample iterators and a cursor that
//! produces the statement's output rows.
//!
//! # Pipeline
//!
//! ```text
//! SelectStatement
//!     │
//!     ▼
//! ┌─────────────────┐
//! │  Value Mapper   │  Assign symbols, rewrite field expressions
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  Expr Builder   │  One iterator per distinct call (or aux-only)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  Cursor Builder │  Scanners, fill substitution, row alignment
//! └─────────────────┘
//! ```
//!
//! Storage is an external collaborator reached through the [`select::ShardGroup`]
//! contract; this engine decides what to build and how results compose.

pub mod aggregate;
pub mod ast;
pub mod builder;
pub mod cursor;
pub mod error;
pub mod functions;
pub mod iterator;
pub mod mapper;
pub mod options;
pub mod select;
pub mod transform;

// Re-export commonly used types
pub use ast::{
    BinaryOp, Call, Expr, Field, FillPolicy, Interval, Literal, Measurement, Row,
    SelectStatement, Source, VarRef,
};
pub use cursor::{build_cursor, Column, Cursor, CursorStats};
pub use error::{QueryError, QueryErrorKind, QueryResult};
pub use iterator::{BoxedIterator, Sample, SampleIterator, Value};
pub use options::{InterruptHandle, IteratorOptions};
pub use select::{
    prepare, select, select_with_monitor, Monitor, PreparedStatement, SelectOptions, ShardGroup,
    ShardMapper, StatementMonitor,
};
