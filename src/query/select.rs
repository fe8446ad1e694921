//! Statement preparation and execution entry points
//!
//! `prepare` validates the statement's expression types, maps the sources
//! to a shard group, and produces a `PreparedStatement`; selecting on it
//! builds the cursor. The shard group may be closed as soon as the cursor
//! is built: closing releases mapping-time resources only and never
//! invalidates iterators already handed out.

use crate::config::SelectConfig;
use crate::query::ast::{Call, Measurement, SelectStatement, Source};
use crate::query::cursor::{build_cursor, Cursor, CursorStats};
use crate::query::error::{QueryError, QueryResult};
use crate::query::functions;
use crate::query::iterator::BoxedIterator;
use crate::query::options::{InterruptHandle, IteratorOptions};
use crate::types::{FieldType, TimeRange};
use parking_lot::Mutex;
use tracing::{debug, warn};

// ============================================================================
// Storage contracts
// ============================================================================

/// A shard or collection of shards iterators can be created from.
///
/// The resources used for reading iterators are separate from the
/// resources used to map the shards: closing the group releases the
/// mapping, not iterators already created from it. The engine closes the
/// group after creating iterators but before they are read.
pub trait ShardGroup: Send {
    /// Create a raw iterator over a measurement
    fn create_iterator(
        &self,
        source: &Measurement,
        opt: &IteratorOptions,
    ) -> QueryResult<BoxedIterator>;

    /// Create an iterator for an aggregate call over a measurement. The
    /// call travels so storage may push the aggregation down; returning
    /// raw samples wrapped in an engine-side call iterator is also a
    /// valid implementation.
    fn create_call_iterator(
        &self,
        source: &Measurement,
        call: &Call,
        opt: &IteratorOptions,
    ) -> QueryResult<BoxedIterator>;

    /// Look up the type of a field, if known
    fn field_type(&self, source: &Measurement, field: &str) -> Option<FieldType>;

    /// Release shard-mapping resources
    fn close(&mut self) -> QueryResult<()>;
}

/// Maps a statement's sources and time range to a shard group.
pub trait ShardMapper {
    /// Map the sources for the given time range
    fn map_shards(
        &self,
        sources: &[Source],
        range: &TimeRange,
        opt: &SelectOptions,
    ) -> QueryResult<Box<dyn ShardGroup>>;
}

// ============================================================================
// Select options
// ============================================================================

/// Options that customize one select call.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Maximum number of points the cursor may emit (0 = unlimited)
    pub max_point_n: usize,
    /// Maximum number of concurrent series; forwarded to the shard layer
    /// (0 = unlimited)
    pub max_series_n: usize,
    /// Maximum number of interval buckets (0 = unlimited)
    pub max_buckets_n: usize,
    /// Cooperative cancellation handle for the statement's iterators
    pub interrupt: Option<InterruptHandle>,
}

impl SelectOptions {
    /// Derive select options from the configured limits
    pub fn from_config(config: &SelectConfig) -> Self {
        Self {
            max_point_n: config.max_point_n,
            max_series_n: config.max_series_n,
            max_buckets_n: config.max_buckets_n,
            interrupt: None,
        }
    }

    /// Attach a cancellation handle
    pub fn with_interrupt(mut self, handle: InterruptHandle) -> Self {
        self.interrupt = Some(handle);
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Validate that every field expression type-checks before any iterator
/// is built.
pub fn validate_types(stmt: &SelectStatement) -> QueryResult<()> {
    for field in &stmt.fields {
        functions::infer_type(&field.expr)?;
    }
    Ok(())
}

// ============================================================================
// Prepared statement
// ============================================================================

/// A statement that has been validated and mapped, ready to build its
/// cursor.
pub struct PreparedStatement {
    stmt: SelectStatement,
    opt: IteratorOptions,
    shards: Option<Box<dyn ShardGroup>>,
    columns: Vec<String>,
    max_point_n: usize,
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("stmt", &self.stmt)
            .field("opt", &self.opt)
            .field("columns", &self.columns)
            .field("max_point_n", &self.max_point_n)
            .finish_non_exhaustive()
    }
}

impl PreparedStatement {
    /// The statement's computed output column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Build the cursor that reads the statement's rows
    pub fn select(&self) -> QueryResult<Box<dyn Cursor>> {
        let shards = self
            .shards
            .as_ref()
            .ok_or_else(|| QueryError::internal("prepared statement is closed"))?;
        let mut cursor = build_cursor(&self.stmt, shards.as_ref(), self.opt.clone())?;
        if self.max_point_n > 0 {
            cursor.set_point_limit(self.max_point_n as u64);
        }
        Ok(cursor)
    }

    /// Release the mapped shard group. Must be called; iterators already
    /// created stay valid.
    pub fn close(&mut self) -> QueryResult<()> {
        if let Some(mut shards) = self.shards.take() {
            shards.close()?;
        }
        Ok(())
    }
}

/// Validate and map a statement, producing a prepared statement.
pub fn prepare(
    stmt: SelectStatement,
    mapper: &dyn ShardMapper,
    opt: SelectOptions,
) -> QueryResult<PreparedStatement> {
    validate_types(&stmt)?;

    let mut iterator_opt = IteratorOptions::from_statement(&stmt)?;
    iterator_opt.interrupt = opt.interrupt.clone();

    if opt.max_buckets_n > 0 && !iterator_opt.interval.is_zero() {
        let buckets = (iterator_opt.end_time - iterator_opt.start_time)
            / iterator_opt.interval.duration;
        if buckets as usize > opt.max_buckets_n {
            return Err(QueryError::resource_limit(format!(
                "max-select-buckets limit exceeded ({} buckets)",
                buckets
            )));
        }
    }

    let shards = mapper.map_shards(&stmt.sources, &stmt.time_range, &opt)?;
    let columns = stmt.column_names();
    debug!(columns = columns.len(), "prepared statement");
    Ok(PreparedStatement {
        stmt,
        opt: iterator_opt,
        shards: Some(shards),
        columns,
        max_point_n: opt.max_point_n,
    })
}

/// Prepare a statement and build its cursor in one call. The shard group
/// is closed before the cursor is returned; its iterators stay valid.
pub fn select(
    stmt: SelectStatement,
    mapper: &dyn ShardMapper,
    opt: SelectOptions,
) -> QueryResult<Box<dyn Cursor>> {
    let mut prepared = prepare(stmt, mapper, opt)?;
    let cursor = prepared.select();
    if let Err(err) = prepared.close() {
        warn!(%err, "failed to close shard group");
    }
    cursor
}

/// Prepare, build the cursor, and register a point-limit probe with the
/// monitor when a point budget is configured.
pub fn select_with_monitor(
    stmt: SelectStatement,
    mapper: &dyn ShardMapper,
    opt: SelectOptions,
    monitor: &dyn Monitor,
) -> QueryResult<Box<dyn Cursor>> {
    let max_point_n = opt.max_point_n;
    let cursor = select(stmt, mapper, opt)?;
    if max_point_n > 0 {
        monitor.register(point_limit_probe(cursor.stats(), max_point_n as u64));
    }
    Ok(cursor)
}

// ============================================================================
// Monitoring
// ============================================================================

/// A periodic probe run by a monitor; an error aborts the read it
/// observes.
pub type MonitorProbe = Box<dyn FnMut() -> QueryResult<()> + Send>;

/// Monitoring collaborator that runs registered probes periodically.
pub trait Monitor {
    /// Register a probe
    fn register(&self, probe: MonitorProbe);
}

/// A probe that raises a resource-limit failure once a cursor's emitted
/// point count crosses the budget.
pub fn point_limit_probe(stats: CursorStats, limit: u64) -> MonitorProbe {
    Box::new(move || {
        let emitted = stats.emitted();
        if emitted > limit {
            return Err(QueryError::resource_limit(format!(
                "max-select-point limit exceeded ({} points)",
                emitted
            )));
        }
        Ok(())
    })
}

/// Simple in-process monitor holding its probes behind a lock; the owner
/// drives `poll` at its own cadence.
#[derive(Default)]
pub struct StatementMonitor {
    probes: Mutex<Vec<MonitorProbe>>,
}

impl StatementMonitor {
    /// Create an empty monitor
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every registered probe once, surfacing the first failure
    pub fn poll(&self) -> QueryResult<()> {
        let mut probes = self.probes.lock();
        for probe in probes.iter_mut() {
            probe()?;
        }
        Ok(())
    }
}

impl Monitor for StatementMonitor {
    fn register(&self, probe: MonitorProbe) {
        self.probes.lock().push(probe);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{Expr, Field};
    use crate::types::FieldType;

    #[test]
    fn test_validate_types_rejects_unknown_calls() {
        let stmt = SelectStatement::new(
            vec![Field::new(Expr::call(
                "frobnicate",
                vec![Expr::var("x", FieldType::Float)],
            ))],
            vec![Source::Measurement(Measurement::new("m"))],
            TimeRange::new(0, 100).unwrap(),
        );
        let err = validate_types(&stmt).unwrap_err();
        assert!(err.to_string().contains("unsupported call"));
    }

    #[test]
    fn test_point_limit_probe_fires_past_budget() {
        let stats = CursorStats::default();
        let mut probe = point_limit_probe(stats.clone(), 2);
        assert!(probe().is_ok());
        for _ in 0..3 {
            stats_record(&stats);
        }
        let err = probe().unwrap_err();
        assert_eq!(err.kind, crate::query::error::QueryErrorKind::ResourceLimit);
    }

    #[test]
    fn test_monitor_polls_registered_probes() {
        let monitor = StatementMonitor::new();
        let stats = CursorStats::default();
        monitor.register(point_limit_probe(stats.clone(), 1));
        assert!(monitor.poll().is_ok());
        for _ in 0..2 {
            stats_record(&stats);
        }
        assert!(monitor.poll().is_err());
    }

    fn stats_record(stats: &CursorStats) {
        // Exercise the counter the way a cursor does.
        stats.record();
    }
}
