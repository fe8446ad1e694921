//! Iterator construction options
//!
//! One options record flows through every builder call. Each recursive
//! branch clones it and specializes its own copy (different expression,
//! grouping, or time range), so sibling builds never alias each other's
//! configuration.

use crate::query::ast::{Call, Expr, FillPolicy, Interval, Literal, SelectStatement, VarRef};
use crate::query::error::QueryResult;
use crate::types::{TimeRange, MAX_TIME, MIN_TIME, NANOS_PER_SECOND};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Interrupt Handle
// ============================================================================

/// Cooperative cancellation handle threaded through the options record.
///
/// Iterators check the flag on every pull and abort with the cancellation
/// outcome once it is set.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Create a fresh, un-fired handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the interrupt
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether the interrupt has fired
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Iterator Options
// ============================================================================

/// Configuration threaded through every builder call.
#[derive(Debug, Clone)]
pub struct IteratorOptions {
    /// The expression currently being built
    pub expr: Option<Expr>,
    /// Auxiliary references fetched alongside the value, in key order
    pub aux: Vec<VarRef>,
    /// Start of the requested time range (inclusive), nanoseconds
    pub start_time: i64,
    /// End of the requested time range (exclusive), nanoseconds
    pub end_time: i64,
    /// Read direction
    pub ascending: bool,
    /// Output grouping tag keys, in declaration order
    pub dimensions: Vec<String>,
    /// Group-by tag key set, used when dimension unions are computed
    pub group_by: BTreeSet<String>,
    /// Interval bucketing; zero duration means none
    pub interval: Interval,
    /// Fill policy for empty buckets
    pub fill: FillPolicy,
    /// Maximum rows per series applied after the build (0 = unlimited)
    pub limit: usize,
    /// Rows to skip per series applied after the build
    pub offset: usize,
    /// Force deterministic, strictly time-sorted input
    pub ordered: bool,
    /// Deduplicate auxiliary rows
    pub dedupe: bool,
    /// Cooperative cancellation handle, if configured
    pub interrupt: Option<InterruptHandle>,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self {
            expr: None,
            aux: Vec::new(),
            start_time: MIN_TIME,
            end_time: MAX_TIME,
            ascending: true,
            dimensions: Vec::new(),
            group_by: BTreeSet::new(),
            interval: Interval::default(),
            fill: FillPolicy::None,
            limit: 0,
            offset: 0,
            ordered: false,
            dedupe: false,
            interrupt: None,
        }
    }
}

impl IteratorOptions {
    /// Derive options from a statement.
    pub fn from_statement(stmt: &SelectStatement) -> QueryResult<Self> {
        Ok(Self {
            start_time: stmt.time_range.start,
            end_time: stmt.time_range.end,
            ascending: stmt.ascending,
            dimensions: stmt.dimensions.clone(),
            group_by: stmt.dimensions.iter().cloned().collect(),
            interval: stmt.interval,
            fill: stmt.fill.clone(),
            limit: stmt.limit,
            offset: stmt.offset,
            // Subquery outputs can repeat identical rows across sources.
            dedupe: stmt.has_subquery(),
            ..Self::default()
        })
    }

    /// The requested time range as a range value
    pub fn time_range(&self) -> TimeRange {
        TimeRange {
            start: self.start_time,
            end: self.end_time,
        }
    }

    /// Widen the range by `amount` nanoseconds against the read direction,
    /// giving windowed transforms the history (ascending) or future
    /// (descending) they need for their first in-range output.
    pub fn extend_range(&mut self, amount: i64) {
        if self.ascending {
            self.start_time = self.start_time.saturating_sub(amount).max(MIN_TIME);
        } else {
            self.end_time = self.end_time.saturating_add(amount).min(MAX_TIME);
        }
    }

    /// Remove bucketing and widen the range to the full representable span
    pub fn unbound_range(&mut self) {
        self.start_time = MIN_TIME;
        self.end_time = MAX_TIME;
        self.interval = Interval::default();
    }

    /// The start of the bucket containing `t`
    #[inline]
    pub fn window_start(&self, t: i64) -> i64 {
        self.interval.window_start(t)
    }

    /// Whether the interrupt signal has fired
    pub fn is_interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .map(|h| h.is_interrupted())
            .unwrap_or(false)
    }

    /// The derivative unit for a derivative-family call: the optional
    /// duration argument, else the bucket interval, else one second.
    pub fn derivative_interval(&self, call: &Call) -> i64 {
        if let Some(Expr::Literal(Literal::Duration(d))) = call.args.get(1) {
            return *d;
        }
        if !self.interval.is_zero() {
            return self.interval.duration;
        }
        NANOS_PER_SECOND
    }

    /// The elapsed unit: the optional duration argument, else one
    /// nanosecond.
    pub fn elapsed_interval(&self, call: &Call) -> i64 {
        if let Some(Expr::Literal(Literal::Duration(d))) = call.args.get(1) {
            return *d;
        }
        1
    }

    /// The integral unit: the optional duration argument, else one second.
    pub fn integral_interval(&self, call: &Call) -> i64 {
        if let Some(Expr::Literal(Literal::Duration(d))) = call.args.get(1) {
            return *d;
        }
        NANOS_PER_SECOND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{Field, Measurement, Source};
    use crate::types::FieldType;

    #[test]
    fn test_extend_range_follows_read_direction() {
        let mut opt = IteratorOptions {
            start_time: 1000,
            end_time: 2000,
            ..IteratorOptions::default()
        };
        opt.extend_range(100);
        assert_eq!((opt.start_time, opt.end_time), (900, 2000));

        opt.ascending = false;
        opt.extend_range(100);
        assert_eq!((opt.start_time, opt.end_time), (900, 2100));
    }

    #[test]
    fn test_unbound_range_clears_interval() {
        let mut opt = IteratorOptions {
            start_time: 0,
            end_time: 100,
            interval: Interval::new(10),
            ..IteratorOptions::default()
        };
        opt.unbound_range();
        assert_eq!(opt.start_time, MIN_TIME);
        assert_eq!(opt.end_time, MAX_TIME);
        assert!(opt.interval.is_zero());
    }

    #[test]
    fn test_derivative_interval_resolution() {
        let base = Call::new("derivative", vec![Expr::var("x", FieldType::Float)]);
        let explicit = Call::new(
            "derivative",
            vec![
                Expr::var("x", FieldType::Float),
                Expr::Literal(Literal::Duration(500)),
            ],
        );

        let mut opt = IteratorOptions::default();
        assert_eq!(opt.derivative_interval(&base), NANOS_PER_SECOND);
        assert_eq!(opt.derivative_interval(&explicit), 500);

        opt.interval = Interval::new(60 * NANOS_PER_SECOND);
        assert_eq!(opt.derivative_interval(&base), 60 * NANOS_PER_SECOND);
    }

    #[test]
    fn test_from_statement_sets_dedupe_for_subqueries() {
        let inner = SelectStatement::new(
            vec![Field::new(Expr::var("x", FieldType::Float))],
            vec![Source::Measurement(Measurement::new("m"))],
            TimeRange::new(0, 100).unwrap(),
        );
        let outer = SelectStatement::new(
            vec![Field::new(Expr::var("x", FieldType::Float))],
            vec![Source::Subquery(Box::new(inner))],
            TimeRange::new(0, 100).unwrap(),
        );
        let opt = IteratorOptions::from_statement(&outer).unwrap();
        assert!(opt.dedupe);
    }
}
