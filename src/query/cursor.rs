//! Cursor construction and row production
//!
//! The cursor builder enumerates the statement's fields through the value
//! mapper, decides between the auxiliary-only path and per-call iterator
//! construction, and wires deduplication, limits, and fill substitution
//! around the results. Each built iterator is wrapped in a scanner that
//! applies fill-value substitution and column-keyed extraction; one or
//! more scanners combine into the externally visible cursor.
//!
//! ```text
//! statement ──▶ value mapper ──▶ per-call iterators ──▶ scanners ──▶ cursor
//!                        └─(no calls)─▶ aux iterator ──▶ scanner  ──┘
//! ```

use crate::query::ast::{Expr, Field, FillPolicy, Literal, Row, SelectStatement, Source, VarRef};
use crate::query::builder::{build_expr_iterator, build_subquery_iterator};
use crate::query::error::{QueryError, QueryResult};
use crate::query::functions;
use crate::query::iterator::{
    BoxedIterator, DedupeIterator, FastDedupeIterator, InterruptIterator, LimitIterator,
    MergeIterator, NilIterator, OwnedIterators, Sample, SampleIterator, Value,
};
use crate::query::mapper::ValueMapper;
use crate::query::options::IteratorOptions;
use crate::query::select::ShardGroup;
use crate::types::{FieldType, TagSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Columns, stats
// ============================================================================

/// One output column of a cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Output name
    pub name: String,
    /// Result type
    pub ty: FieldType,
}

/// Shared emitted-point counter for a cursor.
///
/// Cloneable so a monitoring probe can observe the count after the cursor
/// has been handed to its reader.
#[derive(Debug, Clone, Default)]
pub struct CursorStats {
    emitted: Arc<AtomicU64>,
}

impl CursorStats {
    /// Total points emitted so far
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub(crate) fn record(&self) -> u64 {
        self.emitted.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// ============================================================================
// Cursor trait
// ============================================================================

/// The externally visible result of preparing a statement: a row source
/// created once, consumed by one reader, and released exactly once.
pub trait Cursor: Send {
    /// Produce the next output row, or `None` at the end
    fn next_row(&mut self) -> QueryResult<Option<Row>>;

    /// The ordered output columns
    fn columns(&self) -> &[Column];

    /// Release the cursor, its scanners, and their iterators
    fn close(&mut self);

    /// The cursor's emitted-point counter
    fn stats(&self) -> CursorStats;

    /// Cap the number of points the cursor may emit; reads past the cap
    /// fail with a resource-limit error
    fn set_point_limit(&mut self, max_points: u64);
}

impl std::fmt::Debug for dyn Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("columns", &self.columns())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Iterator Scanner
// ============================================================================

/// Wraps one iterator plus an ordered key list and extracts column-keyed
/// values for one output position at a time.
///
/// The first key receives the sample value (an empty first key means the
/// scanner carries auxiliary columns only); the remaining keys receive
/// the auxiliary values in order. Keys with no value for the current row
/// get the fill value, except that the skip placeholder never overwrites
/// a previously scanned value, which is what makes previous-value fill
/// work across rows.
pub struct IteratorScanner {
    input: BoxedIterator,
    keys: Vec<String>,
    fill: Value,
    lookahead: Option<Sample>,
    primed: bool,
    values: HashMap<String, Value>,
}

impl IteratorScanner {
    /// Create a scanner over an iterator with the given keys and fill
    pub fn new(input: BoxedIterator, keys: Vec<String>, fill: Value) -> Self {
        Self {
            input,
            keys,
            fill,
            lookahead: None,
            primed: false,
            values: HashMap::new(),
        }
    }

    fn prime(&mut self) -> QueryResult<()> {
        if !self.primed {
            self.lookahead = self.input.next_sample()?;
            self.primed = true;
        }
        Ok(())
    }

    /// The (time, tags) position of the next unconsumed sample
    pub fn peek(&mut self) -> QueryResult<Option<(i64, TagSet)>> {
        self.prime()?;
        Ok(self.lookahead.as_ref().map(|s| (s.time, s.tags.clone())))
    }

    /// Consume every sample at exactly (time, tags) into the value map;
    /// if none matches, substitute the fill value instead.
    pub fn scan_at(&mut self, time: i64, tags: &TagSet) -> QueryResult<()> {
        self.prime()?;
        let mut matched = false;
        loop {
            let sample = match self.lookahead.take() {
                Some(s) if s.time == time && s.tags == *tags => s,
                other => {
                    self.lookahead = other;
                    break;
                }
            };
            if let Some(first) = self.keys.first() {
                if !first.is_empty() {
                    self.values.insert(first.clone(), sample.value.clone());
                }
            }
            for (i, key) in self.keys.iter().enumerate().skip(1) {
                match sample.aux.get(i - 1) {
                    Some(v) => {
                        self.values.insert(key.clone(), v.clone());
                    }
                    None => Self::fill_slot(&mut self.values, key, &self.fill),
                }
            }
            matched = true;
            self.lookahead = self.input.next_sample()?;
        }
        if !matched {
            for key in &self.keys {
                if key.is_empty() {
                    continue;
                }
                Self::fill_slot(&mut self.values, key, &self.fill);
            }
        }
        Ok(())
    }

    fn fill_slot(values: &mut HashMap<String, Value>, key: &str, fill: &Value) {
        match fill {
            // Previous-value fill: keep whatever was scanned before; an
            // untouched slot stays the skip placeholder.
            Value::Skip => {
                values.entry(key.to_string()).or_insert(Value::Skip);
            }
            other => {
                values.insert(key.to_string(), other.clone());
            }
        }
    }

    /// The current column-keyed values
    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    /// Release the scanner and its iterator
    pub fn close(&mut self) {
        self.input.close();
    }
}

// ============================================================================
// Cursors
// ============================================================================

fn evaluate_fields(
    fields: &[Field],
    time: i64,
    scopes: &[&HashMap<String, Value>],
) -> Vec<Value> {
    fields.iter().map(|f| f.expr.evaluate(time, scopes)).collect()
}

fn check_point_limit(stats: &CursorStats, max_points: u64) -> QueryResult<()> {
    if max_points > 0 && stats.emitted() > max_points {
        return Err(QueryError::resource_limit(format!(
            "max-select-point limit exceeded ({} points)",
            max_points
        )));
    }
    Ok(())
}

/// Cursor over a single scanner.
pub struct ScannerCursor {
    scanner: IteratorScanner,
    fields: Vec<Field>,
    columns: Vec<Column>,
    stats: CursorStats,
    max_points: u64,
}

impl ScannerCursor {
    fn new(scanner: IteratorScanner, fields: Vec<Field>, columns: Vec<Column>) -> Self {
        Self {
            scanner,
            fields,
            columns,
            stats: CursorStats::default(),
            max_points: 0,
        }
    }
}

impl Cursor for ScannerCursor {
    fn next_row(&mut self) -> QueryResult<Option<Row>> {
        let (time, tags) = match self.scanner.peek()? {
            Some(position) => position,
            None => return Ok(None),
        };
        self.scanner.scan_at(time, &tags)?;
        let values = evaluate_fields(&self.fields, time, &[self.scanner.values()]);
        self.stats.record();
        check_point_limit(&self.stats, self.max_points)?;
        Ok(Some(Row { time, tags, values }))
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    fn close(&mut self) {
        self.scanner.close();
    }

    fn stats(&self) -> CursorStats {
        self.stats.clone()
    }

    fn set_point_limit(&mut self, max_points: u64) {
        self.max_points = max_points;
    }
}

/// Cursor that synchronizes several independently advancing scanners,
/// emitting one merged row per matching (time, tag set) position.
pub struct MultiScannerCursor {
    scanners: Vec<IteratorScanner>,
    fields: Vec<Field>,
    columns: Vec<Column>,
    ascending: bool,
    stats: CursorStats,
    max_points: u64,
}

impl MultiScannerCursor {
    fn new(
        scanners: Vec<IteratorScanner>,
        fields: Vec<Field>,
        columns: Vec<Column>,
        opt: &IteratorOptions,
    ) -> Self {
        Self {
            scanners,
            fields,
            columns,
            ascending: opt.ascending,
            stats: CursorStats::default(),
            max_points: 0,
        }
    }
}

impl Cursor for MultiScannerCursor {
    fn next_row(&mut self) -> QueryResult<Option<Row>> {
        let mut target: Option<(i64, TagSet)> = None;
        for scanner in &mut self.scanners {
            let (time, tags) = match scanner.peek()? {
                Some(position) => position,
                None => continue,
            };
            target = Some(match target.take() {
                None => (time, tags),
                Some((cur_time, cur_tags)) => {
                    let earlier = if self.ascending {
                        time < cur_time || (time == cur_time && tags < cur_tags)
                    } else {
                        time > cur_time || (time == cur_time && tags < cur_tags)
                    };
                    if earlier {
                        (time, tags)
                    } else {
                        (cur_time, cur_tags)
                    }
                }
            });
        }
        let (time, tags) = match target {
            Some(position) => position,
            None => return Ok(None),
        };

        for scanner in &mut self.scanners {
            scanner.scan_at(time, &tags)?;
        }
        let scopes: Vec<&HashMap<String, Value>> =
            self.scanners.iter().map(|s| s.values()).collect();
        let values = evaluate_fields(&self.fields, time, &scopes);
        self.stats.record();
        check_point_limit(&self.stats, self.max_points)?;
        Ok(Some(Row { time, tags, values }))
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    fn close(&mut self) {
        for scanner in &mut self.scanners {
            scanner.close();
        }
    }

    fn stats(&self) -> CursorStats {
        self.stats.clone()
    }

    fn set_point_limit(&mut self, max_points: u64) {
        self.max_points = max_points;
    }
}

// ============================================================================
// Cursor adapter for subqueries
// ============================================================================

/// Adapts a subquery's cursor into a sample iterator by pulling one of
/// its output columns as the value and resolving the outer auxiliary
/// references against its columns.
pub(crate) struct CursorIterator {
    cursor: Option<Box<dyn Cursor>>,
    name: String,
    value_index: Option<usize>,
    aux_indexes: Vec<Option<usize>>,
}

impl CursorIterator {
    pub(crate) fn new(
        cursor: Box<dyn Cursor>,
        name: String,
        value_index: Option<usize>,
        aux_indexes: Vec<Option<usize>>,
    ) -> Self {
        Self {
            cursor: Some(cursor),
            name,
            value_index,
            aux_indexes,
        }
    }
}

impl SampleIterator for CursorIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        let cursor = match self.cursor.as_mut() {
            Some(c) => c,
            None => return Ok(None),
        };
        let row = match cursor.next_row()? {
            Some(row) => row,
            None => return Ok(None),
        };
        let value = self
            .value_index
            .and_then(|i| row.values.get(i).cloned())
            .unwrap_or(Value::Null);
        let aux = self
            .aux_indexes
            .iter()
            .map(|slot| {
                slot.and_then(|i| row.values.get(i).cloned())
                    .unwrap_or(Value::Null)
            })
            .collect();
        Ok(Some(Sample {
            name: self.name.clone(),
            time: row.time,
            tags: row.tags,
            value,
            aux,
        }))
    }

    fn close(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
    }
}

// ============================================================================
// Cursor builder
// ============================================================================

/// Build the row-producing cursor for a statement.
pub fn build_cursor(
    stmt: &SelectStatement,
    ic: &dyn ShardGroup,
    mut opt: IteratorOptions,
) -> QueryResult<Box<dyn Cursor>> {
    // Normalize the fill value before anything else: an integer payload
    // widens to the iterator's 64-bit integer representation, and
    // previous-value fill substitutes the skip placeholder so readers can
    // tell "still no data" from "filled".
    let fill_value = match &opt.fill {
        FillPolicy::Number(Literal::Integer(v)) => Value::Integer(*v),
        FillPolicy::Number(other) => other.to_value(),
        FillPolicy::Previous => Value::Skip,
        _ => Value::Null,
    };

    // Assemble the output field list: the implicit time column, every
    // declared field rewritten through the value mapper, and the extra
    // tag columns of top/bottom calls when not writing into a target.
    let mut fields = Vec::with_capacity(stmt.fields.len() + 1);
    if !stmt.omit_time {
        fields.push(Field::new(Expr::var("time", FieldType::Time)));
    }
    let mut mapper = ValueMapper::new();
    for field in &stmt.fields {
        fields.push(mapper.map(field)?);

        if stmt.target.is_some() {
            continue;
        }
        if let Expr::Call(call) = &field.expr {
            if (call.name == "top" || call.name == "bottom") && call.args.len() > 2 {
                for arg in &call.args[1..call.args.len() - 1] {
                    fields.push(mapper.map(&Field::new(arg.clone()))?);
                }
            }
        }
    }

    // Final output aliases come from the statement's column names,
    // one-to-one with the assembled field list.
    let names = stmt.column_names();
    debug_assert_eq!(names.len(), fields.len());
    let mut columns = Vec::with_capacity(fields.len());
    for (field, name) in fields.iter_mut().zip(&names) {
        field.alias = Some(name.clone());
        columns.push(Column {
            name: name.clone(),
            ty: functions::infer_type(&field.expr).unwrap_or(FieldType::Unknown),
        });
    }

    // Auxiliary keys, in canonical (name, type) order so the key order is
    // deterministic regardless of traversal order.
    let mut aux_keys: Vec<String> = Vec::new();
    if !mapper.refs().is_empty() {
        let mut refs: Vec<VarRef> = mapper.refs().iter().map(|(r, _)| r.clone()).collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name).then(a.ty.cmp(&b.ty)));
        aux_keys = refs
            .iter()
            .map(|r| {
                mapper
                    .symbol(&r.to_string())
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();
        opt.aux = refs;
    }

    // With no calls the whole field list is auxiliary-only.
    if mapper.calls().is_empty() {
        debug!(fields = fields.len(), "building auxiliary-only cursor");
        let itr = build_aux_iterator(ic, &stmt.sources, &opt)?;
        let mut keys = Vec::with_capacity(aux_keys.len() + 1);
        keys.push(String::new());
        keys.extend(aux_keys.iter().cloned());
        let scanner = IteratorScanner::new(itr, keys, fill_value);
        return Ok(Box::new(ScannerCursor::new(scanner, fields, columns)));
    }

    // Selector mode: exactly one distinct call, and that call is itself
    // a selector. This disables bucket/fill wrapping for its iterator.
    let selector = mapper.calls().len() == 1 && functions::is_selector(&mapper.calls()[0].0);

    debug!(
        calls = mapper.calls().len(),
        selector, "building per-call cursor"
    );
    let mut scanners: Vec<IteratorScanner> = Vec::with_capacity(mapper.calls().len());
    for (call, symbol) in mapper.calls() {
        let expr = Expr::Call(call.clone());
        let itr = match build_field_iterator(
            &expr,
            ic,
            &stmt.sources,
            opt.clone(),
            selector,
            stmt.target.is_some(),
        ) {
            Ok(itr) => itr,
            Err(err) => {
                for scanner in &mut scanners {
                    scanner.close();
                }
                return Err(err);
            }
        };

        let mut keys = Vec::with_capacity(aux_keys.len() + 1);
        keys.push(symbol.clone());
        keys.extend(aux_keys.iter().cloned());
        scanners.push(IteratorScanner::new(itr, keys, fill_value.clone()));
    }

    if scanners.len() == 1 {
        match scanners.pop() {
            Some(scanner) => Ok(Box::new(ScannerCursor::new(scanner, fields, columns))),
            None => Err(QueryError::internal("scanner list emptied unexpectedly")),
        }
    } else {
        Ok(Box::new(MultiScannerCursor::new(
            scanners, fields, columns, &opt,
        )))
    }
}

/// Build the merged, deduplicated, limited auxiliary iterator across all
/// sources.
pub fn build_aux_iterator(
    ic: &dyn ShardGroup,
    sources: &[Source],
    opt: &IteratorOptions,
) -> QueryResult<BoxedIterator> {
    let mut owned = OwnedIterators::with_capacity(sources.len());
    for source in sources {
        match source {
            Source::Measurement(m) => owned.push(ic.create_iterator(m, opt)?),
            Source::Subquery(sub) => {
                owned.push(build_subquery_iterator(sub, None, opt, ic)?);
            }
        }
    }

    let mut itr: BoxedIterator = match MergeIterator::new(owned.hand_off(), opt) {
        Some(merge) => Box::new(merge),
        None => Box::new(NilIterator),
    };
    if let Some(handle) = &opt.interrupt {
        itr = Box::new(InterruptIterator::new(itr, handle.clone()));
    }

    // Filter out duplicate rows, if required. A fast fixed-width key
    // applies when there is no grouping and few auxiliary columns.
    if opt.dedupe {
        if opt.dimensions.is_empty() && (1..=2).contains(&opt.aux.len()) {
            itr = Box::new(FastDedupeIterator::new(itr));
        } else {
            itr = Box::new(DedupeIterator::new(itr));
        }
    }
    if opt.limit > 0 || opt.offset > 0 {
        itr = Box::new(LimitIterator::new(itr, opt));
    }
    Ok(itr)
}

/// Build the iterator for one field expression, applying limit and
/// offset after the build.
pub fn build_field_iterator(
    expr: &Expr,
    ic: &dyn ShardGroup,
    sources: &[Source],
    opt: IteratorOptions,
    selector: bool,
    write_mode: bool,
) -> QueryResult<BoxedIterator> {
    let limited = opt.limit > 0 || opt.offset > 0;
    let input = build_expr_iterator(expr, ic, sources, opt.clone(), selector, write_mode)?;
    if limited {
        return Ok(Box::new(LimitIterator::new(input, &opt)));
    }
    Ok(input)
}
