//! Expression iterator builder
//!
//! Recursively turns one expression into one iterator. Variable
//! references fan out across the statement's sources and merge; calls
//! dispatch through the function registry, which decides the construction
//! path, ordered-input forcing, and time-range widening. Every fan-out
//! releases the iterators it has built so far if a later sibling fails.

use crate::query::aggregate::{CallIterator, DistinctIterator};
use crate::query::ast::{Call, Expr, FillPolicy, Literal, SelectStatement, Source, VarRef};
use crate::query::cursor::{build_cursor, Cursor, CursorIterator};
use crate::query::error::{QueryError, QueryResult};
use crate::query::functions::{self, BuildPath, RangeExtension};
use crate::query::iterator::{
    BoxedIterator, InterruptIterator, MergeIterator, NilIterator, OwnedIterators,
};
use crate::query::options::IteratorOptions;
use crate::query::select::ShardGroup;
use crate::query::transform::{
    CumulativeSumIterator, DerivativeIterator, DifferenceIterator, ElapsedIterator, Extreme,
    FillIterator, HoltWintersIterator, IntegralIterator, IntervalIterator, MovingAverageIterator,
    RandomSampleIterator, TopBottomIterator,
};
use std::collections::BTreeSet;
use tracing::debug;

/// Build an iterator for an expression.
///
/// `selector` is true when an enclosing caller has committed to selector
/// semantics; `write_mode` when the value is destined for a different
/// measurement.
pub fn build_expr_iterator(
    expr: &Expr,
    ic: &dyn ShardGroup,
    sources: &[Source],
    mut opt: IteratorOptions,
    selector: bool,
    write_mode: bool,
) -> QueryResult<BoxedIterator> {
    opt.expr = Some(expr.clone());
    let builder = ExprIteratorBuilder {
        ic,
        sources,
        opt,
        selector,
        write_mode,
    };
    match expr {
        Expr::VarRef(r) => builder.build_var_ref_iterator(r),
        Expr::Call(call) => builder.build_call_iterator(call),
        other => Err(QueryError::type_error(format!(
            "invalid expression type: {}",
            other
        ))),
    }
}

struct ExprIteratorBuilder<'a> {
    ic: &'a dyn ShardGroup,
    sources: &'a [Source],
    opt: IteratorOptions,
    selector: bool,
    write_mode: bool,
}

impl<'a> ExprIteratorBuilder<'a> {
    fn build_var_ref_iterator(&self, r: &VarRef) -> QueryResult<BoxedIterator> {
        let mut owned = OwnedIterators::with_capacity(self.sources.len());
        for source in self.sources {
            match source {
                Source::Measurement(m) => {
                    owned.push(self.ic.create_iterator(m, &self.opt)?);
                }
                Source::Subquery(sub) => {
                    owned.push(build_subquery_iterator(sub, Some(r), &self.opt, self.ic)?);
                }
            }
        }
        Ok(self.wrap_interrupt(merge_or_nil(owned.hand_off(), &self.opt)))
    }

    fn build_call_iterator(&self, call: &Call) -> QueryResult<BoxedIterator> {
        let spec = functions::lookup(&call.name)
            .ok_or_else(|| QueryError::unsupported_call(&call.name))?;
        functions::validate_args(call)?;
        debug!(call = %call, path = ?spec.path, "building call iterator");

        // Limits and offsets are applied by the caller, never by the
        // inner build.
        let mut opt = self.opt.clone();
        opt.limit = 0;
        opt.offset = 0;

        match spec.path {
            BuildPath::Distinct => {
                opt.ordered = true;
                let input = build_expr_iterator(
                    &call.args[0],
                    self.ic,
                    self.sources,
                    opt.clone(),
                    self.selector,
                    false,
                )?;
                let distinct = DistinctIterator::new(input, &opt);
                Ok(Box::new(IntervalIterator::new(Box::new(distinct), &opt)))
            }
            BuildPath::Sample => {
                opt.ordered = true;
                let input = build_expr_iterator(
                    &call.args[0],
                    self.ic,
                    self.sources,
                    opt.clone(),
                    self.selector,
                    false,
                )?;
                let size = int_arg(call, 1)?;
                Ok(Box::new(RandomSampleIterator::new(
                    input,
                    size as usize,
                    &opt,
                )))
            }
            BuildPath::HoltWinters { with_fit } => {
                opt.ordered = true;
                let input = build_expr_iterator(
                    &call.args[0],
                    self.ic,
                    self.sources,
                    opt.clone(),
                    self.selector,
                    false,
                )?;
                let h = int_arg(call, 1)?;
                let m = int_arg(call, 2)?;

                // The smoothing stage sees the complete series: capture
                // the bucket spacing, then drop bucketing and bounds.
                let spacing = opt.interval.duration;
                opt.unbound_range();
                Ok(Box::new(HoltWintersIterator::new(
                    input,
                    h as usize,
                    m as usize,
                    with_fit,
                    spacing,
                    &opt,
                )))
            }
            BuildPath::SeriesTransform => {
                if !opt.interval.is_zero() {
                    match spec.range_extension {
                        RangeExtension::OneInterval => opt.extend_range(opt.interval.duration),
                        RangeExtension::WindowIntervals => {
                            let n = int_arg(call, 1)?;
                            if n > 1 {
                                opt.extend_range(opt.interval.duration * (n - 1));
                            }
                        }
                        RangeExtension::None => {}
                    }
                }
                opt.ordered = true;

                let input = build_expr_iterator(
                    &call.args[0],
                    self.ic,
                    self.sources,
                    opt.clone(),
                    self.selector,
                    false,
                )?;

                match call.name.as_str() {
                    "derivative" | "non_negative_derivative" => {
                        let unit = opt.derivative_interval(call);
                        let non_negative = call.name == "non_negative_derivative";
                        Ok(Box::new(DerivativeIterator::new(input, unit, non_negative)))
                    }
                    "elapsed" => {
                        let unit = opt.elapsed_interval(call);
                        Ok(Box::new(ElapsedIterator::new(input, unit)))
                    }
                    "difference" | "non_negative_difference" => {
                        let non_negative = call.name == "non_negative_difference";
                        Ok(Box::new(DifferenceIterator::new(input, non_negative)))
                    }
                    "moving_average" => {
                        let n = int_arg(call, 1)?;
                        Ok(Box::new(MovingAverageIterator::new(input, n as usize)))
                    }
                    other => Err(QueryError::internal(format!(
                        "invalid series transform: {}",
                        other
                    ))),
                }
            }
            BuildPath::CumulativeSum => {
                opt.ordered = true;
                let input = build_expr_iterator(
                    &call.args[0],
                    self.ic,
                    self.sources,
                    opt.clone(),
                    self.selector,
                    false,
                )?;
                Ok(Box::new(CumulativeSumIterator::new(input)))
            }
            BuildPath::Integral => {
                opt.ordered = true;
                let input = build_expr_iterator(
                    &call.args[0],
                    self.ic,
                    self.sources,
                    opt.clone(),
                    false,
                    false,
                )?;
                let unit = opt.integral_interval(call);
                Ok(Box::new(IntegralIterator::new(input, unit, &opt)))
            }
            BuildPath::TopBottom => self.build_top_bottom_iterator(call, opt),
            BuildPath::Generic | BuildPath::EngineAggregate => {
                self.build_aggregate_iterator(call, spec.forces_ordered, opt)
            }
        }
    }

    /// `top`/`bottom`: with only a value and a count, select over the
    /// plain merged reference; with extra tag arguments, first build an
    /// intermediate max/min grouped by the union of those tags and the
    /// statement's dimensions, with fill disabled.
    fn build_top_bottom_iterator(
        &self,
        call: &Call,
        opt: IteratorOptions,
    ) -> QueryResult<BoxedIterator> {
        let extreme = if call.name == "top" {
            Extreme::Top
        } else {
            Extreme::Bottom
        };
        let n = int_arg(call, call.args.len() - 1)?;

        let input = if call.args.len() > 2 {
            let mut dims: BTreeSet<String> = opt.group_by.clone();
            for arg in &call.args[1..call.args.len() - 1] {
                if let Expr::VarRef(r) = arg {
                    dims.insert(r.name.clone());
                }
            }

            let inner = Call::new(
                if extreme == Extreme::Top { "max" } else { "min" },
                vec![call.args[0].clone()],
            );
            let mut call_opt = opt.clone();
            call_opt.expr = Some(Expr::Call(inner.clone()));
            call_opt.dimensions = dims.iter().cloned().collect();
            call_opt.group_by = dims;
            call_opt.fill = FillPolicy::None;

            let builder = ExprIteratorBuilder {
                ic: self.ic,
                sources: self.sources,
                opt: call_opt.clone(),
                selector: true,
                write_mode: false,
            };
            builder.call_iterator(&inner, &call_opt)?
        } else {
            let r = call
                .first_ref()
                .ok_or_else(|| bad_first_argument(call))?;
            let mut ref_opt = opt.clone();
            ref_opt.expr = Some(call.args[0].clone());
            let builder = ExprIteratorBuilder {
                ic: self.ic,
                sources: self.sources,
                opt: ref_opt,
                selector: true,
                write_mode: false,
            };
            builder.build_var_ref_iterator(r)?
        };

        Ok(Box::new(TopBottomIterator::new(
            input,
            extreme,
            n as usize,
            &opt,
            self.write_mode,
        )))
    }

    /// The shared tail for generic and engine-side aggregates: build the
    /// named aggregate, then apply interval bucketing, fill substitution,
    /// and interrupt wrapping.
    fn build_aggregate_iterator(
        &self,
        call: &Call,
        forces_ordered: bool,
        mut opt: IteratorOptions,
    ) -> QueryResult<BoxedIterator> {
        let itr = match call.name.as_str() {
            "count" => {
                // count(distinct(x)) builds the distinct iterator first
                // and wraps it in a count; plain count goes through the
                // per-source path.
                match &call.args[0] {
                    Expr::Call(inner) if inner.name == "distinct" => {
                        let input = build_expr_iterator(
                            &call.args[0],
                            self.ic,
                            self.sources,
                            opt.clone(),
                            self.selector,
                            false,
                        )?;
                        Box::new(CallIterator::new(input, call, &opt)?) as BoxedIterator
                    }
                    _ => self.call_iterator(call, &opt)?,
                }
            }
            "min" | "max" | "sum" | "first" | "last" | "mean" => self.call_iterator(call, &opt)?,
            "median" | "mode" | "stddev" | "spread" | "percentile" => {
                if forces_ordered {
                    opt.ordered = true;
                }
                let arg0 = call
                    .first_ref()
                    .ok_or_else(|| bad_first_argument(call))?;
                let input = build_expr_iterator(
                    &Expr::VarRef(arg0.clone()),
                    self.ic,
                    self.sources,
                    opt.clone(),
                    false,
                    false,
                )?;
                Box::new(CallIterator::new(input, call, &opt)?) as BoxedIterator
            }
            other => return Err(QueryError::unsupported_call(other)),
        };

        // A true selector evaluated without bucketing keeps the original
        // samples untouched; everything else gets bucket truncation, and
        // bucketed output with an active fill policy gets substitution.
        let mut itr = itr;
        if !self.selector || !opt.interval.is_zero() {
            itr = Box::new(IntervalIterator::new(itr, &opt));
            if !opt.interval.is_zero() && opt.fill != FillPolicy::None {
                let expr = Expr::Call(call.clone());
                itr = Box::new(FillIterator::new(itr, &expr, &opt));
            }
        }
        Ok(self.wrap_interrupt(itr))
    }

    /// One aggregate iterator per source: concrete sources push the call
    /// down to storage; subquery sources build the argument recursively
    /// and wrap it in an engine-side call iterator. All results merge.
    fn call_iterator(&self, call: &Call, opt: &IteratorOptions) -> QueryResult<BoxedIterator> {
        let mut owned = OwnedIterators::with_capacity(self.sources.len());
        for source in self.sources {
            match source {
                Source::Measurement(m) => {
                    owned.push(self.ic.create_call_iterator(m, call, opt)?);
                }
                Source::Subquery(_) => {
                    let arg0 = call
                        .first_ref()
                        .ok_or_else(|| bad_first_argument(call))?;
                    let input = build_expr_iterator(
                        &Expr::VarRef(arg0.clone()),
                        self.ic,
                        std::slice::from_ref(source),
                        opt.clone(),
                        self.selector,
                        false,
                    )?;
                    owned.push(Box::new(CallIterator::new(input, call, opt)?));
                }
            }
        }
        Ok(merge_or_nil(owned.hand_off(), opt))
    }

    fn wrap_interrupt(&self, itr: BoxedIterator) -> BoxedIterator {
        match &self.opt.interrupt {
            Some(handle) => Box::new(InterruptIterator::new(itr, handle.clone())),
            None => itr,
        }
    }
}

fn merge_or_nil(inputs: Vec<BoxedIterator>, opt: &IteratorOptions) -> BoxedIterator {
    match MergeIterator::new(inputs, opt) {
        Some(merge) => Box::new(merge),
        None => Box::new(NilIterator),
    }
}

fn int_arg(call: &Call, index: usize) -> QueryResult<i64> {
    match call.args.get(index) {
        Some(Expr::Literal(Literal::Integer(n))) => Ok(*n),
        _ => Err(QueryError::invalid_arguments(format!(
            "{}() argument {} must be an integer literal",
            call.name, index
        ))),
    }
}

fn bad_first_argument(call: &Call) -> QueryError {
    QueryError::invalid_arguments(format!(
        "{}() argument 0 must be a field reference",
        call.name
    ))
}

/// Build an iterator over a subquery source by preparing the subquery's
/// own statement and pulling one of its output columns.
///
/// With `value_ref` set, that column feeds the sample values; without it
/// the iterator carries auxiliary columns only. The outer auxiliary list
/// is resolved against the subquery's columns by name.
pub(crate) fn build_subquery_iterator(
    stmt: &SelectStatement,
    value_ref: Option<&VarRef>,
    outer: &IteratorOptions,
    ic: &dyn ShardGroup,
) -> QueryResult<BoxedIterator> {
    let mut inner = IteratorOptions::from_statement(stmt)?;
    inner.start_time = inner.start_time.max(outer.start_time);
    inner.end_time = inner.end_time.min(outer.end_time);
    inner.interrupt = outer.interrupt.clone();

    let cursor = build_cursor(stmt, ic, inner)?;

    let value_index = match value_ref {
        Some(r) => {
            let index = cursor.columns().iter().position(|c| c.name == r.name);
            match index {
                Some(i) => Some(i),
                None => {
                    // The subquery does not expose the referenced column.
                    let mut cursor = cursor;
                    cursor.close();
                    return Ok(Box::new(NilIterator));
                }
            }
        }
        None => None,
    };
    let aux_indexes: Vec<Option<usize>> = outer
        .aux
        .iter()
        .map(|r| cursor.columns().iter().position(|c| c.name == r.name))
        .collect();

    let name = stmt
        .sources
        .iter()
        .find_map(|s| match s {
            Source::Measurement(m) => Some(m.name.clone()),
            Source::Subquery(_) => None,
        })
        .unwrap_or_default();

    Ok(Box::new(CursorIterator::new(
        cursor,
        name,
        value_index,
        aux_indexes,
    )))
}
