//! Aggregate call iterators
//!
//! The generic call iterator groups its input by (bucket, series name,
//! projected tags) and reduces each group with the named aggregate. It
//! backs both the engine-side aggregation path (median, mode, stddev,
//! spread, percentile) and subquery sources on the push-down path, and
//! doubles as the storage fallback for sources that return raw samples.
//!
//! Numerically sensitive reductions use stable algorithms: Welford's
//! online algorithm for mean/stddev and a t-digest for large median
//! inputs.

use crate::query::ast::{Call, Expr, Interval, Literal};
use crate::query::error::{QueryError, QueryResult};
use crate::query::functions;
use crate::query::iterator::{BoxedIterator, Sample, SampleIterator, Value};
use crate::query::options::IteratorOptions;
use crate::types::TagSet;
use std::collections::{BTreeMap, HashMap, HashSet};
use tdigest::TDigest;

/// Inputs larger than this switch from exact median to the t-digest
/// estimate.
const MEDIAN_EXACT_LIMIT: usize = 1024;

// ============================================================================
// Welford state
// ============================================================================

/// Welford's online algorithm for mean and variance
#[derive(Debug, Clone, Default)]
struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    #[inline]
    fn add(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn stddev_sample(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        Some((self.m2 / (self.count - 1) as f64).sqrt())
    }
}

// ============================================================================
// Group states
// ============================================================================

/// Type-preserving sum accumulator: integer input stays integer, any
/// float operand promotes.
#[derive(Debug, Clone)]
enum SumAcc {
    Empty,
    Int(i64),
    Uint(u64),
    Float(f64),
}

impl SumAcc {
    fn add(&mut self, value: &Value) {
        *self = match (std::mem::replace(self, SumAcc::Empty), value) {
            (SumAcc::Empty, Value::Integer(v)) => SumAcc::Int(*v),
            (SumAcc::Empty, Value::Unsigned(v)) => SumAcc::Uint(*v),
            (SumAcc::Empty, Value::Float(v)) => SumAcc::Float(*v),
            (SumAcc::Int(acc), Value::Integer(v)) => SumAcc::Int(acc.wrapping_add(*v)),
            (SumAcc::Uint(acc), Value::Unsigned(v)) => SumAcc::Uint(acc.wrapping_add(*v)),
            (acc, v) => {
                let current = match acc {
                    SumAcc::Empty => 0.0,
                    SumAcc::Int(a) => a as f64,
                    SumAcc::Uint(a) => a as f64,
                    SumAcc::Float(a) => a,
                };
                SumAcc::Float(current + v.as_f64().unwrap_or(0.0))
            }
        };
    }

    fn finish(self) -> Option<Value> {
        match self {
            SumAcc::Empty => None,
            SumAcc::Int(v) => Some(Value::Integer(v)),
            SumAcc::Uint(v) => Some(Value::Unsigned(v)),
            SumAcc::Float(v) => Some(Value::Float(v)),
        }
    }
}

enum GroupState {
    Count(u64),
    Sum(SumAcc),
    Mean(Welford),
    Stddev(Welford),
    Spread(Option<(Value, Value)>),
    /// min/max: the chosen original sample survives
    Extreme {
        best: Option<Sample>,
        want_max: bool,
    },
    /// first/last: earliest/latest original sample survives
    Edge {
        best: Option<Sample>,
        want_last: bool,
    },
    /// median, mode, percentile buffer the group
    Collected(Vec<Sample>),
}

impl GroupState {
    fn new(name: &str) -> Self {
        match name {
            "count" => GroupState::Count(0),
            "sum" => GroupState::Sum(SumAcc::Empty),
            "mean" => GroupState::Mean(Welford::default()),
            "stddev" => GroupState::Stddev(Welford::default()),
            "spread" => GroupState::Spread(None),
            "min" => GroupState::Extreme {
                best: None,
                want_max: false,
            },
            "max" => GroupState::Extreme {
                best: None,
                want_max: true,
            },
            "first" => GroupState::Edge {
                best: None,
                want_last: false,
            },
            "last" => GroupState::Edge {
                best: None,
                want_last: true,
            },
            _ => GroupState::Collected(Vec::new()),
        }
    }

    fn update(&mut self, sample: Sample) {
        if sample.value.is_null() {
            return;
        }
        match self {
            GroupState::Count(n) => *n += 1,
            GroupState::Sum(acc) => acc.add(&sample.value),
            GroupState::Mean(w) | GroupState::Stddev(w) => {
                if let Some(v) = sample.value.as_f64() {
                    w.add(v);
                }
            }
            GroupState::Spread(range) => {
                *range = match range.take() {
                    None => Some((sample.value.clone(), sample.value)),
                    Some((lo, hi)) => {
                        let lo = if sample.value.compare(&lo).is_lt() {
                            sample.value.clone()
                        } else {
                            lo
                        };
                        let hi = if sample.value.compare(&hi).is_gt() {
                            sample.value
                        } else {
                            hi
                        };
                        Some((lo, hi))
                    }
                };
            }
            GroupState::Extreme { best, want_max } => {
                let replace = match best.as_ref() {
                    None => true,
                    Some(current) => {
                        let ord = sample.value.compare(&current.value);
                        if *want_max {
                            ord.is_gt()
                        } else {
                            ord.is_lt()
                        }
                    }
                };
                if replace {
                    *best = Some(sample);
                }
            }
            GroupState::Edge { best, want_last } => {
                let replace = match best.as_ref() {
                    None => true,
                    Some(current) => {
                        if *want_last {
                            sample.time > current.time
                                || (sample.time == current.time
                                    && sample.value.compare(&current.value).is_gt())
                        } else {
                            sample.time < current.time
                                || (sample.time == current.time
                                    && sample.value.compare(&current.value).is_gt())
                        }
                    }
                };
                if replace {
                    *best = Some(sample);
                }
            }
            GroupState::Collected(samples) => samples.push(sample),
        }
    }
}

// ============================================================================
// Call Iterator
// ============================================================================

/// Reduces its input with a named aggregate, one output sample per
/// (bucket, series, tag group).
///
/// Selector aggregates emit the chosen original sample; synthetic
/// aggregates emit at the bucket start (the query start when no interval
/// is active).
pub struct CallIterator {
    input: Option<BoxedIterator>,
    call: Call,
    dimensions: Vec<String>,
    interval: Interval,
    start_time: i64,
    ascending: bool,
    results: Option<std::vec::IntoIter<Sample>>,
}

impl CallIterator {
    /// Wrap an input in the named aggregate.
    ///
    /// Takes ownership of the input; on a rejected call name the input is
    /// released before the error propagates.
    pub fn new(mut input: BoxedIterator, call: &Call, opt: &IteratorOptions) -> QueryResult<Self> {
        if functions::lookup(&call.name).is_none() {
            input.close();
            return Err(QueryError::unsupported_call(&call.name));
        }
        Ok(Self {
            input: Some(input),
            call: call.clone(),
            dimensions: opt.dimensions.clone(),
            interval: opt.interval,
            start_time: opt.start_time,
            ascending: opt.ascending,
            results: None,
        })
    }

    fn bucket(&self, t: i64) -> i64 {
        if self.interval.is_zero() {
            self.start_time
        } else {
            self.interval.window_start(t)
        }
    }

    fn compute(&mut self) -> QueryResult<()> {
        let mut input = match self.input.take() {
            Some(i) => i,
            None => return Ok(()),
        };
        let mut groups: BTreeMap<(i64, String, TagSet), GroupState> = BTreeMap::new();
        let drain = (|| -> QueryResult<()> {
            while let Some(sample) = input.next_sample()? {
                let key = (
                    self.bucket(sample.time),
                    sample.name.clone(),
                    sample.tags.project(self.dimensions.iter().map(|d| d.as_str())),
                );
                let mut grouped = sample;
                grouped.tags = key.2.clone();
                groups
                    .entry(key)
                    .or_insert_with(|| GroupState::new(&self.call.name))
                    .update(grouped);
            }
            Ok(())
        })();
        input.close();
        drain?;

        let mut out = Vec::with_capacity(groups.len());
        for ((bucket, name, tags), state) in groups {
            if let Some(sample) = self.finalize(bucket, name, tags, state) {
                out.push(sample);
            }
        }
        if !self.ascending {
            out.reverse();
        }
        self.results = Some(out.into_iter());
        Ok(())
    }

    fn finalize(
        &self,
        bucket: i64,
        name: String,
        tags: TagSet,
        state: GroupState,
    ) -> Option<Sample> {
        let synthetic = |value: Value| Sample {
            name: name.clone(),
            time: bucket,
            tags: tags.clone(),
            value,
            aux: Vec::new(),
        };
        match state {
            GroupState::Count(n) => Some(synthetic(Value::Integer(n as i64))),
            GroupState::Sum(acc) => acc.finish().map(synthetic),
            GroupState::Mean(w) => {
                if w.count == 0 {
                    None
                } else {
                    Some(synthetic(Value::Float(w.mean)))
                }
            }
            GroupState::Stddev(w) => w.stddev_sample().map(|v| synthetic(Value::Float(v))),
            GroupState::Spread(range) => range.map(|(lo, hi)| {
                let value = match (&lo, &hi) {
                    (Value::Integer(a), Value::Integer(b)) => Value::Integer(b - a),
                    (Value::Unsigned(a), Value::Unsigned(b)) => Value::Unsigned(b - a),
                    _ => Value::Float(
                        hi.as_f64().unwrap_or(0.0) - lo.as_f64().unwrap_or(0.0),
                    ),
                };
                synthetic(value)
            }),
            GroupState::Extreme { best, .. } | GroupState::Edge { best, .. } => best,
            GroupState::Collected(samples) => match self.call.name.as_str() {
                "median" => median(&samples).map(synthetic),
                "mode" => mode(samples).map(synthetic),
                "percentile" => percentile(samples, self.percentile_arg()),
                _ => None,
            },
        }
    }

    fn percentile_arg(&self) -> f64 {
        match self.call.args.get(1) {
            Some(Expr::Literal(Literal::Number(p))) => *p,
            Some(Expr::Literal(Literal::Integer(p))) => *p as f64,
            _ => 0.0,
        }
    }
}

impl SampleIterator for CallIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        if self.results.is_none() {
            self.compute()?;
        }
        Ok(self.results.as_mut().and_then(|r| r.next()))
    }

    fn close(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
        }
        self.results = None;
    }
}

fn median(samples: &[Sample]) -> Option<Value> {
    let mut values: Vec<f64> = samples.iter().filter_map(|s| s.value.as_f64()).collect();
    if values.is_empty() {
        return None;
    }
    if values.len() > MEDIAN_EXACT_LIMIT {
        let digest = TDigest::new_with_size(100);
        let digest = digest.merge_unsorted(values);
        return Some(Value::Float(digest.estimate_quantile(0.5)));
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    let value = if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    };
    Some(Value::Float(value))
}

fn mode(samples: Vec<Sample>) -> Option<Value> {
    let mut counts: HashMap<Vec<u8>, (usize, Value)> = HashMap::new();
    for sample in samples {
        let mut key = Vec::with_capacity(16);
        sample.value.encode_into(&mut key);
        counts
            .entry(key)
            .and_modify(|(n, _)| *n += 1)
            .or_insert((1, sample.value));
    }
    counts
        .into_values()
        .max_by(|(na, va), (nb, vb)| na.cmp(nb).then_with(|| vb.compare(va)))
        .map(|(_, value)| value)
}

fn percentile(mut samples: Vec<Sample>, p: f64) -> Option<Sample> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(|a, b| a.value.compare(&b.value));
    let rank = ((samples.len() as f64) * p / 100.0 + 0.5).floor() as i64 - 1;
    if rank < 0 || rank as usize >= samples.len() {
        return None;
    }
    Some(samples.swap_remove(rank as usize))
}

// ============================================================================
// Distinct
// ============================================================================

/// Emits each distinct value once per (bucket, series, tag group), in
/// first-seen order, at the bucket start.
pub struct DistinctIterator {
    input: Option<BoxedIterator>,
    dimensions: Vec<String>,
    interval: Interval,
    start_time: i64,
    ascending: bool,
    results: Option<std::vec::IntoIter<Sample>>,
}

impl DistinctIterator {
    /// Wrap an input in distinct-value reduction
    pub fn new(input: BoxedIterator, opt: &IteratorOptions) -> Self {
        Self {
            input: Some(input),
            dimensions: opt.dimensions.clone(),
            interval: opt.interval,
            start_time: opt.start_time,
            ascending: opt.ascending,
            results: None,
        }
    }

    fn compute(&mut self) -> QueryResult<()> {
        let mut input = match self.input.take() {
            Some(i) => i,
            None => return Ok(()),
        };
        let mut groups: BTreeMap<(i64, String, TagSet), (HashSet<Vec<u8>>, Vec<Value>)> =
            BTreeMap::new();
        let drain = (|| -> QueryResult<()> {
            while let Some(sample) = input.next_sample()? {
                if sample.value.is_null() {
                    continue;
                }
                let bucket = if self.interval.is_zero() {
                    self.start_time
                } else {
                    self.interval.window_start(sample.time)
                };
                let key = (
                    bucket,
                    sample.name.clone(),
                    sample.tags.project(self.dimensions.iter().map(|d| d.as_str())),
                );
                let (seen, ordered) = groups.entry(key).or_default();
                let mut encoded = Vec::with_capacity(16);
                sample.value.encode_into(&mut encoded);
                if seen.insert(encoded) {
                    ordered.push(sample.value);
                }
            }
            Ok(())
        })();
        input.close();
        drain?;

        let mut out = Vec::new();
        for ((bucket, name, tags), (_, values)) in groups {
            for value in values {
                out.push(Sample {
                    name: name.clone(),
                    time: bucket,
                    tags: tags.clone(),
                    value,
                    aux: Vec::new(),
                });
            }
        }
        if !self.ascending {
            out.reverse();
        }
        self.results = Some(out.into_iter());
        Ok(())
    }
}

impl SampleIterator for DistinctIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        if self.results.is_none() {
            self.compute()?;
        }
        Ok(self.results.as_mut().and_then(|r| r.next()))
    }

    fn close(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
        }
        self.results = None;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    struct VecIterator {
        samples: Vec<Sample>,
        index: usize,
    }

    impl VecIterator {
        fn new(samples: Vec<Sample>) -> Self {
            Self { samples, index: 0 }
        }
    }

    impl SampleIterator for VecIterator {
        fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
            if self.index >= self.samples.len() {
                return Ok(None);
            }
            let s = self.samples[self.index].clone();
            self.index += 1;
            Ok(Some(s))
        }

        fn close(&mut self) {}
    }

    fn samples(values: &[(i64, f64)]) -> Vec<Sample> {
        values
            .iter()
            .map(|&(t, v)| Sample::new("m", t, Value::Float(v)))
            .collect()
    }

    fn run(mut itr: impl SampleIterator) -> Vec<Sample> {
        let mut out = Vec::new();
        while let Some(s) = itr.next_sample().unwrap() {
            out.push(s);
        }
        out
    }

    fn call_over(name: &str, data: Vec<Sample>, opt: &IteratorOptions) -> Vec<Sample> {
        let call = Call::new(name, vec![Expr::var("x", FieldType::Float)]);
        let itr = CallIterator::new(Box::new(VecIterator::new(data)), &call, opt).unwrap();
        run(itr)
    }

    #[test]
    fn test_mean_over_buckets() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 120,
            interval: Interval::new(60),
            ..IteratorOptions::default()
        };
        let out = call_over("mean", samples(&[(0, 1.0), (30, 3.0), (90, 10.0)]), &opt);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].time, 0);
        assert_eq!(out[0].value, Value::Float(2.0));
        assert_eq!(out[1].time, 60);
        assert_eq!(out[1].value, Value::Float(10.0));
    }

    #[test]
    fn test_max_keeps_original_sample() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 100,
            ..IteratorOptions::default()
        };
        let out = call_over("max", samples(&[(0, 5.0), (10, 9.0), (20, 1.0)]), &opt);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].time, 10);
        assert_eq!(out[0].value, Value::Float(9.0));
    }

    #[test]
    fn test_count_is_integer() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 100,
            ..IteratorOptions::default()
        };
        let out = call_over("count", samples(&[(0, 5.0), (10, 9.0)]), &opt);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].time, 0);
        assert_eq!(out[0].value, Value::Integer(2));
    }

    #[test]
    fn test_sum_preserves_integer_type() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 100,
            ..IteratorOptions::default()
        };
        let data = vec![
            Sample::new("m", 0, Value::Integer(2)),
            Sample::new("m", 10, Value::Integer(3)),
        ];
        let out = call_over("sum", data, &opt);
        assert_eq!(out[0].value, Value::Integer(5));
    }

    #[test]
    fn test_median_even_and_odd() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 100,
            ..IteratorOptions::default()
        };
        let out = call_over("median", samples(&[(0, 1.0), (10, 3.0), (20, 10.0)]), &opt);
        assert_eq!(out[0].value, Value::Float(3.0));

        let out = call_over("median", samples(&[(0, 1.0), (10, 3.0)]), &opt);
        assert_eq!(out[0].value, Value::Float(2.0));
    }

    #[test]
    fn test_percentile_rank_selection() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 100,
            ..IteratorOptions::default()
        };
        let call = Call::new(
            "percentile",
            vec![
                Expr::var("x", FieldType::Float),
                Expr::Literal(Literal::Integer(50)),
            ],
        );
        let data = samples(&[(0, 1.0), (10, 2.0), (20, 3.0), (30, 4.0)]);
        let itr = CallIterator::new(Box::new(VecIterator::new(data)), &call, &opt).unwrap();
        let out = run(itr);
        // floor(4 * 50 / 100 + 0.5) - 1 = 1 → second-smallest value, with
        // its original timestamp.
        assert_eq!(out[0].value, Value::Float(2.0));
        assert_eq!(out[0].time, 10);
    }

    #[test]
    fn test_stddev_needs_two_values() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 100,
            ..IteratorOptions::default()
        };
        assert!(call_over("stddev", samples(&[(0, 5.0)]), &opt).is_empty());

        let out = call_over("stddev", samples(&[(0, 1.0), (10, 3.0)]), &opt);
        match &out[0].value {
            Value::Float(v) => assert!((v - std::f64::consts::SQRT_2).abs() < 1e-9),
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn test_mode_tie_picks_smallest() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 100,
            ..IteratorOptions::default()
        };
        let out = call_over("mode", samples(&[(0, 5.0), (10, 2.0), (20, 5.0), (30, 2.0)]), &opt);
        assert_eq!(out[0].value, Value::Float(2.0));
    }

    #[test]
    fn test_distinct_first_seen_order() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 100,
            ..IteratorOptions::default()
        };
        let data = samples(&[(0, 3.0), (10, 1.0), (20, 3.0), (30, 1.0), (40, 2.0)]);
        let itr = DistinctIterator::new(Box::new(VecIterator::new(data)), &opt);
        let out = run(itr);
        let values: Vec<Value> = out.into_iter().map(|s| s.value).collect();
        assert_eq!(
            values,
            vec![Value::Float(3.0), Value::Float(1.0), Value::Float(2.0)]
        );
    }

    #[test]
    fn test_grouped_aggregation_by_tag() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 100,
            dimensions: vec!["host".to_string()],
            ..IteratorOptions::default()
        };
        let mut data = Vec::new();
        for (host, v) in [("a", 1.0), ("b", 10.0), ("a", 3.0), ("b", 20.0)] {
            let mut tags = TagSet::new();
            tags.insert("host", host);
            data.push(Sample::new("m", 0, Value::Float(v)).with_tags(tags));
        }
        let out = call_over("mean", data, &opt);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].tags.get("host"), Some("a"));
        assert_eq!(out[0].value, Value::Float(2.0));
        assert_eq!(out[1].tags.get("host"), Some("b"));
        assert_eq!(out[1].value, Value::Float(15.0));
    }
}
