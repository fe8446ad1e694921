//! Windowed and ordered series transforms
//!
//! These iterators consume strictly time-sorted input (the builder forces
//! the ordered flag before constructing them) and reshape it: pairwise
//! rates and differences, moving averages, cumulative sums, per-bucket
//! integrals, reservoir sampling, seasonal forecasting, and extreme-by-
//! count selection. Interval bucketing and fill substitution live here as
//! well since they wrap transform and aggregate outputs alike.

use crate::query::ast::{Expr, Interval};
use crate::query::error::QueryResult;
use crate::query::functions;
use crate::query::iterator::{BoxedIterator, Sample, SampleIterator, Value};
use crate::query::options::IteratorOptions;
use crate::types::{FieldType, TagSet};
use std::collections::{BTreeMap, HashMap, VecDeque};

type GroupKey = (String, TagSet);

fn group_key(sample: &Sample) -> GroupKey {
    (sample.name.clone(), sample.tags.clone())
}

// ============================================================================
// Pairwise transforms
// ============================================================================

/// Rate of change between consecutive samples, scaled to a unit duration.
pub struct DerivativeIterator {
    input: BoxedIterator,
    unit: i64,
    non_negative: bool,
    prev: HashMap<GroupKey, Sample>,
}

impl DerivativeIterator {
    /// Wrap an input in a derivative computation
    pub fn new(input: BoxedIterator, unit: i64, non_negative: bool) -> Self {
        Self {
            input,
            unit,
            non_negative,
            prev: HashMap::new(),
        }
    }
}

impl SampleIterator for DerivativeIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        loop {
            let sample = match self.input.next_sample()? {
                Some(s) => s,
                None => return Ok(None),
            };
            let key = group_key(&sample);
            let prev = self.prev.insert(key, sample.clone());
            let prev = match prev {
                Some(p) => p,
                None => continue,
            };
            let (v0, v1) = match (prev.value.as_f64(), sample.value.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => continue,
            };
            if sample.time == prev.time {
                continue;
            }
            let elapsed = (sample.time - prev.time) as f64 / self.unit as f64;
            let rate = (v1 - v0) / elapsed;
            if self.non_negative && rate < 0.0 {
                continue;
            }
            let mut out = sample;
            out.value = Value::Float(rate);
            out.aux = Vec::new();
            return Ok(Some(out));
        }
    }

    fn close(&mut self) {
        self.input.close();
    }
}

/// Difference between consecutive samples, type-preserving.
pub struct DifferenceIterator {
    input: BoxedIterator,
    non_negative: bool,
    prev: HashMap<GroupKey, Sample>,
}

impl DifferenceIterator {
    /// Wrap an input in a difference computation
    pub fn new(input: BoxedIterator, non_negative: bool) -> Self {
        Self {
            input,
            non_negative,
            prev: HashMap::new(),
        }
    }
}

impl SampleIterator for DifferenceIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        loop {
            let sample = match self.input.next_sample()? {
                Some(s) => s,
                None => return Ok(None),
            };
            let key = group_key(&sample);
            let prev = self.prev.insert(key, sample.clone());
            let prev = match prev {
                Some(p) => p,
                None => continue,
            };
            let value = match (&prev.value, &sample.value) {
                (Value::Integer(a), Value::Integer(b)) => Value::Integer(b.wrapping_sub(*a)),
                _ => match (prev.value.as_f64(), sample.value.as_f64()) {
                    (Some(a), Some(b)) => Value::Float(b - a),
                    _ => continue,
                },
            };
            if self.non_negative {
                let negative = match &value {
                    Value::Integer(v) => *v < 0,
                    Value::Float(v) => *v < 0.0,
                    _ => false,
                };
                if negative {
                    continue;
                }
            }
            let mut out = sample;
            out.value = value;
            out.aux = Vec::new();
            return Ok(Some(out));
        }
    }

    fn close(&mut self) {
        self.input.close();
    }
}

/// Time elapsed between consecutive samples, in units of a duration.
pub struct ElapsedIterator {
    input: BoxedIterator,
    unit: i64,
    prev: HashMap<GroupKey, i64>,
}

impl ElapsedIterator {
    /// Wrap an input in an elapsed-time computation
    pub fn new(input: BoxedIterator, unit: i64) -> Self {
        Self {
            input,
            unit,
            prev: HashMap::new(),
        }
    }
}

impl SampleIterator for ElapsedIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        loop {
            let sample = match self.input.next_sample()? {
                Some(s) => s,
                None => return Ok(None),
            };
            let key = group_key(&sample);
            let prev = self.prev.insert(key, sample.time);
            let prev = match prev {
                Some(t) => t,
                None => continue,
            };
            let mut out = sample;
            out.value = Value::Integer((out.time - prev) / self.unit);
            out.aux = Vec::new();
            return Ok(Some(out));
        }
    }

    fn close(&mut self) {
        self.input.close();
    }
}

/// Mean of the last `window` samples, emitted once the window is full.
pub struct MovingAverageIterator {
    input: BoxedIterator,
    window: usize,
    buffers: HashMap<GroupKey, VecDeque<f64>>,
}

impl MovingAverageIterator {
    /// Wrap an input in a moving average of the given window size
    pub fn new(input: BoxedIterator, window: usize) -> Self {
        Self {
            input,
            window: window.max(1),
            buffers: HashMap::new(),
        }
    }
}

impl SampleIterator for MovingAverageIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        loop {
            let sample = match self.input.next_sample()? {
                Some(s) => s,
                None => return Ok(None),
            };
            let v = match sample.value.as_f64() {
                Some(v) => v,
                None => continue,
            };
            let buffer = self.buffers.entry(group_key(&sample)).or_default();
            buffer.push_back(v);
            if buffer.len() > self.window {
                buffer.pop_front();
            }
            if buffer.len() < self.window {
                continue;
            }
            let mean = buffer.iter().sum::<f64>() / buffer.len() as f64;
            let mut out = sample;
            out.value = Value::Float(mean);
            out.aux = Vec::new();
            return Ok(Some(out));
        }
    }

    fn close(&mut self) {
        self.input.close();
    }
}

/// Running per-series total.
pub struct CumulativeSumIterator {
    input: BoxedIterator,
    totals: HashMap<GroupKey, f64>,
    integer_totals: HashMap<GroupKey, i64>,
}

impl CumulativeSumIterator {
    /// Wrap an input in a cumulative sum
    pub fn new(input: BoxedIterator) -> Self {
        Self {
            input,
            totals: HashMap::new(),
            integer_totals: HashMap::new(),
        }
    }
}

impl SampleIterator for CumulativeSumIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        loop {
            let sample = match self.input.next_sample()? {
                Some(s) => s,
                None => return Ok(None),
            };
            let key = group_key(&sample);
            let value = match &sample.value {
                Value::Integer(v) => {
                    let total = self.integer_totals.entry(key).or_insert(0);
                    *total = total.wrapping_add(*v);
                    Value::Integer(*total)
                }
                other => match other.as_f64() {
                    Some(v) => {
                        let total = self.totals.entry(key).or_insert(0.0);
                        *total += v;
                        Value::Float(*total)
                    }
                    None => continue,
                },
            };
            let mut out = sample;
            out.value = value;
            out.aux = Vec::new();
            return Ok(Some(out));
        }
    }

    fn close(&mut self) {
        self.input.close();
    }
}

/// Area under the curve per bucket, trapezoidal, scaled to a unit
/// duration.
pub struct IntegralIterator {
    input: Option<BoxedIterator>,
    unit: i64,
    dimensions: Vec<String>,
    interval: Interval,
    start_time: i64,
    ascending: bool,
    results: Option<std::vec::IntoIter<Sample>>,
}

impl IntegralIterator {
    /// Wrap an input in an integral computation
    pub fn new(input: BoxedIterator, unit: i64, opt: &IteratorOptions) -> Self {
        Self {
            input: Some(input),
            unit,
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
        let mut groups: BTreeMap<(i64, String, TagSet), (f64, Option<(i64, f64)>)> =
            BTreeMap::new();
        let drain = (|| -> QueryResult<()> {
            while let Some(sample) = input.next_sample()? {
                let v = match sample.value.as_f64() {
                    Some(v) => v,
                    None => continue,
                };
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
                let (area, last) = groups.entry(key).or_insert((0.0, None));
                if let Some((t0, v0)) = *last {
                    *area += (v0 + v) / 2.0 * (sample.time - t0) as f64 / self.unit as f64;
                }
                *last = Some((sample.time, v));
            }
            Ok(())
        })();
        input.close();
        drain?;

        let mut out: Vec<Sample> = groups
            .into_iter()
            .map(|((bucket, name, tags), (area, _))| Sample {
                name,
                time: bucket,
                tags,
                value: Value::Float(area),
                aux: Vec::new(),
            })
            .collect();
        if !self.ascending {
            out.reverse();
        }
        self.results = Some(out.into_iter());
        Ok(())
    }
}

impl SampleIterator for IntegralIterator {
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
// Reservoir sampling
// ============================================================================

/// Deterministic xorshift64 state for reservoir replacement choices
struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: seed | 1,
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

/// Uniform reservoir selection of `size` original samples per series.
pub struct RandomSampleIterator {
    input: Option<BoxedIterator>,
    size: usize,
    ascending: bool,
    results: Option<std::vec::IntoIter<Sample>>,
}

impl RandomSampleIterator {
    /// Wrap an input in reservoir sampling of the given size
    pub fn new(input: BoxedIterator, size: usize, opt: &IteratorOptions) -> Self {
        Self {
            input: Some(input),
            size: size.max(1),
            ascending: opt.ascending,
            results: None,
        }
    }

    fn compute(&mut self) -> QueryResult<()> {
        let mut input = match self.input.take() {
            Some(i) => i,
            None => return Ok(()),
        };
        let size = self.size;
        let mut rng = Xorshift64::new(0x2545_f491_4f6c_dd1d);
        let mut groups: BTreeMap<GroupKey, (usize, Vec<Sample>)> = BTreeMap::new();
        let drain = (|| -> QueryResult<()> {
            while let Some(sample) = input.next_sample()? {
                let (seen, reservoir) = groups.entry(group_key(&sample)).or_default();
                *seen += 1;
                if reservoir.len() < size {
                    reservoir.push(sample);
                } else {
                    let j = (rng.next() % *seen as u64) as usize;
                    if j < size {
                        reservoir[j] = sample;
                    }
                }
            }
            Ok(())
        })();
        input.close();
        drain?;

        let mut out: Vec<Sample> = groups
            .into_values()
            .flat_map(|(_, reservoir)| reservoir)
            .collect();
        out.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.tags.cmp(&b.tags)));
        if !self.ascending {
            out.reverse();
        }
        self.results = Some(out.into_iter());
        Ok(())
    }
}

impl SampleIterator for RandomSampleIterator {
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
// Holt-Winters
// ============================================================================

const HW_ALPHA: f64 = 0.5;
const HW_BETA: f64 = 0.1;
const HW_GAMMA: f64 = 0.1;

/// Additive seasonal smoothing over the complete series, forecasting `h`
/// points beyond the last observation.
///
/// The input/output contract: the iterator consumes every sample of its
/// input (built over the original range), fits level, trend, and an
/// `m`-length season, and emits `h` forecast samples spaced by the bucket
/// interval captured before the range was unbounded. With fit enabled the
/// fitted values are emitted at the original timestamps first.
pub struct HoltWintersIterator {
    input: Option<BoxedIterator>,
    h: usize,
    m: usize,
    include_fit: bool,
    spacing: i64,
    ascending: bool,
    results: Option<std::vec::IntoIter<Sample>>,
}

impl HoltWintersIterator {
    /// Wrap an input in a seasonal fit and forecast
    pub fn new(
        input: BoxedIterator,
        h: usize,
        m: usize,
        include_fit: bool,
        spacing: i64,
        opt: &IteratorOptions,
    ) -> Self {
        Self {
            input: Some(input),
            h,
            m,
            include_fit,
            spacing,
            ascending: opt.ascending,
            results: None,
        }
    }

    fn compute(&mut self) -> QueryResult<()> {
        let mut input = match self.input.take() {
            Some(i) => i,
            None => return Ok(()),
        };
        let mut groups: BTreeMap<GroupKey, Vec<(i64, f64)>> = BTreeMap::new();
        let drain = (|| -> QueryResult<()> {
            while let Some(sample) = input.next_sample()? {
                if let Some(v) = sample.value.as_f64() {
                    groups.entry(group_key(&sample)).or_default().push((sample.time, v));
                }
            }
            Ok(())
        })();
        input.close();
        drain?;

        let mut out = Vec::new();
        for ((name, tags), mut points) in groups {
            points.sort_by_key(|(t, _)| *t);
            if points.len() < 2 {
                continue;
            }
            let spacing = if self.spacing != 0 {
                self.spacing
            } else {
                points[1].0 - points[0].0
            };
            if spacing == 0 {
                continue;
            }
            let (fitted, forecast) = fit_holt_winters(&points, self.h, self.m);
            if self.include_fit {
                for (i, value) in fitted.into_iter().enumerate() {
                    out.push(Sample {
                        name: name.clone(),
                        time: points[i].0,
                        tags: tags.clone(),
                        value: Value::Float(value),
                        aux: Vec::new(),
                    });
                }
            }
            let last_time = points[points.len() - 1].0;
            for (i, value) in forecast.into_iter().enumerate() {
                out.push(Sample {
                    name: name.clone(),
                    time: last_time + (i as i64 + 1) * spacing,
                    tags: tags.clone(),
                    value: Value::Float(value),
                    aux: Vec::new(),
                });
            }
        }
        out.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.tags.cmp(&b.tags)));
        if !self.ascending {
            out.reverse();
        }
        self.results = Some(out.into_iter());
        Ok(())
    }
}

/// Triple (or, without a usable season, double) exponential smoothing.
/// Returns the fitted values, one per input point, and `h` forecasts.
fn fit_holt_winters(points: &[(i64, f64)], h: usize, m: usize) -> (Vec<f64>, Vec<f64>) {
    let xs: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
    let n = xs.len();
    let seasonal = m >= 2 && n >= 2 * m;

    let mut season = vec![0.0; m.max(1)];
    if seasonal {
        let first: f64 = xs[..m].iter().sum::<f64>() / m as f64;
        for i in 0..m {
            season[i] = xs[i] - first;
        }
    }

    let mut level = xs[0];
    let mut trend = xs[1] - xs[0];
    let mut fitted = Vec::with_capacity(n);
    fitted.push(xs[0]);

    for (i, &x) in xs.iter().enumerate().skip(1) {
        let s = if seasonal { season[i % m] } else { 0.0 };
        fitted.push(level + trend + s);

        let prev_level = level;
        level = HW_ALPHA * (x - s) + (1.0 - HW_ALPHA) * (level + trend);
        trend = HW_BETA * (level - prev_level) + (1.0 - HW_BETA) * trend;
        if seasonal {
            season[i % m] = HW_GAMMA * (x - level) + (1.0 - HW_GAMMA) * s;
        }
    }

    let mut forecast = Vec::with_capacity(h);
    for i in 1..=h {
        let s = if seasonal {
            season[(n + i - 1) % m]
        } else {
            0.0
        };
        forecast.push(level + i as f64 * trend + s);
    }
    (fitted, forecast)
}

impl SampleIterator for HoltWintersIterator {
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
// Top / Bottom
// ============================================================================

/// Which extreme a top/bottom selection keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extreme {
    /// Highest values
    Top,
    /// Lowest values
    Bottom,
}

/// Selects the `n` most extreme original samples per (bucket, tag group)
/// and re-emits them in time order.
pub struct TopBottomIterator {
    input: Option<BoxedIterator>,
    extreme: Extreme,
    n: usize,
    dimensions: Vec<String>,
    interval: Interval,
    start_time: i64,
    ascending: bool,
    keep_tags: bool,
    results: Option<std::vec::IntoIter<Sample>>,
}

impl TopBottomIterator {
    /// Wrap an input in extreme-by-count selection.
    ///
    /// `keep_tags` preserves the full input tag set on emitted samples
    /// (write mode); otherwise tags are projected back onto the
    /// statement's group-by dimensions.
    pub fn new(
        input: BoxedIterator,
        extreme: Extreme,
        n: usize,
        opt: &IteratorOptions,
        keep_tags: bool,
    ) -> Self {
        Self {
            input: Some(input),
            extreme,
            n: n.max(1),
            dimensions: opt.dimensions.clone(),
            interval: opt.interval,
            start_time: opt.start_time,
            ascending: opt.ascending,
            keep_tags,
            results: None,
        }
    }

    fn compute(&mut self) -> QueryResult<()> {
        let mut input = match self.input.take() {
            Some(i) => i,
            None => return Ok(()),
        };
        let mut groups: BTreeMap<(i64, String, TagSet), Vec<Sample>> = BTreeMap::new();
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
                groups.entry(key).or_default().push(sample);
            }
            Ok(())
        })();
        input.close();
        drain?;

        let mut out = Vec::new();
        for ((_, _, group_tags), mut samples) in groups {
            match self.extreme {
                Extreme::Top => samples
                    .sort_by(|a, b| b.value.compare(&a.value).then_with(|| a.time.cmp(&b.time))),
                Extreme::Bottom => samples
                    .sort_by(|a, b| a.value.compare(&b.value).then_with(|| a.time.cmp(&b.time))),
            }
            samples.truncate(self.n);
            for mut sample in samples {
                if !self.keep_tags {
                    sample.tags = group_tags.clone();
                }
                out.push(sample);
            }
        }
        out.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.tags.cmp(&b.tags)));
        if !self.ascending {
            out.reverse();
        }
        self.results = Some(out.into_iter());
        Ok(())
    }
}

impl SampleIterator for TopBottomIterator {
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
// Interval bucketing
// ============================================================================

/// Truncates sample timestamps to their bucket starts.
pub struct IntervalIterator {
    input: BoxedIterator,
    interval: Interval,
}

impl IntervalIterator {
    /// Wrap an input in bucket-start truncation
    pub fn new(input: BoxedIterator, opt: &IteratorOptions) -> Self {
        Self {
            input,
            interval: opt.interval,
        }
    }
}

impl SampleIterator for IntervalIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        let sample = match self.input.next_sample()? {
            Some(s) => s,
            None => return Ok(None),
        };
        if self.interval.is_zero() {
            return Ok(Some(sample));
        }
        let mut out = sample;
        out.time = self.interval.window_start(out.time);
        Ok(Some(out))
    }

    fn close(&mut self) {
        self.input.close();
    }
}

// ============================================================================
// Fill substitution
// ============================================================================

use crate::query::ast::{FillPolicy, Literal};

/// Substitutes values into empty buckets according to the fill policy.
///
/// The declared field expression travels along so a numeric fill can be
/// coerced to the expression's result type.
pub struct FillIterator {
    input: Option<BoxedIterator>,
    expr_type: FieldType,
    fill: FillPolicy,
    interval: Interval,
    start_time: i64,
    end_time: i64,
    ascending: bool,
    results: Option<std::vec::IntoIter<Sample>>,
}

impl FillIterator {
    /// Wrap an input in fill substitution for the given field expression
    pub fn new(input: BoxedIterator, expr: &Expr, opt: &IteratorOptions) -> Self {
        Self {
            input: Some(input),
            expr_type: functions::infer_type(expr).unwrap_or(FieldType::Unknown),
            fill: opt.fill.clone(),
            interval: opt.interval,
            start_time: opt.start_time,
            end_time: opt.end_time,
            ascending: opt.ascending,
            results: None,
        }
    }

    fn fill_value(&self) -> Value {
        match &self.fill {
            FillPolicy::Number(Literal::Integer(v)) => {
                if self.expr_type == FieldType::Float {
                    Value::Float(*v as f64)
                } else {
                    Value::Integer(*v)
                }
            }
            FillPolicy::Number(Literal::Number(v)) => Value::Float(*v),
            FillPolicy::Number(other) => other.to_value(),
            _ => Value::Null,
        }
    }

    fn compute(&mut self) -> QueryResult<()> {
        let mut input = match self.input.take() {
            Some(i) => i,
            None => return Ok(()),
        };
        let mut groups: BTreeMap<GroupKey, BTreeMap<i64, Sample>> = BTreeMap::new();
        let mut lo = self.interval.window_start(self.start_time);
        let mut hi = self.end_time;
        let drain = (|| -> QueryResult<()> {
            while let Some(sample) = input.next_sample()? {
                let bucket = self.interval.window_start(sample.time);
                lo = lo.min(bucket);
                hi = hi.max(bucket + 1);
                groups
                    .entry(group_key(&sample))
                    .or_default()
                    .insert(bucket, sample);
            }
            Ok(())
        })();
        input.close();
        drain?;

        if groups.is_empty() || self.interval.is_zero() {
            let mut out: Vec<Sample> = groups
                .into_values()
                .flat_map(|buckets| buckets.into_values())
                .collect();
            out.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.tags.cmp(&b.tags)));
            if !self.ascending {
                out.reverse();
            }
            self.results = Some(out.into_iter());
            return Ok(());
        }

        let duration = self.interval.duration;
        let mut out = Vec::new();
        for ((name, tags), buckets) in groups {
            let mut previous: Option<Value> = None;
            let mut bucket = lo;
            while bucket < hi {
                if let Some(sample) = buckets.get(&bucket) {
                    previous = Some(sample.value.clone());
                    out.push(sample.clone());
                } else if let Some(filled) =
                    self.substitute(bucket, &buckets, previous.as_ref())
                {
                    out.push(Sample {
                        name: name.clone(),
                        time: bucket,
                        tags: tags.clone(),
                        value: filled,
                        aux: Vec::new(),
                    });
                }
                bucket += duration;
            }
        }
        out.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.tags.cmp(&b.tags)));
        if !self.ascending {
            out.reverse();
        }
        self.results = Some(out.into_iter());
        Ok(())
    }

    fn substitute(
        &self,
        bucket: i64,
        buckets: &BTreeMap<i64, Sample>,
        previous: Option<&Value>,
    ) -> Option<Value> {
        match &self.fill {
            FillPolicy::None => None,
            FillPolicy::Null => Some(Value::Null),
            FillPolicy::Number(_) => Some(self.fill_value()),
            FillPolicy::Previous => previous.cloned(),
            FillPolicy::Linear => {
                let before = buckets.range(..bucket).next_back();
                let after = buckets.range(bucket + 1..).next();
                match (before, after) {
                    (Some((t0, s0)), Some((t1, s1))) => {
                        match (s0.value.as_f64(), s1.value.as_f64()) {
                            (Some(v0), Some(v1)) => {
                                let frac = (bucket - t0) as f64 / (t1 - t0) as f64;
                                Some(Value::Float(v0 + (v1 - v0) * frac))
                            }
                            _ => Some(Value::Null),
                        }
                    }
                    _ => Some(Value::Null),
                }
            }
        }
    }
}

impl SampleIterator for FillIterator {
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
    use crate::query::iterator::Value;

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

    #[test]
    fn test_derivative_per_second() {
        let data = samples(&[(0, 0.0), (1_000_000_000, 10.0), (2_000_000_000, 15.0)]);
        let itr = DerivativeIterator::new(Box::new(VecIterator::new(data)), 1_000_000_000, false);
        let out = run(itr);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value, Value::Float(10.0));
        assert_eq!(out[1].value, Value::Float(5.0));
    }

    #[test]
    fn test_non_negative_derivative_drops_decreases() {
        let data = samples(&[(0, 10.0), (1_000_000_000, 5.0), (2_000_000_000, 20.0)]);
        let itr = DerivativeIterator::new(Box::new(VecIterator::new(data)), 1_000_000_000, true);
        let out = run(itr);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, Value::Float(15.0));
    }

    #[test]
    fn test_difference_preserves_integers() {
        let data = vec![
            Sample::new("m", 0, Value::Integer(3)),
            Sample::new("m", 10, Value::Integer(10)),
        ];
        let itr = DifferenceIterator::new(Box::new(VecIterator::new(data)), false);
        let out = run(itr);
        assert_eq!(out[0].value, Value::Integer(7));
    }

    #[test]
    fn test_elapsed_in_units() {
        let data = samples(&[(0, 1.0), (3000, 1.0), (9000, 1.0)]);
        let itr = ElapsedIterator::new(Box::new(VecIterator::new(data)), 1000);
        let out = run(itr);
        assert_eq!(out[0].value, Value::Integer(3));
        assert_eq!(out[1].value, Value::Integer(6));
    }

    #[test]
    fn test_moving_average_window() {
        let data = samples(&[(0, 1.0), (10, 2.0), (20, 3.0), (30, 4.0)]);
        let itr = MovingAverageIterator::new(Box::new(VecIterator::new(data)), 2);
        let out = run(itr);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].value, Value::Float(1.5));
        assert_eq!(out[0].time, 10);
        assert_eq!(out[2].value, Value::Float(3.5));
    }

    #[test]
    fn test_cumulative_sum() {
        let data = samples(&[(0, 1.0), (10, 2.0), (20, 3.0)]);
        let itr = CumulativeSumIterator::new(Box::new(VecIterator::new(data)));
        let out = run(itr);
        let values: Vec<Value> = out.into_iter().map(|s| s.value).collect();
        assert_eq!(
            values,
            vec![Value::Float(1.0), Value::Float(3.0), Value::Float(6.0)]
        );
    }

    #[test]
    fn test_integral_trapezoid() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 10_000_000_000,
            ..IteratorOptions::default()
        };
        // 0→10 over 2s: area = (0+10)/2 * 2 = 10 unit-seconds.
        let data = samples(&[(0, 0.0), (2_000_000_000, 10.0)]);
        let itr = IntegralIterator::new(
            Box::new(VecIterator::new(data)),
            1_000_000_000,
            &opt,
        );
        let out = run(itr);
        assert_eq!(out[0].value, Value::Float(10.0));
    }

    #[test]
    fn test_top_selection_preserves_timestamps() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 100,
            ..IteratorOptions::default()
        };
        let data = samples(&[(0, 5.0), (10, 9.0), (20, 1.0)]);
        let itr = TopBottomIterator::new(
            Box::new(VecIterator::new(data)),
            Extreme::Top,
            2,
            &opt,
            false,
        );
        let out = run(itr);
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].time, out[0].value.clone()), (0, Value::Float(5.0)));
        assert_eq!((out[1].time, out[1].value.clone()), (10, Value::Float(9.0)));
    }

    #[test]
    fn test_bottom_selection() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 100,
            ..IteratorOptions::default()
        };
        let data = samples(&[(0, 5.0), (10, 9.0), (20, 1.0)]);
        let itr = TopBottomIterator::new(
            Box::new(VecIterator::new(data)),
            Extreme::Bottom,
            1,
            &opt,
            false,
        );
        let out = run(itr);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, Value::Float(1.0));
    }

    #[test]
    fn test_interval_truncates_times() {
        let opt = IteratorOptions {
            interval: Interval::new(60),
            ..IteratorOptions::default()
        };
        let data = samples(&[(30, 1.0), (90, 2.0)]);
        let itr = IntervalIterator::new(Box::new(VecIterator::new(data)), &opt);
        let out = run(itr);
        assert_eq!(out[0].time, 0);
        assert_eq!(out[1].time, 60);
    }

    #[test]
    fn test_fill_number_widens_to_float_expr() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 180,
            interval: Interval::new(60),
            fill: FillPolicy::Number(Literal::Integer(0)),
            ..IteratorOptions::default()
        };
        let expr = Expr::call("mean", vec![Expr::var("x", FieldType::Float)]);
        let data = samples(&[(0, 2.0)]);
        let itr = FillIterator::new(Box::new(VecIterator::new(data)), &expr, &opt);
        let out = run(itr);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].value, Value::Float(2.0));
        assert_eq!(out[1].value, Value::Float(0.0));
        assert_eq!(out[2].value, Value::Float(0.0));
    }

    #[test]
    fn test_fill_previous_skips_leading_buckets() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 240,
            interval: Interval::new(60),
            fill: FillPolicy::Previous,
            ..IteratorOptions::default()
        };
        let expr = Expr::var("x", FieldType::Float);
        let data = samples(&[(60, 7.0)]);
        let itr = FillIterator::new(Box::new(VecIterator::new(data)), &expr, &opt);
        let out = run(itr);
        // Bucket 0 has no previous value and is omitted; 120 and 180 carry 7.
        let times: Vec<i64> = out.iter().map(|s| s.time).collect();
        assert_eq!(times, vec![60, 120, 180]);
        assert_eq!(out[2].value, Value::Float(7.0));
    }

    #[test]
    fn test_fill_linear_interpolates() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 180,
            interval: Interval::new(60),
            fill: FillPolicy::Linear,
            ..IteratorOptions::default()
        };
        let expr = Expr::var("x", FieldType::Float);
        let data = samples(&[(0, 0.0), (120, 10.0)]);
        let itr = FillIterator::new(Box::new(VecIterator::new(data)), &expr, &opt);
        let out = run(itr);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].value, Value::Float(5.0));
    }

    #[test]
    fn test_holt_winters_forecast_count_and_spacing() {
        let opt = IteratorOptions::default();
        let data = samples(&[(0, 1.0), (10, 2.0), (20, 3.0), (30, 4.0)]);
        let itr = HoltWintersIterator::new(
            Box::new(VecIterator::new(data)),
            3,
            2,
            false,
            10,
            &opt,
        );
        let out = run(itr);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].time, 40);
        assert_eq!(out[1].time, 50);
        assert_eq!(out[2].time, 60);
    }

    #[test]
    fn test_holt_winters_with_fit_includes_original_times() {
        let opt = IteratorOptions::default();
        let data = samples(&[(0, 1.0), (10, 2.0), (20, 3.0), (30, 4.0)]);
        let itr = HoltWintersIterator::new(
            Box::new(VecIterator::new(data)),
            1,
            0,
            true,
            10,
            &opt,
        );
        let out = run(itr);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].time, 0);
        assert_eq!(out[4].time, 40);
    }

    #[test]
    fn test_reservoir_sample_size() {
        let opt = IteratorOptions {
            start_time: 0,
            end_time: 1000,
            ..IteratorOptions::default()
        };
        let data = samples(&(0..100).map(|i| (i as i64 * 10, i as f64)).collect::<Vec<_>>());
        let itr = RandomSampleIterator::new(Box::new(VecIterator::new(data)), 5, &opt);
        let out = run(itr);
        assert_eq!(out.len(), 5);
        // Output is re-sorted by time.
        for pair in out.windows(2) {
            assert!(pair[0].time < pair[1].time);
        }
    }
}
