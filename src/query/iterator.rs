//! Iterator abstraction - typed, pull-based sample sequences
//!
//! Everything the engine builds composes lazily-evaluated iterators over
//! time-stamped samples. An iterator yields samples one at a time and is
//! explicitly released with `close()`. Composition wrappers (merge,
//! interrupt, limit, dedupe) own their inputs and release them
//! transitively.
//!
//! # Ownership
//!
//! The builder that creates an iterator owns it until it hands it to a
//! scanner, a cursor, or a wrapping iterator. On any construction failure
//! the builder must release everything it still owns; `OwnedIterators` is
//! the scoped guard that enforces this on every exit path.

use crate::query::error::{QueryError, QueryResult};
use crate::query::options::{InterruptHandle, IteratorOptions};
use crate::types::{FieldType, TagSet};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

// ============================================================================
// Values and Samples
// ============================================================================

/// A single sample value in one of the supported type variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// No value
    Null,
    /// 64-bit float
    Float(f64),
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit unsigned integer
    Unsigned(u64),
    /// UTF-8 string
    Str(String),
    /// Boolean
    Boolean(bool),
    /// Placeholder meaning "no previous value has been seen yet".
    ///
    /// Used as the scanner fill value for previous-value fill: a scanner
    /// skips overwriting a slot holding a real value, and slots that were
    /// never written render as null. Distinct from `Null` so callers can
    /// tell "still no data" apart from "filled with null".
    Skip,
}

impl Value {
    /// The field type of this value
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Float(_) => FieldType::Float,
            Value::Integer(_) => FieldType::Integer,
            Value::Unsigned(_) => FieldType::Unsigned,
            Value::Str(_) => FieldType::String,
            Value::Boolean(_) => FieldType::Boolean,
            Value::Null | Value::Skip => FieldType::Unknown,
        }
    }

    /// Whether the value is null or the skip placeholder
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Skip)
    }

    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            Value::Unsigned(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Total ordering across variants, numeric variants compared by value.
    ///
    /// Null and skip sort before everything else; mixed numeric variants
    /// compare through f64.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => {
                let rank = |v: &Value| match v {
                    Value::Null | Value::Skip => 0u8,
                    Value::Float(_) | Value::Integer(_) | Value::Unsigned(_) => 1,
                    Value::Str(_) => 2,
                    Value::Boolean(_) => 3,
                };
                match rank(self).cmp(&rank(other)) {
                    Ordering::Equal => match (self, other) {
                        (Value::Str(a), Value::Str(b)) => a.cmp(b),
                        (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
                        _ => Ordering::Equal,
                    },
                    ord => ord,
                }
            }
        }
    }

    /// Append a canonical byte encoding of the value, used for dedupe keys
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => buf.push(0),
            Value::Skip => buf.push(1),
            Value::Float(v) => {
                buf.push(2);
                buf.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Integer(v) => {
                buf.push(3);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Unsigned(v) => {
                buf.push(4);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Str(v) => {
                buf.push(5);
                buf.extend_from_slice(&(v.len() as u64).to_le_bytes());
                buf.extend_from_slice(v.as_bytes());
            }
            Value::Boolean(v) => {
                buf.push(6);
                buf.push(*v as u8);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null | Value::Skip => write!(f, "null"),
            Value::Float(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
        }
    }
}

/// A single time-stamped sample produced by an iterator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Series or measurement name the sample came from
    pub name: String,
    /// Timestamp in nanoseconds
    pub time: i64,
    /// Tags the sample is grouped under
    pub tags: TagSet,
    /// The sample's value
    pub value: Value,
    /// Auxiliary field values carried alongside the value, in the order of
    /// the options' auxiliary reference list
    pub aux: Vec<Value>,
}

impl Sample {
    /// Create a sample with no tags and no auxiliary values
    pub fn new(name: impl Into<String>, time: i64, value: Value) -> Self {
        Self {
            name: name.into(),
            time,
            tags: TagSet::new(),
            value,
            aux: Vec::new(),
        }
    }

    /// Attach tags
    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }

    /// Attach auxiliary values
    pub fn with_aux(mut self, aux: Vec<Value>) -> Self {
        self.aux = aux;
        self
    }
}

// ============================================================================
// Iterator Trait
// ============================================================================

/// A typed, pull-based, closable sequence of time-stamped samples.
///
/// `next_sample` returns `Ok(None)` once the sequence is exhausted.
/// `close` releases any resources held by the iterator and its inputs;
/// implementations must tolerate repeated close calls.
pub trait SampleIterator: Send {
    /// Advance and read the next sample
    fn next_sample(&mut self) -> QueryResult<Option<Sample>>;

    /// Release the iterator and everything it owns
    fn close(&mut self);
}

/// Owned, type-erased iterator
pub type BoxedIterator = Box<dyn SampleIterator>;

/// An iterator that is immediately exhausted.
///
/// Substituted when a build produced no inputs, so "no data" is an
/// explicit, allocation-free variant rather than an error or a null
/// pointer stand-in.
#[derive(Debug, Default)]
pub struct NilIterator;

impl SampleIterator for NilIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        Ok(None)
    }

    fn close(&mut self) {}
}

// ============================================================================
// Scoped Ownership
// ============================================================================

/// Builder-local collection that owns iterators until explicit hand-off.
///
/// Dropping the guard releases every iterator still inside it, so a `?`
/// on any construction failure closes all siblings built so far. Success
/// paths call `hand_off` exactly once, transferring ownership to the
/// parent (typically a merge iterator or a scanner).
#[derive(Default)]
pub struct OwnedIterators {
    items: Vec<BoxedIterator>,
}

impl OwnedIterators {
    /// Create an empty guard, reserving room for `capacity` iterators
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    /// Take ownership of a freshly built iterator
    pub fn push(&mut self, itr: BoxedIterator) {
        self.items.push(itr);
    }

    /// Number of owned iterators
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the guard owns nothing
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Transfer ownership of all iterators to the caller
    pub fn hand_off(mut self) -> Vec<BoxedIterator> {
        std::mem::take(&mut self.items)
    }
}

impl Drop for OwnedIterators {
    fn drop(&mut self) {
        for itr in &mut self.items {
            itr.close();
        }
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Interleaves samples from several inputs by (time, tags).
///
/// Each input must already be sorted in the read direction; the merge
/// repeatedly picks the next sample across all inputs, tie-breaking on
/// tags and then input position so the output order is deterministic.
pub struct MergeIterator {
    inputs: Vec<BoxedIterator>,
    lookahead: Vec<Option<Sample>>,
    primed: bool,
    ascending: bool,
}

impl MergeIterator {
    /// Merge a set of inputs. Returns `None` when there are no inputs so
    /// the caller can substitute the nil iterator.
    pub fn new(inputs: Vec<BoxedIterator>, opt: &IteratorOptions) -> Option<Self> {
        if inputs.is_empty() {
            return None;
        }
        let n = inputs.len();
        Some(Self {
            inputs,
            lookahead: (0..n).map(|_| None).collect(),
            primed: false,
            ascending: opt.ascending,
        })
    }

    fn prime(&mut self) -> QueryResult<()> {
        if self.primed {
            return Ok(());
        }
        for i in 0..self.inputs.len() {
            self.lookahead[i] = self.inputs[i].next_sample()?;
        }
        self.primed = true;
        Ok(())
    }

    fn best_index(&self) -> Option<usize> {
        let mut best: Option<(usize, &Sample)> = None;
        for (i, slot) in self.lookahead.iter().enumerate() {
            let candidate = match slot {
                Some(s) => s,
                None => continue,
            };
            best = Some(match best {
                None => (i, candidate),
                Some((current_index, current)) => {
                    let time_ord = if self.ascending {
                        candidate.time.cmp(&current.time)
                    } else {
                        current.time.cmp(&candidate.time)
                    };
                    let ord = time_ord.then_with(|| candidate.tags.cmp(&current.tags));
                    if ord == Ordering::Less {
                        (i, candidate)
                    } else {
                        (current_index, current)
                    }
                }
            });
        }
        best.map(|(i, _)| i)
    }
}

impl SampleIterator for MergeIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        self.prime()?;
        let i = match self.best_index() {
            Some(i) => i,
            None => return Ok(None),
        };
        let sample = self.lookahead[i].take();
        self.lookahead[i] = self.inputs[i].next_sample()?;
        Ok(sample)
    }

    fn close(&mut self) {
        for input in &mut self.inputs {
            input.close();
        }
    }
}

// ============================================================================
// Interrupt
// ============================================================================

/// Checks the interrupt signal on every pull and aborts with the
/// cancellation outcome once it fires.
pub struct InterruptIterator {
    input: BoxedIterator,
    handle: InterruptHandle,
}

impl InterruptIterator {
    /// Wrap an input with cooperative cancellation
    pub fn new(input: BoxedIterator, handle: InterruptHandle) -> Self {
        Self { input, handle }
    }
}

impl SampleIterator for InterruptIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        if self.handle.is_interrupted() {
            return Err(QueryError::cancelled());
        }
        self.input.next_sample()
    }

    fn close(&mut self) {
        self.input.close();
    }
}

// ============================================================================
// Limit
// ============================================================================

/// Applies limit and offset per series group.
///
/// Counts are tracked per (name, tags) so each series is truncated
/// independently, matching the row-truncation contract of the statement's
/// limit clause.
pub struct LimitIterator {
    input: BoxedIterator,
    limit: usize,
    offset: usize,
    counts: HashMap<(String, TagSet), usize>,
}

impl LimitIterator {
    /// Wrap an input with the options' limit and offset
    pub fn new(input: BoxedIterator, opt: &IteratorOptions) -> Self {
        Self {
            input,
            limit: opt.limit,
            offset: opt.offset,
            counts: HashMap::new(),
        }
    }
}

impl SampleIterator for LimitIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        loop {
            let sample = match self.input.next_sample()? {
                Some(s) => s,
                None => return Ok(None),
            };
            let seen = self
                .counts
                .entry((sample.name.clone(), sample.tags.clone()))
                .or_insert(0);
            *seen += 1;
            let position = *seen;
            if position <= self.offset {
                continue;
            }
            if self.limit > 0 && position > self.offset + self.limit {
                continue;
            }
            return Ok(Some(sample));
        }
    }

    fn close(&mut self) {
        self.input.close();
    }
}

// ============================================================================
// Dedupe
// ============================================================================

/// Drops samples identical to one already emitted.
///
/// Works across mixed output shapes by encoding the full
/// (name, time, tags, value, aux) tuple into the seen-set key.
pub struct DedupeIterator {
    input: BoxedIterator,
    seen: HashSet<Vec<u8>>,
}

impl DedupeIterator {
    /// Wrap an input with generic deduplication
    pub fn new(input: BoxedIterator) -> Self {
        Self {
            input,
            seen: HashSet::new(),
        }
    }

    fn key(sample: &Sample) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(sample.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&sample.time.to_le_bytes());
        for (k, v) in sample.tags.iter() {
            buf.extend_from_slice(k.as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(v.as_bytes());
            buf.push(0);
        }
        sample.value.encode_into(&mut buf);
        for aux in &sample.aux {
            aux.encode_into(&mut buf);
        }
        buf
    }
}

impl SampleIterator for DedupeIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        loop {
            let sample = match self.input.next_sample()? {
                Some(s) => s,
                None => return Ok(None),
            };
            if self.seen.insert(Self::key(&sample)) {
                return Ok(Some(sample));
            }
        }
    }

    fn close(&mut self) {
        self.input.close();
    }
}

/// Fast dedupe for the ungrouped small-row shape.
///
/// When there is no grouping and at most two auxiliary columns, the seen
/// key collapses to the timestamp plus two fixed-width value encodings,
/// avoiding the generic variable-length key.
pub struct FastDedupeIterator {
    input: BoxedIterator,
    seen: HashSet<(i64, u64, u64)>,
}

impl FastDedupeIterator {
    /// Wrap an input with the fixed-width dedupe key
    pub fn new(input: BoxedIterator) -> Self {
        Self {
            input,
            seen: HashSet::new(),
        }
    }

    fn slot(value: Option<&Value>) -> u64 {
        match value {
            Some(Value::Float(v)) => v.to_bits(),
            Some(Value::Integer(v)) => *v as u64 ^ 0x8000_0000_0000_0000,
            Some(Value::Unsigned(v)) => *v,
            Some(Value::Boolean(v)) => 2 + *v as u64,
            Some(Value::Str(v)) => {
                // FNV-1a over the string bytes keeps the key fixed-width.
                let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
                for b in v.as_bytes() {
                    hash ^= *b as u64;
                    hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
                }
                hash
            }
            Some(Value::Null) | Some(Value::Skip) | None => 1,
        }
    }
}

impl SampleIterator for FastDedupeIterator {
    fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
        loop {
            let sample = match self.input.next_sample()? {
                Some(s) => s,
                None => return Ok(None),
            };
            let key = (
                sample.time,
                Self::slot(sample.aux.first()),
                Self::slot(sample.aux.get(1)),
            );
            if self.seen.insert(key) {
                return Ok(Some(sample));
            }
        }
    }

    fn close(&mut self) {
        self.input.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::options::IteratorOptions;

    pub(crate) struct VecIterator {
        samples: Vec<Sample>,
        index: usize,
        pub closed: bool,
    }

    impl VecIterator {
        pub(crate) fn new(samples: Vec<Sample>) -> Self {
            Self {
                samples,
                index: 0,
                closed: false,
            }
        }
    }

    impl SampleIterator for VecIterator {
        fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
            if self.index >= self.samples.len() {
                return Ok(None);
            }
            let sample = self.samples[self.index].clone();
            self.index += 1;
            Ok(Some(sample))
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn float_samples(times: &[i64]) -> Vec<Sample> {
        times
            .iter()
            .map(|&t| Sample::new("m", t, Value::Float(t as f64)))
            .collect()
    }

    #[test]
    fn test_nil_iterator_is_exhausted() {
        let mut itr = NilIterator;
        assert!(itr.next_sample().unwrap().is_none());
    }

    #[test]
    fn test_merge_interleaves_by_time() {
        let a = Box::new(VecIterator::new(float_samples(&[0, 20, 40])));
        let b = Box::new(VecIterator::new(float_samples(&[10, 30])));
        let opt = IteratorOptions::default();
        let mut merge = MergeIterator::new(vec![a, b], &opt).unwrap();

        let mut times = Vec::new();
        while let Some(s) = merge.next_sample().unwrap() {
            times.push(s.time);
        }
        assert_eq!(times, vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn test_merge_descending() {
        let a = Box::new(VecIterator::new(float_samples(&[40, 20, 0])));
        let b = Box::new(VecIterator::new(float_samples(&[30, 10])));
        let opt = IteratorOptions {
            ascending: false,
            ..IteratorOptions::default()
        };
        let mut merge = MergeIterator::new(vec![a, b], &opt).unwrap();

        let mut times = Vec::new();
        while let Some(s) = merge.next_sample().unwrap() {
            times.push(s.time);
        }
        assert_eq!(times, vec![40, 30, 20, 10, 0]);
    }

    #[test]
    fn test_merge_empty_inputs() {
        let opt = IteratorOptions::default();
        assert!(MergeIterator::new(Vec::new(), &opt).is_none());
    }

    #[test]
    fn test_interrupt_aborts_pull() {
        let handle = InterruptHandle::new();
        let input = Box::new(VecIterator::new(float_samples(&[0, 10])));
        let mut itr = InterruptIterator::new(input, handle.clone());

        assert!(itr.next_sample().unwrap().is_some());
        handle.interrupt();
        let err = itr.next_sample().unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_limit_and_offset_per_series() {
        let mut samples = float_samples(&[0, 10, 20, 30]);
        let mut tagged: Vec<Sample> = float_samples(&[0, 10, 20, 30]);
        for s in &mut tagged {
            s.tags.insert("host", "b");
        }
        samples.extend(tagged);

        let opt = IteratorOptions {
            limit: 2,
            offset: 1,
            ..IteratorOptions::default()
        };
        let mut itr = LimitIterator::new(Box::new(VecIterator::new(samples)), &opt);

        let mut out = Vec::new();
        while let Some(s) = itr.next_sample().unwrap() {
            out.push((s.tags.to_string(), s.time));
        }
        // Each series independently skips one sample and keeps two.
        assert_eq!(
            out,
            vec![
                (String::new(), 10),
                (String::new(), 20),
                ("host=b".to_string(), 10),
                ("host=b".to_string(), 20),
            ]
        );
    }

    #[test]
    fn test_dedupe_drops_repeats() {
        let mut samples = float_samples(&[0, 10]);
        samples.push(samples[0].clone());
        let mut itr = DedupeIterator::new(Box::new(VecIterator::new(samples)));

        let mut count = 0;
        while itr.next_sample().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn test_fast_dedupe_on_aux_rows() {
        let make = |t: i64, aux: f64| {
            Sample::new("m", t, Value::Null).with_aux(vec![Value::Float(aux)])
        };
        let samples = vec![make(0, 1.0), make(0, 1.0), make(0, 2.0), make(10, 1.0)];
        let mut itr = FastDedupeIterator::new(Box::new(VecIterator::new(samples)));

        let mut count = 0;
        while itr.next_sample().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_owned_iterators_release_on_drop() {
        // The guard's Drop must close everything not handed off; observe it
        // through a shared flag.
        use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
        use std::sync::Arc;

        struct Tracked(Arc<AtomicUsize>);
        impl SampleIterator for Tracked {
            fn next_sample(&mut self) -> QueryResult<Option<Sample>> {
                Ok(None)
            }
            fn close(&mut self) {
                self.0.fetch_add(1, AtomicOrdering::SeqCst);
            }
        }

        let closed = Arc::new(AtomicUsize::new(0));
        {
            let mut owned = OwnedIterators::with_capacity(2);
            owned.push(Box::new(Tracked(closed.clone())));
            owned.push(Box::new(Tracked(closed.clone())));
        }
        assert_eq!(closed.load(AtomicOrdering::SeqCst), 2);

        let closed2 = Arc::new(AtomicUsize::new(0));
        let handed = {
            let mut owned = OwnedIterators::with_capacity(1);
            owned.push(Box::new(Tracked(closed2.clone())));
            owned.hand_off()
        };
        assert_eq!(closed2.load(AtomicOrdering::SeqCst), 0);
        drop(handed);
    }
}
