//! Statement and expression model
//!
//! Defines the type-checked SELECT statement the engine receives from the
//! statement layer and the closed expression enumeration the builder
//! dispatches on. Canonical `Display` forms double as symbol-table keys:
//! two sub-expressions are "the same" exactly when their canonical strings
//! are equal.
//!
//! The module also evaluates rewritten field expressions against a row's
//! symbol values; after the value mapper has run, the only calls left in a
//! field tree are pure math functions.

use crate::query::functions;
use crate::query::iterator::Value;
use crate::types::{FieldType, TagSet, TimeRange};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Expressions
// ============================================================================

/// Literal values appearing in expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Integer literal
    Integer(i64),
    /// Floating point literal
    Number(f64),
    /// String literal
    Str(String),
    /// Boolean literal
    Boolean(bool),
    /// Duration literal, in nanoseconds
    Duration(i64),
}

impl Literal {
    /// Convert the literal to a sample value
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Integer(v) => Value::Integer(*v),
            Literal::Number(v) => Value::Float(*v),
            Literal::Str(v) => Value::Str(v.clone()),
            Literal::Boolean(v) => Value::Boolean(*v),
            Literal::Duration(v) => Value::Integer(*v),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Integer(v) => write!(f, "{}", v),
            Literal::Number(v) => write!(f, "{}", v),
            Literal::Str(v) => write!(f, "'{}'", v),
            Literal::Boolean(v) => write!(f, "{}", v),
            Literal::Duration(v) => write!(f, "{}ns", v),
        }
    }
}

/// Binary arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
    /// Modulo
    Mod,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        };
        write!(f, "{}", s)
    }
}

/// A reference to a field, tag, or generated symbol, carrying the
/// statically inferred result type
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    /// Referenced name
    pub name: String,
    /// Statically inferred type
    pub ty: FieldType,
}

impl VarRef {
    /// Create a reference with a known type
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A function call
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Function name
    pub name: String,
    /// Arguments
    pub args: Vec<Expr>,
}

impl Call {
    /// Create a call
    pub fn new(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// The first argument as a variable reference, if it is one
    pub fn first_ref(&self) -> Option<&VarRef> {
        match self.args.first() {
            Some(Expr::VarRef(r)) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

/// Closed enumeration of expression kinds
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Variable reference
    VarRef(VarRef),
    /// Function call
    Call(Call),
    /// Literal
    Literal(Literal),
    /// Binary arithmetic
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// Parenthesized sub-expression
    Paren(Box<Expr>),
}

impl Expr {
    /// Shorthand for a typed variable reference expression
    pub fn var(name: impl Into<String>, ty: FieldType) -> Self {
        Expr::VarRef(VarRef::new(name, ty))
    }

    /// Shorthand for a call expression
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call(Call::new(name, args))
    }

    /// Evaluate the expression against one output row.
    ///
    /// `scopes` are symbol-value maps searched in order; `time` backs the
    /// implicit `time` reference. Only math calls remain after symbol
    /// mapping, so any other call evaluates to null.
    pub fn evaluate(&self, time: i64, scopes: &[&HashMap<String, Value>]) -> Value {
        match self {
            Expr::VarRef(r) => {
                if r.name == "time" {
                    return Value::Integer(time);
                }
                for scope in scopes {
                    if let Some(v) = scope.get(&r.name) {
                        return match v {
                            Value::Skip => Value::Null,
                            other => other.clone(),
                        };
                    }
                }
                Value::Null
            }
            Expr::Literal(lit) => lit.to_value(),
            Expr::Paren(inner) => inner.evaluate(time, scopes),
            Expr::Binary { op, lhs, rhs } => {
                let left = lhs.evaluate(time, scopes);
                let right = rhs.evaluate(time, scopes);
                eval_binary(*op, &left, &right)
            }
            Expr::Call(call) => {
                if !functions::is_math_function(&call.name) {
                    return Value::Null;
                }
                let args: Vec<Value> = call
                    .args
                    .iter()
                    .map(|a| a.evaluate(time, scopes))
                    .collect();
                functions::eval_math(&call.name, &args)
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::VarRef(r) => write!(f, "{}", r),
            Expr::Call(c) => write!(f, "{}", c),
            Expr::Literal(l) => write!(f, "{}", l),
            Expr::Binary { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op, rhs),
            Expr::Paren(inner) => write!(f, "({})", inner),
        }
    }
}

fn eval_binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    if left.is_null() || right.is_null() {
        return Value::Null;
    }
    // Integer pairs keep integer arithmetic; any float operand promotes.
    if let (Value::Integer(a), Value::Integer(b)) = (left, right) {
        return match op {
            BinaryOp::Add => Value::Integer(a.wrapping_add(*b)),
            BinaryOp::Sub => Value::Integer(a.wrapping_sub(*b)),
            BinaryOp::Mul => Value::Integer(a.wrapping_mul(*b)),
            BinaryOp::Div => {
                if *b == 0 {
                    Value::Null
                } else {
                    Value::Integer(a / b)
                }
            }
            BinaryOp::Mod => {
                if *b == 0 {
                    Value::Null
                } else {
                    Value::Integer(a % b)
                }
            }
        };
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => match op {
            BinaryOp::Add => Value::Float(a + b),
            BinaryOp::Sub => Value::Float(a - b),
            BinaryOp::Mul => Value::Float(a * b),
            BinaryOp::Div => {
                if b == 0.0 {
                    Value::Null
                } else {
                    Value::Float(a / b)
                }
            }
            BinaryOp::Mod => {
                if b == 0.0 {
                    Value::Null
                } else {
                    Value::Float(a % b)
                }
            }
        },
        _ => Value::Null,
    }
}

// ============================================================================
// Statement
// ============================================================================

/// One output field of a statement
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// The field expression
    pub expr: Expr,
    /// Output alias, if the statement declared one
    pub alias: Option<String>,
}

impl Field {
    /// Create a field with no alias
    pub fn new(expr: Expr) -> Self {
        Self { expr, alias: None }
    }

    /// Create an aliased field
    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }

    /// The output name of the field: the alias, or a name derived from
    /// the expression
    pub fn name(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        match &self.expr {
            Expr::VarRef(r) => r.name.clone(),
            Expr::Call(c) => c.name.clone(),
            other => other.to_string(),
        }
    }
}

/// A concrete series source
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Measurement name
    pub name: String,
}

impl Measurement {
    /// Create a measurement source
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A statement source: a concrete series or a nested subquery
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Concrete measurement
    Measurement(Measurement),
    /// Nested subquery
    Subquery(Box<SelectStatement>),
}

/// Interval bucketing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    /// Bucket duration in nanoseconds; zero means no bucketing
    pub duration: i64,
    /// Bucket alignment offset in nanoseconds
    pub offset: i64,
}

impl Interval {
    /// Create an interval with the given bucket duration
    pub fn new(duration: i64) -> Self {
        Self {
            duration,
            offset: 0,
        }
    }

    /// Whether bucketing is disabled
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.duration == 0
    }

    /// The start of the bucket containing `t`
    #[inline]
    pub fn window_start(&self, t: i64) -> i64 {
        if self.is_zero() {
            return t;
        }
        let shifted = t - self.offset;
        shifted - shifted.rem_euclid(self.duration) + self.offset
    }
}

/// The rule for substituting a value into an output bucket that has no
/// contributing samples
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FillPolicy {
    /// Emit nothing for empty buckets
    #[default]
    None,
    /// Emit null
    Null,
    /// Carry the previous bucket's value forward
    Previous,
    /// Emit a fixed numeric value
    Number(Literal),
    /// Linearly interpolate between neighboring real values
    Linear,
}

/// A parsed, type-checked SELECT statement.
///
/// Parsing and static validation happen upstream; this is the shape the
/// engine plans from.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    /// Declared output fields
    pub fields: Vec<Field>,
    /// Sources to read from
    pub sources: Vec<Source>,
    /// Declared time range
    pub time_range: TimeRange,
    /// Interval bucketing; zero duration means none
    pub interval: Interval,
    /// Group-by tag keys, in declaration order
    pub dimensions: Vec<String>,
    /// Fill policy for empty buckets
    pub fill: FillPolicy,
    /// Maximum rows per series (0 = unlimited)
    pub limit: usize,
    /// Rows to skip per series
    pub offset: usize,
    /// Read direction
    pub ascending: bool,
    /// Suppress the implicit leading time column
    pub omit_time: bool,
    /// Target measurement when results are written elsewhere
    pub target: Option<Measurement>,
}

impl SelectStatement {
    /// Create a minimal statement over one source and a time range
    pub fn new(fields: Vec<Field>, sources: Vec<Source>, time_range: TimeRange) -> Self {
        Self {
            fields,
            sources,
            time_range,
            interval: Interval::default(),
            dimensions: Vec::new(),
            fill: FillPolicy::None,
            limit: 0,
            offset: 0,
            ascending: true,
            omit_time: false,
            target: None,
        }
    }

    /// Canonical output column names, one-to-one with the assembled field
    /// list: the implicit time column (unless omitted), each declared
    /// field, and the group-by tag arguments of any top/bottom call when
    /// not writing into a target. Duplicate names get `_N` suffixes.
    pub fn column_names(&self) -> Vec<String> {
        let mut raw = Vec::with_capacity(self.fields.len() + 1);
        if !self.omit_time {
            raw.push("time".to_string());
        }
        for field in &self.fields {
            raw.push(field.name());
            if self.target.is_none() {
                if let Expr::Call(call) = &field.expr {
                    if (call.name == "top" || call.name == "bottom") && call.args.len() > 2 {
                        for arg in &call.args[1..call.args.len() - 1] {
                            if let Expr::VarRef(r) = arg {
                                raw.push(r.name.clone());
                            }
                        }
                    }
                }
            }
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut names = Vec::with_capacity(raw.len());
        for name in raw {
            let seen = counts.entry(name.clone()).or_insert(0);
            if *seen == 0 {
                names.push(name.clone());
            } else {
                names.push(format!("{}_{}", name, seen));
            }
            *seen += 1;
        }
        names
    }

    /// Whether any source is a subquery
    pub fn has_subquery(&self) -> bool {
        self.sources
            .iter()
            .any(|s| matches!(s, Source::Subquery(_)))
    }
}

/// A produced output row: a timestamp, the group tag set, and one value
/// per output column.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Row timestamp
    pub time: i64,
    /// Group tags the row belongs to
    pub tags: TagSet,
    /// One value per output column, in column order
    pub values: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_ref(name: &str) -> Expr {
        Expr::var(name, FieldType::Float)
    }

    #[test]
    fn test_canonical_display() {
        let expr = Expr::call(
            "mean",
            vec![float_ref("usage")],
        );
        assert_eq!(expr.to_string(), "mean(usage)");

        let math = Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(expr),
            rhs: Box::new(Expr::Literal(Literal::Integer(2))),
        };
        assert_eq!(math.to_string(), "mean(usage) + 2");
    }

    #[test]
    fn test_column_names_dedup() {
        let stmt = SelectStatement::new(
            vec![
                Field::new(Expr::call("mean", vec![float_ref("x")])),
                Field::new(Expr::call("mean", vec![float_ref("y")])),
            ],
            vec![Source::Measurement(Measurement::new("m"))],
            TimeRange::new(0, 100).unwrap(),
        );
        assert_eq!(stmt.column_names(), vec!["time", "mean", "mean_1"]);
    }

    #[test]
    fn test_column_names_top_with_tags() {
        let stmt = SelectStatement::new(
            vec![Field::new(Expr::call(
                "top",
                vec![
                    float_ref("x"),
                    Expr::var("host", FieldType::Tag),
                    Expr::Literal(Literal::Integer(3)),
                ],
            ))],
            vec![Source::Measurement(Measurement::new("m"))],
            TimeRange::new(0, 100).unwrap(),
        );
        assert_eq!(stmt.column_names(), vec!["time", "top", "host"]);
    }

    #[test]
    fn test_evaluate_binary_math() {
        let mut vars = HashMap::new();
        vars.insert("val0".to_string(), Value::Float(4.0));
        vars.insert("val1".to_string(), Value::Integer(3));

        let expr = Expr::Binary {
            op: BinaryOp::Mul,
            lhs: Box::new(Expr::var("val0", FieldType::Float)),
            rhs: Box::new(Expr::var("val1", FieldType::Integer)),
        };
        assert_eq!(expr.evaluate(0, &[&vars]), Value::Float(12.0));
    }

    #[test]
    fn test_evaluate_integer_division_by_zero() {
        let vars = HashMap::new();
        let expr = Expr::Binary {
            op: BinaryOp::Div,
            lhs: Box::new(Expr::Literal(Literal::Integer(10))),
            rhs: Box::new(Expr::Literal(Literal::Integer(0))),
        };
        assert_eq!(expr.evaluate(0, &[&vars]), Value::Null);
    }

    #[test]
    fn test_evaluate_time_reference() {
        let vars = HashMap::new();
        let expr = Expr::var("time", FieldType::Time);
        assert_eq!(expr.evaluate(42, &[&vars]), Value::Integer(42));
    }

    #[test]
    fn test_evaluate_skip_renders_null() {
        let mut vars = HashMap::new();
        vars.insert("val0".to_string(), Value::Skip);
        let expr = Expr::var("val0", FieldType::Float);
        assert_eq!(expr.evaluate(0, &[&vars]), Value::Null);
    }

    #[test]
    fn test_evaluate_math_call() {
        let mut vars = HashMap::new();
        vars.insert("val0".to_string(), Value::Float(16.0));
        let expr = Expr::call("sqrt", vec![Expr::var("val0", FieldType::Float)]);
        assert_eq!(expr.evaluate(0, &[&vars]), Value::Float(4.0));
    }

    #[test]
    fn test_window_start_alignment() {
        let interval = Interval::new(60);
        assert_eq!(interval.window_start(0), 0);
        assert_eq!(interval.window_start(59), 0);
        assert_eq!(interval.window_start(90), 60);
        assert_eq!(interval.window_start(-1), -60);
    }
}
