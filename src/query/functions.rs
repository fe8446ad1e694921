//! Function registry
//!
//! A closed table of every recognized call name and the policy the
//! builder consults: which construction path the call takes, whether it
//! has selector semantics, whether it needs ordered input, how it extends
//! the requested time range, and what result type it produces. Adding a
//! function is a table entry, not a new branch in the builder.
//!
//! Pure math functions are listed separately; they are transparent to
//! symbol mapping and are evaluated per output row instead of building
//! iterators.

use crate::query::ast::{Call, Expr, Literal};
use crate::query::error::{QueryError, QueryResult};
use crate::query::iterator::Value;
use crate::types::FieldType;

// ============================================================================
// Registry
// ============================================================================

/// Structural construction path a call takes through the builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPath {
    /// `distinct(x)`: distinct wrapper, interval wrap, early return
    Distinct,
    /// `sample(x, n)`: reservoir selection over ordered input
    Sample,
    /// `holt_winters[_with_fit](x, h, m)`: unbounded seasonal fit
    HoltWinters {
        /// Include the fitted values alongside the forecast
        with_fit: bool,
    },
    /// Pairwise series transforms: derivative family, difference family,
    /// moving_average, elapsed
    SeriesTransform,
    /// `cumulative_sum(x)`: running per-series sum
    CumulativeSum,
    /// `integral(x[, unit])`: area under the curve per bucket
    Integral,
    /// `top`/`bottom`: extreme-by-count selection, optionally grouped
    TopBottom,
    /// Aggregates pushed down to storage per source: count, sum, min,
    /// max, mean, first, last
    Generic,
    /// Aggregates computed engine-side over a raw input: median, mode,
    /// stddev, spread, percentile
    EngineAggregate,
}

/// How a call widens the requested time range before building its input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeExtension {
    /// No extension
    None,
    /// One interval against the read direction
    OneInterval,
    /// (window - 1) intervals against the read direction, window taken
    /// from the call's integer argument
    WindowIntervals,
}

/// Result type rule for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    /// Always float
    Float,
    /// Always integer
    Integer,
    /// Same type as the first argument
    SameAsInput,
}

/// Policy record for one recognized function
#[derive(Debug, Clone, Copy)]
pub struct FunctionSpec {
    /// Function name
    pub name: &'static str,
    /// Construction path
    pub path: BuildPath,
    /// Selector semantics: the result is one of the original input values
    pub selector: bool,
    /// Input must arrive strictly time-sorted
    pub forces_ordered: bool,
    /// Time-range widening applied before building the inner input
    pub range_extension: RangeExtension,
    /// Result type rule
    pub result: ResultType,
}

/// The registry of recognized aggregate, selector, and transform calls
pub const FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec { name: "count", path: BuildPath::Generic, selector: false, forces_ordered: false, range_extension: RangeExtension::None, result: ResultType::Integer },
    FunctionSpec { name: "sum", path: BuildPath::Generic, selector: false, forces_ordered: false, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "mean", path: BuildPath::Generic, selector: false, forces_ordered: false, range_extension: RangeExtension::None, result: ResultType::Float },
    FunctionSpec { name: "min", path: BuildPath::Generic, selector: true, forces_ordered: false, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "max", path: BuildPath::Generic, selector: true, forces_ordered: false, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "first", path: BuildPath::Generic, selector: true, forces_ordered: false, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "last", path: BuildPath::Generic, selector: true, forces_ordered: false, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "median", path: BuildPath::EngineAggregate, selector: false, forces_ordered: true, range_extension: RangeExtension::None, result: ResultType::Float },
    FunctionSpec { name: "mode", path: BuildPath::EngineAggregate, selector: false, forces_ordered: false, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "stddev", path: BuildPath::EngineAggregate, selector: false, forces_ordered: false, range_extension: RangeExtension::None, result: ResultType::Float },
    FunctionSpec { name: "spread", path: BuildPath::EngineAggregate, selector: false, forces_ordered: false, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "percentile", path: BuildPath::EngineAggregate, selector: true, forces_ordered: true, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "distinct", path: BuildPath::Distinct, selector: false, forces_ordered: true, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "sample", path: BuildPath::Sample, selector: true, forces_ordered: true, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "top", path: BuildPath::TopBottom, selector: true, forces_ordered: false, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "bottom", path: BuildPath::TopBottom, selector: true, forces_ordered: false, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "derivative", path: BuildPath::SeriesTransform, selector: false, forces_ordered: true, range_extension: RangeExtension::OneInterval, result: ResultType::Float },
    FunctionSpec { name: "non_negative_derivative", path: BuildPath::SeriesTransform, selector: false, forces_ordered: true, range_extension: RangeExtension::OneInterval, result: ResultType::Float },
    FunctionSpec { name: "difference", path: BuildPath::SeriesTransform, selector: false, forces_ordered: true, range_extension: RangeExtension::OneInterval, result: ResultType::SameAsInput },
    FunctionSpec { name: "non_negative_difference", path: BuildPath::SeriesTransform, selector: false, forces_ordered: true, range_extension: RangeExtension::OneInterval, result: ResultType::SameAsInput },
    FunctionSpec { name: "elapsed", path: BuildPath::SeriesTransform, selector: false, forces_ordered: true, range_extension: RangeExtension::OneInterval, result: ResultType::Integer },
    FunctionSpec { name: "moving_average", path: BuildPath::SeriesTransform, selector: false, forces_ordered: true, range_extension: RangeExtension::WindowIntervals, result: ResultType::Float },
    FunctionSpec { name: "cumulative_sum", path: BuildPath::CumulativeSum, selector: false, forces_ordered: true, range_extension: RangeExtension::None, result: ResultType::SameAsInput },
    FunctionSpec { name: "integral", path: BuildPath::Integral, selector: false, forces_ordered: true, range_extension: RangeExtension::None, result: ResultType::Float },
    FunctionSpec { name: "holt_winters", path: BuildPath::HoltWinters { with_fit: false }, selector: false, forces_ordered: true, range_extension: RangeExtension::None, result: ResultType::Float },
    FunctionSpec { name: "holt_winters_with_fit", path: BuildPath::HoltWinters { with_fit: true }, selector: false, forces_ordered: true, range_extension: RangeExtension::None, result: ResultType::Float },
];

/// Look up the policy record for a call name
pub fn lookup(name: &str) -> Option<&'static FunctionSpec> {
    FUNCTIONS.iter().find(|spec| spec.name == name)
}

/// Whether a call is a selector function
pub fn is_selector(call: &Call) -> bool {
    lookup(&call.name).map(|s| s.selector).unwrap_or(false)
}

// ============================================================================
// Argument validation
// ============================================================================

/// Validate a call's arity and argument shapes.
///
/// Argument-shape problems are fatal at build time; this is the single
/// place the checks live so the builder and the type validator agree.
pub fn validate_args(call: &Call) -> QueryResult<()> {
    let spec = lookup(&call.name).ok_or_else(|| QueryError::unsupported_call(&call.name))?;
    let argc = call.args.len();
    match spec.path {
        BuildPath::Generic => {
            if call.name == "count" {
                // count takes a reference or, narrowly, a distinct call.
                if argc != 1 {
                    return Err(wrong_arity(call, "1 argument"));
                }
                match &call.args[0] {
                    Expr::VarRef(_) => Ok(()),
                    Expr::Call(inner) if inner.name == "distinct" => validate_args(inner),
                    _ => Err(bad_argument(call, 0, "a field reference or distinct()")),
                }
            } else {
                expect_single_ref(call)
            }
        }
        BuildPath::EngineAggregate => {
            if call.name == "percentile" {
                if argc != 2 {
                    return Err(wrong_arity(call, "2 arguments"));
                }
                require_ref(call, 0)?;
                match &call.args[1] {
                    Expr::Literal(Literal::Number(_)) | Expr::Literal(Literal::Integer(_)) => {
                        Ok(())
                    }
                    _ => Err(bad_argument(call, 1, "a numeric literal")),
                }
            } else {
                expect_single_ref(call)
            }
        }
        BuildPath::Distinct => expect_single_ref(call),
        BuildPath::CumulativeSum => expect_single_arg(call),
        BuildPath::Sample => {
            if argc != 2 {
                return Err(wrong_arity(call, "2 arguments"));
            }
            positive_int(call, 1)
        }
        BuildPath::HoltWinters { .. } => {
            if argc != 3 {
                return Err(wrong_arity(call, "3 arguments"));
            }
            non_negative_int(call, 1)?;
            positive_int(call, 2)
        }
        BuildPath::SeriesTransform => match call.name.as_str() {
            "moving_average" => {
                if argc != 2 {
                    return Err(wrong_arity(call, "2 arguments"));
                }
                positive_int(call, 1)
            }
            _ => {
                if argc == 0 || argc > 2 {
                    return Err(wrong_arity(call, "1 or 2 arguments"));
                }
                if argc == 2 {
                    match &call.args[1] {
                        Expr::Literal(Literal::Duration(_)) => Ok(()),
                        _ => Err(bad_argument(call, 1, "a duration literal")),
                    }
                } else {
                    Ok(())
                }
            }
        },
        BuildPath::Integral => {
            if argc == 0 || argc > 2 {
                return Err(wrong_arity(call, "1 or 2 arguments"));
            }
            require_ref(call, 0)?;
            if argc == 2 {
                match &call.args[1] {
                    Expr::Literal(Literal::Duration(_)) => Ok(()),
                    _ => Err(bad_argument(call, 1, "a duration literal")),
                }
            } else {
                Ok(())
            }
        }
        BuildPath::TopBottom => {
            if argc < 2 {
                return Err(QueryError::invalid_arguments(format!(
                    "{}() requires 2 or more arguments, got {}",
                    call.name, argc
                )));
            }
            require_ref(call, 0)?;
            for i in 1..argc - 1 {
                require_ref(call, i)?;
            }
            positive_int(call, argc - 1)
        }
    }
}

fn expect_single_ref(call: &Call) -> QueryResult<()> {
    if call.args.len() != 1 {
        return Err(wrong_arity(call, "1 argument"));
    }
    require_ref(call, 0)
}

fn expect_single_arg(call: &Call) -> QueryResult<()> {
    if call.args.len() != 1 {
        return Err(wrong_arity(call, "1 argument"));
    }
    Ok(())
}

fn require_ref(call: &Call, index: usize) -> QueryResult<()> {
    match &call.args[index] {
        Expr::VarRef(_) => Ok(()),
        _ => Err(bad_argument(call, index, "a field reference")),
    }
}

fn positive_int(call: &Call, index: usize) -> QueryResult<()> {
    match &call.args[index] {
        Expr::Literal(Literal::Integer(n)) if *n > 0 => Ok(()),
        _ => Err(bad_argument(call, index, "a positive integer literal")),
    }
}

fn non_negative_int(call: &Call, index: usize) -> QueryResult<()> {
    match &call.args[index] {
        Expr::Literal(Literal::Integer(n)) if *n >= 0 => Ok(()),
        _ => Err(bad_argument(call, index, "a non-negative integer literal")),
    }
}

fn wrong_arity(call: &Call, expected: &str) -> QueryError {
    QueryError::invalid_arguments(format!(
        "{}() requires {}, got {}",
        call.name,
        expected,
        call.args.len()
    ))
}

fn bad_argument(call: &Call, index: usize, expected: &str) -> QueryError {
    QueryError::invalid_arguments(format!(
        "{}() argument {} must be {}",
        call.name, index, expected
    ))
}

// ============================================================================
// Type inference
// ============================================================================

/// Statically infer the result type of an expression.
///
/// Fails with a type error when the expression composes types no
/// recognized function or operator supports.
pub fn infer_type(expr: &Expr) -> QueryResult<FieldType> {
    match expr {
        Expr::VarRef(r) => Ok(r.ty),
        Expr::Literal(lit) => Ok(match lit {
            Literal::Integer(_) | Literal::Duration(_) => FieldType::Integer,
            Literal::Number(_) => FieldType::Float,
            Literal::Str(_) => FieldType::String,
            Literal::Boolean(_) => FieldType::Boolean,
        }),
        Expr::Paren(inner) => infer_type(inner),
        Expr::Binary { op, lhs, rhs } => {
            let left = infer_type(lhs)?;
            let right = infer_type(rhs)?;
            numeric_promotion(left, right).ok_or_else(|| {
                QueryError::type_error(format!(
                    "operator {} is not supported between {} and {}",
                    op, left, right
                ))
            })
        }
        Expr::Call(call) => {
            if is_math_function(&call.name) {
                if call.args.is_empty() {
                    return Err(QueryError::type_error(format!(
                        "{}() requires at least 1 argument",
                        call.name
                    )));
                }
                let arg = infer_type(&call.args[0])?;
                return Ok(math_result_type(&call.name, arg));
            }
            let spec =
                lookup(&call.name).ok_or_else(|| QueryError::unsupported_call(&call.name))?;
            validate_args(call)?;
            Ok(match spec.result {
                ResultType::Float => FieldType::Float,
                ResultType::Integer => FieldType::Integer,
                ResultType::SameAsInput => match call.args.first() {
                    Some(arg) => infer_type(arg)?,
                    None => FieldType::Unknown,
                },
            })
        }
    }
}

fn numeric_promotion(left: FieldType, right: FieldType) -> Option<FieldType> {
    use FieldType::*;
    match (left, right) {
        (Integer, Integer) => Some(Integer),
        (Unsigned, Unsigned) => Some(Unsigned),
        (Float, Float) | (Float, Integer) | (Integer, Float) => Some(Float),
        (Float, Unsigned) | (Unsigned, Float) => Some(Float),
        (Integer, Unsigned) | (Unsigned, Integer) => Some(Integer),
        (Unknown, other) | (other, Unknown) if is_numeric_or_unknown(other) => Some(other),
        _ => None,
    }
}

fn is_numeric_or_unknown(ty: FieldType) -> bool {
    matches!(
        ty,
        FieldType::Float | FieldType::Integer | FieldType::Unsigned | FieldType::Unknown
    )
}

// ============================================================================
// Math functions
// ============================================================================

const MATH_FUNCTIONS: &[&str] = &[
    "abs", "sin", "cos", "tan", "asin", "acos", "atan", "atan2", "exp", "ln", "log", "log2",
    "log10", "sqrt", "pow", "floor", "ceil", "round",
];

/// Whether a call name is a pure math function.
///
/// Math functions never receive symbols from the value mapper; the mapper
/// descends into their arguments instead.
pub fn is_math_function(name: &str) -> bool {
    MATH_FUNCTIONS.contains(&name)
}

fn math_result_type(name: &str, arg: FieldType) -> FieldType {
    match name {
        "abs" | "floor" | "ceil" | "round" if arg == FieldType::Integer => FieldType::Integer,
        _ => FieldType::Float,
    }
}

/// Evaluate a math function over already-evaluated argument values
pub fn eval_math(name: &str, args: &[Value]) -> Value {
    if args.iter().any(|a| a.is_null()) {
        return Value::Null;
    }
    // Integer-preserving forms first.
    if let (Some(Value::Integer(v)), "abs") = (args.first(), name) {
        return Value::Integer(v.wrapping_abs());
    }
    if let Some(Value::Integer(v)) = args.first() {
        if matches!(name, "floor" | "ceil" | "round") {
            return Value::Integer(*v);
        }
    }
    let x = match args.first().and_then(|a| a.as_f64()) {
        Some(x) => x,
        None => return Value::Null,
    };
    let result = match name {
        "abs" => x.abs(),
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "asin" => x.asin(),
        "acos" => x.acos(),
        "atan" => x.atan(),
        "exp" => x.exp(),
        "ln" => x.ln(),
        "log2" => x.log2(),
        "log10" => x.log10(),
        "sqrt" => x.sqrt(),
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        "round" => x.round(),
        "atan2" | "pow" | "log" => {
            let y = match args.get(1).and_then(|a| a.as_f64()) {
                Some(y) => y,
                None => return Value::Null,
            };
            match name {
                "atan2" => x.atan2(y),
                "pow" => x.powf(y),
                _ => x.log(y),
            }
        }
        _ => return Value::Null,
    };
    if result.is_nan() {
        Value::Null
    } else {
        Value::Float(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{Expr, Literal};

    fn float_ref(name: &str) -> Expr {
        Expr::var(name, FieldType::Float)
    }

    #[test]
    fn test_lookup_known_and_unknown() {
        assert!(lookup("mean").is_some());
        assert!(lookup("derivative").is_some());
        assert!(lookup("frobnicate").is_none());
    }

    #[test]
    fn test_selector_classification() {
        for name in ["first", "last", "min", "max", "percentile", "sample", "top", "bottom"] {
            assert!(lookup(name).unwrap().selector, "{} should be a selector", name);
        }
        for name in ["mean", "count", "sum", "stddev", "median", "derivative"] {
            assert!(!lookup(name).unwrap().selector, "{} is not a selector", name);
        }
    }

    #[test]
    fn test_top_arity_error() {
        let call = Call::new("top", vec![float_ref("x")]);
        let err = validate_args(&call).unwrap_err();
        assert!(err.to_string().contains("2 or more"));
    }

    #[test]
    fn test_moving_average_window_shape() {
        let bad = Call::new(
            "moving_average",
            vec![float_ref("x"), Expr::Literal(Literal::Number(2.5))],
        );
        assert!(validate_args(&bad).is_err());

        let good = Call::new(
            "moving_average",
            vec![float_ref("x"), Expr::Literal(Literal::Integer(4))],
        );
        assert!(validate_args(&good).is_ok());
    }

    #[test]
    fn test_count_distinct_is_narrow() {
        let ok = Call::new(
            "count",
            vec![Expr::call("distinct", vec![float_ref("x")])],
        );
        assert!(validate_args(&ok).is_ok());

        // Any other nested call stays illegal.
        let bad = Call::new("count", vec![Expr::call("mean", vec![float_ref("x")])]);
        assert!(validate_args(&bad).is_err());
    }

    #[test]
    fn test_infer_type_through_calls() {
        let mean = Expr::call("mean", vec![Expr::var("x", FieldType::Integer)]);
        assert_eq!(infer_type(&mean).unwrap(), FieldType::Float);

        let max = Expr::call("max", vec![Expr::var("x", FieldType::Integer)]);
        assert_eq!(infer_type(&max).unwrap(), FieldType::Integer);

        let count = Expr::call("count", vec![float_ref("x")]);
        assert_eq!(infer_type(&count).unwrap(), FieldType::Integer);
    }

    #[test]
    fn test_infer_type_rejects_string_math() {
        let expr = Expr::Binary {
            op: crate::query::ast::BinaryOp::Add,
            lhs: Box::new(Expr::var("s", FieldType::String)),
            rhs: Box::new(Expr::Literal(Literal::Integer(1))),
        };
        assert!(infer_type(&expr).is_err());
    }

    #[test]
    fn test_math_functions_are_transparent() {
        assert!(is_math_function("sqrt"));
        assert!(!is_math_function("mean"));
        assert_eq!(
            eval_math("pow", &[Value::Float(2.0), Value::Float(10.0)]),
            Value::Float(1024.0)
        );
        assert_eq!(eval_math("abs", &[Value::Integer(-3)]), Value::Integer(3));
        assert_eq!(eval_math("sqrt", &[Value::Float(-1.0)]), Value::Null);
    }
}
