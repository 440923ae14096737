//! Core domain types shared by the formula engine, the dependency graph and
//! the sheet repository.

use std::fmt;

/// A cell's stored value is prefixed with this character when it is a
/// formula to be evaluated rather than a literal.
pub const FORMULA_PREFIX: char = '=';

/// Characters a cell id is not allowed to contain, since the formula parser
/// uses them as operators and a cell id sits unquoted in expression text.
pub const CELL_ID_BLACKLIST: &[char] =
    &['+', '-', '*', '/', '%', '^', '(', ')', '<', '>', '!', '=', '&', '|', ' ', '\t', '\n', '\r'];

/// `true` if `value` is a formula (starts with [`FORMULA_PREFIX`]) rather
/// than a literal.
pub fn is_formula(value: &str) -> bool {
    value.starts_with(FORMULA_PREFIX)
}

/// A fully resolved cell: the id's original spelling (for display), the
/// canonical id it's stored and referenced under, the raw value exactly as
/// the client set it (literal or `=`-prefixed formula), and the evaluated
/// `result` (identical to `value` for non-formulas).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub original_key: String,
    pub canonical_key: String,
    pub value: String,
    pub result: String,
}

/// The runtime result of evaluating a cell's value, independent of how it
/// will be rendered over the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

impl EvalValue {
    /// Parses `s` the way a formula literal or an external value is
    /// coerced: an integer if it parses as one, else a float if it parses
    /// as one, else the string verbatim.
    pub fn coerce_str(s: &str) -> EvalValue {
        if let Ok(i) = s.parse::<i64>() {
            EvalValue::Int(i)
        } else if let Ok(f) = s.parse::<f64>() {
            EvalValue::Float(f)
        } else {
            EvalValue::Str(s.to_string())
        }
    }

    /// `true` for [`EvalValue::Int`] and [`EvalValue::Float`].
    pub fn is_numeric(&self) -> bool {
        matches!(self, EvalValue::Int(_) | EvalValue::Float(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EvalValue::Int(i) => Some(*i as f64),
            EvalValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Truthiness used by `!`, `&&` and `||`: numbers are truthy unless
    /// zero, strings are truthy unless empty, null is always falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            EvalValue::Int(i) => *i != 0,
            EvalValue::Float(f) => *f != 0.0,
            EvalValue::Str(s) => !s.is_empty(),
            EvalValue::Bool(b) => *b,
            EvalValue::Null => false,
        }
    }
}

impl fmt::Display for EvalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalValue::Int(i) => write!(f, "{i}"),
            EvalValue::Float(x) => write!(f, "{}", format_float(*x)),
            EvalValue::Str(s) => write!(f, "{s}"),
            EvalValue::Bool(b) => write!(f, "{b}"),
            EvalValue::Null => Ok(()),
        }
    }
}

/// Shortest round-tripping decimal representation, matching the behavior of
/// Go's `strconv.FormatFloat(x, 'f', -1, 64)`: no exponent, no trailing
/// zeros beyond what's needed to round-trip.
fn format_float(x: f64) -> String {
    if x == x.trunc() && x.is_finite() && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        let mut s = format!("{x}");
        if s.contains('e') || s.contains('E') {
            s = format!("{x:.}");
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_formulas() {
        assert!(is_formula("=1+2"));
        assert!(!is_formula("1+2"));
    }

    #[test]
    fn coerces_integers() {
        assert_eq!(EvalValue::coerce_str("42"), EvalValue::Int(42));
    }

    #[test]
    fn coerces_floats() {
        assert_eq!(EvalValue::coerce_str("3.5"), EvalValue::Float(3.5));
    }

    #[test]
    fn falls_back_to_string() {
        assert_eq!(
            EvalValue::coerce_str("hello"),
            EvalValue::Str("hello".to_string())
        );
    }

    #[test]
    fn displays_integers_without_decimal() {
        assert_eq!(EvalValue::Int(42).to_string(), "42");
        assert_eq!(EvalValue::Float(42.0).to_string(), "42");
    }

    #[test]
    fn displays_floats_compactly() {
        assert_eq!(EvalValue::Float(3.5).to_string(), "3.5");
    }
}
