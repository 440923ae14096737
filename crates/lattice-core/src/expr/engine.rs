//! Tree-walking evaluator: resolves identifiers against a local batch of
//! in-flight formulas first, falling back to whatever is already persisted,
//! detects circular references via an "in progress" sentinel planted before
//! recursing into a cell's formula, and evaluates the small builtin
//! function set (`max`, `min`, `sum`, `avg`, `external_ref`).

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{is_formula, EvalValue, FORMULA_PREFIX};

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::parser::parse;

/// Batch lookup of cell values, used for whatever a formula references that
/// isn't part of the in-flight batch being evaluated together.
pub trait ValuesGetter {
    fn get_values(&self, cell_ids: &[String]) -> Result<Vec<Option<EvalValue>>>;
}

/// Composes two getters: `first` is tried for every id, `second` is
/// consulted only for the ids `first` came back empty on, and results are
/// spliced back into their original positions.
pub struct ValuesGetterChain<'a> {
    first: &'a dyn ValuesGetter,
    second: &'a dyn ValuesGetter,
}

impl<'a> ValuesGetterChain<'a> {
    pub fn new(first: &'a dyn ValuesGetter, second: &'a dyn ValuesGetter) -> Self {
        ValuesGetterChain { first, second }
    }
}

impl ValuesGetter for ValuesGetterChain<'_> {
    fn get_values(&self, cell_ids: &[String]) -> Result<Vec<Option<EvalValue>>> {
        let mut out = self.first.get_values(cell_ids)?;
        let missing: Vec<(usize, String)> = out
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(i, _)| (i, cell_ids[i].clone()))
            .collect();
        if missing.is_empty() {
            return Ok(out);
        }
        let missing_ids: Vec<String> = missing.iter().map(|(_, id)| id.clone()).collect();
        let resolved = self.second.get_values(&missing_ids)?;
        for ((idx, _), value) in missing.into_iter().zip(resolved) {
            out[idx] = value;
        }
        Ok(out)
    }
}

/// A getter with no entries, used where a sheet has nothing persisted yet.
pub struct EmptyValuesGetter;

impl ValuesGetter for EmptyValuesGetter {
    fn get_values(&self, cell_ids: &[String]) -> Result<Vec<Option<EvalValue>>> {
        Ok(vec![None; cell_ids.len()])
    }
}

#[derive(Clone)]
enum CacheEntry {
    InProgress,
    Done(EvalValue),
}

/// Evaluates a batch of cells together (a cell and its current dependants,
/// or an entire sheet), sharing one memoization cache so that a cell
/// referenced by more than one formula in the batch is only computed once,
/// and so that a reference cycle is caught instead of looping forever.
pub struct Evaluator<'a> {
    expressions: &'a HashMap<String, String>,
    sheet_getter: &'a dyn ValuesGetter,
    cache: RefCell<HashMap<String, CacheEntry>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(expressions: &'a HashMap<String, String>, sheet_getter: &'a dyn ValuesGetter) -> Self {
        Evaluator { expressions, sheet_getter, cache: RefCell::new(HashMap::new()) }
    }

    /// Evaluate every entry in `expressions`. If `break_on_error` is set,
    /// stops and returns the first error; otherwise every cell gets a best
    /// effort result and errors are reported per cell as a string message.
    /// After each successful evaluation, also enforces I5 (a purely
    /// numeric cell id must hold a numeric value) -- a cell named `1`
    /// that resolves to a non-numeric value is itself an error, reported
    /// the same way a compile or runtime error would be.
    pub fn evaluate_all(&self, break_on_error: bool) -> Result<HashMap<String, EvalValue>> {
        let mut out = HashMap::with_capacity(self.expressions.len());
        for cell_id in self.expressions.keys() {
            let outcome = self.resolve(cell_id).and_then(|v| {
                if is_purely_numeric_id(cell_id) && !v.is_numeric() {
                    Err(Error::CellIdNumericViolation)
                } else {
                    Ok(v)
                }
            });
            match outcome {
                Ok(v) => {
                    out.insert(cell_id.clone(), v);
                }
                Err(e) => {
                    if break_on_error {
                        return Err(Error::Batch { cell_id: cell_id.clone(), source: Box::new(e) });
                    }
                    out.insert(cell_id.clone(), EvalValue::Str(e.to_string()));
                }
            }
        }
        Ok(out)
    }

    /// Evaluate a single cell id that's expected to be in `expressions`.
    pub fn evaluate_one(&self, cell_id: &str) -> Result<EvalValue> {
        self.resolve(cell_id)
    }

    fn resolve(&self, cell_id: &str) -> Result<EvalValue> {
        Ok(self.lookup(cell_id)?.unwrap_or(EvalValue::Null))
    }

    /// Look up `cell_id` anywhere in scope. Returns `Ok(None)` only when
    /// the id is truly absent (not in the in-flight batch, not persisted),
    /// which callers use differently depending on whether a missing
    /// reference should be tolerated as null or treated as "not a cell".
    fn lookup(&self, cell_id: &str) -> Result<Option<EvalValue>> {
        if let Some(entry) = self.cache.borrow().get(cell_id) {
            return match entry {
                CacheEntry::InProgress => {
                    Err(Error::CircularReference(cell_id.to_string()))
                }
                CacheEntry::Done(v) => Ok(Some(v.clone())),
            };
        }

        if let Some(raw) = self.expressions.get(cell_id) {
            self.cache.borrow_mut().insert(cell_id.to_string(), CacheEntry::InProgress);
            let value = self.evaluate_raw(cell_id, raw)?;
            self.cache
                .borrow_mut()
                .insert(cell_id.to_string(), CacheEntry::Done(value.clone()));
            return Ok(Some(value));
        }

        let fetched = self.sheet_getter.get_values(std::slice::from_ref(&cell_id.to_string()))?;
        match fetched.into_iter().next().flatten() {
            Some(v) => {
                self.cache.borrow_mut().insert(cell_id.to_string(), CacheEntry::Done(v.clone()));
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    fn evaluate_raw(&self, cell_id: &str, raw: &str) -> Result<EvalValue> {
        if is_formula(raw) {
            let body = &raw[FORMULA_PREFIX.len_utf8()..];
            let ast = parse(body).map_err(|e| Error::Compile {
                expression: cell_id.to_string(),
                message: e.to_string(),
            })?;
            self.eval(cell_id, &ast)
        } else {
            Ok(EvalValue::coerce_str(raw))
        }
    }

    fn eval(&self, cell_id: &str, expr: &Expr) -> Result<EvalValue> {
        let value = match expr {
            Expr::Number { text, value } => match self.lookup(text)? {
                Some(v) => Ok(v),
                None => Ok(EvalValue::Float(*value)),
            },
            Expr::Str(s) => Ok(EvalValue::Str(s.clone())),
            Expr::Ident(name) => Ok(self.resolve(name)?),
            Expr::Unary { op, expr } => {
                let v = self.eval(cell_id, expr)?;
                eval_unary(*op, v)
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.eval(cell_id, lhs)?;
                let r = self.eval(cell_id, rhs)?;
                eval_binary(*op, l, r)
            }
            Expr::Call { name, args } => {
                let values: Vec<EvalValue> =
                    args.iter().map(|a| self.eval(cell_id, a)).collect::<Result<_>>()?;
                call_builtin(name, &values)
            }
        };
        value.map_err(|message| Error::Eval { expression: cell_id.to_string(), message })
    }
}

fn is_purely_numeric_id(cell_id: &str) -> bool {
    !cell_id.is_empty() && cell_id.chars().all(|c| c.is_ascii_digit())
}

fn eval_unary(op: UnaryOp, v: EvalValue) -> std::result::Result<EvalValue, String> {
    match op {
        UnaryOp::Not => Ok(EvalValue::Bool(!v.is_truthy())),
        UnaryOp::Neg => match v {
            EvalValue::Int(i) => Ok(EvalValue::Int(-i)),
            EvalValue::Float(f) => Ok(EvalValue::Float(-f)),
            other => Err(format!("cannot negate {other}")),
        },
    }
}

fn eval_binary(op: BinaryOp, l: EvalValue, r: EvalValue) -> std::result::Result<EvalValue, String> {
    use BinaryOp::*;
    match op {
        And => Ok(EvalValue::Bool(l.is_truthy() && r.is_truthy())),
        Or => Ok(EvalValue::Bool(l.is_truthy() || r.is_truthy())),
        Add => {
            if matches!(l, EvalValue::Str(_)) || matches!(r, EvalValue::Str(_)) {
                Ok(EvalValue::Str(format!("{l}{r}")))
            } else {
                numeric_binop(l, r, |a, b| a + b, |a, b| a.wrapping_add(b))
            }
        }
        Sub => numeric_binop(l, r, |a, b| a - b, |a, b| a.wrapping_sub(b)),
        Mul => numeric_binop(l, r, |a, b| a * b, |a, b| a.wrapping_mul(b)),
        Div => {
            let (a, b) = numeric_pair(&l, &r)?;
            if b == 0.0 {
                return Err("division by zero".to_string());
            }
            Ok(EvalValue::Float(a / b))
        }
        Rem => {
            let (a, b) = numeric_pair(&l, &r)?;
            if b == 0.0 {
                return Err("division by zero".to_string());
            }
            Ok(EvalValue::Float(a % b))
        }
        Pow => {
            let (a, b) = numeric_pair(&l, &r)?;
            Ok(EvalValue::Float(a.powf(b)))
        }
        Eq => Ok(EvalValue::Bool(values_equal(&l, &r))),
        Ne => Ok(EvalValue::Bool(!values_equal(&l, &r))),
        Lt | Le | Gt | Ge => compare(op, l, r),
    }
}

fn numeric_binop(
    l: EvalValue,
    r: EvalValue,
    float_op: impl Fn(f64, f64) -> f64,
    int_op: impl Fn(i64, i64) -> i64,
) -> std::result::Result<EvalValue, String> {
    match (&l, &r) {
        (EvalValue::Int(a), EvalValue::Int(b)) => Ok(EvalValue::Int(int_op(*a, *b))),
        _ => {
            let (a, b) = numeric_pair(&l, &r)?;
            Ok(EvalValue::Float(float_op(a, b)))
        }
    }
}

fn numeric_pair(l: &EvalValue, r: &EvalValue) -> std::result::Result<(f64, f64), String> {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(format!("expected numbers, got {l:?} and {r:?}")),
    }
}

fn values_equal(l: &EvalValue, r: &EvalValue) -> bool {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => l.to_string() == r.to_string(),
    }
}

fn compare(op: BinaryOp, l: EvalValue, r: EvalValue) -> std::result::Result<EvalValue, String> {
    use std::cmp::Ordering;
    let ordering = match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).ok_or_else(|| "NaN is not ordered".to_string())?,
        _ => l.to_string().cmp(&r.to_string()),
    };
    let result = match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Ge => ordering != Ordering::Less,
        _ => unreachable!(),
    };
    Ok(EvalValue::Bool(result))
}

fn call_builtin(name: &str, args: &[EvalValue]) -> std::result::Result<EvalValue, String> {
    match name.to_ascii_uppercase().as_str() {
        "MAX" => reduce_extreme(args, |a, b| a > b),
        "MIN" => reduce_extreme(args, |a, b| a < b),
        "SUM" => {
            let mut all_int = true;
            let mut int_sum: i64 = 0;
            let mut float_sum = 0.0;
            for a in args {
                match a {
                    EvalValue::Int(i) => {
                        int_sum = int_sum.wrapping_add(*i);
                        float_sum += *i as f64;
                    }
                    other => {
                        all_int = false;
                        float_sum += other
                            .as_f64()
                            .ok_or_else(|| format!("sum: {other} is not numeric"))?;
                    }
                }
            }
            Ok(if all_int { EvalValue::Int(int_sum) } else { EvalValue::Float(float_sum) })
        }
        "AVG" => {
            if args.is_empty() {
                return Err("avg: at least one argument is required".to_string());
            }
            let mut sum = 0.0;
            for a in args {
                sum += a.as_f64().ok_or_else(|| format!("avg: {a} is not numeric"))?;
            }
            Ok(EvalValue::Float(sum / args.len() as f64))
        }
        "EXTERNAL_REF" => external_ref(args),
        other => Err(format!("unknown function `{other}`")),
    }
}

fn reduce_extreme(
    args: &[EvalValue],
    better: impl Fn(f64, f64) -> bool,
) -> std::result::Result<EvalValue, String> {
    if args.is_empty() {
        return Err("at least one argument is required".to_string());
    }
    let mut best = &args[0];
    let mut best_f = best.as_f64().ok_or_else(|| format!("{best} is not numeric"))?;
    for a in &args[1..] {
        let f = a.as_f64().ok_or_else(|| format!("{a} is not numeric"))?;
        if better(f, best_f) {
            best = a;
            best_f = f;
        }
    }
    Ok(best.clone())
}

/// Cell payload fetched from another sheet's `GET /api/v1/:sheet/:cell`
/// endpoint, mirroring this service's own wire response shape.
#[derive(Debug, Deserialize)]
struct ExternalCellResponse {
    result: String,
}

fn external_ref(args: &[EvalValue]) -> std::result::Result<EvalValue, String> {
    let [url] = args else {
        return Err("external_ref expects exactly one argument".to_string());
    };
    let EvalValue::Str(url) = url else {
        return Err("external_ref's argument must be a string URL".to_string());
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(4))
        .build()
        .map_err(|e| format!("external_ref: building http client: {e}"))?;
    let response = client
        .get(url)
        .send()
        .map_err(|e| format!("external_ref: requesting {url}: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("external_ref: {url} returned {}", response.status()));
    }
    let body: ExternalCellResponse = response
        .json()
        .map_err(|e| format!("external_ref: decoding response from {url}: {e}"))?;
    Ok(EvalValue::coerce_str(&body.result))
}

/// Every identifier and numeric-literal spelling a formula could reference
/// as a cell, used to build the dependency graph and to know which values
/// must be fetched before evaluating. String literals and function names
/// never count.
pub fn extract_depending_on_list(ast: &Expr) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    collect_depending_on(ast, &mut out, &mut seen);
    out
}

fn collect_depending_on(expr: &Expr, out: &mut Vec<String>, seen: &mut std::collections::HashSet<String>) {
    match expr {
        Expr::Number { text, .. } => push_unique(text, out, seen),
        Expr::Ident(name) => push_unique(name, out, seen),
        Expr::Str(_) => {}
        Expr::Unary { expr, .. } => collect_depending_on(expr, out, seen),
        Expr::Binary { lhs, rhs, .. } => {
            collect_depending_on(lhs, out, seen);
            collect_depending_on(rhs, out, seen);
        }
        Expr::Call { args, .. } => {
            for a in args {
                collect_depending_on(a, out, seen);
            }
        }
    }
}

fn push_unique(id: &str, out: &mut Vec<String>, seen: &mut std::collections::HashSet<String>) {
    if seen.insert(id.to_string()) {
        out.push(id.to_string());
    }
}

/// URLs passed as a literal string first argument to `external_ref(...)`,
/// used to drive the external-reference subscriber rather than the
/// dependency graph.
pub fn extract_external_refs(ast: &Expr) -> Vec<String> {
    let mut out = Vec::new();
    collect_external_refs(ast, &mut out);
    out
}

fn collect_external_refs(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Call { name, args } => {
            if name.eq_ignore_ascii_case("external_ref") {
                if let Some(Expr::Str(url)) = args.first() {
                    out.push(url.clone());
                }
            }
            for a in args {
                collect_external_refs(a, out);
            }
        }
        Expr::Unary { expr, .. } => collect_external_refs(expr, out),
        Expr::Binary { lhs, rhs, .. } => {
            collect_external_refs(lhs, out);
            collect_external_refs(rhs, out);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapGetter(HashMap<String, EvalValue>);
    impl ValuesGetter for MapGetter {
        fn get_values(&self, cell_ids: &[String]) -> Result<Vec<Option<EvalValue>>> {
            Ok(cell_ids.iter().map(|id| self.0.get(id).cloned()).collect())
        }
    }

    fn eval_one(expressions: &HashMap<String, String>, target: &str, sheet: &dyn ValuesGetter) -> Result<EvalValue> {
        Evaluator::new(expressions, sheet).evaluate_one(target)
    }

    #[test]
    fn evaluates_arithmetic() {
        let mut m = HashMap::new();
        m.insert("A1".to_string(), "=1+2*3".to_string());
        let empty = EmptyValuesGetter;
        assert_eq!(eval_one(&m, "A1", &empty).unwrap(), EvalValue::Int(7));
    }

    #[test]
    fn resolves_local_dependency() {
        let mut m = HashMap::new();
        m.insert("A1".to_string(), "=B1+1".to_string());
        m.insert("B1".to_string(), "=2".to_string());
        let empty = EmptyValuesGetter;
        assert_eq!(eval_one(&m, "A1", &empty).unwrap(), EvalValue::Int(3));
    }

    #[test]
    fn falls_back_to_persisted_sheet() {
        let mut m = HashMap::new();
        m.insert("A1".to_string(), "=B1+1".to_string());
        let mut persisted = HashMap::new();
        persisted.insert("B1".to_string(), EvalValue::Int(41));
        let getter = MapGetter(persisted);
        assert_eq!(eval_one(&m, "A1", &getter).unwrap(), EvalValue::Int(42));
    }

    #[test]
    fn undefined_reference_is_null_not_error() {
        let mut m = HashMap::new();
        m.insert("A1".to_string(), "=B1".to_string());
        let empty = EmptyValuesGetter;
        assert_eq!(eval_one(&m, "A1", &empty).unwrap(), EvalValue::Null);
    }

    #[test]
    fn detects_circular_reference() {
        let mut m = HashMap::new();
        m.insert("A1".to_string(), "=B1".to_string());
        m.insert("B1".to_string(), "=A1".to_string());
        let empty = EmptyValuesGetter;
        let err = eval_one(&m, "A1", &empty).unwrap_err();
        assert!(matches!(err, Error::CircularReference(_)), "got {err:?}");
    }

    #[test]
    fn numeric_literal_rebinds_to_matching_cell() {
        let mut m = HashMap::new();
        m.insert("A1".to_string(), "=2+1".to_string());
        m.insert("2".to_string(), "=100".to_string());
        let empty = EmptyValuesGetter;
        // The literal `2` in `A1` is shadowed by a cell named "2".
        assert_eq!(eval_one(&m, "A1", &empty).unwrap(), EvalValue::Int(101));
    }

    #[test]
    fn builtins_max_min_sum_avg() {
        let mut m = HashMap::new();
        m.insert("A1".to_string(), "=max(1,5,3)".to_string());
        m.insert("A2".to_string(), "=min(1,5,3)".to_string());
        m.insert("A3".to_string(), "=sum(1,2,3)".to_string());
        m.insert("A4".to_string(), "=avg(1,2,3)".to_string());
        let empty = EmptyValuesGetter;
        assert_eq!(eval_one(&m, "A1", &empty).unwrap(), EvalValue::Int(5));
        assert_eq!(eval_one(&m, "A2", &empty).unwrap(), EvalValue::Int(1));
        assert_eq!(eval_one(&m, "A3", &empty).unwrap(), EvalValue::Int(6));
        assert_eq!(eval_one(&m, "A4", &empty).unwrap(), EvalValue::Float(2.0));
    }

    #[test]
    fn string_concatenation_with_plus() {
        let mut m = HashMap::new();
        m.insert("A1".to_string(), "=\"foo\"+\"bar\"".to_string());
        let empty = EmptyValuesGetter;
        assert_eq!(eval_one(&m, "A1", &empty).unwrap(), EvalValue::Str("foobar".to_string()));
    }

    #[test]
    fn extracts_depending_on_identifiers_and_numeric_literals() {
        let ast = parse("B1+2*C1").unwrap();
        let deps = extract_depending_on_list(&ast);
        assert_eq!(deps, vec!["B1".to_string(), "2".to_string(), "C1".to_string()]);
    }

    #[test]
    fn extracts_external_ref_urls() {
        let ast = parse("external_ref(\"http://x/y\")+1").unwrap();
        let refs = extract_external_refs(&ast);
        assert_eq!(refs, vec!["http://x/y".to_string()]);
    }
}
