// Copyright 2025 Cornell University
// released under MIT License

//! The narrow interface to the expression micro-language.
//!
//! The translator only ever asks two questions of an expression string:
//! - which root variables does it read, and
//! - what value does it have given a snapshot of typed variable values.
//!
//! Anything implementing `Evaluator` with the documented numeric semantics
//! can be substituted for the reference `ScriptEvaluator`:
//! - integer arithmetic wraps at 64 bits, `/` is floor division and `%` the
//!   matching remainder,
//! - mixing integers and reals yields reals,
//! - indexing at or beyond the length of an array is an error,
//! - `a.length` and `len(a)` read array lengths,
//! - casts (`int8(x)`, `uint16(x)`, ...) wrap with two's complement.

use rustc_hash::FxHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::errors::ParseError;
use crate::parser::{parse_expression, Ast, BinOp, UnaryOp};
use crate::types::{IntWidth, Type};

#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Real(f64),
    Array(Vec<Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a.to_bits() == b.to_bits(),
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Real(r) => r.to_bits().hash(state),
            Value::Array(items) => items.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{:?}", r),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl Value {
    /// Default value of a leaf type: `false`, `0`, `0.0`, arrays filled to
    /// their bound, strings empty.
    pub fn default_for(tpe: &Type) -> Value {
        match tpe {
            Type::Bool => Value::Bool(false),
            Type::Int { .. } => Value::Int(0),
            Type::Float32 | Type::Float64 => Value::Real(0.0),
            Type::Str | Type::Struct(_) => Value::Array(vec![]),
            Type::Array { elem, bound, .. } => {
                Value::Array(vec![Value::default_for(elem); *bound as usize])
            }
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// Converts a value into the representation of `tpe`, wrapping integers
    pub fn convert(self, tpe: &Type) -> Result<Value, EvalError> {
        match (tpe, self) {
            (Type::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (Type::Int { signed, width }, Value::Int(i)) => int_of(i, *signed, *width, tpe),
            (Type::Int { signed, width }, Value::Real(r)) => {
                int_of(r.trunc() as i64, *signed, *width, tpe)
            }
            (Type::Float32 | Type::Float64, v) => v
                .as_real()
                .map(Value::Real)
                .ok_or_else(|| EvalError::Type(format!("expected a number for {}", tpe))),
            (Type::Str, v @ Value::Array(_)) => Ok(v),
            (Type::Array { elem, bound, .. }, Value::Array(items)) => {
                if items.len() > *bound as usize {
                    return Err(EvalError::OutOfBounds {
                        index: items.len() as i64,
                        len: *bound as usize,
                    });
                }
                let mut converted = items
                    .into_iter()
                    .map(|v| v.convert(elem))
                    .collect::<Result<Vec<_>, _>>()?;
                converted.resize(*bound as usize, Value::default_for(elem));
                Ok(Value::Array(converted))
            }
            (tpe, v) => Err(EvalError::Type(format!("cannot convert {} to {}", v, tpe))),
        }
    }
}

fn int_of(value: i64, signed: bool, width: IntWidth, tpe: &Type) -> Result<Value, EvalError> {
    let wrapped = wrap_int(value, signed, width);
    if fits_int(wrapped, signed, width) {
        Ok(Value::Int(wrapped))
    } else {
        Err(EvalError::Type(format!("{} does not fit in {}", value, tpe)))
    }
}

/// Two's-complement wraparound of `value` to the given width. 64-bit
/// integers are the target's unbounded integers and are never wrapped.
pub fn wrap_int(value: i64, signed: bool, width: IntWidth) -> i64 {
    let bits = width.bits();
    if bits == 64 {
        return value;
    }
    let modulus = 1i128 << bits;
    let mut v = (value as i128).rem_euclid(modulus);
    if signed && v >= modulus / 2 {
        v -= modulus;
    }
    v as i64
}

/// Whether `value` is representable without wrapping
pub fn fits_int(value: i64, signed: bool, width: IntWidth) -> bool {
    if width.bits() == 64 {
        signed || value >= 0
    } else {
        wrap_int(value, signed, width) == value
    }
}

pub fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

pub fn floor_rem(a: i64, b: i64) -> i64 {
    a.wrapping_sub(b.wrapping_mul(floor_div(a, b)))
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    Parse(ParseError),
    Unbound(String),
    Type(String),
    DivisionByZero,
    OutOfBounds { index: i64, len: usize },
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Parse(e) => write!(f, "{}", e),
            EvalError::Unbound(name) => write!(f, "`{}` has no value", name),
            EvalError::Type(details) => write!(f, "{}", details),
            EvalError::DivisionByZero => write!(f, "division by zero"),
            EvalError::OutOfBounds { index, len } => {
                write!(f, "index {} is outside of an array of length {}", index, len)
            }
        }
    }
}

/// Typed values of variables, keyed by (dotted) name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    values: FxHashMap<String, Value>,
}

impl Snapshot {
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

pub trait Evaluator {
    /// Evaluates `expr` against the variable values in `snapshot`
    fn evaluate(&self, expr: &str, snapshot: &Snapshot) -> Result<Value, EvalError>;

    /// Root variables read by `expr`, in order of first occurrence
    fn free_variables(&self, expr: &str) -> Result<Vec<String>, EvalError>;
}

/// Reference evaluator for the expression micro-language
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptEvaluator;

impl Evaluator for ScriptEvaluator {
    fn evaluate(&self, expr: &str, snapshot: &Snapshot) -> Result<Value, EvalError> {
        let ast = parse_expression(expr).map_err(EvalError::Parse)?;
        eval_ast(&ast, snapshot)
    }

    fn free_variables(&self, expr: &str) -> Result<Vec<String>, EvalError> {
        let ast = parse_expression(expr).map_err(EvalError::Parse)?;
        Ok(ast.free_roots())
    }
}

/// Dotted name of a pure member path (`a.b.c`), if `ast` is one
pub fn dotted_name(ast: &Ast) -> Option<String> {
    match ast {
        Ast::Ident(name) => Some(name.clone()),
        Ast::Member(base, field) => dotted_name(base).map(|b| format!("{b}.{field}")),
        _ => None,
    }
}

pub fn eval_ast(ast: &Ast, snapshot: &Snapshot) -> Result<Value, EvalError> {
    match ast {
        Ast::Bool(b) => Ok(Value::Bool(*b)),
        Ast::Int(i) => Ok(Value::Int(*i)),
        Ast::Real(r) => Ok(Value::Real(*r)),
        Ast::Str(s) => Ok(string_value(s)),
        Ast::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|i| eval_ast(i, snapshot))
                .collect::<Result<_, _>>()?,
        )),
        Ast::Ident(name) => snapshot
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::Unbound(name.clone())),
        Ast::Member(base, field) => {
            if let Some(value) = dotted_name(ast).and_then(|n| snapshot.get(&n).cloned()) {
                return Ok(value);
            }
            if field == "length" {
                return match eval_ast(base, snapshot)? {
                    Value::Array(items) => Ok(Value::Int(items.len() as i64)),
                    other => Err(EvalError::Type(format!("{} has no length", other))),
                };
            }
            Err(EvalError::Unbound(ast.to_string()))
        }
        Ast::Index(base, idx) => {
            let base = eval_ast(base, snapshot)?;
            let idx = eval_ast(idx, snapshot)?
                .as_int()
                .ok_or_else(|| EvalError::Type("array index must be an integer".to_string()))?;
            match base {
                Value::Array(items) => {
                    if idx < 0 || idx as usize >= items.len() {
                        Err(EvalError::OutOfBounds {
                            index: idx,
                            len: items.len(),
                        })
                    } else {
                        Ok(items[idx as usize].clone())
                    }
                }
                other => Err(EvalError::Type(format!("cannot index {}", other))),
            }
        }
        Ast::Unary(op, e) => {
            let v = eval_ast(e, snapshot)?;
            match (op, v) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, Value::Int(i)) => Ok(Value::Int(i.wrapping_neg())),
                (UnaryOp::Neg, Value::Real(r)) => Ok(Value::Real(-r)),
                (op, v) => Err(EvalError::Type(format!("cannot apply {} to {}", op, v))),
            }
        }
        Ast::Binary(BinOp::And, a, b) => {
            if eval_bool(a, snapshot)? {
                Ok(Value::Bool(eval_bool(b, snapshot)?))
            } else {
                Ok(Value::Bool(false))
            }
        }
        Ast::Binary(BinOp::Or, a, b) => {
            if eval_bool(a, snapshot)? {
                Ok(Value::Bool(true))
            } else {
                Ok(Value::Bool(eval_bool(b, snapshot)?))
            }
        }
        Ast::Binary(op, a, b) => {
            let a = eval_ast(a, snapshot)?;
            let b = eval_ast(b, snapshot)?;
            binary(*op, a, b)
        }
        Ast::Ternary(c, t, e) => {
            if eval_bool(c, snapshot)? {
                eval_ast(t, snapshot)
            } else {
                eval_ast(e, snapshot)
            }
        }
        Ast::Call(name, args) => {
            let args = args
                .iter()
                .map(|a| eval_ast(a, snapshot))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, args)
        }
    }
}

fn eval_bool(ast: &Ast, snapshot: &Snapshot) -> Result<bool, EvalError> {
    eval_ast(ast, snapshot)?
        .as_bool()
        .ok_or_else(|| EvalError::Type(format!("`{}` is not a boolean", ast)))
}

pub fn string_value(s: &str) -> Value {
    Value::Array(s.chars().map(|c| Value::Int(c as i64)).collect())
}

/// Applies a (non short-circuiting) binary operator
pub fn binary(op: BinOp, a: Value, b: Value) -> Result<Value, EvalError> {
    match (op, &a, &b) {
        (BinOp::Eq, _, _) => Ok(Value::Bool(values_equal(&a, &b))),
        (BinOp::Neq, _, _) => Ok(Value::Bool(!values_equal(&a, &b))),
        (_, Value::Int(x), Value::Int(y)) => {
            let (x, y) = (*x, *y);
            Ok(match op {
                BinOp::Add => Value::Int(x.wrapping_add(y)),
                BinOp::Sub => Value::Int(x.wrapping_sub(y)),
                BinOp::Mul => Value::Int(x.wrapping_mul(y)),
                BinOp::Div | BinOp::Rem if y == 0 => return Err(EvalError::DivisionByZero),
                BinOp::Div => Value::Int(floor_div(x, y)),
                BinOp::Rem => Value::Int(floor_rem(x, y)),
                BinOp::Lt => Value::Bool(x < y),
                BinOp::Le => Value::Bool(x <= y),
                BinOp::Gt => Value::Bool(x > y),
                BinOp::Ge => Value::Bool(x >= y),
                _ => return Err(EvalError::Type(format!("cannot apply {} to integers", op))),
            })
        }
        (_, Value::Int(_) | Value::Real(_), Value::Int(_) | Value::Real(_)) => {
            let (x, y) = (a.as_real().unwrap_or(0.0), b.as_real().unwrap_or(0.0));
            Ok(match op {
                BinOp::Add => Value::Real(x + y),
                BinOp::Sub => Value::Real(x - y),
                BinOp::Mul => Value::Real(x * y),
                BinOp::Div => Value::Real(x / y),
                BinOp::Rem => Value::Real(x - y * (x / y).floor()),
                BinOp::Lt => Value::Bool(x < y),
                BinOp::Le => Value::Bool(x <= y),
                BinOp::Gt => Value::Bool(x > y),
                BinOp::Ge => Value::Bool(x >= y),
                _ => return Err(EvalError::Type(format!("cannot apply {} to reals", op))),
            })
        }
        (BinOp::And, Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(*x && *y)),
        (BinOp::Or, Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(*x || *y)),
        _ => Err(EvalError::Type(format!("cannot apply {} to {} and {}", op, a, b))),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(_) | Value::Real(_), Value::Int(_) | Value::Real(_)) => {
            match (a, b) {
                (Value::Int(x), Value::Int(y)) => x == y,
                _ => a.as_real() == b.as_real(),
            }
        }
        _ => a == b,
    }
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(EvalError::Type(format!(
                "{} expects {} argument(s), got {}",
                name,
                n,
                args.len()
            )))
        }
    };
    let real = |v: &Value| {
        v.as_real()
            .ok_or_else(|| EvalError::Type(format!("{} expects numbers", name)))
    };
    if let Some(tpe) = Type::parse(name, 1).filter(Type::is_scalar) {
        arity(1)?;
        return args[0].clone().convert(&tpe);
    }
    match name {
        "abs" => {
            arity(1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
                v => Ok(Value::Real(real(v)?.abs())),
            }
        }
        "floor" | "ceil" => {
            arity(1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(*i)),
                v => {
                    let r = real(v)?;
                    Ok(Value::Int(if name == "floor" { r.floor() } else { r.ceil() } as i64))
                }
            }
        }
        "min" | "max" => {
            arity(2)?;
            let pick_first = match (&args[0], &args[1]) {
                (Value::Int(a), Value::Int(b)) => (a <= b) == (name == "min"),
                (a, b) => (real(a)? <= real(b)?) == (name == "min"),
            };
            Ok(if pick_first {
                args[0].clone()
            } else {
                args[1].clone()
            })
        }
        "pow" => {
            arity(2)?;
            Ok(Value::Real(real(&args[0])?.powf(real(&args[1])?)))
        }
        "sqrt" | "sin" | "cos" | "log" => {
            arity(1)?;
            let x = real(&args[0])?;
            Ok(Value::Real(match name {
                "sqrt" => x.sqrt(),
                "sin" => x.sin(),
                "cos" => x.cos(),
                _ => x.ln(),
            }))
        }
        "len" => {
            arity(1)?;
            match &args[0] {
                Value::Array(items) => Ok(Value::Int(items.len() as i64)),
                v => Err(EvalError::Type(format!("{} has no length", v))),
            }
        }
        _ => Err(EvalError::Type(format!("unknown function `{}`", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(text: &str, snapshot: &Snapshot) -> Result<Value, EvalError> {
        ScriptEvaluator.evaluate(text, snapshot)
    }

    #[test]
    fn integer_semantics() {
        let s = Snapshot::default();
        assert_eq!(eval("7 / 2", &s), Ok(Value::Int(3)));
        assert_eq!(eval("-7 / 2", &s), Ok(Value::Int(-4)));
        assert_eq!(eval("-7 % 2", &s), Ok(Value::Int(1)));
        assert_eq!(eval("1 / 0", &s), Err(EvalError::DivisionByZero));
        assert_eq!(eval("int8(127 + 1)", &s), Ok(Value::Int(-128)));
        assert_eq!(eval("uint8(-1)", &s), Ok(Value::Int(255)));
        assert_eq!(eval("1 + 0.5", &s), Ok(Value::Real(1.5)));
        assert_eq!(eval("2 == 2.0", &s), Ok(Value::Bool(true)));
    }

    #[test]
    fn wraparound() {
        assert_eq!(wrap_int(300, false, IntWidth::W8), 44);
        assert_eq!(wrap_int(-129, true, IntWidth::W8), 127);
        assert_eq!(wrap_int(65535, true, IntWidth::W16), -1);
        assert_eq!(wrap_int(i64::MIN, true, IntWidth::W64), i64::MIN);
        assert_eq!(wrap_int(-5, false, IntWidth::W64), -5);
        assert!(fits_int(-5, true, IntWidth::W64));
        assert!(!fits_int(-5, false, IntWidth::W64));
        assert!(!fits_int(256, false, IntWidth::W8));
        assert!(Value::Int(-1).convert(&Type::int(false, IntWidth::W64)).is_err());
        assert_eq!(Value::Int(-1).convert(&Type::int(false, IntWidth::W32)), Ok(Value::Int(4294967295)));
    }

    #[test]
    fn arrays_and_paths() {
        let mut s = Snapshot::default();
        s.insert("a", Value::Array(vec![Value::Int(4), Value::Int(5)]));
        s.insert("p.x", Value::Real(1.0));
        assert_eq!(eval("a[1] + a.length", &s), Ok(Value::Int(7)));
        assert_eq!(eval("p.x * 2", &s), Ok(Value::Real(2.0)));
        assert_eq!(
            eval("a[2]", &s),
            Err(EvalError::OutOfBounds { index: 2, len: 2 })
        );
        assert_eq!(eval("b", &s), Err(EvalError::Unbound("b".to_string())));
        assert_eq!(eval("max(len(a), 1)", &s), Ok(Value::Int(2)));
    }

    #[test]
    fn short_circuit_and_free_variables() {
        let s = Snapshot::default();
        assert_eq!(eval("false && undefined", &s), Ok(Value::Bool(false)));
        assert_eq!(
            ScriptEvaluator.free_variables("x + y[z] > x").unwrap(),
            vec!["x", "y", "z"]
        );
    }

    #[test]
    fn convert_pads_arrays() {
        let tpe = Type::fixed_array(Type::int(false, IntWidth::W8), 3);
        let v = Value::Array(vec![Value::Int(256)]).convert(&tpe).unwrap();
        assert_eq!(
            v,
            Value::Array(vec![Value::Int(0), Value::Int(0), Value::Int(0)])
        );
    }
}
