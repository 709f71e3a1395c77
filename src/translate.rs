// Copyright 2025 Cornell University
// released under MIT License

//! Resolves expression text against a namespace of typed variables and
//! produces expressions over flattened leaf variables.
//!
//! Integer policy: literals take the type of the other operand, mixed
//! widths widen to the wider operand (signed wins on equal width) and every
//! stored result of integer arithmetic is wrapped to its width. Narrowing
//! and sign changes need an explicit cast such as `int8(x)`.
//!
//! 64-bit integers are the target's unbounded integers and never wrap.
//! `int64` arithmetic is stored as computed. `uint64` cannot stay
//! non-negative without a wraparound, so it only takes unsigned variables
//! and non-negative literals; arithmetic or signed values stored into it
//! are rejected.

use rustc_hash::FxHashMap;

use crate::errors::{CompileError, CompileResult, StructuralError, TypeError};
use crate::eval::{self, fits_int, wrap_int, Value};
use crate::network::{Expr, Func, LValue, Op};
use crate::parser::{parse_expression, Ast, BinOp, UnaryOp};
use crate::types::{IntWidth, StructRegistry, Type};

/// String literals are interned as integers. The empty string is `0`.
#[derive(Debug, Clone, Default)]
pub struct StringTable {
    ids: FxHashMap<String, i64>,
}

impl StringTable {
    pub fn id(&mut self, text: &str) -> i64 {
        if text.is_empty() {
            return 0;
        }
        let next = self.ids.len() as i64 + 1;
        *self.ids.entry(text.to_string()).or_insert(next)
    }

    /// Interned strings ordered by id
    pub fn entries(&self) -> Vec<(i64, &str)> {
        let mut out: Vec<_> = self.ids.iter().map(|(s, id)| (*id, s.as_str())).collect();
        out.sort();
        out
    }
}

/// A translated expression with its static type
#[derive(Debug, Clone, PartialEq)]
pub struct Typed {
    pub expr: Expr,
    pub tpe: Type,
    /// Built from literals only; adapts to the type of the other operand
    pub literal: bool,
    /// Contains integer arithmetic or a conversion
    pub arith: bool,
}

impl Typed {
    fn literal(expr: Expr, tpe: Type) -> Self {
        Self {
            expr,
            tpe,
            literal: true,
            arith: false,
        }
    }

    fn derived(expr: Expr, tpe: Type, arith: bool) -> Self {
        Self {
            expr,
            tpe,
            literal: false,
            arith,
        }
    }
}

/// What a name stands for
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Stored in the leaves below `path`
    Stored {
        path: String,
        tpe: Type,
        writable: bool,
    },
    /// Inlined wherever it is used
    Constant(Typed),
}

impl Binding {
    pub fn stored(path: impl Into<String>, tpe: Type, writable: bool) -> Self {
        Binding::Stored {
            path: path.into(),
            tpe,
            writable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// A name path that still refers to storage
#[derive(Debug, Clone)]
struct Place {
    path: String,
    tpe: Type,
    indices: Vec<Expr>,
    writable: bool,
    /// Length leaves to extend when writing through this place
    grows: Vec<(LValue, Expr)>,
}

impl Place {
    fn lvalue(&self) -> LValue {
        LValue {
            name: self.path.clone(),
            indices: self.indices.clone(),
        }
    }

    fn load_leaf(&self, suffix: &str) -> Expr {
        indexed(&format!("{}{}", self.path, suffix), &self.indices)
    }
}

enum Resolved {
    Place(Place),
    Value(Typed),
}

/// Wraps `expr` to a fixed width. 64-bit integers are left alone.
fn wrap(signed: bool, width: IntWidth, expr: Expr) -> Expr {
    if width.bits() == 64 {
        expr
    } else {
        Expr::Wrap {
            signed,
            bits: width.bits(),
            value: Box::new(expr),
        }
    }
}

fn is_uint64(tpe: &Type) -> bool {
    matches!(
        tpe,
        Type::Int {
            signed: false,
            width: IntWidth::W64
        }
    )
}

fn unbounded_unsigned(operation: &str) -> CompileError {
    TypeError::mismatch(
        operation,
        "uint64 has no wraparound, only unsigned variables and non-negative literals fit",
    )
    .into()
}

fn indexed(name: &str, indices: &[Expr]) -> Expr {
    indices
        .iter()
        .fold(Expr::var(name), |acc, idx| Expr::index(acc, idx.clone()))
}

fn is_composite(tpe: &Type) -> bool {
    match tpe {
        Type::Struct(_) => true,
        Type::Array { elem, .. } => is_composite(elem),
        _ => false,
    }
}

/// Value of a fresh leaf of type `tpe`
pub fn default_expr(tpe: &Type) -> Expr {
    match tpe {
        Type::Bool => Expr::Bool(false),
        Type::Int { .. } | Type::Str | Type::Struct(_) => Expr::Int(0),
        Type::Float32 | Type::Float64 => Expr::Real(0.0),
        Type::Array { elem, bound, .. } => Expr::Array(vec![default_expr(elem); *bound as usize]),
    }
}

/// `0 <= idx < upper`, dropping the lower bound for constants
fn in_range(idx: &Expr, upper: Expr) -> Expr {
    let below = Expr::binary(Op::Lt, idx.clone(), upper);
    match idx {
        Expr::Int(_) => below,
        _ => Expr::and(Expr::binary(Op::Le, Expr::Int(0), idx.clone()), below),
    }
}

fn literal_int_type(value: i64) -> Type {
    if i32::try_from(value).is_ok() {
        Type::int32()
    } else {
        Type::int(true, IntWidth::W64)
    }
}

fn numeric_join(a: &Typed, b: &Typed) -> Type {
    match (&a.tpe, &b.tpe) {
        (
            Type::Int {
                signed: s1,
                width: w1,
            },
            Type::Int {
                signed: s2,
                width: w2,
            },
        ) => {
            if a.literal && !b.literal {
                b.tpe.clone()
            } else if b.literal && !a.literal {
                a.tpe.clone()
            } else {
                Type::int(*s1 || *s2, (*w1).max(*w2))
            }
        }
        (Type::Float32, Type::Float32) => Type::Float32,
        (Type::Float32, Type::Int { .. }) if b.literal => Type::Float32,
        (Type::Int { .. }, Type::Float32) if a.literal => Type::Float32,
        _ => Type::Float64,
    }
}

/// Folds operations on constants with the reference evaluator
fn fold(op: BinOp, a: &Expr, b: &Expr) -> Option<Expr> {
    let value = |e: &Expr| match e {
        Expr::Int(i) => Some(Value::Int(*i)),
        Expr::Real(r) => Some(Value::Real(*r)),
        _ => None,
    };
    match eval::binary(op, value(a)?, value(b)?).ok()? {
        Value::Int(i) => Some(Expr::Int(i)),
        Value::Real(r) => Some(Expr::Real(r)),
        Value::Bool(b) => Some(Expr::Bool(b)),
        Value::Array(_) => None,
    }
}

pub struct Translator<'a> {
    structs: &'a StructRegistry,
    globals: &'a FxHashMap<String, Binding>,
    strings: &'a mut StringTable,
    locals: FxHashMap<String, Binding>,
    /// Pseudo-variables of the transition being translated
    aliases: FxHashMap<String, Binding>,
    /// Conditions under which the current subexpression is evaluated
    context: Vec<Expr>,
    checks: Vec<Expr>,
    checked: bool,
}

impl<'a> Translator<'a> {
    pub fn new(
        structs: &'a StructRegistry,
        globals: &'a FxHashMap<String, Binding>,
        strings: &'a mut StringTable,
    ) -> Self {
        Self {
            structs,
            globals,
            strings,
            locals: FxHashMap::default(),
            aliases: FxHashMap::default(),
            context: vec![],
            checks: vec![],
            checked: false,
        }
    }

    pub fn structs(&self) -> &StructRegistry {
        self.structs
    }

    pub fn bind_local(&mut self, name: &str, binding: Binding) {
        self.locals.insert(name.to_string(), binding);
    }

    pub fn set_aliases(&mut self, aliases: Vec<(String, Binding)>) {
        self.aliases = aliases.into_iter().collect();
    }

    /// Run-time conditions (out-of-bounds accesses) collected since the
    /// last call. Each must hold for the accesses to be valid.
    pub fn take_checks(&mut self) -> Vec<Expr> {
        std::mem::take(&mut self.checks)
    }

    /// `true` once any expression needed a run-time bounds check
    pub fn has_checks(&self) -> bool {
        self.checked
    }

    fn lookup(&self, name: &str) -> CompileResult<Binding> {
        self.aliases
            .get(name)
            .or_else(|| self.locals.get(name))
            .or_else(|| self.globals.get(name))
            .cloned()
            .ok_or_else(|| StructuralError::unresolved(name).into())
    }

    fn check(&mut self, cond: Expr) {
        self.checked = true;
        let reached = Expr::conjunction(self.context.iter().cloned());
        self.checks.push(Expr::or(Expr::not(reached), cond));
    }

    /// Translates `text` into a typed expression
    pub fn expression(&mut self, text: &str) -> CompileResult<Typed> {
        let ast = parse_expression(text)?;
        self.translate(&ast)
    }

    /// Translates a guard or branch condition
    pub fn condition(&mut self, text: &str) -> CompileResult<Expr> {
        let typed = self.expression(text)?;
        if typed.tpe != Type::Bool {
            return Err(TypeError::mismatch(
                "condition",
                format!("`{}` has type {}, expected bool", text, typed.tpe),
            )
            .into());
        }
        Ok(typed.expr)
    }

    /// A literal of type `tpe`, used to inline constant ports
    pub fn constant(&mut self, text: &str, tpe: &Type) -> CompileResult<Typed> {
        let typed = self.expression(text)?;
        if !typed.literal {
            return Err(TypeError::mismatch(
                "constant",
                format!("`{}` is not a literal", text),
            )
            .into());
        }
        let expr = self.convert(tpe, typed, text)?;
        Ok(Typed::literal(expr, tpe.clone()))
    }

    /// Writes performed by `target = value`, all of them simultaneous
    pub fn assignment(&mut self, target: &str, value: &str) -> CompileResult<Vec<(LValue, Expr)>> {
        let target_ast = parse_expression(target)?;
        let value_ast = parse_expression(value)?;
        let place = match self.resolve(&target_ast, Access::Write)? {
            Resolved::Place(place) => place,
            Resolved::Value(_) => {
                return Err(TypeError::mismatch(
                    "assignment",
                    format!("`{}` does not name a variable", target),
                )
                .into())
            }
        };
        if !place.writable {
            return Err(StructuralError::read_only(&place.path).into());
        }
        self.store(place, &value_ast, target)
    }

    /// Writes storing `value` into the variable (or leaf prefix) `path`,
    /// used for initial values and message payloads.
    pub fn store_into(
        &mut self,
        path: &str,
        tpe: &Type,
        value: &str,
    ) -> CompileResult<Vec<(LValue, Expr)>> {
        let value_ast = parse_expression(value)?;
        let place = Place {
            path: path.to_string(),
            tpe: tpe.clone(),
            indices: vec![],
            writable: true,
            grows: vec![],
        };
        self.store(place, &value_ast, path)
    }

    fn store(
        &mut self,
        place: Place,
        value: &Ast,
        target: &str,
    ) -> CompileResult<Vec<(LValue, Expr)>> {
        let mut writes = vec![];
        if is_composite(&place.tpe) {
            let source = match self.resolve(value, Access::Read)? {
                Resolved::Place(source) if source.tpe == place.tpe => source,
                Resolved::Place(source) => {
                    return Err(TypeError::mismatch(
                        "assignment",
                        format!("cannot store {} in `{}` of type {}", source.tpe, target, place.tpe),
                    )
                    .into())
                }
                Resolved::Value(v) => {
                    return Err(TypeError::mismatch(
                        "assignment",
                        format!("cannot store {} in `{}` of type {}", v.tpe, target, place.tpe),
                    )
                    .into())
                }
            };
            for leaf in self.structs.leaves("", &place.tpe)? {
                writes.push((
                    LValue {
                        name: format!("{}{}", place.path, leaf.path),
                        indices: place.indices.clone(),
                    },
                    source.load_leaf(&leaf.path),
                ));
            }
        } else if let Type::Array { .. } = &place.tpe {
            writes.extend(self.store_array(&place, value, target)?);
        } else {
            let typed = self.translate(value)?;
            let expr = self.convert(&place.tpe, typed, target)?;
            writes.push((place.lvalue(), expr));
        }
        for (len, idx) in place.grows {
            let current = indexed(&len.name, &len.indices);
            let next = Expr::binary(
                Op::Max,
                current,
                Expr::binary(Op::Add, idx, Expr::Int(1)),
            );
            writes.push((len, next));
        }
        Ok(writes)
    }

    fn store_array(
        &mut self,
        place: &Place,
        value: &Ast,
        target: &str,
    ) -> CompileResult<Vec<(LValue, Expr)>> {
        let Type::Array {
            elem,
            bound,
            dynamic,
        } = &place.tpe
        else {
            return Ok(vec![]);
        };
        let len_target = LValue {
            name: format!("{}.len", place.path),
            indices: place.indices.clone(),
        };
        let mut writes = vec![];
        match self.resolve(value, Access::Read)? {
            Resolved::Place(source) => {
                let Type::Array {
                    elem: src_elem,
                    bound: src_bound,
                    dynamic: src_dynamic,
                } = &source.tpe
                else {
                    return Err(self.width_mismatch(target, &place.tpe, &source.tpe));
                };
                if !elem.accepts(src_elem) {
                    return Err(self.width_mismatch(target, &place.tpe, &source.tpe));
                }
                let data = source.load_leaf("");
                if src_bound == bound {
                    writes.push((place.lvalue(), data));
                } else {
                    for k in 0..*bound {
                        let mut lv = place.lvalue();
                        lv.indices.push(Expr::Int(k as i64));
                        let v = if k < *src_bound {
                            Expr::index(data.clone(), Expr::Int(k as i64))
                        } else {
                            default_expr(elem)
                        };
                        writes.push((lv, v));
                    }
                }
                if *dynamic {
                    let len = if *src_dynamic {
                        source.load_leaf(".len")
                    } else {
                        Expr::Int(*src_bound as i64)
                    };
                    let len = if src_bound > bound {
                        Expr::binary(Op::Min, len, Expr::Int(*bound as i64))
                    } else {
                        len
                    };
                    writes.push((len_target, len));
                }
            }
            Resolved::Value(typed) => {
                let Type::Array {
                    elem: src_elem,
                    bound: src_bound,
                    ..
                } = &typed.tpe
                else {
                    return Err(self.width_mismatch(target, &place.tpe, &typed.tpe));
                };
                if *src_bound > *bound {
                    return Err(TypeError::IndexOutOfBounds {
                        expr: target.to_string(),
                        index: *src_bound as i64,
                        bound: *bound,
                    }
                    .into());
                }
                let items = match typed.expr {
                    Expr::Array(items) => items,
                    other => {
                        return Err(TypeError::mismatch(
                            "assignment",
                            format!("`{}` is not an array literal", other),
                        )
                        .into())
                    }
                };
                let mut converted = vec![];
                for item in items {
                    let item = Typed {
                        expr: item,
                        tpe: src_elem.as_ref().clone(),
                        literal: typed.literal,
                        arith: false,
                    };
                    converted.push(self.convert(elem, item, target)?);
                }
                let len = converted.len();
                converted.resize(*bound as usize, default_expr(elem));
                writes.push((place.lvalue(), Expr::Array(converted)));
                if *dynamic {
                    writes.push((len_target, Expr::Int(len as i64)));
                }
            }
        }
        Ok(writes)
    }

    fn width_mismatch(&self, target: &str, expected: &Type, found: &Type) -> CompileError {
        TypeError::WidthMismatch {
            target: target.to_string(),
            expected: expected.clone(),
            found: found.clone(),
        }
        .into()
    }

    /// Checks that `value` may be stored in a leaf of type `tpe` and wraps
    /// integer arithmetic to its width.
    fn convert(&self, tpe: &Type, value: Typed, target: &str) -> CompileResult<Expr> {
        let wrapped = |value: Typed| match value.tpe {
            Type::Int { signed, width }
                if value.arith && !matches!(value.expr, Expr::Wrap { .. }) =>
            {
                wrap(signed, width, value.expr)
            }
            _ => value.expr,
        };
        let found = value.tpe.clone();
        match (tpe, &found) {
            (Type::Int { signed, width }, Type::Int { .. }) => {
                if let (true, Expr::Int(k)) = (value.literal, &value.expr) {
                    if fits_int(*k, *signed, *width) {
                        return Ok(Expr::Int(*k));
                    }
                    return Err(self.width_mismatch(target, tpe, &found));
                }
                if !tpe.accepts(&found) {
                    return Err(self.width_mismatch(target, tpe, &found));
                }
                if value.arith && is_uint64(tpe) {
                    return Err(unbounded_unsigned(&format!("store into `{}`", target)));
                }
                Ok(wrapped(value))
            }
            (Type::Float32 | Type::Float64, _) if found.is_numeric() => {
                if value.literal || tpe.accepts(&found) {
                    Ok(wrapped(value))
                } else {
                    Err(self.width_mismatch(target, tpe, &found))
                }
            }
            (Type::Bool, Type::Bool) | (Type::Str, Type::Str) => Ok(value.expr),
            (expected, _) => Err(self.width_mismatch(target, expected, &found)),
        }
    }

    fn length(&self, place: &Place) -> Typed {
        match &place.tpe {
            Type::Array {
                dynamic: true, ..
            } => Typed::derived(place.load_leaf(".len"), Type::int32(), false),
            Type::Array { bound, .. } => Typed::literal(Expr::Int(*bound as i64), Type::int32()),
            _ => Typed::literal(Expr::Int(0), Type::int32()),
        }
    }

    fn resolve(&mut self, ast: &Ast, access: Access) -> CompileResult<Resolved> {
        match ast {
            Ast::Ident(name) => match self.lookup(name)? {
                Binding::Stored {
                    path,
                    tpe,
                    writable,
                } => Ok(Resolved::Place(Place {
                    path,
                    tpe,
                    indices: vec![],
                    writable,
                    grows: vec![],
                })),
                Binding::Constant(typed) => Ok(Resolved::Value(typed)),
            },
            Ast::Member(base, field) => match self.resolve(base, access)? {
                Resolved::Place(place) => match &place.tpe {
                    Type::Struct(name) => {
                        let def = self
                            .structs
                            .get(name)
                            .ok_or_else(|| TypeError::unknown_type(name))?;
                        let tpe = def.field(field).cloned().ok_or_else(|| {
                            TypeError::UnknownField {
                                field: field.clone(),
                                struct_name: name.clone(),
                            }
                        })?;
                        Ok(Resolved::Place(Place {
                            path: format!("{}.{}", place.path, field),
                            tpe,
                            ..place
                        }))
                    }
                    Type::Array { .. } if field == "length" => {
                        Ok(Resolved::Value(self.length(&place)))
                    }
                    other => Err(TypeError::FieldOnNonStruct {
                        field: field.clone(),
                        found: other.clone(),
                    }
                    .into()),
                },
                Resolved::Value(typed) => match &typed.tpe {
                    Type::Array { bound, .. } if field == "length" => Ok(Resolved::Value(
                        Typed::literal(Expr::Int(*bound as i64), Type::int32()),
                    )),
                    other => Err(TypeError::FieldOnNonStruct {
                        field: field.clone(),
                        found: other.clone(),
                    }
                    .into()),
                },
            },
            Ast::Index(base, idx) => {
                let resolved = self.resolve(base, access)?;
                let index = self.translate(idx)?;
                if !index.tpe.is_int() {
                    return Err(TypeError::mismatch(
                        "array index",
                        format!("`{}` has type {}", idx, index.tpe),
                    )
                    .into());
                }
                match resolved {
                    Resolved::Place(mut place) => {
                        let Type::Array {
                            elem,
                            bound,
                            dynamic,
                        } = place.tpe.clone()
                        else {
                            return Err(TypeError::IndexOnNonArray {
                                expr: base.to_string(),
                                found: place.tpe,
                            }
                            .into());
                        };
                        let constant = match index.expr {
                            Expr::Int(k) => {
                                if k < 0 || k >= bound as i64 {
                                    return Err(TypeError::IndexOutOfBounds {
                                        expr: ast.to_string(),
                                        index: k,
                                        bound,
                                    }
                                    .into());
                                }
                                true
                            }
                            _ => false,
                        };
                        match access {
                            Access::Read => {
                                if dynamic {
                                    let len = self.length(&place).expr;
                                    self.check(in_range(&index.expr, len));
                                } else if !constant {
                                    self.check(in_range(&index.expr, Expr::Int(bound as i64)));
                                }
                            }
                            Access::Write => {
                                if !constant {
                                    self.check(in_range(&index.expr, Expr::Int(bound as i64)));
                                }
                                if dynamic {
                                    let len = LValue {
                                        name: format!("{}.len", place.path),
                                        indices: place.indices.clone(),
                                    };
                                    place.grows.push((len, index.expr.clone()));
                                }
                            }
                        }
                        place.indices.push(index.expr);
                        place.tpe = *elem;
                        Ok(Resolved::Place(place))
                    }
                    Resolved::Value(typed) => match typed.tpe {
                        Type::Array { elem, .. } => Ok(Resolved::Value(Typed::derived(
                            Expr::index(typed.expr, index.expr),
                            *elem,
                            typed.arith,
                        ))),
                        other => Err(TypeError::IndexOnNonArray {
                            expr: base.to_string(),
                            found: other,
                        }
                        .into()),
                    },
                }
            }
            other => Ok(Resolved::Value(self.translate(other)?)),
        }
    }

    fn load(&self, place: Place) -> CompileResult<Typed> {
        if is_composite(&place.tpe) {
            return Err(TypeError::mismatch(
                "expression",
                format!(
                    "`{}` has type {}, which can only be copied as a whole",
                    place.path, place.tpe
                ),
            )
            .into());
        }
        Ok(Typed::derived(place.load_leaf(""), place.tpe, false))
    }

    fn expect_bool(&self, typed: &Typed, ast: &Ast) -> CompileResult<()> {
        if typed.tpe == Type::Bool {
            Ok(())
        } else {
            Err(TypeError::mismatch(
                "logical operator",
                format!("`{}` has type {}, expected bool", ast, typed.tpe),
            )
            .into())
        }
    }

    /// Common type of two branches of a conditional or array literal
    fn join(&self, a: &Typed, b: &Typed, what: &str) -> CompileResult<Type> {
        if a.tpe.is_numeric() && b.tpe.is_numeric() {
            Ok(numeric_join(a, b))
        } else if a.tpe == b.tpe {
            Ok(a.tpe.clone())
        } else {
            Err(TypeError::mismatch(what, format!("{} and {}", a.tpe, b.tpe)).into())
        }
    }

    fn translate(&mut self, ast: &Ast) -> CompileResult<Typed> {
        match ast {
            Ast::Bool(b) => Ok(Typed::literal(Expr::Bool(*b), Type::Bool)),
            Ast::Int(i) => Ok(Typed::literal(Expr::Int(*i), literal_int_type(*i))),
            Ast::Real(r) => Ok(Typed::literal(Expr::Real(*r), Type::Float64)),
            Ast::Str(s) => Ok(Typed::literal(Expr::Int(self.strings.id(s)), Type::Str)),
            Ast::Array(items) => {
                let mut translated: Vec<Typed> = vec![];
                for item in items {
                    translated.push(self.translate(item)?);
                }
                let mut elem = translated
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Typed::literal(Expr::Int(0), Type::int32()));
                for item in translated.iter().skip(1) {
                    let tpe = self.join(&elem, item, "array literal")?;
                    elem = Typed {
                        tpe,
                        literal: elem.literal && item.literal,
                        ..elem
                    };
                }
                let literal = translated.iter().all(|t| t.literal);
                Ok(Typed {
                    expr: Expr::Array(translated.into_iter().map(|t| t.expr).collect()),
                    tpe: Type::fixed_array(elem.tpe, items.len() as u32),
                    literal,
                    arith: false,
                })
            }
            Ast::Ident(_) | Ast::Member(..) | Ast::Index(..) => {
                match self.resolve(ast, Access::Read)? {
                    Resolved::Place(place) => self.load(place),
                    Resolved::Value(typed) => Ok(typed),
                }
            }
            Ast::Unary(UnaryOp::Not, e) => {
                let inner = self.translate(e)?;
                self.expect_bool(&inner, e)?;
                Ok(Typed {
                    expr: Expr::not(inner.expr),
                    ..inner
                })
            }
            Ast::Unary(UnaryOp::Neg, e) => {
                let inner = self.translate(e)?;
                if !inner.tpe.is_numeric() {
                    return Err(TypeError::mismatch(
                        "negation",
                        format!("`{}` has type {}", e, inner.tpe),
                    )
                    .into());
                }
                Ok(Typed {
                    expr: Expr::Neg(Box::new(inner.expr)),
                    arith: true,
                    ..inner
                })
            }
            Ast::Binary(op @ (BinOp::And | BinOp::Or), a, b) => {
                let lhs = self.translate(a)?;
                self.expect_bool(&lhs, a)?;
                // the right operand only runs when the left does not decide
                let reached = if *op == BinOp::And {
                    lhs.expr.clone()
                } else {
                    Expr::not(lhs.expr.clone())
                };
                self.context.push(reached);
                let rhs = self.translate(b);
                self.context.pop();
                let rhs = rhs?;
                self.expect_bool(&rhs, b)?;
                let expr = if *op == BinOp::And {
                    Expr::and(lhs.expr, rhs.expr)
                } else {
                    Expr::or(lhs.expr, rhs.expr)
                };
                Ok(Typed {
                    expr,
                    tpe: Type::Bool,
                    literal: lhs.literal && rhs.literal,
                    arith: false,
                })
            }
            Ast::Binary(op, a, b) => {
                let lhs = self.translate(a)?;
                let rhs = self.translate(b)?;
                if op.is_comparison() {
                    self.comparison(*op, lhs, rhs, ast)
                } else {
                    self.arithmetic(*op, lhs, rhs, ast)
                }
            }
            Ast::Ternary(c, t, e) => {
                let cond = self.translate(c)?;
                self.expect_bool(&cond, c)?;
                self.context.push(cond.expr.clone());
                let then = self.translate(t);
                self.context.pop();
                let then = then?;
                self.context.push(Expr::not(cond.expr.clone()));
                let otherwise = self.translate(e);
                self.context.pop();
                let otherwise = otherwise?;
                let tpe = self.join(&then, &otherwise, "conditional expression")?;
                Ok(Typed {
                    literal: then.literal && otherwise.literal,
                    arith: then.arith || otherwise.arith,
                    expr: Expr::Ite(
                        Box::new(cond.expr),
                        Box::new(then.expr),
                        Box::new(otherwise.expr),
                    ),
                    tpe,
                })
            }
            Ast::Call(name, args) => self.call(name, args, ast),
        }
    }

    fn comparison(&self, op: BinOp, a: Typed, b: Typed, ast: &Ast) -> CompileResult<Typed> {
        let equality = matches!(op, BinOp::Eq | BinOp::Neq);
        let ok = (a.tpe.is_numeric() && b.tpe.is_numeric())
            || (equality
                && a.tpe == b.tpe
                && matches!(a.tpe, Type::Bool | Type::Str));
        if !ok {
            return Err(TypeError::mismatch(
                &format!("`{}`", op),
                format!("`{}` compares {} with {}", ast, a.tpe, b.tpe),
            )
            .into());
        }
        let net_op = match op {
            BinOp::Eq => Op::Eq,
            BinOp::Neq => Op::Neq,
            BinOp::Lt => Op::Lt,
            BinOp::Le => Op::Le,
            BinOp::Gt => Op::Gt,
            _ => Op::Ge,
        };
        let literal = a.literal && b.literal;
        let expr = fold(op, &a.expr, &b.expr)
            .unwrap_or_else(|| Expr::binary(net_op, a.expr, b.expr));
        Ok(Typed {
            expr,
            tpe: Type::Bool,
            literal,
            arith: false,
        })
    }

    fn arithmetic(&self, op: BinOp, a: Typed, b: Typed, ast: &Ast) -> CompileResult<Typed> {
        if !(a.tpe.is_numeric() && b.tpe.is_numeric()) {
            return Err(TypeError::mismatch(
                &format!("`{}`", op),
                format!("`{}` combines {} with {}", ast, a.tpe, b.tpe),
            )
            .into());
        }
        let tpe = numeric_join(&a, &b);
        let net_op = match op {
            BinOp::Add => Op::Add,
            BinOp::Sub => Op::Sub,
            BinOp::Mul => Op::Mul,
            BinOp::Div if tpe.is_int() => Op::FloorDiv,
            BinOp::Div => Op::Div,
            _ => Op::Rem,
        };
        if tpe.is_int() && matches!(op, BinOp::Div | BinOp::Rem) && b.expr == Expr::Int(0) {
            return Err(TypeError::mismatch("division", format!("`{}` divides by zero", ast)).into());
        }
        let literal = a.literal && b.literal;
        let expr = fold(op, &a.expr, &b.expr)
            .unwrap_or_else(|| Expr::binary(net_op, a.expr, b.expr));
        Ok(Typed {
            expr,
            tpe,
            literal,
            arith: true,
        })
    }

    fn call(&mut self, name: &str, args: &[Ast], ast: &Ast) -> CompileResult<Typed> {
        let arity = |n: usize| -> CompileResult<()> {
            if args.len() == n {
                Ok(())
            } else {
                Err(TypeError::mismatch(
                    &format!("`{}`", name),
                    format!("expected {} argument(s), got {}", n, args.len()),
                )
                .into())
            }
        };
        if name == "len" {
            arity(1)?;
            return match self.resolve(&args[0], Access::Read)? {
                Resolved::Place(place) if matches!(place.tpe, Type::Array { .. }) => {
                    Ok(self.length(&place))
                }
                Resolved::Value(Typed {
                    tpe: Type::Array { bound, .. },
                    ..
                }) => Ok(Typed::literal(Expr::Int(bound as i64), Type::int32())),
                _ => Err(TypeError::mismatch("`len`", format!("`{}` is not an array", args[0])).into()),
            };
        }
        let mut translated = vec![];
        for arg in args {
            translated.push(self.translate(arg)?);
        }
        for (arg, typed) in args.iter().zip(&translated) {
            if !typed.tpe.is_numeric() {
                return Err(TypeError::mismatch(
                    &format!("`{}`", name),
                    format!("`{}` has type {}, expected a number", arg, typed.tpe),
                )
                .into());
            }
        }
        let mut translated = translated.into_iter();
        let mut next = || {
            translated
                .next()
                .ok_or_else(|| TypeError::mismatch(&format!("`{}`", name), "missing argument"))
        };

        if let Some(tpe) = Type::parse(name, 1).filter(|t| t.is_numeric()) {
            arity(1)?;
            let value = next()?;
            let cast = format!("`{}`", name);
            return Ok(match (&tpe, &value.tpe) {
                (Type::Int { signed, width }, Type::Int { .. }) => match value.expr {
                    Expr::Int(k) => {
                        let k = wrap_int(k, *signed, *width);
                        if !fits_int(k, *signed, *width) {
                            return Err(unbounded_unsigned(&cast));
                        }
                        Typed::derived(Expr::Int(k), tpe, false)
                    }
                    expr => {
                        let signed_source = matches!(value.tpe, Type::Int { signed: true, .. });
                        if is_uint64(&tpe) && (value.arith || signed_source) {
                            return Err(unbounded_unsigned(&cast));
                        }
                        let bounded = width.bits() < 64;
                        Typed::derived(wrap(*signed, *width, expr), tpe, bounded)
                    }
                },
                (Type::Int { signed, width }, _) => {
                    if is_uint64(&tpe) {
                        return Err(unbounded_unsigned(&cast));
                    }
                    let truncated = Expr::Call(Func::Trunc, Box::new(value.expr));
                    let bounded = width.bits() < 64;
                    Typed::derived(wrap(*signed, *width, truncated), tpe, bounded)
                }
                _ => Typed::derived(value.expr, tpe, false),
            });
        }
        match name {
            "abs" => {
                arity(1)?;
                let value = next()?;
                Ok(Typed {
                    expr: Expr::Call(Func::Abs, Box::new(value.expr)),
                    arith: value.tpe.is_int(),
                    ..value
                })
            }
            "floor" | "ceil" => {
                arity(1)?;
                let value = next()?;
                if value.tpe.is_int() {
                    return Ok(value);
                }
                let func = if name == "floor" { Func::Floor } else { Func::Ceil };
                Ok(Typed::derived(
                    Expr::Call(func, Box::new(value.expr)),
                    Type::int32(),
                    true,
                ))
            }
            "min" | "max" => {
                arity(2)?;
                let (a, b) = (next()?, next()?);
                let tpe = numeric_join(&a, &b);
                let op = if name == "min" { Op::Min } else { Op::Max };
                Ok(Typed {
                    literal: a.literal && b.literal,
                    arith: a.arith || b.arith,
                    expr: Expr::binary(op, a.expr, b.expr),
                    tpe,
                })
            }
            "pow" => {
                arity(2)?;
                let (a, b) = (next()?, next()?);
                Ok(Typed::derived(
                    Expr::binary(Op::Pow, a.expr, b.expr),
                    Type::Float64,
                    false,
                ))
            }
            "sqrt" | "sin" | "cos" | "log" => {
                arity(1)?;
                let value = next()?;
                let func = match name {
                    "sqrt" => Func::Sqrt,
                    "sin" => Func::Sin,
                    "cos" => Func::Cos,
                    _ => Func::Ln,
                };
                Ok(Typed::derived(
                    Expr::Call(func, Box::new(value.expr)),
                    Type::Float64,
                    false,
                ))
            }
            _ => Err(TypeError::mismatch(
                "call",
                format!("`{}` calls an unknown function", ast),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StructDef;

    fn registry() -> StructRegistry {
        let mut reg = StructRegistry::default();
        reg.add(StructDef::new(
            "Point",
            vec![
                ("x".to_string(), Type::int32()),
                ("y".to_string(), Type::int32()),
            ],
        ));
        reg.add(StructDef::new(
            "Path",
            vec![
                ("id".to_string(), Type::Str),
                (
                    "points".to_string(),
                    Type::dynamic_array(Type::Struct("Point".to_string()), 4),
                ),
            ],
        ));
        reg
    }

    fn globals() -> FxHashMap<String, Binding> {
        let mut globals = FxHashMap::default();
        globals.insert(
            "topic_path_msg".to_string(),
            Binding::stored("topic_path_msg", Type::Struct("Path".to_string()), false),
        );
        globals.insert("shared".to_string(), Binding::stored("shared", Type::int32(), true));
        globals
    }

    fn with_translator(test: impl FnOnce(&mut Translator)) {
        let reg = registry();
        let globals = globals();
        let mut strings = StringTable::default();
        let mut tr = Translator::new(&reg, &globals, &mut strings);
        tr.bind_local("i", Binding::stored("i", Type::int32(), true));
        tr.bind_local("u", Binding::stored("u", Type::int(false, IntWidth::W8), true));
        tr.bind_local("s", Binding::stored("s", Type::int(true, IntWidth::W8), true));
        tr.bind_local("f", Binding::stored("f", Type::Float64, true));
        tr.bind_local("p", Binding::stored("p", Type::Struct("Path".to_string()), true));
        tr.bind_local("a", Binding::stored("a", Type::dynamic_array(Type::Bool, 3), true));
        tr.set_aliases(vec![(
            "_msg".to_string(),
            Binding::stored("topic_path_msg", Type::Struct("Path".to_string()), false),
        )]);
        test(&mut tr);
    }

    fn show(writes: &[(LValue, Expr)]) -> Vec<String> {
        writes.iter().map(|(l, e)| format!("{} := {}", l, e)).collect()
    }

    #[test]
    fn struct_of_arrays_paths() {
        with_translator(|tr| {
            let t = tr.expression("p.points[i].x + 1").unwrap();
            assert_eq!(t.expr.to_string(), "p.points.x[i] + 1");
            assert_eq!(t.tpe, Type::int32());
            let checks = tr.take_checks();
            assert_eq!(checks.len(), 1);
            assert_eq!(checks[0].to_string(), "(0 <= i) && (i < p.points.len)");
            assert!(tr.has_checks());
        });
    }

    #[test]
    fn short_circuit_guards_checks() {
        with_translator(|tr| {
            let e = tr.condition("i < a.length && a[i]").unwrap();
            assert_eq!(e.to_string(), "(i < a.len) && a[i]");
            let checks = tr.take_checks();
            assert_eq!(
                checks[0].to_string(),
                "!(i < a.len) || ((0 <= i) && (i < a.len))"
            );
        });
    }

    #[test]
    fn constant_index_beyond_bound() {
        with_translator(|tr| {
            let err = tr.expression("a[3]").unwrap_err();
            assert!(matches!(
                err.kind,
                crate::errors::CompileErrorKind::Type(TypeError::IndexOutOfBounds { index: 3, bound: 3, .. })
            ));
            // within the bound it is still checked against the length
            tr.expression("a[2]").unwrap();
            assert_eq!(tr.take_checks()[0].to_string(), "2 < a.len");
        });
    }

    #[test]
    fn width_rules() {
        with_translator(|tr| {
            assert!(tr.assignment("s", "i").is_err());
            assert!(tr.assignment("u", "300").is_err());
            assert!(tr.assignment("u", "s").is_err());
            assert!(tr.assignment("i", "f").is_err());
            assert_eq!(show(&tr.assignment("i", "u").unwrap()), vec!["i := u"]);
            assert_eq!(
                show(&tr.assignment("u", "u + 1").unwrap()),
                vec!["u := wrap_u8(u + 1)"]
            );
            assert_eq!(
                show(&tr.assignment("s", "int8(i * 2)").unwrap()),
                vec!["s := wrap_i8(i * 2)"]
            );
            assert_eq!(show(&tr.assignment("f", "i / 2").unwrap()), vec!["f := wrap_i32(i // 2)"]);
            assert_eq!(show(&tr.assignment("f", "f / 2").unwrap()), vec!["f := f / 2"]);
            assert_eq!(show(&tr.assignment("u", "uint8(-1)").unwrap()), vec!["u := 255"]);
        });
    }

    #[test]
    fn sixty_four_bit_integers_are_not_wrapped() {
        with_translator(|tr| {
            tr.bind_local("n", Binding::stored("n", Type::int(true, IntWidth::W64), true));
            tr.bind_local("w", Binding::stored("w", Type::int(false, IntWidth::W64), true));
            assert_eq!(show(&tr.assignment("n", "n * 2 + i").unwrap()), vec!["n := (n * 2) + i"]);
            assert_eq!(show(&tr.assignment("n", "int64(w)").unwrap()), vec!["n := w"]);
            assert_eq!(show(&tr.assignment("w", "u").unwrap()), vec!["w := u"]);
            assert_eq!(show(&tr.assignment("w", "5").unwrap()), vec!["w := 5"]);
            assert!(tr.assignment("w", "w + 1").is_err());
            assert!(tr.assignment("w", "-1").is_err());
            assert!(tr.assignment("w", "uint64(i)").is_err());
            assert!(tr.assignment("w", "uint64(-1)").is_err());
        });
    }

    #[test]
    fn element_writes_extend_length() {
        with_translator(|tr| {
            let writes = tr.assignment("a[i]", "true").unwrap();
            assert_eq!(
                show(&writes),
                vec!["a[i] := true", "a.len := max(a.len, i + 1)"]
            );
            assert_eq!(tr.take_checks()[0].to_string(), "(0 <= i) && (i < 3)");
            let writes = tr.assignment("a", "[true, false]").unwrap();
            assert_eq!(
                show(&writes),
                vec!["a := [true, false, false]", "a.len := 2"]
            );
            assert!(tr.assignment("a", "[true, true, true, true]").is_err());
        });
    }

    #[test]
    fn struct_copies_and_read_only_payloads() {
        with_translator(|tr| {
            let writes = tr.assignment("p", "_msg").unwrap();
            assert_eq!(
                show(&writes),
                vec![
                    "p.id := topic_path_msg.id",
                    "p.points.len := topic_path_msg.points.len",
                    "p.points.x := topic_path_msg.points.x",
                    "p.points.y := topic_path_msg.points.y",
                ]
            );
            let err = tr.assignment("_msg.id", "'x'").unwrap_err();
            assert!(err.is_structural());
            assert!(tr.expression("p + 1").is_err());
        });
    }

    #[test]
    fn strings_are_interned() {
        with_translator(|tr| {
            let e = tr.condition("p.id == 'left' || _msg.id != 'right'").unwrap();
            assert_eq!(e.to_string(), "(p.id == 1) || (topic_path_msg.id != 2)");
            assert_eq!(show(&tr.assignment("p.id", "'left'").unwrap()), vec!["p.id := 1"]);
            assert!(tr.condition("p.id < 'left'").is_err());
        });
    }

    #[test]
    fn unresolved_names_and_bad_fields() {
        with_translator(|tr| {
            let err = tr.expression("_req.a").unwrap_err();
            assert_eq!(
                err.kind,
                crate::errors::CompileErrorKind::Structural(StructuralError::unresolved("_req"))
            );
            assert!(tr.expression("p.nope").is_err());
            assert!(tr.expression("i.x").is_err());
            assert!(tr.expression("i[0]").is_err());
            assert!(tr.condition("i + 1").is_err());
        });
    }

    #[test]
    fn calls_and_folding() {
        with_translator(|tr| {
            assert_eq!(tr.expression("2 * 3 + 1").unwrap().expr, Expr::Int(7));
            assert_eq!(tr.expression("Math.max(i, 3)").unwrap().expr.to_string(), "max(i, 3)");
            assert_eq!(tr.expression("len(a)").unwrap().expr.to_string(), "a.len");
            assert_eq!(
                tr.expression("sqrt(f)").unwrap().tpe,
                Type::Float64
            );
            assert!(tr.expression("i / 0").is_err());
            assert!(tr.expression("frobnicate(i)").is_err());
        });
    }

    #[test]
    fn constants_take_declared_type() {
        with_translator(|tr| {
            let c = tr.constant("5", &Type::int(false, IntWidth::W8)).unwrap();
            assert_eq!(c.expr, Expr::Int(5));
            assert!(c.literal);
            assert!(tr.constant("i", &Type::int32()).is_err());
            assert!(tr.constant("1.5", &Type::int32()).is_err());
        });
    }
}
