// Copyright 2025 Cornell University
// released under MIT License

use cranelift_entity::{entity_impl, PrimaryMap};
use std::fmt;
use std::ops::Index;

use crate::config::TimeUnit;
use crate::eval::Value;
use crate::properties::Property;
use crate::types::Type;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Op {
    Or,
    And,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    /// Real division
    Div,
    /// Integer division, rounding towards negative infinity
    FloorDiv,
    /// Remainder matching `FloorDiv`
    Rem,
    Min,
    Max,
    Pow,
}

impl Op {
    pub fn symbol(self) -> &'static str {
        match self {
            Op::Or => "||",
            Op::And => "&&",
            Op::Eq => "==",
            Op::Neq => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Div => "/",
            Op::FloorDiv => "//",
            Op::Rem => "%",
            Op::Min => "min",
            Op::Max => "max",
            Op::Pow => "pow",
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Func {
    Abs,
    Floor,
    Ceil,
    /// Truncation of a real towards zero
    Trunc,
    Sqrt,
    Sin,
    Cos,
    /// Natural logarithm
    Ln,
}

impl Func {
    pub fn name(self) -> &'static str {
        match self {
            Func::Abs => "abs",
            Func::Floor => "floor",
            Func::Ceil => "ceil",
            Func::Trunc => "trc",
            Func::Sqrt => "sqrt",
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Ln => "ln",
        }
    }
}

/// Expressions of the flat target model. Struct paths are already resolved
/// to leaf variables, so every `Var` names a scalar or array variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Bool(bool),
    Int(i64),
    Real(f64),
    Var(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(Op, Box<Expr>, Box<Expr>),
    Ite(Box<Expr>, Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Call(Func, Box<Expr>),
    /// Two's-complement wraparound to a fixed width
    Wrap {
        signed: bool,
        bits: u32,
        value: Box<Expr>,
    },
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn binary(op: Op, a: Expr, b: Expr) -> Self {
        Expr::Binary(op, Box::new(a), Box::new(b))
    }

    pub fn index(base: Expr, idx: Expr) -> Self {
        Expr::Index(Box::new(base), Box::new(idx))
    }

    /// Negation that folds constants and double negations
    pub fn not(e: Expr) -> Self {
        match e {
            Expr::Bool(b) => Expr::Bool(!b),
            Expr::Not(inner) => *inner,
            other => Expr::Not(Box::new(other)),
        }
    }

    /// Conjunction that drops `true` operands
    pub fn and(a: Expr, b: Expr) -> Self {
        match (a, b) {
            (Expr::Bool(true), e) | (e, Expr::Bool(true)) => e,
            (Expr::Bool(false), _) | (_, Expr::Bool(false)) => Expr::Bool(false),
            (a, b) => Expr::binary(Op::And, a, b),
        }
    }

    pub fn or(a: Expr, b: Expr) -> Self {
        match (a, b) {
            (Expr::Bool(false), e) | (e, Expr::Bool(false)) => e,
            (Expr::Bool(true), _) | (_, Expr::Bool(true)) => Expr::Bool(true),
            (a, b) => Expr::binary(Op::Or, a, b),
        }
    }

    pub fn conjunction(items: impl IntoIterator<Item = Expr>) -> Self {
        items.into_iter().fold(Expr::Bool(true), Expr::and)
    }

    pub fn disjunction(items: impl IntoIterator<Item = Expr>) -> Self {
        items.into_iter().fold(Expr::Bool(false), Expr::or)
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Expr::Bool(true))
    }

    /// Variables read by this expression, in order of first occurrence
    pub fn variables(&self) -> Vec<&str> {
        let mut out = vec![];
        self.variables_helper(&mut out);
        out
    }

    fn variables_helper<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Bool(_) | Expr::Int(_) | Expr::Real(_) => {}
            Expr::Var(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Expr::Not(e) | Expr::Neg(e) | Expr::Call(_, e) => e.variables_helper(out),
            Expr::Wrap { value, .. } => value.variables_helper(out),
            Expr::Binary(_, a, b) | Expr::Index(a, b) => {
                a.variables_helper(out);
                b.variables_helper(out);
            }
            Expr::Ite(c, t, e) => {
                c.variables_helper(out);
                t.variables_helper(out);
                e.variables_helper(out);
            }
            Expr::Array(items) => {
                for item in items {
                    item.variables_helper(out);
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Bool(b) => write!(f, "{}", b),
            Expr::Int(i) => write!(f, "{}", i),
            Expr::Real(r) => write!(f, "{:?}", r),
            Expr::Var(name) => write!(f, "{}", name),
            Expr::Not(e) => write!(f, "!{}", Operand(e)),
            Expr::Neg(e) => write!(f, "-{}", Operand(e)),
            Expr::Binary(op @ (Op::Min | Op::Max | Op::Pow), a, b) => {
                write!(f, "{}({}, {})", op.symbol(), a, b)
            }
            Expr::Binary(op, a, b) => write!(f, "{} {} {}", Operand(a), op.symbol(), Operand(b)),
            Expr::Ite(c, t, e) => write!(f, "{} ? {} : {}", Operand(c), Operand(t), Operand(e)),
            Expr::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Expr::Index(a, i) => write!(f, "{}[{}]", Operand(a), i),
            Expr::Call(func, e) => write!(f, "{}({})", func.name(), e),
            Expr::Wrap {
                signed,
                bits,
                value,
            } => {
                let prefix = if *signed { "wrap_i" } else { "wrap_u" };
                write!(f, "{}{}({})", prefix, bits, value)
            }
        }
    }
}

/// Parenthesizes compound operands
struct Operand<'a>(&'a Expr);

impl fmt::Display for Operand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Expr::Binary(op, ..) if !matches!(op, Op::Min | Op::Max | Op::Pow) => {
                write!(f, "({})", self.0)
            }
            Expr::Ite(..) => write!(f, "({})", self.0),
            other => write!(f, "{}", other),
        }
    }
}

/// Assignment target: a variable, possibly indexed
#[derive(Debug, Clone, PartialEq)]
pub struct LValue {
    pub name: String,
    pub indices: Vec<Expr>,
}

impl LValue {
    pub fn var(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indices: vec![],
        }
    }
}

impl fmt::Display for LValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for idx in &self.indices {
            write!(f, "[{}]", idx)?;
        }
        Ok(())
    }
}

/// Assignments with the same `index` happen simultaneously, lower indices
/// happen first.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub target: LValue,
    pub value: Expr,
    pub index: u32,
}

#[derive(Clone, Copy, Hash, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct LocId(u32);
entity_impl!(LocId, "loc");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    /// Corresponds to a state of the source model
    Original,
    /// Introduced to split an action block
    Auxiliary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub name: String,
    pub kind: LocationKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub location: LocId,
    /// `None` means probability one
    pub probability: Option<Expr>,
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub location: LocId,
    pub action: String,
    pub guard: Expr,
    pub destinations: Vec<Destination>,
}

/// A variable of the flat model. Types are scalars or arrays of scalars.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    pub tpe: Type,
    pub init: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Automaton {
    pub name: String,
    pub variables: Vec<VarDecl>,
    pub initial: LocId,
    pub edges: Vec<Edge>,
    locations: PrimaryMap<LocId, Location>,
}

impl Automaton {
    /// Creates an automaton whose initial location is `initial`
    pub fn new(name: impl Into<String>, initial: &str) -> Self {
        let mut locations = PrimaryMap::new();
        let initial = locations.push(Location {
            name: initial.to_string(),
            kind: LocationKind::Original,
        });
        Self {
            name: name.into(),
            variables: vec![],
            initial,
            edges: vec![],
            locations,
        }
    }

    pub fn add_location(&mut self, name: impl Into<String>, kind: LocationKind) -> LocId {
        self.locations.push(Location {
            name: name.into(),
            kind,
        })
    }

    pub fn location_id(&self, name: &str) -> Option<LocId> {
        self.locations
            .iter()
            .find(|(_, l)| l.name == name)
            .map(|(id, _)| id)
    }

    pub fn locations(&self) -> impl Iterator<Item = (LocId, &Location)> {
        self.locations.iter()
    }

    pub fn num_locations(&self) -> usize {
        self.locations.len()
    }

    /// Adds an edge with a single destination
    pub fn edge(
        &mut self,
        from: LocId,
        action: impl Into<String>,
        guard: Expr,
        to: LocId,
        assignments: Vec<Assignment>,
    ) {
        self.edges.push(Edge {
            location: from,
            action: action.into(),
            guard,
            destinations: vec![Destination {
                location: to,
                probability: None,
                assignments,
            }],
        });
    }

    /// Action labels used by the edges, in order of first use
    pub fn actions(&self) -> Vec<&str> {
        let mut out: Vec<&str> = vec![];
        for edge in &self.edges {
            if !out.contains(&edge.action.as_str()) {
                out.push(&edge.action);
            }
        }
        out
    }
}

impl Index<LocId> for Automaton {
    type Output = Location;

    fn index(&self, index: LocId) -> &Self::Output {
        &self.locations[index]
    }
}

impl Index<&LocId> for Automaton {
    type Output = Location;

    fn index(&self, index: &LocId) -> &Self::Output {
        &self.locations[*index]
    }
}

/// Action labels that fire together. `participants[i]` belongs to the
/// `i`-th automaton of the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncVector {
    pub participants: Vec<Option<String>>,
    pub result: String,
}

/// The final product of a compilation
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedNetwork {
    pub globals: Vec<VarDecl>,
    pub automata: Vec<Automaton>,
    pub syncs: Vec<SyncVector>,
    pub properties: Vec<Property>,
    /// Unit of the global clock `t`, if the model has timers
    pub time_unit: Option<TimeUnit>,
}

impl ComposedNetwork {
    pub fn automaton(&self, name: &str) -> Option<&Automaton> {
        self.automata.iter().find(|a| a.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&VarDecl> {
        self.globals.iter().find(|g| g.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplifying_constructors() {
        let x = Expr::var("x");
        assert_eq!(Expr::and(Expr::Bool(true), x.clone()), x);
        assert_eq!(Expr::or(x.clone(), Expr::Bool(true)), Expr::Bool(true));
        assert_eq!(Expr::not(Expr::not(x.clone())), x);
        assert!(Expr::conjunction(vec![]).is_true());
    }

    #[test]
    fn display() {
        let e = Expr::binary(
            Op::And,
            Expr::binary(Op::Lt, Expr::var("i"), Expr::var("a.len")),
            Expr::not(Expr::index(Expr::var("a"), Expr::var("i"))),
        );
        assert_eq!(e.to_string(), "(i < a.len) && !a[i]");
        let w = Expr::Wrap {
            signed: false,
            bits: 8,
            value: Box::new(Expr::binary(Op::Add, Expr::var("x"), Expr::Int(1))),
        };
        assert_eq!(w.to_string(), "wrap_u8(x + 1)");
        assert_eq!(e.variables(), vec!["i", "a.len", "a"]);
    }

    #[test]
    fn automaton_builder() {
        let mut a = Automaton::new("ch", "waiting");
        let received = a.add_location("received", LocationKind::Original);
        a.edge(a.initial, "ch_on_send", Expr::Bool(true), received, vec![]);
        a.edge(received, "ch_on_receive", Expr::Bool(true), a.initial, vec![]);
        assert_eq!(a.actions(), vec!["ch_on_send", "ch_on_receive"]);
        assert_eq!(a.location_id("received"), Some(received));
        assert_eq!(a[received].kind, LocationKind::Original);
    }
}
