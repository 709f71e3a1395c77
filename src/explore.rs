// Copyright 2025 Cornell University
// released under MIT License

//! Explicit-state exploration of a composed network.
//!
//! A step fires one synchronization vector: every participant takes one
//! enabled edge with the vector's label and one of its destinations. The
//! assignments of all chosen destinations are applied level by level; all
//! values of a level are computed before any of them is stored.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

use crate::eval::{self, wrap_int, EvalError, Value};
use crate::network::{Assignment, ComposedNetwork, Edge, Expr, Func, LValue, LocId, Op};
use crate::parser::BinOp;
use crate::types::IntWidth;

/// Evaluates `expr`, looking variables up with `lookup`
pub fn evaluate(expr: &Expr, lookup: &dyn Fn(&str) -> Option<Value>) -> Result<Value, EvalError> {
    match expr {
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(i) => Ok(Value::Int(*i)),
        Expr::Real(r) => Ok(Value::Real(*r)),
        Expr::Var(name) => lookup(name).ok_or_else(|| EvalError::Unbound(name.clone())),
        Expr::Not(e) => Ok(Value::Bool(!boolean(e, lookup)?)),
        Expr::Neg(e) => match evaluate(e, lookup)? {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Real(r) => Ok(Value::Real(-r)),
            other => Err(EvalError::Type(format!("cannot negate {}", other))),
        },
        Expr::Binary(Op::And, a, b) => Ok(Value::Bool(boolean(a, lookup)? && boolean(b, lookup)?)),
        Expr::Binary(Op::Or, a, b) => Ok(Value::Bool(boolean(a, lookup)? || boolean(b, lookup)?)),
        Expr::Binary(op, a, b) => {
            let a = evaluate(a, lookup)?;
            let b = evaluate(b, lookup)?;
            binary(*op, a, b)
        }
        Expr::Ite(c, t, e) => {
            if boolean(c, lookup)? {
                evaluate(t, lookup)
            } else {
                evaluate(e, lookup)
            }
        }
        Expr::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|i| evaluate(i, lookup))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Index(base, idx) => {
            let idx = integer(idx, lookup)?;
            match evaluate(base, lookup)? {
                Value::Array(items) => usize::try_from(idx)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or(EvalError::OutOfBounds {
                        index: idx,
                        len: items.len(),
                    }),
                other => Err(EvalError::Type(format!("cannot index {}", other))),
            }
        }
        Expr::Call(func, e) => call(*func, evaluate(e, lookup)?),
        Expr::Wrap {
            signed,
            bits,
            value,
        } => {
            let width = IntWidth::from_bits(*bits)
                .ok_or_else(|| EvalError::Type(format!("no integer type has {} bits", bits)))?;
            Ok(Value::Int(wrap_int(integer(value, lookup)?, *signed, width)))
        }
    }
}

fn boolean(expr: &Expr, lookup: &dyn Fn(&str) -> Option<Value>) -> Result<bool, EvalError> {
    evaluate(expr, lookup)?
        .as_bool()
        .ok_or_else(|| EvalError::Type(format!("`{}` is not a boolean", expr)))
}

fn integer(expr: &Expr, lookup: &dyn Fn(&str) -> Option<Value>) -> Result<i64, EvalError> {
    evaluate(expr, lookup)?
        .as_int()
        .ok_or_else(|| EvalError::Type(format!("`{}` is not an integer", expr)))
}

fn binary(op: Op, a: Value, b: Value) -> Result<Value, EvalError> {
    let reference = match op {
        Op::Eq => BinOp::Eq,
        Op::Neq => BinOp::Neq,
        Op::Lt => BinOp::Lt,
        Op::Le => BinOp::Le,
        Op::Gt => BinOp::Gt,
        Op::Ge => BinOp::Ge,
        Op::Add => BinOp::Add,
        Op::Sub => BinOp::Sub,
        Op::Mul => BinOp::Mul,
        Op::FloorDiv => BinOp::Div,
        Op::Rem => BinOp::Rem,
        Op::And => BinOp::And,
        Op::Or => BinOp::Or,
        Op::Div => {
            let (x, y) = (real(&a)?, real(&b)?);
            return Ok(Value::Real(x / y));
        }
        Op::Min | Op::Max => {
            let first = match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => x <= y,
                _ => real(&a)? <= real(&b)?,
            };
            return Ok(if first == (op == Op::Min) { a } else { b });
        }
        Op::Pow => return Ok(Value::Real(real(&a)?.powf(real(&b)?))),
    };
    eval::binary(reference, a, b)
}

fn real(v: &Value) -> Result<f64, EvalError> {
    v.as_real()
        .ok_or_else(|| EvalError::Type(format!("{} is not a number", v)))
}

fn call(func: Func, v: Value) -> Result<Value, EvalError> {
    if let (Value::Int(i), Func::Abs | Func::Floor | Func::Ceil | Func::Trunc) = (&v, func) {
        return Ok(Value::Int(if func == Func::Abs { i.wrapping_abs() } else { *i }));
    }
    let x = real(&v)?;
    Ok(match func {
        Func::Abs => Value::Real(x.abs()),
        Func::Floor => Value::Int(x.floor() as i64),
        Func::Ceil => Value::Int(x.ceil() as i64),
        Func::Trunc => Value::Int(x.trunc() as i64),
        Func::Sqrt => Value::Real(x.sqrt()),
        Func::Sin => Value::Real(x.sin()),
        Func::Cos => Value::Real(x.cos()),
        Func::Ln => Value::Real(x.ln()),
    })
}

/// One state of the network: a location per automaton and the values of
/// all variables
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetState {
    pub locations: Vec<LocId>,
    pub globals: Vec<Value>,
    pub locals: Vec<Vec<Value>>,
}

/// An outgoing step of a state
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub label: String,
    pub probability: f64,
    pub target: NetState,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub states: usize,
    pub transitions: usize,
    /// Reachable states without any enabled step
    pub deadlocks: usize,
    pub errors: Vec<String>,
    /// `false` when the state limit stopped the search
    pub complete: bool,
}

pub struct Explorer<'n> {
    network: &'n ComposedNetwork,
    globals: FxHashMap<&'n str, usize>,
    locals: Vec<FxHashMap<&'n str, usize>>,
}

impl<'n> Explorer<'n> {
    pub fn new(network: &'n ComposedNetwork) -> Self {
        let globals = network
            .globals
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name.as_str(), i))
            .collect();
        let locals = network
            .automata
            .iter()
            .map(|a| {
                a.variables
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (v.name.as_str(), i))
                    .collect()
            })
            .collect();
        Self {
            network,
            globals,
            locals,
        }
    }

    pub fn initial(&self) -> NetState {
        NetState {
            locations: self.network.automata.iter().map(|a| a.initial).collect(),
            globals: self.network.globals.iter().map(|g| g.init.clone()).collect(),
            locals: self
                .network
                .automata
                .iter()
                .map(|a| a.variables.iter().map(|v| v.init.clone()).collect())
                .collect(),
        }
    }

    /// Name of the location `automaton` is in
    pub fn location(&self, state: &NetState, automaton: &str) -> Option<&'n str> {
        let i = self.automaton_index(automaton)?;
        let loc = state.locations[i];
        Some(self.network.automata[i][loc].name.as_str())
    }

    pub fn global<'s>(&self, state: &'s NetState, name: &str) -> Option<&'s Value> {
        self.globals.get(name).map(|i| &state.globals[*i])
    }

    pub fn local<'s>(&self, state: &'s NetState, automaton: &str, name: &str) -> Option<&'s Value> {
        let i = self.automaton_index(automaton)?;
        self.locals[i].get(name).map(|j| &state.locals[i][*j])
    }

    fn automaton_index(&self, name: &str) -> Option<usize> {
        self.network.automata.iter().position(|a| a.name == name)
    }

    fn lookup(&self, state: &NetState, automaton: Option<usize>, name: &str) -> Option<Value> {
        if let Some(i) = automaton {
            if let Some(j) = self.locals[i].get(name) {
                return Some(state.locals[i][*j].clone());
            }
        }
        self.globals.get(name).map(|i| state.globals[*i].clone())
    }

    fn eval(&self, state: &NetState, automaton: usize, expr: &Expr) -> Result<Value, EvalError> {
        evaluate(expr, &|name: &str| self.lookup(state, Some(automaton), name))
    }

    fn enabled(&self, state: &NetState, automaton: usize, label: &str) -> Result<Vec<&'n Edge>, EvalError> {
        let here = state.locations[automaton];
        let mut out = vec![];
        for edge in &self.network.automata[automaton].edges {
            if edge.location != here || edge.action != label {
                continue;
            }
            if self.eval(state, automaton, &edge.guard)?.as_bool() == Some(true) {
                out.push(edge);
            }
        }
        Ok(out)
    }

    /// All steps leaving `state`
    pub fn successors(&self, state: &NetState) -> Result<Vec<Transition>, EvalError> {
        let mut out = vec![];
        for sync in &self.network.syncs {
            // one list of enabled edges per participant
            let mut choices: Vec<(usize, Vec<&'n Edge>)> = vec![];
            for (i, label) in sync.participants.iter().enumerate() {
                let Some(label) = label else { continue };
                let edges = self.enabled(state, i, label)?;
                if edges.is_empty() {
                    choices.clear();
                    break;
                }
                choices.push((i, edges));
            }
            if choices.is_empty() {
                continue;
            }
            // every combination of one destination per participant
            let mut combos: Vec<(f64, Vec<(usize, LocId, &'n [Assignment])>)> = vec![(1.0, vec![])];
            for (i, edges) in &choices {
                let mut next = vec![];
                for (p, picked) in &combos {
                    for edge in edges {
                        for dest in &edge.destinations {
                            let q = match &dest.probability {
                                Some(e) => real(&self.eval(state, *i, e)?)?,
                                None => 1.0,
                            };
                            if q <= 0.0 {
                                continue;
                            }
                            let mut picked = picked.clone();
                            picked.push((*i, dest.location, dest.assignments.as_slice()));
                            next.push((p * q, picked));
                        }
                    }
                }
                combos = next;
            }
            for (probability, picked) in combos {
                out.push(Transition {
                    label: sync.result.clone(),
                    probability,
                    target: self.apply(state, &picked)?,
                });
            }
        }
        Ok(out)
    }

    fn apply(
        &self,
        state: &NetState,
        picked: &[(usize, LocId, &[Assignment])],
    ) -> Result<NetState, EvalError> {
        let mut current = state.clone();
        let mut levels: Vec<u32> = picked
            .iter()
            .flat_map(|(_, _, assignments)| assignments.iter().map(|a| a.index))
            .collect();
        levels.sort_unstable();
        levels.dedup();
        for level in levels {
            let mut writes = vec![];
            for (i, _, assignments) in picked {
                for a in assignments.iter().filter(|a| a.index == level) {
                    let value = self.eval(&current, *i, &a.value)?;
                    let indices = a
                        .target
                        .indices
                        .iter()
                        .map(|e| integer(e, &|n: &str| self.lookup(&current, Some(*i), n)))
                        .collect::<Result<Vec<_>, _>>()?;
                    writes.push((*i, &a.target, indices, value));
                }
            }
            for (i, target, indices, value) in writes {
                self.store(&mut current, i, target, &indices, value)?;
            }
        }
        for (i, loc, _) in picked {
            current.locations[*i] = *loc;
        }
        Ok(current)
    }

    fn store(
        &self,
        state: &mut NetState,
        automaton: usize,
        target: &LValue,
        indices: &[i64],
        value: Value,
    ) -> Result<(), EvalError> {
        let slot = match self.locals[automaton].get(target.name.as_str()) {
            Some(j) => &mut state.locals[automaton][*j],
            None => match self.globals.get(target.name.as_str()) {
                Some(j) => &mut state.globals[*j],
                None => return Err(EvalError::Unbound(target.name.clone())),
            },
        };
        let mut slot = slot;
        for idx in indices {
            slot = match slot {
                Value::Array(items) => {
                    let len = items.len();
                    usize::try_from(*idx)
                        .ok()
                        .and_then(|i| items.get_mut(i))
                        .ok_or(EvalError::OutOfBounds { index: *idx, len })?
                }
                other => return Err(EvalError::Type(format!("cannot index {}", other))),
            };
        }
        *slot = value;
        Ok(())
    }

    /// Breadth-first search over at most `limit` states
    pub fn explore(&self, limit: usize) -> Report {
        let mut report = Report {
            complete: true,
            ..Report::default()
        };
        self.visit(limit, &mut report, |_, _| {});
        report
    }

    /// Reachable states, in breadth-first order
    pub fn reachable(&self, limit: usize) -> (Vec<NetState>, Report) {
        let mut report = Report {
            complete: true,
            ..Report::default()
        };
        let mut states = vec![];
        self.visit(limit, &mut report, |state, _| states.push(state.clone()));
        (states, report)
    }

    fn visit(&self, limit: usize, report: &mut Report, mut on_state: impl FnMut(&NetState, &[Transition])) {
        let initial = self.initial();
        let mut seen: FxHashSet<NetState> = FxHashSet::default();
        let mut queue = VecDeque::new();
        seen.insert(initial.clone());
        queue.push_back(initial);
        while let Some(state) = queue.pop_front() {
            report.states += 1;
            let transitions = match self.successors(&state) {
                Ok(t) => t,
                Err(e) => {
                    report.errors.push(e.to_string());
                    on_state(&state, &[]);
                    continue;
                }
            };
            if transitions.is_empty() {
                report.deadlocks += 1;
            }
            report.transitions += transitions.len();
            on_state(&state, &transitions);
            for t in transitions {
                if seen.len() >= limit {
                    report.complete = false;
                    break;
                }
                if seen.insert(t.target.clone()) {
                    queue.push_back(t.target);
                }
            }
        }
        log::info!(
            "explored {} states, {} transitions, {} deadlocks",
            report.states,
            report.transitions,
            report.deadlocks
        );
    }
}
