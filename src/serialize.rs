// Copyright 2025 Cornell University
// released under MIT License

//! Output of a composed network: JANI-style JSON for model checkers and a
//! plain text listing for people.

use itertools::Itertools;
use serde_json::{json, Map, Value as Json};
use std::fmt;
use std::io::Write;

use crate::compose::Compiled;
use crate::eval::Value;
use crate::network::{Automaton, ComposedNetwork, Expr, Func, LValue, LocId, Op};
use crate::types::Type;

pub const JANI_VERSION: u32 = 1;

fn jani_type(tpe: &Type) -> Json {
    match tpe {
        Type::Bool => json!("bool"),
        Type::Int { .. } | Type::Str | Type::Struct(_) => json!("int"),
        Type::Float32 | Type::Float64 => json!("real"),
        Type::Array { elem, .. } => json!({"kind": "array", "base": jani_type(elem)}),
    }
}

fn jani_value(value: &Value) -> Json {
    match value {
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Real(r) => json!(r),
        Value::Array(items) => {
            json!({"op": "av", "elements": items.iter().map(jani_value).collect::<Vec<_>>()})
        }
    }
}

fn op_name(op: Op) -> &'static str {
    match op {
        Op::Or => "∨",
        Op::And => "∧",
        Op::Eq => "=",
        Op::Neq => "≠",
        Op::Lt => "<",
        Op::Le => "≤",
        Op::Gt => ">",
        Op::Ge => "≥",
        Op::Add => "+",
        Op::Sub => "-",
        Op::Mul => "*",
        Op::Div | Op::FloorDiv => "/",
        Op::Rem => "%",
        Op::Min => "min",
        Op::Max => "max",
        Op::Pow => "pow",
    }
}

fn binary(op: &str, left: Json, right: Json) -> Json {
    json!({"op": op, "left": left, "right": right})
}

/// `v` mapped into `[0, m)` whatever the sign convention of `%`
fn modulo(v: Json, m: i64) -> Json {
    binary("%", binary("+", binary("%", v, json!(m)), json!(m)), json!(m))
}

pub fn jani_expr(expr: &Expr) -> Json {
    match expr {
        Expr::Bool(b) => json!(b),
        Expr::Int(i) => json!(i),
        Expr::Real(r) => json!(r),
        Expr::Var(name) => json!(name),
        Expr::Not(e) => json!({"op": "¬", "exp": jani_expr(e)}),
        Expr::Neg(e) => binary("-", json!(0), jani_expr(e)),
        Expr::Binary(Op::FloorDiv, a, b) => {
            json!({"op": "floor", "exp": binary("/", jani_expr(a), jani_expr(b))})
        }
        Expr::Binary(op, a, b) => binary(op_name(*op), jani_expr(a), jani_expr(b)),
        Expr::Ite(c, t, e) => {
            json!({"op": "ite", "if": jani_expr(c), "then": jani_expr(t), "else": jani_expr(e)})
        }
        Expr::Array(items) => {
            json!({"op": "av", "elements": items.iter().map(jani_expr).collect::<Vec<_>>()})
        }
        Expr::Index(base, idx) => json!({"op": "aa", "exp": jani_expr(base), "index": jani_expr(idx)}),
        Expr::Call(func, e) => {
            let x = jani_expr(e);
            match func {
                Func::Sqrt => binary("pow", x, json!(0.5)),
                Func::Ln => binary("log", x, json!({"constant": "e"})),
                Func::Abs => json!({"op": "abs", "exp": x}),
                Func::Floor => json!({"op": "floor", "exp": x}),
                Func::Ceil => json!({"op": "ceil", "exp": x}),
                Func::Trunc => json!({"op": "trc", "exp": x}),
                Func::Sin => json!({"op": "sin", "exp": x}),
                Func::Cos => json!({"op": "cos", "exp": x}),
            }
        }
        Expr::Wrap {
            signed,
            bits,
            value,
        } => {
            let v = jani_expr(value);
            match (*signed, *bits) {
                (_, 64) => v,
                (false, bits) => modulo(v, 1i64 << bits),
                (true, bits) => {
                    let half = 1i64 << (bits - 1);
                    binary("-", modulo(binary("+", v, json!(half)), 1i64 << bits), json!(half))
                }
            }
        }
    }
}

fn jani_ref(target: &LValue) -> Json {
    target
        .indices
        .iter()
        .fold(json!(target.name), |acc, idx| {
            json!({"op": "aa", "exp": acc, "index": jani_expr(idx)})
        })
}

fn jani_automaton(automaton: &Automaton) -> Json {
    let name = |loc: LocId| automaton[loc].name.as_str();
    let variables: Vec<Json> = automaton
        .variables
        .iter()
        .map(|v| json!({"name": v.name, "type": jani_type(&v.tpe), "initial-value": jani_value(&v.init)}))
        .collect();
    let locations: Vec<Json> = automaton
        .locations()
        .map(|(_, l)| json!({"name": l.name}))
        .collect();
    let edges: Vec<Json> = automaton
        .edges
        .iter()
        .map(|edge| {
            let destinations: Vec<Json> = edge
                .destinations
                .iter()
                .map(|d| {
                    let mut dest = Map::new();
                    dest.insert("location".to_string(), json!(name(d.location)));
                    if let Some(p) = &d.probability {
                        dest.insert("probability".to_string(), json!({"exp": jani_expr(p)}));
                    }
                    let assignments: Vec<Json> = d
                        .assignments
                        .iter()
                        .map(|a| json!({"ref": jani_ref(&a.target), "value": jani_expr(&a.value), "index": a.index}))
                        .collect();
                    dest.insert("assignments".to_string(), json!(assignments));
                    Json::Object(dest)
                })
                .collect();
            let mut out = Map::new();
            out.insert("location".to_string(), json!(name(edge.location)));
            out.insert("action".to_string(), json!(edge.action));
            if !edge.guard.is_true() {
                out.insert("guard".to_string(), json!({"exp": jani_expr(&edge.guard)}));
            }
            out.insert("destinations".to_string(), json!(destinations));
            Json::Object(out)
        })
        .collect();
    json!({
        "name": automaton.name,
        "locations": locations,
        "initial-locations": [name(automaton.initial)],
        "variables": variables,
        "edges": edges,
    })
}

/// Every action label of the network, sorted
pub fn action_labels(network: &ComposedNetwork) -> Vec<&str> {
    network
        .automata
        .iter()
        .flat_map(|a| a.edges.iter().map(|e| e.action.as_str()))
        .chain(network.syncs.iter().map(|s| s.result.as_str()))
        .sorted_unstable()
        .dedup()
        .collect()
}

pub fn to_jani(compiled: &Compiled) -> Json {
    let network = &compiled.network;
    let variables: Vec<Json> = network
        .globals
        .iter()
        .map(|v| json!({"name": v.name, "type": jani_type(&v.tpe), "initial-value": jani_value(&v.init)}))
        .collect();
    let actions: Vec<Json> = action_labels(network)
        .into_iter()
        .map(|a| json!({"name": a}))
        .collect();
    let elements: Vec<Json> = network
        .automata
        .iter()
        .map(|a| json!({"automaton": a.name}))
        .collect();
    let syncs: Vec<Json> = network
        .syncs
        .iter()
        .map(|s| json!({"synchronise": s.participants, "result": s.result}))
        .collect();
    let properties: Vec<Json> = network
        .properties
        .iter()
        .map(|p| json!({"name": p.name, "expression": p.expression}))
        .collect();
    let mut metadata = Map::new();
    if let Some(unit) = network.time_unit {
        metadata.insert("time-unit".to_string(), json!(unit.suffix()));
    }
    if !compiled.strings.is_empty() {
        let strings: Map<String, Json> = compiled
            .strings
            .iter()
            .map(|(id, s)| (id.to_string(), json!(s)))
            .collect();
        metadata.insert("strings".to_string(), Json::Object(strings));
    }
    json!({
        "jani-version": JANI_VERSION,
        "name": "fsm2jani",
        "type": "mdp",
        "features": ["arrays", "derived-operators", "trigonometric-functions"],
        "metadata": metadata,
        "variables": variables,
        "constants": [],
        "actions": actions,
        "automata": network.automata.iter().map(jani_automaton).collect::<Vec<_>>(),
        "system": {"elements": elements, "syncs": syncs},
        "properties": properties,
    })
}

pub fn write_jani(out: &mut impl Write, compiled: &Compiled) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, &to_jani(compiled))?;
    writeln!(out)
}

fn serialize_automaton(out: &mut impl Write, automaton: &Automaton) -> std::io::Result<()> {
    writeln!(out, "automaton {} {{", automaton.name)?;
    for var in &automaton.variables {
        writeln!(out, "{}var {}: {} = {}", "  ".repeat(1), var.name, var.tpe, var.init)?;
    }
    for (id, loc) in automaton.locations() {
        write!(out, "{}location {}", "  ".repeat(1), loc.name)?;
        if id == automaton.initial {
            write!(out, " (initial)")?;
        }
        if loc.kind == crate::network::LocationKind::Auxiliary {
            write!(out, " (auxiliary)")?;
        }
        writeln!(out)?;
    }
    for edge in &automaton.edges {
        write!(
            out,
            "{}edge {} {}",
            "  ".repeat(1),
            automaton[edge.location].name,
            edge.action
        )?;
        if !edge.guard.is_true() {
            write!(out, " if {}", edge.guard)?;
        }
        writeln!(out)?;
        for dest in &edge.destinations {
            write!(out, "{}-> {}", "  ".repeat(2), automaton[dest.location].name)?;
            if let Some(p) = &dest.probability {
                write!(out, " with {}", p)?;
            }
            writeln!(out)?;
            for a in &dest.assignments {
                write!(out, "{}{} := {}", "  ".repeat(3), a.target, a.value)?;
                if a.index > 0 {
                    write!(out, " @{}", a.index)?;
                }
                writeln!(out)?;
            }
        }
    }
    writeln!(out, "}}")
}

pub fn serialize(out: &mut impl Write, network: &ComposedNetwork) -> std::io::Result<()> {
    for g in &network.globals {
        writeln!(out, "global {}: {} = {}", g.name, g.tpe, g.init)?;
    }
    if let Some(unit) = network.time_unit {
        writeln!(out, "time unit {}", unit.suffix())?;
    }
    for automaton in &network.automata {
        serialize_automaton(out, automaton)?;
    }
    for sync in &network.syncs {
        let participants = sync
            .participants
            .iter()
            .zip(&network.automata)
            .filter_map(|(label, a)| label.as_ref().map(|l| format!("{}.{}", a.name, l)))
            .join(", ");
        writeln!(out, "sync {} = {}", sync.result, participants)?;
    }
    for property in &network.properties {
        writeln!(out, "property {}: {}", property.name, property.expression)?;
    }
    Ok(())
}

pub fn serialize_to_string(network: &ComposedNetwork) -> std::io::Result<String> {
    let mut out = Vec::new();
    serialize(&mut out, network)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

impl fmt::Display for ComposedNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = serialize_to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{tick_sync, Clock};
    use crate::config::{Duration, TimeUnit};

    fn clock_network() -> ComposedNetwork {
        let clock = Clock::new(
            &[("a", 1_000_000_000), ("b", 2_000_000_000)],
            &Duration::new(2, TimeUnit::S),
        )
        .unwrap();
        ComposedNetwork {
            globals: clock.globals(),
            automata: vec![clock.automaton()],
            syncs: vec![tick_sync(0, &[], 1)],
            properties: vec![],
            time_unit: Some(clock.unit),
        }
    }

    #[test]
    fn text_listing() {
        let text = serialize_to_string(&clock_network()).unwrap();
        insta::assert_snapshot!(text, @r"
        global t: int64 = 0
        global a.due: bool = true
        global b.due: bool = true
        time unit s
        automaton global_timer {
          location loc (initial)
          edge loc global_timer_tick if ((t + 1) <= 2) && (!a.due && !b.due)
            -> loc
              t := t + 1
              a.due := (t % 1) == 0 @1
              b.due := (t % 2) == 0 @1
          edge loc a_on_send if a.due
            -> loc
              a.due := false
          edge loc b_on_send if b.due
            -> loc
              b.due := false
        }
        sync global_timer_tick = global_timer.global_timer_tick
        ");
    }

    #[test]
    fn operators() {
        let div = Expr::binary(Op::FloorDiv, Expr::var("x"), Expr::Int(2));
        assert_eq!(
            jani_expr(&div),
            json!({"op": "floor", "exp": {"op": "/", "left": "x", "right": 2}})
        );
        let wrap = Expr::Wrap {
            signed: false,
            bits: 8,
            value: Box::new(Expr::var("x")),
        };
        assert_eq!(
            jani_expr(&wrap),
            json!({"op": "%", "left": {"op": "+", "left": {"op": "%", "left": "x", "right": 256}, "right": 256}, "right": 256})
        );
        let target = LValue {
            name: "a".to_string(),
            indices: vec![Expr::var("i")],
        };
        assert_eq!(jani_ref(&target), json!({"op": "aa", "exp": "a", "index": "i"}));
        assert_eq!(
            jani_expr(&Expr::not(Expr::var("b"))),
            json!({"op": "¬", "exp": "b"})
        );
    }

    #[test]
    fn jani_document() {
        let compiled = Compiled {
            network: clock_network(),
            strings: vec![(1, "go".to_string())],
        };
        let doc = to_jani(&compiled);
        assert_eq!(doc["jani-version"], json!(1));
        assert_eq!(doc["metadata"]["time-unit"], json!("s"));
        assert_eq!(doc["metadata"]["strings"]["1"], json!("go"));
        assert_eq!(
            doc["actions"],
            json!([{"name": "a_on_send"}, {"name": "b_on_send"}, {"name": "global_timer_tick"}])
        );
        let edges = &doc["automata"][0]["edges"];
        assert_eq!(edges[1]["guard"], json!({"exp": "a.due"}));
        assert_eq!(edges[0]["destinations"][0]["assignments"][1]["index"], json!(1));
        assert_eq!(
            doc["system"]["syncs"][0],
            json!({"synchronise": ["global_timer_tick"], "result": "global_timer_tick"})
        );

        let mut first = vec![];
        write_jani(&mut first, &compiled).unwrap();
        let mut second = vec![];
        write_jani(&mut second, &compiled).unwrap();
        assert_eq!(first, second);
    }
}
