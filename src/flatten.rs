// Copyright 2025 Cornell University
// released under MIT License

//! Lowers the transitions of a state machine into flat edges.
//!
//! A block is compiled back to front into a set of alternatives: a guard
//! over the state at the start of the block, a list of steps (writes that
//! happen at the same assignment index) and the location where the block
//! continues. Conditionals multiply alternatives. Sends cut the block: every
//! send is an edge of its own, leaving from an auxiliary location. Auxiliary
//! locations are memoized by the structure of the remaining block, so equal
//! continuations are only emitted once.

use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};

use crate::bt::{PortDirection, PortValue};
use crate::channels::{on_receive, on_send, valid_flag, ChannelTable};
use crate::errors::{CompileResult, StructuralError, TypeError, WithContext};
use crate::model::{Action, ActionId, Destination, EdgeId, StateId, StateMachine};
use crate::network::{self, Assignment, Automaton, Expr, LValue, LocId, LocationKind};
use crate::ros::{blackboard_channel, Interface, Port};
use crate::translate::{Binding, Translator};
use crate::types::Type;

/// Global flag raised by invalid array accesses of `automaton`
pub fn out_of_bounds_flag(automaton: &str) -> String {
    format!("{}.out_of_bounds", automaton)
}

/// A flattened state machine together with its channel usage
#[derive(Debug, Clone, PartialEq)]
pub struct Flattened {
    pub automaton: Automaton,
    /// Channels the automaton receives from, in order of first use
    pub receives: Vec<String>,
    /// Channels the automaton sends on, in order of first use
    pub sends: Vec<String>,
}

impl Flattened {
    pub fn num_auxiliary(&self) -> usize {
        self.automaton
            .locations()
            .filter(|(_, l)| l.kind == LocationKind::Auxiliary)
            .count()
    }
}

/// Writes that happen simultaneously, and the conditions their accesses
/// need to be valid
#[derive(Debug, Clone, Default)]
struct Step {
    writes: Vec<(LValue, Expr)>,
    checks: Vec<Expr>,
}

#[derive(Debug, Clone)]
struct Alt {
    guard: Expr,
    steps: Vec<Step>,
    target: LocId,
}

impl Alt {
    fn to(target: LocId) -> Self {
        Self {
            guard: Expr::Bool(true),
            steps: vec![],
            target,
        }
    }

    fn add_checks(&mut self, checks: &[Expr]) {
        if checks.is_empty() {
            return;
        }
        match self.steps.first_mut() {
            Some(step) => step.checks.extend_from_slice(checks),
            None => self.steps.push(Step {
                writes: vec![],
                checks: checks.to_vec(),
            }),
        }
    }
}

/// Flattens `sm`. Names are resolved with `tr`, which must already know the
/// automaton's variables. `ports` are the channel end points the automaton
/// declares.
pub fn flatten(
    sm: &StateMachine,
    tr: &mut Translator,
    channels: &ChannelTable,
    ports: &[Port],
) -> CompileResult<Flattened> {
    let first = sm
        .states()
        .next()
        .map(|(_, s)| s.name().to_string())
        .ok_or(StructuralError::MissingInitialState)?;
    let automaton = Automaton::new(sm.name.clone(), &first);
    let flattener = Flattener {
        sm,
        tr,
        channels,
        ports,
        automaton,
        states: FxHashMap::default(),
        originals: vec![],
        memo: FxHashMap::default(),
        trigger: None,
        source: String::new(),
        flag: out_of_bounds_flag(&sm.name),
        receives: vec![],
        sends: vec![],
    };
    flattener.run()
}

struct Flattener<'s, 't, 'a> {
    sm: &'s StateMachine,
    tr: &'t mut Translator<'a>,
    channels: &'s ChannelTable,
    ports: &'s [Port],
    automaton: Automaton,
    states: FxHashMap<StateId, LocId>,
    /// Locations of the source states, in declaration order
    originals: Vec<LocId>,
    memo: FxHashMap<u64, LocId>,
    /// Trigger of the transition being compiled
    trigger: Option<Interface>,
    /// Source state name, used to name auxiliary locations
    source: String,
    flag: String,
    receives: Vec<String>,
    sends: Vec<String>,
}

impl Flattener<'_, '_, '_> {
    fn run(mut self) -> CompileResult<Flattened> {
        let sm = self.sm;
        for (i, (id, state)) in sm.states().enumerate() {
            let loc = if i == 0 {
                self.automaton.initial
            } else {
                self.automaton
                    .add_location(state.name(), LocationKind::Original)
            };
            self.states.insert(id, loc);
            self.originals.push(loc);
        }
        let initial = sm.initial.ok_or(StructuralError::MissingInitialState)?;
        let init_loc = self.states[&initial];
        self.automaton.initial = init_loc;
        let on_entry = &sm[initial].on_entry;
        if !on_entry.is_empty() {
            self.source = sm[initial].name().to_string();
            self.enter_trigger(&None)?;
            let alts = self.compile(on_entry, init_loc).at_state(sm[initial].name())?;
            let first_exec = self.automaton.add_location(
                format!("{}-first-exec", sm[initial].name()),
                LocationKind::Auxiliary,
            );
            self.emit(first_exec, None, alts);
            self.automaton.initial = first_exec;
        }

        for (state_id, state) in sm.states() {
            // guards of the previous transitions, per trigger
            let mut previous: Vec<(Option<Interface>, Expr)> = vec![];
            for (position, (edge_id, edge)) in sm.edges_from(state_id).enumerate() {
                let earlier: Vec<Expr> = previous
                    .iter()
                    .filter(|(t, _)| t == &edge.trigger)
                    .map(|(_, g)| g.clone())
                    .collect();
                let guard = self
                    .edge(edge_id, &earlier)
                    .at_edge(position)
                    .at_state(state.name())?;
                previous.push((edge.trigger.clone(), guard));
            }
        }

        if sm.discard_unhandled {
            self.discard_loops();
        }
        log::debug!(
            "flattened `{}`: {} locations, {} edges",
            sm.name,
            self.automaton.num_locations(),
            self.automaton.edges.len()
        );
        Ok(Flattened {
            automaton: self.automaton,
            receives: self.receives,
            sends: self.sends,
        })
    }

    fn bt_id(&self) -> Option<u32> {
        self.sm.bt.as_ref().map(|b| b.id)
    }

    fn has_port(&self, channel: &str, send: bool) -> bool {
        self.ports.iter().any(|p| {
            p.channel == channel
                && if send {
                    p.role.can_send()
                } else {
                    p.role.can_receive()
                }
        })
    }

    /// Channel `interface` maps to. Clients of a service or action talk to
    /// its handler over channels of their own.
    fn channel_of(&self, interface: &Interface, send: bool) -> CompileResult<String> {
        match interface.client_channel(&self.sm.name) {
            Some(channel) if self.has_port(&channel, send) => Ok(channel),
            _ => interface.channel_name(self.bt_id()),
        }
    }

    fn declares(&self, channel: &str, send: bool) -> CompileResult<()> {
        if self.has_port(channel, send) && self.channels.get(channel).is_some() {
            Ok(())
        } else {
            Err(StructuralError::unknown_channel(channel).into())
        }
    }

    /// Makes the payload of `trigger` visible under its pseudo-variables and
    /// returns the channel it arrives on
    fn enter_trigger(&mut self, trigger: &Option<Interface>) -> CompileResult<Option<String>> {
        self.trigger = trigger.clone();
        let Some(interface) = trigger else {
            self.tr.set_aliases(vec![]);
            return Ok(None);
        };
        let channel = self.channel_of(interface, false)?;
        self.declares(&channel, false)?;
        let payload = self.channels.get(&channel).and_then(|c| c.payload.clone());
        let aliases = match payload {
            Some(payload) => interface
                .payload_aliases()
                .iter()
                .map(|alias| {
                    let tpe = Type::Struct(payload.clone());
                    (alias.to_string(), Binding::stored(channel.clone(), tpe, false))
                })
                .collect(),
            None => vec![],
        };
        self.tr.set_aliases(aliases);
        if !self.receives.contains(&channel) {
            self.receives.push(channel.clone());
        }
        Ok(Some(channel))
    }

    /// Compiles one transition and returns its own guard
    fn edge(&mut self, id: EdgeId, earlier: &[Expr]) -> CompileResult<Expr> {
        let sm = self.sm;
        let edge = &sm[id];
        let source = &sm[edge.source];
        self.source = source.name().to_string();
        let label = self.enter_trigger(&edge.trigger)?.map(|c| on_receive(&c));
        let guard = match &edge.guard {
            Some(text) => self.tr.condition(text)?,
            None => Expr::Bool(true),
        };
        let guard_checks = self.tr.take_checks();
        let enabled = Expr::and(
            Expr::conjunction(earlier.iter().map(|g| Expr::not(g.clone()))),
            guard.clone(),
        );
        let probabilities = probabilities(&edge.destinations)?;
        let from = self.states[&edge.source];

        let mut compiled = vec![];
        for dest in &edge.destinations {
            let target_id = sm
                .state_id(&dest.target)
                .ok_or_else(|| StructuralError::unknown_state(&dest.target))?;
            let target = self.states[&target_id];
            let body: Vec<ActionId> = source
                .on_exit
                .iter()
                .chain(&dest.body)
                .chain(&sm[target_id].on_entry)
                .copied()
                .collect();
            let alts = self.compile(&body, target)?;
            compiled.push((body, target, alts));
        }

        if compiled.len() == 1 {
            let (_, _, alts) = compiled.remove(0);
            for mut alt in alts {
                alt.add_checks(&guard_checks);
                let action = label
                    .clone()
                    .unwrap_or_else(|| self.internal(from, alt.target));
                let guard = Expr::and(enabled.clone(), alt.guard);
                if matches!(guard, Expr::Bool(false)) {
                    continue;
                }
                let assignments = self.assignments(alt.steps);
                self.automaton
                    .edge(from, action, guard, alt.target, assignments);
            }
            return Ok(guard);
        }

        let mut destinations = vec![];
        for (j, ((body, target, mut alts), p)) in compiled.into_iter().zip(probabilities).enumerate() {
            let mut alt = if alts.len() == 1 && alts[0].guard.is_true() {
                alts.remove(0)
            } else {
                // a guarded continuation needs a location to wait in
                let key = self.key(&body, target);
                let loc = self.place(key, &format!("P{}", j), None, alts);
                Alt::to(loc)
            };
            alt.add_checks(&guard_checks);
            destinations.push(network::Destination {
                location: alt.target,
                probability: Some(Expr::Real(p)),
                assignments: self.assignments(alt.steps),
            });
        }
        let action = label.unwrap_or_else(|| self.internal(from, destinations[0].location));
        self.automaton.edges.push(network::Edge {
            location: from,
            action,
            guard: enabled,
            destinations,
        });
        Ok(guard)
    }

    /// Compiles `block`, continuing at `exit` once it is done
    fn compile(&mut self, block: &[ActionId], exit: LocId) -> CompileResult<Vec<Alt>> {
        let sm = self.sm;
        let Some((first, rest)) = block.split_first() else {
            return Ok(vec![Alt::to(exit)]);
        };
        match &sm[first] {
            Action::Assign { target, value } => {
                let writes = self.tr.assignment(target, value)?;
                let step = Step {
                    writes,
                    checks: self.tr.take_checks(),
                };
                let alts = self.compile(rest, exit)?;
                self.attach(step, alts, rest, exit, "assign")
            }
            Action::If {
                branches,
                otherwise,
            } => self.branch(branches, otherwise, rest, exit),
            Action::Send { .. } | Action::SetOutput { .. } => {
                Ok(vec![Alt::to(self.send_location(block, exit)?)])
            }
        }
    }

    /// Puts `step` in front of `alts`. When the guards of `alts` read what
    /// `step` writes, the step gets an edge of its own.
    fn attach(
        &mut self,
        step: Step,
        alts: Vec<Alt>,
        rest: &[ActionId],
        exit: LocId,
        tag: &str,
    ) -> CompileResult<Vec<Alt>> {
        let written: Vec<&str> = step.writes.iter().map(|(lv, _)| lv.name.as_str()).collect();
        let conflict = alts
            .iter()
            .any(|alt| alt.guard.variables().iter().any(|v| written.contains(v)));
        if !conflict {
            return Ok(alts
                .into_iter()
                .map(|mut alt| {
                    alt.steps.insert(0, step.clone());
                    alt
                })
                .collect());
        }
        let key = self.key(rest, exit);
        let location = self.place(key, tag, None, alts);
        Ok(vec![Alt {
            guard: Expr::Bool(true),
            steps: vec![step],
            target: location,
        }])
    }

    fn branch(
        &mut self,
        branches: &[(String, Vec<ActionId>)],
        otherwise: &[ActionId],
        rest: &[ActionId],
        exit: LocId,
    ) -> CompileResult<Vec<Alt>> {
        let sm = self.sm;
        // continuations with sends are shared instead of copied into every branch
        let join = if sm.block_sends(rest) {
            Some(self.location_for(rest, exit, "join")?)
        } else {
            None
        };
        let mut conditions: Vec<Expr> = vec![];
        let mut checks = vec![];
        for (text, _) in branches {
            let cond = self.tr.condition(text)?;
            // a condition is only evaluated when all previous ones failed
            let skipped = Expr::disjunction(conditions.iter().cloned());
            checks.extend(
                self.tr
                    .take_checks()
                    .into_iter()
                    .map(|c| Expr::or(skipped.clone(), c)),
            );
            conditions.push(cond);
        }
        let bodies = branches
            .iter()
            .map(|(_, body)| body.as_slice())
            .chain(std::iter::once(otherwise));
        let mut out = vec![];
        for (k, body) in bodies.enumerate() {
            let failed = conditions[..k.min(conditions.len())]
                .iter()
                .map(|c| Expr::not(c.clone()));
            let taken = Expr::and(
                Expr::conjunction(failed),
                conditions.get(k).cloned().unwrap_or(Expr::Bool(true)),
            );
            if matches!(taken, Expr::Bool(false)) {
                continue;
            }
            let alts = match join {
                Some(loc) => self.compile(body, loc)?,
                None => {
                    let seq: Vec<ActionId> = body.iter().chain(rest).copied().collect();
                    self.compile(&seq, exit)?
                }
            };
            for mut alt in alts {
                alt.guard = Expr::and(taken.clone(), alt.guard);
                if matches!(alt.guard, Expr::Bool(false)) {
                    continue;
                }
                alt.add_checks(&checks);
                out.push(alt);
            }
        }
        Ok(out)
    }

    /// A location from which `block` runs and then continues at `exit`
    fn location_for(&mut self, block: &[ActionId], exit: LocId, tag: &str) -> CompileResult<LocId> {
        let sm = self.sm;
        match block.first().map(|id| &sm[id]) {
            None => Ok(exit),
            Some(Action::Send { .. } | Action::SetOutput { .. }) => self.send_location(block, exit),
            Some(_) => {
                let key = self.key(block, exit);
                if let Some(loc) = self.memo.get(&key) {
                    return Ok(*loc);
                }
                let alts = self.compile(block, exit)?;
                Ok(self.place(key, tag, None, alts))
            }
        }
    }

    /// The location whose outgoing edges perform the send that starts
    /// `block`, followed by the rest of the block
    fn send_location(&mut self, block: &[ActionId], exit: LocId) -> CompileResult<LocId> {
        let key = self.key(block, exit);
        if let Some(loc) = self.memo.get(&key) {
            return Ok(*loc);
        }
        let sm = self.sm;
        let Some((first, rest)) = block.split_first() else {
            return Ok(exit);
        };
        let (channel, writes) = match &sm[first] {
            Action::Send { interface, params } => {
                let channel = self.channel_of(interface, true)?;
                let writes = self.payload(&channel, params)?;
                (channel, writes)
            }
            Action::SetOutput { port, value } => self.set_output(port, value)?,
            other => {
                return Err(TypeError::mismatch(
                    "send",
                    format!("{:?} does not send a message", other),
                )
                .into())
            }
        };
        let step = Step {
            writes,
            checks: self.tr.take_checks(),
        };
        let alts = self.compile(rest, exit)?;
        let alts = self.attach(step, alts, rest, exit, "sent")?;
        let tag = format!("send_{}", channel);
        Ok(self.place(key, &tag, Some(&on_send(&channel)), alts))
    }

    /// Writes of the payload of a message sent on `channel`
    fn payload(
        &mut self,
        channel: &str,
        params: &[(String, String)],
    ) -> CompileResult<Vec<(LValue, Expr)>> {
        self.declares(channel, true)?;
        if !self.sends.iter().any(|c| c == channel) {
            self.sends.push(channel.to_string());
        }
        let channels = self.channels;
        let payload = channels.get(channel).and_then(|c| c.payload.clone());
        let Some(payload) = payload else {
            if let Some((field, _)) = params.first() {
                return Err(TypeError::mismatch(
                    "send",
                    format!("`{}` carries no payload, cannot set `{}`", channel, field),
                )
                .into());
            }
            return Ok(vec![]);
        };
        let fields = self
            .tr
            .structs()
            .get(&payload)
            .map(|def| def.fields().to_vec())
            .ok_or_else(|| TypeError::unknown_type(&payload))?;
        let mut writes = vec![];
        for (field, value) in params {
            let tpe = fields
                .iter()
                .find(|(f, _)| f == field)
                .map(|(_, t)| t.clone())
                .ok_or_else(|| TypeError::UnknownField {
                    field: field.clone(),
                    struct_name: payload.clone(),
                })?;
            writes.extend(self.tr.store_into(&format!("{}.{}", channel, field), &tpe, value)?);
        }
        writes.push((LValue::var(valid_flag(channel)), Expr::Bool(true)));
        Ok(writes)
    }

    /// Output ports are written by messaging the blackboard
    fn set_output(&mut self, port: &str, value: &str) -> CompileResult<(String, Vec<(LValue, Expr)>)> {
        let sm = self.sm;
        let binding = sm.bt.as_ref().ok_or_else(|| {
            StructuralError::invalid_bt(format!("`{}` is written outside of a behavior tree", port))
        })?;
        let is_output = sm
            .ports
            .iter()
            .any(|p| p.name == port && p.direction == PortDirection::Output);
        if !is_output {
            return Err(StructuralError::invalid_bt(format!("`{}` is not an output port", port)).into());
        }
        match binding.ports.iter().find(|(p, _)| p == port) {
            Some((_, PortValue::Blackboard(key))) => {
                let channel = blackboard_channel(key);
                let writes = self.payload(&channel, &[("value".to_string(), value.to_string())])?;
                Ok((channel, writes))
            }
            Some((_, PortValue::Literal(_))) => Err(StructuralError::invalid_bt(format!(
                "output port `{}` is bound to a literal",
                port
            ))
            .into()),
            None => Err(StructuralError::invalid_bt(format!("output port `{}` is not bound", port)).into()),
        }
    }

    /// Identifies "run `block`, then continue at `exit`" in the current
    /// trigger context
    fn key(&self, block: &[ActionId], exit: LocId) -> u64 {
        let mut hasher = FxHasher::default();
        self.sm.hash_block(block, &mut hasher);
        self.trigger.hash(&mut hasher);
        exit.hash(&mut hasher);
        hasher.finish()
    }

    /// Returns the memoized location for `key`, or creates it with one edge
    /// per alternative
    fn place(&mut self, key: u64, tag: &str, label: Option<&str>, alts: Vec<Alt>) -> LocId {
        if let Some(loc) = self.memo.get(&key) {
            return *loc;
        }
        let base = format!("{}-{}-{:08x}", self.source, tag, key as u32);
        let mut name = base.clone();
        let mut n = 1;
        while self.automaton.location_id(&name).is_some() {
            n += 1;
            name = format!("{}-{}", base, n);
        }
        let loc = self.automaton.add_location(name, LocationKind::Auxiliary);
        self.memo.insert(key, loc);
        self.emit(loc, label, alts);
        loc
    }

    fn emit(&mut self, from: LocId, label: Option<&str>, alts: Vec<Alt>) {
        for alt in alts {
            let action = match label {
                Some(label) => label.to_string(),
                None => self.internal(from, alt.target),
            };
            let assignments = self.assignments(alt.steps);
            self.automaton
                .edge(from, action, alt.guard, alt.target, assignments);
        }
    }

    fn internal(&self, from: LocId, to: LocId) -> String {
        format!(
            "{}-{}-{}",
            self.sm.name, self.automaton[from].name, self.automaton[to].name
        )
    }

    /// Numbers the steps; failed checks of a step raise the out-of-bounds
    /// flag at the same index
    fn assignments(&self, steps: Vec<Step>) -> Vec<Assignment> {
        let mut out = vec![];
        for (index, step) in steps.into_iter().enumerate() {
            let index = index as u32;
            for (target, value) in step.writes {
                out.push(Assignment {
                    target,
                    value,
                    index,
                });
            }
            let valid = Expr::conjunction(step.checks);
            if !valid.is_true() {
                out.push(Assignment {
                    target: LValue::var(self.flag.clone()),
                    value: Expr::or(Expr::var(self.flag.clone()), Expr::not(valid)),
                    index,
                });
            }
        }
        out
    }

    /// Lets every original state consume messages it does not handle, so
    /// that a broadcast never waits for an uninterested receiver
    fn discard_loops(&mut self) {
        for channel in self.receives.clone() {
            let label = on_receive(&channel);
            for loc in self.originals.clone() {
                let handled = Expr::disjunction(
                    self.automaton
                        .edges
                        .iter()
                        .filter(|e| e.location == loc && e.action == label)
                        .map(|e| e.guard.clone()),
                );
                let unhandled = Expr::not(handled);
                if matches!(unhandled, Expr::Bool(false)) {
                    continue;
                }
                self.automaton.edge(loc, label.clone(), unhandled, loc, vec![]);
            }
        }
    }
}

/// Probability of each destination. Omitted weights are allowed for a sole
/// destination or for one implicit complement.
fn probabilities(dests: &[Destination]) -> CompileResult<Vec<f64>> {
    const EPSILON: f64 = 1e-9;
    let fail = |details: String| -> CompileResult<Vec<f64>> {
        Err(StructuralError::NonExhaustiveBranches { details }.into())
    };
    match dests {
        [] => return fail("transition without destination".to_string()),
        [single] => {
            return match single.probability {
                None => Ok(vec![1.0]),
                Some(p) if (p - 1.0).abs() < EPSILON => Ok(vec![1.0]),
                Some(p) => fail(format!("the only destination has probability {}", p)),
            }
        }
        _ => {}
    }
    let implicit = dests.iter().filter(|d| d.probability.is_none()).count();
    if implicit > 1 {
        return fail(format!("{} destinations omit their probability", implicit));
    }
    if let Some(p) = dests
        .iter()
        .filter_map(|d| d.probability)
        .find(|p| !(0.0..=1.0).contains(p))
    {
        return fail(format!("{} is not a probability", p));
    }
    let sum: f64 = dests.iter().filter_map(|d| d.probability).sum();
    if implicit == 0 && (sum - 1.0).abs() > EPSILON {
        return fail(format!("probabilities sum to {}", sum));
    }
    if sum > 1.0 + EPSILON {
        return fail(format!("probabilities sum to {}", sum));
    }
    let rest = (1.0 - sum).max(0.0);
    Ok(dests
        .iter()
        .map(|d| d.probability.unwrap_or(rest))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{CompileError, CompileErrorKind};
    use crate::model::{Edge, Variable};
    use crate::ros::Declaration;
    use crate::translate::StringTable;
    use crate::types::{StructDef, StructRegistry};

    fn compile(sm: &StateMachine) -> CompileResult<Flattened> {
        let mut structs = StructRegistry::default();
        structs.add(StructDef::new("Msg", vec![("x".to_string(), Type::int32())]));
        let globals = FxHashMap::default();
        let mut strings = StringTable::default();
        let mut tr = Translator::new(&structs, &globals, &mut strings);
        for v in &sm.variables {
            tr.bind_local(&v.name, Binding::stored(v.name.clone(), v.tpe.clone(), true));
        }
        let mut ports = vec![];
        for decl in &sm.declarations {
            ports.extend(decl.ports(&sm.name)?);
        }
        let mut channels = ChannelTable::default();
        for port in &ports {
            channels.declare(port)?;
        }
        flatten(sm, &mut tr, &channels, &ports)
    }

    fn machine() -> StateMachine {
        let mut sm = StateMachine::new("m");
        sm.variables.push(Variable::local("n", Type::int32(), Some("0")));
        sm.variables.push(Variable::local("a", Type::fixed_array(Type::int32(), 3), None));
        sm.declarations.push(Declaration::Event {
            name: "go".to_string(),
            payload: Some("Msg".to_string()),
        });
        sm.declarations.push(Declaration::Event {
            name: "out".to_string(),
            payload: None,
        });
        sm.add_state("idle");
        sm.add_state("busy");
        sm
    }

    fn go() -> Option<Interface> {
        Some(Interface::Event("go".to_string()))
    }

    fn out() -> Interface {
        Interface::Event("out".to_string())
    }

    fn edges_from<'a>(f: &'a Flattened, loc: &str) -> Vec<&'a network::Edge> {
        let id = f.automaton.location_id(loc).unwrap();
        f.automaton.edges.iter().filter(|e| e.location == id).collect()
    }

    #[test]
    fn conditionals_become_guards() {
        let mut sm = machine();
        let idle = sm.state_id("idle").unwrap();
        let big = sm.assign("n", "1");
        let small = sm.assign("n", "2");
        let cond = sm.if_else(vec![("_event.x > 5", vec![big])], vec![small]);
        sm.transition(idle, go(), None, "busy", vec![cond]);
        let f = compile(&sm).unwrap();
        assert_eq!(f.num_auxiliary(), 0);
        let edges = edges_from(&f, "idle");
        let guards: Vec<String> = edges.iter().map(|e| e.guard.to_string()).collect();
        // two branches, then the discard loop for `go`
        assert_eq!(
            guards,
            vec!["go.x > 5", "!(go.x > 5)", "!((go.x > 5) || !(go.x > 5))"]
        );
        assert!(edges.iter().all(|e| e.action == "go_on_receive"));
        assert_eq!(f.receives, vec!["go"]);
    }

    #[test]
    fn assignment_read_by_later_condition_gets_own_edge() {
        let mut sm = machine();
        let idle = sm.state_id("idle").unwrap();
        let inc = sm.assign("n", "n + 1");
        let reset = sm.assign("n", "0");
        let cond = sm.if_else(vec![("n > 3", vec![reset])], vec![]);
        sm.transition(idle, None, None, "busy", vec![inc, cond]);
        let f = compile(&sm).unwrap();
        assert_eq!(f.num_auxiliary(), 1);
        let first = edges_from(&f, "idle");
        assert_eq!(first.len(), 1);
        assert!(first[0].guard.is_true());
        let aux = first[0].destinations[0].location;
        assert_eq!(f.automaton[aux].kind, LocationKind::Auxiliary);
        let second: Vec<_> = f.automaton.edges.iter().filter(|e| e.location == aux).collect();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].guard.to_string(), "n > 3");
    }

    #[test]
    fn independent_steps_share_an_edge() {
        let mut sm = machine();
        let idle = sm.state_id("idle").unwrap();
        let set = sm.assign("a[0]", "7");
        let inc = sm.assign("n", "n + 1");
        sm.transition(idle, None, Some("n < 3"), "idle", vec![set, inc]);
        let f = compile(&sm).unwrap();
        let edges = edges_from(&f, "idle");
        assert_eq!(edges.len(), 1);
        let indices: Vec<u32> = edges[0].destinations[0]
            .assignments
            .iter()
            .map(|a| a.index)
            .collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn sends_are_separate_edges() {
        let mut sm = machine();
        let idle = sm.state_id("idle").unwrap();
        let first = sm.send(out(), &[]);
        let second = sm.send(out(), &[]);
        sm.transition(idle, go(), None, "busy", vec![first, second]);
        let f = compile(&sm).unwrap();
        assert_eq!(f.num_auxiliary(), 2);
        let sends: Vec<_> = f
            .automaton
            .edges
            .iter()
            .filter(|e| e.action == "out_on_send")
            .collect();
        assert_eq!(sends.len(), 2);
        // the second send leads to the target state
        let busy = f.automaton.location_id("busy").unwrap();
        assert_eq!(sends.iter().filter(|e| e.destinations[0].location == busy).count(), 1);
        assert_eq!(f.sends, vec!["out"]);
    }

    #[test]
    fn equal_continuations_are_shared() {
        let mut sm = machine();
        let idle = sm.state_id("idle").unwrap();
        let busy = sm.state_id("busy").unwrap();
        let a = sm.send(out(), &[]);
        let b = sm.send(out(), &[]);
        sm.transition(idle, None, Some("n == 0"), "busy", vec![a]);
        sm.transition(busy, None, Some("n == 0"), "busy", vec![b]);
        let f = compile(&sm).unwrap();
        assert_eq!(f.num_auxiliary(), 1);
    }

    #[test]
    fn branches_before_a_send_join() {
        let mut sm = machine();
        let idle = sm.state_id("idle").unwrap();
        let one = sm.assign("n", "1");
        let two = sm.assign("n", "2");
        let cond = sm.if_else(vec![("n == 0", vec![one])], vec![two]);
        let send = sm.send(out(), &[]);
        sm.transition(idle, None, None, "busy", vec![cond, send]);
        let f = compile(&sm).unwrap();
        // both branches continue at the same send location
        let edges = edges_from(&f, "idle");
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].destinations[0].location, edges[1].destinations[0].location);
        assert_eq!(f.num_auxiliary(), 1);
    }

    #[test]
    fn payload_written_on_send() {
        let mut sm = machine();
        sm.declarations.push(Declaration::Publisher {
            topic: "/pose".to_string(),
            msg: "Msg".to_string(),
        });
        let idle = sm.state_id("idle").unwrap();
        let publish = sm.send(Interface::Topic("/pose".to_string()), &[("x", "n + 1")]);
        sm.transition(idle, None, None, "busy", vec![publish]);
        let f = compile(&sm).unwrap();
        let send = f
            .automaton
            .edges
            .iter()
            .find(|e| e.action == "topic_pose_msg_on_send")
            .unwrap();
        let targets: Vec<String> = send.destinations[0]
            .assignments
            .iter()
            .map(|a| a.target.to_string())
            .collect();
        assert_eq!(targets, vec!["topic_pose_msg.x", "topic_pose_msg.valid"]);

        let mut sm = machine();
        let idle = sm.state_id("idle").unwrap();
        let bad = sm.send(out(), &[("x", "1")]);
        sm.transition(idle, None, None, "busy", vec![bad]);
        assert!(compile(&sm).is_err());
    }

    #[test]
    fn probabilistic_destinations() {
        let mut sm = machine();
        let idle = sm.state_id("idle").unwrap();
        let inc = sm.assign("n", "n + 1");
        sm.add_edge(Edge {
            source: idle,
            trigger: None,
            guard: Some("n < 2".to_string()),
            destinations: vec![
                Destination {
                    target: "busy".to_string(),
                    probability: Some(0.25),
                    body: vec![inc],
                },
                Destination {
                    target: "idle".to_string(),
                    probability: None,
                    body: vec![],
                },
            ],
        });
        let f = compile(&sm).unwrap();
        let edges = edges_from(&f, "idle");
        assert_eq!(edges.len(), 1);
        let probs: Vec<_> = edges[0]
            .destinations
            .iter()
            .map(|d| d.probability.clone())
            .collect();
        assert_eq!(probs, vec![Some(Expr::Real(0.25)), Some(Expr::Real(0.75))]);
    }

    #[test]
    fn partial_partitions_are_rejected() {
        let dest = |p: Option<f64>| Destination {
            target: "busy".to_string(),
            probability: p,
            body: vec![],
        };
        let non_exhaustive = |r: CompileResult<Vec<f64>>| {
            matches!(
                r,
                Err(CompileError {
                    kind: CompileErrorKind::Structural(StructuralError::NonExhaustiveBranches { .. }),
                    ..
                })
            )
        };
        assert!(non_exhaustive(probabilities(&[dest(Some(0.5)), dest(Some(0.2))])));
        assert!(non_exhaustive(probabilities(&[dest(None), dest(None)])));
        assert!(non_exhaustive(probabilities(&[dest(Some(0.5))])));
        assert!(non_exhaustive(probabilities(&[dest(Some(0.9)), dest(Some(0.3)), dest(None)])));
        assert_eq!(probabilities(&[dest(Some(0.5)), dest(Some(0.5))]).unwrap(), vec![0.5, 0.5]);
    }

    #[test]
    fn first_entry_runs_once() {
        let mut sm = machine();
        let idle = sm.state_id("idle").unwrap();
        let init = sm.assign("n", "5");
        sm.state_mut(idle).on_entry.push(init);
        let f = compile(&sm).unwrap();
        assert_eq!(f.automaton[f.automaton.initial].name, "idle-first-exec");
        let edges = edges_from(&f, "idle-first-exec");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].action, "m-idle-first-exec-idle");
    }

    #[test]
    fn unknown_channels_and_context() {
        let mut sm = machine();
        let idle = sm.state_id("idle").unwrap();
        sm.transition(idle, None, None, "busy", vec![]);
        sm.transition(idle, Some(Interface::Event("nope".to_string())), None, "busy", vec![]);
        let err = compile(&sm).unwrap_err();
        assert_eq!(
            err.kind,
            CompileErrorKind::Structural(StructuralError::unknown_channel("nope"))
        );
        assert_eq!(err.context.state.as_deref(), Some("idle"));
        assert_eq!(err.context.edge, Some(1));

        // the index counts transitions of the failing state only
        let mut sm = machine();
        let idle = sm.state_id("idle").unwrap();
        let busy = sm.state_id("busy").unwrap();
        sm.transition(idle, None, Some("n > 0"), "busy", vec![]);
        sm.transition(idle, None, None, "idle", vec![]);
        sm.transition(busy, Some(Interface::Event("nope".to_string())), None, "idle", vec![]);
        let err = compile(&sm).unwrap_err();
        assert_eq!(err.context.state.as_deref(), Some("busy"));
        assert_eq!(err.context.edge, Some(0));
    }

    #[test]
    fn siblings_are_ordered() {
        let mut sm = machine();
        let idle = sm.state_id("idle").unwrap();
        sm.transition(idle, None, Some("n > 1"), "busy", vec![]);
        sm.transition(idle, None, Some("n > 0"), "busy", vec![]);
        let f = compile(&sm).unwrap();
        let guards: Vec<String> = edges_from(&f, "idle")
            .iter()
            .map(|e| e.guard.to_string())
            .collect();
        assert_eq!(guards, vec!["n > 1", "!(n > 1) && (n > 0)"]);
    }
}
