// Copyright 2025 Cornell University
// released under MIT License

use cranelift_entity::{entity_impl, PrimaryMap};
use itertools::Itertools;
use rustc_hash::FxHashMap;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::ops::Index;

use crate::bt::{BehaviorTree, PortDecl, PortValue};
use crate::errors::{CompileResult, StructuralError, WithContext};
use crate::properties::Property;
use crate::ros::{Declaration, Interface};
use crate::types::{StructRegistry, Type};

#[derive(Clone, Copy, Hash, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct StateId(u32);
entity_impl!(StateId, "state");

#[derive(Clone, Copy, Hash, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct EdgeId(u32);
entity_impl!(EdgeId, "edge");

#[derive(Clone, Copy, Hash, PartialEq, Eq, Default)]
pub struct ActionId(u32);
entity_impl!(ActionId, "action");

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Scope {
    Local,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub tpe: Type,
    /// Expression text, evaluated once before the model starts
    pub init: Option<String>,
    pub scope: Scope,
}

impl Variable {
    pub fn local(name: impl Into<String>, tpe: Type, init: Option<&str>) -> Self {
        Self {
            name: name.into(),
            tpe,
            init: init.map(str::to_string),
            scope: Scope::Local,
        }
    }

    pub fn global(name: impl Into<String>, tpe: Type, init: Option<&str>) -> Self {
        Self {
            scope: Scope::Global,
            ..Self::local(name, tpe, init)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    name: String,
    pub on_entry: Vec<ActionId>,
    pub on_exit: Vec<ActionId>,
}

impl State {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One element of an action block. Conditionals own nested blocks.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum Action {
    /// `target = value`, where `target` is a name path like `a.b[i].c`
    Assign { target: String, value: String },
    /// `if c0 {..} else if c1 {..} else {..}`
    If {
        branches: Vec<(String, Vec<ActionId>)>,
        otherwise: Vec<ActionId>,
    },
    /// Send a message, `params` assign payload fields
    Send {
        interface: Interface,
        params: Vec<(String, String)>,
    },
    /// Write a behavior tree output port
    SetOutput { port: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub target: String,
    /// Literal weight; `None` for the sole branch or the implicit complement
    pub probability: Option<f64>,
    pub body: Vec<ActionId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub source: StateId,
    /// Message that triggers the transition. Eventless transitions fire
    /// whenever their guard holds.
    pub trigger: Option<Interface>,
    pub guard: Option<String>,
    pub destinations: Vec<Destination>,
}

/// The behavior tree node an automaton implements, with its port bindings
#[derive(Debug, Clone, PartialEq)]
pub struct BtBinding {
    pub id: u32,
    pub ports: Vec<(String, PortValue)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateMachine {
    pub name: String,
    pub variables: Vec<Variable>,
    pub declarations: Vec<Declaration>,
    /// Ports of a behavior tree plugin template
    pub ports: Vec<PortDecl>,
    pub bt: Option<BtBinding>,
    /// Add self-loops that consume messages a state does not handle
    pub discard_unhandled: bool,
    pub initial: Option<StateId>,
    states: PrimaryMap<StateId, State>,
    edges: PrimaryMap<EdgeId, Edge>,
    actions: PrimaryMap<ActionId, Action>,
}

impl StateMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: vec![],
            declarations: vec![],
            ports: vec![],
            bt: None,
            discard_unhandled: true,
            initial: None,
            states: PrimaryMap::new(),
            edges: PrimaryMap::new(),
            actions: PrimaryMap::new(),
        }
    }

    /// add a new action to the arena
    pub fn a(&mut self, action: Action) -> ActionId {
        self.actions.push(action)
    }

    pub fn assign(&mut self, target: &str, value: &str) -> ActionId {
        self.a(Action::Assign {
            target: target.to_string(),
            value: value.to_string(),
        })
    }

    pub fn send(&mut self, interface: Interface, params: &[(&str, &str)]) -> ActionId {
        self.a(Action::Send {
            interface,
            params: params
                .iter()
                .map(|(f, v)| (f.to_string(), v.to_string()))
                .collect(),
        })
    }

    pub fn if_else(
        &mut self,
        branches: Vec<(&str, Vec<ActionId>)>,
        otherwise: Vec<ActionId>,
    ) -> ActionId {
        self.a(Action::If {
            branches: branches
                .into_iter()
                .map(|(c, b)| (c.to_string(), b))
                .collect(),
            otherwise,
        })
    }

    /// Adds a state; the first state added is the initial one unless
    /// `initial` is set explicitly.
    pub fn add_state(&mut self, name: &str) -> StateId {
        let id = self.states.push(State {
            name: name.to_string(),
            on_entry: vec![],
            on_exit: vec![],
        });
        if self.initial.is_none() {
            self.initial = Some(id);
        }
        id
    }

    pub fn state_mut(&mut self, id: StateId) -> &mut State {
        &mut self.states[id]
    }

    pub fn add_edge(&mut self, edge: Edge) -> EdgeId {
        self.edges.push(edge)
    }

    /// Adds a single-destination transition
    pub fn transition(
        &mut self,
        source: StateId,
        trigger: Option<Interface>,
        guard: Option<&str>,
        target: &str,
        body: Vec<ActionId>,
    ) -> EdgeId {
        self.add_edge(Edge {
            source,
            trigger,
            guard: guard.map(str::to_string),
            destinations: vec![Destination {
                target: target.to_string(),
                probability: None,
                body,
            }],
        })
    }

    pub fn state_id(&self, name: &str) -> Option<StateId> {
        self.states
            .iter()
            .find(|(_, s)| s.name == name)
            .map(|(id, _)| id)
    }

    pub fn states(&self) -> impl Iterator<Item = (StateId, &State)> {
        self.states.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &Edge)> {
        self.edges.iter()
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn edges_from(&self, state: StateId) -> impl Iterator<Item = (EdgeId, &Edge)> {
        self.edges.iter().filter(move |(_, e)| e.source == state)
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Checks names: states and variables are unique, the automaton has an
    /// initial state and every destination targets an existing state.
    pub fn check_structure(&self) -> CompileResult<()> {
        let initial = self.initial.ok_or(StructuralError::MissingInitialState);
        initial.map_err(|e| e.into()).in_automaton(&self.name)?;
        let mut seen: FxHashMap<&str, StateId> = FxHashMap::default();
        for (id, state) in self.states.iter() {
            if seen.insert(state.name(), id).is_some() {
                return Err(StructuralError::DuplicateState {
                    name: state.name.clone(),
                }
                .into())
                .in_automaton(&self.name);
            }
        }
        let mut vars: FxHashMap<&str, ()> = FxHashMap::default();
        for var in &self.variables {
            if vars.insert(&var.name, ()).is_some() {
                return Err(StructuralError::DuplicateVariable {
                    name: var.name.clone(),
                }
                .into())
                .in_automaton(&self.name);
            }
        }
        for (id, edge) in self.edges.iter() {
            for dest in &edge.destinations {
                if !seen.contains_key(dest.target.as_str()) {
                    return Err(StructuralError::unknown_state(&dest.target).into())
                        .at_edge(id.as_u32() as usize)
                        .at_state(self.states[edge.source].name())
                        .in_automaton(&self.name);
                }
            }
        }
        Ok(())
    }

    /// Feeds the structure of a block (not the arena ids) into `state`, so
    /// that identical blocks hash identically wherever they are stored.
    pub fn hash_block<H: Hasher>(&self, block: &[ActionId], state: &mut H) {
        block.len().hash(state);
        for id in block {
            match &self.actions[*id] {
                Action::If {
                    branches,
                    otherwise,
                } => {
                    "if".hash(state);
                    branches.len().hash(state);
                    for (cond, body) in branches {
                        cond.hash(state);
                        self.hash_block(body, state);
                    }
                    self.hash_block(otherwise, state);
                }
                other => other.hash(state),
            }
        }
    }

    /// Returns `true` if the block sends a message anywhere
    pub fn block_sends(&self, block: &[ActionId]) -> bool {
        block.iter().any(|id| match &self.actions[*id] {
            Action::Send { .. } | Action::SetOutput { .. } => true,
            Action::If {
                branches,
                otherwise,
            } => branches.iter().any(|(_, b)| self.block_sends(b)) || self.block_sends(otherwise),
            Action::Assign { .. } => false,
        })
    }

    /// Collects every message sent by the block, in order
    pub fn sent_interfaces(&self, block: &[ActionId], out: &mut Vec<Interface>) {
        for id in block {
            match &self.actions[*id] {
                Action::Send { interface, .. } => out.push(interface.clone()),
                Action::SetOutput { .. } | Action::Assign { .. } => {}
                Action::If {
                    branches,
                    otherwise,
                } => {
                    for (_, body) in branches {
                        self.sent_interfaces(body, out);
                    }
                    self.sent_interfaces(otherwise, out);
                }
            }
        }
    }

    /// Pretty-prints a block, one action per line
    pub fn format_block(&self, block: &[ActionId]) -> String {
        let mut buffer: Vec<u8> = vec![];
        // writing into a Vec cannot fail
        let _ = self.build_block(&mut buffer, block, 0);
        String::from_utf8_lossy(&buffer).trim_end().to_string()
    }

    fn build_block(
        &self,
        out: &mut impl Write,
        block: &[ActionId],
        indent: usize,
    ) -> std::io::Result<()> {
        for id in block {
            match &self.actions[*id] {
                Action::Assign { target, value } => {
                    writeln!(out, "{}{} := {};", "  ".repeat(indent), target, value)?
                }
                Action::Send { interface, params } => {
                    let params = params
                        .iter()
                        .map(|(f, v)| format!("{f}: {v}"))
                        .join(", ");
                    writeln!(out, "{}send {}({});", "  ".repeat(indent), interface, params)?
                }
                Action::SetOutput { port, value } => {
                    writeln!(out, "{}set_output {} := {};", "  ".repeat(indent), port, value)?
                }
                Action::If {
                    branches,
                    otherwise,
                } => {
                    for (i, (cond, body)) in branches.iter().enumerate() {
                        let keyword = if i == 0 { "if" } else { "} else if" };
                        writeln!(out, "{}{} ({}) {{", "  ".repeat(indent), keyword, cond)?;
                        self.build_block(out, body, indent + 1)?;
                    }
                    if !otherwise.is_empty() {
                        writeln!(out, "{}}} else {{", "  ".repeat(indent))?;
                        self.build_block(out, otherwise, indent + 1)?;
                    }
                    writeln!(out, "{}}}", "  ".repeat(indent))?;
                }
            }
        }
        Ok(())
    }
}

impl Index<ActionId> for StateMachine {
    type Output = Action;

    fn index(&self, index: ActionId) -> &Self::Output {
        &self.actions[index]
    }
}

impl Index<&ActionId> for StateMachine {
    type Output = Action;

    fn index(&self, index: &ActionId) -> &Self::Output {
        &self.actions[*index]
    }
}

impl Index<StateId> for StateMachine {
    type Output = State;

    fn index(&self, index: StateId) -> &Self::Output {
        &self.states[index]
    }
}

impl Index<EdgeId> for StateMachine {
    type Output = Edge;

    fn index(&self, index: EdgeId) -> &Self::Output {
        &self.edges[index]
    }
}

/// Everything a compilation starts from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Project {
    pub structs: StructRegistry,
    pub automata: Vec<StateMachine>,
    /// Templates instantiated for behavior tree leaves, keyed by name
    pub plugins: Vec<StateMachine>,
    pub trees: Vec<BehaviorTree>,
    pub properties: Vec<Property>,
}

impl Project {
    pub fn plugin(&self, name: &str) -> Option<&StateMachine> {
        self.plugins.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHasher;

    fn counter() -> StateMachine {
        let mut sm = StateMachine::new("counter");
        sm.variables.push(Variable::local("n", Type::int32(), Some("0")));
        let idle = sm.add_state("idle");
        sm.add_state("done");
        let inc = sm.assign("n", "n + 1");
        let stop = sm.send(Interface::Event("stop".to_string()), &[]);
        let cond = sm.if_else(vec![("n > 3", vec![stop])], vec![]);
        sm.transition(idle, None, Some("n < 5"), "idle", vec![inc, cond]);
        sm
    }

    #[test]
    fn build_and_print() {
        let sm = counter();
        assert_eq!(sm.initial, sm.state_id("idle"));
        let (_, edge) = sm.edges().next().unwrap();
        assert_eq!(
            sm.format_block(&edge.destinations[0].body),
            "n := n + 1;\nif (n > 3) {\n  send event stop();\n}"
        );
        assert!(sm.block_sends(&edge.destinations[0].body));
        assert!(sm.check_structure().is_ok());
    }

    #[test]
    fn structural_hash_ignores_arena_ids() {
        let mut sm = counter();
        let a = sm.assign("n", "0");
        let _unrelated = sm.assign("m", "1");
        let b = sm.assign("n", "0");
        let hash = |block: &[ActionId]| {
            let mut h = FxHasher::default();
            sm.hash_block(block, &mut h);
            h.finish()
        };
        assert_eq!(hash(&[a]), hash(&[b]));
        assert_ne!(hash(&[a]), hash(&[a, b]));
    }

    #[test]
    fn structure_errors() {
        let mut sm = counter();
        let idle = sm.state_id("idle").unwrap();
        sm.transition(idle, None, None, "nowhere", vec![]);
        let err = sm.check_structure().unwrap_err();
        assert_eq!(err.context.automaton.as_deref(), Some("counter"));
        assert_eq!(err.context.state.as_deref(), Some("idle"));
        assert_eq!(err.context.edge, Some(1));

        let mut sm = counter();
        sm.add_state("idle");
        assert!(sm.check_structure().is_err());
        assert!(StateMachine::new("empty").check_structure().is_err());
    }
}
