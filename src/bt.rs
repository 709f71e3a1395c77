// Copyright 2025 Cornell University
// released under MIT License

//! Behavior trees are compiled into ordinary state machines: one automaton
//! per node, a root automaton that ticks the tree periodically and, if any
//! output port writes the blackboard, one automaton owning the blackboard.
//! Nodes talk over the `bt_<id>_<signal>` channels.

use serde::Deserialize;

use crate::config::Config;
use crate::errors::{CompileResult, StructuralError, TypeError};
use crate::model::{ActionId, BtBinding, StateMachine, Variable};
use crate::ros::{bt_channel, bt_node_ports, blackboard_channel, BtSignal, Declaration, Interface, Port, Role};
use crate::translate::{Binding, Translator};
use crate::types::{StructDef, Type};

/// Id of the first node; ids grow in depth-first order over all trees
pub const FIRST_NODE_ID: u32 = 1000;
/// Global struct holding every blackboard entry
pub const BLACKBOARD: &str = "bt_blackboard";
/// The only automaton allowed to write `BLACKBOARD`
pub const BLACKBOARD_FSM: &str = "bt_blackboard_fsm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

/// A port declared by a leaf plugin
#[derive(Debug, Clone, PartialEq)]
pub struct PortDecl {
    pub name: String,
    pub tpe: Type,
    pub direction: PortDirection,
}

/// What a port is connected to in a tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortValue {
    Literal(String),
    /// `{key}`
    Blackboard(String),
}

impl PortValue {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        match trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
        {
            Some(key) => PortValue::Blackboard(key.trim().to_string()),
            None => PortValue::Literal(text.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Sequence,
    ReactiveSequence,
    SequenceWithMemory,
    Fallback,
    ReactiveFallback,
    RetryUntilSuccessful(u32),
    IfThenElse,
    Inverter,
    ForceSuccess,
    ForceFailure,
    /// Leaf implemented by the named plugin
    Action(String),
    Condition(String),
}

impl NodeKind {
    pub fn name(&self) -> &str {
        match self {
            NodeKind::Sequence => "Sequence",
            NodeKind::ReactiveSequence => "ReactiveSequence",
            NodeKind::SequenceWithMemory => "SequenceWithMemory",
            NodeKind::Fallback => "Fallback",
            NodeKind::ReactiveFallback => "ReactiveFallback",
            NodeKind::RetryUntilSuccessful(_) => "RetryUntilSuccessful",
            NodeKind::IfThenElse => "IfThenElse",
            NodeKind::Inverter => "Inverter",
            NodeKind::ForceSuccess => "ForceSuccess",
            NodeKind::ForceFailure => "ForceFailure",
            NodeKind::Action(plugin) | NodeKind::Condition(plugin) => plugin,
        }
    }

    fn plugin(&self) -> Option<&str> {
        match self {
            NodeKind::Action(plugin) | NodeKind::Condition(plugin) => Some(plugin),
            _ => None,
        }
    }

    /// Allowed number of children
    fn arity(&self) -> (usize, usize) {
        match self {
            NodeKind::Sequence
            | NodeKind::ReactiveSequence
            | NodeKind::SequenceWithMemory
            | NodeKind::Fallback
            | NodeKind::ReactiveFallback => (1, usize::MAX),
            NodeKind::RetryUntilSuccessful(_)
            | NodeKind::Inverter
            | NodeKind::ForceSuccess
            | NodeKind::ForceFailure => (1, 1),
            NodeKind::IfThenElse => (2, 3),
            NodeKind::Action(_) | NodeKind::Condition(_) => (0, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BtNode {
    pub kind: NodeKind,
    pub ports: Vec<(String, PortValue)>,
    pub children: Vec<BtNode>,
}

impl BtNode {
    pub fn new(kind: NodeKind, children: Vec<BtNode>) -> Self {
        Self {
            kind,
            ports: vec![],
            children,
        }
    }

    pub fn leaf(plugin: &str, ports: &[(&str, &str)]) -> Self {
        Self {
            kind: NodeKind::Action(plugin.to_string()),
            ports: ports
                .iter()
                .map(|(p, v)| (p.to_string(), PortValue::parse(v)))
                .collect(),
            children: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlackboardEntry {
    pub key: String,
    pub tpe: Type,
    pub init: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorTree {
    pub name: String,
    pub root: BtNode,
    pub blackboard: Vec<BlackboardEntry>,
}

/// Everything the trees of a project expand to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instantiated {
    pub automata: Vec<StateMachine>,
    /// Blackboard struct and blackboard message payloads
    pub structs: Vec<StructDef>,
    pub blackboard: Vec<BlackboardEntry>,
}

impl Instantiated {
    /// Type of the blackboard global, if there is a blackboard
    pub fn blackboard_type(&self) -> Option<Type> {
        (!self.blackboard.is_empty()).then(|| Type::Struct(BLACKBOARD.to_string()))
    }
}

pub fn payload_struct(key: &str) -> String {
    format!("{}/{}", BLACKBOARD, key)
}

/// Expands all trees into automata
pub fn instantiate(
    trees: &[BehaviorTree],
    plugins: &[StateMachine],
    config: &Config,
) -> CompileResult<Instantiated> {
    let mut out = Instantiated::default();
    let mut next_id = FIRST_NODE_ID;
    let mut written: Vec<String> = vec![];
    for tree in trees {
        for entry in &tree.blackboard {
            match out.blackboard.iter().find(|e| e.key == entry.key) {
                Some(first) if first.tpe != entry.tpe => {
                    return Err(TypeError::GlobalConflict {
                        name: format!("{}.{}", BLACKBOARD, entry.key),
                        first: first.tpe.clone(),
                        second: entry.tpe.clone(),
                    }
                    .into())
                }
                Some(_) => {}
                None => out.blackboard.push(entry.clone()),
            }
        }
        let root_id = next_id;
        let mut nodes = vec![];
        expand(&tree.root, &mut next_id, plugins, &out.blackboard, &mut written, &mut nodes)?;
        out.automata.push(root_automaton(tree, root_id, config));
        out.automata.extend(nodes);
        log::debug!("tree `{}` has {} nodes", tree.name, next_id - root_id);
    }
    if !out.blackboard.is_empty() {
        out.structs.push(StructDef::new(
            BLACKBOARD,
            out.blackboard
                .iter()
                .map(|e| (e.key.clone(), e.tpe.clone()))
                .collect(),
        ));
    }
    if !written.is_empty() {
        let mut fsm = StateMachine::new(BLACKBOARD_FSM);
        let idle = fsm.add_state("idle");
        for key in &written {
            let Some(entry) = out.blackboard.iter().find(|e| &e.key == key) else {
                continue;
            };
            out.structs.push(StructDef::new(
                payload_struct(key),
                vec![("value".to_string(), entry.tpe.clone())],
            ));
            let channel = blackboard_channel(key);
            fsm.declarations.push(Declaration::Event {
                name: channel.clone(),
                payload: Some(payload_struct(key)),
            });
            let store = fsm.assign(&format!("{}.{}", BLACKBOARD, key), "_event.value");
            fsm.transition(idle, Some(Interface::Event(channel)), None, "idle", vec![store]);
        }
        out.automata.push(fsm);
    }
    Ok(out)
}

/// Depth-first expansion; returns the id assigned to `node`
fn expand(
    node: &BtNode,
    next_id: &mut u32,
    plugins: &[StateMachine],
    blackboard: &[BlackboardEntry],
    written: &mut Vec<String>,
    out: &mut Vec<StateMachine>,
) -> CompileResult<u32> {
    let id = *next_id;
    *next_id += 1;
    let (min, max) = node.kind.arity();
    if node.children.len() < min || node.children.len() > max {
        return Err(StructuralError::invalid_bt(format!(
            "node {} ({}) has {} children",
            id,
            node.kind.name(),
            node.children.len()
        ))
        .into());
    }
    if let Some(plugin) = node.kind.plugin() {
        let template = plugins
            .iter()
            .find(|p| p.name == plugin)
            .ok_or_else(|| StructuralError::invalid_bt(format!("unknown plugin `{}`", plugin)))?;
        out.push(leaf(id, node, template, blackboard, written)?);
        return Ok(id);
    }
    // the node automaton precedes its subtree
    let slot = out.len();
    let mut children = vec![];
    for child in &node.children {
        children.push(expand(child, next_id, plugins, blackboard, written, out)?);
    }
    out.insert(slot, control_node(id, &node.kind, children));
    Ok(id)
}

fn leaf(
    id: u32,
    node: &BtNode,
    template: &StateMachine,
    blackboard: &[BlackboardEntry],
    written: &mut Vec<String>,
) -> CompileResult<StateMachine> {
    let mut sm = template.clone();
    sm.name = format!("{}_{}", id, template.name);
    for (port, value) in &node.ports {
        let decl = template
            .ports
            .iter()
            .find(|p| &p.name == port)
            .ok_or_else(|| {
                StructuralError::invalid_bt(format!(
                    "plugin `{}` has no port `{}`",
                    template.name, port
                ))
            })?;
        match value {
            PortValue::Blackboard(key) => {
                let entry = blackboard.iter().find(|e| &e.key == key).ok_or_else(|| {
                    StructuralError::invalid_bt(format!("no blackboard entry `{}`", key))
                })?;
                if entry.tpe != decl.tpe {
                    return Err(TypeError::mismatch(
                        "port binding",
                        format!(
                            "port `{}` of type {} bound to `{}` of type {}",
                            port, decl.tpe, key, entry.tpe
                        ),
                    )
                    .into());
                }
                if decl.direction == PortDirection::Output && !written.contains(key) {
                    written.push(key.clone());
                }
            }
            PortValue::Literal(_) if decl.direction == PortDirection::Output => {
                return Err(StructuralError::invalid_bt(format!(
                    "output port `{}` of node {} is bound to a literal",
                    port, id
                ))
                .into())
            }
            PortValue::Literal(_) => {}
        }
    }
    for decl in &template.ports {
        let bound = node.ports.iter().any(|(p, _)| p == &decl.name);
        if decl.direction == PortDirection::Input && !bound {
            return Err(StructuralError::invalid_bt(format!(
                "input port `{}` of node {} is not bound",
                decl.name, id
            ))
            .into());
        }
    }
    sm.bt = Some(BtBinding {
        id,
        ports: node.ports.clone(),
    });
    Ok(sm)
}

/// End points implied by being a behavior tree node
pub fn implied_ports(sm: &StateMachine) -> Vec<Port> {
    let Some(binding) = &sm.bt else {
        return vec![];
    };
    let mut ports = bt_node_ports(binding.id);
    for (port, value) in &binding.ports {
        let output = sm
            .ports
            .iter()
            .any(|p| &p.name == port && p.direction == PortDirection::Output);
        if let (true, PortValue::Blackboard(key)) = (output, value) {
            ports.push(Port {
                channel: blackboard_channel(key),
                role: Role::Send,
                payload: Some(payload_struct(key)),
                period: None,
            });
        }
    }
    ports
}

/// Makes the input ports of a leaf readable as variables
pub fn bind_ports(sm: &StateMachine, tr: &mut Translator) -> CompileResult<()> {
    let Some(binding) = &sm.bt else {
        return Ok(());
    };
    for (port, value) in &binding.ports {
        let Some(decl) = sm.ports.iter().find(|p| &p.name == port) else {
            continue;
        };
        if decl.direction == PortDirection::Output {
            continue;
        }
        let bound = match value {
            PortValue::Literal(text) => {
                let text = match &decl.tpe {
                    Type::Str if !text.starts_with(['\'', '"']) => quote(text),
                    _ => text.clone(),
                };
                Binding::Constant(tr.constant(&text, &decl.tpe)?)
            }
            PortValue::Blackboard(key) => {
                Binding::stored(format!("{}.{}", BLACKBOARD, key), decl.tpe.clone(), false)
            }
        };
        tr.bind_local(port, bound);
    }
    Ok(())
}

fn quote(text: &str) -> String {
    if text.contains('\'') {
        format!("\"{}\"", text)
    } else {
        format!("'{}'", text)
    }
}

/// Periodically ticks the root of `tree` and waits for its answer
fn root_automaton(tree: &BehaviorTree, root: u32, config: &Config) -> StateMachine {
    let mut sm = StateMachine::new(format!("bt_root_fsm_{}", tree.name));
    let timer = format!("{}_tick", tree.name);
    sm.declarations.push(Declaration::Timer {
        name: timer.clone(),
        rate_hz: config.bt_tick_rate,
    });
    for signal in BtSignal::ALL {
        sm.declarations.push(Declaration::Event {
            name: bt_channel(root, signal),
            payload: None,
        });
    }
    // the timer stays pending while the tree works on a tick
    sm.discard_unhandled = false;
    let idle = sm.add_state("idle");
    let waiting = sm.add_state("wait_tick_res");
    let done = sm.add_state("done");
    let child = |signal| Some(Interface::Event(bt_channel(root, signal)));
    let tick = sm.send(Interface::Event(bt_channel(root, BtSignal::Tick)), &[]);
    sm.transition(
        idle,
        Some(Interface::Timer(timer.clone())),
        None,
        "wait_tick_res",
        vec![tick],
    );
    sm.transition(waiting, child(BtSignal::Running), None, "idle", vec![]);
    let after = if config.bt_tick_if_not_running {
        "idle"
    } else {
        "done"
    };
    sm.transition(waiting, child(BtSignal::Success), None, after, vec![]);
    sm.transition(waiting, child(BtSignal::Failure), None, after, vec![]);
    sm.transition(done, Some(Interface::Timer(timer)), None, "done", vec![]);
    sm
}

/// Builder for control node automata. A control node waits in `idle` for a
/// tick, forwards it to a child, waits in `running_child` for the child's
/// answer and eventually answers its own parent.
struct Control {
    sm: StateMachine,
    children: Vec<u32>,
}

impl Control {
    fn new(id: u32, kind: &NodeKind, children: Vec<u32>) -> Self {
        let mut sm = StateMachine::new(format!("{}_{}", id, kind.name()));
        sm.bt = Some(BtBinding { id, ports: vec![] });
        for child in &children {
            for signal in BtSignal::ALL {
                sm.declarations.push(Declaration::Event {
                    name: bt_channel(*child, signal),
                    payload: None,
                });
            }
        }
        sm.add_state("idle");
        sm.add_state("running_child");
        Self { sm, children }
    }

    fn counter(&mut self, name: &str) {
        self.sm
            .variables
            .push(Variable::local(name, Type::int32(), Some("0")));
    }

    fn child(&self, i: usize, signal: BtSignal) -> Interface {
        Interface::Event(bt_channel(self.children[i], signal))
    }

    fn tick(&mut self, i: usize) -> ActionId {
        let child = self.child(i, BtSignal::Tick);
        self.sm.send(child, &[])
    }

    fn reply(&mut self, signal: BtSignal) -> ActionId {
        self.sm.send(Interface::Bt(signal), &[])
    }

    fn set(&mut self, var: &str, value: usize) -> ActionId {
        self.sm.assign(var, &value.to_string())
    }

    /// Ticks the child whose index is stored in `var`
    fn tick_indexed(&mut self, var: &str) -> ActionId {
        if self.children.len() == 1 {
            return self.tick(0);
        }
        let mut branches = vec![];
        for i in 1..self.children.len() {
            branches.push((format!("{} == {}", var, i), vec![self.tick(i)]));
        }
        let first = self.tick(0);
        self.sm.a(crate::model::Action::If {
            branches,
            otherwise: vec![first],
        })
    }

    fn on_tick(&mut self, body: Vec<ActionId>) {
        let idle = self.state("idle");
        self.sm.transition(
            idle,
            Some(Interface::Bt(BtSignal::Tick)),
            None,
            "running_child",
            body,
        );
    }

    fn on_child(
        &mut self,
        i: usize,
        signal: BtSignal,
        guard: Option<&str>,
        target: &str,
        body: Vec<ActionId>,
    ) {
        let running = self.state("running_child");
        let trigger = self.child(i, signal);
        self.sm
            .transition(running, Some(trigger), guard, target, body);
    }

    /// Answers a halt by resetting `resets` and halting every child in
    /// turn, then confirming.
    fn halting(&mut self, resets: &[&str]) {
        let n = self.children.len();
        for i in 0..n {
            self.sm.add_state(&format!("halting_{}", i));
        }
        let idle = self.state("idle");
        let mut body: Vec<ActionId> = resets.iter().map(|v| self.set(v, 0)).collect();
        let halt = self.child(0, BtSignal::Halt);
        body.push(self.sm.send(halt, &[]));
        self.sm.transition(
            idle,
            Some(Interface::Bt(BtSignal::Halt)),
            None,
            "halting_0",
            body,
        );
        for i in 0..n {
            let from = self.state(&format!("halting_{}", i));
            let trigger = self.child(i, BtSignal::Halted);
            if i + 1 < n {
                let halt = self.child(i + 1, BtSignal::Halt);
                let next = self.sm.send(halt, &[]);
                self.sm.transition(
                    from,
                    Some(trigger),
                    None,
                    &format!("halting_{}", i + 1),
                    vec![next],
                );
            } else {
                let done = self.reply(BtSignal::Halted);
                self.sm
                    .transition(from, Some(trigger), None, "idle", vec![done]);
            }
        }
    }

    fn state(&self, name: &str) -> crate::model::StateId {
        // every state used here is added by the constructor or `halting`
        self.sm.state_id(name).unwrap_or_default()
    }
}

/// `proceed` is the child answer that moves on to the next child, the
/// other definite answer ends the tick
fn sequence_like(c: &mut Control, proceed: BtSignal, reactive: bool, memory: bool) {
    let stop = match proceed {
        BtSignal::Success => BtSignal::Failure,
        _ => BtSignal::Success,
    };
    c.counter("current");
    let body = if reactive {
        vec![c.set("current", 0), c.tick(0)]
    } else {
        vec![c.tick_indexed("current")]
    };
    c.on_tick(body);
    let n = c.children.len();
    for i in 0..n {
        let body = if i + 1 < n {
            vec![c.set("current", i + 1), c.tick(i + 1)]
        } else {
            vec![c.set("current", 0), c.reply(proceed)]
        };
        let target = if i + 1 < n { "running_child" } else { "idle" };
        c.on_child(i, proceed, None, target, body);

        let body = if memory {
            vec![c.reply(stop)]
        } else {
            vec![c.set("current", 0), c.reply(stop)]
        };
        c.on_child(i, stop, None, "idle", body);

        let body = vec![c.reply(BtSignal::Running)];
        c.on_child(i, BtSignal::Running, None, "idle", body);
    }
    c.halting(&["current"]);
}

/// Single-child decorators mapping the child's answer to their own
fn decorator(c: &mut Control, map: impl Fn(BtSignal) -> BtSignal) {
    let body = vec![c.tick(0)];
    c.on_tick(body);
    for signal in [BtSignal::Success, BtSignal::Failure, BtSignal::Running] {
        let body = vec![c.reply(map(signal))];
        c.on_child(0, signal, None, "idle", body);
    }
    c.halting(&[]);
}

fn retry(c: &mut Control, attempts: u32) {
    c.counter("attempts");
    let body = vec![c.tick(0)];
    c.on_tick(body);
    let body = vec![c.set("attempts", 0), c.reply(BtSignal::Success)];
    c.on_child(0, BtSignal::Success, None, "idle", body);
    let again = c.sm.assign("attempts", "attempts + 1");
    let body = vec![again, c.tick(0)];
    let guard = format!("attempts + 1 < {}", attempts);
    c.on_child(0, BtSignal::Failure, Some(&guard), "running_child", body);
    let body = vec![c.set("attempts", 0), c.reply(BtSignal::Failure)];
    c.on_child(0, BtSignal::Failure, None, "idle", body);
    let body = vec![c.reply(BtSignal::Running)];
    c.on_child(0, BtSignal::Running, None, "idle", body);
    c.halting(&["attempts"]);
}

/// Child 0 is the condition, 1 the then branch and 2 the optional else
/// branch. `branch` remembers which child is running.
fn if_then_else(c: &mut Control) {
    c.counter("branch");
    let body = vec![c.tick_indexed("branch")];
    c.on_tick(body);
    let body = vec![c.set("branch", 1), c.tick(1)];
    c.on_child(0, BtSignal::Success, None, "running_child", body);
    if c.children.len() == 3 {
        let body = vec![c.set("branch", 2), c.tick(2)];
        c.on_child(0, BtSignal::Failure, None, "running_child", body);
    } else {
        let body = vec![c.set("branch", 0), c.reply(BtSignal::Failure)];
        c.on_child(0, BtSignal::Failure, None, "idle", body);
    }
    let body = vec![c.reply(BtSignal::Running)];
    c.on_child(0, BtSignal::Running, None, "idle", body);
    for i in 1..c.children.len() {
        for signal in [BtSignal::Success, BtSignal::Failure] {
            let body = vec![c.set("branch", 0), c.reply(signal)];
            c.on_child(i, signal, None, "idle", body);
        }
        let body = vec![c.reply(BtSignal::Running)];
        c.on_child(i, BtSignal::Running, None, "idle", body);
    }
    c.halting(&["branch"]);
}

fn control_node(id: u32, kind: &NodeKind, children: Vec<u32>) -> StateMachine {
    use BtSignal::*;
    let mut c = Control::new(id, kind, children);
    match kind {
        NodeKind::Sequence => sequence_like(&mut c, Success, false, false),
        NodeKind::ReactiveSequence => sequence_like(&mut c, Success, true, false),
        NodeKind::SequenceWithMemory => sequence_like(&mut c, Success, false, true),
        NodeKind::Fallback => sequence_like(&mut c, Failure, false, false),
        NodeKind::ReactiveFallback => sequence_like(&mut c, Failure, true, false),
        NodeKind::RetryUntilSuccessful(n) => retry(&mut c, *n),
        NodeKind::IfThenElse => if_then_else(&mut c),
        NodeKind::Inverter => decorator(&mut c, |s| match s {
            Success => Failure,
            Failure => Success,
            other => other,
        }),
        NodeKind::ForceSuccess => decorator(&mut c, |s| match s {
            Running => Running,
            _ => Success,
        }),
        NodeKind::ForceFailure => decorator(&mut c, |s| match s {
            Running => Running,
            _ => Failure,
        }),
        NodeKind::Action(_) | NodeKind::Condition(_) => {}
    }
    c.sm
}
