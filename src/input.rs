// Copyright 2025 Cornell University
// released under MIT License

//! JSON documents holding already-parsed models, and their lowering into a
//! `Project`. Expressions stay text; they are resolved during composition.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::bt::{BehaviorTree, BlackboardEntry, BtNode, NodeKind, PortDecl, PortDirection, PortValue};
use crate::config::Config;
use crate::errors::{CompileResult, ParseError, StructuralError, TypeError, WithContext};
use crate::model::{Action, ActionId, Destination, Edge, Project, StateMachine, Variable};
use crate::properties::Property;
use crate::ros::{BtSignal, Declaration, Interface};
use crate::types::{StructDef, StructRegistry, Type};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectDoc {
    pub structs: Vec<StructDoc>,
    pub automata: Vec<AutomatonDoc>,
    /// Templates for behavior tree leaves
    pub plugins: Vec<AutomatonDoc>,
    pub trees: Vec<TreeDoc>,
    pub properties: Vec<Property>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub tpe: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructDoc {
    pub name: String,
    pub fields: Vec<FieldDoc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub tpe: String,
    #[serde(default)]
    pub init: Option<String>,
    /// Shared with every other automaton declaring it
    #[serde(default)]
    pub global: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub tpe: String,
    pub direction: PortDirection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum InterfaceDoc {
    Event { name: String },
    Topic { name: String },
    Timer { name: String },
    ServiceRequest { name: String },
    ServiceResponse { name: String },
    ActionGoal { name: String },
    ActionAccepted { name: String },
    ActionRejected { name: String },
    ActionFeedback { name: String },
    ActionResult { name: String },
    /// `tick`, `halt`, `success`, `failure`, `running` or `halted`
    Bt { signal: String },
    BlackboardSet { key: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BranchDoc {
    pub condition: String,
    #[serde(default)]
    pub body: Vec<ActionDoc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ActionDoc {
    Assign {
        target: String,
        value: String,
    },
    If {
        branches: Vec<BranchDoc>,
        #[serde(default, rename = "else")]
        otherwise: Vec<ActionDoc>,
    },
    Send {
        interface: InterfaceDoc,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
    SetOutput {
        port: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationDoc {
    pub target: String,
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub body: Vec<ActionDoc>,
}

/// A transition has either a `target` (with an optional `body`) or a list
/// of probabilistic `destinations`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransitionDoc {
    pub trigger: Option<InterfaceDoc>,
    pub guard: Option<String>,
    pub target: Option<String>,
    pub body: Vec<ActionDoc>,
    pub destinations: Vec<DestinationDoc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateDoc {
    pub name: String,
    #[serde(default)]
    pub on_entry: Vec<ActionDoc>,
    #[serde(default)]
    pub on_exit: Vec<ActionDoc>,
    #[serde(default)]
    pub transitions: Vec<TransitionDoc>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutomatonDoc {
    pub name: String,
    #[serde(default)]
    pub variables: Vec<VariableDoc>,
    #[serde(default)]
    pub declarations: Vec<Declaration>,
    #[serde(default)]
    pub ports: Vec<PortDoc>,
    #[serde(default = "yes")]
    pub discard_unhandled: bool,
    /// Defaults to the first state
    #[serde(default)]
    pub initial: Option<String>,
    pub states: Vec<StateDoc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryDoc {
    pub key: String,
    #[serde(rename = "type")]
    pub tpe: String,
    #[serde(default)]
    pub init: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDoc {
    /// Node type, e.g. `Sequence`, `Action` or `RetryUntilSuccessful`
    pub kind: String,
    /// Plugin implementing an `Action` or `Condition` leaf
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
    #[serde(default)]
    pub children: Vec<NodeDoc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeDoc {
    pub name: String,
    #[serde(default)]
    pub blackboard: Vec<EntryDoc>,
    pub root: NodeDoc,
}

pub fn parse_project(text: &str) -> serde_json::Result<ProjectDoc> {
    serde_json::from_str(text)
}

fn parse_type(text: &str, config: &Config) -> CompileResult<Type> {
    Type::parse(text, config.max_array_size).ok_or_else(|| TypeError::unknown_type(text).into())
}

fn malformed(input: &str, message: impl Into<String>) -> ParseError {
    ParseError {
        input: input.to_string(),
        message: message.into(),
    }
}

impl InterfaceDoc {
    fn lower(&self) -> CompileResult<Interface> {
        Ok(match self {
            InterfaceDoc::Event { name } => Interface::Event(name.clone()),
            InterfaceDoc::Topic { name } => Interface::Topic(name.clone()),
            InterfaceDoc::Timer { name } => Interface::Timer(name.clone()),
            InterfaceDoc::ServiceRequest { name } => Interface::ServiceRequest(name.clone()),
            InterfaceDoc::ServiceResponse { name } => Interface::ServiceResponse(name.clone()),
            InterfaceDoc::ActionGoal { name } => Interface::ActionGoal(name.clone()),
            InterfaceDoc::ActionAccepted { name } => Interface::ActionAccepted(name.clone()),
            InterfaceDoc::ActionRejected { name } => Interface::ActionRejected(name.clone()),
            InterfaceDoc::ActionFeedback { name } => Interface::ActionFeedback(name.clone()),
            InterfaceDoc::ActionResult { name } => Interface::ActionResult(name.clone()),
            InterfaceDoc::BlackboardSet { key } => Interface::BlackboardSet(key.clone()),
            InterfaceDoc::Bt { signal } => {
                let found = BtSignal::ALL.into_iter().find(|s| s.suffix() == signal.as_str());
                Interface::Bt(found.ok_or_else(|| malformed(signal, "not a behavior tree signal"))?)
            }
        })
    }
}

fn lower_block(sm: &mut StateMachine, docs: &[ActionDoc]) -> CompileResult<Vec<ActionId>> {
    let mut block = vec![];
    for doc in docs {
        let action = match doc {
            ActionDoc::Assign { target, value } => Action::Assign {
                target: target.clone(),
                value: value.clone(),
            },
            ActionDoc::If {
                branches,
                otherwise,
            } => {
                let mut lowered = vec![];
                for branch in branches {
                    lowered.push((branch.condition.clone(), lower_block(sm, &branch.body)?));
                }
                Action::If {
                    branches: lowered,
                    otherwise: lower_block(sm, otherwise)?,
                }
            }
            ActionDoc::Send { interface, params } => Action::Send {
                interface: interface.lower()?,
                params: params
                    .iter()
                    .map(|(f, v)| (f.clone(), v.clone()))
                    .collect(),
            },
            ActionDoc::SetOutput { port, value } => Action::SetOutput {
                port: port.clone(),
                value: value.clone(),
            },
        };
        block.push(sm.a(action));
    }
    Ok(block)
}

impl AutomatonDoc {
    pub fn lower(&self, config: &Config) -> CompileResult<StateMachine> {
        self.lower_helper(config).in_automaton(&self.name)
    }

    fn lower_helper(&self, config: &Config) -> CompileResult<StateMachine> {
        let mut sm = StateMachine::new(self.name.clone());
        sm.discard_unhandled = self.discard_unhandled;
        sm.declarations = self.declarations.clone();
        for var in &self.variables {
            let tpe = parse_type(&var.tpe, config)?;
            let init = var.init.as_deref();
            sm.variables.push(if var.global {
                Variable::global(var.name.clone(), tpe, init)
            } else {
                Variable::local(var.name.clone(), tpe, init)
            });
        }
        for port in &self.ports {
            sm.ports.push(PortDecl {
                name: port.name.clone(),
                tpe: parse_type(&port.tpe, config)?,
                direction: port.direction,
            });
        }
        let ids: Vec<_> = self.states.iter().map(|s| sm.add_state(&s.name)).collect();
        if let Some(initial) = &self.initial {
            let id = sm
                .state_id(initial)
                .ok_or_else(|| StructuralError::unknown_state(initial))?;
            sm.initial = Some(id);
        }
        for (doc, id) in self.states.iter().zip(ids) {
            let on_entry = lower_block(&mut sm, &doc.on_entry).at_state(&doc.name)?;
            let on_exit = lower_block(&mut sm, &doc.on_exit).at_state(&doc.name)?;
            let state = sm.state_mut(id);
            state.on_entry = on_entry;
            state.on_exit = on_exit;
            for (i, transition) in doc.transitions.iter().enumerate() {
                let edge = lower_transition(&mut sm, id, transition)
                    .at_edge(i)
                    .at_state(&doc.name)?;
                sm.add_edge(edge);
            }
        }
        Ok(sm)
    }
}

fn lower_transition(
    sm: &mut StateMachine,
    source: crate::model::StateId,
    doc: &TransitionDoc,
) -> CompileResult<Edge> {
    let destinations = match (&doc.target, doc.destinations.is_empty()) {
        (Some(target), true) => vec![Destination {
            target: target.clone(),
            probability: None,
            body: lower_block(sm, &doc.body)?,
        }],
        (None, false) if doc.body.is_empty() => {
            let mut out = vec![];
            for dest in &doc.destinations {
                out.push(Destination {
                    target: dest.target.clone(),
                    probability: dest.probability,
                    body: lower_block(sm, &dest.body)?,
                });
            }
            out
        }
        _ => {
            return Err(malformed(
                &sm.name,
                "a transition needs either a target or a list of destinations",
            )
            .into())
        }
    };
    Ok(Edge {
        source,
        trigger: doc.trigger.as_ref().map(InterfaceDoc::lower).transpose()?,
        guard: doc.guard.clone(),
        destinations,
    })
}

impl NodeDoc {
    fn lower(&self) -> CompileResult<BtNode> {
        let plugin = || {
            self.plugin.clone().ok_or_else(|| {
                StructuralError::invalid_bt(format!("`{}` leaf without a plugin", self.kind))
            })
        };
        let kind = match self.kind.as_str() {
            "Sequence" => NodeKind::Sequence,
            "ReactiveSequence" => NodeKind::ReactiveSequence,
            "SequenceWithMemory" | "SequenceStar" => NodeKind::SequenceWithMemory,
            "Fallback" => NodeKind::Fallback,
            "ReactiveFallback" => NodeKind::ReactiveFallback,
            "RetryUntilSuccessful" => NodeKind::RetryUntilSuccessful(self.attempts.ok_or_else(|| {
                StructuralError::invalid_bt("RetryUntilSuccessful without `attempts`")
            })?),
            "IfThenElse" => NodeKind::IfThenElse,
            "Inverter" => NodeKind::Inverter,
            "ForceSuccess" => NodeKind::ForceSuccess,
            "ForceFailure" => NodeKind::ForceFailure,
            "Action" => NodeKind::Action(plugin()?),
            "Condition" => NodeKind::Condition(plugin()?),
            other => {
                return Err(StructuralError::invalid_bt(format!("unknown node type `{}`", other)).into())
            }
        };
        Ok(BtNode {
            kind,
            ports: self
                .ports
                .iter()
                .map(|(p, v)| (p.clone(), PortValue::parse(v)))
                .collect(),
            children: self
                .children
                .iter()
                .map(NodeDoc::lower)
                .collect::<CompileResult<_>>()?,
        })
    }
}

impl ProjectDoc {
    pub fn lower(&self, config: &Config) -> CompileResult<Project> {
        let mut structs = StructRegistry::default();
        for doc in &self.structs {
            let mut fields = vec![];
            for field in &doc.fields {
                fields.push((field.name.clone(), parse_type(&field.tpe, config)?));
            }
            if !structs.add(StructDef::new(doc.name.clone(), fields)) {
                return Err(StructuralError::DuplicateStruct {
                    name: doc.name.clone(),
                }
                .into());
            }
        }
        for def in structs.iter() {
            structs.check(&Type::Struct(def.name().to_string()))?;
        }
        let mut trees = vec![];
        for tree in &self.trees {
            let mut blackboard = vec![];
            for entry in &tree.blackboard {
                blackboard.push(BlackboardEntry {
                    key: entry.key.clone(),
                    tpe: parse_type(&entry.tpe, config)?,
                    init: entry.init.clone(),
                });
            }
            trees.push(BehaviorTree {
                name: tree.name.clone(),
                root: tree.root.lower()?,
                blackboard,
            });
        }
        let project = Project {
            structs,
            automata: self
                .automata
                .iter()
                .map(|a| a.lower(config))
                .collect::<CompileResult<_>>()?,
            plugins: self
                .plugins
                .iter()
                .map(|a| a.lower(config))
                .collect::<CompileResult<_>>()?,
            trees,
            properties: self.properties.clone(),
        };
        log::debug!(
            "lowered {} automata, {} plugins, {} trees",
            project.automata.len(),
            project.plugins.len(),
            project.trees.len()
        );
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CompileErrorKind;

    const PUBSUB: &str = r#"{
        "structs": [{"name": "std_msgs/Int32", "fields": [{"name": "data", "type": "int32"}]}],
        "automata": [
            {
                "name": "talker",
                "variables": [{"name": "count", "type": "int32", "init": "0"}],
                "declarations": [
                    {"kind": "publisher", "topic": "/chatter", "msg": "std_msgs/Int32"},
                    {"kind": "timer", "name": "tick", "rate_hz": 1.0}
                ],
                "states": [{
                    "name": "run",
                    "transitions": [{
                        "trigger": {"kind": "timer", "name": "tick"},
                        "target": "run",
                        "body": [
                            {"kind": "assign", "target": "count", "value": "count + 1"},
                            {"kind": "if", "branches": [{"condition": "count > 2", "body": [
                                {"kind": "assign", "target": "count", "value": "0"}
                            ]}]},
                            {"kind": "send", "interface": {"kind": "topic", "name": "/chatter"},
                             "params": {"data": "count"}}
                        ]
                    }]
                }]
            },
            {
                "name": "listener",
                "variables": [{"name": "last", "type": "int32"}],
                "declarations": [{"kind": "subscriber", "topic": "/chatter", "msg": "std_msgs/Int32"}],
                "states": [{
                    "name": "idle",
                    "transitions": [{
                        "trigger": {"kind": "topic", "name": "/chatter"},
                        "destinations": [
                            {"target": "idle", "probability": 0.9, "body": [
                                {"kind": "assign", "target": "last", "value": "_msg.data"}
                            ]},
                            {"target": "idle"}
                        ]
                    }]
                }]
            }
        ],
        "properties": [{"name": "bounded", "expression": {"op": "≤", "left": "t", "right": 5}}]
    }"#;

    #[test]
    fn lowering() {
        let doc = parse_project(PUBSUB).unwrap();
        let project = doc.lower(&Config::default()).unwrap();
        assert_eq!(project.automata.len(), 2);
        let talker = &project.automata[0];
        assert_eq!(talker.declarations.len(), 2);
        let (_, edge) = talker.edges().next().unwrap();
        assert_eq!(edge.trigger, Some(Interface::Timer("tick".to_string())));
        assert_eq!(
            talker.format_block(&edge.destinations[0].body),
            "count := count + 1;\nif (count > 2) {\n  count := 0;\n}\nsend topic /chatter(data: count);"
        );
        let listener = &project.automata[1];
        let (_, edge) = listener.edges().next().unwrap();
        assert_eq!(edge.destinations.len(), 2);
        assert_eq!(edge.destinations[0].probability, Some(0.9));
        assert_eq!(project.properties[0].name, "bounded");
    }

    #[test]
    fn malformed_documents() {
        let config = Config::default();
        let bad_type = r#"{"automata": [{"name": "a", "variables": [{"name": "x", "type": "int7"}], "states": [{"name": "s"}]}]}"#;
        let err = parse_project(bad_type).unwrap().lower(&config).unwrap_err();
        assert!(matches!(err.kind, CompileErrorKind::Type(TypeError::UnknownType { .. })));
        assert_eq!(err.context.automaton.as_deref(), Some("a"));

        let no_target = r#"{"automata": [{"name": "a", "states": [{"name": "s", "transitions": [{}]}]}]}"#;
        let err = parse_project(no_target).unwrap().lower(&config).unwrap_err();
        assert!(matches!(err.kind, CompileErrorKind::Parse(_)));
        assert_eq!(err.context.state.as_deref(), Some("s"));
        assert_eq!(err.context.edge, Some(0));

        let bad_initial = r#"{"automata": [{"name": "a", "initial": "x", "states": [{"name": "s"}]}]}"#;
        let err = parse_project(bad_initial).unwrap().lower(&config).unwrap_err();
        assert!(err.is_structural());

        assert!(parse_project(r#"{"automata": [{"name": "a"}]}"#).is_err());
        assert!(parse_project(r#"{"bogus": []}"#).is_err());
    }

    #[test]
    fn trees() {
        let text = r#"{
            "trees": [{
                "name": "main",
                "blackboard": [{"key": "goal", "type": "int32", "init": "3"}],
                "root": {"kind": "Sequence", "children": [
                    {"kind": "Condition", "plugin": "IsReady", "ports": {"limit": "{goal}"}},
                    {"kind": "RetryUntilSuccessful", "attempts": 2, "children": [
                        {"kind": "Action", "plugin": "Move"}
                    ]}
                ]}
            }]
        }"#;
        let project = parse_project(text).unwrap().lower(&Config::default()).unwrap();
        let root = &project.trees[0].root;
        assert_eq!(root.kind, NodeKind::Sequence);
        assert_eq!(
            root.children[0].ports,
            vec![("limit".to_string(), PortValue::Blackboard("goal".to_string()))]
        );
        assert_eq!(root.children[1].kind, NodeKind::RetryUntilSuccessful(2));

        let unknown = r#"{"trees": [{"name": "t", "root": {"kind": "Parallel"}}]}"#;
        let err = parse_project(unknown).unwrap().lower(&Config::default()).unwrap_err();
        assert!(matches!(
            err.kind,
            CompileErrorKind::Structural(StructuralError::InvalidBehaviorTree { .. })
        ));
    }
}
