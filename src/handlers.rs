// Copyright 2025 Cornell University
// released under MIT License

//! Every service and action with clients gets a handler automaton that
//! sits between its clients and its server. Clients talk to the handler
//! over channels of their own (see `Interface::client_channel`). The
//! handler serves one request or goal at a time and passes each reply on
//! to the client that asked for it, so the state of the handler identifies
//! the goal in flight. A request that arrives while the handler is busy
//! waits in its client's channel, and time may pass meanwhile.

use crate::errors::{CompileError, CompileResult, StructuralError};
use crate::model::{Action, ActionId, StateMachine};
use crate::ros::{sanitize, Declaration, Interface};
use crate::types::StructRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Service,
    Action,
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Kind::Service => "service",
            Kind::Action => "action",
        }
    }
}

/// Who declares one service or action
#[derive(Debug)]
struct Endpoints<'p> {
    kind: Kind,
    name: &'p str,
    tpe: &'p str,
    server: Option<&'p str>,
    clients: Vec<&'p str>,
}

/// Handler automata and the client channels they queue
#[derive(Debug, Default)]
pub struct Handlers {
    pub automata: Vec<StateMachine>,
    /// Channels that may hold a message while time passes
    pub queued: Vec<String>,
}

/// Builds one handler per service or action that has clients, in order of
/// first declaration
pub fn build(machines: &[&StateMachine], structs: &StructRegistry) -> CompileResult<Handlers> {
    let mut found: Vec<Endpoints> = vec![];
    for sm in machines {
        for decl in &sm.declarations {
            let (kind, name, tpe, is_client) = match decl {
                Declaration::ServiceClient { service, srv } => (Kind::Service, service, srv, true),
                Declaration::ServiceServer { service, srv } => (Kind::Service, service, srv, false),
                Declaration::ActionClient {
                    action,
                    action_type,
                } => (Kind::Action, action, action_type, true),
                Declaration::ActionServer {
                    action,
                    action_type,
                } => (Kind::Action, action, action_type, false),
                _ => continue,
            };
            let idx = match found
                .iter()
                .position(|e| e.kind == kind && sanitize(e.name) == sanitize(name))
            {
                Some(idx) => idx,
                None => {
                    found.push(Endpoints {
                        kind,
                        name,
                        tpe,
                        server: None,
                        clients: vec![],
                    });
                    found.len() - 1
                }
            };
            let entry = &mut found[idx];
            if entry.tpe != tpe {
                return Err(invalid(
                    entry,
                    format!("declared with types `{}` and `{}`", entry.tpe, tpe),
                ));
            }
            let owner = sm.name.as_str();
            if !is_client {
                match entry.server {
                    Some(server) if server != owner => {
                        return Err(invalid(
                            entry,
                            format!("served by both `{}` and `{}`", server, owner),
                        ))
                    }
                    _ => entry.server = Some(owner),
                }
            } else if !entry.clients.contains(&owner) {
                entry.clients.push(owner);
            }
        }
    }

    let mut out = Handlers::default();
    for entry in found.iter().filter(|e| !e.clients.is_empty()) {
        if entry.server.is_none() {
            return Err(invalid(entry, "has clients but no server".to_string()));
        }
        let mut handler = Handler::new(entry, structs);
        match entry.kind {
            Kind::Service => handler.service()?,
            Kind::Action => handler.action()?,
        }
        log::debug!(
            "{} handler for `{}` with {} client(s)",
            entry.kind.name(),
            entry.name,
            entry.clients.len()
        );
        out.automata.push(handler.sm);
        out.queued.extend(handler.queued);
    }
    Ok(out)
}

fn invalid(entry: &Endpoints, details: String) -> CompileError {
    StructuralError::InvalidInterface {
        name: format!("{} {}", entry.kind.name(), entry.name),
        details,
    }
    .into()
}

struct Handler<'e, 'p> {
    entry: &'e Endpoints<'p>,
    structs: &'e StructRegistry,
    sm: StateMachine,
    queued: Vec<String>,
}

impl<'e, 'p> Handler<'e, 'p> {
    fn new(entry: &'e Endpoints<'p>, structs: &'e StructRegistry) -> Self {
        let prefix = match entry.kind {
            Kind::Service => "srv_handler_",
            Kind::Action => "action_handler_",
        };
        let mut sm = StateMachine::new(format!("{}{}", prefix, sanitize(entry.name)));
        // requests wait for the handler instead of being dropped
        sm.discard_unhandled = false;
        Self {
            entry,
            structs,
            sm,
            queued: vec![],
        }
    }

    fn payload(&self, suffix: &str) -> String {
        format!("{}/{}", self.entry.tpe, suffix)
    }

    /// Declares `name` and returns the interface to use it through
    fn channel(&mut self, name: String, payload: Option<String>) -> Interface {
        self.sm.declarations.push(Declaration::Event {
            name: name.clone(),
            payload,
        });
        Interface::Event(name)
    }

    /// The server side of `interface`
    fn server_channel(&mut self, interface: Interface, payload: Option<String>) -> CompileResult<Interface> {
        let name = interface.channel_name(None)?;
        Ok(self.channel(name, payload))
    }

    /// The side of `interface` that belongs to `client`
    fn client_channel(&mut self, interface: Interface, client: &str, payload: Option<String>) -> Interface {
        let name = interface.client_channel(client).unwrap_or_default();
        self.channel(name, payload)
    }

    /// Sends the message that triggered the transition on to `to`, field
    /// by field
    fn forward(&mut self, to: Interface, payload: Option<&str>) -> ActionId {
        let params = payload
            .and_then(|p| self.structs.get(p))
            .map(|def| {
                def.fields()
                    .iter()
                    .map(|(field, _)| (field.clone(), format!("_event.{}", field)))
                    .collect()
            })
            .unwrap_or_default();
        self.sm.a(Action::Send {
            interface: to,
            params,
        })
    }

    /// `waiting` takes a request from any client, `processing_client_<c>`
    /// waits for the server's response to client `c`
    fn service(&mut self) -> CompileResult<()> {
        let service = self.entry.name.to_string();
        let (request, response) = (self.payload("Request"), self.payload("Response"));
        let waiting = self.sm.add_state("waiting");
        let to_server = self.server_channel(
            Interface::ServiceRequest(service.clone()),
            Some(request.clone()),
        )?;
        let from_server = self.server_channel(
            Interface::ServiceResponse(service.clone()),
            Some(response.clone()),
        )?;
        for client in self.entry.clients.clone() {
            let processing = format!("processing_client_{}", client);
            let busy = self.sm.add_state(&processing);
            let from_client = self.client_channel(
                Interface::ServiceRequest(service.clone()),
                client,
                Some(request.clone()),
            );
            let to_client = self.client_channel(
                Interface::ServiceResponse(service.clone()),
                client,
                Some(response.clone()),
            );
            if let Interface::Event(name) = &from_client {
                self.queued.push(name.clone());
            }
            let ask = self.forward(to_server.clone(), Some(request.as_str()));
            self.sm
                .transition(waiting, Some(from_client), None, &processing, vec![ask]);
            let answer = self.forward(to_client, Some(response.as_str()));
            self.sm
                .transition(busy, Some(from_server.clone()), None, "waiting", vec![answer]);
        }
        Ok(())
    }

    /// `waiting` takes a goal from any client. The server then accepts or
    /// rejects it in `goal_requested_client_<c>`, and an accepted goal
    /// stays `active_client_<c>` until its result.
    fn action(&mut self) -> CompileResult<()> {
        let action = self.entry.name.to_string();
        let (goal, feedback, result) = (
            self.payload("Goal"),
            self.payload("Feedback"),
            self.payload("Result"),
        );
        let waiting = self.sm.add_state("waiting");
        let to_server =
            self.server_channel(Interface::ActionGoal(action.clone()), Some(goal.clone()))?;
        let accepted = self.server_channel(Interface::ActionAccepted(action.clone()), None)?;
        let rejected = self.server_channel(Interface::ActionRejected(action.clone()), None)?;
        let progress = self.server_channel(
            Interface::ActionFeedback(action.clone()),
            Some(feedback.clone()),
        )?;
        let done =
            self.server_channel(Interface::ActionResult(action.clone()), Some(result.clone()))?;
        for client in self.entry.clients.clone() {
            let requested = format!("goal_requested_client_{}", client);
            let active = format!("active_client_{}", client);
            let requested_id = self.sm.add_state(&requested);
            let active_id = self.sm.add_state(&active);

            let from_client =
                self.client_channel(Interface::ActionGoal(action.clone()), client, Some(goal.clone()));
            if let Interface::Event(name) = &from_client {
                self.queued.push(name.clone());
            }
            let ask = self.forward(to_server.clone(), Some(goal.as_str()));
            self.sm
                .transition(waiting, Some(from_client), None, &requested, vec![ask]);

            let to_client = self.client_channel(Interface::ActionAccepted(action.clone()), client, None);
            let tell = self.forward(to_client, None);
            self.sm
                .transition(requested_id, Some(accepted.clone()), None, &active, vec![tell]);
            let to_client = self.client_channel(Interface::ActionRejected(action.clone()), client, None);
            let tell = self.forward(to_client, None);
            self.sm
                .transition(requested_id, Some(rejected.clone()), None, "waiting", vec![tell]);

            let to_client = self.client_channel(
                Interface::ActionFeedback(action.clone()),
                client,
                Some(feedback.clone()),
            );
            let tell = self.forward(to_client, Some(feedback.as_str()));
            self.sm
                .transition(active_id, Some(progress.clone()), None, &active, vec![tell]);
            let to_client = self.client_channel(
                Interface::ActionResult(action.clone()),
                client,
                Some(result.clone()),
            );
            let tell = self.forward(to_client, Some(result.as_str()));
            self.sm
                .transition(active_id, Some(done.clone()), None, "waiting", vec![tell]);
        }
        Ok(())
    }
}
