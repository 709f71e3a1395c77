// Copyright 2025 Cornell University
// released under MIT License

use serde::Deserialize;
use std::fmt;

use crate::config::{period_from_rate, Duration};
use crate::errors::{CompileResult, StructuralError};

/// Behavior tree control messages, seen from the node that owns them
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum BtSignal {
    Tick,
    Halt,
    Success,
    Failure,
    Running,
    Halted,
}

impl BtSignal {
    pub const ALL: [BtSignal; 6] = [
        BtSignal::Tick,
        BtSignal::Halt,
        BtSignal::Success,
        BtSignal::Failure,
        BtSignal::Running,
        BtSignal::Halted,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            BtSignal::Tick => "tick",
            BtSignal::Halt => "halt",
            BtSignal::Success => "success",
            BtSignal::Failure => "failure",
            BtSignal::Running => "running",
            BtSignal::Halted => "halted",
        }
    }

    /// `true` for the messages a node receives from its parent
    pub fn is_request(self) -> bool {
        matches!(self, BtSignal::Tick | BtSignal::Halt)
    }
}

/// The communication end points a transition can be triggered by or send to
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum Interface {
    /// Plain named event
    Event(String),
    Topic(String),
    Timer(String),
    ServiceRequest(String),
    ServiceResponse(String),
    ActionGoal(String),
    ActionAccepted(String),
    ActionRejected(String),
    ActionFeedback(String),
    ActionResult(String),
    /// Control message of the behavior tree node this automaton implements
    Bt(BtSignal),
    /// Write of a blackboard entry
    BlackboardSet(String),
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interface::Event(n) => write!(f, "event {}", n),
            Interface::Topic(n) => write!(f, "topic {}", n),
            Interface::Timer(n) => write!(f, "timer {}", n),
            Interface::ServiceRequest(n) => write!(f, "service request {}", n),
            Interface::ServiceResponse(n) => write!(f, "service response {}", n),
            Interface::ActionGoal(n) => write!(f, "action goal {}", n),
            Interface::ActionAccepted(n) => write!(f, "action accepted {}", n),
            Interface::ActionRejected(n) => write!(f, "action rejected {}", n),
            Interface::ActionFeedback(n) => write!(f, "action feedback {}", n),
            Interface::ActionResult(n) => write!(f, "action result {}", n),
            Interface::Bt(s) => write!(f, "bt {}", s.suffix()),
            Interface::BlackboardSet(k) => write!(f, "blackboard {}", k),
        }
    }
}

/// Removes a leading slash and replaces inner slashes in ROS names
pub fn sanitize(name: &str) -> String {
    name.trim_start_matches('/').replace('/', "__")
}

pub fn topic_channel(topic: &str) -> String {
    format!("topic_{}_msg", sanitize(topic))
}

pub fn timer_channel(timer: &str) -> String {
    format!("ros_time_rate.{}", timer)
}

pub fn bt_channel(id: u32, signal: BtSignal) -> String {
    format!("bt_{}_{}", id, signal.suffix())
}

pub fn blackboard_channel(key: &str) -> String {
    format!("bt_blackboard_set.{}", key)
}

impl Interface {
    /// Name of the channel this interface maps to. Behavior tree signals
    /// need the id of the node the automaton implements.
    pub fn channel_name(&self, bt_id: Option<u32>) -> CompileResult<String> {
        Ok(match self {
            Interface::Event(n) => n.clone(),
            Interface::Topic(t) => topic_channel(t),
            Interface::Timer(t) => timer_channel(t),
            Interface::ServiceRequest(s) => format!("srv_{}_request", sanitize(s)),
            Interface::ServiceResponse(s) => format!("srv_{}_response", sanitize(s)),
            Interface::ActionGoal(a) => format!("action_{}_goal", sanitize(a)),
            Interface::ActionAccepted(a) => format!("action_{}_goal_accepted", sanitize(a)),
            Interface::ActionRejected(a) => format!("action_{}_goal_rejected", sanitize(a)),
            Interface::ActionFeedback(a) => format!("action_{}_feedback", sanitize(a)),
            Interface::ActionResult(a) => format!("action_{}_result", sanitize(a)),
            Interface::Bt(signal) => {
                let id = bt_id.ok_or_else(|| {
                    StructuralError::invalid_bt(format!(
                        "`{}` used outside of a behavior tree node",
                        signal.suffix()
                    ))
                })?;
                bt_channel(id, *signal)
            }
            Interface::BlackboardSet(key) => blackboard_channel(key),
        })
    }

    /// Channel between the handler of a service or action and one of its
    /// clients. `None` for interfaces that are not client-specific.
    pub fn client_channel(&self, client: &str) -> Option<String> {
        let name = match self {
            Interface::ServiceRequest(s) => format!("srv_{}_req_client_{}", sanitize(s), client),
            Interface::ServiceResponse(s) => {
                format!("srv_{}_response_client_{}", sanitize(s), client)
            }
            Interface::ActionGoal(a) => {
                format!("action_{}_goal_req_client_{}", sanitize(a), client)
            }
            Interface::ActionAccepted(a) => {
                format!("action_{}_goal_accept_client_{}", sanitize(a), client)
            }
            Interface::ActionRejected(a) => {
                format!("action_{}_goal_reject_client_{}", sanitize(a), client)
            }
            Interface::ActionFeedback(a) => {
                format!("action_{}_feedback_handle_client_{}", sanitize(a), client)
            }
            Interface::ActionResult(a) => {
                format!("action_{}_result_handle_client_{}", sanitize(a), client)
            }
            _ => return None,
        };
        Some(name)
    }

    /// Names under which the payload of an incoming message can be read
    pub fn payload_aliases(&self) -> &'static [&'static str] {
        match self {
            Interface::Topic(_) => &["_msg", "_event"],
            Interface::ServiceRequest(_) => &["_req", "_event"],
            Interface::ServiceResponse(_) => &["_res", "_event"],
            Interface::ActionGoal(_) => &["_goal", "_event"],
            Interface::ActionFeedback(_) => &["_feedback", "_event"],
            Interface::ActionResult(_) => &["_result", "_event"],
            _ => &["_event"],
        }
    }
}

/// Direction(s) an automaton may use a channel in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Send,
    Receive,
    Both,
}

impl Role {
    pub fn can_send(self) -> bool {
        matches!(self, Role::Send | Role::Both)
    }

    pub fn can_receive(self) -> bool {
        matches!(self, Role::Receive | Role::Both)
    }
}

/// Interfaces an automaton declares, with their payload types
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Declaration {
    Event {
        name: String,
        payload: Option<String>,
    },
    Publisher {
        topic: String,
        msg: String,
    },
    Subscriber {
        topic: String,
        msg: String,
    },
    Timer {
        name: String,
        rate_hz: f64,
    },
    ServiceClient {
        service: String,
        srv: String,
    },
    ServiceServer {
        service: String,
        srv: String,
    },
    ActionClient {
        action: String,
        action_type: String,
    },
    ActionServer {
        action: String,
        action_type: String,
    },
}

/// One channel end point produced by a declaration
#[derive(Debug, Clone, PartialEq)]
pub struct Port {
    pub channel: String,
    pub role: Role,
    /// Struct type of the payload, if any
    pub payload: Option<String>,
    /// Period in nanoseconds, for timers
    pub period: Option<u64>,
}

impl Port {
    fn new(channel: String, role: Role, payload: Option<String>) -> Self {
        Self {
            channel,
            role,
            payload,
            period: None,
        }
    }
}

impl Declaration {
    /// Expands a declaration of automaton `owner` into the channel end
    /// points it stands for. Clients of services and actions get channels
    /// of their own, which the handler connects to the server.
    pub fn ports(&self, owner: &str) -> CompileResult<Vec<Port>> {
        use Role::*;
        let ports = match self {
            Declaration::Event { name, payload } => {
                vec![Port::new(name.clone(), Both, payload.clone())]
            }
            Declaration::Publisher { topic, msg } => {
                vec![Port::new(topic_channel(topic), Send, Some(msg.clone()))]
            }
            Declaration::Subscriber { topic, msg } => {
                vec![Port::new(topic_channel(topic), Receive, Some(msg.clone()))]
            }
            Declaration::Timer { name, rate_hz } => {
                let period = period_from_rate(*rate_hz).ok_or_else(|| {
                    StructuralError::InvalidTimer {
                        timer: name.clone(),
                        details: format!("a rate of {} Hz has no usable period", rate_hz),
                    }
                })?;
                if !period.exact {
                    log::warn!(
                        "timer `{}`: the period of {} Hz is rounded down to {}",
                        name,
                        rate_hz,
                        Duration::from_nanos(period.nanos)
                    );
                }
                vec![Port {
                    channel: timer_channel(name),
                    role: Receive,
                    payload: None,
                    period: Some(period.nanos),
                }]
            }
            Declaration::ServiceClient { service, srv } => {
                let client = |i: Interface| i.client_channel(owner).unwrap_or_default();
                vec![
                    Port::new(
                        client(Interface::ServiceRequest(service.clone())),
                        Send,
                        Some(format!("{srv}/Request")),
                    ),
                    Port::new(
                        client(Interface::ServiceResponse(service.clone())),
                        Receive,
                        Some(format!("{srv}/Response")),
                    ),
                ]
            }
            Declaration::ServiceServer { service, srv } => vec![
                Port::new(
                    Interface::ServiceRequest(service.clone()).channel_name(None)?,
                    Receive,
                    Some(format!("{srv}/Request")),
                ),
                Port::new(
                    Interface::ServiceResponse(service.clone()).channel_name(None)?,
                    Send,
                    Some(format!("{srv}/Response")),
                ),
            ],
            Declaration::ActionClient {
                action,
                action_type,
            } => action_ports(action, action_type, Some(owner)),
            Declaration::ActionServer {
                action,
                action_type,
            } => action_ports(action, action_type, None),
        };
        Ok(ports)
    }
}

/// Ports of an action client when `client` is given, of the server otherwise
fn action_ports(action: &str, action_type: &str, client: Option<&str>) -> Vec<Port> {
    let (requests, replies) = match client {
        Some(_) => (Role::Send, Role::Receive),
        None => (Role::Receive, Role::Send),
    };
    let name = |i: Interface| match client {
        Some(owner) => i.client_channel(owner).unwrap_or_default(),
        None => i.channel_name(None).unwrap_or_default(),
    };
    let a = action.to_string();
    vec![
        Port::new(
            name(Interface::ActionGoal(a.clone())),
            requests,
            Some(format!("{action_type}/Goal")),
        ),
        Port::new(name(Interface::ActionAccepted(a.clone())), replies, None),
        Port::new(name(Interface::ActionRejected(a.clone())), replies, None),
        Port::new(
            name(Interface::ActionFeedback(a.clone())),
            replies,
            Some(format!("{action_type}/Feedback")),
        ),
        Port::new(
            name(Interface::ActionResult(a)),
            replies,
            Some(format!("{action_type}/Result")),
        ),
    ]
}

/// End points implied by implementing behavior tree node `id`
pub fn bt_node_ports(id: u32) -> Vec<Port> {
    BtSignal::ALL
        .into_iter()
        .map(|signal| {
            let role = if signal.is_request() {
                Role::Receive
            } else {
                Role::Send
            };
            Port::new(bt_channel(id, signal), role, None)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names() {
        assert_eq!(
            Interface::Topic("/robot/pose".to_string()).channel_name(None).unwrap(),
            "topic_robot__pose_msg"
        );
        assert_eq!(
            Interface::Timer("blink".to_string()).channel_name(None).unwrap(),
            "ros_time_rate.blink"
        );
        assert_eq!(
            Interface::Bt(BtSignal::Running).channel_name(Some(1003)).unwrap(),
            "bt_1003_running"
        );
        assert!(Interface::Bt(BtSignal::Tick).channel_name(None).is_err());
        assert_eq!(
            Interface::ServiceResponse("/add".to_string()).channel_name(None).unwrap(),
            "srv_add_response"
        );
    }

    #[test]
    fn service_server_ports() {
        let ports = Declaration::ServiceServer {
            service: "/add".to_string(),
            srv: "AddTwoInts".to_string(),
        }
        .ports("node")
        .unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].channel, "srv_add_request");
        assert!(ports[0].role.can_receive() && !ports[0].role.can_send());
        assert_eq!(ports[1].payload.as_deref(), Some("AddTwoInts/Response"));
    }

    #[test]
    fn clients_own_their_channels() {
        let ports = Declaration::ServiceClient {
            service: "/add".to_string(),
            srv: "AddTwoInts".to_string(),
        }
        .ports("caller")
        .unwrap();
        let channels: Vec<_> = ports.iter().map(|p| p.channel.as_str()).collect();
        assert_eq!(
            channels,
            vec!["srv_add_req_client_caller", "srv_add_response_client_caller"]
        );
        assert!(ports[0].role.can_send() && ports[1].role.can_receive());

        let ports = Declaration::ActionClient {
            action: "/nav".to_string(),
            action_type: "Nav".to_string(),
        }
        .ports("1002_Move")
        .unwrap();
        assert_eq!(ports[0].channel, "action_nav_goal_req_client_1002_Move");
        assert_eq!(ports[3].channel, "action_nav_feedback_handle_client_1002_Move");
        assert_eq!(ports[4].payload.as_deref(), Some("Nav/Result"));
        assert_eq!(Interface::Topic("/t".to_string()).client_channel("x"), None);
    }

    #[test]
    fn timer_periods() {
        let ports = Declaration::Timer {
            name: "fast".to_string(),
            rate_hz: 4.0,
        }
        .ports("node")
        .unwrap();
        assert_eq!(ports[0].period, Some(250_000_000));
        let frame = Declaration::Timer {
            name: "frame".to_string(),
            rate_hz: 30.0,
        }
        .ports("node")
        .unwrap();
        assert_eq!(frame[0].period, Some(33_333_000));
        assert!(Declaration::Timer {
            name: "stopped".to_string(),
            rate_hz: 0.0,
        }
        .ports("node")
        .is_err());
    }

    #[test]
    fn bt_ports_directions() {
        let ports = bt_node_ports(1000);
        assert_eq!(ports[0].channel, "bt_1000_tick");
        assert_eq!(ports[0].role, Role::Receive);
        assert_eq!(ports[2].role, Role::Send);
    }
}
