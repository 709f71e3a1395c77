// Copyright 2025 Cornell University
// released under MIT License

use rustc_hash::FxHashSet;
use std::collections::VecDeque;

use fsm2jani::compose::{compose, Compiled};
use fsm2jani::config::{Config, TimeUnit};
use fsm2jani::eval::Value;
use fsm2jani::explore::{Explorer, NetState};
use fsm2jani::input::parse_project;
use fsm2jani::serialize::to_jani;

fn compile(model: &str, config: &Config) -> Compiled {
    let project = parse_project(model).unwrap().lower(config).unwrap();
    compose(&project, config).unwrap()
}

fn config(max_time: &str) -> Config {
    Config {
        max_time: max_time.parse().unwrap(),
        ..Config::default()
    }
}

/// Reachable states without successors
fn deadlocks(explorer: &Explorer, limit: usize) -> Vec<NetState> {
    let (states, report) = explorer.reachable(limit);
    assert!(report.complete, "state space larger than {}", limit);
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    states
        .into_iter()
        .filter(|s| explorer.successors(s).unwrap().is_empty())
        .collect()
}

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
            "states": [{"name": "run", "transitions": [{
                "trigger": {"kind": "timer", "name": "tick"},
                "target": "run",
                "body": [
                    {"kind": "assign", "target": "count", "value": "count + 1"},
                    {"kind": "send", "interface": {"kind": "topic", "name": "/chatter"},
                     "params": {"data": "count"}}
                ]
            }]}]
        },
        {
            "name": "listener",
            "variables": [{"name": "last", "type": "int32"}],
            "declarations": [{"kind": "subscriber", "topic": "/chatter", "msg": "std_msgs/Int32"}],
            "states": [{"name": "idle", "transitions": [{
                "trigger": {"kind": "topic", "name": "/chatter"},
                "target": "idle",
                "body": [{"kind": "assign", "target": "last", "value": "_msg.data"}]
            }]}]
        }
    ]
}"#;

#[test]
fn identical_input_gives_identical_output() {
    let a = serde_json::to_string_pretty(&to_jani(&compile(PUBSUB, &config("3s")))).unwrap();
    let b = serde_json::to_string_pretty(&to_jani(&compile(PUBSUB, &config("3s")))).unwrap();
    assert_eq!(a, b);
}

#[test]
fn no_message_is_lost() {
    let compiled = compile(PUBSUB, &config("3s"));
    let explorer = Explorer::new(&compiled.network);
    let (states, _) = explorer.reachable(100_000);
    for state in &states {
        // whenever the talker is between messages and nothing is in flight,
        // the listener has seen every message
        let settled = explorer.location(state, "talker") == Some("run")
            && explorer.location(state, "topic_chatter_msg") == Some("waiting");
        if settled {
            assert_eq!(
                explorer.local(state, "listener", "last"),
                explorer.local(state, "talker", "count")
            );
        }
    }
    // timers fire at 0s, 1s, 2s and 3s
    let ends = deadlocks(&explorer, 100_000);
    assert!(!ends.is_empty());
    for end in &ends {
        assert_eq!(explorer.global(end, "t"), Some(&Value::Int(3)));
        assert_eq!(explorer.local(end, "talker", "count"), Some(&Value::Int(4)));
        assert_eq!(explorer.local(end, "listener", "last"), Some(&Value::Int(4)));
        assert_eq!(explorer.global(end, "topic_chatter_msg.valid"), Some(&Value::Bool(true)));
    }
}

#[test]
fn channels_alternate_between_send_and_receive() {
    let compiled = compile(PUBSUB, &config("2s"));
    let explorer = Explorer::new(&compiled.network);
    let (states, _) = explorer.reachable(100_000);
    for state in &states {
        let full = explorer.location(state, "topic_chatter_msg") == Some("received");
        for step in explorer.successors(state).unwrap() {
            match step.label.as_str() {
                "topic_chatter_msg_on_send" => assert!(!full),
                "topic_chatter_msg_on_receive" => assert!(full),
                // time only passes while no message is in flight
                "global_timer_tick" => assert!(!full),
                _ => {}
            }
        }
    }
}

#[test]
fn time_is_monotonic_and_bounded() {
    let compiled = compile(PUBSUB, &config("2s"));
    let explorer = Explorer::new(&compiled.network);
    let (states, _) = explorer.reachable(100_000);
    let time = |s: &NetState| match explorer.global(s, "t") {
        Some(Value::Int(t)) => *t,
        other => panic!("unexpected time {:?}", other),
    };
    for state in &states {
        assert!(time(state) <= 2);
        for step in explorer.successors(state).unwrap() {
            if step.label == "global_timer_tick" {
                assert_eq!(time(&step.target), time(state) + 1);
            } else {
                assert_eq!(time(&step.target), time(state));
            }
        }
    }
}

#[test]
fn simultaneous_timers_fire_in_either_order() {
    let model = r#"{"automata": [
        {
            "name": "fast",
            "variables": [{"name": "n", "type": "int32", "init": "0"}],
            "declarations": [{"kind": "timer", "name": "a", "rate_hz": 1.0}],
            "states": [{"name": "s", "transitions": [{
                "trigger": {"kind": "timer", "name": "a"}, "target": "s",
                "body": [{"kind": "assign", "target": "n", "value": "n + 1"}]
            }]}]
        },
        {
            "name": "slow",
            "variables": [{"name": "n", "type": "int32", "init": "0"}],
            "declarations": [{"kind": "timer", "name": "b", "rate_hz": 0.5}],
            "states": [{"name": "s", "transitions": [{
                "trigger": {"kind": "timer", "name": "b"}, "target": "s",
                "body": [{"kind": "assign", "target": "n", "value": "n + 1"}]
            }]}]
        }
    ]}"#;
    let compiled = compile(model, &config("2s"));
    let explorer = Explorer::new(&compiled.network);
    let (states, _) = explorer.reachable(100_000);
    let due = |s: &NetState, timer: &str| {
        explorer.global(s, &format!("ros_time_rate.{}.due", timer)) == Some(&Value::Bool(true))
    };

    let mut both_orders = false;
    for state in &states {
        for step in explorer.successors(state).unwrap() {
            if step.label == "global_timer_tick" {
                let t = explorer.global(&step.target, "t");
                assert!(due(&step.target, "a"));
                assert_eq!(due(&step.target, "b"), t == Some(&Value::Int(2)));
            }
        }
        if explorer.global(state, "t") == Some(&Value::Int(2)) && due(state, "a") && due(state, "b") {
            let labels: Vec<String> = explorer
                .successors(state)
                .unwrap()
                .into_iter()
                .map(|s| s.label)
                .collect();
            both_orders |= labels.iter().any(|l| l == "ros_time_rate.a_on_send")
                && labels.iter().any(|l| l == "ros_time_rate.b_on_send");
        }
    }
    assert!(both_orders);

    for end in deadlocks(&explorer, 100_000) {
        assert_eq!(explorer.local(&end, "fast", "n"), Some(&Value::Int(3)));
        assert_eq!(explorer.local(&end, "slow", "n"), Some(&Value::Int(2)));
    }
}

#[test]
fn flattened_bodies_keep_their_meaning() {
    let model = r#"{"automata": [
        {
            "name": "producer",
            "variables": [
                {"name": "a", "type": "int32", "init": "0"},
                {"name": "b", "type": "int32", "init": "0"},
                {"name": "c", "type": "int32", "init": "0"}
            ],
            "declarations": [{"kind": "event", "name": "ping"}],
            "states": [
                {"name": "start", "transitions": [{"target": "end", "body": [
                    {"kind": "assign", "target": "a", "value": "1"},
                    {"kind": "if", "branches": [{"condition": "a == 1", "body": [
                        {"kind": "assign", "target": "b", "value": "2"},
                        {"kind": "send", "interface": {"kind": "event", "name": "ping"}},
                        {"kind": "assign", "target": "b", "value": "b + 1"}
                    ]}], "else": [
                        {"kind": "assign", "target": "b", "value": "7"}
                    ]},
                    {"kind": "assign", "target": "c", "value": "a + b"}
                ]}]},
                {"name": "end"}
            ]
        },
        {
            "name": "consumer",
            "variables": [{"name": "got", "type": "bool", "init": "false"}],
            "declarations": [{"kind": "event", "name": "ping"}],
            "states": [{"name": "wait", "transitions": [{
                "trigger": {"kind": "event", "name": "ping"}, "target": "wait",
                "body": [{"kind": "assign", "target": "got", "value": "true"}]
            }]}]
        }
    ]}"#;
    let compiled = compile(model, &Config::default());
    assert!(compiled.network.time_unit.is_none());
    let explorer = Explorer::new(&compiled.network);
    let ends = deadlocks(&explorer, 10_000);
    assert_eq!(ends.len(), 1);
    let end = &ends[0];
    assert_eq!(explorer.location(end, "producer"), Some("end"));
    assert_eq!(explorer.local(end, "producer", "b"), Some(&Value::Int(3)));
    assert_eq!(explorer.local(end, "producer", "c"), Some(&Value::Int(4)));
    assert_eq!(explorer.local(end, "consumer", "got"), Some(&Value::Bool(true)));
}

#[test]
fn reads_past_the_length_raise_the_flag() {
    let model = |read: &str| {
        format!(
            r#"{{"automata": [{{
                "name": "m",
                "variables": [
                    {{"name": "arr", "type": "int32[<=3]"}},
                    {{"name": "x", "type": "int32", "init": "9"}}
                ],
                "states": [
                    {{"name": "start", "transitions": [{{"target": "end", "body": [
                        {{"kind": "assign", "target": "arr[0]", "value": "5"}},
                        {{"kind": "assign", "target": "x", "value": "arr[{}]"}}
                    ]}}]}},
                    {{"name": "end"}}
                ]
            }}]}}"#,
            read
        )
    };
    for (read, value, flagged) in [("0", 5, false), ("1", 0, true)] {
        let compiled = compile(&model(read), &Config::default());
        let explorer = Explorer::new(&compiled.network);
        let ends = deadlocks(&explorer, 100);
        assert_eq!(ends.len(), 1);
        assert_eq!(explorer.local(&ends[0], "m", "x"), Some(&Value::Int(value)));
        assert_eq!(explorer.local(&ends[0], "m", "arr.len"), Some(&Value::Int(1)));
        assert_eq!(
            explorer.global(&ends[0], "m.out_of_bounds"),
            Some(&Value::Bool(flagged))
        );
    }
}

const SEQUENCE: &str = r#"{
    "plugins": [
        {
            "name": "Succeed",
            "states": [{"name": "idle", "transitions": [
                {"trigger": {"kind": "bt", "signal": "tick"}, "target": "idle",
                 "body": [{"kind": "send", "interface": {"kind": "bt", "signal": "success"}}]},
                {"trigger": {"kind": "bt", "signal": "halt"}, "target": "idle",
                 "body": [{"kind": "send", "interface": {"kind": "bt", "signal": "halted"}}]}
            ]}]
        },
        {
            "name": "KeepRunning",
            "states": [{"name": "idle", "transitions": [
                {"trigger": {"kind": "bt", "signal": "tick"}, "target": "idle",
                 "body": [{"kind": "send", "interface": {"kind": "bt", "signal": "running"}}]},
                {"trigger": {"kind": "bt", "signal": "halt"}, "target": "idle",
                 "body": [{"kind": "send", "interface": {"kind": "bt", "signal": "halted"}}]}
            ]}]
        }
    ],
    "trees": [{
        "name": "main",
        "root": {"kind": "Sequence", "children": [
            {"kind": "Action", "plugin": "Succeed"},
            {"kind": "Action", "plugin": "KeepRunning"}
        ]}
    }]
}"#;

#[test]
fn sequence_with_a_running_child() {
    let compiled = compile(SEQUENCE, &config("1s"));
    let names: Vec<_> = compiled.network.automata.iter().map(|a| a.name.as_str()).collect();
    assert!(names.starts_with(&["bt_root_fsm_main", "1000_Sequence", "1001_Succeed", "1002_KeepRunning"]));
    let explorer = Explorer::new(&compiled.network);

    // states are paired with the number of ticks the root, A and B received
    type Counted = (NetState, [u32; 3]);
    let tick_labels = ["bt_1000_tick_on_send", "bt_1001_tick_on_send", "bt_1002_tick_on_send"];
    let initial: Counted = (explorer.initial(), [0; 3]);
    let mut seen: FxHashSet<Counted> = FxHashSet::default();
    let mut queue = VecDeque::from([initial.clone()]);
    seen.insert(initial);
    let mut answered_running = false;
    let mut ends = vec![];
    while let Some((state, ticks)) = queue.pop_front() {
        assert!(seen.len() < 100_000);
        let steps = explorer.successors(&state).unwrap();
        if steps.is_empty() {
            ends.push(ticks);
        }
        for step in steps {
            assert_ne!(step.label, "bt_1000_success_on_send");
            assert_ne!(step.label, "bt_1000_failure_on_send");
            answered_running |= step.label == "bt_1000_running_on_send";
            let mut next = ticks;
            if let Some(i) = tick_labels.iter().position(|l| *l == step.label) {
                next[i] += 1;
            }
            // B is ticked at most once per tick of the root, A only once
            assert!(next[2] <= next[0]);
            assert!(next[1] <= 1);
            let counted = (step.target, next);
            if seen.insert(counted.clone()) {
                queue.push_back(counted);
            }
        }
    }
    assert!(answered_running);
    // ticks at 0s and 1s; the second one goes straight to B
    assert!(!ends.is_empty());
    assert!(ends.iter().all(|t| *t == [2, 1, 2]));
}

#[test]
fn trees_tick_at_rates_without_whole_periods() {
    let config = Config {
        bt_tick_rate: 3.0,
        ..config("1s")
    };
    let compiled = compile(SEQUENCE, &config);
    assert_eq!(compiled.network.time_unit, Some(TimeUnit::Ms));
    let explorer = Explorer::new(&compiled.network);
    // a third of a second is floored to 333ms: ticks at 0, 333, 666 and 999
    let ends = deadlocks(&explorer, 100_000);
    assert!(!ends.is_empty());
    for end in &ends {
        assert_eq!(explorer.global(end, "t"), Some(&Value::Int(999)));
    }
}

/// Client `name` asks for `id` once and keeps the answer in `got`
fn echo_client(name: &str, id: i64) -> String {
    format!(
        r#"{{
            "name": "{name}",
            "variables": [{{"name": "got", "type": "int32", "init": "0"}}],
            "declarations": [{{"kind": "service_client", "service": "/echo", "srv": "Echo"}}],
            "states": [
                {{"name": "ask", "transitions": [{{"target": "wait", "body": [
                    {{"kind": "send", "interface": {{"kind": "service_request", "name": "/echo"}},
                     "params": {{"id": "{id}"}}}}
                ]}}]}},
                {{"name": "wait", "transitions": [{{
                    "trigger": {{"kind": "service_response", "name": "/echo"}},
                    "target": "done",
                    "body": [{{"kind": "assign", "target": "got", "value": "_res.id"}}]
                }}]}},
                {{"name": "done"}}
            ]
        }}"#
    )
}

#[test]
fn responses_reach_the_client_that_asked() {
    let model = format!(
        r#"{{
            "structs": [
                {{"name": "Echo/Request", "fields": [{{"name": "id", "type": "int32"}}]}},
                {{"name": "Echo/Response", "fields": [{{"name": "id", "type": "int32"}}]}}
            ],
            "automata": [
                {c1},
                {{
                    "name": "server",
                    "declarations": [{{"kind": "service_server", "service": "/echo", "srv": "Echo"}}],
                    "states": [{{"name": "idle", "transitions": [{{
                        "trigger": {{"kind": "service_request", "name": "/echo"}},
                        "target": "idle",
                        "body": [{{"kind": "send",
                                   "interface": {{"kind": "service_response", "name": "/echo"}},
                                   "params": {{"id": "_req.id"}}}}]
                    }}]}}]
                }},
                {c2}
            ]
        }}"#,
        c1 = echo_client("c1", 1),
        c2 = echo_client("c2", 2)
    );
    let compiled = compile(&model, &config("1s"));
    let explorer = Explorer::new(&compiled.network);
    let (states, _) = explorer.reachable(100_000);
    let got = |s: &NetState, client: &str| explorer.local(s, client, "got").cloned();

    let mut second_served_first = false;
    for state in &states {
        assert!(matches!(got(state, "c1"), Some(Value::Int(0 | 1))));
        assert!(matches!(got(state, "c2"), Some(Value::Int(0 | 2))));
        second_served_first |= explorer.location(state, "srv_handler_echo")
            == Some("processing_client_c2")
            && explorer.location(state, "c1") == Some("wait");
    }
    assert!(second_served_first);

    let ends = deadlocks(&explorer, 100_000);
    assert!(!ends.is_empty());
    for end in &ends {
        assert_eq!(got(end, "c1"), Some(Value::Int(1)));
        assert_eq!(got(end, "c2"), Some(Value::Int(2)));
        assert_eq!(explorer.location(end, "srv_handler_echo"), Some("waiting"));
    }
}

/// Publisher `name` sends `value` once, as soon as it starts
fn one_shot_publisher(name: &str, value: i64) -> String {
    format!(
        r#"{{
            "name": "{name}",
            "declarations": [{{"kind": "publisher", "topic": "/numbers", "msg": "std_msgs/Int32"}}],
            "states": [
                {{"name": "go", "transitions": [{{"target": "done", "body": [
                    {{"kind": "send", "interface": {{"kind": "topic", "name": "/numbers"}},
                     "params": {{"data": "{value}"}}}}
                ]}}]}},
                {{"name": "done"}}
            ]
        }}"#
    )
}

#[test]
fn racing_publishers_are_both_heard() {
    let model = format!(
        r#"{{
            "structs": [{{"name": "std_msgs/Int32", "fields": [{{"name": "data", "type": "int32"}}]}}],
            "automata": [
                {a},
                {b},
                {{
                    "name": "listener",
                    "variables": [
                        {{"name": "heard", "type": "int32", "init": "0"}},
                        {{"name": "count", "type": "int32", "init": "0"}}
                    ],
                    "declarations": [{{"kind": "subscriber", "topic": "/numbers", "msg": "std_msgs/Int32"}}],
                    "states": [{{"name": "idle", "transitions": [{{
                        "trigger": {{"kind": "topic", "name": "/numbers"}},
                        "target": "idle",
                        "body": [
                            {{"kind": "assign", "target": "heard", "value": "heard * 10 + _msg.data"}},
                            {{"kind": "assign", "target": "count", "value": "count + 1"}}
                        ]
                    }}]}}]
                }}
            ]
        }}"#,
        a = one_shot_publisher("a", 1),
        b = one_shot_publisher("b", 2)
    );
    let compiled = compile(&model, &config("1s"));
    let explorer = Explorer::new(&compiled.network);
    let (states, _) = explorer.reachable(100_000);

    let mut both_ready = false;
    for state in &states {
        let waiting = explorer.location(state, "topic_numbers_msg") == Some("waiting");
        let sends = explorer
            .successors(state)
            .unwrap()
            .into_iter()
            .filter(|step| step.label == "topic_numbers_msg_on_send")
            .count();
        // a second message is only sent once the first one was taken
        assert!(sends == 0 || waiting);
        both_ready |= sends == 2;
    }
    assert!(both_ready);

    let ends = deadlocks(&explorer, 100_000);
    let mut orders: Vec<_> = ends
        .iter()
        .map(|end| {
            assert_eq!(explorer.local(end, "listener", "count"), Some(&Value::Int(2)));
            explorer.local(end, "listener", "heard").cloned()
        })
        .collect();
    orders.sort_by_key(|v| format!("{:?}", v));
    orders.dedup();
    assert_eq!(orders, vec![Some(Value::Int(12)), Some(Value::Int(21))]);
}
