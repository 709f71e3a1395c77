// Copyright 2025 Cornell University
// released under MIT License

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

const MODEL: &str = r#"{
    "automata": [{
        "name": "blinker",
        "variables": [{"name": "on", "type": "bool", "init": "false"}],
        "declarations": [{"kind": "timer", "name": "blink", "rate_hz": 2.0}],
        "states": [{"name": "s", "transitions": [{
            "trigger": {"kind": "timer", "name": "blink"}, "target": "s",
            "body": [{"kind": "assign", "target": "on", "value": "!on"}]
        }]}]
    }],
    "properties": [{"name": "on_time", "expression": {"op": "≤", "left": "t", "right": 2000}}]
}"#;

fn run(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fsm2jani"))
        .current_dir(dir)
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn writes_a_jani_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("model.json"), MODEL).unwrap();
    let out = run(
        dir.path(),
        &["model.json", "-o", "model.jani", "--max-time", "2s", "--color", "never"],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let text = fs::read_to_string(dir.path().join("model.jani")).unwrap();
    let jani: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(jani["type"], "mdp");
    assert_eq!(jani["metadata"]["time-unit"], "ms");
    let automata: Vec<&str> = jani["automata"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["name"].as_str().unwrap())
        .collect();
    assert_eq!(automata, vec!["blinker", "ros_time_rate.blink", "global_timer"]);
    assert_eq!(jani["properties"][0]["name"], "on_time");

    // same input, same bytes
    let again = run(
        dir.path(),
        &["model.json", "-o", "again.jani", "--max-time", "2s", "--color", "never"],
    );
    assert!(again.status.success());
    assert_eq!(text, fs::read_to_string(dir.path().join("again.jani")).unwrap());
}

#[test]
fn config_file_and_overrides() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("model.json"), MODEL).unwrap();
    fs::write(dir.path().join("cfg.json"), r#"{"max_time": "1s"}"#).unwrap();
    let out = run(
        dir.path(),
        &["model.json", "--config", "cfg.json", "--text", "--explore", "1000"],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let listing = String::from_utf8_lossy(&out.stdout);
    assert!(listing.contains("automaton blinker {"));
    assert!(listing.contains("time unit ms"));
    assert!(String::from_utf8_lossy(&out.stderr).contains("explored"));

    fs::write(dir.path().join("bad.json"), r#"{"max_array_size": 0}"#).unwrap();
    let out = run(dir.path(), &["model.json", "--config", "bad.json"]);
    assert!(!out.status.success());
}

#[test]
fn reports_errors_with_their_location() {
    let dir = tempfile::tempdir().unwrap();
    let broken = MODEL.replace("\"target\": \"s\"", "\"target\": \"nowhere\"");
    fs::write(dir.path().join("model.json"), broken).unwrap();
    let out = run(dir.path(), &["model.json", "--color", "never"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("unknown state `nowhere`"), "{}", stderr);
    assert!(stderr.contains("model.json:"), "{}", stderr);

    fs::write(dir.path().join("model.json"), "{\"automata\": [}").unwrap();
    let out = run(dir.path(), &["model.json", "--color", "never"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("model.json:1:"));
}
