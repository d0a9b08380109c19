//! Regression tests for stall-pattern detection priorities and hashing

use serde_json::json;

use harness::stall::{input_hash, StallConfig, StallKind, StallTracker, ToolCallRecord};

fn call(tool: &str, input: serde_json::Value) -> ToolCallRecord {
    ToolCallRecord::new(tool, &input)
}

#[test]
fn three_identical_calls_report_repetition() {
    let mut tracker = StallTracker::default();
    let c = call("run_command", json!({"command": "cargo test"}));
    assert_eq!(tracker.record_turn(&[c.clone()], true), None);
    assert_eq!(tracker.record_turn(&[c.clone()], true), None);
    assert_eq!(tracker.record_turn(&[c], true), Some(StallKind::Repetition));
}

#[test]
fn ababab_reports_oscillation() {
    let mut tracker = StallTracker::default();
    let a = call("read_file", json!({"path": "src/a.rs"}));
    let b = call("read_file", json!({"path": "src/b.rs"}));
    let mut detections = Vec::new();
    for i in 0..6 {
        let c = if i % 2 == 0 { a.clone() } else { b.clone() };
        detections.push(tracker.record_turn(&[c], true));
    }
    assert_eq!(detections.pop().unwrap(), Some(StallKind::Oscillation));
    assert!(detections.into_iter().all(|d| d.is_none()));
}

#[test]
fn ten_turns_without_file_activity_report_idle() {
    let mut tracker = StallTracker::default();
    let mut last = None;
    for i in 0..10 {
        let c = call("search_files", json!({ "pattern": format!("p{i}") }));
        last = tracker.record_turn(&[c], false);
    }
    assert_eq!(last, Some(StallKind::Idle));
}

#[test]
fn repetition_reported_before_idle_when_both_apply() {
    let config = StallConfig {
        idle_threshold: 2,
        ..Default::default()
    };
    let mut tracker = StallTracker::new(config);
    let c = call("read_file", json!({"path": "a.rs"}));
    tracker.record_turn(&[c.clone()], false);
    tracker.record_turn(&[c.clone()], false);
    // Turn 3: idle threshold is long past, but repetition wins
    assert_eq!(tracker.record_turn(&[c], false), Some(StallKind::Repetition));
}

#[test]
fn oscillation_reported_before_idle_when_both_apply() {
    let config = StallConfig {
        idle_threshold: 6,
        ..Default::default()
    };
    let mut tracker = StallTracker::new(config);
    let a = call("read_file", json!({"path": "a.rs"}));
    let b = call("read_file", json!({"path": "b.rs"}));
    let mut last = None;
    for i in 0..6 {
        let c = if i % 2 == 0 { a.clone() } else { b.clone() };
        last = tracker.record_turn(&[c], false);
    }
    assert_eq!(last, Some(StallKind::Oscillation));
}

#[test]
fn hash_is_stable_under_key_permutation() {
    let permutations = [
        json!({"a": 1, "b": {"x": true, "y": [1, 2]}, "c": "s"}),
        json!({"c": "s", "a": 1, "b": {"y": [1, 2], "x": true}}),
        json!({"b": {"x": true, "y": [1, 2]}, "c": "s", "a": 1}),
    ];
    let hashes: Vec<String> = permutations.iter().map(input_hash).collect();
    assert_eq!(hashes[0], hashes[1]);
    assert_eq!(hashes[1], hashes[2]);
}

#[test]
fn hash_differs_for_structurally_different_inputs() {
    let base = json!({"path": "a.rs", "limit": 10});
    let different_value = json!({"path": "a.rs", "limit": 11});
    let different_key = json!({"path": "a.rs", "cap": 10});
    assert_ne!(input_hash(&base), input_hash(&different_value));
    assert_ne!(input_hash(&base), input_hash(&different_key));
}

#[test]
fn intervention_budget_hard_stops_after_two() {
    let mut tracker = StallTracker::default();
    let c = call("read_file", json!({"path": "a.rs"}));

    for _ in 0..3 {
        tracker.record_turn(&[c.clone()], false);
    }
    tracker.record_intervention();
    for _ in 0..3 {
        tracker.record_turn(&[c.clone()], false);
    }
    tracker.record_intervention();
    assert!(tracker.should_abort());
}
