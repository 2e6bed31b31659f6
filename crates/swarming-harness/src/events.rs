//! Line-oriented events the engine prints on stderr.
//!
//! Each record is `<event> [payload]`. Host-state events drive the DUT
//! state machine, test events count outcomes, and the rest are markers.

use swarming_core::DutState;

/// Test name the engine reports when it failed as a whole.
pub const AUTOSERV_SENTINEL: &str = "autoserv";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    HostState { name: String, state: DutState },
    TestPassed(String),
    TestFailed(String),
    Marker { name: String, payload: String },
}

const HOST_STATE_EVENTS: &[(&str, DutState)] = &[
    ("host_clean", DutState::Ready),
    ("host_ready", DutState::Ready),
    ("host_needs_repair", DutState::NeedsRepair),
    ("host_needs_reset", DutState::NeedsReset),
    ("host_failed_repair", DutState::RepairFailed),
    ("host_needs_deploy", DutState::NeedsDeploy),
    ("host_needs_manual_repair", DutState::NeedsManualRepair),
    ("host_needs_replacement", DutState::NeedsReplacement),
];

const MARKER_EVENTS: &[&str] = &[
    "starting",
    "running",
    "gathering",
    "parsing",
    "aborted",
    "completed",
    "x_tests_done",
];

/// Parses one record; `None` for blank lines and unknown event names.
///
/// A host state record that names further host state events on the same
/// line resolves to the last of them.
pub fn parse_line(line: &str) -> Option<Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (name, payload) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };
    if let Some(first) = host_state_event(name) {
        let last = payload
            .split_whitespace()
            .filter_map(host_state_event)
            .last()
            .unwrap_or(first);
        return Some(Event::HostState {
            name: last.0.to_string(),
            state: last.1,
        });
    }
    match name {
        "test_passed" => Some(Event::TestPassed(payload.to_string())),
        "test_failed" => Some(Event::TestFailed(payload.to_string())),
        _ if MARKER_EVENTS.contains(&name) => Some(Event::Marker {
            name: name.to_string(),
            payload: payload.to_string(),
        }),
        _ => None,
    }
}

fn host_state_event(name: &str) -> Option<(&'static str, DutState)> {
    HOST_STATE_EVENTS.iter().copied().find(|(n, _)| *n == name)
}

/// Host state after `event`; events that do not carry a state keep `current`.
pub fn next_state(current: Option<DutState>, event: &Event) -> Option<DutState> {
    match event {
        Event::HostState { state, .. } => Some(*state),
        _ => current,
    }
}

/// What one engine run reported, folded in stream order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventSummary {
    pub host_state: Option<DutState>,
    pub failed_tests: Vec<String>,
    pub passed_tests: usize,
    pub autoserv_failed: bool,
    pub events: usize,
    pub unrecognized: usize,
}

impl EventSummary {
    pub fn observe_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match parse_line(line) {
            Some(event) => self.observe(&event),
            None => {
                self.unrecognized += 1;
                tracing::debug!(line = line.trim_end(), "skipping unrecognized engine output");
            }
        }
    }

    pub fn observe(&mut self, event: &Event) {
        self.events += 1;
        self.host_state = next_state(self.host_state, event);
        match event {
            Event::TestFailed(name) if name == AUTOSERV_SENTINEL => self.autoserv_failed = true,
            Event::TestFailed(name) => self.failed_tests.push(name.clone()),
            Event::TestPassed(_) => self.passed_tests += 1,
            Event::HostState { name, state } => {
                tracing::info!(event = %name, state = %state, "engine reported host state")
            }
            Event::Marker { .. } => {}
        }
    }

    pub fn tests_failed(&self) -> usize {
        self.failed_tests.len()
    }

    /// Whether the engine said anything about test results.
    pub fn saw_test_failure(&self) -> bool {
        self.autoserv_failed || !self.failed_tests.is_empty()
    }
}
