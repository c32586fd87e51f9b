//! Agent run state, composed from focused sub-records.
//!
//! The orchestrator exclusively mutates plan, history and budgets; the git
//! sidecar record is written once at setup and read at rollback/commit; the
//! graph handle lives in `index::graph` and never appears here.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;

use crate::git_safety::GitState;

/// Total tool calls allowed across a run, regardless of phase.
pub const MAX_STEPS: usize = 35;
/// Consecutive no-op writes tolerated before a forced handoff.
pub const NOOP_STREAK_MAX: u32 = 2;
/// Times the reviewer may reject the same step before the run fails.
pub const REJECT_THRESHOLD: u32 = 3;
/// Re-prompts allowed when the diff engine cannot splice.
pub const DIFF_RETRIES: u32 = 2;

/// Bounded ring sizes.
const OBSERVATION_RING: usize = 20;
const ACTION_RING: usize = 12;
/// Identical consecutive actions that count as a loop.
const LOOP_RUN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planner,
    Coder,
    Reviewer,
    Done,
    Failed,
}

/// Per-step validation contract, decoded from (untrusted) planner output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidatorRule {
    DeleteLines { start: usize, end: usize },
    AddImport { name: String },
    UpdateAssignment { name: String, value: String },
    AddComment { text: String },
    NontrivialDiff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    /// May be unresolved; the coder runs it through the path resolver.
    pub target_file: Option<String>,
    pub rule: ValidatorRule,
    pub is_question: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PlanState {
    pub steps: Vec<PlanStep>,
    pub current: usize,
}

impl PlanState {
    pub fn step(&self) -> Option<&PlanStep> {
        self.steps.get(self.current)
    }

    pub fn advance(&mut self) {
        self.current += 1;
    }

    pub fn finished(&self) -> bool {
        self.current >= self.steps.len()
    }
}

/// One entry in the observation ring: a tool result, a gate decision, an
/// error label.
#[derive(Debug, Clone)]
pub struct Observation {
    pub label: String,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct HistoryState {
    observations: VecDeque<Observation>,
    actions: VecDeque<String>,
}

impl HistoryState {
    pub fn observe(&mut self, label: &str, detail: &str) {
        if self.observations.len() >= OBSERVATION_RING {
            self.observations.pop_front();
        }
        self.observations.push_back(Observation {
            label: label.to_string(),
            detail: detail.to_string(),
        });
    }

    pub fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.observations.iter()
    }

    /// Wipe the observation ring (the loop breaker does this).
    pub fn clear_observations(&mut self) {
        self.observations.clear();
    }

    /// Push a canonicalized action; true when the last `LOOP_RUN` entries
    /// are identical.
    pub fn record_action(&mut self, canonical: String) -> bool {
        if self.actions.len() >= ACTION_RING {
            self.actions.pop_front();
        }
        self.actions.push_back(canonical);
        self.tail_is_loop()
    }

    fn tail_is_loop(&self) -> bool {
        if self.actions.len() < LOOP_RUN {
            return false;
        }
        let tail: Vec<&String> = self.actions.iter().rev().take(LOOP_RUN).collect();
        tail.windows(2).all(|w| w[0] == w[1])
    }

    /// The loop breaker clears the action tail so the same action does not
    /// immediately re-trigger after a handoff.
    pub fn clear_actions(&mut self) {
        self.actions.clear();
    }
}

/// Canonical form of an outgoing action: name plus payload with sorted keys.
pub fn canonical_action(action: &str, payload: &serde_json::Value) -> String {
    let sorted = sort_value(payload);
    format!("{}:{}", action, sorted)
}

fn sort_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}={}", k, sort_value(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(sort_value).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

#[derive(Debug, Default)]
pub struct Budgets {
    pub step_count: usize,
    pub no_op_streak: u32,
    /// Reviewer rejections keyed by plan-step index.
    pub reject_counts: HashMap<usize, u32>,
    /// How many times the loop breaker has fired this run.
    pub loop_breaks: u32,
}

impl Budgets {
    pub fn steps_exhausted(&self) -> bool {
        self.step_count >= MAX_STEPS
    }

    pub fn reject(&mut self, step: usize) -> u32 {
        let count = self.reject_counts.entry(step).or_insert(0);
        *count += 1;
        *count
    }
}

/// Snapshot of file contents the agent has read this run.
#[derive(Debug, Default)]
pub struct ContextBuffer {
    pub files: HashMap<String, String>,
}

/// Fingerprints recorded around an approved write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffFingerprint {
    pub pre_hash: String,
    pub post_hash: String,
}

#[derive(Debug)]
pub struct AgentState {
    pub goal: String,
    pub repo_root: PathBuf,
    pub phase: Phase,
    pub plan: PlanState,
    pub history: HistoryState,
    pub budgets: Budgets,
    pub context: ContextBuffer,
    pub files_read: BTreeSet<String>,
    pub files_modified: BTreeSet<String>,
    pub diff_memory: HashMap<String, DiffFingerprint>,
    pub git: GitState,
    /// Set when the last applied edit came from the CRUD fast path, so the
    /// reviewer can settle deterministically validated steps without the
    /// oracle.
    pub last_edit_deterministic: bool,
}

impl AgentState {
    pub fn new(goal: &str, repo_root: &std::path::Path) -> Self {
        Self {
            goal: goal.to_string(),
            repo_root: repo_root.to_path_buf(),
            phase: Phase::Planner,
            plan: PlanState::default(),
            history: HistoryState::default(),
            budgets: Budgets::default(),
            context: ContextBuffer::default(),
            files_read: BTreeSet::new(),
            files_modified: BTreeSet::new(),
            diff_memory: HashMap::new(),
            git: GitState::default(),
            last_edit_deterministic: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_detection_on_three_identical() {
        let mut history = HistoryState::default();
        let canonical =
            canonical_action("read_file", &serde_json::json!({"path": "x.py"}));
        assert!(!history.record_action(canonical.clone()));
        assert!(!history.record_action(canonical.clone()));
        assert!(history.record_action(canonical));
    }

    #[test]
    fn test_no_loop_when_actions_differ() {
        let mut history = HistoryState::default();
        assert!(!history.record_action("a".to_string()));
        assert!(!history.record_action("b".to_string()));
        assert!(!history.record_action("a".to_string()));
    }

    #[test]
    fn test_canonical_action_sorts_payload_keys() {
        let a = canonical_action("w", &serde_json::json!({"b": 1, "a": 2}));
        let b = canonical_action("w", &serde_json::json!({"a": 2, "b": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_observation_ring_is_bounded() {
        let mut history = HistoryState::default();
        for i in 0..50 {
            history.observe("obs", &i.to_string());
        }
        assert!(history.observations().count() <= 20);
        // Newest entries survive.
        assert!(history.observations().any(|o| o.detail == "49"));
    }

    #[test]
    fn test_reject_counter_per_step() {
        let mut budgets = Budgets::default();
        assert_eq!(budgets.reject(0), 1);
        assert_eq!(budgets.reject(0), 2);
        assert_eq!(budgets.reject(1), 1);
        assert_eq!(budgets.reject(0), 3);
    }

    #[test]
    fn test_validator_rule_json_shape() {
        let json = r#"{"rule": "delete_lines", "start": 3, "end": 5}"#;
        let rule: ValidatorRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule, ValidatorRule::DeleteLines { start: 3, end: 5 });

        // Unknown variants must not silently pass.
        assert!(serde_json::from_str::<ValidatorRule>(r#"{"rule": "explode"}"#).is_err());
    }
}
