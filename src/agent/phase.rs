//! The phase machine.
//!
//! PLANNER → CODER ↔ REVIEWER → {DONE, FAILED}. Each transition is driven
//! by an action produced either by deterministic rules (CRUD fast path,
//! validators, loop/no-op breakers) or by the oracle. Tool permissions are
//! enforced before dispatch; every outgoing action is canonicalized into a
//! bounded history ring for loop detection; the whole run is capped at
//! `MAX_STEPS` tool calls.

use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use super::crud;
use super::planner;
use super::reviewer::{deterministic_review, ReviewDecision};
use super::state::{
    canonical_action, AgentState, DiffFingerprint, Phase, PlanStep, DIFF_RETRIES,
    NOOP_STREAK_MAX, REJECT_THRESHOLD,
};
use super::validator::validate_rule;
use crate::edit::approval::{ApprovalGate, ApprovalRequest};
use crate::edit::diff::{apply_blocks, parse_search_replace, PatchReason, SearchReplace};
use crate::git_safety;
use crate::index::chunks::assemble_context;
use crate::index::graph::SymbolGraph;
use crate::index::parser::{check_syntax, SyntaxCheck};
use crate::index::resolver::resolve_path;
use crate::index::Language;
use crate::oracle::{query_json, Oracle};
use crate::util::{hash_str, truncate, write_atomic};

/// Character budget for retrieved context in coder prompts.
const CODER_CONTEXT_BUDGET: usize = 3000;

const CODER_TOOLS: &[&str] = &[
    "find_file",
    "read_file",
    "semantic_search",
    "exact_search",
    "rewrite_function",
    "create_file",
    "insert_line",
    "append_file",
];
const REVIEWER_TOOLS: &[&str] = &["approve_step", "reject_step", "finish"];

/// Phase/tool permission check, enforced before dispatch.
pub fn tool_permitted(phase: Phase, tool: &str) -> bool {
    match phase {
        Phase::Coder => CODER_TOOLS.contains(&tool),
        Phase::Reviewer => REVIEWER_TOOLS.contains(&tool),
        _ => false,
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub phase: Phase,
    pub reason: String,
}

/// The reviewer's oracle judgement, decoded from untrusted JSON.
#[derive(Debug, Deserialize)]
struct Judgement {
    action: String,
    #[serde(default)]
    reason: String,
}

pub struct Orchestrator<'a> {
    oracle: &'a dyn Oracle,
    gate: &'a ApprovalGate,
    cancel: &'a AtomicBool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(oracle: &'a dyn Oracle, gate: &'a ApprovalGate, cancel: &'a AtomicBool) -> Self {
        Self {
            oracle,
            gate,
            cancel,
        }
    }

    /// Drive a goal from PLANNER to DONE or FAILED.
    pub fn run(&self, goal: &str, repo_root: &Path) -> Result<(AgentState, RunOutcome)> {
        let mut state = AgentState::new(goal, repo_root);
        state.git = git_safety::setup(repo_root);

        let graph = SymbolGraph::build(repo_root, true)?;

        // PLANNER: one oracle call, schema-validated.
        match planner::make_plan(self.oracle, goal, repo_root, &graph) {
            Ok(plan) => {
                tracing::info!("plan: {} step(s)", plan.steps.len());
                state.plan = plan;
                state.phase = Phase::Coder;
            }
            Err(err) => {
                state.phase = Phase::Failed;
                return self.settle(state, format!("plan: {}", err));
            }
        }

        let mut reason = String::new();
        while !matches!(state.phase, Phase::Done | Phase::Failed) {
            if self.cancel.load(Ordering::Relaxed) {
                state.phase = Phase::Failed;
                reason = "cancelled".to_string();
                break;
            }
            if state.budgets.steps_exhausted() {
                state.phase = Phase::Failed;
                reason = "step budget exhausted".to_string();
                break;
            }

            let step_reason = match state.phase {
                Phase::Coder => self.coder_step(&mut state, &graph),
                Phase::Reviewer => self.reviewer_step(&mut state),
                _ => unreachable!("planner and terminal phases never loop"),
            };
            if let Some(r) = step_reason {
                reason = r;
            }
        }

        if reason.is_empty() {
            reason = "goal satisfied".to_string();
        }
        self.settle(state, reason)
    }

    /// Commit on success, roll back on failure; both re-apply the stash.
    fn settle(&self, state: AgentState, mut reason: String) -> Result<(AgentState, RunOutcome)> {
        let files: Vec<String> = state.files_modified.iter().cloned().collect();
        match state.phase {
            Phase::Done => {
                if let Err(err) =
                    git_safety::commit_success(&state.repo_root, &state.git, &files, &state.goal)
                {
                    tracing::error!("{}", err);
                    reason = format!("{}; {}", reason, err);
                }
            }
            _ => {
                if let Err(err) = git_safety::rollback(&state.repo_root, &state.git, &files) {
                    // rollback_partial is fatal and loud.
                    tracing::error!("{}", err);
                    reason = format!("{}; {}", reason, err);
                }
            }
        }
        let outcome = RunOutcome {
            phase: state.phase,
            reason,
        };
        tracing::info!("run finished: {:?} ({})", outcome.phase, outcome.reason);
        Ok((state, outcome))
    }

    // ── CODER ────────────────────────────────────────────────────────────────

    fn coder_step(&self, state: &mut AgentState, graph: &SymbolGraph) -> Option<String> {
        state.budgets.step_count += 1;

        let Some(step) = state.plan.step().cloned() else {
            state.phase = Phase::Done;
            return Some("plan complete".to_string());
        };

        if step.is_question {
            return self.answer_question(state, &step);
        }

        // 1. Resolve the target (tiered; unresolved paths may be created).
        let declared = match declared_target(&step, &state.goal) {
            Some(path) => path,
            None => {
                state.history.observe("path_unresolved", &step.description);
                return self.reject_step_internally(state, "path_unresolved");
            }
        };
        let (resolved, found) = resolve_path(&declared, &state.repo_root, Some(graph));
        if !found {
            // CODER decides to create the file.
            state.history.observe("path_unresolved", &format!("{} (will create)", resolved));
        }

        // 2. Read current content from disk, never from the cache. The
        //    containment check runs even for files about to be created.
        let abs = match crate::util::resolve_repo_path(&state.repo_root, Path::new(&resolved)) {
            Ok(repo_path) => repo_path.absolute,
            Err(err) => {
                state.history.observe("path_unresolved", &err);
                return self.reject_step_internally(state, "path_unresolved");
            }
        };
        let original = fs::read(&abs)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        state
            .context
            .files
            .insert(resolved.clone(), original.clone());
        state.files_read.insert(resolved.clone());

        // 3. SEARCH/REPLACE via CRUD fast path, or the oracle.
        let language = Language::from_path(Path::new(&resolved));
        let fast = crud::fast_path(&state.goal, &original, language)
            .or_else(|| crud::fast_path(&step.description, &original, language));
        let (mut blocks, summary, deterministic) = match fast {
            Some(edit) => (edit.blocks, edit.summary, true),
            None => {
                let blocks =
                    match self.request_blocks(state, graph, &step, &resolved, &original, None) {
                        Ok(blocks) => blocks,
                        Err(err) => {
                            state.phase = Phase::Failed;
                            return Some(format!("oracle_unavailable: {}", err));
                        }
                    };
                (blocks, step.description.clone(), false)
            }
        };

        // 4. Apply; re-prompt with the full file on no_match/ambiguous.
        let mut attempt = 0u32;
        let (candidate, outcome) = loop {
            if blocks.is_empty() {
                break (None, PatchReason::NoMatch);
            }
            let (patched, outcome) = apply_blocks(&original, &blocks);
            match outcome {
                PatchReason::NoMatch | PatchReason::Ambiguous
                    if !deterministic && attempt < DIFF_RETRIES =>
                {
                    state.history.observe(outcome.label(), &resolved);
                    attempt += 1;
                    blocks = match self.request_blocks(
                        state,
                        graph,
                        &step,
                        &resolved,
                        &original,
                        Some(outcome),
                    ) {
                        Ok(blocks) => blocks,
                        Err(err) => {
                            state.phase = Phase::Failed;
                            return Some(format!("oracle_unavailable: {}", err));
                        }
                    };
                }
                _ => break (patched, outcome),
            }
        };

        // Loop detection on the canonical outgoing action.
        let canonical = canonical_action(
            "rewrite_function",
            &serde_json::json!({
                "file": resolved,
                "blocks": blocks
                    .iter()
                    .map(|b| format!("{}=>{}", b.search, b.replace))
                    .collect::<Vec<_>>(),
            }),
        );
        if state.history.record_action(canonical) {
            state.budgets.loop_breaks += 1;
            tracing::warn!("loop_detected: forcing phase handoff");
            state.history.clear_observations();
            state.history.clear_actions();
            if state.budgets.loop_breaks > 1 {
                state.phase = Phase::Failed;
                return Some("loop".to_string());
            }
            state.phase = Phase::Reviewer;
            return None;
        }

        match outcome {
            PatchReason::NoMatch | PatchReason::Ambiguous => {
                state.history.observe(outcome.label(), &resolved);
                None
            }
            PatchReason::Noop => {
                state.budgets.no_op_streak += 1;
                state.history.observe("noop", &resolved);
                if state.budgets.no_op_streak > NOOP_STREAK_MAX {
                    tracing::warn!("noop_streak: forcing phase handoff");
                    state.phase = Phase::Reviewer;
                }
                None
            }
            PatchReason::Ok | PatchReason::Appended => {
                state.budgets.no_op_streak = 0;
                let candidate = candidate.expect("successful patch carries content");
                self.approve_and_write(
                    state,
                    &step,
                    &resolved,
                    &abs,
                    &original,
                    candidate,
                    &blocks,
                    &summary,
                    deterministic,
                    language,
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn approve_and_write(
        &self,
        state: &mut AgentState,
        _step: &PlanStep,
        resolved: &str,
        abs: &Path,
        original: &str,
        candidate: String,
        blocks: &[SearchReplace],
        summary: &str,
        deterministic: bool,
        language: Language,
    ) -> Option<String> {
        // 5. Post-patch syntax check; a broken candidate never reaches the gate.
        if let SyntaxCheck::Error { line, .. } = check_syntax(&candidate, language) {
            state
                .history
                .observe("syntax_reject", &format!("{}:{}", resolved, line));
            return None;
        }

        // 6. The approval gate.
        let request = ApprovalRequest {
            action: "rewrite_function".to_string(),
            file: resolved.to_string(),
            search: blocks
                .iter()
                .map(|b| b.search.as_str())
                .collect::<Vec<_>>()
                .join("\n...\n"),
            replace: blocks
                .iter()
                .map(|b| b.replace.as_str())
                .collect::<Vec<_>>()
                .join("\n...\n"),
            summary: summary.to_string(),
        };
        match self.gate.ask(request, self.cancel) {
            crate::edit::approval::ApprovalOutcome::Approved => {
                // Acceptance is recorded before the disk mutation.
                state
                    .history
                    .observe("approval", &format!("accepted {}", resolved));

                if let Err(err) = write_atomic(abs, &candidate) {
                    state.history.observe("write_error", &err.to_string());
                    return None;
                }
                state.diff_memory.insert(
                    resolved.to_string(),
                    DiffFingerprint {
                        pre_hash: hash_str(original),
                        post_hash: hash_str(&candidate),
                    },
                );
                state.files_modified.insert(resolved.to_string());
                state.last_edit_deterministic = deterministic;
                state.history.observe("write", resolved);
                save_last_diff(&state.repo_root, resolved, blocks);

                state.phase = Phase::Reviewer;
                None
            }
            crate::edit::approval::ApprovalOutcome::Rejected { reason } => {
                state.history.observe("approval_rejected", &reason);
                None
            }
        }
    }

    fn answer_question(&self, state: &mut AgentState, step: &PlanStep) -> Option<String> {
        let prompt = format!(
            "Goal: {}\n\nAnswer this question about the repository, briefly:\n{}",
            state.goal, step.description
        );
        match self.oracle.call(&prompt, false) {
            Ok(answer) => {
                state.history.observe("question", &truncate(&answer, 400));
                state.plan.advance();
                if state.plan.finished() {
                    state.phase = Phase::Done;
                    return Some("plan complete".to_string());
                }
                None
            }
            Err(err) => {
                state.phase = Phase::Failed;
                Some(format!("oracle_unavailable: {}", err))
            }
        }
    }

    /// A step-level rejection driven by deterministic rules (unresolvable
    /// target, repeated validator failures). Bounded by REJECT_THRESHOLD.
    fn reject_step_internally(&self, state: &mut AgentState, label: &str) -> Option<String> {
        let count = state.budgets.reject(state.plan.current);
        if count >= REJECT_THRESHOLD {
            state.phase = Phase::Failed;
            return Some("unachievable".to_string());
        }
        state.history.observe("reject", label);
        None
    }

    fn request_blocks(
        &self,
        state: &AgentState,
        graph: &SymbolGraph,
        step: &PlanStep,
        resolved: &str,
        original: &str,
        failure: Option<PatchReason>,
    ) -> Result<Vec<SearchReplace>> {
        let context = assemble_context(&step.description, &state.repo_root, graph, CODER_CONTEXT_BUDGET);
        let failure_note = match failure {
            Some(reason) => format!(
                "\nYour previous SEARCH block failed with `{}`. The file content below is \
                 authoritative and complete; copy the lines you want to change exactly.\n",
                reason.label()
            ),
            None => String::new(),
        };
        // The file content is never truncated: a stale or partial view is
        // exactly what produces unmatchable SEARCH blocks.
        let prompt = format!(
            r#"Goal: {goal}
Current step: {step}
Target file: {file}
{failure_note}
Relevant repository context:
{context}

Full current content of {file}:
```
{original}
```

Emit the edit as one or more blocks, nothing else:
<<<<<<< SEARCH
...exact lines from the file...
=======
...replacement lines...
>>>>>>> REPLACE

A blank SEARCH section appends the REPLACE text to the file."#,
            goal = state.goal,
            step = step.description,
            file = resolved,
            failure_note = failure_note,
            context = context,
            original = original,
        );
        let response = self.oracle.call(&prompt, false)?;
        Ok(parse_search_replace(&response))
    }

    // ── REVIEWER ─────────────────────────────────────────────────────────────

    fn reviewer_step(&self, state: &mut AgentState) -> Option<String> {
        state.budgets.step_count += 1;

        let files = match deterministic_review(state) {
            ReviewDecision::Reject { reason } => {
                state.history.observe("reject", &reason);
                let count = state.budgets.reject(state.plan.current);
                if count >= REJECT_THRESHOLD {
                    state.phase = Phase::Failed;
                    return Some("unachievable".to_string());
                }
                state.phase = Phase::Coder;
                return None;
            }
            ReviewDecision::AskOracle { files } => files,
        };

        let Some(step) = state.plan.step().cloned() else {
            state.phase = Phase::Done;
            return Some("plan complete".to_string());
        };

        // Deterministic validator before any oracle judgement.
        let file = files.last().cloned().unwrap_or_default();
        let before = state.context.files.get(&file).cloned().unwrap_or_default();
        let after = fs::read(state.repo_root.join(&file))
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();

        if !validate_rule(&step.rule, &before, &after) {
            state
                .history
                .observe("reject", &format!("validator failed for {}", file));
            let count = state.budgets.reject(state.plan.current);
            if count >= REJECT_THRESHOLD {
                state.phase = Phase::Failed;
                return Some("unachievable".to_string());
            }
            state.phase = Phase::Coder;
            return None;
        }

        // CRUD fast-path edits that pass their validator settle without
        // consulting the oracle.
        if state.last_edit_deterministic {
            state.history.observe("approve_step", "deterministic");
            return self.advance_plan(state);
        }

        let prompt = format!(
            r#"Goal: {goal}
Step under review: {step}
File {file} now contains:
```
{after}
```

Does this change satisfy the step? Reply with JSON only:
{{"action": "approve_step" | "reject_step" | "finish", "reason": "..."}}
`finish` means the whole goal is satisfied, not just this step."#,
            goal = state.goal,
            step = step.description,
            file = file,
            after = after,
        );

        let judgement: Judgement = match query_json(self.oracle, &prompt) {
            Ok(j) => j,
            Err(err) => {
                state.phase = Phase::Failed;
                return Some(format!("oracle_unavailable: {}", err));
            }
        };

        // Tool permissioning: the reviewer may only approve, reject, finish.
        if !tool_permitted(Phase::Reviewer, &judgement.action) {
            state.history.observe(
                "tool_forbidden",
                &format!("{} not permitted in reviewer", judgement.action),
            );
            let terminal = self.reject_step_internally(state, "tool_forbidden");
            if terminal.is_none() {
                state.phase = Phase::Coder;
            }
            return terminal;
        }

        match judgement.action.as_str() {
            "approve_step" => {
                state.history.observe("approve_step", &judgement.reason);
                self.advance_plan(state)
            }
            "finish" => {
                state.history.observe("finish", &judgement.reason);
                state.phase = Phase::Done;
                Some("goal satisfied".to_string())
            }
            _ => {
                state.history.observe("reject_step", &judgement.reason);
                let count = state.budgets.reject(state.plan.current);
                if count >= REJECT_THRESHOLD {
                    state.phase = Phase::Failed;
                    return Some("unachievable".to_string());
                }
                state.phase = Phase::Coder;
                None
            }
        }
    }

    fn advance_plan(&self, state: &mut AgentState) -> Option<String> {
        state.plan.advance();
        if state.plan.finished() {
            state.phase = Phase::Done;
            Some("goal satisfied".to_string())
        } else {
            state.phase = Phase::Coder;
            None
        }
    }
}

/// The step's declared target, or a path-like token from its description or
/// the goal.
fn declared_target(step: &PlanStep, goal: &str) -> Option<String> {
    if let Some(path) = &step.target_file {
        return Some(path.clone());
    }
    path_token(&step.description).or_else(|| path_token(goal))
}

fn path_token(text: &str) -> Option<String> {
    let re = regex::Regex::new(r"[\w\-/]+\.\w+").expect("static regex");
    re.find(text).map(|m| m.as_str().to_string())
}

/// Render `.operon/last_diff.json` as a human-readable report.
///
/// Returns `None` when no diff has been recorded or the payload is
/// unreadable; callers print the report verbatim after a finished run.
pub fn render_last_diff(repo_root: &Path) -> Option<String> {
    let path = repo_root.join(".operon").join("last_diff.json");
    let content = fs::read_to_string(path).ok()?;
    let payload: serde_json::Value = serde_json::from_str(&content).ok()?;

    let file = payload.get("file")?.as_str()?;
    let ts = payload
        .get("ts")
        .and_then(|v| v.as_str())
        .unwrap_or("(unknown time)");

    let mut lines = vec![
        "OPERON DIFF REPORT".to_string(),
        "=".repeat(70),
        String::new(),
        format!("FILE: {}", file),
        "-".repeat(70),
    ];
    let blocks = payload.get("blocks").and_then(|b| b.as_array())?;
    for block in blocks {
        let search = block.get("search").and_then(|v| v.as_str()).unwrap_or("");
        let replace = block.get("replace").and_then(|v| v.as_str()).unwrap_or("");
        lines.push(String::new());
        lines.push(format!("PATCH @ {}", ts));
        lines.push("-".repeat(30));
        if search.is_empty() {
            lines.push("APPEND:".to_string());
            lines.push(replace.to_string());
        } else {
            lines.push("SEARCH:".to_string());
            lines.push(search.to_string());
            lines.push("REPLACE:".to_string());
            lines.push(replace.to_string());
        }
    }
    Some(lines.join("\n"))
}

/// Persist the last applied diff payload for user-visible reporting.
fn save_last_diff(repo_root: &Path, file: &str, blocks: &[SearchReplace]) {
    let payload = serde_json::json!({
        "file": file,
        "blocks": blocks
            .iter()
            .map(|b| serde_json::json!({"search": b.search, "replace": b.replace}))
            .collect::<Vec<_>>(),
        "ts": chrono::Utc::now(),
    });
    let path = repo_root.join(".operon").join("last_diff.json");
    if let Ok(content) = serde_json::to_string_pretty(&payload) {
        if let Err(err) = write_atomic(&path, &content) {
            tracing::debug!("last_diff.json not written: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::MAX_STEPS;
    use crate::oracle::testing::ScriptedOracle;
    use std::fs;
    use std::sync::atomic::AtomicBool;

    fn run_goal(
        goal: &str,
        responses: Vec<&str>,
        files: &[(&str, &str)],
    ) -> (tempfile::TempDir, AgentState, RunOutcome, usize) {
        let tmp = tempfile::tempdir().unwrap();
        for (name, content) in files {
            fs::write(tmp.path().join(name), content).unwrap();
        }
        let oracle = ScriptedOracle::new(responses);
        let gate = ApprovalGate::headless(true);
        let cancel = AtomicBool::new(false);
        let orchestrator = Orchestrator::new(&oracle, &gate, &cancel);
        let (state, outcome) = orchestrator.run(goal, tmp.path()).unwrap();
        let calls = oracle.calls.borrow().len();
        (tmp, state, outcome, calls)
    }

    #[test]
    fn test_tool_permissions() {
        assert!(tool_permitted(Phase::Coder, "read_file"));
        assert!(tool_permitted(Phase::Coder, "rewrite_function"));
        assert!(!tool_permitted(Phase::Coder, "approve_step"));
        assert!(tool_permitted(Phase::Reviewer, "approve_step"));
        assert!(!tool_permitted(Phase::Reviewer, "read_file"));
        assert!(!tool_permitted(Phase::Done, "read_file"));
    }

    #[test]
    fn test_crud_delete_reaches_done_without_edit_oracle_calls() {
        let plan = r#"[{"description": "delete lines 3-5", "file": "x.py",
                        "validator": {"rule": "delete_lines", "start": 3, "end": 5}}]"#;
        let (tmp, state, outcome, calls) = run_goal(
            "delete lines 3-5 in x.py",
            vec![plan],
            &[("x.py", "l1\nl2\nl3\nl4\nl5\nl6\n")],
        );

        assert_eq!(outcome.phase, Phase::Done);
        let content = fs::read_to_string(tmp.path().join("x.py")).unwrap();
        assert_eq!(content.lines().count(), 3);
        // Only the planner consulted the oracle.
        assert_eq!(calls, 1);
        assert!(state.files_modified.contains("x.py"));
        assert!(state.diff_memory.contains_key("x.py"));
    }

    #[test]
    fn test_last_diff_report_renders_after_run() {
        let plan = r#"[{"description": "delete lines 3-5", "file": "x.py",
                        "validator": {"rule": "delete_lines", "start": 3, "end": 5}}]"#;
        let (tmp, _state, outcome, _) = run_goal(
            "delete lines 3-5 in x.py",
            vec![plan],
            &[("x.py", "l1\nl2\nl3\nl4\nl5\nl6\n")],
        );
        assert_eq!(outcome.phase, Phase::Done);

        let report = render_last_diff(tmp.path()).expect("a diff was applied");
        assert!(report.contains("OPERON DIFF REPORT"));
        assert!(report.contains("FILE: x.py"));
        assert!(report.contains("PATCH @ "));
        assert!(report.contains("SEARCH:"));
        assert!(report.contains("l3"));
    }

    #[test]
    fn test_render_last_diff_none_without_payload() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(render_last_diff(tmp.path()).is_none());
    }

    #[test]
    fn test_approval_precedes_every_write() {
        let plan = r#"[{"description": "add the import", "file": "app.py",
                        "validator": {"rule": "add_import", "name": "json"}}]"#;
        let (_tmp, state, outcome, _) = run_goal(
            "add import json to app.py",
            vec![plan],
            &[("app.py", "def f():\n    pass\n")],
        );

        assert_eq!(outcome.phase, Phase::Done);
        let labels: Vec<(String, String)> = state
            .history
            .observations()
            .map(|o| (o.label.clone(), o.detail.clone()))
            .collect();
        let approval_at = labels
            .iter()
            .position(|(l, d)| l == "approval" && d.contains("accepted"))
            .expect("approval record present");
        let write_at = labels
            .iter()
            .position(|(l, _)| l == "write")
            .expect("write record present");
        assert!(approval_at < write_at);
    }

    #[test]
    fn test_loop_breaker_then_failed_loop() {
        let plan = r#"[{"description": "rework the handler", "file": "x.py",
                        "validator": {"rule": "nontrivial_diff"}}]"#;
        // The oracle forever emits a SEARCH block that matches nothing.
        let bad_block = "<<<<<<< SEARCH\nzzz_never_there\n=======\nreplacement\n>>>>>>> REPLACE";
        let (_tmp, state, outcome, _) = run_goal(
            "rework the handler in x.py",
            vec![plan, bad_block],
            &[("x.py", "def handler():\n    return 1\n")],
        );

        assert_eq!(outcome.phase, Phase::Failed);
        assert_eq!(outcome.reason, "loop");
        assert!(state.budgets.loop_breaks >= 2);
        assert!(state.budgets.step_count <= MAX_STEPS);
    }

    #[test]
    fn test_reviewer_reject_threshold_is_unachievable() {
        let plan = r#"[{"description": "toggle the flag", "file": "x.py",
                        "validator": {"rule": "nontrivial_diff"}}]"#;
        let to_two = "<<<<<<< SEARCH\nx = 1\n=======\nx = 2\n>>>>>>> REPLACE";
        let to_one = "<<<<<<< SEARCH\nx = 2\n=======\nx = 1\n>>>>>>> REPLACE";
        let reject = r#"{"action": "reject_step", "reason": "not what I wanted"}"#;
        let (_tmp, _state, outcome, _) = run_goal(
            "toggle the flag in x.py",
            vec![plan, to_two, reject, to_one, reject, to_two, reject],
            &[("x.py", "x = 1\n")],
        );

        assert_eq!(outcome.phase, Phase::Failed);
        assert_eq!(outcome.reason, "unachievable");
    }

    #[test]
    fn test_forbidden_reviewer_tool_is_rejected() {
        let plan = r#"[{"description": "toggle the flag", "file": "x.py",
                        "validator": {"rule": "nontrivial_diff"}}]"#;
        let to_two = "<<<<<<< SEARCH\nx = 1\n=======\nx = 2\n>>>>>>> REPLACE";
        let to_one = "<<<<<<< SEARCH\nx = 2\n=======\nx = 1\n>>>>>>> REPLACE";
        // The reviewer tries to call a coder tool.
        let forbidden = r#"{"action": "read_file", "reason": "let me check"}"#;
        let (_tmp, state, outcome, _) = run_goal(
            "toggle the flag in x.py",
            vec![plan, to_two, forbidden, to_one, forbidden, to_two, forbidden],
            &[("x.py", "x = 1\n")],
        );

        assert_eq!(outcome.phase, Phase::Failed);
        assert_eq!(outcome.reason, "unachievable");
        // The violation is visible somewhere in the current ring or was
        // pushed at least once during the run.
        let saw_forbidden = state
            .history
            .observations()
            .any(|o| o.label == "tool_forbidden");
        assert!(saw_forbidden);
    }

    #[test]
    fn test_noop_streak_forces_handoff() {
        let plan = r#"[{"description": "improve x.py", "file": "x.py",
                        "validator": {"rule": "nontrivial_diff"}}]"#;
        // Three distinct self-identical rewrites: no-ops, but never the same
        // canonical action, so the no-op breaker fires before the loop one.
        let noop1 = "<<<<<<< SEARCH\na = 1\n=======\na = 1\n>>>>>>> REPLACE";
        let noop2 = "<<<<<<< SEARCH\nb = 2\n=======\nb = 2\n>>>>>>> REPLACE";
        let noop3 = "<<<<<<< SEARCH\nc = 3\n=======\nc = 3\n>>>>>>> REPLACE";
        let (_tmp, state, outcome, _) = run_goal(
            "improve x.py",
            vec![plan, noop1, noop2, noop3, noop1, noop2, noop3, noop1, noop2, noop3],
            &[("x.py", "a = 1\nb = 2\nc = 3\n")],
        );

        // The run cannot succeed (nothing ever changes); what matters is
        // that the no-op breaker forced handoffs and the machine halted
        // inside its budgets.
        assert_eq!(outcome.phase, Phase::Failed);
        assert!(state.budgets.no_op_streak >= 3 || outcome.reason == "unachievable");
        assert!(state.budgets.step_count <= MAX_STEPS);
    }

    #[test]
    fn test_terminates_within_step_budget_on_adversarial_oracle() {
        let plan = r#"[{"description": "rework things", "file": "x.py",
                        "validator": {"rule": "nontrivial_diff"}}]"#;
        // Alternating unmatchable blocks defeat the loop detector but must
        // still exhaust the step budget.
        let (_tmp, state, outcome, _) = run_goal(
            "keep poking at x.py",
            vec![
                plan,
                "<<<<<<< SEARCH\nnever_a\n=======\nr\n>>>>>>> REPLACE",
                "<<<<<<< SEARCH\nnever_b\n=======\nr\n>>>>>>> REPLACE",
            ],
            &[("x.py", "x = 1\n")],
        );
        assert_eq!(outcome.phase, Phase::Failed);
        assert!(state.budgets.step_count <= MAX_STEPS);
    }

    #[test]
    fn test_syntax_reject_discards_candidate() {
        let plan = r#"[{"description": "edit the function", "file": "x.py",
                        "validator": {"rule": "nontrivial_diff"}}]"#;
        // The rewrite would produce broken Python.
        let broken = "<<<<<<< SEARCH\ndef f():\n    return 1\n=======\ndef f(:\n    return 2\n>>>>>>> REPLACE";
        let (tmp, state, outcome, _) = run_goal(
            "edit the function in x.py",
            vec![plan, broken],
            &[("x.py", "def f():\n    return 1\n")],
        );

        // Candidate never reached disk.
        let content = fs::read_to_string(tmp.path().join("x.py")).unwrap();
        assert_eq!(content, "def f():\n    return 1\n");
        assert!(state.files_modified.is_empty());
        assert_eq!(outcome.phase, Phase::Failed);
    }
}
