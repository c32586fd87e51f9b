//! The planner phase.
//!
//! One oracle call turns (goal + repo summary + retrieved context) into an
//! ordered list of atomic write milestones. Planner output is untrusted:
//! it is decoded against a strict schema before CODER is allowed to start,
//! and a malformed plan fails the run.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use super::state::{PlanState, PlanStep, ValidatorRule};
use super::validator::classify_goal;
use crate::index::chunks::assemble_context;
use crate::index::graph::SymbolGraph;
use crate::oracle::{query_json, Oracle};

/// Bounds for the repo summary that goes into the planner prompt.
const SUMMARY_MAX_FILES: usize = 20;
const SUMMARY_MAX_BYTES: usize = 2000;
/// Character budget for retrieved context in the planner prompt.
const CONTEXT_BUDGET: usize = 3000;
/// A plan longer than this is not "atomic write milestones" any more.
const MAX_PLAN_STEPS: usize = 12;

/// Short repo summary: file list with small previews, bounded so the prompt
/// stays inside modest context windows.
pub fn build_repo_summary(repo_root: &Path) -> String {
    let mut entries = Vec::new();
    for rel in crate::index::list_all_files(repo_root)
        .into_iter()
        .take(SUMMARY_MAX_FILES)
    {
        let preview = fs::read(repo_root.join(&rel))
            .map(|bytes| {
                let text = String::from_utf8_lossy(&bytes);
                crate::util::truncate(&text, SUMMARY_MAX_BYTES)
            })
            .unwrap_or_else(|_| "<unreadable>".to_string());
        entries.push(format!(
            "FILE: {}\nPREVIEW:\n{}\n---",
            rel.to_string_lossy().replace('\\', "/"),
            preview
        ));
    }
    entries.join("\n")
}

/// Wire shape of one planner step. Everything optional except the
/// description; gaps are filled deterministically.
#[derive(Debug, Deserialize)]
struct RawStep {
    description: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    validator: Option<ValidatorRule>,
    #[serde(default)]
    is_question: bool,
}

fn plan_prompt(goal: &str, repo_summary: &str, context: &str) -> String {
    format!(
        r#"Goal:
{goal}

Repository summary (file list with short previews):
{repo_summary}

{context}

Produce a short ordered plan of atomic write milestones for this goal.
Return a JSON array only. Each element:
  {{
    "description": "what this step changes, one sentence",
    "file": "relative/path.py",
    "validator": {{"rule": "delete_lines", "start": 3, "end": 5}}
                 | {{"rule": "add_import", "name": "json"}}
                 | {{"rule": "update_assignment", "name": "X", "value": "5"}}
                 | {{"rule": "add_comment", "text": "..."}}
                 | {{"rule": "nontrivial_diff"}},
    "is_question": false
  }}
Keep it minimal: one step per file write. JSON only, no prose."#
    )
}

/// Ask the oracle for a plan and validate it into typed steps.
///
/// Errors here terminate the run with FAILED/plan.
pub fn make_plan(
    oracle: &dyn Oracle,
    goal: &str,
    repo_root: &Path,
    graph: &SymbolGraph,
) -> anyhow::Result<PlanState> {
    let repo_summary = build_repo_summary(repo_root);
    let context = assemble_context(goal, repo_root, graph, CONTEXT_BUDGET);
    let prompt = plan_prompt(goal, &repo_summary, &context);

    let raw: Vec<RawStep> =
        query_json(oracle, &prompt).context("plan: oracle output did not match schema")?;
    steps_from_raw(raw, goal)
}

fn steps_from_raw(raw: Vec<RawStep>, goal: &str) -> anyhow::Result<PlanState> {
    if raw.is_empty() {
        return Err(anyhow::anyhow!("plan: oracle produced no steps"));
    }
    if raw.len() > MAX_PLAN_STEPS {
        return Err(anyhow::anyhow!(
            "plan: {} steps exceeds the {}-step ceiling",
            raw.len(),
            MAX_PLAN_STEPS
        ));
    }

    let mut steps = Vec::new();
    for (i, step) in raw.into_iter().enumerate() {
        let description = step.description.trim().to_string();
        if description.is_empty() {
            return Err(anyhow::anyhow!("plan: step {} has an empty description", i));
        }
        let rule = step
            .validator
            .unwrap_or_else(|| classify_goal(&format!("{} {}", goal, description)));
        steps.push(PlanStep {
            description,
            target_file: step.file.filter(|f| !f.trim().is_empty()),
            rule,
            is_question: step.is_question,
        });
    }

    Ok(PlanState { steps, current: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::testing::ScriptedOracle;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("app.py"), "def f():\n    pass\n").unwrap();
        tmp
    }

    #[test]
    fn test_valid_plan_parses() {
        let tmp = fixture();
        let graph = SymbolGraph::build(tmp.path(), false).unwrap();
        let oracle = ScriptedOracle::new(vec![
            r#"[{"description": "add the json import", "file": "app.py",
                 "validator": {"rule": "add_import", "name": "json"}}]"#,
        ]);
        let plan = make_plan(&oracle, "add import json", tmp.path(), &graph).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].target_file.as_deref(), Some("app.py"));
        assert_eq!(
            plan.steps[0].rule,
            ValidatorRule::AddImport {
                name: "json".to_string()
            }
        );
    }

    #[test]
    fn test_missing_validator_is_derived_from_goal() {
        let tmp = fixture();
        let graph = SymbolGraph::build(tmp.path(), false).unwrap();
        let oracle = ScriptedOracle::new(vec![
            r#"[{"description": "do the deletion", "file": "app.py"}]"#,
        ]);
        let plan = make_plan(&oracle, "delete lines 3-5 in app.py", tmp.path(), &graph).unwrap();
        assert_eq!(
            plan.steps[0].rule,
            ValidatorRule::DeleteLines { start: 3, end: 5 }
        );
    }

    #[test]
    fn test_unknown_rule_variant_fails_the_plan() {
        let tmp = fixture();
        let graph = SymbolGraph::build(tmp.path(), false).unwrap();
        let oracle = ScriptedOracle::new(vec![
            r#"[{"description": "x", "validator": {"rule": "summon_demons"}}]"#,
        ]);
        assert!(make_plan(&oracle, "goal", tmp.path(), &graph).is_err());
    }

    #[test]
    fn test_empty_plan_fails() {
        let tmp = fixture();
        let graph = SymbolGraph::build(tmp.path(), false).unwrap();
        let oracle = ScriptedOracle::new(vec!["[]"]);
        assert!(make_plan(&oracle, "goal", tmp.path(), &graph).is_err());
    }

    #[test]
    fn test_repo_summary_lists_files() {
        let tmp = fixture();
        let summary = build_repo_summary(tmp.path());
        assert!(summary.contains("FILE: app.py"));
        assert!(summary.contains("def f():"));
    }
}
