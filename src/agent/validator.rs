//! Deterministic post-edit validation.
//!
//! Given a goal and the before/after text of the edited file, decide
//! whether the edit structurally satisfies the goal. Rules are tried in
//! order; the first that classifies the goal decides. No oracle involved.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use super::state::ValidatorRule;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "in", "to", "from", "of", "for", "and", "or", "please", "file", "all",
    "with", "into", "on",
];

fn delete_lines_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"delete\s+lines?\s+(\d+)\s*[-–]\s*(\d+)").expect("static regex")
    })
}

fn add_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"add\s+import\s+([\w\.]+)").expect("static regex"))
}

fn update_assign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:update|set|change)\s+([A-Za-z_]\w*)\s*(?:=|to)\s*([^\s,]+)")
            .expect("static regex")
    })
}

fn add_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"add\s+comment\s+['"]?([^'"]+)['"]?"#).expect("static regex")
    })
}

/// Lowercase the goal and drop stopwords before rule classification.
fn normalize_goal(goal: &str) -> String {
    goal.to_lowercase()
        .split_whitespace()
        .filter(|w| !STOPWORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Classify a goal into the validator rule that will judge its edit.
pub fn classify_goal(goal: &str) -> ValidatorRule {
    let normalized = normalize_goal(goal);

    if let Some(cap) = delete_lines_re().captures(&normalized) {
        let start: usize = cap[1].parse().unwrap_or(0);
        let end: usize = cap[2].parse().unwrap_or(0);
        if start > 0 && end >= start {
            return ValidatorRule::DeleteLines { start, end };
        }
    }
    if let Some(cap) = add_import_re().captures(&normalized) {
        return ValidatorRule::AddImport {
            name: cap[1].to_string(),
        };
    }
    if let Some(cap) = update_assign_re().captures(&normalized) {
        return ValidatorRule::UpdateAssignment {
            name: cap[1].to_string(),
            value: cap[2].to_string(),
        };
    }
    if let Some(cap) = add_comment_re().captures(&normalized) {
        return ValidatorRule::AddComment {
            text: cap[1].trim().to_string(),
        };
    }
    ValidatorRule::NontrivialDiff
}

/// Rule 0, fixed: an edit that changed nothing never validates.
/// Then the rule-specific structural check.
pub fn validate_rule(rule: &ValidatorRule, before: &str, after: &str) -> bool {
    if before == after {
        return false;
    }

    match rule {
        ValidatorRule::DeleteLines { start, end } => {
            let expected = end - start + 1;
            let before_count = before.lines().count();
            let after_count = after.lines().count();
            before_count.saturating_sub(after_count) == expected
        }
        ValidatorRule::AddImport { name } => {
            !token_present(before, name) && token_present(after, name)
        }
        ValidatorRule::UpdateAssignment { name, value } => assignment_bound(after, name, value),
        ValidatorRule::AddComment { text } => {
            let before_comments: HashSet<&str> = comment_lines(before).collect();
            comment_lines(after)
                .filter(|l| !before_comments.contains(l))
                .any(|l| l.to_lowercase().contains(&text.to_lowercase()))
        }
        ValidatorRule::NontrivialDiff => nontrivial_diff(before, after),
    }
}

/// Validate an edit against a goal: classify, then check.
pub fn validate(goal: &str, _file: &str, before: &str, after: &str) -> bool {
    validate_rule(&classify_goal(goal), before, after)
}

fn token_present(text: &str, token: &str) -> bool {
    let pattern = format!(r"\b{}\b", regex::escape(token));
    Regex::new(&pattern)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

/// `name` bound to `value` (exact text or equivalent unquoted literal).
fn assignment_bound(text: &str, name: &str, value: &str) -> bool {
    let stripped = value.trim_matches(|c| c == '"' || c == '\'');
    for line in text.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix(name) else {
            continue;
        };
        let rest = rest.trim_start();
        let Some(bound) = rest.strip_prefix('=') else {
            continue;
        };
        let bound = bound.trim().trim_end_matches([',', ';']);
        let bound_stripped = bound.trim_matches(|c| c == '"' || c == '\'');
        if bound == value || bound_stripped == stripped {
            return true;
        }
    }
    false
}

fn comment_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|l| {
        l.starts_with('#') || l.starts_with("//") || l.starts_with("/*") || l.starts_with('*')
    })
}

/// At least one non-whitespace line added or removed, ignoring lines made of
/// stopwords only.
fn nontrivial_diff(before: &str, after: &str) -> bool {
    let before_lines: HashSet<&str> = before.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let after_lines: HashSet<&str> = after.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    fn substantive(line: &str) -> bool {
        let words: Vec<&str> = line
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .collect();
        !words.is_empty()
            && !words
                .iter()
                .all(|w| STOPWORDS.contains(&w.to_lowercase().as_str()))
    }

    after_lines.difference(&before_lines).any(|l| substantive(l))
        || before_lines.difference(&after_lines).any(|l| substantive(l))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_text_never_validates() {
        assert!(!validate("add import json", "x.py", "a\n", "a\n"));
        assert!(!validate_rule(&ValidatorRule::NontrivialDiff, "a\n", "a\n"));
    }

    #[test]
    fn test_delete_lines_counts_removed() {
        let before = "l1\nl2\nl3\nl4\nl5\nl6\n";
        let after = "l1\nl2\nl6\n";
        assert!(validate("delete lines 3-5 in x.py", "x.py", before, after));
        // Wrong count fails.
        let after_short = "l1\nl2\nl5\nl6\n";
        assert!(!validate("delete lines 3-5 in x.py", "x.py", before, after_short));
    }

    #[test]
    fn test_add_import_requires_absent_then_present() {
        let before = "def f():\n    pass\n";
        let after = "import json\ndef f():\n    pass\n";
        assert!(validate("add import json", "x.py", before, after));
        // Already present before the edit: not satisfied.
        let with_extra = "import json\nimport os\ndef f():\n    pass\n";
        assert!(!validate("add import json", "x.py", after, with_extra));
    }

    #[test]
    fn test_update_assignment_binding() {
        let before = "RETRY = 3\n";
        let after = "RETRY = 5\n";
        assert!(validate("update RETRY = 5", "x.py", before, after));
        assert!(validate("set RETRY to 5", "x.py", before, after));
        // Bound to something else: fail.
        assert!(!validate("update RETRY = 9", "x.py", before, after));
    }

    #[test]
    fn test_update_assignment_quoted_equivalence() {
        let before = "MODE = 'dev'\n";
        let after = "MODE = 'prod'\n";
        assert!(validate_rule(
            &ValidatorRule::UpdateAssignment {
                name: "MODE".to_string(),
                value: "prod".to_string(),
            },
            before,
            after
        ));
    }

    #[test]
    fn test_add_comment_needs_new_comment_line() {
        let before = "x = 1\n";
        let after = "# handles retries\nx = 1\n";
        assert!(validate("add comment 'handles retries'", "x.py", before, after));
        // A non-comment line containing the text does not count.
        let sneaky = "handles_retries = 1\nx = 1\n";
        assert!(!validate("add comment 'handles retries'", "x.py", before, sneaky));
    }

    #[test]
    fn test_default_rule_rejects_whitespace_only() {
        let before = "x = 1\n";
        let after = "x = 1\n\n\n";
        assert!(!validate("tidy things up", "x.py", before, after));
        let real = "x = 1\ny = 2\n";
        assert!(validate("tidy things up", "x.py", before, real));
    }

    #[test]
    fn test_classification_order_first_match_decides() {
        // "delete lines" wins over the default even with extra words.
        assert_eq!(
            classify_goal("please delete lines 3-5 from the file config.py"),
            ValidatorRule::DeleteLines { start: 3, end: 5 }
        );
        assert_eq!(
            classify_goal("add import os"),
            ValidatorRule::AddImport {
                name: "os".to_string()
            }
        );
        assert_eq!(classify_goal("refactor the loop"), ValidatorRule::NontrivialDiff);
    }
}
