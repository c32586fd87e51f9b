//! The CRUD fast path.
//!
//! Structurally trivial goals (add an import, delete a line range, update a
//! constant, add a comment, wrap a line in a guard) do not need the oracle:
//! the SEARCH/REPLACE blocks can be constructed deterministically from the
//! goal and the current file content. Only when no pattern matches does the
//! coder fall through to the oracle.

use regex::Regex;
use std::sync::OnceLock;

use crate::edit::diff::SearchReplace;
use crate::index::Language;

/// A deterministic edit plus its one-line summary for the approval gate.
#[derive(Debug, Clone)]
pub struct FastPathEdit {
    pub blocks: Vec<SearchReplace>,
    pub summary: String,
}

fn add_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)add\s+import\s+([\w\.]+)").expect("static regex"))
}

fn delete_lines_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)delete\s+lines?\s+(\d+)\s*[-–]\s*(\d+)").expect("static regex")
    })
}

fn update_constant_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:update|set|change)\s+([A-Za-z_]\w*)\s*(?:=|to)\s*([^\s,]+)")
            .expect("static regex")
    })
}

fn add_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)add\s+(?:a\s+)?comment\s+['"]?([^'"]+?)['"]?\s*$"#)
            .expect("static regex")
    })
}

fn wrap_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)wrap\s+['"](.+)['"]\s+in\s+try"#).expect("static regex")
    })
}

/// Try to build the edit without consulting the oracle.
pub fn fast_path(goal: &str, content: &str, language: Language) -> Option<FastPathEdit> {
    if let Some(cap) = add_import_re().captures(goal) {
        return add_import(&cap[1], content);
    }
    if let Some(cap) = delete_lines_re().captures(goal) {
        let start: usize = cap[1].parse().ok()?;
        let end: usize = cap[2].parse().ok()?;
        return delete_lines(start, end, content);
    }
    if let Some(cap) = update_constant_re().captures(goal) {
        return update_constant(&cap[1], &cap[2], content);
    }
    if let Some(cap) = wrap_line_re().captures(goal) {
        return wrap_in_try(&cap[1], content, language);
    }
    if let Some(cap) = add_comment_re().captures(goal) {
        return add_comment(cap[1].trim(), language);
    }
    None
}

fn add_import(name: &str, content: &str) -> Option<FastPathEdit> {
    let line = format!("import {}", name);
    // Already imported: nothing deterministic to do.
    let already = content.lines().any(|l| {
        let t = l.trim();
        t == line || t.starts_with(&format!("import {} ", name)) || {
            t.starts_with("from ") && t.contains(&format!(" import {}", name))
        }
    });
    if already {
        return None;
    }
    Some(FastPathEdit {
        blocks: vec![SearchReplace {
            search: String::new(),
            replace: line.clone(),
        }],
        summary: format!("add `{}` at top of file", line),
    })
}

fn delete_lines(start: usize, end: usize, content: &str) -> Option<FastPathEdit> {
    let lines: Vec<&str> = content.lines().collect();
    if start == 0 || end < start || end > lines.len() {
        return None;
    }
    let search = lines[start - 1..end].join("\n");
    if search.trim().is_empty() {
        return None;
    }
    Some(FastPathEdit {
        blocks: vec![SearchReplace {
            search,
            replace: String::new(),
        }],
        summary: format!("delete lines {}-{}", start, end),
    })
}

fn update_constant(name: &str, value: &str, content: &str) -> Option<FastPathEdit> {
    let binding_re = Regex::new(&format!(r"^\s*{}\s*[:=]", regex::escape(name))).ok()?;
    let target = content.lines().find(|l| binding_re.is_match(l))?;
    let replacement = format!("{} = {}", name, value);
    if target.trim() == replacement {
        return None;
    }
    Some(FastPathEdit {
        blocks: vec![SearchReplace {
            search: target.to_string(),
            replace: replacement.clone(),
        }],
        summary: format!("update `{}`", replacement),
    })
}

fn add_comment(text: &str, language: Language) -> Option<FastPathEdit> {
    if text.is_empty() {
        return None;
    }
    let line = format!("{} {}", language.comment_prefix(), text);
    Some(FastPathEdit {
        blocks: vec![SearchReplace {
            search: String::new(),
            replace: line.clone(),
        }],
        summary: format!("append comment `{}`", line),
    })
}

fn wrap_in_try(target: &str, content: &str, language: Language) -> Option<FastPathEdit> {
    if !language.is_primary() {
        return None;
    }
    let hits: Vec<&str> = content
        .lines()
        .filter(|l| l.trim() == target.trim())
        .collect();
    // Only an unambiguous single site is safe to wrap deterministically.
    if hits.len() != 1 {
        return None;
    }
    let line = hits[0].trim();
    let replace = format!(
        "try:\n    {}\nexcept Exception:\n    pass",
        line
    );
    Some(FastPathEdit {
        blocks: vec![SearchReplace {
            search: line.to_string(),
            replace,
        }],
        summary: format!("wrap `{}` in try/except", line),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::diff::{apply_blocks, PatchReason};

    #[test]
    fn test_add_import_block() {
        let content = "def f():\n    pass\n";
        let edit = fast_path("add import json to app.py", content, Language::Python).unwrap();
        let (patched, reason) = apply_blocks(content, &edit.blocks);
        assert_eq!(reason, PatchReason::Appended);
        assert_eq!(patched.unwrap(), "import json\ndef f():\n    pass\n");
    }

    #[test]
    fn test_add_import_skips_when_present() {
        let content = "import json\n";
        assert!(fast_path("add import json", content, Language::Python).is_none());
    }

    #[test]
    fn test_delete_line_range_removes_exact_count() {
        let content = "l1\nl2\nl3\nl4\nl5\nl6\n";
        let edit = fast_path("delete lines 3-5 in x.py", content, Language::Python).unwrap();
        let (patched, reason) = apply_blocks(content, &edit.blocks);
        assert_eq!(reason, PatchReason::Ok);
        let patched = patched.unwrap();
        assert_eq!(patched.lines().count(), 3);
        assert!(!patched.contains("l4"));
    }

    #[test]
    fn test_delete_out_of_range_refused() {
        assert!(fast_path("delete lines 9-12", "a\nb\n", Language::Python).is_none());
    }

    #[test]
    fn test_update_constant_preserves_indent() {
        let content = "class C:\n    RETRY = 3\n";
        let edit = fast_path("update RETRY = 5", content, Language::Python).unwrap();
        let (patched, reason) = apply_blocks(content, &edit.blocks);
        assert_eq!(reason, PatchReason::Ok);
        assert_eq!(patched.unwrap(), "class C:\n    RETRY = 5\n");
    }

    #[test]
    fn test_add_comment_appends_with_prefix() {
        let content = "x = 1\n";
        let edit = fast_path("add comment 'checked manually'", content, Language::Python).unwrap();
        let (patched, _) = apply_blocks(content, &edit.blocks);
        assert!(patched.unwrap().contains("# checked manually"));

        let edit = fast_path("add comment reviewed", "let x = 1;\n", Language::Rust).unwrap();
        let (patched, _) = apply_blocks("let x = 1;\n", &edit.blocks);
        assert!(patched.unwrap().contains("// reviewed"));
    }

    #[test]
    fn test_wrap_line_in_try() {
        let content = "def f():\n    risky()\n";
        let edit = fast_path("wrap 'risky()' in try/except", content, Language::Python).unwrap();
        let (patched, reason) = apply_blocks(content, &edit.blocks);
        assert_eq!(reason, PatchReason::Ok);
        let patched = patched.unwrap();
        assert!(patched.contains("    try:"));
        assert!(patched.contains("        risky()"));
        assert!(patched.contains("    except Exception:"));
    }

    #[test]
    fn test_unmatched_goal_falls_through() {
        assert!(fast_path("refactor the session handling", "x = 1\n", Language::Python).is_none());
    }
}
