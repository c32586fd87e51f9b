//! Repo-wide symbol operations.
//!
//! Rename, usage scanning, and signature migration. Python edits are
//! token-accurate (tree-sitter identifier spans); other languages fall back
//! to word-boundary regex. All mutating operations default to dry-run and
//! only write when asked.

use anyhow::Result;
use regex::Regex;
use std::fs;
use std::path::Path;
use tree_sitter::{Node, Parser};

use crate::index::graph::SymbolGraph;
use crate::index::parser::extract_file;
use crate::index::{list_code_files, Language, SymbolKind, UsageKind};

/// One planned text replacement.
#[derive(Debug, Clone)]
pub struct Edit {
    pub file: String,
    pub line: usize,
    pub col_start: usize,
    pub col_end: usize,
    pub old_text: String,
    pub new_text: String,
    pub context: String,
}

#[derive(Debug, Default)]
pub struct RenameResult {
    pub old_name: String,
    pub new_name: String,
    pub edits: Vec<Edit>,
    pub errors: Vec<String>,
    pub applied: bool,
}

impl RenameResult {
    pub fn files_affected(&self) -> Vec<&str> {
        let mut files: Vec<&str> = self.edits.iter().map(|e| e.file.as_str()).collect();
        files.sort();
        files.dedup();
        files
    }
}

#[derive(Debug, Clone)]
pub struct UsageEntry {
    pub file: String,
    pub line: usize,
    pub kind: UsageKind,
    pub context: String,
}

#[derive(Debug, Default)]
pub struct MigrateResult {
    pub func_name: String,
    pub call_sites: Vec<Edit>,
    pub errors: Vec<String>,
    pub applied: bool,
}

fn read_lossy(path: &Path) -> String {
    fs::read(path)
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}

fn parse_python_tree(source: &str) -> Option<tree_sitter::Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .ok()?;
    parser.parse(source, None)
}

// ── rename ───────────────────────────────────────────────────────────────────

/// Collect identifier spans equal to `old_name` in a Python buffer.
fn python_identifier_spans(source: &str, old_name: &str) -> Vec<(usize, usize, usize)> {
    let Some(tree) = parse_python_tree(source) else {
        return Vec::new();
    };
    let mut spans = Vec::new();
    let mut stack = vec![tree.root_node()];
    let mut cursor = tree.root_node().walk();
    while let Some(node) = stack.pop() {
        if node.kind() == "identifier" && &source[node.byte_range()] == old_name {
            let pos = node.start_position();
            spans.push((pos.row + 1, pos.column, node.end_position().column));
        }
        for child in node.children(&mut cursor).collect::<Vec<_>>() {
            stack.push(child);
        }
    }
    spans
}

fn rename_in_python(source: &str, old_name: &str, new_name: &str) -> (String, Vec<Edit>) {
    let spans = python_identifier_spans(source, old_name);
    if spans.is_empty() {
        return (source.to_string(), Vec::new());
    }

    let mut lines: Vec<String> = source.split('\n').map(String::from).collect();
    let mut edits = Vec::new();

    // Group by line, apply right-to-left so columns stay valid.
    let mut by_line: std::collections::BTreeMap<usize, Vec<(usize, usize)>> = Default::default();
    for (line, start, end) in spans {
        by_line.entry(line).or_default().push((start, end));
    }
    for (line_no, mut cols) in by_line {
        cols.sort_by_key(|(start, _)| std::cmp::Reverse(*start));
        let idx = line_no - 1;
        if idx >= lines.len() {
            continue;
        }
        let context = lines[idx].trim_end().chars().take(120).collect::<String>();
        for (start, end) in cols {
            if end > lines[idx].len() {
                continue;
            }
            edits.push(Edit {
                file: String::new(),
                line: line_no,
                col_start: start,
                col_end: end,
                old_text: old_name.to_string(),
                new_text: new_name.to_string(),
                context: context.clone(),
            });
            lines[idx].replace_range(start..end, new_name);
        }
    }

    (lines.join("\n"), edits)
}

/// Word-boundary rename for non-Python files. Only whole-word matches.
fn rename_generic(source: &str, old_name: &str, new_name: &str) -> (String, Vec<Edit>) {
    let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(old_name))).expect("escaped");
    let mut edits = Vec::new();
    let mut out_lines = Vec::new();

    for (i, line) in source.split('\n').enumerate() {
        let mut new_line = line.to_string();
        let matches: Vec<(usize, usize)> = pattern
            .find_iter(line)
            .map(|m| (m.start(), m.end()))
            .collect();
        for (start, end) in matches.iter().rev() {
            edits.push(Edit {
                file: String::new(),
                line: i + 1,
                col_start: *start,
                col_end: *end,
                old_text: old_name.to_string(),
                new_text: new_name.to_string(),
                context: line.trim_end().chars().take(120).collect(),
            });
            new_line.replace_range(*start..*end, new_name);
        }
        out_lines.push(new_line);
    }

    (out_lines.join("\n"), edits)
}

/// Rename `old_name` to `new_name` across the repository.
pub fn rename_symbol(
    repo_root: &Path,
    old_name: &str,
    new_name: &str,
    dry_run: bool,
) -> RenameResult {
    let mut result = RenameResult {
        old_name: old_name.to_string(),
        new_name: new_name.to_string(),
        ..Default::default()
    };

    for rel in list_code_files(repo_root) {
        let abs = repo_root.join(&rel);
        let source = read_lossy(&abs);
        if source.is_empty() || !source.contains(old_name) {
            continue;
        }
        let rel_str = rel.to_string_lossy().replace('\\', "/");

        let (new_source, mut edits) = if Language::from_path(&rel).is_primary() {
            rename_in_python(&source, old_name, new_name)
        } else {
            rename_generic(&source, old_name, new_name)
        };
        if edits.is_empty() {
            continue;
        }
        for edit in &mut edits {
            edit.file = rel_str.clone();
        }
        result.edits.extend(edits);

        if !dry_run {
            if let Err(err) = fs::write(&abs, new_source) {
                result.errors.push(format!("{}: {}", rel_str, err));
            }
        }
    }

    if !dry_run && result.errors.is_empty() {
        result.applied = true;
    }
    tracing::info!(
        "rename {} -> {}: {} edit(s) across {} file(s){}",
        old_name,
        new_name,
        result.edits.len(),
        result.files_affected().len(),
        if dry_run { " [dry run]" } else { " [applied]" }
    );
    result
}

// ── usages ───────────────────────────────────────────────────────────────────

/// Every occurrence of `symbol` across the repository.
///
/// Uses the pre-built cross-ref index when a graph is supplied; otherwise
/// scans fresh.
pub fn find_all_usages(
    repo_root: &Path,
    symbol: &str,
    graph: Option<&SymbolGraph>,
) -> Vec<UsageEntry> {
    let mut entries = Vec::new();

    if let Some(graph) = graph {
        let sites = graph.query(symbol);
        if !sites.is_empty() {
            for site in sites {
                let source = read_lossy(&repo_root.join(&site.file));
                let context = source
                    .lines()
                    .nth(site.line.saturating_sub(1))
                    .unwrap_or("")
                    .trim()
                    .chars()
                    .take(120)
                    .collect();
                entries.push(UsageEntry {
                    file: site.file.clone(),
                    line: site.line,
                    kind: site.kind,
                    context,
                });
            }
            return entries;
        }
    }

    // Full scan fallback.
    for rel in list_code_files(repo_root) {
        let source = read_lossy(&repo_root.join(&rel));
        if source.is_empty() || !source.contains(symbol) {
            continue;
        }
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        let lines: Vec<&str> = source.lines().collect();
        let extraction = extract_file(&source, Language::from_path(&rel));
        for occ in extraction.usages {
            if occ.name != symbol {
                continue;
            }
            let context = lines
                .get(occ.line.saturating_sub(1))
                .unwrap_or(&"")
                .trim()
                .chars()
                .take(120)
                .collect();
            entries.push(UsageEntry {
                file: rel_str.clone(),
                line: occ.line,
                kind: occ.kind,
                context,
            });
        }
    }
    entries
}

// ── signature migration ──────────────────────────────────────────────────────

/// Parse `"a, b=None, *args"` into (name, default) pairs.
fn parse_new_params(params: &[String]) -> Vec<(String, Option<String>)> {
    params
        .iter()
        .map(|p| {
            let p = p.trim();
            match p.split_once('=') {
                Some((name, default)) => (
                    name.trim().trim_start_matches('*').to_string(),
                    Some(default.trim().to_string()),
                ),
                None => (p.trim_start_matches('*').to_string(), None),
            }
        })
        .collect()
}

fn definition_params(repo_root: &Path, func_name: &str) -> Option<Vec<String>> {
    for rel in list_code_files(repo_root) {
        if !Language::from_path(&rel).is_primary() {
            continue;
        }
        let source = read_lossy(&repo_root.join(&rel));
        if !source.contains(func_name) {
            continue;
        }
        let extraction = extract_file(&source, Language::Python);
        if let Some(sym) = extraction
            .symbols
            .iter()
            .find(|s| s.kind == SymbolKind::Function && s.name == func_name)
        {
            return sym.signature.clone().map(|params| {
                params
                    .into_iter()
                    .map(|p| p.trim_start_matches('*').to_string())
                    .collect()
            });
        }
    }
    None
}

/// Rewrite call sites of `func_name` to match `new_params`.
///
/// Handles the common cases: added parameter with a default (auto-inserted),
/// removed parameter (positional arg dropped), reordering. Keyword arguments
/// are preserved verbatim. Multi-line calls are reported, not rewritten.
pub fn migrate_signature(
    repo_root: &Path,
    func_name: &str,
    new_params: &[String],
    dry_run: bool,
) -> MigrateResult {
    let mut result = MigrateResult {
        func_name: func_name.to_string(),
        ..Default::default()
    };

    let Some(old_names) = definition_params(repo_root, func_name) else {
        result
            .errors
            .push(format!("could not find definition of '{}'", func_name));
        return result;
    };
    let new_spec = parse_new_params(new_params);
    tracing::info!(
        "migrate_signature: {}({}) -> ({})",
        func_name,
        old_names.join(", "),
        new_spec
            .iter()
            .map(|(n, _)| n.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    for rel in list_code_files(repo_root) {
        if !Language::from_path(&rel).is_primary() {
            continue;
        }
        let abs = repo_root.join(&rel);
        let source = read_lossy(&abs);
        if !source.contains(func_name) {
            continue;
        }
        let rel_str = rel.to_string_lossy().replace('\\', "/");

        let Some(tree) = parse_python_tree(&source) else {
            continue;
        };
        let mut lines: Vec<String> = source.split('\n').map(String::from).collect();
        let mut local_edits: Vec<Edit> = Vec::new();

        let mut stack = vec![tree.root_node()];
        let mut cursor = tree.root_node().walk();
        while let Some(node) = stack.pop() {
            for child in node.children(&mut cursor).collect::<Vec<_>>() {
                stack.push(child);
            }
            if node.kind() != "call" {
                continue;
            }
            if call_name(&node, &source).as_deref() != Some(func_name) {
                continue;
            }
            if node.start_position().row != node.end_position().row {
                result.errors.push(format!(
                    "{}:{}: multi-line call left unchanged",
                    rel_str,
                    node.start_position().row + 1
                ));
                continue;
            }

            let (positional, keywords) = call_arguments(&node, &source);
            let new_args = rebuild_arguments(&old_names, &new_spec, &positional);
            let mut all_args = new_args;
            all_args.extend(keywords);

            let old_call = source[node.byte_range()].to_string();
            let open = match old_call.find('(') {
                Some(i) => i,
                None => continue,
            };
            let new_call = format!("{}({})", &old_call[..open], all_args.join(", "));
            if new_call == old_call {
                continue;
            }

            let row = node.start_position().row;
            let context = lines[row].trim_end().chars().take(120).collect();
            local_edits.push(Edit {
                file: rel_str.clone(),
                line: row + 1,
                col_start: node.start_position().column,
                col_end: node.end_position().column,
                old_text: old_call.clone(),
                new_text: new_call.clone(),
                context,
            });
            lines[row] = lines[row].replacen(&old_call, &new_call, 1);
        }

        if local_edits.is_empty() {
            continue;
        }
        result.call_sites.extend(local_edits);

        if !dry_run {
            if let Err(err) = fs::write(&abs, lines.join("\n")) {
                result.errors.push(format!("{}: {}", rel_str, err));
            }
        }
    }

    if !dry_run && result.errors.is_empty() {
        result.applied = true;
    }
    result
}

fn call_name(node: &Node, source: &str) -> Option<String> {
    let func = node.child_by_field_name("function")?;
    match func.kind() {
        "identifier" => Some(source[func.byte_range()].to_string()),
        "attribute" => func
            .child_by_field_name("attribute")
            .map(|attr| source[attr.byte_range()].to_string()),
        _ => None,
    }
}

fn call_arguments(node: &Node, source: &str) -> (Vec<String>, Vec<String>) {
    let mut positional = Vec::new();
    let mut keywords = Vec::new();
    let Some(args) = node.child_by_field_name("arguments") else {
        return (positional, keywords);
    };
    let mut cursor = args.walk();
    for child in args.named_children(&mut cursor).collect::<Vec<_>>() {
        let text = source[child.byte_range()].to_string();
        if child.kind() == "keyword_argument" {
            keywords.push(text);
        } else if child.kind() != "comment" {
            positional.push(text);
        }
    }
    (positional, keywords)
}

fn rebuild_arguments(
    old_names: &[String],
    new_spec: &[(String, Option<String>)],
    positional: &[String],
) -> Vec<String> {
    let mut args = Vec::new();
    for (name, default) in new_spec {
        if name == "self" {
            continue;
        }
        let old_pos = old_names.iter().position(|n| n == name);
        match old_pos {
            Some(pos) => {
                // `self` occupies slot 0 in method definitions but not at
                // call sites.
                let call_pos = if old_names.first().map(String::as_str) == Some("self") {
                    pos.checked_sub(1)
                } else {
                    Some(pos)
                };
                match call_pos.and_then(|p| positional.get(p)) {
                    Some(arg) => args.push(arg.clone()),
                    None => args.push(default.clone().unwrap_or_else(|| "None".to_string())),
                }
            }
            None => args.push(default.clone().unwrap_or_else(|| "None".to_string())),
        }
    }
    args
}

// ── block summaries ──────────────────────────────────────────────────────────

/// Structural one-line description of a code block, used when no oracle is
/// configured.
pub fn summarize_block(content: &str, start_line: usize, end_line: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if start_line == 0 || start_line > lines.len() {
        return String::new();
    }
    let end = end_line.min(lines.len());
    let block = &lines[start_line - 1..end];
    let count = block.len();
    let first = block.first().map(|l| l.trim()).unwrap_or("");

    if first.starts_with("def ") || first.starts_with("async def ") {
        if let Some(cap) = Regex::new(r"(?:async\s+)?def\s+(\w+)\s*\(([^)]*)\)")
            .expect("static regex")
            .captures(first)
        {
            return format!(
                "Function '{}' taking ({}), {} lines",
                &cap[1], &cap[2], count
            );
        }
    }
    if let Some(name) = first.strip_prefix("class ") {
        let name = name.split(|c| c == ':' || c == '(').next().unwrap_or(name);
        return format!("Class '{}', {} lines", name.trim(), count);
    }
    if first.starts_with("for ") || first.starts_with("while ") {
        return format!("Loop block, {} lines", count);
    }
    if first.starts_with("if ") {
        return format!("Conditional block, {} lines", count);
    }
    format!(
        "Code block, {} lines starting with: {}",
        count,
        crate::util::truncate(first, 60)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("core.py"),
            "def fetch(url, timeout):\n    return url\n\nresult = fetch('x', 5)\n",
        )
        .unwrap();
        fs::write(
            tmp.path().join("callers.py"),
            "from core import fetch\n\nvalue = fetch('y', 10)\nfetcher = 1\n",
        )
        .unwrap();
        tmp
    }

    #[test]
    fn test_rename_python_is_token_accurate() {
        let tmp = fixture();
        let result = rename_symbol(tmp.path(), "fetch", "download", false);
        assert!(result.applied);

        let core = fs::read_to_string(tmp.path().join("core.py")).unwrap();
        assert!(core.contains("def download(url, timeout):"));
        assert!(core.contains("download('x', 5)"));

        let callers = fs::read_to_string(tmp.path().join("callers.py")).unwrap();
        assert!(callers.contains("import download"));
        assert!(callers.contains("download('y', 10)"));
        // `fetcher` is a different token and must survive.
        assert!(callers.contains("fetcher = 1"));
    }

    #[test]
    fn test_rename_dry_run_leaves_disk_alone() {
        let tmp = fixture();
        let before = fs::read_to_string(tmp.path().join("core.py")).unwrap();
        let result = rename_symbol(tmp.path(), "fetch", "download", true);
        assert!(!result.applied);
        assert!(!result.edits.is_empty());
        assert_eq!(fs::read_to_string(tmp.path().join("core.py")).unwrap(), before);
    }

    #[test]
    fn test_find_all_usages_without_graph() {
        let tmp = fixture();
        let usages = find_all_usages(tmp.path(), "fetch", None);
        assert!(usages.iter().any(|u| u.kind == UsageKind::Definition));
        assert!(usages
            .iter()
            .any(|u| u.kind == UsageKind::Call && u.file == "callers.py"));
    }

    #[test]
    fn test_migrate_signature_reorders_and_defaults() {
        let tmp = fixture();
        let result = migrate_signature(
            tmp.path(),
            "fetch",
            &[
                "timeout".to_string(),
                "url".to_string(),
                "retries=3".to_string(),
            ],
            false,
        );
        assert!(result.applied, "errors: {:?}", result.errors);
        assert_eq!(result.call_sites.len(), 2);

        let core = fs::read_to_string(tmp.path().join("core.py")).unwrap();
        assert!(core.contains("fetch(5, 'x', 3)"));
        let callers = fs::read_to_string(tmp.path().join("callers.py")).unwrap();
        assert!(callers.contains("fetch(10, 'y', 3)"));
    }

    #[test]
    fn test_migrate_signature_missing_function_errors() {
        let tmp = fixture();
        let result = migrate_signature(tmp.path(), "nope", &["a".to_string()], true);
        assert!(!result.errors.is_empty());
        assert!(result.call_sites.is_empty());
    }

    #[test]
    fn test_summarize_block_structural() {
        let content = "def fetch(url, timeout):\n    return url\n";
        let summary = summarize_block(content, 1, 2);
        assert!(summary.contains("Function 'fetch'"));
        assert!(summary.contains("url, timeout"));

        let class_summary = summarize_block("class Loader:\n    pass\n", 1, 2);
        assert!(class_summary.contains("Class 'Loader'"));
    }
}
