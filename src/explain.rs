//! Terminal explanation mode: the command bodies behind `operon explain`,
//! `usages`, `summarize` and `signature`.
//!
//! Each command returns a CLI exit code (see `exit_codes`); printing goes to
//! stdout, diagnostics to tracing.

use std::fs;
use std::path::Path;

use crate::ast_ops::{find_all_usages, migrate_signature, rename_symbol, summarize_block};
use crate::exit_codes;
use crate::index::chunks::extract_chunk;
use crate::index::graph::SymbolGraph;
use crate::index::{Language, SymbolKind, UsageKind};
use crate::oracle::Oracle;

const RULE: &str = "============================================================";

fn read_lossy(path: &Path) -> Option<String> {
    fs::read(path)
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .ok()
}

fn header(title: &str) {
    println!("\n{}", RULE);
    println!("  {}", title);
    println!("{}", RULE);
}

fn oracle_text(oracle: Option<&dyn Oracle>, prompt: &str) -> Option<String> {
    oracle.and_then(|o| o.call(prompt, false).ok())
}

// ── explain ──────────────────────────────────────────────────────────────────

/// `operon explain <symbol>` — definition, signature, docstring, callers.
pub fn explain_symbol(
    repo_root: &Path,
    symbol: &str,
    graph: &SymbolGraph,
    oracle: Option<&dyn Oracle>,
) -> i32 {
    let usages = find_all_usages(repo_root, symbol, Some(graph));
    let defs: Vec<_> = usages
        .iter()
        .filter(|u| u.kind == UsageKind::Definition)
        .collect();
    if usages.is_empty() {
        println!("Symbol '{}' not found in repository.", symbol);
        return exit_codes::MISS;
    }

    header(symbol);

    let mut chunk = String::new();
    if !defs.is_empty() {
        println!("\nDEFINITION{}:", if defs.len() > 1 { "S" } else { "" });
        for def in defs.iter().take(3) {
            println!("  {}:{}", def.file, def.line);
        }

        let first = defs[0];
        if let Some(source) = read_lossy(&repo_root.join(&first.file)) {
            if let Some(record) = graph.symbols_in_file(&first.file) {
                if let Some(sym) = record.symbols.iter().find(|s| s.name == symbol) {
                    if let Some(params) = &sym.signature {
                        println!("\nSIGNATURE:\n  {}({})", symbol, params.join(", "));
                    }
                    if let Some(doc) = &sym.docstring {
                        println!("\nDOCSTRING:\n  {}", doc);
                    }
                }
            }
            if let Some(text) =
                extract_chunk(&source, symbol, Language::from_path(Path::new(&first.file)))
            {
                chunk = text;
                println!("\nSOURCE PREVIEW:\n{}", crate::util::truncate(&chunk, 600));
            }
        }
    }

    let callers: Vec<_> = usages
        .iter()
        .filter(|u| matches!(u.kind, UsageKind::Call | UsageKind::Reference))
        .collect();
    if !callers.is_empty() {
        println!("\nCALLED / USED IN ({} shown):", callers.len().min(8));
        for site in callers.iter().take(8) {
            println!("  {}:{}  {}", site.file, site.line, site.context);
        }
    }

    if !chunk.is_empty() {
        if let Some(explanation) = oracle_text(
            oracle,
            &format!(
                "Explain what the symbol '{}' does in 2-3 sentences. Plain text.\n\n```\n{}\n```",
                symbol,
                crate::util::truncate(&chunk, 1000)
            ),
        ) {
            println!("\nEXPLANATION:\n  {}", explanation.trim());
        }
    }
    println!();
    exit_codes::OK
}

/// `operon explain <file>:<line>` — enclosing symbol and source.
pub fn explain_at_line(
    repo_root: &Path,
    file: &str,
    line: usize,
    graph: &SymbolGraph,
    oracle: Option<&dyn Oracle>,
) -> i32 {
    let Some(source) = read_lossy(&repo_root.join(file)) else {
        println!("Cannot read {}", file);
        return exit_codes::MISS;
    };
    let lines: Vec<&str> = source.lines().collect();
    if line == 0 || line > lines.len() {
        println!("{} has no line {}", file, line);
        return exit_codes::MISS;
    }

    header(&format!("{}:{}", file, line));

    // The enclosing symbol, if the graph knows one.
    if let Some(record) = graph.symbols_in_file(file) {
        let enclosing = record
            .symbols
            .iter()
            .filter(|s| {
                matches!(s.kind, SymbolKind::Function | SymbolKind::Class)
                    && s.start <= line
                    && line <= s.end
            })
            .min_by_key(|s| s.end - s.start);
        if let Some(sym) = enclosing {
            println!("\nENCLOSING: {} (L{}-{})", sym.name, sym.start, sym.end);
        }
    }

    let start = line.saturating_sub(5).max(1);
    let end = (line + 10).min(lines.len());
    println!();
    for i in start..=end {
        let marker = if i == line { "->" } else { "  " };
        println!("{} {:4} | {}", marker, i, lines[i - 1]);
    }

    if let Some(explanation) = oracle_text(
        oracle,
        &format!(
            "Explain what line {} does in this code, 2-3 sentences, plain text.\n\n```\n{}\n```",
            line,
            lines[start - 1..end].join("\n")
        ),
    ) {
        println!("\nEXPLANATION:\n  {}", explanation.trim());
    }
    println!();
    exit_codes::OK
}

/// `operon explain flow <func>` — direct callees reachable from a function.
pub fn explain_flow(
    repo_root: &Path,
    func: &str,
    graph: &SymbolGraph,
    oracle: Option<&dyn Oracle>,
) -> i32 {
    let Some(def_file) = graph.defining_file(func).map(String::from) else {
        println!("Function '{}' not found.", func);
        return exit_codes::MISS;
    };
    let Some(source) = read_lossy(&repo_root.join(&def_file)) else {
        println!("Cannot read {}", def_file);
        return exit_codes::MISS;
    };
    let Some(chunk) = extract_chunk(&source, func, Language::from_path(Path::new(&def_file)))
    else {
        println!("Function '{}' not found in {}.", func, def_file);
        return exit_codes::MISS;
    };

    header(&format!("Execution flow: {}", func));
    println!("  Defined in: {}", def_file);
    println!("\nFUNCTION SOURCE:\n{}", crate::util::truncate(&chunk, 800));

    // Direct callees: call sites inside the chunk.
    let extraction =
        crate::index::parser::extract_file(&chunk, Language::from_path(Path::new(&def_file)));
    let mut callees: Vec<String> = extraction
        .usages
        .iter()
        .filter(|u| u.kind == UsageKind::Call && u.name != func)
        .map(|u| u.name.clone())
        .collect();
    callees.sort();
    callees.dedup();
    if !callees.is_empty() {
        println!("\nCALLS: {}", callees.join(", "));
    }

    let callers = graph.find_usages(func);
    if !callers.is_empty() {
        println!("\nCALLED BY ({}):", callers.len());
        for site in callers.iter().take(8) {
            println!("  {}:{}", site.file, site.line);
        }
    }

    if let Some(analysis) = oracle_text(
        oracle,
        &format!(
            "Trace the execution flow of this function step by step. Plain text.\n\n```\n{}\n```",
            crate::util::truncate(&chunk, 1200)
        ),
    ) {
        println!("\nFLOW ANALYSIS:\n  {}", analysis.trim());
    }
    println!();
    exit_codes::OK
}

/// `operon explain file <path>` — whole-file inventory.
pub fn explain_file(
    repo_root: &Path,
    file: &str,
    graph: &SymbolGraph,
    oracle: Option<&dyn Oracle>,
) -> i32 {
    let Some(source) = read_lossy(&repo_root.join(file)) else {
        println!("Cannot read {}", file);
        return exit_codes::MISS;
    };

    header(file);
    println!("Lines:     {}", source.lines().count());

    if let Some(record) = graph.symbols_in_file(file) {
        let functions: Vec<&str> = record.functions().map(|s| s.name.as_str()).take(10).collect();
        let classes: Vec<&str> = record.classes().map(|s| s.name.as_str()).take(5).collect();
        println!(
            "Functions: {}",
            if functions.is_empty() {
                "(none)".to_string()
            } else {
                functions.join(", ")
            }
        );
        println!(
            "Classes:   {}",
            if classes.is_empty() {
                "(none)".to_string()
            } else {
                classes.join(", ")
            }
        );
    }

    if let Some(summary) = oracle_text(
        oracle,
        &format!(
            "Describe what this file does in 3-5 sentences. Plain text.\n\nFile: {}\n\n```\n{}\n```",
            file,
            crate::util::truncate(&source, 3000)
        ),
    ) {
        println!("\nSUMMARY:\n  {}", summary.trim());
    }
    println!();
    exit_codes::OK
}

// ── usages ───────────────────────────────────────────────────────────────────

pub fn cmd_usages(repo_root: &Path, symbol: &str, graph: &SymbolGraph) -> i32 {
    let usages = find_all_usages(repo_root, symbol, Some(graph));
    if usages.is_empty() {
        println!("No usages found for '{}'", symbol);
        return exit_codes::MISS;
    }

    let defs: Vec<_> = usages
        .iter()
        .filter(|u| u.kind == UsageKind::Definition)
        .collect();
    let calls: Vec<_> = usages.iter().filter(|u| u.kind == UsageKind::Call).collect();
    let refs: Vec<_> = usages
        .iter()
        .filter(|u| !matches!(u.kind, UsageKind::Definition | UsageKind::Call))
        .collect();

    header(&format!("Usages of '{}' ({} total)", symbol, usages.len()));
    if !defs.is_empty() {
        println!("\nDEFINITIONS ({}):", defs.len());
        for u in &defs {
            println!("  {}:{}  {}", u.file, u.line, u.context);
        }
    }
    if !calls.is_empty() {
        println!("\nCALL SITES ({}):", calls.len());
        for u in calls.iter().take(20) {
            println!("  {}:{}  {}", u.file, u.line, u.context);
        }
    }
    if !refs.is_empty() {
        println!("\nOTHER REFERENCES ({}):", refs.len());
        for u in refs.iter().take(10) {
            println!("  {}:{}  {}", u.file, u.line, u.context);
        }
    }
    println!();
    exit_codes::OK
}

// ── rename ───────────────────────────────────────────────────────────────────

pub fn cmd_rename(repo_root: &Path, old_name: &str, new_name: &str, apply: bool) -> i32 {
    let result = rename_symbol(repo_root, old_name, new_name, !apply);

    header(&format!("Rename: '{}' -> '{}'", old_name, new_name));
    println!(
        "  Mode: {}",
        if apply {
            "APPLIED"
        } else {
            "DRY RUN (pass --apply to write)"
        }
    );
    println!(
        "\n{} edit(s) across {} file(s):\n",
        result.edits.len(),
        result.files_affected().len()
    );
    for file in result.files_affected() {
        let edits: Vec<_> = result.edits.iter().filter(|e| e.file == file).collect();
        println!("  {}  ({} sites)", file, edits.len());
        for edit in edits.iter().take(5) {
            println!("    L{}: {}", edit.line, edit.context);
        }
    }

    if !result.errors.is_empty() {
        println!("\nERRORS:");
        for err in &result.errors {
            println!("  {}", err);
        }
        return exit_codes::APPLY_FAILED;
    }
    println!();
    exit_codes::OK
}

// ── summarize ────────────────────────────────────────────────────────────────

pub fn cmd_summarize(
    repo_root: &Path,
    file: &str,
    graph: &SymbolGraph,
    oracle: Option<&dyn Oracle>,
) -> i32 {
    let Some(source) = read_lossy(&repo_root.join(file)) else {
        println!("Cannot read {}", file);
        return exit_codes::MISS;
    };
    let Some(record) = graph.symbols_in_file(file) else {
        println!("{} is not in the symbol graph (run `operon index`).", file);
        return exit_codes::MISS;
    };

    header(&format!("Summaries: {}", file));

    for sym in &record.symbols {
        let (label, name) = match sym.kind {
            SymbolKind::Function => ("def", sym.name.clone()),
            SymbolKind::Class => ("class", sym.name.clone()),
            _ => continue,
        };
        let summary = match oracle_text(
            oracle,
            &format!(
                "Summarize this code block in 1-2 sentences. Plain text.\n\n```\n{}\n```",
                extract_chunk(&source, &sym.name, record.language).unwrap_or_default()
            ),
        ) {
            Some(text) => text.trim().to_string(),
            None => summarize_block(&source, sym.start, sym.end),
        };
        println!("\n  {} {} [L{}-{}]", label, name, sym.start, sym.end);
        println!("    -> {}", summary);
    }
    println!();
    exit_codes::OK
}

// ── signature ────────────────────────────────────────────────────────────────

pub fn cmd_signature(repo_root: &Path, func: &str, params: &str, apply: bool) -> i32 {
    let new_params: Vec<String> = params.split(',').map(|p| p.trim().to_string()).collect();
    let result = migrate_signature(repo_root, func, &new_params, !apply);

    header(&format!("Signature migration: {}({})", func, params));
    println!(
        "  Mode: {}",
        if apply {
            "APPLIED"
        } else {
            "DRY RUN (pass --apply to write)"
        }
    );

    if !result.errors.is_empty() {
        println!("\nERRORS:");
        for err in &result.errors {
            println!("  {}", err);
        }
        if result.call_sites.is_empty() {
            return exit_codes::APPLY_FAILED;
        }
    }

    println!("\n{} call site(s):\n", result.call_sites.len());
    for edit in result.call_sites.iter().take(20) {
        println!("  {}:{}", edit.file, edit.line);
        println!("    before: {}", crate::util::truncate(&edit.old_text, 80));
        println!("    after:  {}", crate::util::truncate(&edit.new_text, 80));
    }
    println!();
    if apply && !result.applied {
        exit_codes::APPLY_FAILED
    } else {
        exit_codes::OK
    }
}
