//! Documentation tree emission.
//!
//! Generates a `docs/` tree from the symbol graph:
//!   docs/README.md          repo overview + per-file dependency edges
//!   docs/modules/<file>.md  per-module documentation
//!   docs/symbols.md         cross-repo symbol reference
//!
//! Oracle summaries are woven in when a configured oracle is supplied;
//! everything degrades to structural descriptions without one.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ast_ops::summarize_block;
use crate::index::graph::SymbolGraph;
use crate::index::{FileRecord, SymbolKind, UsageKind};
use crate::oracle::Oracle;

const DOCS_DIR: &str = "docs";
/// How much of a file the oracle sees when summarizing it.
const SUMMARY_SOURCE_CHARS: usize = 2000;

/// Emit the documentation tree. Returns the docs directory path.
pub fn generate_repo_docs(
    repo_root: &Path,
    graph: &SymbolGraph,
    oracle: Option<&dyn Oracle>,
) -> Result<PathBuf> {
    let docs_dir = repo_root.join(DOCS_DIR);
    fs::create_dir_all(docs_dir.join("modules")).context("create docs tree")?;

    write_doc(&docs_dir.join("README.md"), &readme(graph, oracle))?;
    write_doc(&docs_dir.join("symbols.md"), &symbol_reference(graph))?;

    for (rel, record) in &graph.files {
        let doc = module_doc(repo_root, rel, record, oracle);
        let file_name = format!("{}.md", rel.replace('/', "__"));
        write_doc(&docs_dir.join("modules").join(file_name), &doc)?;
    }

    Ok(docs_dir)
}

fn write_doc(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("write {}", path.display()))?;
    tracing::info!("generated {}", path.display());
    Ok(())
}

fn oracle_summary(oracle: Option<&dyn Oracle>, prompt: &str) -> Option<String> {
    let oracle = oracle?;
    match oracle.call(prompt, false) {
        Ok(text) => Some(text.trim().to_string()),
        Err(err) => {
            tracing::debug!("oracle summary skipped: {}", err);
            None
        }
    }
}

fn readme(graph: &SymbolGraph, oracle: Option<&dyn Oracle>) -> String {
    let stats = graph.stats();
    let mut out = String::new();
    out.push_str("# Repository documentation\n\n");
    out.push_str(&format!(
        "{} tracked files, {} symbols, {} cross-referenced names.\n\n",
        stats.file_count, stats.symbol_count, stats.cross_ref_count
    ));

    if let Some(summary) = oracle_summary(
        oracle,
        &format!(
            "Describe this repository in 3-4 sentences based on its file list. Plain text.\n\n{}",
            graph
                .files
                .keys()
                .take(40)
                .cloned()
                .collect::<Vec<_>>()
                .join("\n")
        ),
    ) {
        out.push_str(&summary);
        out.push_str("\n\n");
    }

    out.push_str("## Modules\n\n");
    out.push_str("| File | Contents | Imports |\n|---|---|---|\n");
    for (rel, record) in &graph.files {
        let imports: Vec<&str> = record
            .symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Import)
            .map(|s| s.name.as_str())
            .take(6)
            .collect();
        out.push_str(&format!(
            "| [{}](modules/{}.md) | {} | {} |\n",
            rel,
            rel.replace('/', "__"),
            record.summary_line(),
            imports.join(", ")
        ));
    }

    out
}

fn module_doc(
    repo_root: &Path,
    rel: &str,
    record: &FileRecord,
    oracle: Option<&dyn Oracle>,
) -> String {
    let source = fs::read(repo_root.join(rel))
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    let line_count = source.lines().count();

    let mut out = format!("# `{}`\n\n", rel);

    if let Some(summary) = oracle_summary(
        oracle,
        &format!(
            "Summarize what this file does in 2-3 sentences. Plain text only.\n\nFile: {}\n\n```\n{}\n```",
            rel,
            crate::util::truncate(&source, SUMMARY_SOURCE_CHARS)
        ),
    ) {
        out.push_str(&format!("{}\n\n", summary));
    }

    let functions: Vec<_> = record
        .symbols
        .iter()
        .filter(|s| s.kind == SymbolKind::Function)
        .collect();
    let classes: Vec<_> = record
        .symbols
        .iter()
        .filter(|s| s.kind == SymbolKind::Class)
        .collect();
    let imports: Vec<_> = record
        .symbols
        .iter()
        .filter(|s| s.kind == SymbolKind::Import)
        .collect();

    out.push_str("## Stats\n\n");
    out.push_str("| Metric | Count |\n|---|---|\n");
    out.push_str(&format!("| Lines | {} |\n", line_count));
    out.push_str(&format!("| Functions | {} |\n", functions.len()));
    out.push_str(&format!("| Classes | {} |\n", classes.len()));
    out.push_str(&format!("| Imports | {} |\n\n", imports.len()));

    if !classes.is_empty() {
        out.push_str("## Classes\n\n");
        for class in &classes {
            out.push_str(&format!("### `{}` (L{}-{})\n\n", class.name, class.start, class.end));
            if let Some(doc) = &class.docstring {
                out.push_str(&format!("> {}\n\n", doc));
            }
        }
    }

    if !functions.is_empty() {
        out.push_str("## Functions\n\n");
        for func in &functions {
            let params = func
                .signature
                .as_ref()
                .map(|p| p.join(", "))
                .unwrap_or_default();
            let qualified = match &func.parent {
                Some(parent) => format!("{}.{}", parent, func.name),
                None => func.name.clone(),
            };
            out.push_str(&format!(
                "### `{}{}({})` (L{}-{})\n\n",
                if func.is_async { "async " } else { "" },
                qualified,
                params,
                func.start,
                func.end
            ));
            if let Some(doc) = &func.docstring {
                out.push_str(&format!("> {}\n\n", doc));
            } else if !source.is_empty() {
                out.push_str(&format!(
                    "{}\n\n",
                    summarize_block(&source, func.start, func.end)
                ));
            }
        }
    }

    out
}

fn symbol_reference(graph: &SymbolGraph) -> String {
    let mut out = String::new();
    out.push_str("# Symbol reference\n\n");
    out.push_str("Definitions across the repository, with usage counts.\n\n");
    out.push_str("| Symbol | Defined in | Uses |\n|---|---|---|\n");

    for (name, sites) in &graph.cross_refs {
        let defs: Vec<String> = sites
            .iter()
            .filter(|s| s.kind == UsageKind::Definition)
            .map(|s| format!("{}:{}", s.file, s.line))
            .collect();
        if defs.is_empty() {
            continue;
        }
        let uses = sites
            .iter()
            .filter(|s| s.kind != UsageKind::Definition)
            .count();
        out.push_str(&format!("| `{}` | {} | {} |\n", name, defs.join(", "), uses));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_docs_tree_without_oracle() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("core.py"),
            "import json\n\ndef fetch(url):\n    \"\"\"Fetch a URL.\"\"\"\n    return json.loads(url)\n",
        )
        .unwrap();
        let graph = SymbolGraph::build(tmp.path(), false).unwrap();

        let docs_dir = generate_repo_docs(tmp.path(), &graph, None).unwrap();
        assert!(docs_dir.join("README.md").exists());
        assert!(docs_dir.join("symbols.md").exists());

        let module = fs::read_to_string(docs_dir.join("modules").join("core.py.md")).unwrap();
        assert!(module.contains("# `core.py`"));
        assert!(module.contains("fetch(url)"));
        assert!(module.contains("Fetch a URL."));

        let symbols = fs::read_to_string(docs_dir.join("symbols.md")).unwrap();
        assert!(symbols.contains("`fetch`"));
        assert!(symbols.contains("core.py:3"));
    }
}
