//! Semantic chunked loading.
//!
//! Never load an entire file into a prompt: load the minimum set of
//! self-contained blocks relevant to the current query, ranked by token
//! overlap and assembled under a character budget.

use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use super::graph::SymbolGraph;
use super::parser::extract_file;
use super::{Language, SymbolKind};

/// Chars of chunk source that participate in scoring.
const SCORE_SOURCE_CHARS: usize = 400;
/// At most this many candidate files are chunked per query.
const CANDIDATE_FILE_CAP: usize = 20;
/// Context radius for non-primary languages.
const FALLBACK_CONTEXT_LINES: usize = 20;

/// A derived (never persisted) source block.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub file: String,
    pub symbol: String,
    pub kind: SymbolKind,
    pub start: usize,
    pub end: usize,
    pub source: String,
    pub docstring: String,
    pub score: f64,
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z][A-Za-z0-9_]*").expect("static regex"))
}

/// Split text into lowercase identifier tokens (len > 1).
pub fn tokenize(text: &str) -> Vec<String> {
    token_re()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| t.len() > 1)
        .collect()
}

/// Jaccard overlap of query tokens vs chunk tokens, with an exact
/// symbol-name boost.
fn score_chunk(chunk: &Chunk, query_tokens: &[String]) -> f64 {
    let head: String = chunk.source.chars().take(SCORE_SOURCE_CHARS).collect();
    let text = format!("{} {} {}", chunk.symbol, chunk.docstring, head);
    let chunk_tokens: HashSet<String> = tokenize(&text).into_iter().collect();
    if chunk_tokens.is_empty() {
        return 0.0;
    }
    let query_set: HashSet<&String> = query_tokens.iter().collect();
    let overlap = query_set
        .iter()
        .filter(|t| chunk_tokens.contains(t.as_str()))
        .count();
    let union = query_set.len() + chunk_tokens.len() - overlap;
    let exact_boost = if query_set.contains(&chunk.symbol.to_lowercase()) {
        3.0
    } else {
        0.0
    };
    overlap as f64 / union.max(1) as f64 + exact_boost
}

/// Extract the smallest self-contained block defining `symbol_name`.
///
/// Primary language: the symbol record's exact span (decorators included).
/// Others: ±20 lines of context around the first occurrence.
pub fn extract_chunk(source: &str, symbol_name: &str, language: Language) -> Option<String> {
    let lines: Vec<&str> = source.lines().collect();

    if language.is_primary() {
        let extraction = extract_file(source, language);
        if let Some(sym) = extraction.symbols.iter().find(|s| {
            s.name == symbol_name
                && matches!(s.kind, SymbolKind::Function | SymbolKind::Class)
        }) {
            let start = sym.start.saturating_sub(1);
            let end = sym.end.min(lines.len());
            return Some(lines[start..end].join("\n"));
        }
    }

    for (i, line) in lines.iter().enumerate() {
        if line.contains(symbol_name) {
            let start = i.saturating_sub(3);
            let end = (i + FALLBACK_CONTEXT_LINES).min(lines.len());
            return Some(lines[start..end].join("\n"));
        }
    }
    None
}

/// Load the block defining `symbol_name` from a repo file.
pub fn load_symbol_chunk(repo_root: &Path, rel_path: &str, symbol_name: &str) -> Option<String> {
    let source = fs::read(repo_root.join(rel_path))
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .ok()?;
    extract_chunk(&source, symbol_name, Language::from_path(Path::new(rel_path)))
}

/// One chunk per function/class/variable in a source buffer.
pub fn chunks_for_file(source: &str, rel_path: &str, language: Language) -> Vec<Chunk> {
    let extraction = extract_file(source, language);
    let lines: Vec<&str> = source.lines().collect();
    let mut chunks = Vec::new();

    for sym in &extraction.symbols {
        if !matches!(
            sym.kind,
            SymbolKind::Function | SymbolKind::Class | SymbolKind::Variable
        ) {
            continue;
        }
        let start = sym.start.saturating_sub(1);
        let end = if language.is_primary() {
            sym.end.min(lines.len())
        } else {
            (sym.start + FALLBACK_CONTEXT_LINES).min(lines.len())
        };
        if start >= end {
            continue;
        }
        chunks.push(Chunk {
            file: rel_path.to_string(),
            symbol: sym.name.clone(),
            kind: sym.kind,
            start: sym.start,
            end,
            source: lines[start..end].join("\n"),
            docstring: sym.docstring.clone().unwrap_or_default(),
            score: 0.0,
        });
    }
    chunks
}

/// Find and rank the most relevant chunks for a query across the repo,
/// fitting inside `max_chars`.
pub fn relevant_chunks(
    query: &str,
    repo_root: &Path,
    graph: &SymbolGraph,
    max_chars: usize,
) -> Vec<Chunk> {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return Vec::new();
    }

    // Candidate files from the cross-ref index first.
    let mut candidates: Vec<String> = Vec::new();
    let mut push_candidate = |file: &str, candidates: &mut Vec<String>| {
        if !candidates.iter().any(|c| c == file) {
            candidates.push(file.to_string());
        }
    };
    for tok in &query_tokens {
        for site in graph.query(tok).iter().take(5) {
            push_candidate(&site.file, &mut candidates);
        }
        for name in graph.search_by_prefix(tok) {
            for site in graph.query(&name).iter().take(2) {
                push_candidate(&site.file, &mut candidates);
            }
        }
    }

    // No graph hits: fall back to every tracked primary-language file.
    if candidates.is_empty() {
        for rel in super::list_code_files(repo_root) {
            if Language::from_path(&rel).is_primary() {
                candidates.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }

    let mut all_chunks = Vec::new();
    for rel in candidates.iter().take(CANDIDATE_FILE_CAP) {
        let Ok(bytes) = fs::read(repo_root.join(rel)) else {
            continue;
        };
        let source = String::from_utf8_lossy(&bytes);
        all_chunks.extend(chunks_for_file(&source, rel, Language::from_path(Path::new(rel))));
    }

    for chunk in &mut all_chunks {
        chunk.score = score_chunk(chunk, &query_tokens);
    }

    // Descending score; ties by kind priority, then smaller span, then path.
    all_chunks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.kind.priority().cmp(&b.kind.priority()))
            .then((a.end - a.start).cmp(&(b.end - b.start)))
            .then(a.file.cmp(&b.file))
    });

    // Greedy budget fill. A chunk never straddles the boundary: if it does
    // not fit whole, it is dropped and smaller ones may still land.
    let mut result = Vec::new();
    let mut total = 0usize;
    for chunk in all_chunks {
        if chunk.score <= 0.0 {
            break;
        }
        let size = chunk.source.len();
        if total + size > max_chars {
            continue;
        }
        total += size;
        result.push(chunk);
    }
    result
}

fn kind_label(kind: SymbolKind) -> &'static str {
    match kind {
        SymbolKind::Function => "function",
        SymbolKind::Class => "class",
        SymbolKind::Variable => "variable",
        SymbolKind::Import => "import",
        SymbolKind::Decorator => "decorator",
        SymbolKind::Comment => "comment",
        SymbolKind::Assignment => "assignment",
        SymbolKind::Annotation => "annotation",
    }
}

/// Build a compact context string for oracle prompts.
///
/// Each chunk is prefixed by a locator header
/// `<path>:<start>-<end> (<kind> <name>)`; a trailing section lists the
/// dependency edges (imports) of the files that contributed chunks.
pub fn assemble_context(
    query: &str,
    repo_root: &Path,
    graph: &SymbolGraph,
    max_chars: usize,
) -> String {
    let chunks = relevant_chunks(query, repo_root, graph, max_chars);
    if chunks.is_empty() {
        return String::new();
    }

    let mut parts = Vec::new();
    for chunk in &chunks {
        parts.push(format!(
            "{}:{}-{} ({} {})",
            chunk.file,
            chunk.start,
            chunk.end,
            kind_label(chunk.kind),
            chunk.symbol
        ));
        parts.push(chunk.source.clone());
    }

    let mut files: Vec<&str> = chunks.iter().map(|c| c.file.as_str()).collect();
    files.sort();
    files.dedup();
    for file in files {
        let Some(record) = graph.symbols_in_file(file) else {
            continue;
        };
        let imports: Vec<&str> = record
            .symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Import)
            .map(|s| s.name.as_str())
            .take(8)
            .collect();
        if !imports.is_empty() {
            parts.push(format!("{} imports: {}", file, imports.join(", ")));
        }
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::graph::SymbolGraph;
    use std::fs;

    const CORE: &str = r#"RETRY_LIMIT = 3

def fetch_records(url):
    """Download records from the API."""
    return url

def unrelated_helper():
    return 0
"#;

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("core.py"), CORE).unwrap();
        fs::write(
            tmp.path().join("other.py"),
            "def decode_frame(data):\n    return data\n",
        )
        .unwrap();
        tmp
    }

    #[test]
    fn test_extract_chunk_primary_span() {
        let chunk = extract_chunk(CORE, "fetch_records", Language::Python).unwrap();
        assert!(chunk.starts_with("def fetch_records"));
        assert!(chunk.contains("Download records"));
        assert!(!chunk.contains("unrelated_helper"));
    }

    #[test]
    fn test_extract_chunk_fallback_context() {
        let src = "function hello() {\n  return 1;\n}\n";
        let chunk = extract_chunk(src, "hello", Language::JavaScript).unwrap();
        assert!(chunk.contains("function hello"));
    }

    #[test]
    fn test_ranking_prefers_named_symbol() {
        let tmp = fixture();
        let graph = SymbolGraph::build(tmp.path(), false).unwrap();
        let chunks = relevant_chunks("fix fetch_records timeout", tmp.path(), &graph, 2000);
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].symbol, "fetch_records");
        assert!(chunks[0].score > 0.0);
    }

    #[test]
    fn test_budget_drops_whole_chunks() {
        let tmp = fixture();
        let graph = SymbolGraph::build(tmp.path(), false).unwrap();
        let chunks = relevant_chunks("fetch_records", tmp.path(), &graph, 10);
        let total: usize = chunks.iter().map(|c| c.source.len()).sum();
        assert!(total <= 10);
        for c in &chunks {
            assert!(c.source.len() <= 10, "chunk split across budget");
        }
    }

    #[test]
    fn test_assemble_context_locator_header() {
        let tmp = fixture();
        let graph = SymbolGraph::build(tmp.path(), false).unwrap();
        let context = assemble_context("fetch_records", tmp.path(), &graph, 2000);
        assert!(context.contains("core.py:3-5 (function fetch_records)"));
    }

    #[test]
    fn test_empty_query_yields_nothing() {
        let tmp = fixture();
        let graph = SymbolGraph::build(tmp.path(), false).unwrap();
        assert!(relevant_chunks("!!!", tmp.path(), &graph, 2000).is_empty());
    }
}
