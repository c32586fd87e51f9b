//! The intelligence index: file walking, hashing, and the symbol data model.
//!
//! The walker enumerates tracked source files, content-hashes them, and
//! skips VCS and build-artifact directories. Everything downstream (graph,
//! chunks, resolver) is keyed by these repo-relative paths and hashes.

pub mod chunks;
pub mod graph;
pub mod parser;
pub mod resolver;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::util::hash_bytes;

/// Directories never walked into.
pub const IGNORE_DIRS: &[&str] = &[
    ".git",
    ".venv",
    "__pycache__",
    "node_modules",
    "dist",
    "build",
    "target",
    ".operon",
];

/// Upper bound on files considered source. Binary blobs and generated
/// bundles above this are skipped rather than hashed.
pub const MAX_INDEX_FILE_BYTES: u64 = 1_000_000;

/// Supported source languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Java,
    Rust,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "py" | "pyi" => Language::Python,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "java" => Language::Java,
            "rs" => Language::Rust,
            _ => Language::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        Self::from_extension(ext)
    }

    /// The primary language gets an authoritative syntax tree; the rest get
    /// regex fallbacks.
    pub fn is_primary(&self) -> bool {
        matches!(self, Language::Python)
    }

    /// The comment prefix used when synthesizing comment lines.
    pub fn comment_prefix(&self) -> &'static str {
        match self {
            Language::Python => "#",
            _ => "//",
        }
    }
}

/// Symbol variants carried by a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Class,
    Variable,
    Import,
    Decorator,
    Comment,
    Assignment,
    Annotation,
}

impl SymbolKind {
    /// Ranking priority used by the chunk loader's tie-break.
    pub fn priority(&self) -> u8 {
        match self {
            SymbolKind::Function => 0,
            SymbolKind::Class => 1,
            _ => 2,
        }
    }
}

/// One extracted symbol with a 1-based inclusive line span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub start: usize,
    pub end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_async: bool,
}

impl Symbol {
    pub fn span_lines(&self) -> usize {
        self.end.saturating_sub(self.start) + 1
    }
}

/// How a name occurs at a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Definition,
    Call,
    Reference,
    Attribute,
    Import,
}

/// One occurrence of a name inside a single file (file-local form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageOccurrence {
    pub name: String,
    pub line: usize,
    pub kind: UsageKind,
}

/// One occurrence of a name anywhere in the repo (cross-ref form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSite {
    pub file: String,
    pub line: usize,
    pub kind: UsageKind,
}

/// Everything the index knows about one tracked file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub hash: String,
    pub language: Language,
    pub modified: DateTime<Utc>,
    pub symbols: Vec<Symbol>,
    #[serde(default)]
    pub usages: Vec<UsageOccurrence>,
    /// Extractor fault marker. The file stays in the graph; the record says
    /// why its symbols may be incomplete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl FileRecord {
    pub fn functions(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Function)
    }

    pub fn classes(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().filter(|s| s.kind == SymbolKind::Class)
    }

    /// One-line human summary of what's in the file.
    pub fn summary_line(&self) -> String {
        let classes: Vec<&str> = self.classes().map(|s| s.name.as_str()).take(4).collect();
        let functions: Vec<&str> = self
            .functions()
            .filter(|s| s.parent.is_none())
            .map(|s| s.name.as_str())
            .take(8)
            .collect();
        let variables: Vec<&str> = self
            .symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Variable)
            .map(|s| s.name.as_str())
            .take(6)
            .collect();

        let mut parts = Vec::new();
        if !classes.is_empty() {
            parts.push(format!("classes: {}", classes.join(", ")));
        }
        if !functions.is_empty() {
            parts.push(format!("functions: {}", functions.join(", ")));
        }
        if !variables.is_empty() {
            parts.push(format!("vars: {}", variables.join(", ")));
        }
        if parts.is_empty() {
            "(empty)".to_string()
        } else {
            parts.join(" | ")
        }
    }
}

/// Check if a directory entry should be skipped.
pub fn is_ignored(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    IGNORE_DIRS.contains(&name) || (name.starts_with('.') && name.len() > 1)
}

/// Enumerate tracked source files, repo-relative and sorted.
pub fn list_code_files(repo_root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in WalkDir::new(repo_root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_ignored(e.path()))
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if Language::from_path(path) == Language::Unknown {
            continue;
        }
        if entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX) > MAX_INDEX_FILE_BYTES {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(repo_root) {
            out.push(rel.to_path_buf());
        }
    }
    out.sort();
    out
}

/// Enumerate every tracked file (any extension) for path resolution.
pub fn list_all_files(repo_root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in WalkDir::new(repo_root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_ignored(e.path()))
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(repo_root) {
            out.push(rel.to_path_buf());
        }
    }
    out.sort();
    out
}

/// Content-hash a file on disk. Empty string when unreadable.
pub fn hash_file(path: &Path) -> String {
    match fs::read(path) {
        Ok(bytes) => hash_bytes(&bytes),
        Err(_) => String::new(),
    }
}

/// Last-modified time of a file, defaulting to now.
pub fn modified_time(path: &Path) -> DateTime<Utc> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_language_detection() {
        assert_eq!(Language::from_extension("py"), Language::Python);
        assert_eq!(Language::from_extension("tsx"), Language::TypeScript);
        assert_eq!(Language::from_extension("java"), Language::Java);
        assert_eq!(Language::from_extension("txt"), Language::Unknown);
        assert!(Language::Python.is_primary());
        assert!(!Language::Rust.is_primary());
    }

    #[test]
    fn test_walker_skips_ignored_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("pkg")).unwrap();
        fs::create_dir_all(tmp.path().join("node_modules/dep")).unwrap();
        fs::create_dir_all(tmp.path().join(".operon")).unwrap();
        fs::write(tmp.path().join("pkg/app.py"), "x = 1\n").unwrap();
        fs::write(tmp.path().join("node_modules/dep/index.js"), "x").unwrap();
        fs::write(tmp.path().join(".operon/symbol_graph.json"), "{}").unwrap();
        fs::write(tmp.path().join("README.md"), "# readme").unwrap();

        let files = list_code_files(tmp.path());
        assert_eq!(files, vec![PathBuf::from("pkg/app.py")]);

        let all = list_all_files(tmp.path());
        assert!(all.contains(&PathBuf::from("README.md")));
        assert!(!all.iter().any(|p| p.starts_with("node_modules")));
    }

    #[test]
    fn test_hash_file_changes_with_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.py");
        fs::write(&path, "x = 1\n").unwrap();
        let h1 = hash_file(&path);
        fs::write(&path, "x = 2\n").unwrap();
        let h2 = hash_file(&path);
        assert_ne!(h1, h2);
        assert!(!h1.is_empty());
    }
}
