//! Tiered path resolution.
//!
//! User-supplied filenames rarely match repository-relative paths exactly:
//! they come from prompts, plans and oracle output. Resolution tries, in
//! order: exact match, case-insensitive match, recursive basename match,
//! fuzzy stem match, and finally a symbol lookup against the graph.

use std::path::Path;

use super::graph::SymbolGraph;
use super::list_all_files;

/// Minimum stem length for the fuzzy tier; shorter stems match too much.
const MIN_FUZZY_STEM: usize = 4;

/// Resolve `user_path` to a repo-relative path.
///
/// Returns `(path, found)`. When no tier hits, the input comes back
/// unchanged with `found = false` so callers may choose to create the file.
pub fn resolve_path(
    user_path: &str,
    repo_root: &Path,
    graph: Option<&SymbolGraph>,
) -> (String, bool) {
    if user_path.trim().is_empty() {
        return (user_path.to_string(), false);
    }

    let normalized = user_path.replace('\\', "/");
    // Paths reaching outside the repository never resolve.
    if Path::new(&normalized).is_absolute()
        || normalized.split('/').any(|part| part == "..")
    {
        return (user_path.to_string(), false);
    }

    // 1. Exact relative path.
    let candidate = repo_root.join(&normalized);
    if candidate.is_file() {
        return (normalized, true);
    }

    let all_files: Vec<String> = list_all_files(repo_root)
        .into_iter()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .collect();

    // 2. Case-insensitive exact match.
    let lower = normalized.to_lowercase();
    for rel in &all_files {
        if rel.to_lowercase() == lower {
            return (rel.clone(), true);
        }
    }

    // 3. Recursive basename match, all extensions; shortest path wins.
    let target_name = basename(&normalized).to_lowercase();
    if !target_name.is_empty() {
        let mut matches: Vec<&String> = all_files
            .iter()
            .filter(|rel| basename(rel).to_lowercase() == target_name)
            .collect();
        if !matches.is_empty() {
            matches.sort_by_key(|rel| (rel.split('/').count(), rel.to_string()));
            return (matches[0].clone(), true);
        }
    }

    // 4. Fuzzy stem match: substring containment either way, ties broken by
    //    longest common prefix with the requested stem.
    let query_stem = stem(&normalized).to_lowercase();
    if query_stem.len() >= MIN_FUZZY_STEM {
        let mut fuzzy: Vec<&String> = all_files
            .iter()
            .filter(|rel| {
                let s = stem(rel).to_lowercase();
                !s.is_empty() && (s.contains(&query_stem) || query_stem.contains(&s))
            })
            .collect();
        if !fuzzy.is_empty() {
            fuzzy.sort_by_key(|rel| {
                let s = stem(rel).to_lowercase();
                (
                    std::cmp::Reverse(common_prefix_len(&s, &query_stem)),
                    rel.split('/').count(),
                    rel.to_string(),
                )
            });
            return (fuzzy[0].clone(), true);
        }
    }

    // 5. Symbol lookup: the token may name a symbol the graph knows.
    if let Some(graph) = graph {
        for token in [normalized.as_str(), &stem(&normalized)] {
            if let Some(file) = graph.defining_file(token) {
                return (file.to_string(), true);
            }
        }
    }

    (user_path.to_string(), false)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn stem(path: &str) -> String {
    let name = basename(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[..idx].to_string(),
        _ => name.to_string(),
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::graph::SymbolGraph;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("agent")).unwrap();
        fs::create_dir_all(tmp.path().join("tools/deep")).unwrap();
        fs::write(tmp.path().join("agent/loop.py"), "def run_agent(s):\n    pass\n").unwrap();
        fs::write(tmp.path().join("tools/Resolver.py"), "x = 1\n").unwrap();
        fs::write(tmp.path().join("tools/deep/loop.py"), "y = 2\n").unwrap();
        fs::write(tmp.path().join("README.md"), "# hi\n").unwrap();
        tmp
    }

    #[test]
    fn test_exact_match() {
        let tmp = fixture();
        let (path, found) = resolve_path("agent/loop.py", tmp.path(), None);
        assert!(found);
        assert_eq!(path, "agent/loop.py");
    }

    #[test]
    fn test_case_insensitive_match() {
        let tmp = fixture();
        let (path, found) = resolve_path("tools/resolver.py", tmp.path(), None);
        assert!(found);
        assert_eq!(path, "tools/Resolver.py");
    }

    #[test]
    fn test_basename_match_shortest_path_wins() {
        let tmp = fixture();
        let (path, found) = resolve_path("loop.py", tmp.path(), None);
        assert!(found);
        assert_eq!(path, "agent/loop.py");
    }

    #[test]
    fn test_fuzzy_stem_match() {
        let tmp = fixture();
        let (path, found) = resolve_path("resolv.py", tmp.path(), None);
        assert!(found);
        assert_eq!(path, "tools/Resolver.py");
    }

    #[test]
    fn test_symbol_lookup_tier() {
        let tmp = fixture();
        let graph = SymbolGraph::build(tmp.path(), false).unwrap();
        let (path, found) = resolve_path("run_agent", tmp.path(), Some(&graph));
        assert!(found);
        assert_eq!(path, "agent/loop.py");
    }

    #[test]
    fn test_escaping_paths_never_resolve() {
        let tmp = fixture();
        let (_, found) = resolve_path("../outside.py", tmp.path(), None);
        assert!(!found);
        let (_, found) = resolve_path("/etc/passwd", tmp.path(), None);
        assert!(!found);
    }

    #[test]
    fn test_miss_returns_input_unfound() {
        let tmp = fixture();
        let (path, found) = resolve_path("no_such_thing.cfg", tmp.path(), None);
        assert!(!found);
        assert_eq!(path, "no_such_thing.cfg");
    }
}
