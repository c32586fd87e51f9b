//! Persistent, cross-file symbol graph.
//!
//! Stores every symbol in the repo and the cross-file references between
//! them, keyed by content hash for incremental rebuilds. Persisted as a
//! single schema-versioned document at `.operon/symbol_graph.json`, with a
//! flat file-hash cache beside it at `.operon/index.json`.

use anyhow::Context;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant};

use super::parser::extract_file;
use super::{hash_file, list_code_files, modified_time, FileRecord, Language, UsageKind, UsageSite};
use crate::util::write_atomic;

pub const SCHEMA_VERSION: u32 = 5;

const GRAPH_FILE: &str = "symbol_graph.json";
const HASH_CACHE_FILE: &str = "index.json";
const LOCK_FILE: &str = ".lock";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolGraph {
    pub schema_version: u32,
    pub files: BTreeMap<String, FileRecord>,
    pub cross_refs: BTreeMap<String, Vec<UsageSite>>,
}

/// Flat path -> content-hash cache, for cheap staleness checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashCache {
    pub hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
pub struct GraphStats {
    pub file_count: usize,
    pub symbol_count: usize,
    pub cross_ref_count: usize,
}

impl Default for SymbolGraph {
    fn default() -> Self {
        Self::empty()
    }
}

impl SymbolGraph {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            files: BTreeMap::new(),
            cross_refs: BTreeMap::new(),
        }
    }

    /// Load the persisted graph, or an empty shell.
    ///
    /// A schema-version mismatch is treated as absent, which forces the next
    /// `build` into a full rebuild.
    pub fn load(repo_root: &Path) -> Self {
        let path = repo_root.join(".operon").join(GRAPH_FILE);
        let Ok(content) = fs::read_to_string(&path) else {
            return Self::empty();
        };
        match serde_json::from_str::<SymbolGraph>(&content) {
            Ok(graph) if graph.schema_version == SCHEMA_VERSION => graph,
            Ok(graph) => {
                tracing::info!(
                    "symbol graph schema {} != {}; full rebuild required",
                    graph.schema_version,
                    SCHEMA_VERSION
                );
                Self::empty()
            }
            Err(err) => {
                tracing::warn!("symbol graph unreadable ({}); starting empty", err);
                Self::empty()
            }
        }
    }

    /// Build (or incrementally update) the graph and persist it.
    ///
    /// Only files whose content hash differs from the stored record are
    /// re-extracted; records for vanished files are dropped. The cross-ref
    /// index is reassembled from per-file usage indexes on every build, so
    /// it can never reference a file outside the file map.
    pub fn build(repo_root: &Path, incremental: bool) -> anyhow::Result<Self> {
        let started = Instant::now();
        let mut graph = if incremental {
            Self::load(repo_root)
        } else {
            Self::empty()
        };

        let code_files = list_code_files(repo_root);
        let mut changed = 0usize;
        let mut fresh: BTreeMap<String, FileRecord> = BTreeMap::new();

        for rel in &code_files {
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            let abs = repo_root.join(rel);
            let hash = hash_file(&abs);
            if hash.is_empty() {
                continue;
            }

            if incremental {
                if let Some(existing) = graph.files.get(&rel_str) {
                    if existing.hash == hash {
                        fresh.insert(rel_str, existing.clone());
                        continue;
                    }
                }
            }

            let Ok(bytes) = fs::read(&abs) else {
                continue;
            };
            let source = String::from_utf8_lossy(&bytes);
            let language = Language::from_path(rel);
            let extraction = extract_file(&source, language);
            if let Some(err) = &extraction.error {
                tracing::debug!("parse_error {}: {}", rel_str, err);
            }

            fresh.insert(
                rel_str.clone(),
                FileRecord {
                    path: rel_str,
                    hash,
                    language,
                    modified: modified_time(&abs),
                    symbols: extraction.symbols,
                    usages: extraction.usages,
                    parse_error: extraction.error,
                },
            );
            changed += 1;
        }

        graph.files = fresh;
        graph.rebuild_cross_refs();
        graph.persist(repo_root)?;

        tracing::info!(
            "symbol graph ready: {} files, {} symbols ({} re-indexed, {:.1}s)",
            graph.files.len(),
            graph.cross_refs.len(),
            changed,
            started.elapsed().as_secs_f32()
        );
        Ok(graph)
    }

    fn rebuild_cross_refs(&mut self) {
        let mut cross_refs: BTreeMap<String, Vec<UsageSite>> = BTreeMap::new();
        for (rel, record) in &self.files {
            for occ in &record.usages {
                if occ.name.len() < 2 {
                    continue;
                }
                cross_refs.entry(occ.name.clone()).or_default().push(UsageSite {
                    file: rel.clone(),
                    line: occ.line,
                    kind: occ.kind,
                });
            }
        }
        self.cross_refs = cross_refs;
    }

    /// Persist atomically: temp file + rename, under an advisory lock. On
    /// any failure the on-disk document keeps its previous complete version.
    pub fn persist(&self, repo_root: &Path) -> anyhow::Result<()> {
        let dir = repo_root.join(".operon");
        fs::create_dir_all(&dir).context("create .operon directory")?;
        let _lock = acquire_lock(&dir)?;

        let graph_json = serde_json::to_string(self).context("serialize symbol graph")?;
        write_atomic(&dir.join(GRAPH_FILE), &graph_json)?;

        let cache = HashCache {
            hashes: self
                .files
                .iter()
                .map(|(path, record)| (path.clone(), record.hash.clone()))
                .collect(),
        };
        let cache_json = serde_json::to_string_pretty(&cache).context("serialize hash cache")?;
        write_atomic(&dir.join(HASH_CACHE_FILE), &cache_json)?;
        Ok(())
    }

    // ── Read-only queries ────────────────────────────────────────────────────

    /// All cross-ref sites for a symbol name (case-sensitive, exact).
    pub fn query(&self, name: &str) -> &[UsageSite] {
        self.cross_refs
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn find_definitions(&self, name: &str) -> Vec<&UsageSite> {
        self.query(name)
            .iter()
            .filter(|s| s.kind == UsageKind::Definition)
            .collect()
    }

    pub fn find_usages(&self, name: &str) -> Vec<&UsageSite> {
        self.query(name)
            .iter()
            .filter(|s| s.kind != UsageKind::Definition)
            .collect()
    }

    pub fn symbols_in_file(&self, rel_path: &str) -> Option<&FileRecord> {
        self.files.get(rel_path)
    }

    /// Symbol names starting with `prefix`, case-insensitive.
    pub fn search_by_prefix(&self, prefix: &str) -> Vec<String> {
        let lower = prefix.to_lowercase();
        self.cross_refs
            .keys()
            .filter(|k| k.to_lowercase().starts_with(&lower))
            .cloned()
            .collect()
    }

    /// The file that defines `name`, if the graph knows one.
    pub fn defining_file(&self, name: &str) -> Option<&str> {
        self.find_definitions(name)
            .first()
            .map(|site| site.file.as_str())
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            file_count: self.files.len(),
            symbol_count: self.files.values().map(|f| f.symbols.len()).sum(),
            cross_ref_count: self.cross_refs.len(),
        }
    }
}

/// Load the flat hash cache, if present.
pub fn load_hash_cache(repo_root: &Path) -> HashCache {
    let path = repo_root.join(".operon").join(HASH_CACHE_FILE);
    fs::read_to_string(&path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}

struct DirLock {
    file: fs::File,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn acquire_lock(dir: &Path) -> anyhow::Result<DirLock> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.join(LOCK_FILE))?;

    let start = Instant::now();
    loop {
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => return Ok(DirLock { file }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                    return Err(anyhow::anyhow!(
                        "Timed out waiting for .operon lock ({}s)",
                        LOCK_TIMEOUT_SECS
                    ));
                }
                std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
            }
            Err(err) => return Err(err.into()),
        }
    }
}
