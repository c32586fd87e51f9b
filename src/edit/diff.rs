//! Fuzzy SEARCH/REPLACE patching.
//!
//! Parses fenced SEARCH/REPLACE blocks out of oracle output (several fence
//! styles in the wild), locates the search text in the original with a
//! whitespace-tolerance ladder, re-aligns the replacement's indentation to
//! the matched site, and reports a classified reason so callers know *why*
//! a patch failed.

use regex::Regex;
use std::sync::OnceLock;

/// Why a patch application ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchReason {
    Ok,
    Noop,
    Appended,
    NoMatch,
    Ambiguous,
}

impl PatchReason {
    pub fn label(&self) -> &'static str {
        match self {
            PatchReason::Ok => "ok",
            PatchReason::Noop => "noop",
            PatchReason::Appended => "appended",
            PatchReason::NoMatch => "no_match",
            PatchReason::Ambiguous => "ambiguous",
        }
    }
}

/// One parsed SEARCH/REPLACE pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReplace {
    pub search: String,
    pub replace: String,
}

// ── Block parsing ────────────────────────────────────────────────────────────

fn canonical_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<{7}\s*SEARCH\r?\n(.*?)\r?\n?={7}\r?\n(.*?)\r?\n?>{7}\s*REPLACE")
            .expect("static regex")
    })
}

fn anonymous_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<{7}[^\n]*\r?\n(.*?)\r?\n?={7}\r?\n(.*?)\r?\n?>{7}[^\n]*")
            .expect("static regex")
    })
}

fn labeled_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)SEARCH:\s*\n(.*?)\nREPLACE:\s*\n(.*?)(?:\nSEARCH:|\z)")
            .expect("static regex")
    })
}

/// Extract (search, replace) pairs from oracle output.
///
/// Tries the canonical `<<<<<<< SEARCH` fence first, then anonymous conflict
/// fences, then `SEARCH:`/`REPLACE:` labels. First style that matches wins.
/// Multiple blocks in one payload come back in order.
pub fn parse_search_replace(text: &str) -> Vec<SearchReplace> {
    for pattern in [canonical_re(), anonymous_re(), labeled_re()] {
        let blocks: Vec<SearchReplace> = pattern
            .captures_iter(text)
            .map(|cap| SearchReplace {
                search: cap[1].trim_matches('\n').to_string(),
                replace: cap[2].trim_matches('\n').to_string(),
            })
            .collect();
        if !blocks.is_empty() {
            return blocks;
        }
    }
    Vec::new()
}

// ── Matching ─────────────────────────────────────────────────────────────────

/// A whitespace-tolerance rung: how two lines are compared.
#[derive(Clone, Copy)]
enum Tolerance {
    Exact,
    TrailingWs,
    Trimmed,
}

fn lines_equal(a: &str, b: &str, tolerance: Tolerance) -> bool {
    match tolerance {
        Tolerance::Exact => a == b,
        Tolerance::TrailingWs => a.trim_end() == b.trim_end(),
        Tolerance::Trimmed => a.trim() == b.trim(),
    }
}

/// All window start indices where the search lines match under `tolerance`.
fn window_matches(orig: &[&str], search: &[&str], tolerance: Tolerance) -> Vec<usize> {
    let slen = search.len();
    if slen == 0 || slen > orig.len() {
        return Vec::new();
    }
    let mut hits = Vec::new();
    for start in 0..=(orig.len() - slen) {
        if (0..slen).all(|i| lines_equal(orig[start + i], search[i], tolerance)) {
            hits.push(start);
        }
    }
    hits
}

fn leading_ws(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Re-indent the replacement block to the matched site.
///
/// Additive: the original indentation prefix goes onto every non-empty
/// line; the block's own minimum leading whitespace is subtracted first so
/// relative indentation inside the replacement survives.
fn reindent(replace: &str, original_indent: &str) -> Vec<String> {
    let lines: Vec<&str> = replace.lines().collect();
    let min_indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| leading_ws(l).len())
        .min()
        .unwrap_or(0);

    lines
        .iter()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                let stripped = if line.len() >= min_indent {
                    &line[min_indent..]
                } else {
                    line.trim_start()
                };
                format!("{}{}", original_indent, stripped)
            }
        })
        .collect()
}

fn looks_like_import(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.lines().count() != 1 {
        return false;
    }
    trimmed.starts_with("import ")
        || (trimmed.starts_with("from ") && trimmed.contains(" import "))
        || trimmed.starts_with("use ")
}

/// Apply one SEARCH/REPLACE pair to `original`.
///
/// Returns `(patched, reason)`; `patched` is `None` exactly when the reason
/// is `NoMatch` or `Ambiguous`.
pub fn apply_patch(original: &str, search: &str, replace: &str) -> (Option<String>, PatchReason) {
    // Empty SEARCH is append mode. Import-shaped one-liners go to the top of
    // the file; everything else lands at the bottom.
    if search.trim().is_empty() {
        let result = if looks_like_import(replace) {
            format!("{}\n{}", replace.trim(), original)
        } else if original.trim().is_empty() {
            format!("{}\n", replace.trim())
        } else {
            format!("{}\n\n{}\n", original.trim_end(), replace.trim())
        };
        return (Some(result), PatchReason::Appended);
    }

    let orig_lines: Vec<&str> = original.lines().collect();
    let search_lines: Vec<&str> = search.lines().collect();

    for tolerance in [Tolerance::Exact, Tolerance::TrailingWs, Tolerance::Trimmed] {
        let hits = window_matches(&orig_lines, &search_lines, tolerance);
        match hits.len() {
            0 => continue,
            1 => {
                let start = hits[0];
                let indent = leading_ws(orig_lines[start]);
                let adjusted = reindent(replace, indent);

                let mut out: Vec<String> =
                    orig_lines[..start].iter().map(|s| s.to_string()).collect();
                out.extend(adjusted);
                out.extend(
                    orig_lines[start + search_lines.len()..]
                        .iter()
                        .map(|s| s.to_string()),
                );

                let mut result = out.join("\n");
                if original.ends_with('\n') && !result.ends_with('\n') {
                    result.push('\n');
                }

                if result == original {
                    return (Some(result), PatchReason::Noop);
                }
                return (Some(result), PatchReason::Ok);
            }
            _ => return (None, PatchReason::Ambiguous),
        }
    }

    (None, PatchReason::NoMatch)
}

/// Apply multiple blocks left-to-right against successive intermediates.
///
/// Stops at the first block that fails to splice and reports its reason.
pub fn apply_blocks(original: &str, blocks: &[SearchReplace]) -> (Option<String>, PatchReason) {
    if blocks.is_empty() {
        return (None, PatchReason::NoMatch);
    }
    let mut current = original.to_string();
    let mut any_change = false;
    let mut last_reason = PatchReason::Noop;

    for block in blocks {
        let (patched, reason) = apply_patch(&current, &block.search, &block.replace);
        match reason {
            PatchReason::NoMatch | PatchReason::Ambiguous => return (None, reason),
            PatchReason::Noop => {
                current = patched.expect("noop carries content");
                last_reason = reason;
            }
            PatchReason::Ok | PatchReason::Appended => {
                current = patched.expect("success carries content");
                any_change = true;
                last_reason = reason;
            }
        }
    }

    if !any_change {
        return (Some(current), PatchReason::Noop);
    }
    (Some(current), last_reason)
}

// ── Thin specializations ─────────────────────────────────────────────────────

/// Insert an import line at the top, deduplicating against existing lines.
pub fn insert_import(original: &str, import_line: &str) -> (Option<String>, PatchReason) {
    let wanted = import_line.trim();
    if original.lines().any(|l| l.trim() == wanted) {
        return (Some(original.to_string()), PatchReason::Noop);
    }
    (
        Some(format!("{}\n{}", wanted, original)),
        PatchReason::Appended,
    )
}

/// Insert `new_line` directly above the unique line matching `target`
/// (trimmed comparison), adopting the target's indentation.
pub fn insert_above(original: &str, target: &str, new_line: &str) -> (Option<String>, PatchReason) {
    let lines: Vec<&str> = original.lines().collect();
    let hits: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.trim() == target.trim())
        .map(|(i, _)| i)
        .collect();
    match hits.len() {
        0 => (None, PatchReason::NoMatch),
        1 => {
            let at = hits[0];
            let indent = leading_ws(lines[at]);
            let mut out: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
            out.insert(at, format!("{}{}", indent, new_line.trim()));
            let mut result = out.join("\n");
            if original.ends_with('\n') {
                result.push('\n');
            }
            (Some(result), PatchReason::Ok)
        }
        _ => (None, PatchReason::Ambiguous),
    }
}

/// Append text to the end of a file (never the import fast path).
pub fn append_to_file(original: &str, text: &str) -> (Option<String>, PatchReason) {
    let result = if original.trim().is_empty() {
        format!("{}\n", text.trim())
    } else {
        format!("{}\n\n{}\n", original.trim_end(), text.trim())
    };
    (Some(result), PatchReason::Appended)
}
