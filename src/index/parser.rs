//! Symbol extraction.
//!
//! One extractor per language tag behind a single dispatch point. The
//! primary language (Python) is parsed with tree-sitter and yields exact
//! spans, signatures, docstrings and usage sites. Everything else goes
//! through a best-effort regex extractor.
//!
//! Contract: deterministic for identical input; never panics; a parse fault
//! is reported through `Extraction::error`, never by dropping the file.

use regex::Regex;
use std::sync::OnceLock;
use tree_sitter::{Node, Parser};

use super::{Language, Symbol, SymbolKind, UsageKind, UsageOccurrence};

/// Everything pulled out of one source buffer.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub symbols: Vec<Symbol>,
    pub usages: Vec<UsageOccurrence>,
    pub error: Option<String>,
}

/// Result of a syntax check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxCheck {
    Ok,
    Error {
        line: usize,
        column: usize,
        message: String,
    },
}

impl SyntaxCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, SyntaxCheck::Ok)
    }
}

pub trait SymbolExtractor {
    fn extract(&self, source: &str) -> Extraction;
    fn check_syntax(&self, source: &str) -> SyntaxCheck;
}

/// The single dispatch point from language tag to extractor.
pub fn extractor_for(language: Language) -> Box<dyn SymbolExtractor> {
    if language.is_primary() {
        Box::new(PythonExtractor)
    } else {
        Box::new(RegexExtractor { language })
    }
}

pub fn extract_file(source: &str, language: Language) -> Extraction {
    extractor_for(language).extract(source)
}

pub fn check_syntax(source: &str, language: Language) -> SyntaxCheck {
    extractor_for(language).check_syntax(source)
}

// ── Python (authoritative) ───────────────────────────────────────────────────

pub struct PythonExtractor;

impl SymbolExtractor for PythonExtractor {
    fn extract(&self, source: &str) -> Extraction {
        let mut extraction = Extraction::default();
        let Some(tree) = parse_python(source) else {
            extraction.error = Some("tree-sitter failed to parse buffer".to_string());
            return extraction;
        };

        let root = tree.root_node();
        collect_symbols(&root, source, None, &mut extraction.symbols);
        collect_usages(&root, source, &mut extraction.usages);

        if root.has_error() {
            if let Some((line, column)) = first_error_position(&root) {
                extraction.error = Some(format!("syntax error at {}:{}", line, column));
            }
        }
        extraction
    }

    fn check_syntax(&self, source: &str) -> SyntaxCheck {
        let Some(tree) = parse_python(source) else {
            return SyntaxCheck::Error {
                line: 1,
                column: 0,
                message: "parser produced no tree".to_string(),
            };
        };
        let root = tree.root_node();
        if !root.has_error() {
            return SyntaxCheck::Ok;
        }
        let (line, column) = first_error_position(&root).unwrap_or((1, 0));
        SyntaxCheck::Error {
            line,
            column,
            message: "invalid syntax".to_string(),
        }
    }
}

fn parse_python(source: &str) -> Option<tree_sitter::Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .ok()?;
    parser.parse(source, None)
}

fn node_text(node: &Node, source: &str) -> String {
    source[node.byte_range()].to_string()
}

/// Find the first ERROR or MISSING node, depth-first. 1-based line.
fn first_error_position(root: &Node) -> Option<(usize, usize)> {
    let mut cursor = root.walk();
    let mut stack = vec![*root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            return Some((node.start_position().row + 1, node.start_position().column));
        }
        for child in node.children(&mut cursor).collect::<Vec<_>>() {
            stack.push(child);
        }
    }
    None
}

/// Walk the tree collecting symbol records.
///
/// `parent_class` is the enclosing class name for methods.
fn collect_symbols(
    node: &Node,
    source: &str,
    parent_class: Option<&str>,
    out: &mut Vec<Symbol>,
) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor).collect::<Vec<_>>() {
        match child.kind() {
            "decorated_definition" => {
                // The span of a decorated function includes its decorator lines.
                let deco_start = child.start_position().row + 1;
                let mut inner_cursor = child.walk();
                for part in child.children(&mut inner_cursor).collect::<Vec<_>>() {
                    match part.kind() {
                        "decorator" => {
                            out.push(Symbol {
                                name: decorator_name(&part, source),
                                kind: SymbolKind::Decorator,
                                start: part.start_position().row + 1,
                                end: part.end_position().row + 1,
                                signature: None,
                                docstring: None,
                                parent: parent_class.map(String::from),
                                is_async: false,
                            });
                        }
                        "function_definition" => {
                            if let Some(mut sym) = function_symbol(&part, source, parent_class) {
                                sym.start = deco_start;
                                out.push(sym);
                            }
                        }
                        "class_definition" => {
                            if let Some(mut sym) = class_symbol(&part, source) {
                                sym.start = deco_start;
                                let class_name = sym.name.clone();
                                out.push(sym);
                                if let Some(body) = part.child_by_field_name("body") {
                                    collect_symbols(&body, source, Some(&class_name), out);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            "function_definition" => {
                if let Some(sym) = function_symbol(&child, source, parent_class) {
                    out.push(sym);
                }
            }
            "class_definition" => {
                if let Some(sym) = class_symbol(&child, source) {
                    let class_name = sym.name.clone();
                    out.push(sym);
                    if let Some(body) = child.child_by_field_name("body") {
                        collect_symbols(&body, source, Some(&class_name), out);
                    }
                }
            }
            "import_statement" | "import_from_statement" => {
                for name in imported_names(&child, source) {
                    out.push(Symbol {
                        name,
                        kind: SymbolKind::Import,
                        start: child.start_position().row + 1,
                        end: child.end_position().row + 1,
                        signature: None,
                        docstring: None,
                        parent: None,
                        is_async: false,
                    });
                }
            }
            "expression_statement" => {
                if let Some(assign) = child.named_child(0).filter(|n| n.kind() == "assignment") {
                    if let Some(sym) = assignment_symbol(&assign, source) {
                        out.push(sym);
                    }
                }
            }
            "comment" => {
                let text = node_text(&child, source);
                let trimmed = text.trim_start_matches('#').trim();
                if !trimmed.is_empty() {
                    out.push(Symbol {
                        name: crate::util::truncate(trimmed, 80),
                        kind: SymbolKind::Comment,
                        start: child.start_position().row + 1,
                        end: child.end_position().row + 1,
                        signature: None,
                        docstring: None,
                        parent: None,
                        is_async: false,
                    });
                }
            }
            _ => {}
        }
    }
}

fn function_symbol(node: &Node, source: &str, parent_class: Option<&str>) -> Option<Symbol> {
    let name_node = node.child_by_field_name("name")?;
    let is_async = node
        .child(0)
        .map(|c| c.kind() == "async")
        .unwrap_or(false);

    Some(Symbol {
        name: node_text(&name_node, source),
        kind: SymbolKind::Function,
        start: node.start_position().row + 1,
        end: node.end_position().row + 1,
        signature: Some(parameter_names(node, source)),
        docstring: body_docstring(node, source),
        parent: parent_class.map(String::from),
        is_async,
    })
}

fn class_symbol(node: &Node, source: &str) -> Option<Symbol> {
    let name_node = node.child_by_field_name("name")?;
    Some(Symbol {
        name: node_text(&name_node, source),
        kind: SymbolKind::Class,
        start: node.start_position().row + 1,
        end: node.end_position().row + 1,
        signature: None,
        docstring: body_docstring(node, source),
        parent: None,
        is_async: false,
    })
}

fn assignment_symbol(assign: &Node, source: &str) -> Option<Symbol> {
    let left = assign.child_by_field_name("left")?;
    if left.kind() != "identifier" {
        return None;
    }
    let name = node_text(&left, source);
    let annotated = assign.child_by_field_name("type").is_some();
    let kind = if annotated {
        SymbolKind::Annotation
    } else if name.chars().all(|c| c.is_ascii_uppercase() || c == '_' || c.is_ascii_digit()) {
        SymbolKind::Variable
    } else {
        SymbolKind::Assignment
    };
    Some(Symbol {
        name,
        kind,
        start: assign.start_position().row + 1,
        end: assign.end_position().row + 1,
        signature: None,
        docstring: None,
        parent: None,
        is_async: false,
    })
}

fn decorator_name(node: &Node, source: &str) -> String {
    // "@app.route(...)" -> "app.route"; "@staticmethod" -> "staticmethod"
    let text = node_text(node, source);
    let stripped = text.trim_start_matches('@').trim();
    let head = stripped.split('(').next().unwrap_or(stripped);
    head.trim().to_string()
}

/// Ordered parameter names, `*`/`**` markers preserved.
fn parameter_names(func: &Node, source: &str) -> Vec<String> {
    let Some(params) = func.child_by_field_name("parameters") else {
        return Vec::new();
    };
    let mut names = Vec::new();
    let mut cursor = params.walk();
    for child in params.named_children(&mut cursor).collect::<Vec<_>>() {
        let name = match child.kind() {
            "identifier" => node_text(&child, source),
            "default_parameter" | "typed_default_parameter" => child
                .child_by_field_name("name")
                .map(|n| node_text(&n, source))
                .unwrap_or_else(|| node_text(&child, source)),
            "typed_parameter" => first_identifier_text(&child, source)
                .unwrap_or_else(|| node_text(&child, source)),
            "list_splat_pattern" => format!(
                "*{}",
                first_identifier_text(&child, source).unwrap_or_default()
            ),
            "dictionary_splat_pattern" => format!(
                "**{}",
                first_identifier_text(&child, source).unwrap_or_default()
            ),
            _ => continue,
        };
        names.push(name);
    }
    names
}

fn first_identifier_text(node: &Node, source: &str) -> Option<String> {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor).collect::<Vec<_>>() {
        if child.kind() == "identifier" {
            return Some(node_text(&child, source));
        }
    }
    None
}

/// First statement of the body, if it is a bare string literal.
fn body_docstring(node: &Node, source: &str) -> Option<String> {
    let body = node.child_by_field_name("body")?;
    let first = body.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let expr = first.named_child(0)?;
    if expr.kind() != "string" {
        return None;
    }
    let raw = node_text(&expr, source);
    let trimmed = raw
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(crate::util::truncate(&trimmed, 200))
    }
}

/// Names an import statement binds in the module scope.
///
/// `import a.b.c` binds `a`; `from x import name` binds `name`;
/// `import x as y` / `from m import x as y` bind `y`.
fn imported_names(node: &Node, source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let module_id = node.child_by_field_name("module_name").map(|n| n.id());
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor).collect::<Vec<_>>() {
        if Some(child.id()) == module_id {
            continue;
        }
        match child.kind() {
            "dotted_name" => {
                let text = node_text(&child, source);
                let bound = if node.kind() == "import_statement" {
                    text.split('.').next().unwrap_or(&text).to_string()
                } else {
                    text
                };
                names.push(bound);
            }
            "aliased_import" => {
                if let Some(alias) = child.child_by_field_name("alias") {
                    names.push(node_text(&alias, source));
                }
            }
            _ => {}
        }
    }
    names
}

/// Walk the full tree collecting usage sites.
fn collect_usages(root: &Node, source: &str, out: &mut Vec<UsageOccurrence>) {
    let mut stack = vec![*root];
    let mut cursor = root.walk();
    while let Some(node) = stack.pop() {
        match node.kind() {
            "function_definition" | "class_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    push_usage(out, &node_text(&name, source), &name, UsageKind::Definition);
                }
            }
            "call" => {
                if let Some(func) = node.child_by_field_name("function") {
                    match func.kind() {
                        "identifier" => {
                            push_usage(out, &node_text(&func, source), &func, UsageKind::Call)
                        }
                        "attribute" => {
                            if let Some(attr) = func.child_by_field_name("attribute") {
                                push_usage(
                                    out,
                                    &node_text(&attr, source),
                                    &attr,
                                    UsageKind::Call,
                                );
                            }
                        }
                        _ => {}
                    }
                }
            }
            "attribute" => {
                if let Some(attr) = node.child_by_field_name("attribute") {
                    push_usage(out, &node_text(&attr, source), &attr, UsageKind::Attribute);
                }
            }
            "import_statement" | "import_from_statement" => {
                for name in imported_names(&node, source) {
                    out.push(UsageOccurrence {
                        name,
                        line: node.start_position().row + 1,
                        kind: UsageKind::Import,
                    });
                }
            }
            "identifier" => {
                let kind = match node.parent() {
                    Some(p) if p.kind() == "assignment" && is_left_of_assignment(&node) => {
                        Some(UsageKind::Definition)
                    }
                    Some(p)
                        if matches!(p.kind(), "function_definition" | "class_definition") =>
                    {
                        None
                    }
                    // The attribute field is recorded by the "attribute" arm;
                    // the object position is an ordinary reference.
                    Some(p) if p.kind() == "attribute" => {
                        if p.child_by_field_name("attribute").map(|a| a.id())
                            == Some(node.id())
                        {
                            None
                        } else {
                            Some(UsageKind::Reference)
                        }
                    }
                    Some(p) if p.kind() == "call" => None,
                    Some(p)
                        if matches!(
                            p.kind(),
                            "keyword_argument" | "parameters" | "dotted_name" | "aliased_import"
                        ) =>
                    {
                        None
                    }
                    _ => Some(UsageKind::Reference),
                };
                if let Some(kind) = kind {
                    push_usage(out, &node_text(&node, source), &node, kind);
                }
            }
            _ => {}
        }
        for child in node.children(&mut cursor).collect::<Vec<_>>() {
            stack.push(child);
        }
    }
    // Stack order is irrelevant to callers; keep output deterministic.
    out.sort_by(|a, b| (a.line, &a.name).cmp(&(b.line, &b.name)));
}

fn is_left_of_assignment(node: &Node) -> bool {
    node.parent()
        .and_then(|p| p.child_by_field_name("left"))
        .map(|left| left.id() == node.id())
        .unwrap_or(false)
}

fn push_usage(out: &mut Vec<UsageOccurrence>, name: &str, node: &Node, kind: UsageKind) {
    if name.len() < 2 {
        return;
    }
    out.push(UsageOccurrence {
        name: name.to_string(),
        line: node.start_position().row + 1,
        kind,
    });
}

// ── Regex fallback (secondary languages) ─────────────────────────────────────

pub struct RegexExtractor {
    pub language: Language,
}

fn fn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:export\s+)?(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:function|fn|def)\s+([A-Za-z_]\w*)")
            .expect("static regex")
    })
}

fn class_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:export\s+)?(?:pub(?:\([^)]*\))?\s+)?(?:class|struct|interface|trait|enum)\s+([A-Za-z_]\w*)")
            .expect("static regex")
    })
}

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^\s*(?:import|from|use|require)\b[^\n]*?([A-Za-z_][\w]*)\s*;?\s*$"#)
            .expect("static regex")
    })
}

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\b").expect("static regex"))
}

fn line_of(source: &str, byte_offset: usize) -> usize {
    source[..byte_offset].matches('\n').count() + 1
}

impl SymbolExtractor for RegexExtractor {
    fn extract(&self, source: &str) -> Extraction {
        let mut extraction = Extraction::default();

        for cap in fn_re().captures_iter(source) {
            let m = cap.get(1).expect("group 1 always present");
            let line = line_of(source, m.start());
            extraction.symbols.push(Symbol {
                name: m.as_str().to_string(),
                kind: SymbolKind::Function,
                start: line,
                end: line,
                signature: None,
                docstring: None,
                parent: None,
                is_async: false,
            });
            extraction.usages.push(UsageOccurrence {
                name: m.as_str().to_string(),
                line,
                kind: UsageKind::Definition,
            });
        }
        for cap in class_re().captures_iter(source) {
            let m = cap.get(1).expect("group 1 always present");
            let line = line_of(source, m.start());
            extraction.symbols.push(Symbol {
                name: m.as_str().to_string(),
                kind: SymbolKind::Class,
                start: line,
                end: line,
                signature: None,
                docstring: None,
                parent: None,
                is_async: false,
            });
            extraction.usages.push(UsageOccurrence {
                name: m.as_str().to_string(),
                line,
                kind: UsageKind::Definition,
            });
        }
        for cap in import_re().captures_iter(source) {
            let m = cap.get(1).expect("group 1 always present");
            let line = line_of(source, m.start());
            extraction.symbols.push(Symbol {
                name: m.as_str().to_string(),
                kind: SymbolKind::Import,
                start: line,
                end: line,
                signature: None,
                docstring: None,
                parent: None,
                is_async: false,
            });
        }

        // Every identifier is a (weak) reference site; the cross-ref index
        // filters on demand.
        for cap in ident_re().captures_iter(source) {
            let m = cap.get(1).expect("group 1 always present");
            if m.as_str().len() < 2 {
                continue;
            }
            extraction.usages.push(UsageOccurrence {
                name: m.as_str().to_string(),
                line: line_of(source, m.start()),
                kind: UsageKind::Reference,
            });
        }

        extraction
    }

    fn check_syntax(&self, _source: &str) -> SyntaxCheck {
        // No authoritative parser for secondary languages; accept.
        SyntaxCheck::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY: &str = r#"import json
from pathlib import Path

MAX_STEPS = 35

@cached
def fetch(url, timeout=30):
    """Fetch a URL."""
    return json.loads(url)

class Loader:
    """Loads things."""

    async def run(self, *args, **kwargs):
        return fetch(self.url)
"#;

    #[test]
    fn test_python_symbols() {
        let extraction = extract_file(PY, Language::Python);
        assert!(extraction.error.is_none());

        let fetch = extraction
            .symbols
            .iter()
            .find(|s| s.name == "fetch")
            .unwrap();
        assert_eq!(fetch.kind, SymbolKind::Function);
        // Decorator line is part of the function span.
        assert_eq!(fetch.start, 6);
        assert_eq!(
            fetch.signature.as_deref(),
            Some(&["url".to_string(), "timeout".to_string()][..])
        );
        assert_eq!(fetch.docstring.as_deref(), Some("Fetch a URL."));

        let loader = extraction
            .symbols
            .iter()
            .find(|s| s.name == "Loader")
            .unwrap();
        assert_eq!(loader.kind, SymbolKind::Class);
        assert_eq!(loader.docstring.as_deref(), Some("Loads things."));

        let run = extraction.symbols.iter().find(|s| s.name == "run").unwrap();
        assert!(run.is_async);
        assert_eq!(run.parent.as_deref(), Some("Loader"));
        assert_eq!(
            run.signature.as_deref(),
            Some(&["self".to_string(), "*args".to_string(), "**kwargs".to_string()][..])
        );

        let max_steps = extraction
            .symbols
            .iter()
            .find(|s| s.name == "MAX_STEPS")
            .unwrap();
        assert_eq!(max_steps.kind, SymbolKind::Variable);

        assert!(extraction
            .symbols
            .iter()
            .any(|s| s.kind == SymbolKind::Import && s.name == "json"));
        assert!(extraction
            .symbols
            .iter()
            .any(|s| s.kind == SymbolKind::Import && s.name == "Path"));
        assert!(extraction
            .symbols
            .iter()
            .any(|s| s.kind == SymbolKind::Decorator && s.name == "cached"));
    }

    #[test]
    fn test_python_usages() {
        let extraction = extract_file(PY, Language::Python);
        assert!(extraction
            .usages
            .iter()
            .any(|u| u.name == "fetch" && u.kind == UsageKind::Definition));
        assert!(extraction
            .usages
            .iter()
            .any(|u| u.name == "fetch" && u.kind == UsageKind::Call));
        assert!(extraction
            .usages
            .iter()
            .any(|u| u.name == "loads" && u.kind == UsageKind::Call));
        assert!(extraction
            .usages
            .iter()
            .any(|u| u.name == "url" && u.kind == UsageKind::Attribute));
        assert!(extraction
            .usages
            .iter()
            .any(|u| u.name == "json" && u.kind == UsageKind::Import));
    }

    #[test]
    fn test_python_check_syntax() {
        assert!(check_syntax("def ok():\n    pass\n", Language::Python).is_ok());
        match check_syntax("def broken(:\n", Language::Python) {
            SyntaxCheck::Error { line, .. } => assert!(line >= 1),
            SyntaxCheck::Ok => panic!("expected syntax error"),
        }
    }

    #[test]
    fn test_parse_fault_is_marked_not_dropped() {
        let extraction = extract_file("def broken(:\n    pass\n", Language::Python);
        assert!(extraction.error.is_some());
    }

    #[test]
    fn test_regex_fallback_js() {
        let src = "import { thing } from './dep';\n\nexport function handler(req) {\n  return thing(req);\n}\n\nclass Widget {}\n";
        let extraction = extract_file(src, Language::JavaScript);
        assert!(extraction
            .symbols
            .iter()
            .any(|s| s.name == "handler" && s.kind == SymbolKind::Function));
        assert!(extraction
            .symbols
            .iter()
            .any(|s| s.name == "Widget" && s.kind == SymbolKind::Class));
        // Secondary languages are always "looks ok".
        assert!(check_syntax("not ( valid", Language::JavaScript).is_ok());
    }

    #[test]
    fn test_determinism() {
        let a = extract_file(PY, Language::Python);
        let b = extract_file(PY, Language::Python);
        assert_eq!(a.symbols.len(), b.symbols.len());
        assert_eq!(a.usages.len(), b.usages.len());
    }
}
