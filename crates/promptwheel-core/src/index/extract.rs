//! Regex-based source extraction: imports, exports, top-level symbols,
//! call edges, and cyclomatic complexity. This is the fallback backend;
//! it favors recall over precision and never fails on odd syntax.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::index::cache::{ExportEntry, ExportKind, FileCallEdge};
use crate::types::SymbolRange;

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub imports: Vec<String>,
    pub exports: Vec<ExportEntry>,
    pub complexity: u32,
    pub symbols: Vec<SymbolRange>,
    pub call_edges: Vec<FileCallEdge>,
    pub imported_names: Vec<String>,
    /// Members accessed through `* as ns` imports (`ns.member`).
    pub namespace_members: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lang {
    TypeScript,
    Rust,
    Python,
    Other,
}

fn lang_of(path: &str) -> Lang {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext {
        "ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs" => Lang::TypeScript,
        "rs" => Lang::Rust,
        "py" => Lang::Python,
        _ => Lang::Other,
    }
}

macro_rules! static_regex {
    ($name:ident, $pattern:literal) => {
        fn $name() -> &'static Regex {
            static CELL: OnceLock<Regex> = OnceLock::new();
            CELL.get_or_init(|| Regex::new($pattern).expect("static regex"))
        }
    };
}

// TypeScript / JavaScript.
static_regex!(ts_import, r#"(?m)^\s*import\s+(?:([\w$]+|\{[^}]*\}|\*\s+as\s+[\w$]+)(?:\s*,\s*(\{[^}]*\}))?\s+from\s+)?["']([^"']+)["']"#);
static_regex!(ts_require, r#"(?m)(?:const|let|var)\s+(\{[^}]*\}|[\w$]+)\s*=\s*require\(\s*["']([^"']+)["']\s*\)"#);
static_regex!(ts_export, r"(?m)^\s*export\s+(?:default\s+)?(async\s+)?(function|class|interface|type|enum|const|let|var)\s+([\w$]+)");
static_regex!(ts_symbol, r"(?m)^(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function|class|interface|enum)\s+([\w$]+)|^(?:export\s+)?(?:const|let|var)\s+([\w$]+)\s*=");
static_regex!(ts_call, r"(?m)\b([\w$]+)\s*\(");

// Rust.
static_regex!(rs_use, r"(?m)^\s*use\s+([\w:]+)");
static_regex!(rs_export, r"(?m)^\s*pub\s+(?:async\s+)?(fn|struct|enum|trait|type|const|static|mod)\s+([\w]+)");
static_regex!(rs_symbol, r"(?m)^(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:fn|struct|enum|trait|impl|mod)\s+([\w]+)");

// Python.
static_regex!(py_import, r"(?m)^\s*(?:from\s+([\w.]+)\s+import|import\s+([\w.]+))");
static_regex!(py_symbol, r"(?m)^(?:async\s+)?(?:def|class)\s+([\w]+)");

/// Branch keywords counted for cyclomatic complexity, per language.
fn complexity_tokens(lang: Lang) -> &'static [&'static str] {
    match lang {
        Lang::TypeScript => &["if ", "if(", "else if", "for ", "for(", "while ", "while(", "case ", "catch", "&&", "||", "?."],
        Lang::Rust => &["if ", "else if", "for ", "while ", "match ", "=> ", "&&", "||"],
        Lang::Python => &["if ", "elif ", "for ", "while ", "except", " and ", " or "],
        Lang::Other => &["if ", "for ", "while "],
    }
}

/// Extract everything from one source file. Cheap enough to run on every
/// cache miss; language dispatch is by extension.
pub fn extract(source: &str, path: &str) -> Extraction {
    let lang = lang_of(path);
    let mut out = Extraction::default();

    match lang {
        Lang::TypeScript => extract_ts(source, &mut out),
        Lang::Rust => extract_rust(source, &mut out),
        Lang::Python => extract_python(source, &mut out),
        Lang::Other => {}
    }

    out.complexity = 1 + complexity_tokens(lang)
        .iter()
        .map(|t| source.matches(t).count() as u32)
        .sum::<u32>();

    out.symbols = find_symbols(source, lang);
    if lang == Lang::TypeScript {
        out.call_edges = find_ts_call_edges(source, &out);
        out.namespace_members = find_namespace_members(source);
    }
    out
}

/// For every `import * as ns` alias, collect the members accessed as
/// `ns.member` anywhere in the file.
fn find_namespace_members(source: &str) -> Vec<String> {
    let mut aliases = Vec::new();
    for cap in ts_import().captures_iter(source) {
        if let Some(binding) = cap.get(1) {
            if let Some(ns) = binding.as_str().trim().strip_prefix("* as ") {
                aliases.push(ns.trim().to_string());
            }
        }
    }
    let mut members = Vec::new();
    for alias in aliases {
        let Ok(member_re) = Regex::new(&format!(r"\b{}\.([\w$]+)", regex::escape(&alias))) else {
            continue;
        };
        for cap in member_re.captures_iter(source) {
            if let Some(m) = cap.get(1) {
                let name = m.as_str().to_string();
                if !members.contains(&name) {
                    members.push(name);
                }
            }
        }
    }
    members
}

fn extract_ts(source: &str, out: &mut Extraction) {
    for cap in ts_import().captures_iter(source) {
        if let Some(spec) = cap.get(3) {
            out.imports.push(spec.as_str().to_string());
        }
        for group in [cap.get(1), cap.get(2)].into_iter().flatten() {
            collect_binding_names(group.as_str(), &mut out.imported_names);
        }
    }
    for cap in ts_require().captures_iter(source) {
        if let Some(spec) = cap.get(2) {
            out.imports.push(spec.as_str().to_string());
        }
        if let Some(binding) = cap.get(1) {
            collect_binding_names(binding.as_str(), &mut out.imported_names);
        }
    }
    for cap in ts_export().captures_iter(source) {
        let kind = match cap.get(2).map(|m| m.as_str()) {
            Some("function") => ExportKind::Function,
            Some("class") => ExportKind::Class,
            Some("interface") => ExportKind::Interface,
            Some("type") => ExportKind::Type,
            Some("enum") => ExportKind::Enum,
            Some("const") | Some("let") | Some("var") => ExportKind::Variable,
            _ => ExportKind::Other,
        };
        if let Some(name) = cap.get(3) {
            out.exports.push(ExportEntry { name: name.as_str().to_string(), kind });
        }
    }
}

fn extract_rust(source: &str, out: &mut Extraction) {
    for cap in rs_use().captures_iter(source) {
        if let Some(spec) = cap.get(1) {
            out.imports.push(spec.as_str().to_string());
            if let Some(last) = spec.as_str().rsplit("::").next() {
                out.imported_names.push(last.to_string());
            }
        }
    }
    for cap in rs_export().captures_iter(source) {
        let kind = match cap.get(1).map(|m| m.as_str()) {
            Some("fn") => ExportKind::Function,
            Some("struct") | Some("enum") => ExportKind::Class,
            Some("trait") => ExportKind::Interface,
            Some("type") => ExportKind::Type,
            Some("const") | Some("static") => ExportKind::Variable,
            _ => ExportKind::Other,
        };
        if let Some(name) = cap.get(2) {
            out.exports.push(ExportEntry { name: name.as_str().to_string(), kind });
        }
    }
}

fn extract_python(source: &str, out: &mut Extraction) {
    for cap in py_import().captures_iter(source) {
        if let Some(spec) = cap.get(1).or_else(|| cap.get(2)) {
            out.imports.push(spec.as_str().to_string());
        }
    }
    for cap in py_symbol().captures_iter(source) {
        if let Some(name) = cap.get(1) {
            out.exports.push(ExportEntry {
                name: name.as_str().to_string(),
                kind: ExportKind::Other,
            });
        }
    }
}

/// `{ a, b as c }` / `* as ns` / bare default binding → binding names.
fn collect_binding_names(binding: &str, out: &mut Vec<String>) {
    let trimmed = binding.trim();
    if let Some(inner) = trimmed.strip_prefix('{') {
        for part in inner.trim_end_matches('}').split(',') {
            let name = part
                .split(" as ")
                .last()
                .unwrap_or(part)
                .trim()
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '_' && c != '$');
            if !name.is_empty() {
                out.push(name.to_string());
            }
        }
    } else if let Some(ns) = trimmed.strip_prefix("* as ") {
        out.push(ns.trim().to_string());
    } else if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

/// Top-level symbols with 1-based line ranges. A symbol's range runs from
/// its declaration line to the line before the next top-level symbol (or
/// EOF), which is exactly what the structural merge needs.
fn find_symbols(source: &str, lang: Lang) -> Vec<SymbolRange> {
    let pattern = match lang {
        Lang::TypeScript => ts_symbol(),
        Lang::Rust => rs_symbol(),
        Lang::Python => py_symbol(),
        Lang::Other => return Vec::new(),
    };

    let mut starts: Vec<(usize, String)> = Vec::new();
    for (i, line) in source.lines().enumerate() {
        if let Some(cap) = pattern.captures(line) {
            let name = cap
                .iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str().to_string());
            if let Some(name) = name {
                starts.push((i + 1, name));
            }
        }
    }

    let total_lines = source.lines().count().max(1);
    let mut out = Vec::with_capacity(starts.len());
    for (idx, (start, name)) in starts.iter().enumerate() {
        let end = starts
            .get(idx + 1)
            .map(|(next_start, _)| next_start.saturating_sub(1))
            .unwrap_or(total_lines)
            .max(*start);
        out.push(SymbolRange { name: name.clone(), start_line: *start, end_line: end });
    }
    out
}

/// Call edges: calls inside a symbol's range to a name that was imported
/// (import_source attached) or defined elsewhere in the file.
fn find_ts_call_edges(source: &str, extraction: &Extraction) -> Vec<FileCallEdge> {
    const KEYWORDS: &[&str] = &[
        "if", "for", "while", "switch", "catch", "return", "function", "typeof", "await",
        "console", "require", "import", "super", "constructor", "new",
    ];

    let import_source_of: HashMap<&str, &str> = build_import_sources(source);
    let local_symbols: Vec<&str> = extraction.symbols.iter().map(|s| s.name.as_str()).collect();

    let lines: Vec<&str> = source.lines().collect();
    let mut edges = Vec::new();
    for symbol in &extraction.symbols {
        let body = lines[symbol.start_line - 1..symbol.end_line.min(lines.len())].join("\n");
        for cap in ts_call().captures_iter(&body) {
            let callee = cap.get(1).map(|m| m.as_str()).unwrap_or("");
            if callee.is_empty() || callee == symbol.name || KEYWORDS.contains(&callee) {
                continue;
            }
            let import_source = import_source_of.get(callee).map(|s| s.to_string());
            if import_source.is_none() && !local_symbols.contains(&callee) {
                continue;
            }
            let edge = FileCallEdge {
                caller: symbol.name.clone(),
                callee: callee.to_string(),
                import_source,
            };
            if !edges.contains(&edge) {
                edges.push(edge);
            }
        }
    }
    edges
}

fn build_import_sources(source: &str) -> HashMap<&str, &str> {
    let mut map = HashMap::new();
    for cap in ts_import().captures_iter(source) {
        let Some(spec) = cap.get(3) else { continue };
        for group in [cap.get(1), cap.get(2)].into_iter().flatten() {
            let mut names = Vec::new();
            collect_binding_names(group.as_str(), &mut names);
            for name in names {
                if let Some(found) = find_substr(source, &name) {
                    map.insert(found, spec.as_str());
                }
            }
        }
    }
    map
}

/// Borrow the name back out of the source so the map can hold &str.
fn find_substr<'a>(source: &'a str, name: &str) -> Option<&'a str> {
    source.find(name).map(|idx| &source[idx..idx + name.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS_SOURCE: &str = r#"import { readFile, writeFile as wf } from "./fs-utils";
import * as path from "path";
import Default from "./default-mod";

export function loadConfig(dir: string) {
  const text = readFile(path.join(dir, "config.json"));
  return parseConfig(text);
}

function parseConfig(text: string) {
  if (!text) {
    return {};
  }
  return JSON.parse(text);
}

export const VERSION = "1.0";
"#;

    #[test]
    fn ts_imports_and_bindings() {
        let e = extract(TS_SOURCE, "src/config.ts");
        assert_eq!(e.imports, vec!["./fs-utils", "path", "./default-mod"]);
        assert!(e.imported_names.contains(&"readFile".to_string()));
        assert!(e.imported_names.contains(&"wf".to_string()));
        assert!(e.imported_names.contains(&"path".to_string()));
        assert!(e.imported_names.contains(&"Default".to_string()));
        assert_eq!(e.namespace_members, vec!["join".to_string()]);
    }

    #[test]
    fn ts_exports_with_kinds() {
        let e = extract(TS_SOURCE, "src/config.ts");
        let names: Vec<&str> = e.exports.iter().map(|x| x.name.as_str()).collect();
        assert_eq!(names, vec!["loadConfig", "VERSION"]);
        assert_eq!(e.exports[0].kind, ExportKind::Function);
        assert_eq!(e.exports[1].kind, ExportKind::Variable);
    }

    #[test]
    fn ts_symbols_cover_the_file() {
        let e = extract(TS_SOURCE, "src/config.ts");
        let names: Vec<&str> = e.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["loadConfig", "parseConfig", "VERSION"]);
        assert!(e.symbols[0].start_line < e.symbols[1].start_line);
        assert!(e.symbols[0].end_line < e.symbols[1].start_line);
    }

    #[test]
    fn ts_call_edges_resolve_imports() {
        let e = extract(TS_SOURCE, "src/config.ts");
        let read_edge = e
            .call_edges
            .iter()
            .find(|c| c.callee == "readFile")
            .expect("readFile edge");
        assert_eq!(read_edge.caller, "loadConfig");
        assert_eq!(read_edge.import_source.as_deref(), Some("./fs-utils"));

        let local_edge = e
            .call_edges
            .iter()
            .find(|c| c.callee == "parseConfig")
            .expect("local edge");
        assert_eq!(local_edge.caller, "loadConfig");
        assert!(local_edge.import_source.is_none());
    }

    #[test]
    fn complexity_counts_branches() {
        let flat = extract("export function a() { return 1; }", "a.ts");
        let branchy = extract(
            "export function a(x) { if (x) { for (;;) {} } else if (y) {} return x && y; }",
            "a.ts",
        );
        assert!(branchy.complexity > flat.complexity);
        assert_eq!(flat.complexity, 1);
    }

    #[test]
    fn rust_extraction() {
        let src = "use std::fmt::Display;\n\npub fn run() {}\n\npub struct Engine { x: i64 }\n";
        let e = extract(src, "src/lib.rs");
        assert_eq!(e.imports, vec!["std::fmt::Display"]);
        let names: Vec<&str> = e.exports.iter().map(|x| x.name.as_str()).collect();
        assert_eq!(names, vec!["run", "Engine"]);
        let syms: Vec<&str> = e.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(syms, vec!["run", "Engine"]);
    }

    #[test]
    fn python_extraction() {
        let src = "from os import path\nimport json\n\ndef load():\n    pass\n\nclass Store:\n    pass\n";
        let e = extract(src, "store.py");
        assert_eq!(e.imports, vec!["os", "json"]);
        let syms: Vec<&str> = e.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(syms, vec!["load", "Store"]);
    }
}
