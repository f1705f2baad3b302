//! Codebase index: a per-module summary of files, imports, exports,
//! symbols, call edges, and graph health, fed to both the wave scheduler
//! and scout prompt assembly. Warm builds reuse the AST cache; staleness
//! is decided by re-sampling the mtimes recorded at build time.

pub mod cache;
pub mod extract;
pub mod format;
pub mod graph;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::paths::normalize;
use crate::types::SymbolRange;
use cache::{file_stamp, AstCache, CacheEntry, ExportEntry, ExportKind, FileCallEdge, FINDINGS_VERSION};
use graph::{DeadExport, GraphMetrics, ModuleShape, StructuralIssue, UsageSets};

/// Directories and files never indexed.
const INDEX_DENYLIST: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    "coverage",
    "target",
    "vendor",
    ".promptwheel",
];

const LOCKFILES: &[&str] = &["package-lock.json", "yarn.lock", "pnpm-lock.yaml", "Cargo.lock"];

const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs", "rs", "py"];

/// Default cap on files per sector-scoped build.
pub const DEFAULT_MAX_FILES: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub path: String,
    pub file_count: usize,
    pub production_file_count: usize,
    /// Cheap tag from the directory name: api, storage, test, ui, ...
    pub purpose: String,
    pub import_specifiers: Vec<String>,
    pub exports: Vec<ExportEntry>,
    pub complexity: u32,
    /// file → its top-level symbol ranges.
    pub symbol_ranges: BTreeMap<String, Vec<SymbolRange>>,
    pub call_edges: Vec<FileCallEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodebaseIndex {
    pub built_at: DateTime<Utc>,
    pub modules: BTreeMap<String, ModuleEntry>,
    /// module → modules it imports.
    pub dependency_edges: BTreeMap<String, Vec<String>>,
    pub reverse_edges: BTreeMap<String, Vec<String>>,
    pub dependency_cycles: Vec<Vec<String>>,
    pub entrypoints: Vec<String>,
    /// Files sampled at build time; used by `has_structural_changes`.
    pub sampled_file_mtimes: HashMap<String, (i64, u64)>,
    pub structural_issues: Vec<StructuralIssue>,
    pub dead_exports: Vec<DeadExport>,
    pub graph_metrics: BTreeMap<String, GraphMetrics>,
    /// Populated when a type-aware secondary analyzer ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typescript_analysis: Option<serde_json::Value>,
}

impl CodebaseIndex {
    /// Flat symbol map (file → ranges) for conflict detection and merges.
    pub fn symbol_map(&self) -> HashMap<String, Vec<SymbolRange>> {
        let mut out = HashMap::new();
        for module in self.modules.values() {
            for (file, ranges) in &module.symbol_ranges {
                out.insert(file.clone(), ranges.clone());
            }
        }
        out
    }

    /// Cross-file call edges fused from the regex extractor and any
    /// secondary analyzer: only edges whose callee resolves outside the
    /// caller's file.
    pub fn fused_call_edges(&self) -> Vec<FileCallEdge> {
        let mut out = Vec::new();
        for module in self.modules.values() {
            for edge in &module.call_edges {
                if edge.import_source.is_some() && !out.contains(edge) {
                    out.push(edge.clone());
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Restrict the walk to this subtree (sector scoping).
    pub include: Option<String>,
    /// File cap; defaults to `DEFAULT_MAX_FILES`.
    pub max_files: Option<usize>,
    /// Type-resolved call edges from a secondary analyzer. Method calls
    /// should already be reduced to their final identifier segment.
    pub extra_call_edges: Vec<FileCallEdge>,
}

/// Build the index for `root`, reusing `ast_cache` entries whose
/// (mtime, size) stamps still match.
pub fn build_index(root: &Path, options: &BuildOptions, ast_cache: &mut AstCache) -> Result<CodebaseIndex> {
    let max_files = options.max_files.unwrap_or(DEFAULT_MAX_FILES);
    let files = enumerate_source_files(root, options.include.as_deref(), max_files);

    let mut sampled: HashMap<String, (i64, u64)> = HashMap::new();
    let mut per_file: BTreeMap<String, CacheEntry> = BTreeMap::new();

    for rel in &files {
        let abs = root.join(rel);
        let Some((mtime, size)) = file_stamp(&abs) else { continue };
        sampled.insert(rel.clone(), (mtime, size));

        let entry = match ast_cache.lookup(rel, mtime, size) {
            Some(hit) => hit.clone(),
            None => {
                let source = std::fs::read_to_string(&abs).unwrap_or_default();
                let ex = extract::extract(&source, rel);
                let entry = CacheEntry {
                    mtime,
                    size,
                    imports: ex.imports,
                    exports: ex.exports,
                    complexity: ex.complexity,
                    symbols: ex.symbols,
                    call_edges: ex.call_edges,
                    imported_names: ex.imported_names,
                    namespace_members: ex.namespace_members,
                    findings: Vec::new(),
                    findings_version: FINDINGS_VERSION,
                    pattern_versions: HashMap::new(),
                };
                ast_cache.insert(rel.clone(), entry.clone());
                entry
            }
        };
        per_file.insert(rel.clone(), entry);
    }

    // Modules are parent directories.
    let mut modules: BTreeMap<String, ModuleEntry> = BTreeMap::new();
    for (rel, entry) in &per_file {
        let module_path = parent_dir(rel);
        let module = modules.entry(module_path.clone()).or_insert_with(|| ModuleEntry {
            path: module_path.clone(),
            file_count: 0,
            production_file_count: 0,
            purpose: purpose_tag(&module_path),
            import_specifiers: Vec::new(),
            exports: Vec::new(),
            complexity: 0,
            symbol_ranges: BTreeMap::new(),
            call_edges: Vec::new(),
        });
        module.file_count += 1;
        if !is_test_file(rel) {
            module.production_file_count += 1;
        }
        for import in &entry.imports {
            if !module.import_specifiers.contains(import) {
                module.import_specifiers.push(import.clone());
            }
        }
        module.exports.extend(entry.exports.iter().cloned());
        module.complexity += entry.complexity;
        if !entry.symbols.is_empty() {
            module.symbol_ranges.insert(rel.clone(), entry.symbols.clone());
        }
        module.call_edges.extend(entry.call_edges.iter().cloned());
    }

    // Dependency edges: resolve import specifiers to module paths by
    // longest-prefix match over the known module set.
    let module_paths: Vec<String> = modules.keys().cloned().collect();
    let mut dependency_edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (rel, entry) in &per_file {
        let from = parent_dir(rel);
        let targets = dependency_edges.entry(from.clone()).or_default();
        for import in &entry.imports {
            if let Some(target) = resolve_import(rel, import, &module_paths) {
                if target != from && !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
    }
    for module in modules.keys() {
        dependency_edges.entry(module.clone()).or_default();
    }

    let reverse = graph::reverse_edges(&dependency_edges);
    let cycles = graph::detect_cycles(&dependency_edges);
    let metrics = graph::compute_metrics(&dependency_edges, &reverse);

    let entrypoints = detect_entrypoints(&per_file);

    // Fused usage sets for dead-export detection.
    let mut usage = UsageSets {
        imported_names: HashSet::new(),
        called_names: HashSet::new(),
        namespace_members: HashSet::new(),
    };
    for entry in per_file.values() {
        usage.imported_names.extend(entry.imported_names.iter().cloned());
        usage.namespace_members.extend(entry.namespace_members.iter().cloned());
        for edge in &entry.call_edges {
            if edge.import_source.is_some() {
                usage.called_names.insert(final_segment(&edge.callee));
            }
        }
    }
    for edge in &options.extra_call_edges {
        usage.called_names.insert(final_segment(&edge.callee));
    }

    let module_exports: BTreeMap<String, Vec<(String, bool)>> = modules
        .iter()
        .map(|(path, m)| {
            let exports = m
                .exports
                .iter()
                .map(|e| {
                    let type_only = matches!(e.kind, ExportKind::Type | ExportKind::Interface);
                    (e.name.clone(), type_only)
                })
                .collect();
            (path.clone(), exports)
        })
        .collect();
    let dead_exports = graph::detect_dead_exports(&module_exports, &reverse, &usage);

    let shapes: BTreeMap<String, ModuleShape> = modules
        .iter()
        .map(|(path, m)| {
            (
                path.clone(),
                ModuleShape {
                    file_count: m.file_count,
                    export_count: m.exports.len(),
                    is_entrypoint: entrypoints.iter().any(|e| parent_dir(e) == *path),
                },
            )
        })
        .collect();
    let structural_issues = graph::detect_structural_issues(&shapes, &metrics);

    let mut index = CodebaseIndex {
        built_at: Utc::now(),
        modules,
        dependency_edges,
        reverse_edges: reverse,
        dependency_cycles: cycles,
        entrypoints,
        sampled_file_mtimes: sampled,
        structural_issues,
        dead_exports,
        graph_metrics: metrics,
        typescript_analysis: None,
    };

    // Merge secondary-analyzer edges into the owning modules.
    for edge in &options.extra_call_edges {
        let reduced = FileCallEdge {
            caller: edge.caller.clone(),
            callee: final_segment(&edge.callee),
            import_source: edge.import_source.clone(),
        };
        for module in index.modules.values_mut() {
            if module
                .symbol_ranges
                .values()
                .flatten()
                .any(|s| s.name == reduced.caller)
                && !module_has_edge(module, &reduced)
            {
                module.call_edges.push(reduced.clone());
                break;
            }
        }
    }

    debug!(
        files = per_file.len(),
        modules = index.modules.len(),
        cycles = index.dependency_cycles.len(),
        "codebase index built"
    );
    Ok(index)
}

fn module_has_edge(module: &ModuleEntry, edge: &FileCallEdge) -> bool {
    module.call_edges.contains(edge)
}

/// Re-sample the mtimes recorded at build time. Any difference or missing
/// file means the index must be rebuilt.
pub fn has_structural_changes(index: &CodebaseIndex, root: &Path) -> bool {
    for (rel, stamp) in &index.sampled_file_mtimes {
        match file_stamp(&root.join(rel)) {
            Some(current) if current == *stamp => {}
            _ => return true,
        }
    }
    false
}

// ── Walker ───────────────────────────────────────────────────────────────

fn enumerate_source_files(root: &Path, include: Option<&str>, max_files: usize) -> Vec<String> {
    let mut out = Vec::new();
    let start = match include {
        Some(sub) => root.join(sub),
        None => root.to_path_buf(),
    };
    let mut stack: Vec<PathBuf> = vec![start];
    while let Some(dir) = stack.pop() {
        if out.len() >= max_files {
            break;
        }
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        let mut children: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        children.sort();
        for child in children {
            if out.len() >= max_files {
                break;
            }
            let name = child
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if child.is_dir() {
                if name.starts_with('.') || INDEX_DENYLIST.contains(&name.as_str()) {
                    continue;
                }
                stack.push(child);
            } else if is_source_file(&name) {
                if let Ok(rel) = child.strip_prefix(root) {
                    out.push(normalize(&rel.to_string_lossy()));
                }
            }
        }
    }
    out.sort();
    out
}

fn is_source_file(name: &str) -> bool {
    if LOCKFILES.contains(&name) || name.ends_with(".min.js") || name.ends_with(".d.ts") {
        return false;
    }
    name.rsplit('.')
        .next()
        .map(|ext| SOURCE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

fn is_test_file(rel: &str) -> bool {
    let name = rel.rsplit('/').next().unwrap_or(rel);
    name.contains(".test.")
        || name.contains(".spec.")
        || name.starts_with("test_")
        || rel.split('/').any(|seg| seg == "__tests__" || seg == "tests")
}

fn parent_dir(rel: &str) -> String {
    match rel.rfind('/') {
        Some(idx) => rel[..idx].to_string(),
        None => ".".to_string(),
    }
}

fn final_segment(name: &str) -> String {
    name.rsplit('.').next().unwrap_or(name).to_string()
}

fn purpose_tag(module_path: &str) -> String {
    let last = module_path.rsplit('/').next().unwrap_or(module_path);
    match last {
        "api" | "routes" | "handlers" | "controllers" => "api",
        "db" | "storage" | "store" | "models" | "persistence" => "storage",
        "ui" | "components" | "views" | "pages" => "ui",
        "utils" | "util" | "helpers" | "shared" | "common" => "shared",
        "tests" | "__tests__" | "test" => "test",
        "config" | "settings" => "config",
        "." => "root",
        _ => "core",
    }
    .to_string()
}

/// Entrypoints: conventional top-of-tree program roots.
fn detect_entrypoints(per_file: &BTreeMap<String, CacheEntry>) -> Vec<String> {
    const ENTRY_NAMES: &[&str] = &[
        "main.ts", "main.js", "index.ts", "index.js", "app.ts", "cli.ts", "main.rs", "lib.rs",
        "main.py", "__main__.py",
    ];
    per_file
        .keys()
        .filter(|rel| {
            let name = rel.rsplit('/').next().unwrap_or(rel);
            ENTRY_NAMES.contains(&name) && rel.matches('/').count() <= 2
        })
        .cloned()
        .collect()
}

/// Resolve an import specifier to a module path: relative specifiers are
/// joined against the importing file's directory, then matched by longest
/// prefix against the known module paths.
fn resolve_import(from_file: &str, specifier: &str, module_paths: &[String]) -> Option<String> {
    let candidate = if specifier.starts_with('.') {
        join_relative(&parent_dir(from_file), specifier)?
    } else {
        specifier.replace("::", "/")
    };

    module_paths
        .iter()
        .filter(|m| {
            candidate == **m
                || candidate.starts_with(&format!("{m}/"))
                || m.ends_with(&format!("/{candidate}"))
        })
        .max_by_key(|m| m.len())
        .cloned()
}

fn join_relative(base: &str, spec: &str) -> Option<String> {
    let mut segments: Vec<&str> = if base == "." { Vec::new() } else { base.split('/').collect() };
    for part in spec.split('/') {
        match part {
            "." | "" => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}
