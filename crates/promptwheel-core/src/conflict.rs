//! Pairwise proposal conflict detection.
//!
//! Two proposals conflict when running their agents in the same wave could
//! make the structural merge unresolvable. Checks run in a fixed order and
//! the first hit wins; all checks are symmetric in (a, b).

use std::collections::{HashMap, HashSet};

use crate::paths::{glob_base, normalize};
use crate::types::Proposal;

/// Filenames whose edits tend to collide regardless of symbol data.
pub const CONFLICT_PRONE_FILENAMES: &[&str] = &[
    "index.ts",
    "index.tsx",
    "index.js",
    "mod.rs",
    "lib.rs",
    "main.rs",
    "__init__.py",
    "package.json",
    "Cargo.toml",
    "go.mod",
    "pyproject.toml",
    "tsconfig.json",
    ".eslintrc.json",
    "webpack.config.js",
    "vite.config.ts",
];

/// Directory names that hold shared code; co-editing under them is risky.
pub const SHARED_DIRECTORY_PATTERNS: &[&str] =
    &["shared", "common", "utils", "util", "helpers", "core", "lib"];

/// Monorepo package roots: `<prefix>/<name>` is one package.
pub const PACKAGE_PATTERN: &[&str] = &["packages", "apps", "libs", "modules"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    Strict,
    Normal,
    Relaxed,
}

/// A resolved cross-file call edge: `caller` symbol invokes `callee` symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEdge {
    pub caller: String,
    pub callee: String,
}

/// Graph context fed from the codebase index; all optional — without it
/// the detector falls back to pure path reasoning.
#[derive(Debug, Clone, Default)]
pub struct ConflictContext {
    /// module path → module paths it imports.
    pub dependency_edges: HashMap<String, Vec<String>>,
    pub call_edges: Vec<CallEdge>,
}

#[derive(Debug, Clone)]
pub struct ConflictOptions {
    pub sensitivity: Sensitivity,
    pub context: ConflictContext,
}

impl Default for ConflictOptions {
    fn default() -> Self {
        Self { sensitivity: Sensitivity::Normal, context: ConflictContext::default() }
    }
}

impl ConflictOptions {
    pub fn with_sensitivity(sensitivity: Sensitivity) -> Self {
        Self { sensitivity, context: ConflictContext::default() }
    }
}

/// Decide whether `a` and `b` can run in the same wave.
pub fn proposals_conflict(a: &Proposal, b: &Proposal, opts: &ConflictOptions) -> bool {
    let files_a = effective_files(a);
    let files_b = effective_files(b);

    // 1. Direct path overlap, unless disjoint target symbols prove the
    //    edits touch different code in the shared file.
    if paths_overlap(&files_a, &files_b) && !symbols_disjoint(a, b) {
        return true;
    }

    if opts.sensitivity == Sensitivity::Relaxed {
        return false;
    }

    // 2. Sibling files in the same directory.
    if let Some(conflict) = sibling_conflict(a, b, &files_a, &files_b, opts.sensitivity) {
        if conflict {
            return true;
        }
        // Disjoint-symbol same-category siblings fall through to the
        // remaining structural checks rather than returning early.
    }

    // 3. Directory-set overlap above the sensitivity threshold.
    let threshold = match opts.sensitivity {
        Sensitivity::Strict => 0.2,
        _ => 0.3,
    };
    if directory_overlap_ratio(&files_a, &files_b) > threshold {
        return true;
    }

    // 4. Import chain between the proposals' modules.
    if import_chain_conflict(&files_a, &files_b, &opts.context.dependency_edges) {
        return true;
    }

    // 5. Call-graph connection between target symbols.
    if call_graph_conflict(a, b, &opts.context.call_edges) {
        return true;
    }

    if opts.sensitivity == Sensitivity::Strict {
        // 6. Same monorepo package.
        if same_package(&files_a, &files_b) {
            return true;
        }
        // 7. Shared-code parent directory.
        if shared_parent_conflict(&files_a, &files_b) {
            return true;
        }
    }

    false
}

fn effective_files(p: &Proposal) -> Vec<String> {
    let mut out: Vec<String> = p.files.iter().map(|f| normalize(f)).collect();
    if out.is_empty() {
        out = p.allowed_paths.iter().map(|a| glob_base(a)).filter(|b| !b.is_empty()).collect();
    }
    out
}

fn symbols_disjoint(a: &Proposal, b: &Proposal) -> bool {
    match (&a.target_symbols, &b.target_symbols) {
        (Some(sa), Some(sb)) if !sa.is_empty() && !sb.is_empty() => {
            let set: HashSet<&String> = sa.iter().collect();
            !sb.iter().any(|s| set.contains(s))
        }
        _ => false,
    }
}

fn paths_overlap(files_a: &[String], files_b: &[String]) -> bool {
    for fa in files_a {
        for fb in files_b {
            if fa == fb
                || fa.starts_with(&format!("{fb}/"))
                || fb.starts_with(&format!("{fa}/"))
            {
                return true;
            }
        }
    }
    false
}

/// Returns Some(true) when the sibling rule fires, Some(false) when the
/// pair is same-category with provably disjoint symbols (evaluation must
/// continue), None when no sibling relationship exists at all.
fn sibling_conflict(
    a: &Proposal,
    b: &Proposal,
    files_a: &[String],
    files_b: &[String],
    sensitivity: Sensitivity,
) -> Option<bool> {
    let mut found_sibling = false;
    for fa in files_a {
        for fb in files_b {
            if fa == fb || parent(fa) != parent(fb) || parent(fa).is_empty() {
                continue;
            }
            found_sibling = true;
            if sensitivity == Sensitivity::Strict {
                return Some(true);
            }
            if is_conflict_prone(fa) || is_conflict_prone(fb) {
                return Some(true);
            }
        }
    }
    if !found_sibling {
        return None;
    }
    if a.category == b.category {
        if symbols_disjoint(a, b) {
            return Some(false);
        }
        // Same category with overlapping symbols or no symbol data at all.
        return Some(true);
    }
    Some(false)
}

fn is_conflict_prone(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    CONFLICT_PRONE_FILENAMES.contains(&name)
        || name.starts_with("index.")
        || name.starts_with("mod.")
}

fn directories(files: &[String]) -> HashSet<String> {
    files.iter().map(|f| parent(f)).filter(|d| !d.is_empty()).collect()
}

fn directory_overlap_ratio(files_a: &[String], files_b: &[String]) -> f64 {
    let da = directories(files_a);
    let db = directories(files_b);
    // Singleton sets are the sibling rule's territory; a ratio over them
    // would always be 0 or 1 and the threshold would mean nothing.
    if da.len() < 2 || db.len() < 2 {
        return 0.0;
    }
    let shared = da.intersection(&db).count();
    shared as f64 / da.len().min(db.len()) as f64
}

fn import_chain_conflict(
    files_a: &[String],
    files_b: &[String],
    edges: &HashMap<String, Vec<String>>,
) -> bool {
    if edges.is_empty() {
        return false;
    }
    let mods_a = directories(files_a);
    let mods_b = directories(files_b);
    for ma in &mods_a {
        if let Some(imports) = edges.get(ma) {
            if imports.iter().any(|i| mods_b.contains(i)) {
                return true;
            }
        }
    }
    for mb in &mods_b {
        if let Some(imports) = edges.get(mb) {
            if imports.iter().any(|i| mods_a.contains(i)) {
                return true;
            }
        }
    }
    false
}

fn call_graph_conflict(a: &Proposal, b: &Proposal, edges: &[CallEdge]) -> bool {
    let (Some(sa), Some(sb)) = (&a.target_symbols, &b.target_symbols) else {
        return false;
    };
    let set_a: HashSet<&String> = sa.iter().collect();
    let set_b: HashSet<&String> = sb.iter().collect();
    edges.iter().any(|e| {
        (set_a.contains(&e.caller) && set_b.contains(&e.callee))
            || (set_b.contains(&e.caller) && set_a.contains(&e.callee))
    })
}

fn package_of(path: &str) -> Option<String> {
    let mut segs = path.split('/');
    let first = segs.next()?;
    if PACKAGE_PATTERN.contains(&first) {
        let name = segs.next()?;
        return Some(format!("{first}/{name}"));
    }
    None
}

fn same_package(files_a: &[String], files_b: &[String]) -> bool {
    let pkgs_a: HashSet<String> = files_a.iter().filter_map(|f| package_of(f)).collect();
    if pkgs_a.is_empty() {
        return false;
    }
    files_b.iter().filter_map(|f| package_of(f)).any(|p| pkgs_a.contains(&p))
}

fn shared_parent_conflict(files_a: &[String], files_b: &[String]) -> bool {
    let da = directories(files_a);
    let db = directories(files_b);
    da.intersection(&db).any(|d| {
        d.split('/').any(|seg| SHARED_DIRECTORY_PATTERNS.contains(&seg))
    })
}

fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Risk;

    fn proposal(files: &[&str], category: &str, symbols: Option<&[&str]>) -> Proposal {
        Proposal {
            category: category.into(),
            title: format!("touch {}", files.join(",")),
            description: String::new(),
            acceptance_criteria: vec![],
            verification_commands: vec!["true".into()],
            allowed_paths: files.iter().map(|f| f.to_string()).collect(),
            files: files.iter().map(|f| f.to_string()).collect(),
            confidence: 80.0,
            impact_score: 5.0,
            rationale: String::new(),
            estimated_complexity: "moderate".into(),
            risk: Risk::Low,
            touched_files_estimate: files.len() as i64,
            rollback_note: "revert".into(),
            target_symbols: symbols.map(|s| s.iter().map(|x| x.to_string()).collect()),
        }
    }

    #[test]
    fn same_file_conflicts() {
        let a = proposal(&["src/utils.ts"], "fix", None);
        let b = proposal(&["src/utils.ts"], "refactor", None);
        let opts = ConflictOptions::default();
        assert!(proposals_conflict(&a, &b, &opts));
        assert!(proposals_conflict(&b, &a, &opts));
    }

    #[test]
    fn same_file_disjoint_symbols_escapes() {
        let a = proposal(&["src/utils.ts"], "fix", Some(&["foo"]));
        let b = proposal(&["src/utils.ts"], "fix", Some(&["bar"]));
        let opts = ConflictOptions::default();
        assert!(!proposals_conflict(&a, &b, &opts));
    }

    #[test]
    fn same_file_overlapping_symbols_conflicts() {
        let a = proposal(&["src/utils.ts"], "fix", Some(&["foo", "baz"]));
        let b = proposal(&["src/utils.ts"], "fix", Some(&["baz"]));
        assert!(proposals_conflict(&a, &b, &ConflictOptions::default()));
    }

    #[test]
    fn relaxed_stops_after_path_overlap() {
        let a = proposal(&["src/a.ts"], "fix", None);
        let b = proposal(&["src/b.ts"], "fix", None);
        let opts = ConflictOptions::with_sensitivity(Sensitivity::Relaxed);
        assert!(!proposals_conflict(&a, &b, &opts));
    }

    #[test]
    fn strict_treats_siblings_as_conflict() {
        let a = proposal(&["src/a.ts"], "fix", None);
        let b = proposal(&["src/b.ts"], "refactor", None);
        let opts = ConflictOptions::with_sensitivity(Sensitivity::Strict);
        assert!(proposals_conflict(&a, &b, &opts));
    }

    #[test]
    fn sibling_conflict_prone_filename() {
        let a = proposal(&["src/index.ts"], "fix", None);
        let b = proposal(&["src/other.ts"], "refactor", None);
        assert!(proposals_conflict(&a, &b, &ConflictOptions::default()));
    }

    #[test]
    fn sibling_same_category_no_symbols_conflicts() {
        let a = proposal(&["src/a.ts"], "fix", None);
        let b = proposal(&["src/b.ts"], "fix", None);
        assert!(proposals_conflict(&a, &b, &ConflictOptions::default()));
    }

    #[test]
    fn sibling_same_category_disjoint_symbols_does_not_conflict() {
        let a = proposal(&["src/a.ts"], "fix", Some(&["foo"]));
        let b = proposal(&["src/b.ts"], "fix", Some(&["bar"]));
        assert!(!proposals_conflict(&a, &b, &ConflictOptions::default()));
    }

    #[test]
    fn sibling_different_category_does_not_conflict_at_normal() {
        let a = proposal(&["src/a.ts"], "fix", None);
        let b = proposal(&["src/b.ts"], "docs", None);
        assert!(!proposals_conflict(&a, &b, &ConflictOptions::default()));
    }

    #[test]
    fn import_chain_fires_at_normal() {
        let a = proposal(&["src/api/handler.ts"], "fix", None);
        let b = proposal(&["src/db/query.ts"], "refactor", None);
        let mut opts = ConflictOptions::default();
        opts.context
            .dependency_edges
            .insert("src/api".into(), vec!["src/db".into()]);
        assert!(proposals_conflict(&a, &b, &opts));
        assert!(proposals_conflict(&b, &a, &opts));
    }

    #[test]
    fn call_graph_connection_fires() {
        let a = proposal(&["src/api/handler.ts"], "fix", Some(&["handleRequest"]));
        let b = proposal(&["src/db/query.ts"], "perf", Some(&["runQuery"]));
        let mut opts = ConflictOptions::default();
        opts.context.call_edges.push(CallEdge {
            caller: "handleRequest".into(),
            callee: "runQuery".into(),
        });
        assert!(proposals_conflict(&a, &b, &opts));
        assert!(proposals_conflict(&b, &a, &opts));
    }

    #[test]
    fn directory_set_overlap_above_threshold() {
        let a = proposal(&["src/api/a.ts", "src/db/b.ts", "src/ui/c.ts"], "fix", None);
        let b = proposal(&["src/api/x.ts", "src/db/y.ts", "src/cli/z.ts"], "perf", None);
        // 2 shared dirs / min(3,3) = 0.66 > 0.3.
        assert!(proposals_conflict(&a, &b, &ConflictOptions::default()));
    }

    #[test]
    fn same_package_is_strict_only() {
        let a = proposal(&["packages/web/src/a.ts"], "fix", None);
        let b = proposal(&["packages/web/lib/b.ts"], "docs", None);
        assert!(!proposals_conflict(&a, &b, &ConflictOptions::default()));
        let strict = ConflictOptions::with_sensitivity(Sensitivity::Strict);
        assert!(proposals_conflict(&a, &b, &strict));
    }
}
