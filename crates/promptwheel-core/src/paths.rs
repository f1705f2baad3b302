//! Path normalization and the limited glob dialect used by scope policies
//! and the conflict detector: `*` matches one path segment, `**` any depth.

use std::collections::HashMap;
use std::path::Path;

/// Normalize a path for comparison: forward slashes, no leading `./`,
/// no trailing slash, collapsed duplicate separators.
pub fn normalize(path: &str) -> String {
    let mut p = path.replace('\\', "/");
    while p.starts_with("./") {
        p = p[2..].to_string();
    }
    while p.contains("//") {
        p = p.replace("//", "/");
    }
    if p.len() > 1 {
        p = p.trim_end_matches('/').to_string();
    }
    p
}

/// True when `pattern` matches `path`. A pattern is an exact path, a
/// directory prefix (matches the directory itself and anything under it),
/// or a limited glob.
pub fn matches(path: &str, pattern: &str) -> bool {
    let path = normalize(path);
    let pattern = normalize(pattern);

    if pattern.is_empty() {
        return false;
    }
    if !pattern.contains('*') {
        return path == pattern || path.starts_with(&format!("{pattern}/"));
    }
    glob_match(&path, &pattern)
}

fn glob_match(path: &str, pattern: &str) -> bool {
    let path_segs: Vec<&str> = path.split('/').collect();
    let pat_segs: Vec<&str> = pattern.split('/').collect();
    match_segments(&path_segs, &pat_segs)
}

fn match_segments(path: &[&str], pat: &[&str]) -> bool {
    match (pat.first(), path.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(&"**"), _) => {
            // `**` absorbs zero or more segments.
            if match_segments(path, &pat[1..]) {
                return true;
            }
            if path.is_empty() {
                return false;
            }
            match_segments(&path[1..], pat)
        }
        (Some(p), Some(s)) => segment_match(s, p) && match_segments(&path[1..], &pat[1..]),
        (Some(_), None) => false,
    }
}

/// Single-segment match where `*` spans any run of non-separator chars.
fn segment_match(seg: &str, pat: &str) -> bool {
    if !pat.contains('*') {
        return seg == pat;
    }
    let parts: Vec<&str> = pat.split('*').collect();
    let mut rest = seg;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(idx) => {
                // The first literal part must anchor at the start.
                if i == 0 && idx != 0 {
                    return false;
                }
                rest = &rest[idx + part.len()..];
            }
            None => return false,
        }
    }
    // The last literal part must anchor at the end.
    if let Some(last) = parts.last() {
        if !last.is_empty() && !seg.ends_with(last) {
            return false;
        }
    }
    true
}

/// The base of a glob pattern: everything before the first `*` segment.
pub fn glob_base(pattern: &str) -> String {
    let pattern = normalize(pattern);
    let mut base = Vec::new();
    for seg in pattern.split('/') {
        if seg.contains('*') {
            break;
        }
        base.push(seg);
    }
    base.join("/")
}

// ── Hallucinated path detection ──────────────────────────────────────────

/// True when the path's first segment is implausible for this repository:
/// it contains spaces, reads like an English sentence, or names no real
/// top-level directory (after stripping glob suffixes).
pub fn detect_hallucinated(path: &str, repo_root: &Path) -> bool {
    let p = normalize(path);
    let first = match p.split('/').next() {
        Some(s) if !s.is_empty() => s,
        _ => return true,
    };

    if first.contains(' ') {
        return true;
    }
    // Sentence-shaped: several capitalized words glued with separators is
    // fine, but a segment with 4+ hyphen/underscore-free words is not a
    // path segment — catch the common "the file that handles X" shape.
    let word_count = first.split(['-', '_', '.']).count();
    if word_count == 1 && first.len() > 40 {
        return true;
    }

    let stripped = first.trim_end_matches('*');
    if stripped.is_empty() {
        // Pure-glob first segment (`**/...`) can match anything real.
        return false;
    }

    // Files at the repo root (with an extension) are plausible as-is.
    if !p.contains('/') && first.contains('.') {
        return !repo_root.join(first).exists() && !looks_like_source_file(first);
    }

    match std::fs::read_dir(repo_root) {
        Ok(entries) => {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy() == stripped {
                    return false;
                }
            }
            true
        }
        // Unreadable root: give the path the benefit of the doubt.
        Err(_) => false,
    }
}

fn looks_like_source_file(name: &str) -> bool {
    const KNOWN: &[&str] = &[
        ".rs", ".ts", ".tsx", ".js", ".jsx", ".py", ".go", ".md", ".toml", ".json", ".yaml", ".yml",
    ];
    KNOWN.iter().any(|ext| name.ends_with(ext))
}

// ── Violation-cluster scope expansion ────────────────────────────────────

/// Minimum number of violations under one sibling directory before we
/// propose widening the scope to include it.
const EXPANSION_CLUSTER_MIN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeExpansion {
    pub new_allowed: Vec<String>,
    pub reason: String,
}

/// When several rejected writes cluster under a single sibling directory
/// of an already-allowed path, propose adding that directory to the
/// allowed set. Returns None when no cluster is large enough.
pub fn analyze_violations_for_expansion(
    violations: &[String],
    allowed: &[String],
) -> Option<ScopeExpansion> {
    let allowed_parents: Vec<String> = allowed
        .iter()
        .map(|a| parent_dir(&glob_base(a)))
        .filter(|p| !p.is_empty())
        .collect();

    let mut clusters: HashMap<String, usize> = HashMap::new();
    for v in violations {
        let v = normalize(v);
        let dir = parent_dir(&v);
        if dir.is_empty() {
            continue;
        }
        // A sibling shares a parent with some allowed path but is not
        // itself already allowed.
        let is_sibling = allowed_parents.iter().any(|ap| parent_dir(&dir) == *ap || dir.starts_with(&format!("{ap}/")));
        let already_allowed = allowed.iter().any(|a| matches(&v, a));
        if is_sibling && !already_allowed {
            *clusters.entry(dir).or_insert(0) += 1;
        }
    }

    let (dir, count) = clusters.into_iter().max_by_key(|(_, c)| *c)?;
    if count < EXPANSION_CLUSTER_MIN {
        return None;
    }

    let mut new_allowed: Vec<String> = allowed.to_vec();
    new_allowed.push(format!("{dir}/**"));
    Some(ScopeExpansion {
        new_allowed,
        reason: format!("{count} violations cluster under {dir}"),
    })
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_dot_and_trailing_slash() {
        assert_eq!(normalize("./src/lib.rs"), "src/lib.rs");
        assert_eq!(normalize("src/api/"), "src/api");
        assert_eq!(normalize("src//api"), "src/api");
    }

    #[test]
    fn exact_and_prefix_matching() {
        assert!(matches("src/lib.rs", "src/lib.rs"));
        assert!(matches("src/api/mod.rs", "src/api"));
        assert!(matches("src/api", "src/api"));
        assert!(!matches("src/api2/mod.rs", "src/api"));
    }

    #[test]
    fn single_star_is_one_segment() {
        assert!(matches("src/a.rs", "src/*.rs"));
        assert!(!matches("src/sub/a.rs", "src/*.rs"));
        assert!(matches("src/foo_test.rs", "src/*_test.rs"));
    }

    #[test]
    fn double_star_is_any_depth() {
        assert!(matches("src/a/b/c.rs", "src/**"));
        assert!(matches("src/a/b/c.rs", "src/**/c.rs"));
        assert!(matches("c.rs", "**/c.rs"));
        assert!(!matches("src/a/b/d.rs", "src/**/c.rs"));
    }

    #[test]
    fn glob_base_stops_at_first_star() {
        assert_eq!(glob_base("src/api/**/*.rs"), "src/api");
        assert_eq!(glob_base("src/lib.rs"), "src/lib.rs");
        assert_eq!(glob_base("**/x.rs"), "");
    }

    #[test]
    fn hallucinated_segments_with_spaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(detect_hallucinated("the main file/handler.ts", dir.path()));
    }

    #[test]
    fn real_top_level_dir_is_not_hallucinated() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("src")).expect("mkdir");
        assert!(!detect_hallucinated("src/whatever/deep.rs", dir.path()));
        assert!(detect_hallucinated("sruc/whatever.rs", dir.path()));
    }

    #[test]
    fn hallucination_check_ignores_glob_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("lib")).expect("mkdir");
        // Same verdict whether or not the pattern carries a star.
        assert_eq!(
            detect_hallucinated("lib/a.rs", dir.path()),
            detect_hallucinated("lib*/a.rs", dir.path())
        );
    }

    #[test]
    fn expansion_requires_cluster() {
        let allowed = vec!["src/api/**".to_string()];
        let few = vec!["src/util/a.rs".to_string()];
        assert!(analyze_violations_for_expansion(&few, &allowed).is_none());

        let many: Vec<String> = (0..4).map(|i| format!("src/util/f{i}.rs")).collect();
        let exp = analyze_violations_for_expansion(&many, &allowed).expect("expansion");
        assert!(exp.new_allowed.contains(&"src/util/**".to_string()));
        assert!(exp.reason.contains("src/util"));
    }
}
