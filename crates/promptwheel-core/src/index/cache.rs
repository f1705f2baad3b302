//! Per-file AST cache keyed by (mtime, size). Entries carry everything
//! the index needs so a warm build never re-reads unchanged sources.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::SymbolRange;

/// Bump when the pattern-finding extractors change shape; entries with an
/// older version re-run findings only, keeping the rest of the entry.
pub const FINDINGS_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportKind {
    Function,
    Class,
    Type,
    Interface,
    Enum,
    Variable,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    pub name: String,
    pub kind: ExportKind,
}

/// A call edge extracted from one file. `import_source` is the specifier
/// the callee was imported from, when the extractor could tell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCallEdge {
    pub caller: String,
    pub callee: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_source: Option<String>,
}

/// A pattern finding (TODO density, long function, etc.) with its own
/// version so finding extractors can be re-run without a full reparse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub pattern: String,
    pub message: String,
    pub line: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheEntry {
    pub mtime: i64,
    pub size: u64,
    pub imports: Vec<String>,
    pub exports: Vec<ExportEntry>,
    pub complexity: u32,
    pub symbols: Vec<SymbolRange>,
    pub call_edges: Vec<FileCallEdge>,
    pub imported_names: Vec<String>,
    pub namespace_members: Vec<String>,
    pub findings: Vec<Finding>,
    pub findings_version: u32,
    pub pattern_versions: HashMap<String, u32>,
}

/// The on-disk cache: relative path → entry. Owned by the process,
/// loaded once, saved atomically on demand.
#[derive(Debug)]
pub struct AstCache {
    path: PathBuf,
    entries: HashMap<String, CacheEntry>,
}

impl AstCache {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default();
        Self { path, entries }
    }

    /// A hit requires both mtime and size to match.
    pub fn lookup(&self, rel_path: &str, mtime: i64, size: u64) -> Option<&CacheEntry> {
        self.entries
            .get(rel_path)
            .filter(|e| e.mtime == mtime && e.size == size)
    }

    pub fn insert(&mut self, rel_path: String, entry: CacheEntry) {
        self.entries.insert(rel_path, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Save atomically, pruning entries whose paths are not in
    /// `live_paths` (files deleted since the last build).
    pub fn save(&mut self, live_paths: &[String]) -> Result<()> {
        let live: std::collections::HashSet<&String> = live_paths.iter().collect();
        self.entries.retain(|path, _| live.contains(path));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string(&self.entries).context("serialize ast cache")?;
        std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }
}

/// (mtime millis, size) of a file, used both as the cache key and for
/// the index's structural-change sampling.
pub fn file_stamp(path: &Path) -> Option<(i64, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_millis() as i64;
    Some((mtime, meta.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mtime: i64, size: u64) -> CacheEntry {
        CacheEntry { mtime, size, complexity: 3, findings_version: FINDINGS_VERSION, ..Default::default() }
    }

    #[test]
    fn lookup_requires_matching_stamp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cache = AstCache::load(dir.path().join("ast-cache.json"));
        cache.insert("src/a.rs".into(), entry(100, 50));

        assert!(cache.lookup("src/a.rs", 100, 50).is_some());
        assert!(cache.lookup("src/a.rs", 101, 50).is_none());
        assert!(cache.lookup("src/a.rs", 100, 51).is_none());
        assert!(cache.lookup("src/b.rs", 100, 50).is_none());
    }

    #[test]
    fn save_then_load_round_trips_and_prunes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ast-cache.json");

        let mut cache = AstCache::load(&path);
        cache.insert("src/a.rs".into(), entry(100, 50));
        cache.insert("src/gone.rs".into(), entry(200, 60));
        cache.save(&["src/a.rs".to_string()]).expect("save");

        let reloaded = AstCache::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.lookup("src/a.rs", 100, 50).is_some());
        assert!(reloaded.lookup("src/gone.rs", 200, 60).is_none());
    }
}
