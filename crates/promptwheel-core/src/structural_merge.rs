//! Symbol-range-aware three-way merge.
//!
//! A file is cut into alternating blocks: named top-level symbols and the
//! gaps between them. The merge resolves when every block was modified by
//! at most one side; any doubly-modified block or structural disagreement
//! bails out to "unresolved" and the caller falls back to git.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::SymbolRange;

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockLabel {
    Symbol(String),
    Gap,
}

#[derive(Debug, Clone)]
struct Block {
    label: BlockLabel,
    lines: Vec<String>,
}

/// Split content into symbol/gap blocks. Ranges are 1-based inclusive and
/// converted to 0-based for slicing. Overlapping or out-of-bounds ranges
/// return None.
fn split_blocks(content: &str, symbols: &[SymbolRange]) -> Option<Vec<Block>> {
    let lines: Vec<String> = content.lines().map(str::to_string).collect();
    let mut ranges: Vec<&SymbolRange> = symbols.iter().collect();
    ranges.sort_by_key(|r| r.start_line);

    let mut blocks = Vec::new();
    let mut cursor = 0usize;
    for range in ranges {
        if range.start_line == 0 || range.end_line < range.start_line {
            return None;
        }
        let start = range.start_line - 1;
        let end = range.end_line;
        if start < cursor || end > lines.len() {
            return None;
        }
        if start > cursor {
            blocks.push(Block { label: BlockLabel::Gap, lines: lines[cursor..start].to_vec() });
        }
        blocks.push(Block {
            label: BlockLabel::Symbol(range.name.clone()),
            lines: lines[start..end].to_vec(),
        });
        cursor = end;
    }
    if cursor < lines.len() {
        blocks.push(Block { label: BlockLabel::Gap, lines: lines[cursor..].to_vec() });
    }
    Some(blocks)
}

/// One version of the file entering the merge.
#[derive(Debug, Clone)]
pub struct MergeSide<'a> {
    pub content: &'a str,
    pub symbols: &'a [SymbolRange],
}

/// Attempt the structural merge. Returns the merged content, or None when
/// the versions disagree structurally or both sides changed one block.
pub fn try_structural_merge(
    base: MergeSide<'_>,
    ours: MergeSide<'_>,
    theirs: MergeSide<'_>,
) -> Option<String> {
    let base_blocks = split_blocks(base.content, base.symbols)?;
    let our_blocks = split_blocks(ours.content, ours.symbols)?;
    let their_blocks = split_blocks(theirs.content, theirs.symbols)?;

    if base_blocks.len() != our_blocks.len() || base_blocks.len() != their_blocks.len() {
        return None;
    }
    for i in 0..base_blocks.len() {
        if base_blocks[i].label != our_blocks[i].label
            || base_blocks[i].label != their_blocks[i].label
        {
            return None;
        }
    }

    let mut merged: Vec<String> = Vec::new();
    for i in 0..base_blocks.len() {
        let b = &base_blocks[i];
        let o = &our_blocks[i];
        let t = &their_blocks[i];
        let ours_changed = o.lines != b.lines;
        let theirs_changed = t.lines != b.lines;
        let chosen = match (ours_changed, theirs_changed) {
            (false, false) => &b.lines,
            (true, false) => &o.lines,
            (false, true) => &t.lines,
            (true, true) => return None,
        };
        merged.extend(chosen.iter().cloned());
    }
    Some(merged.join("\n"))
}

// ── Pre-merge conflict prediction ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeRisk {
    Safe,
    Risky,
    Unknown,
}

/// Per-file symbol data: file path → top-level symbol ranges.
pub type SymbolMap = HashMap<String, Vec<SymbolRange>>;

/// Modified symbols per side, keyed by file.
pub type ModifiedSymbols = HashMap<String, Vec<String>>;

/// Predict whether two completed branches will merge cleanly. Files only
/// one side touched are free; shared files are compared symbol-by-symbol.
pub fn predict_merge_conflict(
    files_a: &[String],
    files_b: &[String],
    symbols_a: &ModifiedSymbols,
    symbols_b: &ModifiedSymbols,
    symbol_map: &SymbolMap,
) -> MergeRisk {
    let set_b: HashSet<&String> = files_b.iter().collect();
    let mut verdict = MergeRisk::Safe;

    for file in files_a.iter().filter(|f| set_b.contains(f)) {
        let Some(ranges) = symbol_map.get(file) else {
            if verdict == MergeRisk::Safe {
                verdict = MergeRisk::Unknown;
            }
            continue;
        };
        let (Some(mods_a), Some(mods_b)) = (symbols_a.get(file), symbols_b.get(file)) else {
            if verdict == MergeRisk::Safe {
                verdict = MergeRisk::Unknown;
            }
            continue;
        };

        let names_a: HashSet<&String> = mods_a.iter().collect();
        if mods_b.iter().any(|s| names_a.contains(s)) {
            return MergeRisk::Risky;
        }
        if ranges_overlap(ranges, mods_a, mods_b) {
            return MergeRisk::Risky;
        }
    }
    verdict
}

fn ranges_overlap(ranges: &[SymbolRange], mods_a: &[String], mods_b: &[String]) -> bool {
    let lookup = |name: &String| ranges.iter().find(|r| &r.name == name);
    for a in mods_a {
        let Some(ra) = lookup(a) else { continue };
        for b in mods_b {
            let Some(rb) = lookup(b) else { continue };
            if ra.start_line <= rb.end_line && rb.start_line <= ra.end_line {
                return true;
            }
        }
    }
    false
}

/// A branch waiting to be merged onto the milestone.
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub branch: String,
    pub files: Vec<String>,
    pub modified_symbols: ModifiedSymbols,
}

/// Order candidates so those with the fewest risky peers merge first;
/// a candidate that conflicts with many others goes last, after the easy
/// merges have landed and shrunk the conflict surface.
pub fn order_merge_sequence(candidates: &[MergeCandidate], symbol_map: &SymbolMap) -> Vec<usize> {
    let mut risky_peers: Vec<(usize, usize)> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let count = candidates
                .iter()
                .enumerate()
                .filter(|(j, other)| {
                    *j != i
                        && predict_merge_conflict(
                            &c.files,
                            &other.files,
                            &c.modified_symbols,
                            &other.modified_symbols,
                            symbol_map,
                        ) == MergeRisk::Risky
                })
                .count();
            (i, count)
        })
        .collect();
    risky_peers.sort_by_key(|&(i, count)| (count, i));
    risky_peers.into_iter().map(|(i, _)| i).collect()
}
