//! Which lens (formula) to scan with next, and which sector of the repo
//! to point it at. Lens choice is UCB1 over historical ticket outcomes;
//! sector choice prefers the least-scanned, then the highest-yield.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::run_state::FormulaStats;
use crate::types::Sector;

/// Directories never carved into sectors.
const SECTOR_DENYLIST: &[&str] = &[
    ".git",
    ".promptwheel",
    "node_modules",
    "dist",
    "build",
    "coverage",
    "target",
    "vendor",
];

/// The lens every session starts from.
pub const DEFAULT_LENS: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LensScore {
    pub lens: String,
    pub score: f64,
}

/// UCB1 ordering over candidate lenses. `default` is forced first; the
/// rest sort by exploitation (success rate with +1 smoothing) plus an
/// exploration bonus that favors lenses with few recent cycles.
pub fn rotation_order(
    candidates: &[String],
    stats: &BTreeMap<String, FormulaStats>,
    total_cycles: i64,
) -> Vec<LensScore> {
    let total = total_cycles.max(1) as f64;
    let mut scored: Vec<LensScore> = candidates
        .iter()
        .filter(|l| l.as_str() != DEFAULT_LENS)
        .map(|lens| {
            let s = stats.get(lens).cloned().unwrap_or_default();
            let alpha = s.tickets_succeeded as f64 + 1.0;
            let beta = (s.tickets_total - s.tickets_succeeded) as f64 + 1.0;
            let exploitation = alpha / (alpha + beta);
            let recent = s.recent_cycles.max(1) as f64;
            let exploration = (2.0 * total.ln() / recent).sqrt();
            LensScore { lens: lens.clone(), score: exploitation + exploration }
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.lens.cmp(&b.lens))
    });

    let mut out = Vec::with_capacity(scored.len() + 1);
    if candidates.iter().any(|l| l == DEFAULT_LENS) {
        out.push(LensScore { lens: DEFAULT_LENS.to_string(), score: f64::INFINITY });
    }
    out.extend(scored);
    out
}

/// Session-scoped rotation state. The sector set is carved once and is
/// immutable for the session.
#[derive(Debug)]
pub struct Rotation {
    lenses: Vec<String>,
    sectors: Vec<Sector>,
    /// (lens, sector) pairs already scanned this session.
    scanned: HashSet<(String, String)>,
    /// (lens, sector) pairs known to produce zero proposals.
    zero_yield: HashSet<(String, String)>,
}

impl Rotation {
    pub fn new(lenses: Vec<String>, sectors: Vec<Sector>) -> Self {
        Self { lenses, sectors, scanned: HashSet::new(), zero_yield: HashSet::new() }
    }

    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    /// Pick the next lens in rotation order that still has at least one
    /// sector it has neither scanned nor zero-yielded on.
    pub fn advance_lens(
        &self,
        stats: &BTreeMap<String, FormulaStats>,
        total_cycles: i64,
    ) -> Option<String> {
        let order = rotation_order(&self.lenses, stats, total_cycles);
        order
            .into_iter()
            .map(|s| s.lens)
            .find(|lens| self.has_unscanned_sector(lens))
    }

    fn has_unscanned_sector(&self, lens: &str) -> bool {
        self.sectors.iter().any(|sector| {
            let key = (lens.to_string(), sector.path.clone());
            !self.scanned.contains(&key) && !self.zero_yield.contains(&key)
        })
    }

    /// Choose a sector for the lens: unscanned pairs only, lowest
    /// scan-count first, then highest proposal-yield.
    pub fn select_sector(&self, lens: &str) -> Option<&Sector> {
        self.sectors
            .iter()
            .filter(|sector| {
                let key = (lens.to_string(), sector.path.clone());
                !self.scanned.contains(&key) && !self.zero_yield.contains(&key)
            })
            .min_by(|a, b| {
                a.scan_count
                    .cmp(&b.scan_count)
                    .then(b.proposal_yield.cmp(&a.proposal_yield))
                    .then(a.path.cmp(&b.path))
            })
    }

    pub fn record_lens_scan(&mut self, lens: &str, sector_path: &str, proposals: usize) {
        self.scanned.insert((lens.to_string(), sector_path.to_string()));
        if proposals == 0 {
            self.zero_yield.insert((lens.to_string(), sector_path.to_string()));
        }
        if let Some(sector) = self.sectors.iter_mut().find(|s| s.path == sector_path) {
            sector.scan_count += 1;
            sector.last_scan_time = Some(Utc::now());
            sector.proposal_yield += proposals as i64;
        }
    }

    pub fn record_zero_yield(&mut self, lens: &str, sector_path: &str) {
        self.zero_yield.insert((lens.to_string(), sector_path.to_string()));
    }
}

/// Carve a repository into sectors: every allowed top-level directory plus
/// its immediate subdirectories. The path doubles as the stable sector id.
pub fn carve_sectors(repo_root: &std::path::Path) -> Vec<Sector> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(repo_root) else {
        return out;
    };
    let mut top: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| !name.starts_with('.') && !SECTOR_DENYLIST.contains(&name.as_str()))
        .collect();
    top.sort();

    for name in top {
        out.push(sector(&name));
        let sub_path = repo_root.join(&name);
        if let Ok(subs) = std::fs::read_dir(&sub_path) {
            let mut sub_names: Vec<String> = subs
                .flatten()
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| !n.starts_with('.') && !SECTOR_DENYLIST.contains(&n.as_str()))
                .collect();
            sub_names.sort();
            for sub in sub_names {
                out.push(sector(&format!("{name}/{sub}")));
            }
        }
    }
    out
}

fn sector(path: &str) -> Sector {
    Sector { path: path.to_string(), scan_count: 0, last_scan_time: None, proposal_yield: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(entries: &[(&str, i64, i64, i64)]) -> BTreeMap<String, FormulaStats> {
        entries
            .iter()
            .map(|(name, total, succeeded, recent)| {
                (
                    name.to_string(),
                    FormulaStats {
                        tickets_total: *total,
                        tickets_succeeded: *succeeded,
                        recent_cycles: *recent,
                        recent_tickets_total: *total,
                        recent_tickets_succeeded: *succeeded,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn default_lens_is_always_first() {
        let candidates = vec!["security".to_string(), "default".to_string(), "perf".to_string()];
        let order = rotation_order(&candidates, &stats(&[]), 10);
        assert_eq!(order[0].lens, "default");
    }

    #[test]
    fn successful_lens_outranks_failing_lens_with_equal_exposure() {
        let candidates = vec!["good".to_string(), "bad".to_string()];
        let s = stats(&[("good", 10, 9, 5), ("bad", 10, 1, 5)]);
        let order = rotation_order(&candidates, &s, 20);
        assert_eq!(order[0].lens, "good");
    }

    #[test]
    fn unexplored_lens_gets_exploration_bonus() {
        let candidates = vec!["veteran".to_string(), "fresh".to_string()];
        // Veteran: mediocre but heavily scanned. Fresh: never scanned.
        let s = stats(&[("veteran", 40, 20, 60)]);
        let order = rotation_order(&candidates, &s, 60);
        assert_eq!(order[0].lens, "fresh");
    }

    #[test]
    fn advance_skips_exhausted_lenses() {
        let sectors = vec![sector("src")];
        let mut r = Rotation::new(vec!["default".to_string(), "security".to_string()], sectors);
        r.record_lens_scan("default", "src", 3);
        let next = r.advance_lens(&stats(&[]), 1).expect("security still has sectors");
        assert_eq!(next, "security");
        r.record_zero_yield("security", "src");
        assert!(r.advance_lens(&stats(&[]), 2).is_none());
    }

    #[test]
    fn sector_selection_prefers_low_scan_count_then_yield() {
        let mut a = sector("src/api");
        a.scan_count = 2;
        a.proposal_yield = 9;
        let mut b = sector("src/db");
        b.scan_count = 0;
        b.proposal_yield = 1;
        let mut c = sector("src/ui");
        c.scan_count = 0;
        c.proposal_yield = 5;
        let r = Rotation::new(vec!["default".to_string()], vec![a, b, c]);
        assert_eq!(r.select_sector("default").map(|s| s.path.as_str()), Some("src/ui"));
    }

    #[test]
    fn carving_finds_top_and_second_level() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("src/api")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("src/db")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("node_modules/x")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join(".git")).expect("mkdir");

        let sectors = carve_sectors(dir.path());
        let paths: Vec<&str> = sectors.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["src", "src/api", "src/db"]);
    }
}
