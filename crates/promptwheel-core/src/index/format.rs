//! Compact markdown rendering of the index for scout prompts. Bounded by
//! construction: each section caps its rows, and when more than three
//! sections have content only a rotating window of three is emitted.

use std::fmt::Write;

use super::graph::{ModuleRole, StructuralIssue};
use super::CodebaseIndex;

const MAX_ROWS_PER_SECTION: usize = 8;
const SECTIONS_PER_PROMPT: usize = 3;

struct Section {
    title: &'static str,
    body: String,
}

/// Render graph insights for the scout. `cycle` rotates which sections
/// appear so long sessions eventually surface everything.
pub fn format_index_for_prompt(index: &CodebaseIndex, cycle: i64) -> String {
    let sections: Vec<Section> = [
        graph_section(index),
        issues_section(index),
        dead_exports_section(index),
        coupling_section(index),
        cycles_section(index),
    ]
    .into_iter()
    .flatten()
    .collect();

    if sections.is_empty() {
        return String::new();
    }

    let chosen: Vec<&Section> = if sections.len() <= SECTIONS_PER_PROMPT {
        sections.iter().collect()
    } else {
        let start = ((cycle.max(0) as usize) * SECTIONS_PER_PROMPT) % sections.len();
        (0..SECTIONS_PER_PROMPT)
            .map(|i| &sections[(start + i) % sections.len()])
            .collect()
    };

    let mut out = String::from("## Codebase insights\n");
    for section in chosen {
        let _ = write!(out, "\n### {}\n{}", section.title, section.body);
    }
    out
}

fn graph_section(index: &CodebaseIndex) -> Option<Section> {
    let mut hubs: Vec<(&String, usize)> = index
        .graph_metrics
        .iter()
        .filter(|(_, m)| m.role == ModuleRole::Hub)
        .map(|(path, m)| (path, m.fan_in))
        .collect();
    hubs.sort_by(|a, b| b.1.cmp(&a.1));

    if hubs.is_empty() && index.entrypoints.is_empty() {
        return None;
    }
    let mut body = String::new();
    for (path, fan_in) in hubs.into_iter().take(MAX_ROWS_PER_SECTION) {
        let _ = writeln!(body, "- `{path}` is a hub ({fan_in} importers); changes ripple widely");
    }
    if !index.entrypoints.is_empty() {
        let list = index
            .entrypoints
            .iter()
            .take(MAX_ROWS_PER_SECTION)
            .map(|e| format!("`{e}`"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(body, "- entrypoints: {list}");
    }
    Some(Section { title: "Graph shape", body })
}

fn issues_section(index: &CodebaseIndex) -> Option<Section> {
    if index.structural_issues.is_empty() {
        return None;
    }
    let mut body = String::new();
    for issue in index.structural_issues.iter().take(MAX_ROWS_PER_SECTION) {
        let line = match issue {
            StructuralIssue::GodModule { module, fan_in, file_count } => {
                format!("- `{module}` is a god module: {fan_in} importers, {file_count} files")
            }
            StructuralIssue::ExcessiveFanOut { module, fan_out } => {
                format!("- `{module}` imports {fan_out} modules; consider splitting")
            }
            StructuralIssue::BarrelOnly { module } => {
                format!("- `{module}` is a barrel re-export with no logic of its own")
            }
            StructuralIssue::Orphan { module } => {
                format!("- `{module}` is orphaned: nothing imports it and it imports nothing")
            }
        };
        let _ = writeln!(body, "{line}");
    }
    Some(Section { title: "Structural issues", body })
}

fn dead_exports_section(index: &CodebaseIndex) -> Option<Section> {
    if index.dead_exports.is_empty() {
        return None;
    }
    let mut body = String::new();
    for dead in index.dead_exports.iter().take(MAX_ROWS_PER_SECTION) {
        let _ = writeln!(body, "- `{}` exports `{}` but no file uses it", dead.module, dead.name);
    }
    Some(Section { title: "Dead exports", body })
}

fn coupling_section(index: &CodebaseIndex) -> Option<Section> {
    let mut extremes: Vec<(&String, f64)> = index
        .graph_metrics
        .iter()
        .filter(|(_, m)| m.fan_in + m.fan_out >= 3)
        .map(|(path, m)| (path, m.instability))
        .collect();
    if extremes.is_empty() {
        return None;
    }
    extremes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut body = String::new();
    for (path, instability) in extremes.iter().take(MAX_ROWS_PER_SECTION / 2) {
        let _ = writeln!(body, "- `{path}` instability {instability:.2}");
    }
    for (path, instability) in extremes.iter().rev().take(MAX_ROWS_PER_SECTION / 2) {
        let _ = writeln!(body, "- `{path}` instability {instability:.2}");
    }
    Some(Section { title: "Coupling extremes", body })
}

fn cycles_section(index: &CodebaseIndex) -> Option<Section> {
    if index.dependency_cycles.is_empty() {
        return None;
    }
    let mut body = String::new();
    for cycle in index.dependency_cycles.iter().take(MAX_ROWS_PER_SECTION) {
        let _ = writeln!(body, "- {}", cycle.join(" → "));
    }
    Some(Section { title: "Dependency cycles", body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::cache::AstCache;
    use crate::index::{build_index, BuildOptions};

    fn built_index(dir: &std::path::Path) -> CodebaseIndex {
        let write = |rel: &str, content: &str| {
            let path = dir.join(rel);
            std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            std::fs::write(path, content).expect("write");
        };
        write("src/a.ts", "import { b } from \"./b\";\nexport function a() { return b(); }\n");
        write("src/b.ts", "export function b() { return 1; }\nexport function dead() {}\n");
        let mut cache = AstCache::load(dir.join("cache.json"));
        build_index(dir, &BuildOptions::default(), &mut cache).expect("build")
    }

    #[test]
    fn formatting_is_bounded_and_stable_per_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = built_index(dir.path());

        let text = format_index_for_prompt(&index, 0);
        assert!(text.starts_with("## Codebase insights"));
        assert!(text.len() < 3200, "roughly 800 tokens by construction");
        assert_eq!(text, format_index_for_prompt(&index, 0), "deterministic per cycle");
    }

    #[test]
    fn empty_index_formats_to_nothing() {
        let index = CodebaseIndex {
            built_at: chrono::Utc::now(),
            modules: Default::default(),
            dependency_edges: Default::default(),
            reverse_edges: Default::default(),
            dependency_cycles: vec![],
            entrypoints: vec![],
            sampled_file_mtimes: Default::default(),
            structural_issues: vec![],
            dead_exports: vec![],
            graph_metrics: Default::default(),
            typescript_analysis: None,
        };
        assert!(format_index_for_prompt(&index, 0).is_empty());
    }
}
