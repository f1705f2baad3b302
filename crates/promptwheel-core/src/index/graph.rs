//! Module-graph analysis over the built index: dependency cycles, graph
//! metrics, dead exports, structural issues, and coupling.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

const MAX_REPORTED_CYCLES: usize = 10;
const MAX_DEAD_EXPORTS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleRole {
    /// fan-in ≥ 3.
    Hub,
    /// fan-out > 0 and fan-in = 0.
    Leaf,
    /// fan-in = 0 and fan-out = 0.
    Orphan,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMetrics {
    pub role: ModuleRole,
    pub fan_in: usize,
    pub fan_out: usize,
    /// Ce / (Ca + Ce); 0 when both are zero.
    pub instability: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StructuralIssue {
    /// fan-in > 5 and file-count > 20.
    GodModule { module: String, fan_in: usize, file_count: usize },
    /// fan-out > 8.
    ExcessiveFanOut { module: String, fan_out: usize },
    /// single-file module with exports, fan-out ≥ 2, fan-in ≥ 1.
    BarrelOnly { module: String },
    /// no edges in either direction and not an entrypoint.
    Orphan { module: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadExport {
    pub module: String,
    pub name: String,
}

/// Detect dependency cycles with DFS three-coloring. Reported cycles are
/// node sequences where each consecutive pair is a real edge; capped.
pub fn detect_cycles(edges: &BTreeMap<String, Vec<String>>) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color: HashMap<&str, Color> =
        edges.keys().map(|k| (k.as_str(), Color::White)).collect();
    for targets in edges.values() {
        for t in targets {
            color.entry(t.as_str()).or_insert(Color::White);
        }
    }

    let mut cycles: Vec<Vec<String>> = Vec::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        edges: &'a BTreeMap<String, Vec<String>>,
        color: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        if cycles.len() >= MAX_REPORTED_CYCLES {
            return;
        }
        color.insert(node, Color::Gray);
        stack.push(node);
        if let Some(targets) = edges.get(node) {
            for t in targets {
                match color.get(t.as_str()).copied().unwrap_or(Color::White) {
                    Color::Gray => {
                        if let Some(pos) = stack.iter().position(|n| *n == t.as_str()) {
                            let mut cycle: Vec<String> =
                                stack[pos..].iter().map(|s| s.to_string()).collect();
                            cycle.push(t.clone());
                            if cycles.len() < MAX_REPORTED_CYCLES {
                                cycles.push(cycle);
                            }
                        }
                    }
                    Color::White => visit(t.as_str(), edges, color, stack, cycles),
                    Color::Black => {}
                }
            }
        }
        stack.pop();
        color.insert(node, Color::Black);
    }

    let nodes: Vec<&str> = color.keys().copied().collect();
    let mut sorted_nodes = nodes;
    sorted_nodes.sort();
    for node in sorted_nodes {
        if color.get(node) == Some(&Color::White) {
            visit(node, edges, &mut color, &mut stack, &mut cycles);
        }
    }
    cycles
}

pub fn reverse_edges(edges: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, Vec<String>> {
    let mut rev: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (from, targets) in edges {
        rev.entry(from.clone()).or_default();
        for to in targets {
            rev.entry(to.clone()).or_default().push(from.clone());
        }
    }
    for targets in rev.values_mut() {
        targets.sort();
        targets.dedup();
    }
    rev
}

/// Per-module metrics from the forward and reverse edge maps.
pub fn compute_metrics(
    edges: &BTreeMap<String, Vec<String>>,
    rev: &BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, GraphMetrics> {
    let mut out = BTreeMap::new();
    let modules: HashSet<&String> = edges.keys().chain(rev.keys()).collect();
    for module in modules {
        let fan_out = edges.get(module).map(|v| v.len()).unwrap_or(0);
        let fan_in = rev.get(module).map(|v| v.len()).unwrap_or(0);
        let role = if fan_in >= 3 {
            ModuleRole::Hub
        } else if fan_out > 0 && fan_in == 0 {
            ModuleRole::Leaf
        } else if fan_in == 0 && fan_out == 0 {
            ModuleRole::Orphan
        } else {
            ModuleRole::Internal
        };
        let instability = if fan_in + fan_out == 0 {
            0.0
        } else {
            fan_out as f64 / (fan_in + fan_out) as f64
        };
        out.insert(module.clone(), GraphMetrics { role, fan_in, fan_out, instability });
    }
    out
}

/// Inputs for dead-export detection, gathered during the build pass.
pub struct UsageSets {
    /// Cross-file imported binding names.
    pub imported_names: HashSet<String>,
    /// Callee names from the fused call graph.
    pub called_names: HashSet<String>,
    /// Members accessed through namespace imports.
    pub namespace_members: HashSet<String>,
}

/// An exported name in an imported module that nothing references.
/// `default` and pure type exports are exempt.
pub fn detect_dead_exports(
    module_exports: &BTreeMap<String, Vec<(String, bool)>>,
    rev: &BTreeMap<String, Vec<String>>,
    usage: &UsageSets,
) -> Vec<DeadExport> {
    let mut out = Vec::new();
    'outer: for (module, exports) in module_exports {
        let has_importers = rev.get(module).map(|v| !v.is_empty()).unwrap_or(false);
        if !has_importers {
            continue;
        }
        for (name, is_type_only) in exports {
            if name == "default" || *is_type_only {
                continue;
            }
            let used = usage.imported_names.contains(name)
                || usage.called_names.contains(name)
                || usage.namespace_members.contains(name);
            if !used {
                out.push(DeadExport { module: module.clone(), name: name.clone() });
                if out.len() >= MAX_DEAD_EXPORTS {
                    break 'outer;
                }
            }
        }
    }
    out
}

pub struct ModuleShape {
    pub file_count: usize,
    pub export_count: usize,
    pub is_entrypoint: bool,
}

pub fn detect_structural_issues(
    shapes: &BTreeMap<String, ModuleShape>,
    metrics: &BTreeMap<String, GraphMetrics>,
) -> Vec<StructuralIssue> {
    let mut out = Vec::new();
    for (module, shape) in shapes {
        let Some(m) = metrics.get(module) else { continue };
        if m.fan_in > 5 && shape.file_count > 20 {
            out.push(StructuralIssue::GodModule {
                module: module.clone(),
                fan_in: m.fan_in,
                file_count: shape.file_count,
            });
        }
        if m.fan_out > 8 {
            out.push(StructuralIssue::ExcessiveFanOut { module: module.clone(), fan_out: m.fan_out });
        }
        if shape.file_count == 1 && shape.export_count > 0 && m.fan_out >= 2 && m.fan_in >= 1 {
            out.push(StructuralIssue::BarrelOnly { module: module.clone() });
        }
        if m.fan_in == 0 && m.fan_out == 0 && !shape.is_entrypoint {
            out.push(StructuralIssue::Orphan { module: module.clone() });
        }
    }
    out
}
