//! Wave-scheduler contract tests: the end-to-end isolation scenario plus
//! property tests over random proposal sets and random module graphs.

use std::collections::BTreeMap;

use promptwheel_core::conflict::{proposals_conflict, ConflictOptions, Sensitivity};
use promptwheel_core::index::graph::detect_cycles;
use promptwheel_core::types::{Proposal, Risk};
use promptwheel_core::waves::partition_into_waves;
use proptest::prelude::*;

fn proposal(title: &str, files: &[&str], category: &str, symbols: Option<&[&str]>) -> Proposal {
    Proposal {
        category: category.into(),
        title: title.into(),
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

// ── Scenario: wave isolation ─────────────────────────────────────────────

#[test]
fn disjoint_symbols_share_a_wave_and_path_clashes_split() {
    let a = proposal("a", &["src/a.ts"], "fix", None);
    let b = proposal("b", &["src/b.ts"], "refactor", None);
    let c = proposal("c", &["src/utils.ts"], "perf", Some(&["foo"]));
    let d = proposal("d", &["src/utils.ts"], "cleanup", Some(&["bar"]));
    let opts = ConflictOptions::with_sensitivity(Sensitivity::Normal);

    let waves = partition_into_waves(vec![a.clone(), b.clone(), c.clone(), d.clone()], &opts);
    let wave_of = |title: &str| {
        waves
            .iter()
            .position(|w| w.iter().any(|p| p.title == title))
            .expect("present")
    };
    assert_eq!(wave_of("a"), 0);
    assert_eq!(wave_of("b"), 0);
    assert_eq!(
        wave_of("c"),
        wave_of("d"),
        "disjoint target symbols must not split C and D"
    );

    // Remove the symbol escape: same file now forces separate waves.
    let c_plain = proposal("c", &["src/utils.ts"], "perf", None);
    let d_plain = proposal("d", &["src/utils.ts"], "cleanup", None);
    let waves = partition_into_waves(vec![a, b, c_plain, d_plain], &opts);
    let wave_of = |title: &str| {
        waves
            .iter()
            .position(|w| w.iter().any(|p| p.title == title))
            .expect("present")
    };
    assert_ne!(wave_of("c"), wave_of("d"));
}

#[test]
fn conflict_detection_is_symmetric() {
    let cases = vec![
        (proposal("x", &["src/a.ts"], "fix", None), proposal("y", &["src/a.ts"], "perf", None)),
        (proposal("x", &["src/a.ts"], "fix", Some(&["f"])), proposal("y", &["src/a.ts"], "fix", Some(&["g"]))),
        (proposal("x", &["packages/web/a.ts"], "fix", None), proposal("y", &["packages/api/b.ts"], "docs", None)),
    ];
    for sensitivity in [Sensitivity::Strict, Sensitivity::Normal, Sensitivity::Relaxed] {
        let opts = ConflictOptions::with_sensitivity(sensitivity);
        for (a, b) in &cases {
            assert_eq!(
                proposals_conflict(a, b, &opts),
                proposals_conflict(b, a, &opts),
                "asymmetric at {sensitivity:?} for {} / {}",
                a.title,
                b.title
            );
        }
    }
}

#[test]
fn partition_is_deterministic_for_a_fixed_input_order() {
    let input: Vec<Proposal> = (0..12)
        .map(|i| proposal(&format!("p{i}"), &[&format!("m{}/f{i}.ts", i % 4)], "fix", None))
        .collect();
    let opts = ConflictOptions::default();
    let first = partition_into_waves(input.clone(), &opts);
    let second = partition_into_waves(input, &opts);
    let titles = |waves: &[Vec<Proposal>]| -> Vec<Vec<String>> {
        waves.iter().map(|w| w.iter().map(|p| p.title.clone()).collect()).collect()
    };
    assert_eq!(titles(&first), titles(&second));
}

// ── Properties ───────────────────────────────────────────────────────────

proptest! {
    /// Random proposal sets: every wave is internally conflict-free and
    /// the partition is an exact multiset cover of the input.
    #[test]
    fn partition_is_valid_for_random_proposals(seed_files in proptest::collection::vec(0usize..6, 1..20)) {
        let dirs = ["src/api", "src/db", "src/ui", "lib/core", "lib/util", "tools"];
        let input: Vec<Proposal> = seed_files
            .iter()
            .enumerate()
            .map(|(i, d)| {
                proposal(
                    &format!("proposal number {i} entirely unique"),
                    &[&format!("{}/file{i}.ts", dirs[*d])],
                    "fix",
                    None,
                )
            })
            .collect();
        let opts = ConflictOptions::default();
        let waves = partition_into_waves(input.clone(), &opts);

        let total: usize = waves.iter().map(|w| w.len()).sum();
        prop_assert_eq!(total, input.len());

        for wave in &waves {
            for i in 0..wave.len() {
                for j in (i + 1)..wave.len() {
                    prop_assert!(!proposals_conflict(&wave[i], &wave[j], &opts));
                }
            }
        }

        // Greedy first-fit never exceeds max-degree + 1 waves.
        let degree = |p: &Proposal| input.iter().filter(|q| q.title != p.title && proposals_conflict(p, q, &opts)).count();
        let max_degree = input.iter().map(degree).max().unwrap_or(0);
        prop_assert!(waves.len() <= max_degree + 1);
    }

    /// Random directed graphs: no reported cycle is a false positive, and
    /// an empty report really means the graph is acyclic.
    #[test]
    fn cycle_reports_are_sound(edge_bits in proptest::collection::vec(any::<bool>(), 25)) {
        let n = 5usize;
        let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for i in 0..n {
            edges.insert(format!("m{i}"), Vec::new());
        }
        for (k, bit) in edge_bits.iter().enumerate() {
            if *bit {
                let from = k / n;
                let to = k % n;
                edges.get_mut(&format!("m{from}")).expect("node").push(format!("m{to}"));
            }
        }

        let cycles = detect_cycles(&edges);
        for cycle in &cycles {
            prop_assert!(cycle.len() >= 2);
            prop_assert_eq!(cycle.first(), cycle.last());
            for pair in cycle.windows(2) {
                let targets = edges.get(&pair[0]).cloned().unwrap_or_default();
                prop_assert!(targets.contains(&pair[1]), "edge {}→{} reported but absent", pair[0], pair[1]);
            }
        }

        if cycles.is_empty() {
            // Kahn's algorithm must consume every node.
            let mut indegree: BTreeMap<&str, usize> = edges.keys().map(|k| (k.as_str(), 0)).collect();
            for targets in edges.values() {
                for t in targets {
                    *indegree.get_mut(t.as_str()).expect("node") += 1;
                }
            }
            let mut queue: Vec<&str> = indegree.iter().filter(|(_, d)| **d == 0).map(|(k, _)| *k).collect();
            let mut seen = 0usize;
            while let Some(node) = queue.pop() {
                seen += 1;
                for t in &edges[node] {
                    let d = indegree.get_mut(t.as_str()).expect("node");
                    *d -= 1;
                    if *d == 0 {
                        queue.push(t.as_str());
                    }
                }
            }
            prop_assert_eq!(seen, edges.len(), "empty cycle report on a cyclic graph");
        }
    }
}
