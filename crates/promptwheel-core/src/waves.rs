//! Conflict-aware partitioning of proposals into parallel waves.

use crate::conflict::{proposals_conflict, ConflictOptions};
use crate::types::Proposal;

/// Greedy first-fit partition: each proposal lands in the first wave where
/// it conflicts with no member, else opens a new wave. Input order is
/// preserved within each wave and the union of all waves is the input.
pub fn partition_into_waves(proposals: Vec<Proposal>, opts: &ConflictOptions) -> Vec<Vec<Proposal>> {
    let mut waves: Vec<Vec<Proposal>> = Vec::new();

    'outer: for proposal in proposals {
        for wave in waves.iter_mut() {
            if wave.iter().all(|member| !proposals_conflict(member, &proposal, opts)) {
                wave.push(proposal);
                continue 'outer;
            }
        }
        waves.push(vec![proposal]);
    }

    waves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::Sensitivity;
    use crate::types::Risk;

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

    #[test]
    fn disjoint_symbol_pair_shares_a_wave() {
        let input = vec![
            proposal("a", &["src/a.ts"], "fix", None),
            proposal("b", &["src/b.ts"], "refactor", None),
            proposal("c", &["src/utils.ts"], "perf", Some(&["foo"])),
            proposal("d", &["src/utils.ts"], "cleanup", Some(&["bar"])),
        ];
        let opts = ConflictOptions::with_sensitivity(Sensitivity::Normal);
        let waves = partition_into_waves(input, &opts);

        // C and D have disjoint symbols, so either one wave of four or
        // D alone in a second wave is acceptable; never C and D split
        // *because* of the shared file.
        let total: usize = waves.iter().map(|w| w.len()).sum();
        assert_eq!(total, 4);
        assert_eq!(waves[0].iter().filter(|p| p.title == "a" || p.title == "b").count(), 2);
        let wave_of = |t: &str| waves.iter().position(|w| w.iter().any(|p| p.title == t));
        assert_eq!(wave_of("c"), wave_of("d"), "disjoint symbols must not split C and D");
    }

    #[test]
    fn shared_file_without_symbols_splits() {
        let input = vec![
            proposal("c", &["src/utils.ts"], "perf", None),
            proposal("d", &["src/utils.ts"], "cleanup", None),
        ];
        let opts = ConflictOptions::with_sensitivity(Sensitivity::Normal);
        let waves = partition_into_waves(input, &opts);
        assert_eq!(waves.len(), 2);
    }

    #[test]
    fn partition_is_exhaustive_and_duplicate_free() {
        let input: Vec<Proposal> = (0..10)
            .map(|i| proposal(&format!("p{i}"), &[&format!("mod{i}/f.ts")], "fix", None))
            .collect();
        let opts = ConflictOptions::default();
        let waves = partition_into_waves(input, &opts);
        let mut titles: Vec<String> =
            waves.iter().flatten().map(|p| p.title.clone()).collect();
        titles.sort();
        let expected: Vec<String> = {
            let mut v: Vec<String> = (0..10).map(|i| format!("p{i}")).collect();
            v.sort();
            v
        };
        assert_eq!(titles, expected);
    }

    #[test]
    fn waves_preserve_input_order() {
        let input = vec![
            proposal("first", &["a/f.ts"], "fix", None),
            proposal("second", &["b/f.ts"], "fix", None),
            proposal("third", &["c/f.ts"], "fix", None),
        ];
        let opts = ConflictOptions::default();
        let waves = partition_into_waves(input, &opts);
        assert_eq!(waves.len(), 1);
        let titles: Vec<&str> = waves[0].iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "second", "third"]);
    }
}
