//! Text-similarity fingerprints shared by dedup, consolidation, and the
//! spindle's spinning check.

use std::collections::HashSet;

/// Character-bigram Jaccard over the lowercased, alphanumeric-only form.
/// Used for title dedup: robust to punctuation and word-order noise.
pub fn title_bigram_jaccard(a: &str, b: &str) -> f64 {
    let grams = |s: &str| -> HashSet<[char; 2]> {
        let chars: Vec<char> = s
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();
        chars.windows(2).map(|w| [w[0], w[1]]).collect()
    };
    jaccard(&grams(a), &grams(b))
}

/// Word-bigram Jaccard; used for longer prose fragments.
pub fn word_bigram_jaccard(a: &str, b: &str) -> f64 {
    let grams = |s: &str| -> HashSet<(String, String)> {
        let words: Vec<String> = s
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        words.windows(2).map(|w| (w[0].clone(), w[1].clone())).collect()
    };
    jaccard(&grams(a), &grams(b))
}

fn jaccard<T: std::hash::Hash + Eq>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    inter / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_titles_score_one() {
        assert_eq!(title_bigram_jaccard("Fix the lease reclaim", "fix the lease reclaim!"), 1.0);
    }

    #[test]
    fn unrelated_titles_score_low() {
        assert!(title_bigram_jaccard("Fix lease reclaim", "Document wave scheduler") < 0.3);
    }

    #[test]
    fn near_duplicates_cross_the_dedup_threshold() {
        let a = "Add retry limit to ticket scheduler";
        let b = "Add retry limits to the ticket scheduler";
        assert!(title_bigram_jaccard(a, b) >= 0.6);
    }

    #[test]
    fn word_bigrams_track_restated_prose() {
        let a = "I will fix the failing test by adjusting the assertion";
        let b = "I will fix the failing test by adjusting the assertion now";
        assert!(word_bigram_jaccard(a, b) > 0.8);
    }
}
