//! Learnings maintenance: time decay, near-duplicate consolidation, and
//! relevance selection for prompt assembly.

use chrono::{DateTime, Duration, Utc};

use crate::similarity::title_bigram_jaccard;
use crate::types::{Learning, LearningCategory};

/// Two learnings whose texts score at or above this merge during
/// consolidation.
pub const SIMILARITY_MERGE_THRESHOLD: f64 = 0.7;

/// Consolidation that would shrink the list below ceil(count * 0.4) is
/// treated as too aggressive and rejected. Documented heuristic, not an
/// invariant.
const CONSOLIDATION_FLOOR_RATIO: f64 = 0.4;

/// Decay every learning's weight by `rate` per tick. Entries that have
/// been accessed decay at half rate; entries confirmed within the last
/// day decay at half of that again. Weight is capped at 100 and entries
/// at or below zero are dropped.
pub fn apply_learnings_decay(learnings: &mut Vec<Learning>, rate: f64, now: DateTime<Utc>) {
    for l in learnings.iter_mut() {
        let mut reduction = rate;
        if l.access_count > 0 {
            reduction /= 2.0;
        }
        if now - l.last_confirmed_at < Duration::days(1) {
            reduction /= 2.0;
        }
        l.weight = (l.weight - reduction).min(100.0);
    }
    learnings.retain(|l| l.weight > 0.0);
}

/// Merge near-duplicate learnings within the same category. The survivor
/// keeps the higher weight, the later confirmation time, and the union of
/// tags. Returns None (inputs untouched) when the merge would collapse
/// the list below the floor.
pub fn consolidate_learnings(learnings: &[Learning]) -> Option<Vec<Learning>> {
    let mut merged: Vec<Learning> = Vec::new();
    for l in learnings {
        match merged.iter_mut().find(|m| {
            m.category == l.category
                && title_bigram_jaccard(&m.text, &l.text) >= SIMILARITY_MERGE_THRESHOLD
        }) {
            Some(survivor) => {
                if l.weight > survivor.weight {
                    survivor.weight = l.weight;
                }
                if l.last_confirmed_at > survivor.last_confirmed_at {
                    survivor.last_confirmed_at = l.last_confirmed_at;
                }
                survivor.access_count += l.access_count;
                for tag in &l.tags {
                    if !survivor.tags.contains(tag) {
                        survivor.tags.push(tag.clone());
                    }
                }
            }
            None => merged.push(l.clone()),
        }
    }

    let floor = (learnings.len() as f64 * CONSOLIDATION_FLOOR_RATIO).ceil() as usize;
    if merged.len() < floor {
        return None;
    }
    Some(merged)
}

/// Context for relevance selection: where the ticket works and what it runs.
pub struct SelectionContext<'a> {
    /// Directories the ticket touches (matched against `path:` tags).
    pub paths: &'a [String],
    /// Command names the ticket runs (matched against `cmd:` tags).
    pub commands: &'a [String],
    /// Free keywords from the ticket title/description.
    pub keywords: &'a [String],
}

/// Score learnings against the context and return the top `max_results`,
/// highest score first. Ties resolve toward higher weight.
pub fn select_relevant(
    learnings: &[Learning],
    context: &SelectionContext<'_>,
    max_results: usize,
) -> Vec<Learning> {
    let mut scored: Vec<(f64, &Learning)> = learnings
        .iter()
        .map(|l| (relevance_score(l, context), l))
        .filter(|(score, _)| *score > 0.0)
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.1.weight.partial_cmp(&a.1.weight).unwrap_or(std::cmp::Ordering::Equal))
    });
    scored.into_iter().take(max_results).map(|(_, l)| l.clone()).collect()
}

fn relevance_score(l: &Learning, ctx: &SelectionContext<'_>) -> f64 {
    let mut score = 0.0;

    for tag in &l.tags {
        if let Some(dir) = tag.strip_prefix("path:") {
            if ctx.paths.iter().any(|p| p == dir || p.starts_with(&format!("{dir}/"))) {
                score += 10.0;
            }
        } else if let Some(cmd) = tag.strip_prefix("cmd:") {
            if ctx.commands.iter().any(|c| c.contains(cmd)) {
                score += 10.0;
            }
        }
    }

    let text_lower = l.text.to_lowercase();
    for kw in ctx.keywords {
        if text_lower.contains(&kw.to_lowercase()) {
            score += 2.0;
        }
    }

    // Gotchas earn a boost when the ticket runs commands at all.
    if !ctx.commands.is_empty() && l.category == LearningCategory::Gotcha {
        score += 3.0;
    }

    if score > 0.0 {
        score += l.weight / 100.0;
    }
    score
}
