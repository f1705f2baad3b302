//! Scout output → tickets: schema validation, normalization, confidence
//! floor, category ladder, dedup, ranking, symbol enrichment, test-target
//! expansion, and the final atomic ticket insert.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::info;

use crate::similarity::title_bigram_jaccard;
use crate::store::Store;
use crate::types::{Proposal, Risk, RunEventType, SymbolRange, Ticket, TicketStatus};

/// Titles at or above this similarity are the same proposal.
pub const TITLE_DEDUP_THRESHOLD: f64 = 0.6;

const REQUIRED_FIELDS: &[&str] = &[
    "category",
    "title",
    "description",
    "allowed_paths",
    "files",
    "confidence",
    "verification_commands",
    "risk",
    "touched_files_estimate",
    "rollback_note",
];

/// Filenames pulled into scope for test tickets alongside the test roots.
const TEST_SUPPORT_FILES: &[&str] = &[
    "package.json",
    "package-lock.json",
    "tsconfig.json",
    "jest.config.js",
    "jest.config.ts",
    "vitest.config.ts",
    "karma.conf.js",
];

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub min_confidence: f64,
    pub allowed_categories: Vec<String>,
    pub max_proposals_per_scout: usize,
    pub default_max_retries: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_confidence: 40.0,
            allowed_categories: vec![
                "fix".into(),
                "refactor".into(),
                "test".into(),
                "docs".into(),
                "perf".into(),
                "security".into(),
                "cleanup".into(),
                "types".into(),
            ],
            max_proposals_per_scout: 6,
            default_max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingFields { title: String, fields: Vec<String> },
    BelowConfidenceFloor { title: String, confidence: String },
    CategoryNotAllowed { title: String, category: String },
    DuplicateOfExisting { title: String, existing: String },
    DuplicateInBatch { title: String, kept: String },
    OverBudget { title: String },
}

#[derive(Debug)]
pub struct FilterOutcome {
    pub accepted: Vec<Proposal>,
    pub rejected: Vec<Rejection>,
    /// Valid proposals that did not fit the per-scout cap; the session
    /// defers these into run-state keyed by the scanned scope.
    pub overflow: Vec<Proposal>,
}

/// Validate and normalize raw scout JSON into proposals, applying the
/// confidence floor, the category ladder, both dedup passes, scoring,
/// and the per-scout cap.
pub fn filter_proposals(
    raw: &[Value],
    existing_titles: &[String],
    config: &PipelineConfig,
) -> FilterOutcome {
    let mut rejected = Vec::new();
    let mut validated: Vec<Proposal> = Vec::new();

    for value in raw {
        let title = value
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("<untitled>")
            .to_string();

        let missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|f| value.get(**f).is_none())
            .map(|f| f.to_string())
            .collect();
        if !missing.is_empty() {
            rejected.push(Rejection::MissingFields { title, fields: missing });
            continue;
        }

        let Ok(mut proposal) = serde_json::from_value::<Proposal>(value.clone()) else {
            rejected.push(Rejection::MissingFields {
                title,
                fields: vec!["<shape mismatch>".to_string()],
            });
            continue;
        };

        normalize_proposal(&mut proposal);

        if proposal.confidence < config.min_confidence {
            rejected.push(Rejection::BelowConfidenceFloor {
                title: proposal.title,
                confidence: format!("{:.0}", proposal.confidence),
            });
            continue;
        }
        if !config.allowed_categories.iter().any(|c| c == &proposal.category) {
            rejected.push(Rejection::CategoryNotAllowed {
                title: proposal.title,
                category: proposal.category,
            });
            continue;
        }
        if let Some(existing) = existing_titles
            .iter()
            .find(|t| title_bigram_jaccard(t, &proposal.title) >= TITLE_DEDUP_THRESHOLD)
        {
            rejected.push(Rejection::DuplicateOfExisting {
                title: proposal.title,
                existing: existing.clone(),
            });
            continue;
        }
        if let Some(kept) = validated
            .iter()
            .find(|p| title_bigram_jaccard(&p.title, &proposal.title) >= TITLE_DEDUP_THRESHOLD)
        {
            rejected.push(Rejection::DuplicateInBatch {
                title: proposal.title,
                kept: kept.title.clone(),
            });
            continue;
        }
        validated.push(proposal);
    }

    // Score and cap. Sort is stable, so equal scores keep insertion order.
    validated.sort_by(|a, b| {
        let score = |p: &Proposal| p.impact_score * p.confidence;
        score(b).partial_cmp(&score(a)).unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut overflow = Vec::new();
    while validated.len() > config.max_proposals_per_scout {
        if let Some(dropped) = validated.pop() {
            rejected.push(Rejection::OverBudget { title: dropped.title.clone() });
            overflow.push(dropped);
        }
    }
    overflow.reverse();

    FilterOutcome { accepted: validated, rejected, overflow }
}

fn normalize_proposal(p: &mut Proposal) {
    p.confidence = p.confidence.clamp(0.0, 100.0);
    if p.impact_score == 0.0 {
        p.impact_score = 5.0;
    }
    p.impact_score = p.impact_score.clamp(1.0, 10.0);
    if p.estimated_complexity.is_empty() {
        p.estimated_complexity = "moderate".to_string();
    }
}

/// For each accepted proposal without target symbols: when *every*
/// concrete file resolves in the symbol map, attach the union of those
/// files' top-level symbol names. Any unresolved file leaves the proposal
/// alone so the conflict detector stays path-based for it.
pub fn enrich_with_symbols(proposals: &mut [Proposal], symbol_map: &HashMap<String, Vec<SymbolRange>>) {
    for proposal in proposals.iter_mut() {
        if proposal.target_symbols.is_some() {
            continue;
        }
        let concrete: Vec<&String> = proposal.files.iter().filter(|f| !f.contains('*')).collect();
        if concrete.is_empty() {
            continue;
        }
        let mut symbols: Vec<String> = Vec::new();
        let mut all_resolved = true;
        for file in concrete {
            match symbol_map.get(file.as_str()) {
                Some(ranges) if !ranges.is_empty() => {
                    for r in ranges {
                        if !symbols.contains(&r.name) {
                            symbols.push(r.name.clone());
                        }
                    }
                }
                _ => {
                    all_resolved = false;
                    break;
                }
            }
        }
        if all_resolved && !symbols.is_empty() {
            proposal.target_symbols = Some(symbols);
        }
    }
}

/// Test proposals that point at production files get their scope expanded
/// to the sibling test files, the project test roots, and the runner
/// config files QA needs to touch.
pub fn expand_test_targets(proposal: &mut Proposal) {
    if proposal.category != "test" {
        return;
    }
    let mut additions: Vec<String> = Vec::new();
    for path in &proposal.allowed_paths {
        if path.contains(".test.") || path.contains(".spec.") || path.contains("__tests__") {
            continue;
        }
        if let Some(idx) = path.rfind('.') {
            let (stem, ext) = path.split_at(idx);
            additions.push(format!("{stem}.test{ext}"));
            additions.push(format!("{stem}.spec{ext}"));
        }
        if let Some(dir_end) = path.rfind('/') {
            additions.push(format!("{}/__tests__/**", &path[..dir_end]));
        }
    }
    additions.push("tests/**".to_string());
    additions.extend(TEST_SUPPORT_FILES.iter().map(|f| f.to_string()));

    for add in additions {
        if !proposal.allowed_paths.contains(&add) {
            proposal.allowed_paths.push(add);
        }
    }
}

/// Create one ticket per accepted proposal in a single transaction and
/// emit TICKETS_CREATED on the scout run. Returns the new ticket ids.
pub fn create_tickets(
    store: &Store,
    project_id: &str,
    scout_run_id: &str,
    shard: &str,
    proposals: &[Proposal],
    config: &PipelineConfig,
) -> Result<Vec<String>> {
    let now = Utc::now();
    let tickets: Vec<Ticket> = proposals
        .iter()
        .map(|p| Ticket {
            id: format!("tck_{}", uuid::Uuid::new_v4().simple()),
            project_id: project_id.to_string(),
            title: p.title.clone(),
            description: describe(p),
            status: TicketStatus::Ready,
            priority: (p.impact_score * p.confidence) as i64,
            shard: shard.to_string(),
            category: p.category.clone(),
            allowed_paths: p.allowed_paths.clone(),
            forbidden_paths: Vec::new(),
            verification_commands: p.verification_commands.clone(),
            max_retries: config.default_max_retries,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        })
        .collect();

    store.insert_tickets(&tickets)?;
    let ids: Vec<String> = tickets.iter().map(|t| t.id.clone()).collect();
    store.append_run_event(
        scout_run_id,
        RunEventType::TicketsCreated,
        &serde_json::json!({ "ticket_ids": ids }),
    )?;
    info!(count = ids.len(), scout_run_id, "created tickets from proposals");
    Ok(ids)
}

fn describe(p: &Proposal) -> String {
    let mut out = p.description.clone();
    if !p.acceptance_criteria.is_empty() {
        out.push_str("\n\nAcceptance criteria:\n");
        for c in &p.acceptance_criteria {
            out.push_str(&format!("- {c}\n"));
        }
    }
    if !p.rationale.is_empty() {
        out.push_str(&format!("\nRationale: {}\n", p.rationale));
    }
    out.push_str(&format!("\nRollback: {}", p.rollback_note));
    out
}

/// Risk as an ordering key for displays.
pub fn risk_rank(risk: Risk) -> u8 {
    match risk {
        Risk::Low => 0,
        Risk::Medium => 1,
        Risk::High => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(title: &str, confidence: f64, category: &str) -> Value {
        json!({
            "category": category,
            "title": title,
            "description": "desc",
            "allowed_paths": ["src/**"],
            "files": ["src/a.ts"],
            "confidence": confidence,
            "verification_commands": ["true"],
            "risk": "low",
            "touched_files_estimate": 1,
            "rollback_note": "revert",
            "impact_score": 5,
        })
    }

    #[test]
    fn missing_fields_are_listed() {
        let bad = json!({ "title": "no category", "description": "x" });
        let out = filter_proposals(&[bad], &[], &PipelineConfig::default());
        assert!(out.accepted.is_empty());
        match &out.rejected[0] {
            Rejection::MissingFields { fields, .. } => {
                assert!(fields.contains(&"category".to_string()));
                assert!(fields.contains(&"confidence".to_string()));
            }
            other => panic!("expected missing fields, got {other:?}"),
        }
    }

    #[test]
    fn confidence_floor_and_category_ladder() {
        let out = filter_proposals(
            &[raw("low confidence", 10.0, "fix"), raw("wrong category", 90.0, "yolo")],
            &[],
            &PipelineConfig::default(),
        );
        assert!(out.accepted.is_empty());
        assert_eq!(out.rejected.len(), 2);
    }

    #[test]
    fn dedup_against_existing_and_batch() {
        let existing = vec!["Add retry limit to ticket scheduler".to_string()];
        let out = filter_proposals(
            &[
                raw("Add retry limits to the ticket scheduler", 80.0, "fix"),
                raw("Tighten lease reclaim logic", 70.0, "fix"),
                raw("Tighten the lease reclaim logic", 75.0, "fix"),
            ],
            &existing,
            &PipelineConfig::default(),
        );
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.accepted[0].title, "Tighten lease reclaim logic");
        assert_eq!(out.rejected.len(), 2);
    }

    #[test]
    fn scoring_sorts_and_caps() {
        let config = PipelineConfig { max_proposals_per_scout: 2, ..Default::default() };
        let mut high = raw("completely distinct alpha work", 90.0, "fix");
        high["impact_score"] = json!(9);
        let mid = raw("unrelated beta improvement", 80.0, "fix");
        let low = raw("orthogonal gamma cleanup task", 50.0, "cleanup");
        let out = filter_proposals(&[low, high, mid], &[], &config);
        assert_eq!(out.accepted.len(), 2);
        assert_eq!(out.accepted[0].title, "completely distinct alpha work");
        assert!(out
            .rejected
            .iter()
            .any(|r| matches!(r, Rejection::OverBudget { title } if title.contains("gamma"))));
    }

    #[test]
    fn normalization_clamps_and_defaults() {
        let mut value = raw("clamped", 160.0, "fix");
        value["impact_score"] = json!(40);
        let out = filter_proposals(&[value], &[], &PipelineConfig::default());
        let p = &out.accepted[0];
        assert!((p.confidence - 100.0).abs() < 1e-9);
        assert!((p.impact_score - 10.0).abs() < 1e-9);
        assert_eq!(p.estimated_complexity, "moderate");
    }

    #[test]
    fn symbol_enrichment_requires_full_resolution() {
        let mut proposals = vec![
            serde_json::from_value::<Proposal>(raw("one", 80.0, "fix")).expect("parse"),
        ];
        let mut map = HashMap::new();
        map.insert(
            "src/a.ts".to_string(),
            vec![SymbolRange { name: "foo".into(), start_line: 1, end_line: 3 }],
        );
        enrich_with_symbols(&mut proposals, &map);
        assert_eq!(proposals[0].target_symbols, Some(vec!["foo".to_string()]));

        // A second file with no symbol data blocks enrichment entirely.
        let mut p2 = serde_json::from_value::<Proposal>(raw("two", 80.0, "fix")).expect("parse");
        p2.files.push("src/unknown.ts".to_string());
        let mut list = vec![p2];
        enrich_with_symbols(&mut list, &map);
        assert!(list[0].target_symbols.is_none());
    }

    #[test]
    fn test_target_expansion_adds_siblings_and_configs() {
        let mut p = serde_json::from_value::<Proposal>(raw("cover utils", 80.0, "test")).expect("parse");
        p.allowed_paths = vec!["src/utils.ts".to_string()];
        expand_test_targets(&mut p);
        assert!(p.allowed_paths.contains(&"src/utils.test.ts".to_string()));
        assert!(p.allowed_paths.contains(&"src/utils.spec.ts".to_string()));
        assert!(p.allowed_paths.contains(&"src/__tests__/**".to_string()));
        assert!(p.allowed_paths.contains(&"tests/**".to_string()));
        assert!(p.allowed_paths.contains(&"package.json".to_string()));
    }

    #[test]
    fn ticket_creation_is_atomic_and_emits_event() {
        let store = Store::open_in_memory().expect("store");
        let project = store.upsert_project("demo", "", "/repo").expect("project");
        let run = store
            .create_run(&project.id, None, crate::types::RunType::Scout, 1)
            .expect("run");

        let proposals: Vec<Proposal> = vec![
            serde_json::from_value(raw("first distinct title", 80.0, "fix")).expect("parse"),
            serde_json::from_value(raw("second unrelated work", 70.0, "docs")).expect("parse"),
        ];
        let ids = create_tickets(
            &store,
            &project.id,
            &run.id,
            "src",
            &proposals,
            &PipelineConfig::default(),
        )
        .expect("create");
        assert_eq!(ids.len(), 2);

        let tickets = store.list_tickets(&project.id, Some(TicketStatus::Ready)).expect("list");
        assert_eq!(tickets.len(), 2);

        let events = store.list_run_events(&run.id).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, RunEventType::TicketsCreated);
    }
}
