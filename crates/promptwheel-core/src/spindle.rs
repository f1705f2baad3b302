//! Spindle: detects an agent run that is no longer making progress and
//! produces the abort diagnosis the orchestrator consumes as the failure
//! reason. Triggers are checked in a fixed order on every observation:
//! oscillation → spinning → qa ping-pong → token budget → stall.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::similarity::word_bigram_jaccard;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpindleThresholds {
    /// Same (A, B) action pair repeated this many times aborts.
    pub oscillation_repeats: usize,
    /// Output fragments compared pairwise for the spinning check.
    pub similarity_window: usize,
    /// Minimum pairwise similarity that counts as spinning.
    pub similarity_threshold: f64,
    /// A fixed test reappearing in QA failures this many times aborts.
    pub qa_ping_pong_rounds: usize,
    /// Estimated token ceiling for one run.
    pub token_budget_abort: u64,
    /// Consecutive steps without a tool invocation before a stall abort.
    pub max_stall_iterations: usize,
}

impl Default for SpindleThresholds {
    fn default() -> Self {
        Self {
            oscillation_repeats: 3,
            similarity_window: 4,
            similarity_threshold: 0.9,
            qa_ping_pong_rounds: 3,
            token_budget_abort: 400_000,
            max_stall_iterations: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpindleTrigger {
    Oscillation,
    Spinning,
    QaPingPong,
    TokenBudget,
    Stall,
}

impl SpindleTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oscillation => "oscillation",
            Self::Spinning => "spinning",
            Self::QaPingPong => "qa_ping_pong",
            Self::TokenBudget => "token_budget",
            Self::Stall => "stall",
        }
    }
}

/// The abort diagnosis; serialized as the run's spindle artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpindleReport {
    pub reason: String,
    pub trigger: SpindleTrigger,
    pub confidence: f64,
    pub estimated_tokens: u64,
    pub iteration: usize,
    pub thresholds: SpindleThresholds,
    pub metrics: SpindleMetrics,
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpindleMetrics {
    pub actions_observed: usize,
    pub outputs_observed: usize,
    pub qa_rounds: usize,
    pub steps_since_tool: usize,
    pub last_similarity: f64,
}

/// Live state for one run attempt. Reset between attempts.
#[derive(Debug)]
pub struct Spindle {
    thresholds: SpindleThresholds,
    actions: Vec<String>,
    outputs: Vec<String>,
    qa_failure_history: Vec<HashSet<String>>,
    reappeared_tests: usize,
    estimated_tokens: u64,
    steps_since_tool: usize,
    iteration: usize,
    metrics: SpindleMetrics,
}

impl Spindle {
    pub fn new(thresholds: SpindleThresholds) -> Self {
        Self {
            thresholds,
            actions: Vec::new(),
            outputs: Vec::new(),
            qa_failure_history: Vec::new(),
            reappeared_tests: 0,
            estimated_tokens: 0,
            steps_since_tool: 0,
            iteration: 0,
            metrics: SpindleMetrics::default(),
        }
    }

    /// Begin a fresh attempt: action and output history reset, token
    /// accounting carries over (the budget is per run, not per attempt).
    pub fn reset_attempt(&mut self) {
        self.actions.clear();
        self.outputs.clear();
        self.qa_failure_history.clear();
        self.reappeared_tests = 0;
        self.steps_since_tool = 0;
    }

    /// A tool invocation: `name` plus its primary target (file, command).
    pub fn observe_action(&mut self, name: &str, target: &str) -> Option<SpindleReport> {
        self.actions.push(format!("{name}\u{1}{target}"));
        self.steps_since_tool = 0;
        self.metrics.actions_observed += 1;
        self.check()
    }

    /// A text output fragment from the agent.
    pub fn observe_output(&mut self, text: &str) -> Option<SpindleReport> {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            self.outputs.push(trimmed.to_string());
            if self.outputs.len() > self.thresholds.similarity_window * 4 {
                self.outputs.remove(0);
            }
        }
        self.estimated_tokens += (text.len() as u64).div_ceil(4);
        self.metrics.outputs_observed += 1;
        self.check()
    }

    /// One QA round's failing test names.
    pub fn observe_qa_failures(&mut self, failed: &[String]) -> Option<SpindleReport> {
        let current: HashSet<String> = failed.iter().cloned().collect();
        let previously_fixed: HashSet<String> = self
            .qa_failure_history
            .iter()
            .flatten()
            .filter(|t| {
                self.qa_failure_history
                    .last()
                    .map(|last| !last.contains(*t))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        self.reappeared_tests += current.intersection(&previously_fixed).count();
        self.qa_failure_history.push(current);
        self.metrics.qa_rounds += 1;
        self.check()
    }

    /// A step boundary with no tool invocation in it.
    pub fn observe_idle_step(&mut self) -> Option<SpindleReport> {
        self.steps_since_tool += 1;
        self.iteration += 1;
        self.check()
    }

    pub fn note_iteration(&mut self) {
        self.iteration += 1;
    }

    pub fn estimated_tokens(&self) -> u64 {
        self.estimated_tokens
    }

    fn check(&mut self) -> Option<SpindleReport> {
        self.metrics.steps_since_tool = self.steps_since_tool;

        if let Some(pair) = self.oscillating_pair() {
            return Some(self.report(
                SpindleTrigger::Oscillation,
                format!("action pair ({pair}) repeated {} times", self.thresholds.oscillation_repeats),
                0.9,
                vec!["break the A/B edit cycle; re-read the failing output before editing".into()],
            ));
        }
        if let Some(similarity) = self.spinning_similarity() {
            self.metrics.last_similarity = similarity;
            return Some(self.report(
                SpindleTrigger::Spinning,
                format!("last {} outputs are {similarity:.2} similar", self.thresholds.similarity_window),
                0.8,
                vec!["the agent is restating itself; abort and retry with a hint".into()],
            ));
        }
        if self.reappeared_tests >= self.thresholds.qa_ping_pong_rounds {
            return Some(self.report(
                SpindleTrigger::QaPingPong,
                format!("{} tests re-broken after being fixed", self.reappeared_tests),
                0.85,
                vec!["fix the whole failing set at once instead of one test at a time".into()],
            ));
        }
        if self.estimated_tokens > self.thresholds.token_budget_abort {
            return Some(self.report(
                SpindleTrigger::TokenBudget,
                format!(
                    "estimated {} tokens exceeds budget {}",
                    self.estimated_tokens, self.thresholds.token_budget_abort
                ),
                1.0,
                vec!["scope is too large for one run; narrow the ticket".into()],
            ));
        }
        if self.steps_since_tool >= self.thresholds.max_stall_iterations {
            return Some(self.report(
                SpindleTrigger::Stall,
                format!("no tool invocation for {} steps", self.steps_since_tool),
                0.7,
                vec!["agent stopped acting; skip and surface the transcript".into()],
            ));
        }
        None
    }

    fn oscillating_pair(&self) -> Option<String> {
        let n = self.actions.len();
        if n < 4 {
            return None;
        }
        let (a, b) = (&self.actions[n - 2], &self.actions[n - 1]);
        if a == b {
            return None;
        }
        let mut repeats = 0;
        let mut i = n;
        while i >= 2 && &self.actions[i - 2] == a && &self.actions[i - 1] == b {
            repeats += 1;
            i -= 2;
        }
        if repeats >= self.thresholds.oscillation_repeats {
            let label = |s: &str| s.split('\u{1}').next().unwrap_or("").to_string();
            Some(format!("{}, {}", label(a), label(b)))
        } else {
            None
        }
    }

    fn spinning_similarity(&self) -> Option<f64> {
        let w = self.thresholds.similarity_window;
        if self.outputs.len() < w {
            return None;
        }
        let window = &self.outputs[self.outputs.len() - w..];
        let mut min_sim = 1.0f64;
        for i in 0..window.len() {
            for j in (i + 1)..window.len() {
                let sim = word_bigram_jaccard(&window[i], &window[j]);
                if sim < min_sim {
                    min_sim = sim;
                }
            }
        }
        (min_sim >= self.thresholds.similarity_threshold).then_some(min_sim)
    }

    fn report(
        &self,
        trigger: SpindleTrigger,
        reason: String,
        confidence: f64,
        recommendations: Vec<String>,
    ) -> SpindleReport {
        SpindleReport {
            reason,
            trigger,
            confidence,
            estimated_tokens: self.estimated_tokens,
            iteration: self.iteration,
            thresholds: self.thresholds.clone(),
            metrics: self.metrics.clone(),
            recommendations,
            artifact_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oscillation_fires_on_repeated_pair() {
        let mut s = Spindle::new(SpindleThresholds::default());
        for _ in 0..2 {
            assert!(s.observe_action("Edit", "src/a.rs").is_none());
            assert!(s.observe_action("Bash", "cargo test").is_none());
        }
        s.observe_action("Edit", "src/a.rs");
        let report = s.observe_action("Bash", "cargo test").expect("oscillation");
        assert_eq!(report.trigger, SpindleTrigger::Oscillation);
        assert!(report.reason.contains("Edit"));
    }

    #[test]
    fn distinct_actions_do_not_oscillate() {
        let mut s = Spindle::new(SpindleThresholds::default());
        for i in 0..12 {
            assert!(s.observe_action("Edit", &format!("src/f{i}.rs")).is_none());
        }
    }

    #[test]
    fn spinning_fires_on_near_identical_outputs() {
        let mut s = Spindle::new(SpindleThresholds::default());
        let text = "I will now fix the failing test by adjusting the assertion";
        for _ in 0..3 {
            assert!(s.observe_output(text).is_none());
        }
        let report = s.observe_output(text).expect("spinning");
        assert_eq!(report.trigger, SpindleTrigger::Spinning);
        assert!(report.metrics.last_similarity >= 0.9);
    }

    #[test]
    fn varied_outputs_do_not_spin() {
        let mut s = Spindle::new(SpindleThresholds::default());
        let outputs = [
            "reading the scheduler module to understand wave assembly",
            "the bug is in the retry counter, it resets on lease expiry",
            "adding a regression test for the lease reclaim path",
            "all verification commands pass, committing the change",
        ];
        for o in outputs {
            assert!(s.observe_output(o).is_none());
        }
    }

    #[test]
    fn qa_ping_pong_counts_reappearing_tests() {
        let mut s = Spindle::new(SpindleThresholds::default());
        let a = vec!["test_a".to_string()];
        let b = vec!["test_b".to_string()];
        assert!(s.observe_qa_failures(&a).is_none());
        assert!(s.observe_qa_failures(&b).is_none()); // a fixed
        assert!(s.observe_qa_failures(&a).is_none()); // a re-broken (1), b fixed
        assert!(s.observe_qa_failures(&b).is_none()); // b re-broken (2), a fixed
        let report = s.observe_qa_failures(&a).expect("ping-pong"); // a re-broken (3)
        assert_eq!(report.trigger, SpindleTrigger::QaPingPong);
    }

    #[test]
    fn token_budget_aborts() {
        let mut s = Spindle::new(SpindleThresholds { token_budget_abort: 10, ..Default::default() });
        let report = s.observe_output("this fragment alone is worth more than ten tokens of budget");
        assert_eq!(report.expect("budget").trigger, SpindleTrigger::TokenBudget);
    }

    #[test]
    fn stall_aborts_after_idle_steps() {
        let mut s = Spindle::new(SpindleThresholds { max_stall_iterations: 3, ..Default::default() });
        assert!(s.observe_idle_step().is_none());
        assert!(s.observe_idle_step().is_none());
        let report = s.observe_idle_step().expect("stall");
        assert_eq!(report.trigger, SpindleTrigger::Stall);
    }

    #[test]
    fn reset_attempt_clears_history_but_keeps_tokens() {
        let mut s = Spindle::new(SpindleThresholds::default());
        s.observe_output("some output to accrue tokens in the estimate");
        let before = s.estimated_tokens();
        s.reset_attempt();
        assert_eq!(s.estimated_tokens(), before);
        assert!(s.observe_action("Edit", "a").is_none());
    }
}
