//! Engine configuration from environment / .env file.

use std::collections::HashMap;

use anyhow::Result;

use crate::conflict::Sensitivity;

/// Full engine configuration. One instance per session, immutable after
/// load.
#[derive(Debug, Clone)]
pub struct Config {
    /// Repository the engine operates on.
    pub repo_path: String,
    /// Branch tickets start from and PRs target.
    pub base_branch: String,
    pub milestone_branch: String,
    /// When set, pushes are refused unless origin matches.
    pub allowed_remote: String,

    // Agent
    pub backend: String,
    pub model: String,
    pub agent_timeout_ms: u64,
    pub kill_grace_ms: u64,

    // Loop
    pub parallel: usize,
    pub lease_ttl_s: i64,
    pub heartbeat_interval_s: i64,
    pub ticket_step_budget: usize,
    pub max_lines_per_ticket: usize,
    pub min_confidence: f64,
    pub max_proposals_per_scout: usize,
    pub default_max_retries: i64,
    pub sensitivity: Sensitivity,

    // Spindle
    pub token_budget_abort: u64,
    pub max_stall_iterations: usize,

    // Integrations
    pub integration_timeout_ms: u64,
    pub enable_custom_tools: bool,

    // PR
    pub create_pr: bool,
    pub draft_pr: bool,
    pub skip_qa: bool,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_f64(key: &str, dotenv: &HashMap<String, String>, default: f64) -> f64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let sensitivity = match get_str("PROMPTWHEEL_SENSITIVITY", &dotenv, "normal").as_str() {
            "strict" => Sensitivity::Strict,
            "relaxed" => Sensitivity::Relaxed,
            _ => Sensitivity::Normal,
        };

        Ok(Config {
            repo_path: get_str("PROMPTWHEEL_REPO", &dotenv, "."),
            base_branch: get_str("PROMPTWHEEL_BASE_BRANCH", &dotenv, "main"),
            milestone_branch: get_str(
                "PROMPTWHEEL_MILESTONE_BRANCH",
                &dotenv,
                "promptwheel/milestone",
            ),
            allowed_remote: get_str("PROMPTWHEEL_ALLOWED_REMOTE", &dotenv, ""),
            backend: get_str("PROMPTWHEEL_BACKEND", &dotenv, "claude"),
            model: get_str("PROMPTWHEEL_MODEL", &dotenv, "claude-sonnet-4-6"),
            agent_timeout_ms: get_u64("PROMPTWHEEL_AGENT_TIMEOUT_MS", &dotenv, 1_200_000),
            kill_grace_ms: get_u64("PROMPTWHEEL_KILL_GRACE_MS", &dotenv, 5_000),
            parallel: get_usize("PROMPTWHEEL_PARALLEL", &dotenv, 2).max(1),
            lease_ttl_s: get_i64("PROMPTWHEEL_LEASE_TTL_S", &dotenv, 900),
            heartbeat_interval_s: get_i64("PROMPTWHEEL_HEARTBEAT_S", &dotenv, 60),
            ticket_step_budget: get_usize("PROMPTWHEEL_STEP_BUDGET", &dotenv, 120),
            max_lines_per_ticket: get_usize("PROMPTWHEEL_MAX_LINES", &dotenv, 400),
            min_confidence: get_f64("PROMPTWHEEL_MIN_CONFIDENCE", &dotenv, 40.0),
            max_proposals_per_scout: get_usize("PROMPTWHEEL_MAX_PROPOSALS", &dotenv, 6),
            default_max_retries: get_i64("PROMPTWHEEL_MAX_RETRIES", &dotenv, 2),
            sensitivity,
            token_budget_abort: get_u64("PROMPTWHEEL_TOKEN_BUDGET", &dotenv, 400_000),
            max_stall_iterations: get_usize("PROMPTWHEEL_MAX_STALL", &dotenv, 8),
            integration_timeout_ms: get_u64("PROMPTWHEEL_INTEGRATION_TIMEOUT_MS", &dotenv, 60_000),
            enable_custom_tools: get_bool("PROMPTWHEEL_ENABLE_CUSTOM_TOOLS", &dotenv, false),
            create_pr: get_bool("PROMPTWHEEL_CREATE_PR", &dotenv, true),
            draft_pr: get_bool("PROMPTWHEEL_DRAFT_PR", &dotenv, false),
            skip_qa: get_bool("PROMPTWHEEL_SKIP_QA", &dotenv, false),
        })
    }

    /// The repo's engine metadata directory.
    pub fn data_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.repo_path).join(".promptwheel")
    }
}
