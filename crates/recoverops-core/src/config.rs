use std::collections::HashMap;

use anyhow::Result;

use crate::db::Db;

/// Full application configuration.
/// Non-sensitive fields are seeded to and loaded from the DB `config` table.
/// Sensitive fields (tokens, secrets, API keys) come from env/.env only.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    // Web server
    pub web_bind: String,
    pub web_port: u16,

    // Remediation policy
    pub auto_remediation_enabled: bool,
    pub max_concurrent_remediations: u32,
    /// Analyses above this confidence may use the model for fix generation.
    pub ai_confidence_threshold: f64,
    pub remediation_timeout_s: u64,
    pub rollback_timeout_s: u64,
    pub dedup_window_s: i64,
    /// PRs are squash-merged above this confidence when auto-remediation is on.
    pub auto_merge_confidence: f64,
    pub fix_branch_prefix: String,

    // Language model
    /// "openai", "ollama", or empty for heuristics only.
    pub llm_backend: String,
    pub llm_timeout_s: u64,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: String,
    pub ollama_url: String,
    pub ollama_model: String,

    // Platforms
    pub github_token: String,
    pub github_webhook_secret: String,
    pub github_api_url: String,
    pub gitlab_webhook_secret: String,
    pub infra_api_url: String,
    pub infra_api_token: String,
    pub slack_webhook_url: String,
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

fn get(key: &str, vars: &HashMap<String, String>) -> Option<String> {
    vars.get(key).cloned()
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_f64(key: &str, dotenv: &HashMap<String, String>, default: f64) -> f64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self::from_map(&HashMap::new())
    }
}

impl Config {
    /// Keys exposed through the settings API, in display order.
    pub const SETTINGS_KEYS: &'static [&'static str] = &[
        "auto_remediation_enabled",
        "max_concurrent_remediations",
        "ai_confidence_threshold",
        "remediation_timeout",
        "rollback_timeout",
        "dedup_window_secs",
        "auto_merge_confidence",
        "fix_branch_prefix",
        "llm_backend",
        "llm_timeout",
        "openai_model",
        "ollama_url",
        "ollama_model",
    ];

    /// Write all non-sensitive fields to DB if not already present (first-run seeding).
    pub fn seed_db(&self, db: &Db) -> Result<()> {
        let entries: &[(&str, String)] = &[
            (
                "auto_remediation_enabled",
                self.auto_remediation_enabled.to_string(),
            ),
            (
                "max_concurrent_remediations",
                self.max_concurrent_remediations.to_string(),
            ),
            (
                "ai_confidence_threshold",
                self.ai_confidence_threshold.to_string(),
            ),
            ("remediation_timeout", self.remediation_timeout_s.to_string()),
            ("rollback_timeout", self.rollback_timeout_s.to_string()),
            ("dedup_window_secs", self.dedup_window_s.to_string()),
            ("auto_merge_confidence", self.auto_merge_confidence.to_string()),
            ("fix_branch_prefix", self.fix_branch_prefix.clone()),
            ("llm_backend", self.llm_backend.clone()),
            ("llm_timeout", self.llm_timeout_s.to_string()),
            ("openai_model", self.openai_model.clone()),
            ("ollama_url", self.ollama_url.clone()),
            ("ollama_model", self.ollama_model.clone()),
        ];
        let conn_guard = db.raw_conn();
        let conn = conn_guard.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in entries {
            conn.execute(
                "INSERT OR IGNORE INTO config (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
                rusqlite::params![key, value],
            )?;
        }
        Ok(())
    }

    /// Return a new Config with non-sensitive fields overridden from DB values.
    pub fn load_from_db(&self, db: &Db) -> Self {
        let mut c = self.clone();
        let get = |key: &str| db.get_config(key).ok().flatten();
        let get_str = |key: &str, cur: &str| get(key).unwrap_or_else(|| cur.to_string());
        let get_bool =
            |key: &str, cur: bool| get(key).map(|v| v == "true" || v == "1").unwrap_or(cur);
        macro_rules! load_parsed {
            ($key:expr, $field:expr) => {
                if let Some(v) = get($key).and_then(|s| s.parse().ok()) {
                    $field = v;
                }
            };
        }
        c.auto_remediation_enabled = get_bool("auto_remediation_enabled", c.auto_remediation_enabled);
        c.fix_branch_prefix = get_str("fix_branch_prefix", &c.fix_branch_prefix);
        c.llm_backend = get_str("llm_backend", &c.llm_backend);
        c.openai_model = get_str("openai_model", &c.openai_model);
        c.ollama_url = get_str("ollama_url", &c.ollama_url);
        c.ollama_model = get_str("ollama_model", &c.ollama_model);
        load_parsed!("max_concurrent_remediations", c.max_concurrent_remediations);
        load_parsed!("ai_confidence_threshold", c.ai_confidence_threshold);
        load_parsed!("remediation_timeout", c.remediation_timeout_s);
        load_parsed!("rollback_timeout", c.rollback_timeout_s);
        load_parsed!("dedup_window_secs", c.dedup_window_s);
        load_parsed!("auto_merge_confidence", c.auto_merge_confidence);
        load_parsed!("llm_timeout", c.llm_timeout_s);
        c
    }

    /// Insecure or degraded settings worth flagging at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.github_webhook_secret.is_empty() {
            out.push("GITHUB_WEBHOOK_SECRET not set; GitHub webhook signatures are not verified".into());
        }
        if self.gitlab_webhook_secret.is_empty() {
            out.push("GITLAB_WEBHOOK_SECRET not set; GitLab webhook tokens are not verified".into());
        }
        match self.llm_backend.as_str() {
            "" => out.push("LLM_BACKEND not set; analysis and fixes use heuristics only".into()),
            "openai" if self.openai_api_key.is_empty() => {
                out.push("LLM_BACKEND=openai but OPENAI_API_KEY is empty".into())
            }
            "openai" | "ollama" => {}
            other => out.push(format!("unknown LLM_BACKEND {other:?}; using heuristics only")),
        }
        if self.github_token.is_empty() {
            out.push("GITHUB_TOKEN not set; pull-request remediations will fail".into());
        }
        if self.infra_api_url.is_empty() {
            out.push("INFRA_API_URL not set; restart/scale remediations will fail".into());
        }
        if !(0.0..=1.0).contains(&self.ai_confidence_threshold) {
            out.push(format!(
                "AI_CONFIDENCE_THRESHOLD {} is outside [0, 1]",
                self.ai_confidence_threshold
            ));
        }
        out
    }

    pub fn db_path(&self) -> String {
        format!("{}/recoverops.db", self.data_dir)
    }

    pub fn from_env() -> Result<Self> {
        let mut vars = parse_dotenv();
        // Process env wins over .env.
        for (k, v) in std::env::vars() {
            vars.insert(k, v);
        }
        Ok(Self::from_map(&vars))
    }

    fn from_map(vars: &HashMap<String, String>) -> Self {
        Config {
            data_dir: get_str("DATA_DIR", vars, "store"),
            web_bind: get_str("WEB_BIND", vars, "127.0.0.1"),
            web_port: get_u16("WEB_PORT", vars, 8000),
            auto_remediation_enabled: get_bool("AUTO_REMEDIATION_ENABLED", vars, true),
            max_concurrent_remediations: get_u32("MAX_CONCURRENT_REMEDIATIONS", vars, 5),
            ai_confidence_threshold: get_f64("AI_CONFIDENCE_THRESHOLD", vars, 0.8),
            remediation_timeout_s: get_u64("REMEDIATION_TIMEOUT", vars, 300),
            rollback_timeout_s: get_u64("ROLLBACK_TIMEOUT", vars, 600),
            dedup_window_s: get_i64("DEDUP_WINDOW_SECS", vars, 3600),
            auto_merge_confidence: get_f64("AUTO_MERGE_CONFIDENCE", vars, 0.9),
            fix_branch_prefix: get_str("FIX_BRANCH_PREFIX", vars, "ai-fix"),
            llm_backend: get_str("LLM_BACKEND", vars, ""),
            llm_timeout_s: get_u64("LLM_TIMEOUT", vars, 60),
            openai_api_key: get_str("OPENAI_API_KEY", vars, ""),
            openai_model: get_str("OPENAI_MODEL", vars, "gpt-4"),
            openai_base_url: get_str("OPENAI_BASE_URL", vars, "https://api.openai.com/v1"),
            ollama_url: get_str("OLLAMA_URL", vars, "http://localhost:11434"),
            ollama_model: get_str("OLLAMA_MODEL", vars, "llama3"),
            github_token: get_str("GITHUB_TOKEN", vars, ""),
            github_webhook_secret: get_str("GITHUB_WEBHOOK_SECRET", vars, ""),
            github_api_url: get_str("GITHUB_API_URL", vars, "https://api.github.com"),
            gitlab_webhook_secret: get_str("GITLAB_WEBHOOK_SECRET", vars, ""),
            infra_api_url: get_str("INFRA_API_URL", vars, ""),
            infra_api_token: get_str("INFRA_API_TOKEN", vars, ""),
            slack_webhook_url: get_str("SLACK_WEBHOOK_URL", vars, ""),
        }
    }
}
