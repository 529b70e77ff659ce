//! Service settings.
//!
//! Settings load from an optional TOML file, then environment variables
//! override individual keys. The model registry (`[llm.<name>]` sections)
//! maps logical model names to provider/location/tuning and the strictness
//! flag the gateway's request spacer keys on.

use crate::error::{RelayError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_max_parallel_workers() -> usize {
    3
}

fn default_report_llm_concurrency() -> usize {
    1
}

fn default_consult_llm_concurrency() -> usize {
    2
}

fn default_analyst_max_retries() -> u32 {
    1
}

fn default_analyst_timeout_seconds() -> u64 {
    600
}

fn default_recursion_limit() -> usize {
    50
}

fn default_snapshot_throttle() -> u64 {
    12
}

fn default_long_running_threshold() -> u64 {
    20
}

fn default_keepalive() -> u64 {
    30
}

fn default_chat_flow_tag() -> String {
    "opgroeien.poc.chat".to_string()
}

fn default_report_flow_tag() -> String {
    "opgroeien.poc.report".to_string()
}

fn default_chat_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_analyst_model() -> String {
    "gemini-2.5-pro".to_string()
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `CORS_ALLOW_ORIGINS`; `*` allows any origin.
    #[serde(default)]
    pub cors_allow_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_allow_origins: Vec::new(),
        }
    }
}

/// Concurrency and retry limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitSettings {
    /// Fan-out batch size for report analysts.
    #[serde(default = "default_max_parallel_workers")]
    pub max_parallel_workers: usize,
    /// `analyst` pool permits.
    #[serde(default = "default_report_llm_concurrency")]
    pub report_llm_concurrency: usize,
    /// `consult` pool permits.
    #[serde(default = "default_consult_llm_concurrency")]
    pub report_consult_llm_concurrency: usize,
    /// Retry passes for failed chapters.
    #[serde(default = "default_analyst_max_retries")]
    pub analyst_max_retries: u32,
    /// Wall-clock budget of one analyst node.
    #[serde(default = "default_analyst_timeout_seconds")]
    pub analyst_timeout_seconds: u64,
    /// Hard cap on super-steps per run.
    #[serde(default = "default_recursion_limit")]
    pub graph_recursion_limit: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_parallel_workers: default_max_parallel_workers(),
            report_llm_concurrency: default_report_llm_concurrency(),
            report_consult_llm_concurrency: default_consult_llm_concurrency(),
            analyst_max_retries: default_analyst_max_retries(),
            analyst_timeout_seconds: default_analyst_timeout_seconds(),
            graph_recursion_limit: default_recursion_limit(),
        }
    }
}

/// Snapshot and keep-alive cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingSettings {
    #[serde(default = "default_snapshot_throttle")]
    pub snapshot_throttle_interval: u64,
    #[serde(default = "default_long_running_threshold")]
    pub long_running_task_threshold: u64,
    #[serde(default = "default_keepalive")]
    pub report_keepalive_interval: u64,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            snapshot_throttle_interval: default_snapshot_throttle(),
            long_running_task_threshold: default_long_running_threshold(),
            report_keepalive_interval: default_keepalive(),
        }
    }
}

/// One entry of the model registry.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModelSettings {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub thinking_level: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Strict models (Pro tier, 5 RPM) get the 12s request spacing.
    #[serde(default)]
    pub strict_rpm: bool,
}

/// Flow tags and per-role model selection.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowSettings {
    #[serde(default = "default_chat_flow_tag")]
    pub chat_flow_tag: String,
    #[serde(default = "default_report_flow_tag")]
    pub report_flow_tag: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_analyst_model")]
    pub analyst_model: String,
    #[serde(default = "default_analyst_model")]
    pub editor_model: String,
    #[serde(default = "default_chat_model")]
    pub consult_model: String,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            chat_flow_tag: default_chat_flow_tag(),
            report_flow_tag: default_report_flow_tag(),
            chat_model: default_chat_model(),
            analyst_model: default_analyst_model(),
            editor_model: default_analyst_model(),
            consult_model: default_chat_model(),
        }
    }
}

/// Root settings object.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub streaming: StreamingSettings,
    #[serde(default)]
    pub flows: FlowSettings,
    /// Model registry, keyed by logical model name.
    #[serde(default)]
    pub llm: HashMap<String, ModelSettings>,
    /// Path to the YAML user-access map.
    #[serde(default)]
    pub access_config_path: Option<String>,
    /// Directory of YAML prompt templates.
    #[serde(default)]
    pub prompt_dir: Option<String>,
}

impl Settings {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings: Settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| RelayError::Internal(format!("cannot read {}: {e}", path.display())))?;
                toml::from_str(&raw)
                    .map_err(|e| RelayError::Internal(format!("invalid settings file: {e}")))?
            }
            None => Settings::from_defaults(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Pure defaults, no file, no environment.
    pub fn from_defaults() -> Self {
        Self {
            server: ServerSettings::default(),
            database_url: default_database_url(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            limits: LimitSettings::default(),
            streaming: StreamingSettings::default(),
            flows: FlowSettings::default(),
            llm: HashMap::new(),
            access_config_path: None,
            prompt_dir: None,
        }
    }

    fn apply_env(&mut self) {
        env_override("DATABASE_URL", &mut self.database_url);
        env_override("LOG_LEVEL", &mut self.log_level);
        env_override("LOG_FORMAT", &mut self.log_format);
        env_parse("MAX_PARALLEL_WORKERS", &mut self.limits.max_parallel_workers);
        env_parse("REPORT_LLM_CONCURRENCY", &mut self.limits.report_llm_concurrency);
        env_parse(
            "REPORT_CONSULT_LLM_CONCURRENCY",
            &mut self.limits.report_consult_llm_concurrency,
        );
        env_parse("ANALYST_MAX_RETRIES", &mut self.limits.analyst_max_retries);
        env_parse(
            "ANALYST_TIMEOUT_SECONDS",
            &mut self.limits.analyst_timeout_seconds,
        );
        env_parse("GRAPH_RECURSION_LIMIT", &mut self.limits.graph_recursion_limit);
        env_parse(
            "SNAPSHOT_THROTTLE_INTERVAL",
            &mut self.streaming.snapshot_throttle_interval,
        );
        env_parse(
            "LONG_RUNNING_TASK_THRESHOLD",
            &mut self.streaming.long_running_task_threshold,
        );
        env_parse(
            "REPORT_KEEPALIVE_INTERVAL",
            &mut self.streaming.report_keepalive_interval,
        );
        if let Ok(origins) = std::env::var("CORS_ALLOW_ORIGINS") {
            self.server.cors_allow_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    /// Whether a logical model is flagged strict in the registry.
    pub fn model_is_strict(&self, model: &str) -> bool {
        self.llm
            .get(model)
            .map(|m| m.strict_rpm)
            // Convention carried over from the registry defaults: Pro-tier
            // model names are strict even without an explicit entry.
            .unwrap_or_else(|| model.contains("pro"))
    }

    /// Per-model config for a gateway request.
    pub fn model_config(&self, model: &str) -> llm_gateway::ModelConfig {
        let entry = self.llm.get(model);
        llm_gateway::ModelConfig {
            temperature: entry.and_then(|m| m.temperature),
            thinking_level: entry.and_then(|m| m.thinking_level.clone()),
        }
    }
}

fn env_override(key: &str, target: &mut String) {
    if let Ok(value) = std::env::var(key) {
        if !value.is_empty() {
            *target = value;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}
