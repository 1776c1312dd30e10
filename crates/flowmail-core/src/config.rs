//! On-disk JSON configuration with environment variable overrides.
//!
//! Precedence, low to high: built-in defaults, the JSON file on disk,
//! then environment variables — either the flat names from the external
//! interface table (`MAILGUN_KEY`, `LLM_MODEL_DEFAULT`, ...) or the
//! structured `FLOWMAIL_<SECTION>__<FIELD>` form. The structured form
//! wins when both are set.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::utils::{expand_home, get_data_path};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "development" | "dev" => Some(Environment::Development),
            "production" | "prod" => Some(Environment::Production),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub max_rounds_default: u32,
    pub timeout_minutes_default: i64,
    pub tool_loop_cap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_rounds_default: 10,
            timeout_minutes_default: 30,
            tool_loop_cap: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub mailgun_key: Option<String>,
    pub mailgun_domain: Option<String>,
    /// Shared secret compared against the webhook's `token` field or
    /// `X-Inbound-Token` header. Absent ⇒ the check is disabled.
    pub inbound_token: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    /// Model used for decision calls without tools.
    pub model_default: String,
    /// Model used for tool-loop calls.
    pub model_tools: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            api_key: None,
            api_base: "https://api.openai.com/v1".to_string(),
            model_default: "gpt-4o-mini".to_string(),
            model_tools: "gpt-4o".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub env: Environment,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

pub fn get_config_path() -> PathBuf {
    if let Ok(p) = std::env::var("FLOWMAIL_CONFIG_PATH") {
        return PathBuf::from(expand_home(&p));
    }
    get_data_path().join("config.json")
}

pub fn load_config() -> Result<Config> {
    load_config_from_path(&get_config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        serde_json::from_value(value)?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Reads structured `FLOWMAIL_<SECTION>__<FIELD>` vars, falling back to
/// the flat names from the external interface contract, and layers them
/// on top of whatever the JSON file provided.
fn apply_env_overrides(config: &mut Config) {
    if let Some(env) = env_var("FLOWMAIL_ENV", &["NODE_ENV", "ENV"]) {
        if let Some(parsed) = Environment::parse(&env) {
            config.env = parsed;
        }
    }

    if let Some(v) = env_var("FLOWMAIL_ENGINE__MAX_ROUNDS_DEFAULT", &["MAX_ROUNDS_DEFAULT"]) {
        if let Ok(n) = v.parse() {
            config.engine.max_rounds_default = n;
        }
    }
    if let Some(v) = env_var(
        "FLOWMAIL_ENGINE__TIMEOUT_MINUTES_DEFAULT",
        &["TIMEOUT_MINUTES_DEFAULT"],
    ) {
        if let Ok(n) = v.parse() {
            config.engine.timeout_minutes_default = n;
        }
    }
    if let Some(v) = env_var("FLOWMAIL_ENGINE__TOOL_LOOP_CAP", &["TOOL_LOOP_CAP"]) {
        if let Ok(n) = v.parse() {
            config.engine.tool_loop_cap = n;
        }
    }

    if let Some(v) = env_var("FLOWMAIL_GATEWAY__MAILGUN_KEY", &["MAILGUN_KEY"]) {
        config.gateway.mailgun_key = Some(v);
    }
    if let Some(v) = env_var("FLOWMAIL_GATEWAY__MAILGUN_DOMAIN", &["MAILGUN_DOMAIN"]) {
        config.gateway.mailgun_domain = Some(v);
    }
    if let Some(v) = env_var("FLOWMAIL_GATEWAY__INBOUND_TOKEN", &["INBOUND_TOKEN"]) {
        config.gateway.inbound_token = Some(v);
    }

    if let Some(v) = env_var("FLOWMAIL_LLM__API_KEY", &["LLM_API_KEY"]) {
        config.llm.api_key = Some(v);
    }
    if let Some(v) = env_var("FLOWMAIL_LLM__MODEL_DEFAULT", &["LLM_MODEL_DEFAULT"]) {
        config.llm.model_default = v;
    }
    if let Some(v) = env_var("FLOWMAIL_LLM__MODEL_TOOLS", &["LLM_MODEL_TOOLS"]) {
        config.llm.model_tools = v;
    }

    if let Some(v) = env_var("FLOWMAIL_SERVER__HOST", &[]) {
        config.server.host = v;
    }
    if let Some(v) = env_var("FLOWMAIL_SERVER__PORT", &[]) {
        if let Ok(p) = v.parse() {
            config.server.port = p;
        }
    }
}

/// Looks up `structured` first; if unset, tries each of `flat` in order.
fn env_var(structured: &str, flat: &[&str]) -> Option<String> {
    if let Ok(v) = std::env::var(structured) {
        return Some(v);
    }
    for name in flat {
        if let Ok(v) = std::env::var(name) {
            return Some(v);
        }
    }
    None
}
