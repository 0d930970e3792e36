use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-provider API key / base-URL override, keyed by provider id (e.g. `"anthropic"`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderEntry {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Server-wide configuration, loaded the way the teacher's `KrabsConfig` is:
/// a baked-in default, overridden by `~/.cct/config.json`, overridden again by
/// a `.cct.json` in the current directory, with secrets still resolvable from
/// the process environment at the point of use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_session_retention_days")]
    pub session_retention_days: i64,

    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,

    #[serde(default)]
    pub cleanup_enabled: bool,

    #[serde(default = "default_agent_command")]
    pub agent_command: String,

    /// Per-provider overrides, e.g. `{"anthropic": {"base_url": "...", "api_key": "..."}}`.
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ProviderEntry>,
}

fn default_model() -> String {
    std::env::var("CCT_MODEL").unwrap_or_else(|_| "claude-sonnet-4-5".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(p) = std::env::var("CCT_DB_PATH") {
        return PathBuf::from(p);
    }
    ServerConfig::resolve_path("cct/cct.db")
}

fn default_max_connections() -> usize {
    256
}

fn default_max_sessions() -> usize {
    512
}

fn default_session_retention_days() -> i64 {
    30
}

fn default_cleanup_interval_hours() -> u64 {
    6
}

fn default_agent_command() -> String {
    std::env::var("CCT_AGENT_COMMAND").unwrap_or_else(|_| "claude".to_string())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            db_path: default_db_path(),
            max_connections: default_max_connections(),
            max_sessions: default_max_sessions(),
            session_retention_days: default_session_retention_days(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
            cleanup_enabled: true,
            agent_command: default_agent_command(),
            providers: std::collections::HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load config.json from `~/.cct`, then apply a local `.cct.json` override
    /// if present in the current directory. Missing files fall back silently
    /// to defaults — this is a CLI tool, not a server that should refuse to
    /// start over a missing config.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::resolve_path("config.json");

        let mut config = if config_path.exists() {
            let data = std::fs::read_to_string(&config_path)?;
            serde_json::from_str::<ServerConfig>(&data)?
        } else {
            ServerConfig::default()
        };

        let local_path = std::env::current_dir()
            .ok()
            .map(|d| d.join(".cct.json"))
            .filter(|p| p.exists());

        if let Some(local) = local_path {
            let data = std::fs::read_to_string(local)?;
            let override_val: serde_json::Value = serde_json::from_str(&data)?;
            let mut base = serde_json::to_value(&config)?;
            if let (Some(base_obj), Some(over_obj)) =
                (base.as_object_mut(), override_val.as_object())
            {
                for (k, v) in over_obj {
                    base_obj.insert(k.clone(), v.clone());
                }
            }
            config = serde_json::from_value(base)?;
        }

        Ok(config)
    }

    /// Resolve a path relative to `~/.cct`.
    pub fn resolve_path(relative: &str) -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cct")
            .join(relative)
    }

    /// Resolve the API key for `provider_id` in priority order:
    /// session override (caller-supplied) > provider table row > process env.
    pub fn resolve_api_key(&self, provider_id: &str, session_override: Option<&str>) -> Option<String> {
        if let Some(k) = session_override {
            if !k.is_empty() {
                return Some(k.to_string());
            }
        }
        if let Some(entry) = self.providers.get(provider_id) {
            if let Some(k) = &entry.api_key {
                if !k.is_empty() {
                    return Some(k.clone());
                }
            }
        }
        let env_var = format!("{}_API_KEY", provider_id.to_uppercase());
        std::env::var(env_var).ok().filter(|v| !v.is_empty())
    }

    /// Resolve the base URL for `provider_id`: session override > provider table row > None.
    pub fn resolve_base_url(&self, provider_id: &str, session_override: Option<&str>) -> Option<String> {
        if let Some(u) = session_override {
            if !u.is_empty() {
                return Some(u.to_string());
            }
        }
        self.providers
            .get(provider_id)
            .and_then(|e| e.base_url.clone())
            .filter(|v| !v.is_empty())
    }
}
