use crate::{
    constants::{
        CONFLICT_RETENTION_SECS, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_RATE_WINDOW_MS,
        DEFAULT_REQUESTS_PER_MINUTE,
    },
    CoordinationError, Result,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub locks: LockSettings,
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_websocket: bool,
    pub enable_tool_dispatcher: bool,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// In-memory backend instead of sqlite; the default for development
    pub use_mocks: bool,
    pub database_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    pub lock_timeout_ms: u64,
    pub conflict_retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub window_ms: u64,
    pub default_per_min: u32,
    /// Per-agent quota overrides, keyed by agent wire name
    pub per_agent: HashMap<String, u32>,
    /// Paths exempt from throttling (health probes and the like)
    pub excluded_paths: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                enable_websocket: true,
                enable_tool_dispatcher: true,
                allowed_origins: vec![
                    "http://localhost:3000".to_string(),
                    "http://127.0.0.1:3000".to_string(),
                ],
            },
            storage: StorageConfig {
                use_mocks: true,
                database_path: "coordination.db".to_string(),
            },
            locks: LockSettings {
                lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
                conflict_retention_secs: CONFLICT_RETENTION_SECS,
            },
            rate_limit: RateLimitSettings {
                window_ms: DEFAULT_RATE_WINDOW_MS,
                default_per_min: DEFAULT_REQUESTS_PER_MINUTE,
                per_agent: HashMap::new(),
                excluded_paths: vec![
                    "/health".to_string(),
                    "/status".to_string(),
                    "/metrics".to_string(),
                ],
            },
        }
    }
}

impl Config {
    /// Loads configuration from the environment (with `.env` support),
    /// falling back to defaults per option.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("loaded .env from {:?}", path),
            Err(_) => tracing::debug!("no .env file found"),
        }

        let defaults = Config::default();

        let server = ServerConfig {
            host: env::var("HOST").unwrap_or(defaults.server.host),
            port: parse_env("PORT", defaults.server.port)?,
            enable_websocket: parse_bool_env("ENABLE_WEBSOCKET", defaults.server.enable_websocket)?,
            enable_tool_dispatcher: parse_bool_env(
                "ENABLE_TOOL_DISPATCHER",
                defaults.server.enable_tool_dispatcher,
            )?,
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.server.allowed_origins),
        };

        let storage = StorageConfig {
            use_mocks: parse_bool_env("USE_MOCKS", defaults.storage.use_mocks)?,
            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.storage.database_path),
        };

        let locks = LockSettings {
            lock_timeout_ms: parse_env("LOCK_TIMEOUT_MS", defaults.locks.lock_timeout_ms)?,
            conflict_retention_secs: parse_env(
                "CONFLICT_RETENTION_SECS",
                defaults.locks.conflict_retention_secs,
            )?,
        };
        if locks.lock_timeout_ms == 0 {
            return Err(CoordinationError::InvalidInput(
                "LOCK_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        let rate_limit = RateLimitSettings {
            window_ms: parse_env("RATE_LIMIT_WINDOW_MS", defaults.rate_limit.window_ms)?,
            default_per_min: parse_env("RATE_LIMIT_PER_MIN", defaults.rate_limit.default_per_min)?,
            per_agent: match env::var("RATE_LIMIT_PER_AGENT") {
                Ok(raw) => parse_per_agent(&raw)?,
                Err(_) => defaults.rate_limit.per_agent,
            },
            excluded_paths: env::var("RATE_LIMIT_EXCLUDED_PATHS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.rate_limit.excluded_paths),
        };

        Ok(Config {
            server,
            storage,
            locks,
            rate_limit,
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            CoordinationError::InvalidInput(format!("{key} has an invalid value: {raw}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_bool_env(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => parse_bool(&raw)
            .ok_or_else(|| CoordinationError::InvalidInput(format!("{key} must be a boolean"))),
        Err(_) => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parses `agent=quota` pairs, e.g.
/// `claude-code=120,github-copilot=240`.
fn parse_per_agent(raw: &str) -> Result<HashMap<String, u32>> {
    let mut map = HashMap::new();
    for pair in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let (agent, quota) = pair.split_once('=').ok_or_else(|| {
            CoordinationError::InvalidInput(format!("malformed RATE_LIMIT_PER_AGENT entry: {pair}"))
        })?;
        let quota: u32 = quota.trim().parse().map_err(|_| {
            CoordinationError::InvalidInput(format!("invalid quota for agent {agent}: {quota}"))
        })?;
        map.insert(agent.trim().to_string(), quota);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert!(config.storage.use_mocks);
        assert_eq!(config.locks.lock_timeout_ms, 300_000);
        assert_eq!(config.server.port, 3000);
        assert!(config.server.enable_websocket);
        assert!(config
            .rate_limit
            .excluded_paths
            .contains(&"/health".to_string()));
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn per_agent_quotas_parse() {
        let map = parse_per_agent("claude-code=120, github-copilot=240").unwrap();
        assert_eq!(map.get("claude-code"), Some(&120));
        assert_eq!(map.get("github-copilot"), Some(&240));

        assert!(parse_per_agent("claude-code").is_err());
        assert!(parse_per_agent("claude-code=lots").is_err());
    }

    #[test]
    fn list_splitting_trims_and_drops_empties() {
        assert_eq!(
            split_list("/health, /metrics,,"),
            vec!["/health".to_string(), "/metrics".to_string()]
        );
    }
}
