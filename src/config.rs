use serde::Deserialize;
use std::time::Duration;

/// Which record store backs the service
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Push-delivery endpoint; deliveries fail individually when unset
    pub push_server_url: Option<String>,
    pub push_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Failed passes a candidate may accumulate before it is dead-lettered
    pub max_candidate_attempts: u32,
    pub lease_ttl_secs: u64,
    /// A session with no heartbeat for this long stops its loop
    pub session_ttl_secs: u64,
    pub max_sessions: usize,
    pub default_language: String,
    pub store_backend: StoreBackend,
    /// JSON fixture loaded into the memory backend at startup
    pub memory_seed_path: Option<String>,
    pub sweep_all_senders: bool,
    pub rate_limit_per_minute: u32,
    /// Comma-separated; empty allows any origin
    pub cors_allowed_origins: String,
}

impl Config {
    /// Load from the process environment (after `.env`), falling back to defaults
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(config::Environment::default().try_parsing(true))
    }

    fn from_source<S>(source: S) -> Result<Self, config::ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        config::Config::builder()
            .set_default("database_url", "postgresql://localhost/fines")?
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("push_timeout_secs", 10)?
            .set_default("reconcile_interval_secs", 60)?
            .set_default("max_candidate_attempts", 1440)?
            .set_default("lease_ttl_secs", 300)?
            .set_default("session_ttl_secs", 900)?
            .set_default("max_sessions", 10_000)?
            .set_default("default_language", "es")?
            .set_default("store_backend", "postgres")?
            .set_default("sweep_all_senders", false)?
            .set_default("rate_limit_per_minute", 120)?
            .set_default("cors_allowed_origins", "")?
            .add_source(source)
            .build()?
            .try_deserialize()
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs.max(1))
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_source(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::default()
            .try_parsing(true)
            .source(Some(map))
    }

    #[test]
    fn test_defaults_apply() {
        let config = Config::from_source(env_source(&[])).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.reconcile_interval(), Duration::from_secs(60));
        assert_eq!(config.default_language, "es");
        assert_eq!(config.store_backend, StoreBackend::Postgres);
        assert!(config.push_server_url.is_none());
        assert!(!config.sweep_all_senders);
        assert!(config.memory_seed_path.is_none());
        assert!(config.cors_origins().is_empty());
        assert_eq!(config.session_ttl(), Duration::from_secs(900));
        assert_eq!(config.max_sessions, 10_000);
    }

    #[test]
    fn test_environment_overrides() {
        let config = Config::from_source(env_source(&[
            ("PUSH_SERVER_URL", "https://push.example.com/send"),
            ("RECONCILE_INTERVAL_SECS", "15"),
            ("STORE_BACKEND", "memory"),
            ("SWEEP_ALL_SENDERS", "true"),
            ("MEMORY_SEED_PATH", "fixtures/seed.json"),
            ("CORS_ALLOWED_ORIGINS", "http://localhost:5173, https://fines.app"),
            ("SESSION_TTL_SECS", "120"),
            ("MAX_SESSIONS", "50"),
        ]))
        .unwrap();

        assert_eq!(
            config.push_server_url.as_deref(),
            Some("https://push.example.com/send")
        );
        assert_eq!(config.reconcile_interval_secs, 15);
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert!(config.sweep_all_senders);
        assert_eq!(config.session_ttl(), Duration::from_secs(120));
        assert_eq!(config.max_sessions, 50);
        assert_eq!(config.memory_seed_path.as_deref(), Some("fixtures/seed.json"));
        assert_eq!(
            config.cors_origins(),
            vec!["http://localhost:5173".to_string(), "https://fines.app".to_string()]
        );
    }
}
