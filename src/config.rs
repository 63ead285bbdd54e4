//! Layered settings: compiled-in defaults -> optional TOML file -> `COLLABIQ_`
//! environment variables (double-underscore nesting), via the `config` crate.
//! Validated once at load time; immutable for the life of a run.

use crate::error::CollabError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Failover,
    Consensus,
    BestMatch,
    AllProviders,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDuplicate {
    Skip,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub price_per_million_in: f64,
    pub price_per_million_out: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbSettings {
    pub rate_limit_per_sec: f64,
    pub cache_ttl_schema_secs: u64,
    pub cache_ttl_data_secs: u64,
}

impl Default for KbSettings {
    fn default() -> Self {
        Self { rate_limit_per_sec: 3.0, cache_ttl_schema_secs: 24 * 3600, cache_ttl_data_secs: 6 * 3600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_root: String,
    pub workers: usize,
    pub daemon_interval_secs: u64,
    pub providers: Vec<ProviderConfig>,
    pub quality_routing: bool,
    pub strategy: Strategy,
    pub on_duplicate: OnDuplicate,
    pub kb: KbSettings,
    pub secret_cache_ttl_secs: u64,
    /// Target Notion database id; deployment-specific, so left blank by
    /// default rather than validated here (`notion verify` is what actually
    /// needs it to be set).
    pub notion_db_id: String,
    pub mail_query: String,
    pub fetch_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_root: "./data".to_string(),
            workers: 4,
            daemon_interval_secs: 300,
            providers: vec![
                ProviderConfig { name: "gemini".to_string(), price_per_million_in: 0.0, price_per_million_out: 0.0 },
                ProviderConfig { name: "claude".to_string(), price_per_million_in: 3.0, price_per_million_out: 15.0 },
                ProviderConfig { name: "openai".to_string(), price_per_million_in: 2.5, price_per_million_out: 10.0 },
            ],
            quality_routing: false,
            strategy: Strategy::Failover,
            on_duplicate: OnDuplicate::Skip,
            kb: KbSettings::default(),
            secret_cache_ttl_secs: 60,
            notion_db_id: String::new(),
            mail_query: "to:group@example.com".to_string(),
            fetch_limit: 50,
        }
    }
}

impl Settings {
    /// Load defaults, layer an optional TOML file at `config_path`, then
    /// layer `COLLABIQ_`-prefixed environment variables, validating the
    /// result before returning it.
    pub fn load(config_path: Option<&str>) -> Result<Self, CollabError> {
        let defaults = Settings::default();
        let mut builder = config::Config::builder()
            .set_default("data_root", defaults.data_root.clone())
            .map_err(|e| CollabError::Config(e.to_string()))?
            .set_default("workers", defaults.workers as i64)
            .map_err(|e| CollabError::Config(e.to_string()))?
            .set_default("daemon_interval_secs", defaults.daemon_interval_secs as i64)
            .map_err(|e| CollabError::Config(e.to_string()))?
            .set_default("quality_routing", defaults.quality_routing)
            .map_err(|e| CollabError::Config(e.to_string()))?
            .set_default("secret_cache_ttl_secs", defaults.secret_cache_ttl_secs as i64)
            .map_err(|e| CollabError::Config(e.to_string()))?
            .set_default("notion_db_id", defaults.notion_db_id.clone())
            .map_err(|e| CollabError::Config(e.to_string()))?
            .set_default("mail_query", defaults.mail_query.clone())
            .map_err(|e| CollabError::Config(e.to_string()))?
            .set_default("fetch_limit", defaults.fetch_limit as i64)
            .map_err(|e| CollabError::Config(e.to_string()))?;

        if let Some(path) = config_path {
            if std::path::Path::new(path).exists() {
                builder = builder.add_source(config::File::with_name(path));
            }
        }
        builder = builder.add_source(config::Environment::with_prefix("COLLABIQ").separator("__"));

        let raw = builder.build().map_err(|e| CollabError::Config(e.to_string()))?;

        // Fields without a flat scalar default (providers, strategy, kb, ...)
        // come from the defaults struct unless the layered sources override
        // them via full-table TOML/env entries the `config` crate merges in.
        let mut settings = defaults;
        if let Ok(v) = raw.get_string("data_root") {
            settings.data_root = v;
        }
        if let Ok(v) = raw.get_int("workers") {
            settings.workers = v as usize;
        }
        if let Ok(v) = raw.get_int("daemon_interval_secs") {
            settings.daemon_interval_secs = v as u64;
        }
        if let Ok(v) = raw.get_bool("quality_routing") {
            settings.quality_routing = v;
        }
        if let Ok(v) = raw.get_int("secret_cache_ttl_secs") {
            settings.secret_cache_ttl_secs = v as u64;
        }
        if let Ok(v) = raw.get_string("notion_db_id") {
            settings.notion_db_id = v;
        }
        if let Ok(v) = raw.get_string("mail_query") {
            settings.mail_query = v;
        }
        if let Ok(v) = raw.get_int("fetch_limit") {
            settings.fetch_limit = v as usize;
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), CollabError> {
        if self.workers == 0 {
            return Err(CollabError::Config("workers must be > 0".to_string()));
        }
        if self.providers.is_empty() {
            return Err(CollabError::Config("providers list must not be empty".to_string()));
        }
        if self.kb.rate_limit_per_sec <= 0.0 {
            return Err(CollabError::Config("kb.rate_limit_per_sec must be > 0".to_string()));
        }
        if self.secret_cache_ttl_secs > 3600 {
            return Err(CollabError::Config("secret_cache_ttl_secs must be clamped to [0, 3600]".to_string()));
        }
        Ok(())
    }
}
