use serde::Deserialize;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `JOURNEY_ENGINE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub journey: JourneyConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

// ─── Journey Config ─────────────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize)]
pub struct JourneyConfig {
    #[serde(default = "default_journey_enabled")]
    pub enabled: bool,
    /// Per-user cap on concurrently active journeys.
    #[serde(default = "default_max_active_journeys")]
    pub max_active_journeys: usize,
    /// Nodes a single drive may execute before the journey is treated as
    /// looping and parked as errored.
    #[serde(default = "default_max_steps_per_drive")]
    pub max_steps_per_drive: usize,
    #[serde(default = "default_foreground_grace_ms")]
    pub foreground_grace_ms: u64,
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,
    #[serde(default = "default_persist_retry_backoff_ms")]
    pub persist_retry_backoff_ms: u64,
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_journey_enabled() -> bool { true }
fn default_max_active_journeys() -> usize { 100 }
fn default_max_steps_per_drive() -> usize { 64 }
fn default_foreground_grace_ms() -> u64 { 500 }
fn default_persist_retries() -> u32 { 3 }
fn default_persist_retry_backoff_ms() -> u64 { 50 }
fn default_command_buffer() -> usize { 256 }

impl Default for JourneyConfig {
    fn default() -> Self {
        Self {
            enabled: default_journey_enabled(),
            max_active_journeys: default_max_active_journeys(),
            max_steps_per_drive: default_max_steps_per_drive(),
            foreground_grace_ms: default_foreground_grace_ms(),
            persist_retries: default_persist_retries(),
            persist_retry_backoff_ms: default_persist_retry_backoff_ms(),
            command_buffer: default_command_buffer(),
        }
    }
}

// ─── Store Config ───────────────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "journeys.json".to_string() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_node_id() -> String {
    "device-01".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            journey: JourneyConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file, overridden by
    /// environment variables.
    pub fn load_from(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("JOURNEY_ENGINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.journey.enabled);
        assert_eq!(config.journey.max_steps_per_drive, 64);
        assert_eq!(config.journey.persist_retries, 3);
        assert_eq!(config.store.path, "journeys.json");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from(Some("/nonexistent/journey-engine")).unwrap();
        assert_eq!(config.journey.foreground_grace_ms, 500);
        assert_eq!(config.journey.command_buffer, 256);
    }
}
