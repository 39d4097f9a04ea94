use anyhow::Result;
use relaybridge_core::backfill::BackfillSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub disappearing: DisappearingConfig,
    #[serde(default)]
    pub send_lock: SendLockConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_engine")]
    pub engine: DatabaseEngine,
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    Sqlite,
    Postgres,
}

impl Default for DatabaseEngine {
    fn default() -> Self {
        Self::Sqlite
    }
}

impl From<DatabaseEngine> for relaybridge_db::DatabaseEngine {
    fn from(engine: DatabaseEngine) -> Self {
        match engine {
            DatabaseEngine::Sqlite => Self::Sqlite,
            DatabaseEngine::Postgres => Self::Postgres,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: default_database_engine(),
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DedupConfig {
    /// Message fingerprints remembered per chat.
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
    /// Service-action fingerprints remembered per chat.
    #[serde(default = "default_dedup_capacity")]
    pub action_capacity: usize,
    #[serde(default = "default_idle_chat_ttl")]
    pub idle_chat_ttl_seconds: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: default_dedup_capacity(),
            action_capacity: default_dedup_capacity(),
            idle_chat_ttl_seconds: default_idle_chat_ttl(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BackfillConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_backfill_poll_interval")]
    pub poll_interval_seconds: u64,
    /// A dispatched job with no progress for this long is handed out again.
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: u64,
    #[serde(default = "default_batch_size")]
    pub default_batch_size: i32,
    #[serde(default = "default_inter_batch_delay")]
    pub default_inter_batch_delay_seconds: i32,
    /// -1 imports until history runs out.
    #[serde(default = "default_max_batches")]
    pub default_max_batches: i32,
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_seconds: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: default_backfill_poll_interval(),
            stale_after_seconds: default_stale_after(),
            default_batch_size: default_batch_size(),
            default_inter_batch_delay_seconds: default_inter_batch_delay(),
            default_max_batches: default_max_batches(),
            rate_limit_cooldown_seconds: default_rate_limit_cooldown(),
        }
    }
}

impl BackfillConfig {
    pub fn settings(&self) -> BackfillSettings {
        BackfillSettings {
            poll_interval: Duration::from_secs(self.poll_interval_seconds.max(1)),
            stale_after: Duration::from_secs(self.stale_after_seconds),
            rate_limit_cooldown_secs: self.rate_limit_cooldown_seconds,
            default_batch_size: self.default_batch_size,
            default_inter_batch_delay_secs: self.default_inter_batch_delay_seconds,
            default_max_batches: self.default_max_batches,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DisappearingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_disappearing_poll_interval")]
    pub poll_interval_seconds: u64,
}

impl Default for DisappearingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: default_disappearing_poll_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SendLockConfig {
    #[serde(default = "default_prune_interval")]
    pub prune_interval_seconds: u64,
}

impl Default for SendLockConfig {
    fn default() -> Self {
        Self {
            prune_interval_seconds: default_prune_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_database_engine() -> DatabaseEngine {
    DatabaseEngine::Sqlite
}
fn default_database_url() -> String {
    "sqlite://./data/relaybridge.db?mode=rwc".into()
}
fn default_max_connections() -> u32 {
    10
}
fn default_dedup_capacity() -> usize {
    20
}
fn default_idle_chat_ttl() -> u64 {
    3600
}
fn default_backfill_poll_interval() -> u64 {
    10
}
fn default_stale_after() -> u64 {
    900 // 15 minutes
}
fn default_batch_size() -> i32 {
    100
}
fn default_inter_batch_delay() -> i32 {
    1
}
fn default_max_batches() -> i32 {
    -1
}
fn default_rate_limit_cooldown() -> u64 {
    60
}
fn default_disappearing_poll_interval() -> u64 {
    60
}
fn default_prune_interval() -> u64 {
    600
}

fn validate_configuration(config: &Config) -> Result<()> {
    let url = config.database.url.trim();
    if url.is_empty() {
        anyhow::bail!("Invalid database.url: a sqlite:// or postgres:// URL is required");
    }
    let detected = relaybridge_db::detect_database_engine(url)?;
    let configured = relaybridge_db::DatabaseEngine::from(config.database.engine);
    if detected != configured {
        anyhow::bail!(
            "database.engine = '{}' does not match database.url '{}'",
            configured.as_str(),
            url
        );
    }
    for (key, value) in [
        ("backfill.poll_interval_seconds", config.backfill.poll_interval_seconds),
        ("disappearing.poll_interval_seconds", config.disappearing.poll_interval_seconds),
        ("send_lock.prune_interval_seconds", config.send_lock.prune_interval_seconds),
    ] {
        if value == 0 {
            anyhow::bail!("{} must be at least 1", key);
        }
    }
    if config.backfill.default_max_batches == 0 {
        anyhow::bail!("backfill.default_max_batches must be -1 (unbounded) or at least 1");
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Relay Bridge Configuration
# Generated automatically on first run. Edit as needed.

[database]
# "sqlite" or "postgres"; must match the url scheme.
engine = "{db_engine}"
url = "{db_url}"
max_connections = {max_connections}

[dedup]
# Recently bridged remote events remembered per chat. Not persisted.
capacity = {dedup_capacity}
action_capacity = {dedup_action_capacity}
# Chats idle longer than this drop their dedup window.
idle_chat_ttl_seconds = {dedup_idle_ttl}

[backfill]
enabled = {backfill_enabled}
poll_interval_seconds = {backfill_poll}
# Dispatched jobs with no progress for this long are handed out again.
stale_after_seconds = {backfill_stale}
# Defaults for newly queued jobs.
default_batch_size = {backfill_batch}
default_inter_batch_delay_seconds = {backfill_delay}
# -1 imports until history runs out.
default_max_batches = {backfill_max_batches}
# Used when the remote rate-limit signal carries no retry hint.
rate_limit_cooldown_seconds = {backfill_cooldown}

[disappearing]
enabled = {disappearing_enabled}
poll_interval_seconds = {disappearing_poll}

[send_lock]
# Idle per-account send locks are dropped on this interval.
prune_interval_seconds = {prune_interval}
"#,
        db_engine = match config.database.engine {
            DatabaseEngine::Sqlite => "sqlite",
            DatabaseEngine::Postgres => "postgres",
        },
        db_url = config.database.url,
        max_connections = config.database.max_connections,
        dedup_capacity = config.dedup.capacity,
        dedup_action_capacity = config.dedup.action_capacity,
        dedup_idle_ttl = config.dedup.idle_chat_ttl_seconds,
        backfill_enabled = config.backfill.enabled,
        backfill_poll = config.backfill.poll_interval_seconds,
        backfill_stale = config.backfill.stale_after_seconds,
        backfill_batch = config.backfill.default_batch_size,
        backfill_delay = config.backfill.default_inter_batch_delay_seconds,
        backfill_max_batches = config.backfill.default_max_batches,
        backfill_cooldown = config.backfill.rate_limit_cooldown_seconds,
        disappearing_enabled = config.disappearing.enabled,
        disappearing_poll = config.disappearing.poll_interval_seconds,
        prune_interval = config.send_lock.prune_interval_seconds,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!(
                "Config file not found at '{}', generating defaults...",
                path
            );
            let config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }

            let template = generate_config_template(&config);
            fs::write(path, &template)?;
            tracing::info!("Generated default config at '{}'", path);
            config
        };

        // Environment variable overrides
        if let Ok(value) = std::env::var("RELAYBRIDGE_DATABASE_URL") {
            config.database.url = value;
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_DATABASE_ENGINE") {
            let normalized = value.trim().to_ascii_lowercase();
            match normalized.as_str() {
                "sqlite" => config.database.engine = DatabaseEngine::Sqlite,
                "postgres" | "postgresql" => config.database.engine = DatabaseEngine::Postgres,
                _ => {
                    tracing::warn!(
                        "Ignoring invalid RELAYBRIDGE_DATABASE_ENGINE value '{}'; expected sqlite or postgres",
                        value
                    );
                }
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_DATABASE_MAX_CONNECTIONS") {
            if let Ok(parsed) = value.parse::<u32>() {
                config.database.max_connections = parsed.clamp(1, 200);
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_DEDUP_CAPACITY") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.dedup.capacity = parsed.clamp(1, 10_000);
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_DEDUP_ACTION_CAPACITY") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.dedup.action_capacity = parsed.clamp(1, 10_000);
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_DEDUP_IDLE_CHAT_TTL_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.dedup.idle_chat_ttl_seconds = parsed.max(60);
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_BACKFILL_ENABLED") {
            if let Ok(parsed) = value.parse::<bool>() {
                config.backfill.enabled = parsed;
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_BACKFILL_POLL_INTERVAL_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.backfill.poll_interval_seconds = parsed.clamp(1, 3600);
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_BACKFILL_STALE_AFTER_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.backfill.stale_after_seconds = parsed.max(60);
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_BACKFILL_DEFAULT_BATCH_SIZE") {
            if let Ok(parsed) = value.parse::<i32>() {
                config.backfill.default_batch_size = parsed.clamp(1, 1000);
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_BACKFILL_DEFAULT_INTER_BATCH_DELAY_SECONDS") {
            if let Ok(parsed) = value.parse::<i32>() {
                config.backfill.default_inter_batch_delay_seconds = parsed.clamp(0, 3600);
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_BACKFILL_DEFAULT_MAX_BATCHES") {
            if let Ok(parsed) = value.parse::<i32>() {
                config.backfill.default_max_batches = if parsed < 1 { -1 } else { parsed };
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_BACKFILL_RATE_LIMIT_COOLDOWN_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.backfill.rate_limit_cooldown_seconds = parsed.clamp(1, 86_400);
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_DISAPPEARING_ENABLED") {
            if let Ok(parsed) = value.parse::<bool>() {
                config.disappearing.enabled = parsed;
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_DISAPPEARING_POLL_INTERVAL_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.disappearing.poll_interval_seconds = parsed.clamp(1, 3600);
            }
        }
        if let Ok(value) = std::env::var("RELAYBRIDGE_SEND_LOCK_PRUNE_INTERVAL_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.send_lock.prune_interval_seconds = parsed.max(10);
            }
        }

        validate_configuration(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::{generate_config_template, validate_configuration, Config, DatabaseConfig, DatabaseEngine};

    #[test]
    fn database_defaults_to_sqlite_engine() {
        let db = DatabaseConfig::default();
        assert_eq!(db.engine, DatabaseEngine::Sqlite);
        assert!(db.url.starts_with("sqlite:"));
    }

    #[test]
    fn generated_template_parses_back_to_defaults() {
        let defaults = Config::default();
        let parsed: Config =
            toml::from_str(&generate_config_template(&defaults)).expect("template parses");
        assert_eq!(parsed.dedup.capacity, 20);
        assert_eq!(parsed.dedup.action_capacity, 20);
        assert_eq!(parsed.backfill.stale_after_seconds, 900);
        assert_eq!(parsed.backfill.default_max_batches, -1);
        assert_eq!(parsed.disappearing.poll_interval_seconds, 60);
        assert_eq!(parsed.send_lock.prune_interval_seconds, 600);
        assert_eq!(parsed.database.url, defaults.database.url);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let parsed: Config = toml::from_str(
            r#"
[backfill]
poll_interval_seconds = 3
"#,
        )
        .expect("partial config parses");
        assert_eq!(parsed.backfill.poll_interval_seconds, 3);
        assert_eq!(parsed.backfill.default_batch_size, 100);
        assert!(parsed.disappearing.enabled);
        assert_eq!(parsed.database.engine, DatabaseEngine::Sqlite);

        let settings = parsed.backfill.settings();
        assert_eq!(settings.poll_interval.as_secs(), 3);
        assert_eq!(settings.stale_after.as_secs(), 900);
    }

    #[test]
    fn engine_must_match_url() {
        let mut config = Config::default();
        config.database.engine = DatabaseEngine::Postgres;
        assert!(validate_configuration(&config).is_err());
        config.database.url = "postgres://bridge@localhost/bridge".into();
        assert!(validate_configuration(&config).is_ok());
    }

    #[test]
    fn zero_poll_intervals_are_rejected() {
        let parsed: Config = toml::from_str(
            r#"
[backfill]
poll_interval_seconds = 0
"#,
        )
        .expect("config parses");
        let err = validate_configuration(&parsed).unwrap_err();
        assert!(err.to_string().contains("backfill.poll_interval_seconds"));
        assert_eq!(parsed.backfill.settings().poll_interval.as_secs(), 1);

        let mut config = Config::default();
        config.disappearing.poll_interval_seconds = 0;
        assert!(validate_configuration(&config).is_err());
    }

    #[test]
    fn load_writes_template_and_applies_env_overrides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("nested").join("relaybridge-test.toml");
        std::env::set_var("RELAYBRIDGE_DATABASE_ENGINE", "postgres");
        std::env::set_var("RELAYBRIDGE_DATABASE_URL", "postgresql://bridge@localhost/bridge");
        std::env::set_var("RELAYBRIDGE_BACKFILL_DEFAULT_BATCH_SIZE", "50000");
        std::env::set_var("RELAYBRIDGE_BACKFILL_DEFAULT_MAX_BATCHES", "0");
        let config =
            Config::load(config_path.to_str().expect("config path utf8")).expect("load config");
        std::env::remove_var("RELAYBRIDGE_DATABASE_ENGINE");
        std::env::remove_var("RELAYBRIDGE_DATABASE_URL");
        std::env::remove_var("RELAYBRIDGE_BACKFILL_DEFAULT_BATCH_SIZE");
        std::env::remove_var("RELAYBRIDGE_BACKFILL_DEFAULT_MAX_BATCHES");

        assert!(config_path.exists());
        let written = std::fs::read_to_string(&config_path).expect("template written");
        assert!(written.contains("[backfill]"));
        assert_eq!(config.database.engine, DatabaseEngine::Postgres);
        assert_eq!(config.backfill.default_batch_size, 1000);
        assert_eq!(config.backfill.default_max_batches, -1);
    }
}
