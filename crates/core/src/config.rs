use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    pub device: DeviceConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u16,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

impl BrokerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_seconds))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub owner_id: String,
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

/// Broker topology. `inbound_queue` may contain an `{owner}` placeholder that
/// is replaced with the owner id, giving each owner a private queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: String,
    #[serde(default = "default_inbound_routing_key")]
    pub inbound_routing_key: String,
    #[serde(default = "default_confirmation_queue")]
    pub confirmation_queue: String,
    #[serde(default = "default_confirmation_routing_key")]
    pub confirmation_routing_key: String,
}

impl QueueConfig {
    pub fn inbound_queue_for(&self, owner_id: &str) -> String {
        self.inbound_queue.replace("{owner}", owner_id)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            inbound_queue: default_inbound_queue(),
            inbound_routing_key: default_inbound_routing_key(),
            confirmation_queue: default_confirmation_queue(),
            confirmation_routing_key: default_confirmation_routing_key(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default = "default_constrained_prefetch")]
    pub constrained_prefetch: u16,
    #[serde(default = "default_handler_timeout_seconds")]
    pub handler_timeout_seconds: u64,
    #[serde(default = "default_publish_timeout_seconds")]
    pub publish_timeout_seconds: u64,
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
    #[serde(default = "default_sla_threshold_seconds")]
    pub sla_threshold_seconds: u64,
    #[serde(default = "default_processing_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_idempotency_window")]
    pub idempotency_window: usize,
    /// How often queued confirmations are retried while the link stays up.
    #[serde(default = "default_replay_interval_seconds")]
    pub replay_interval_seconds: u64,
}

impl ProcessingConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_seconds)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn sla_threshold(&self) -> Duration {
        Duration::from_secs(self.sla_threshold_seconds)
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_secs(self.replay_interval_seconds)
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            prefetch: default_prefetch(),
            constrained_prefetch: default_constrained_prefetch(),
            handler_timeout_seconds: default_handler_timeout_seconds(),
            publish_timeout_seconds: default_publish_timeout_seconds(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            sla_threshold_seconds: default_sla_threshold_seconds(),
            channel_capacity: default_processing_channel_capacity(),
            idempotency_window: default_idempotency_window(),
            replay_interval_seconds: default_replay_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_graceful_cooldown_seconds")]
    pub graceful_shutdown_cooldown_seconds: u64,
    /// Upper bound applied on top of the per-category backoff caps.
    pub max_delay_seconds: Option<u64>,
    #[serde(default = "default_network_wait_seconds")]
    pub network_wait_seconds: u64,
}

impl ReconnectConfig {
    pub fn graceful_shutdown_cooldown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_cooldown_seconds)
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_seconds.map(Duration::from_secs)
    }

    pub fn network_wait(&self) -> Duration {
        Duration::from_secs(self.network_wait_seconds)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            graceful_shutdown_cooldown_seconds: default_graceful_cooldown_seconds(),
            max_delay_seconds: None,
            network_wait_seconds: default_network_wait_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

impl RegistryConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_registry_cooldown_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    pub path: Option<String>,
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    host: Option<String>,
    username: Option<String>,
    password: Option<String>,
    owner_id: Option<String>,
    log_level: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_broker_port() -> u16 {
    5672
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_heartbeat_seconds() -> u16 {
    30
}

fn default_connect_timeout_seconds() -> u64 {
    15
}

fn default_device_id() -> String {
    "syncwire-agent".to_string()
}

fn default_exchange() -> String {
    "contact_sync_exchange".to_string()
}

fn default_inbound_queue() -> String {
    "contact_sync_queue".to_string()
}

fn default_inbound_routing_key() -> String {
    "contact.sync".to_string()
}

fn default_confirmation_queue() -> String {
    "contact_callback_queue".to_string()
}

fn default_confirmation_routing_key() -> String {
    "contact.callback".to_string()
}

fn default_prefetch() -> u16 {
    50
}

fn default_constrained_prefetch() -> u16 {
    10
}

fn default_handler_timeout_seconds() -> u64 {
    60
}

fn default_publish_timeout_seconds() -> u64 {
    5
}

fn default_shutdown_timeout_seconds() -> u64 {
    5
}

fn default_sla_threshold_seconds() -> u64 {
    20
}

fn default_processing_channel_capacity() -> usize {
    256
}

fn default_idempotency_window() -> usize {
    512
}

fn default_replay_interval_seconds() -> u64 {
    30
}

fn default_graceful_cooldown_seconds() -> u64 {
    30
}

fn default_network_wait_seconds() -> u64 {
    60
}

fn default_registry_cooldown_seconds() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[broker]
host = ""
# port = 5672
username = ""
password = ""
# virtual_host = "/"
# use_tls = false
heartbeat_seconds = 30
connect_timeout_seconds = 15

[device]
owner_id = ""
device_id = "syncwire-agent"

[queues]
exchange = "contact_sync_exchange"
inbound_queue = "contact_sync_queue"
inbound_routing_key = "contact.sync"
confirmation_queue = "contact_callback_queue"
confirmation_routing_key = "contact.callback"

[processing]
prefetch = 50
constrained_prefetch = 10
handler_timeout_seconds = 60
publish_timeout_seconds = 5
sla_threshold_seconds = 20
replay_interval_seconds = 30

[reconnect]
enabled = true
graceful_shutdown_cooldown_seconds = 30
# max_delay_seconds = 120

[registry]
cooldown_seconds = 5

[logging]
level = "info"

[event_bus]
channel_capacity = 1024

[storage]
# path = "~/.local/share/syncwire/confirmations.db"
"#;

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("io", "syncwire", "syncwire") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Return the platform data directory used for the confirmation database
/// when `storage.path` is not set.
pub fn default_data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("io", "syncwire", "syncwire") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from(".")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides. Returns a validated Config or a descriptive error.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. Used by `load_config()` and tests.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly (for testing).
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: PathBuf,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(&path)?;
            return Err(ConfigError::MissingRequiredFields {
                fields: vec![
                    "broker.host".to_string(),
                    "broker.username".to_string(),
                    "broker.password".to_string(),
                    "device.owner_id".to_string(),
                ],
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        host: std::env::var("SYNCWIRE_BROKER_HOST").ok(),
        username: std::env::var("SYNCWIRE_BROKER_USERNAME").ok(),
        password: std::env::var("SYNCWIRE_BROKER_PASSWORD").ok(),
        owner_id: std::env::var("SYNCWIRE_OWNER_ID").ok(),
        log_level: std::env::var("SYNCWIRE_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(host) = overrides.host {
        config.broker.host = host;
    }
    if let Some(username) = overrides.username {
        config.broker.username = username;
    }
    if let Some(password) = overrides.password {
        config.broker.password = password;
    }
    if let Some(owner_id) = overrides.owner_id {
        config.device.owner_id = owner_id;
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut missing = Vec::new();

    if config.broker.host.is_empty() {
        missing.push("broker.host".to_string());
    }
    if config.broker.username.is_empty() {
        missing.push("broker.username".to_string());
    }
    if config.broker.password.is_empty() {
        missing.push("broker.password".to_string());
    }
    if config.device.owner_id.is_empty() {
        missing.push("device.owner_id".to_string());
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    if config.processing.prefetch == 0 || config.processing.constrained_prefetch == 0 {
        return Err(ConfigError::InvalidValue {
            field: "processing.prefetch".to_string(),
            message: "prefetch counts must be greater than zero".to_string(),
        });
    }

    if config.queues.inbound_queue.is_empty() || config.queues.confirmation_queue.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "queues".to_string(),
            message: "queue names must not be empty".to_string(),
        });
    }

    Ok(())
}

fn create_default_config(path: &PathBuf) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse_without_env(toml_str: &str) -> Result<Config, ConfigError> {
        load_config_from_str_with_overrides(toml_str, ConfigOverrides::default())
    }

    fn minimal_toml() -> &'static str {
        r#"
[broker]
host = "rabbit.example.com"
username = "guest"
password = "guest"

[device]
owner_id = "+15550100"
"#
    }

    // ── Parsing ───────────────────────────────────────────────────

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = parse_without_env(minimal_toml()).unwrap();
        assert_eq!(config.broker.host, "rabbit.example.com");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.broker.virtual_host, "/");
        assert!(!config.broker.use_tls);
        assert_eq!(config.broker.heartbeat(), Duration::from_secs(30));
        assert_eq!(config.device.device_id, "syncwire-agent");
        assert_eq!(config.queues.exchange, "contact_sync_exchange");
        assert_eq!(config.queues.confirmation_routing_key, "contact.callback");
        assert_eq!(config.processing.prefetch, 50);
        assert_eq!(config.processing.constrained_prefetch, 10);
        assert_eq!(config.processing.handler_timeout(), Duration::from_secs(60));
        assert_eq!(config.processing.publish_timeout(), Duration::from_secs(5));
        assert_eq!(config.processing.sla_threshold(), Duration::from_secs(20));
        assert_eq!(config.processing.replay_interval(), Duration::from_secs(30));
        assert!(config.reconnect.enabled);
        assert_eq!(
            config.reconnect.graceful_shutdown_cooldown(),
            Duration::from_secs(30)
        );
        assert!(config.reconnect.max_delay().is_none());
        assert_eq!(config.registry.cooldown(), Duration::from_secs(5));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.event_bus.channel_capacity, 1024);
        assert!(config.storage.path.is_none());
    }

    #[test]
    fn default_config_file_parses_once_required_fields_are_filled() {
        let filled = DEFAULT_CONFIG_TOML
            .replacen("host = \"\"", "host = \"localhost\"", 1)
            .replacen("username = \"\"", "username = \"guest\"", 1)
            .replacen("password = \"\"", "password = \"guest\"", 1)
            .replacen("owner_id = \"\"", "owner_id = \"owner\"", 1);
        let config = parse_without_env(&filled).unwrap();
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.queues.inbound_queue, "contact_sync_queue");
    }

    #[test]
    fn inbound_queue_template_substitutes_owner() {
        let toml = r#"
[broker]
host = "localhost"
username = "guest"
password = "guest"

[device]
owner_id = "alice"

[queues]
inbound_queue = "contact_sync.{owner}"
"#;
        let config = parse_without_env(toml).unwrap();
        assert_eq!(
            config.queues.inbound_queue_for(&config.device.owner_id),
            "contact_sync.alice"
        );
    }

    // ── Validation ────────────────────────────────────────────────

    #[test]
    fn rejects_missing_credentials_and_owner() {
        let toml = r#"
[broker]
host = "localhost"
username = ""
password = ""

[device]
owner_id = ""
"#;
        let err = parse_without_env(toml).unwrap_err();
        match err {
            ConfigError::MissingRequiredFields { fields } => {
                assert_eq!(fields.len(), 3);
                assert!(fields.contains(&"broker.username".to_string()));
                assert!(fields.contains(&"broker.password".to_string()));
                assert!(fields.contains(&"device.owner_id".to_string()));
            }
            other => panic!("expected MissingRequiredFields, got: {other}"),
        }
    }

    #[test]
    fn rejects_invalid_log_level() {
        let toml = format!("{}\n[logging]\nlevel = \"verbose\"\n", minimal_toml());
        let err = parse_without_env(&toml).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { field, .. } if field == "logging.level");
    }

    #[test]
    fn rejects_zero_prefetch() {
        let toml = format!("{}\n[processing]\nprefetch = 0\n", minimal_toml());
        let err = parse_without_env(&toml).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { field, .. } if field == "processing.prefetch");
    }

    #[test]
    fn accepts_all_valid_log_levels() {
        for level in VALID_LOG_LEVELS {
            let toml = format!("{}\n[logging]\nlevel = \"{level}\"\n", minimal_toml());
            parse_without_env(&toml).unwrap();
        }
    }

    // ── Invalid TOML ──────────────────────────────────────────────

    #[test]
    fn invalid_toml_reports_position() {
        let toml = r#"
[broker]
host = "localhost"
bad_line ===
"#;
        let err = parse_without_env(toml).unwrap_err();
        match err {
            ConfigError::InvalidToml { line, .. } => {
                assert!(line > 0, "line should be > 0, got {line}");
            }
            other => panic!("expected InvalidToml, got: {other}"),
        }
    }

    // ── Environment variable overrides ────────────────────────────

    #[test]
    fn env_overrides_replace_file_values() {
        let overrides = ConfigOverrides {
            host: Some("env.rabbit.example.com".to_string()),
            password: Some("env_password".to_string()),
            owner_id: Some("bob".to_string()),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        let config = load_config_from_str_with_overrides(minimal_toml(), overrides).unwrap();
        assert_eq!(config.broker.host, "env.rabbit.example.com");
        assert_eq!(config.broker.username, "guest");
        assert_eq!(config.broker.password, "env_password");
        assert_eq!(config.device.owner_id, "bob");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn env_override_can_fill_missing_password() {
        let toml = minimal_toml().replace("password = \"guest\"", "password = \"\"");
        let overrides = ConfigOverrides {
            password: Some("from-env".to_string()),
            ..Default::default()
        };
        let config = load_config_from_str_with_overrides(&toml, overrides).unwrap();
        assert_eq!(config.broker.password, "from-env");
    }

    // ── Default file creation ─────────────────────────────────────

    #[test]
    fn missing_file_creates_default_and_reports_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let err = load_config_from_with_overrides(path.clone(), ConfigOverrides::default())
            .unwrap_err();

        assert_matches!(err, ConfigError::MissingRequiredFields { .. });
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[broker]"));
        assert!(written.contains("contact_callback_queue"));
    }
}
