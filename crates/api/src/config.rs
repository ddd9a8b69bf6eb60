use domain::models::ExportFormat;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    /// JWT authentication configuration
    pub jwt: JwtAuthConfig,
    /// Export engine configuration
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long shutdown waits for running exports to stop.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl From<&DatabaseConfig> for persistence::db::DatabaseConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            url: config.url.clone(),
            max_connections: config.max_connections,
            min_connections: config.min_connections,
            connect_timeout_secs: config.connect_timeout_secs,
            idle_timeout_secs: config.idle_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtAuthConfig {
    /// Issuer's RSA public key in PEM format for verifying tokens
    pub public_key: String,

    /// Leeway in seconds for clock skew tolerance (default: 30)
    #[serde(default = "default_jwt_leeway")]
    pub leeway_secs: u64,
}

/// Export engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Content area root. Partial files live in `.staging/` inside it.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Maximum concurrently running exports.
    #[serde(default = "default_worker_capacity")]
    pub worker_capacity: usize,

    /// Records fetched per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Pending backlog bound; 0 disables the bound.
    #[serde(default = "default_max_pending")]
    pub max_pending: i64,

    #[serde(default = "default_admission_interval")]
    pub admission_interval_secs: u64,

    /// Artifact lifetime after completion.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,

    /// Terminal task rows older than this are deleted; 0 keeps them.
    #[serde(default = "default_record_retention_days")]
    pub record_retention_days: i64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_minutes: u64,

    /// Expired artifacts fetched per retention page.
    #[serde(default = "default_purge_batch_size")]
    pub purge_batch_size: i64,

    /// Per-export row cap; 0 means unlimited.
    #[serde(default = "default_max_rows")]
    pub max_rows: i64,

    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_secs: i64,

    #[serde(default = "default_enabled_formats")]
    pub enabled_formats: Vec<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            worker_capacity: default_worker_capacity(),
            batch_size: default_batch_size(),
            max_pending: default_max_pending(),
            admission_interval_secs: default_admission_interval(),
            retention_hours: default_retention_hours(),
            record_retention_days: default_record_retention_days(),
            sweep_interval_minutes: default_sweep_interval(),
            purge_batch_size: default_purge_batch_size(),
            max_rows: default_max_rows(),
            stall_threshold_secs: default_stall_threshold(),
            enabled_formats: default_enabled_formats(),
        }
    }
}

impl ExportConfig {
    /// Enabled formats, in configuration order. Unknown names are skipped;
    /// `Config::load` rejects them up front.
    pub fn formats(&self) -> Vec<ExportFormat> {
        let mut formats = Vec::new();
        for name in &self.enabled_formats {
            if let Ok(format) = name.parse::<ExportFormat>() {
                if !formats.contains(&format) {
                    formats.push(format);
                }
            }
        }
        formats
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours)
    }

    pub fn record_retention(&self) -> Option<chrono::Duration> {
        (self.record_retention_days > 0).then(|| chrono::Duration::days(self.record_retention_days))
    }

    pub fn stall_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stall_threshold_secs)
    }

    pub fn admission_interval(&self) -> Duration {
        Duration::from_secs(self.admission_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_minutes * 60)
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    30
}
fn default_shutdown_grace() -> u64 {
    20
}
fn default_max_connections() -> u32 {
    20
}
fn default_min_connections() -> u32 {
    5
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_jwt_leeway() -> u64 {
    30
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("./data/exports")
}
fn default_worker_capacity() -> usize {
    4
}
fn default_batch_size() -> i64 {
    500
}
fn default_max_pending() -> i64 {
    100
}
fn default_admission_interval() -> u64 {
    5
}
fn default_retention_hours() -> i64 {
    24
}
fn default_record_retention_days() -> i64 {
    30
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_purge_batch_size() -> i64 {
    500
}
fn default_max_rows() -> i64 {
    100_000
}
fn default_stall_threshold() -> i64 {
    300
}
fn default_enabled_formats() -> Vec<String> {
    vec!["csv".to_string(), "xlsx".to_string(), "json".to_string()]
}

/// Largest accepted `export.batch_size`.
pub const MAX_BATCH_SIZE: i64 = 10_000;

/// Configuration validation error
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Loading order (later sources override earlier):
    /// 1. config/default.toml - base configuration with defaults
    /// 2. config/local.toml - local overrides (optional, not in git)
    /// 3. Environment variables with JT__ prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("JT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("export.enabled_formats")
                    .with_list_parse_key("security.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Self = config.try_deserialize()?;
        cfg.validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    /// Load configuration for testing with custom overrides.
    ///
    /// Defaults are embedded so tests do not depend on the working directory.
    #[cfg(test)]
    pub fn load_for_test(overrides: &[(&str, &str)]) -> Result<Self, config::ConfigError> {
        let defaults = r#"
            [server]
            host = "0.0.0.0"
            port = 8080
            request_timeout_secs = 30

            [database]
            url = ""
            max_connections = 20
            min_connections = 5
            connect_timeout_secs = 10
            idle_timeout_secs = 600

            [logging]
            level = "info"
            format = "json"

            [security]
            cors_origins = []

            [jwt]
            public_key = "test-public-key"
            leeway_secs = 30

            [export]
            storage_dir = "./data/exports"
            worker_capacity = 4
            batch_size = 500
            enabled_formats = ["csv", "xlsx", "json"]
        "#;

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(defaults, config::FileFormat::Toml));

        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "JT__DATABASE__URL environment variable must be set".to_string(),
            ));
        }

        if self.jwt.public_key.trim().is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "JT__JWT__PUBLIC_KEY environment variable must be set".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "Server port cannot be 0".to_string(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigValidationError::InvalidValue(
                "min_connections cannot exceed max_connections".to_string(),
            ));
        }

        self.export.validate()
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }
}

impl ExportConfig {
    fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.worker_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "export.worker_capacity must be at least 1".to_string(),
            ));
        }

        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConfigValidationError::InvalidValue(format!(
                "export.batch_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }

        if self.max_pending < 0 || self.max_rows < 0 || self.record_retention_days < 0 {
            return Err(ConfigValidationError::InvalidValue(
                "export limits cannot be negative".to_string(),
            ));
        }

        if self.purge_batch_size <= 0 {
            return Err(ConfigValidationError::InvalidValue(
                "export.purge_batch_size must be positive".to_string(),
            ));
        }

        if self.retention_hours <= 0 {
            return Err(ConfigValidationError::InvalidValue(
                "export.retention_hours must be positive".to_string(),
            ));
        }

        if self.admission_interval_secs == 0 || self.sweep_interval_minutes == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "export job intervals must be positive".to_string(),
            ));
        }

        if self.enabled_formats.is_empty() {
            return Err(ConfigValidationError::InvalidValue(
                "export.enabled_formats cannot be empty".to_string(),
            ));
        }

        for name in &self.enabled_formats {
            name.parse::<ExportFormat>()
                .map_err(ConfigValidationError::InvalidValue)?;
        }

        Ok(())
    }
}
