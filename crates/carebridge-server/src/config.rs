use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use carebridge_client::PoolConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub events: EventSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// FHIR sources by name; values are `fhir://` connection strings.
    #[serde(default)]
    pub sources: BTreeMap<String, String>,
}

impl AppConfig {
    /// Load configuration: defaults, then the optional TOML file named by
    /// `CAREBRIDGE_CONFIG`, then `CAREBRIDGE__*` environment overrides
    /// (double underscore separates sections, e.g.
    /// `CAREBRIDGE__SERVER__PORT`).
    pub fn load() -> Result<Self, anyhow::Error> {
        let mut builder = ::config::Config::builder();
        if let Ok(path) = std::env::var("CAREBRIDGE_CONFIG") {
            builder = builder.add_source(::config::File::with_name(&path));
        }
        let cfg: AppConfig = builder
            .add_source(
                ::config::Environment::with_prefix("CAREBRIDGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.host.parse::<std::net::IpAddr>().is_err() {
            return Err("server.host must be an IP address".into());
        }
        let level = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&level.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        if self.pool.max_connections == 0 {
            return Err("pool.max_connections must be > 0".into());
        }
        if self.pool.max_keepalive_connections > self.pool.max_connections {
            return Err(
                "pool.max_keepalive_connections must be <= pool.max_connections".into(),
            );
        }
        if self.pool.request_timeout_secs == 0 {
            return Err("pool.request_timeout_secs must be > 0".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let ip: std::net::IpAddr = self
            .server
            .host
            .parse()
            .expect("validated server.host");
        SocketAddr::new(ip, self.server.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long in-flight requests may drain after a shutdown signal.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_keepalive")]
    pub max_keepalive_connections: usize,
    #[serde(default = "default_keepalive_expiry")]
    pub keepalive_expiry_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_keepalive_connections: default_max_keepalive(),
            keepalive_expiry_secs: default_keepalive_expiry(),
            request_timeout_secs: default_request_timeout(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            max_keepalive_connections: self.max_keepalive_connections,
            keepalive_expiry: Duration::from_secs(self.keepalive_expiry_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// Source-system name stamped on every emitted event.
    #[serde(default = "default_event_source")]
    pub source: String,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            source: default_event_source(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8180
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_max_connections() -> usize {
    20
}

fn default_max_keepalive() -> usize {
    10
}

fn default_keepalive_expiry() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    30
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_event_source() -> String {
    "carebridge".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.addr().port(), 8180);
        assert_eq!(cfg.pool.max_connections, 20);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut cfg = AppConfig::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.server.host = "not-an-ip".into();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.logging.level = "shouty".into();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.pool.max_keepalive_connections = cfg.pool.max_connections + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let toml = r#"
[server]
host = "0.0.0.0"
port = 9090

[pool]
max_connections = 5

[sources]
main = "fhir://fhir.example.com/r4?client_id=a&client_secret=b&token_url=https://auth/t"
"#;
        let cfg: AppConfig = ::toml::from_str(toml).unwrap();
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.pool.max_connections, 5);
        // Unset fields keep their defaults.
        assert_eq!(cfg.pool.max_keepalive_connections, 10);
        assert!(cfg.sources.contains_key("main"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_pool_settings_conversion() {
        let settings = PoolSettings::default();
        let pool = settings.to_pool_config();
        assert_eq!(pool.max_connections, 20);
        assert_eq!(pool.request_timeout, Duration::from_secs(30));
    }
}
