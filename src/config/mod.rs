//! Configuration Module
//!
//! JSON configuration for the bridge with support for:
//! - Local listener ports (plain and TLS)
//! - Upstream broker address, transport and bridge identity
//! - Static list of local users
//! - Reconnect, heartbeat and logging tuning
//! - Environment variable overrides (MQTT_BRIDGE__* prefix)
//!
//! Keys are camelCase to match existing deployment files. Every field also
//! accepts its all-lowercase spelling because environment overrides arrive
//! lowercased.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// JSON parsing error
    Parse(serde_json::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// An invariant does not hold; `field` is the offending JSON key
    Validation { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Validation {
            field,
            message: message.into(),
        }
    }

    /// The offending field for validation failures
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ConfigError::Validation { field, .. } => Some(field),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation { field, message } => {
                write!(f, "Invalid '{}': {}", field, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// A password that never shows up in Debug output or serialized config
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// A local user allowed to connect to the bridge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    #[serde(alias = "username")]
    pub user_name: String,
    #[serde(skip_serializing)]
    pub password: Secret,
    #[serde(alias = "clientid", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl User {
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            password: Secret::new(password),
            client_id: None,
        }
    }
}

/// Identity this bridge presents to the upstream broker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeUser {
    #[serde(alias = "username")]
    pub user_name: String,
    #[serde(skip_serializing)]
    pub password: Secret,
    #[serde(alias = "clientid")]
    pub client_id: String,
}

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Local plain TCP port
    pub port: i64,
    /// Local TLS port, used when a certificate and key are configured
    #[serde(alias = "tlsport")]
    pub tls_port: i64,
    /// Heartbeat interval
    #[serde(alias = "delayinmilliseconds")]
    pub delay_in_milliseconds: i64,
    /// Upstream broker host name
    #[serde(alias = "bridgeurl")]
    pub bridge_url: String,
    #[serde(alias = "bridgeport")]
    pub bridge_port: i64,
    /// Use TLS towards the upstream broker
    #[serde(alias = "usetls")]
    pub use_tls: bool,
    #[serde(alias = "bridgeuser")]
    pub bridge_user: Option<BridgeUser>,
    pub users: Vec<User>,

    #[serde(alias = "logpasswordonfailure")]
    pub log_password_on_failure: bool,
    /// Upper bound of the reconnect backoff
    #[serde(alias = "maxreconnectdelayseconds")]
    pub max_reconnect_delay_seconds: u64,
    /// Keep scheduling reconnects until one succeeds
    #[serde(alias = "retryuntilconnected")]
    pub retry_until_connected: bool,
    #[serde(alias = "keepaliveseconds")]
    pub keep_alive_seconds: u16,
    #[serde(alias = "connecttimeoutseconds")]
    pub connect_timeout_seconds: u64,
    #[serde(alias = "maxpacketsize")]
    pub max_packet_size: usize,
    /// PEM certificate chain for the local TLS listener
    #[serde(alias = "tlscertificate")]
    pub tls_certificate: Option<PathBuf>,
    /// PEM private key for the local TLS listener
    #[serde(alias = "tlsprivatekey")]
    pub tls_private_key: Option<PathBuf>,
    #[serde(alias = "servicename")]
    pub service_name: String,
    #[serde(alias = "logdirectory")]
    pub log_directory: PathBuf,
    /// Log level: error, warn, info, debug, trace
    #[serde(alias = "loglevel")]
    pub log_level: String,
    #[serde(alias = "bindaddress")]
    pub bind_address: IpAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1883,
            tls_port: 8883,
            delay_in_milliseconds: 30_000,
            bridge_url: String::new(),
            bridge_port: 8883,
            use_tls: true,
            bridge_user: None,
            users: Vec::new(),
            log_password_on_failure: false,
            max_reconnect_delay_seconds: 60,
            retry_until_connected: false,
            keep_alive_seconds: 60,
            connect_timeout_seconds: 10,
            max_packet_size: 1024 * 1024,
            tls_certificate: None,
            tls_private_key: None,
            service_name: "MqttBridge".to_string(),
            log_directory: PathBuf::from("log"),
            log_level: "info".to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

fn check_port(field: &'static str, port: i64) -> Result<(), ConfigError> {
    if !(1..=i64::from(u16::MAX)).contains(&port) {
        return Err(ConfigError::invalid(
            field,
            format!("port {} is outside 1..=65535", port),
        ));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a JSON file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the JSON file
    /// 2. Override via env vars: `MQTT_BRIDGE__` prefix with double underscores for nesting:
    ///    - `MQTT_BRIDGE__PORT=1884` overrides `port`
    ///    - `MQTT_BRIDGE__BRIDGEUSER__PASSWORD=...` overrides `bridgeUser.password`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Json));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQTT_BRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every load-time invariant, naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_port("port", self.port)?;

        if self.users.is_empty() {
            return Err(ConfigError::invalid(
                "users",
                "at least one user is required",
            ));
        }

        if self.delay_in_milliseconds <= 0 {
            return Err(ConfigError::invalid(
                "delayInMilliseconds",
                "heartbeat delay must be greater than zero",
            ));
        }

        check_port("tlsPort", self.tls_port)?;

        if self.bridge_url.trim().is_empty() {
            return Err(ConfigError::invalid(
                "bridgeUrl",
                "upstream broker address is required",
            ));
        }

        check_port("bridgePort", self.bridge_port)?;

        match &self.bridge_user {
            None => {
                return Err(ConfigError::invalid(
                    "bridgeUser",
                    "bridge user is required",
                ))
            }
            Some(user) if user.user_name.is_empty() => {
                return Err(ConfigError::invalid(
                    "bridgeUser.userName",
                    "bridge user name must not be empty",
                ))
            }
            Some(user) if user.client_id.is_empty() => {
                return Err(ConfigError::invalid(
                    "bridgeUser.clientId",
                    "bridge client id must not be empty",
                ))
            }
            Some(_) => {}
        }

        if self.max_reconnect_delay_seconds == 0 {
            return Err(ConfigError::invalid(
                "maxReconnectDelaySeconds",
                "must be greater than zero",
            ));
        }

        if self.connect_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "connectTimeoutSeconds",
                "must be greater than zero",
            ));
        }

        match (&self.tls_certificate, &self.tls_private_key) {
            (Some(_), None) => {
                return Err(ConfigError::invalid(
                    "tlsPrivateKey",
                    "required when tlsCertificate is set",
                ))
            }
            (None, Some(_)) => {
                return Err(ConfigError::invalid(
                    "tlsCertificate",
                    "required when tlsPrivateKey is set",
                ))
            }
            _ => {}
        }

        Ok(())
    }

    /// Address of the plain TCP listener
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port as u16)
    }

    /// Address of the TLS listener, if certificate material is configured
    pub fn tls_addr(&self) -> Option<SocketAddr> {
        match (&self.tls_certificate, &self.tls_private_key) {
            (Some(_), Some(_)) => Some(SocketAddr::new(self.bind_address, self.tls_port as u16)),
            _ => None,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.delay_in_milliseconds.max(1) as u64)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}
