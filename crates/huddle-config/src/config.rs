use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 主配置结构体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            server: ServerConfig::default(),
            broker: BrokerConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// 获取配置值的快捷方法
    pub fn get_value(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["version"] => Some(self.version.clone()),
            ["server", "bind"] => Some(self.server.bind.clone()),
            ["server", "max_connections"] => Some(self.server.max_connections.to_string()),
            ["server", "heartbeat_interval_secs"] => {
                Some(self.server.heartbeat_interval_secs.to_string())
            }
            ["broker", "history_capacity"] => Some(self.broker.history_capacity.to_string()),
            ["broker", "default_room_name"] => Some(self.broker.default_room_name.clone()),
            ["auth", "mode"] => Some(self.auth.mode.to_string()),
            ["auth", "jwt_secret"] => self.auth.jwt_secret.clone(),
            ["logging", "level"] => Some(self.logging.level.to_string()),
            ["logging", "json"] => Some(self.logging.json.to_string()),
            _ => None,
        }
    }

    /// 设置配置值
    pub fn set_value(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["server", "bind"] => {
                self.server.bind = value.to_string();
            }
            ["server", "max_connections"] => {
                self.server.max_connections = value.parse().map_err(|_| {
                    ConfigError::Validation(format!("Invalid number: {}", value))
                })?;
            }
            ["server", "heartbeat_interval_secs"] => {
                self.server.heartbeat_interval_secs = value.parse().map_err(|_| {
                    ConfigError::Validation(format!("Invalid number: {}", value))
                })?;
            }
            ["broker", "history_capacity"] => {
                self.broker.history_capacity = value.parse().map_err(|_| {
                    ConfigError::Validation(format!("Invalid number: {}", value))
                })?;
            }
            ["broker", "default_room_name"] => {
                self.broker.default_room_name = value.to_string();
            }
            ["auth", "mode"] => {
                self.auth.mode = value.parse()?;
            }
            ["auth", "jwt_secret"] => {
                self.auth.jwt_secret = Some(value.to_string());
            }
            ["logging", "level"] => {
                self.logging.level = value.parse()?;
            }
            ["logging", "json"] => {
                self.logging.json = value.parse().map_err(|_| {
                    ConfigError::Validation(format!("Invalid boolean: {}", value))
                })?;
            }
            _ => return Err(ConfigError::KeyNotFound(key.to_string())),
        }
        Ok(())
    }
}

/// WebSocket 服务配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// 绑定地址 (e.g., "127.0.0.1:3001")
    pub bind: String,
    /// 最大并发连接数
    pub max_connections: usize,
    /// 心跳间隔（秒）
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3001".to_string(),
            max_connections: 1000,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Room broker settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Messages retained per room for late joiners
    pub history_capacity: usize,
    /// Name used when `createRoom` carries no usable name
    pub default_room_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            default_room_name: "New Room".to_string(),
        }
    }
}

/// How bearer credentials are verified at handshake time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Jwt,
    Static,
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Jwt => write!(f, "jwt"),
            AuthMode::Static => write!(f, "static"),
        }
    }
}

impl std::str::FromStr for AuthMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "jwt" => Ok(AuthMode::Jwt),
            "static" => Ok(AuthMode::Static),
            _ => Err(ConfigError::Validation(format!("Invalid auth mode: {}", s))),
        }
    }
}

/// A fixed credential accepted in `static` mode
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticToken {
    pub token: String,
    pub user_id: String,
    pub display_name: String,
}

/// Auth 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// HS256 secret shared with the identity service
    pub jwt_secret: Option<String>,
    pub static_tokens: Vec<StaticToken>,
}

/// 日志级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Per-module level overrides, e.g. `{"huddle_gateway::broker": "debug"}`
    pub modules: HashMap<String, LogLevel>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
