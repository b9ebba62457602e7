pub mod config;
pub mod manager;

pub use config::{
    AuthConfig, AuthMode, BrokerConfig, Config, ConfigError, ConfigResult, LogLevel,
    LoggingConfig, ServerConfig, StaticToken,
};
pub use manager::ConfigManager;

use std::path::PathBuf;

/// 展开路径中的 ~ 为用户主目录
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None => Some(PathBuf::from(path)),
    }
}
