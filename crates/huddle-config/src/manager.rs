use crate::config::{AuthMode, Config, ConfigError, ConfigResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// 配置管理器
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
    config: Arc<RwLock<Config>>,
}

impl ConfigManager {
    /// 加载配置文件
    ///
    /// A missing file is created with the default configuration.
    pub async fn load(path: &Path) -> ConfigResult<Self> {
        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            let content = tokio::fs::read_to_string(path).await?;
            let content = Self::expand_env_vars(&content)?;
            serde_json::from_str(&content)?
        } else {
            info!("Config file not found, creating default config at {:?}", path);
            let default_config = Config::default();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let content = serde_json::to_string_pretty(&default_config)?;
            tokio::fs::write(path, &content).await?;
            default_config
        };

        Ok(Self {
            path: path.to_path_buf(),
            config: Arc::new(RwLock::new(config)),
        })
    }

    /// 获取当前配置的快照
    pub async fn snapshot(&self) -> Config {
        self.config.read().await.clone()
    }

    /// 验证配置
    pub fn validate(config: &Config) -> ConfigResult<()> {
        if config.server.max_connections == 0 {
            return Err(ConfigError::Validation(
                "server.max_connections must be greater than 0".to_string(),
            ));
        }

        if config.server.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "server.heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }

        if config.broker.history_capacity == 0 {
            return Err(ConfigError::Validation(
                "broker.history_capacity must be greater than 0".to_string(),
            ));
        }

        match config.auth.mode {
            AuthMode::Jwt => {
                let has_secret = config
                    .auth
                    .jwt_secret
                    .as_deref()
                    .is_some_and(|secret| !secret.is_empty());
                if !has_secret {
                    return Err(ConfigError::Validation(
                        "auth.jwt_secret is required in jwt mode".to_string(),
                    ));
                }
            }
            AuthMode::Static => {
                if config.auth.static_tokens.is_empty() {
                    return Err(ConfigError::Validation(
                        "auth.static_tokens must not be empty in static mode".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// 展开环境变量 ${VAR} 或 ${VAR:-default}
    fn expand_env_vars(content: &str) -> ConfigResult<String> {
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| ConfigError::Validation(format!("Invalid pattern: {}", e)))?;
        let mut result = content.to_string();

        for cap in re.captures_iter(content) {
            let (Some(full_match), Some(var_expr)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            let full_match = full_match.as_str();
            let var_expr = var_expr.as_str();

            let (var_name, default_value) = match var_expr.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (var_expr, None),
            };

            let replacement = match std::env::var(var_name) {
                Ok(val) => val,
                Err(_) => match default_value {
                    Some(default) => default.to_string(),
                    None => return Err(ConfigError::EnvVarNotFound(var_name.to_string())),
                },
            };

            result = result.replace(full_match, &replacement);
        }

        Ok(result)
    }

    /// 获取配置文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }
}
