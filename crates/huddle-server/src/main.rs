use anyhow::{Context, Result};
use clap::Parser;
use huddle_config::{Config, ConfigManager, LogLevel};
use huddle_gateway::{BrokerSettings, Gateway, GatewayConfig};
use std::path::PathBuf;
use tracing::{debug, error, info};

mod logging;
mod verifier;

use logging::init_logging;
use verifier::build_verifier;

#[derive(Parser, Debug, Clone)]
#[command(name = "huddle-server")]
#[command(about = "Real-time WebSocket room broker")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, env = "HUDDLE_DEBUG", default_value = "false")]
    debug: bool,

    /// Bind address (overrides config)
    #[arg(long, env = "HUDDLE_BIND")]
    bind: Option<String>,

    /// HS256 secret for bearer tokens (overrides config)
    #[arg(long, env = "HUDDLE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Log level (overrides config)
    #[arg(long, env = "HUDDLE_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// Config file path
    #[arg(long, env = "HUDDLE_CONFIG", default_value = "~/.huddle/config.json")]
    config: String,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        huddle_config::expand_tilde(&self.config).unwrap_or_else(|| PathBuf::from(&self.config))
    }

    /// CLI 参数覆盖配置文件
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(secret) = &self.jwt_secret {
            config.auth.jwt_secret = Some(secret.clone());
        }
        if self.debug {
            config.logging.level = LogLevel::Debug;
        } else if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }

    /// Level forced from the command line, if any
    fn forced_level(&self) -> Option<LogLevel> {
        if self.debug {
            Some(LogLevel::Debug)
        } else {
            self.log_level
        }
    }
}

fn gateway_config(config: &Config) -> GatewayConfig {
    GatewayConfig {
        bind: config.server.bind.clone(),
        max_connections: config.server.max_connections,
        heartbeat_interval_secs: config.server.heartbeat_interval_secs,
        broker: BrokerSettings {
            history_capacity: config.broker.history_capacity,
            default_room_name: config.broker.default_room_name.clone(),
        },
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config_path();
    let manager = ConfigManager::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    let mut config = manager.snapshot().await;
    cli.apply(&mut config);
    ConfigManager::validate(&config).context("Invalid configuration")?;

    init_logging(&config.logging, cli.forced_level())?;
    info!("Config loaded from {:?}", manager.path());

    let verifier = build_verifier(&config.auth)?;
    let gateway_config = gateway_config(&config);
    debug!("Gateway configuration: {:?}", gateway_config);

    info!(
        "Starting Huddle on {} (auth: {}, max connections: {})",
        gateway_config.bind, config.auth.mode, gateway_config.max_connections
    );
    let gateway = Gateway::new(gateway_config, verifier);
    gateway.run_until(shutdown_signal()).await?;

    info!("Huddle stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_cli_overrides() {
        let cli = assert_ok!(Cli::try_parse_from([
            "huddle-server",
            "--bind",
            "0.0.0.0:9000",
            "--jwt-secret",
            "s3cret",
            "--log-level",
            "warn",
        ]));

        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(cli.forced_level(), Some(LogLevel::Warn));
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        assert_err!(Cli::try_parse_from(["huddle-server", "--log-level", "loud"]));
    }

    #[test]
    fn test_debug_wins_over_log_level() {
        let cli =
            Cli::try_parse_from(["huddle-server", "--debug", "--log-level", "error"]).unwrap();
        assert_eq!(cli.forced_level(), Some(LogLevel::Debug));
    }

    #[test]
    fn test_gateway_config_from_file_config() {
        let mut config = Config::default();
        config.broker.history_capacity = 5;
        config.server.max_connections = 2;

        let gateway = gateway_config(&config);
        assert_eq!(gateway.bind, "127.0.0.1:3001");
        assert_eq!(gateway.max_connections, 2);
        assert_eq!(gateway.broker.history_capacity, 5);
        assert_eq!(gateway.broker.default_room_name, "New Room");
    }

    #[tokio::test]
    async fn test_missing_config_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let cli = Cli::try_parse_from(["huddle-server", "--config", path.to_str().unwrap()])
            .unwrap();

        let manager = assert_ok!(ConfigManager::load(&cli.config_path()).await);
        assert!(path.exists());
        assert_eq!(manager.snapshot().await, Config::default());
    }
}
