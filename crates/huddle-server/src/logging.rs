//! 结构化日志模块

use anyhow::{Context, Result};
use huddle_config::{LogLevel, LoggingConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter: base level plus per-module overrides.
///
/// `RUST_LOG`, when set, wins over the configured base level.
pub fn build_filter(config: &LoggingConfig, level: Option<LogLevel>) -> Result<EnvFilter> {
    let base = level.unwrap_or(config.level).to_string();
    let mut filter = match std::env::var("RUST_LOG") {
        Ok(env) if level.is_none() && !env.trim().is_empty() => {
            EnvFilter::try_new(&env).with_context(|| format!("Invalid RUST_LOG: {}", env))?
        }
        _ => EnvFilter::try_new(&base).with_context(|| format!("Invalid log level: {}", base))?,
    };

    for (module, module_level) in &config.modules {
        let directive = format!("{}={}", module, module_level);
        filter = filter.add_directive(
            directive
                .parse()
                .with_context(|| format!("Invalid directive: {}", directive))?,
        );
    }

    Ok(filter)
}

/// 初始化日志系统
pub fn init_logging(config: &LoggingConfig, level: Option<LogLevel>) -> Result<()> {
    let filter = build_filter(config, level)?;
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
            .context("Failed to install JSON logger")?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .context("Failed to install logger")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_directives() {
        let mut config = LoggingConfig::default();
        config
            .modules
            .insert("huddle_gateway::broker".to_string(), LogLevel::Debug);

        let filter = build_filter(&config, Some(LogLevel::Warn)).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("huddle_gateway::broker=debug"));
        assert!(rendered.contains("warn"));
    }
}
