mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, CategorySettings, LoggingSettings, Settings};

/// Prefix of environment overrides, e.g. `NQ__BROKER__CONSUMER_TIMEOUT_MS`.
pub const ENV_PREFIX: &str = "NQ";

/// Loads the configuration from `config/default` (if present) and `NQ__*`
/// environment variables, merged over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Like `load_config`, reading the optional file at `path` instead.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let broker = partial.broker.as_ref();
    let category = match partial.category.as_ref() {
        Some(c) => c.merge_onto(&default.category),
        None => default.category,
    };
    let categories = partial
        .categories
        .unwrap_or_default()
        .iter()
        .map(|(name, c)| (name.clone(), c.merge_onto(&category)))
        .collect();

    Settings {
        broker: BrokerSettings {
            maintenance_interval_ms: broker
                .and_then(|b| b.maintenance_interval_ms)
                .unwrap_or(default.broker.maintenance_interval_ms),
            consumer_timeout_ms: broker
                .and_then(|b| b.consumer_timeout_ms)
                .unwrap_or(default.broker.consumer_timeout_ms),
            rebalance_debounce_ms: broker
                .and_then(|b| b.rebalance_debounce_ms)
                .unwrap_or(default.broker.rebalance_debounce_ms),
            cleanup_interval_ms: broker
                .and_then(|b| b.cleanup_interval_ms)
                .unwrap_or(default.broker.cleanup_interval_ms),
            shutdown_timeout_ms: broker
                .and_then(|b| b.shutdown_timeout_ms)
                .unwrap_or(default.broker.shutdown_timeout_ms),
        },
        category,
        categories,
        logging: LoggingSettings {
            level: partial
                .logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
    }
}

#[cfg(test)]
mod tests;
