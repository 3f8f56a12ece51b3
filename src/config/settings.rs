use std::collections::HashMap;

use serde::Deserialize;

use crate::broker::category::{CategoryConfig, DEFAULT_RETENTION_MS};
use crate::broker::queue::QueueCapacityConfig;

/// Top-level configuration settings for the application.
///
/// Includes the broker timers, the default category shape, per-category
/// overrides and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub category: CategorySettings,
    pub categories: HashMap<String, CategorySettings>,
    pub logging: LoggingSettings,
}

/// Configuration settings for the broker's background work.
///
/// All durations are in milliseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub maintenance_interval_ms: u64,
    pub consumer_timeout_ms: u64,
    pub rebalance_debounce_ms: u64,
    pub cleanup_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
}

/// Shape of a category, applied when it is first created.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CategorySettings {
    pub queue_count: usize,
    pub retention_ms: i64,
    pub persistent: bool,
    pub max_messages: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl CategorySettings {
    pub fn to_config(&self) -> CategoryConfig {
        CategoryConfig {
            queue_count: self.queue_count,
            retention_ms: self.retention_ms,
            persistent: self.persistent,
            capacity: QueueCapacityConfig {
                max_messages: self.max_messages,
                max_bytes: self.max_bytes,
            },
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub category: Option<PartialCategorySettings>,
    pub categories: Option<HashMap<String, PartialCategorySettings>>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub maintenance_interval_ms: Option<u64>,
    pub consumer_timeout_ms: Option<u64>,
    pub rebalance_debounce_ms: Option<u64>,
    pub cleanup_interval_ms: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialCategorySettings {
    pub queue_count: Option<usize>,
    pub retention_ms: Option<i64>,
    pub persistent: Option<bool>,
    pub max_messages: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl PartialCategorySettings {
    /// Fill the unset fields from `base`.
    pub fn merge_onto(&self, base: &CategorySettings) -> CategorySettings {
        CategorySettings {
            queue_count: self.queue_count.unwrap_or(base.queue_count),
            retention_ms: self.retention_ms.unwrap_or(base.retention_ms),
            persistent: self.persistent.unwrap_or(base.persistent),
            max_messages: self.max_messages.or(base.max_messages),
            max_bytes: self.max_bytes.or(base.max_bytes),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                maintenance_interval_ms: 30_000,
                consumer_timeout_ms: 30_000,
                rebalance_debounce_ms: 1_000,
                cleanup_interval_ms: 60_000,
                shutdown_timeout_ms: 5_000,
            },
            category: CategorySettings {
                queue_count: 1,
                retention_ms: DEFAULT_RETENTION_MS,
                persistent: false,
                max_messages: None,
                max_bytes: None,
            },
            categories: HashMap::new(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

