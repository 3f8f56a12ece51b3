use crate::broker::BrokerConfig;

use super::settings::{CategorySettings, PartialCategorySettings, Settings};
use super::{load_config, load_config_from};
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.maintenance_interval_ms, 30_000);
    assert_eq!(settings.broker.consumer_timeout_ms, 30_000);
    assert_eq!(settings.broker.rebalance_debounce_ms, 1_000);
    assert_eq!(settings.category.queue_count, 1);
    assert!(!settings.category.persistent);
    assert_eq!(settings.category.max_messages, None);
    assert!(settings.categories.is_empty());
    assert_eq!(settings.logging.level, "info");
}

#[test]
fn partial_category_fills_missing_fields_from_base() {
    let base = CategorySettings {
        queue_count: 2,
        retention_ms: 1_000,
        persistent: true,
        max_messages: Some(10),
        max_bytes: None,
    };
    let partial = PartialCategorySettings {
        queue_count: Some(8),
        retention_ms: None,
        persistent: None,
        max_messages: None,
        max_bytes: Some(4096),
    };
    let merged = partial.merge_onto(&base);
    assert_eq!(merged.queue_count, 8);
    assert_eq!(merged.retention_ms, 1_000);
    assert!(merged.persistent);
    assert_eq!(merged.max_messages, Some(10));
    assert_eq!(merged.max_bytes, Some(4096));
}

#[test]
fn category_config_prefers_override() {
    let mut settings = Settings::default();
    let mut orders = settings.category.clone();
    orders.queue_count = 4;
    orders.max_messages = Some(1000);
    settings.categories.insert("orders".to_string(), orders);

    let broker = BrokerConfig::from(&settings);
    let config = broker.category_config("orders");
    assert_eq!(config.queue_count, 4);
    assert_eq!(config.capacity.max_messages, Some(1000));

    let fallback = broker.category_config("payments");
    assert_eq!(fallback.queue_count, 1);
    assert_eq!(fallback.capacity.max_messages, None);
}

#[test]
#[serial]
fn load_config_without_sources_yields_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("missing");
    let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg.broker.consumer_timeout_ms, 30_000);
    assert_eq!(cfg.category.queue_count, 1);
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    // Create a temporary directory and set it as current dir so load_config
    // will pick up config/default.toml from there.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [broker]
        consumer_timeout_ms = 5000
        rebalance_debounce_ms = 250

        [category]
        queue_count = 3
        retention_ms = 60000

        [categories.orders]
        queue_count = 4
        max_messages = 1000

        [logging]
        level = "debug"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();

    // restore cwd before asserting so a failure does not leak the tempdir cwd
    env::set_current_dir(orig).expect("restore cwd");
    let cfg = cfg.expect("load_config failed");

    assert_eq!(cfg.broker.consumer_timeout_ms, 5000);
    assert_eq!(cfg.broker.rebalance_debounce_ms, 250);
    assert_eq!(cfg.broker.maintenance_interval_ms, 30_000);
    assert_eq!(cfg.category.queue_count, 3);
    assert_eq!(cfg.category.retention_ms, 60_000);
    assert_eq!(cfg.logging.level, "debug");

    let orders = BrokerConfig::from(&cfg).category_config("orders");
    assert_eq!(orders.queue_count, 4);
    assert_eq!(orders.retention_ms, 60_000);
    assert_eq!(orders.capacity.max_messages, Some(1000));
}

#[test]
#[serial]
fn load_config_reads_environment_overrides() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("missing");

    temp_env::with_vars(
        [
            ("NQ__BROKER__CONSUMER_TIMEOUT_MS", Some("1234")),
            ("NQ__CATEGORY__QUEUE_COUNT", Some("6")),
            ("NQ__LOGGING__LEVEL", Some("warn")),
        ],
        || {
            let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
            assert_eq!(cfg.broker.consumer_timeout_ms, 1234);
            assert_eq!(cfg.category.queue_count, 6);
            assert_eq!(cfg.logging.level, "warn");
        },
    );
}
