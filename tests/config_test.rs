use dbpool::config::{load_config, load_from_env, load_from_yaml};
use dbpool::ReleaseMode;
use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
name: analytics
capacity: 25
initial_conns: 5
acquire_timeout_ms: 1500
release_mode: validated
reconnect_interval_ms: 2000
connection:
  host: rethink-1.internal
  port: 28015
  database: analytics
  auth_key: secret-token
  tls:
    enabled: false
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("pool.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = load_from_yaml(&config_path).unwrap();

    assert_eq!(config.name, "analytics");
    assert_eq!(config.capacity, 25);
    assert_eq!(config.initial_conns, 5);
    assert_eq!(config.acquire_timeout, Duration::from_millis(1500));
    assert_eq!(config.release_mode, ReleaseMode::Validated);
    assert_eq!(config.reconnect_interval, Duration::from_secs(2));
    assert_eq!(config.connection.host, "rethink-1.internal");
    assert_eq!(config.connection.database, "analytics");
    assert_eq!(config.connection.auth_key.as_deref(), Some("secret-token"));
    // Unset fields fall back to defaults
    assert_eq!(config.connection.connect_timeout, Duration::from_secs(20));
    assert!(config.connection.options.is_empty());
}

/// An invalid file is rejected by `load_config`, not just parsed
#[test]
fn test_load_config_validates() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("bad.yaml");
    fs::write(&config_path, "capacity: 2\ninitial_conns: 4\n").unwrap();

    let err = load_config(Some(config_path.to_str().unwrap())).unwrap_err();
    assert!(format!("{:#}", err).contains("exceed pool capacity"));
}

#[test]
fn test_load_missing_file() {
    let result = load_from_yaml("/nonexistent/dbpool.yaml");
    assert!(result.is_err());
}

/// Environment loading; all env mutation lives in this one test to avoid
/// races between parallel tests.
#[test]
fn test_load_env_config() {
    let keys = [
        "DBPOOL_HOST",
        "DBPOOL_PORT",
        "DBPOOL_CAPACITY",
        "DBPOOL_ACQUIRE_TIMEOUT_MS",
        "DBPOOL_RELEASE_MODE",
    ];
    let saved: Vec<_> = keys.iter().map(|k| (*k, env::var(k).ok())).collect();

    env::set_var("DBPOOL_HOST", "db.test");
    env::set_var("DBPOOL_PORT", "29015");
    env::set_var("DBPOOL_CAPACITY", "7");
    env::set_var("DBPOOL_ACQUIRE_TIMEOUT_MS", "250");
    env::set_var("DBPOOL_RELEASE_MODE", "validated");

    let config = load_from_env().unwrap();
    assert_eq!(config.connection.address(), "db.test:29015");
    assert_eq!(config.capacity, 7);
    assert_eq!(config.acquire_timeout, Duration::from_millis(250));
    assert_eq!(config.release_mode, ReleaseMode::Validated);

    env::set_var("DBPOOL_CAPACITY", "lots");
    assert!(load_from_env().is_err());

    for (key, value) in saved {
        match value {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }
}
