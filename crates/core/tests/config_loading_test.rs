use std::io::Write;

use taskmesh_core::{AppConfig, LoadStrategyKind, StoreType};
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}

#[test]
fn test_load_from_file() {
    let file = write_config(
        r#"
        [store]
        host = "redis.internal"
        port = 6380

        [dispatcher]
        tick_interval_ms = 500
        node_timeout_seconds = 10
        load_strategy = "pending_penalty"
        "#,
    );

    let config = AppConfig::load(file.path().to_str()).unwrap();
    assert_eq!(config.store.r#type, StoreType::Redis);
    assert_eq!(config.store.build_url(), "redis://redis.internal:6380/0");
    assert_eq!(config.dispatcher.tick_interval_ms, 500);
    assert_eq!(config.dispatcher.node_timeout().as_secs(), 10);
    assert_eq!(config.dispatcher.load_strategy, LoadStrategyKind::PendingPenalty);
    assert_eq!(config.dispatcher.assign_max_attempts, 3);
}

#[test]
fn test_missing_file_is_an_error() {
    let result = AppConfig::load(Some("/nonexistent/taskmesh.toml"));
    assert!(result.is_err());
}

#[test]
fn test_invalid_file_fails_validation() {
    let file = write_config(
        r#"
        [dispatcher]
        tick_interval_ms = 0
        "#,
    );
    assert!(AppConfig::load(file.path().to_str()).is_err());
}

#[test]
fn test_environment_override() {
    let file = write_config("[worker]\njoin_timeout_seconds = 2\n");
    std::env::set_var("TASKMESH_WORKER__JOIN_TIMEOUT_SECONDS", "9");
    let config = AppConfig::load(file.path().to_str());
    std::env::remove_var("TASKMESH_WORKER__JOIN_TIMEOUT_SECONDS");

    let config = config.unwrap();
    assert_eq!(config.worker.join_timeout_seconds, 9);
}
