use std::io::Write;
use std::path::Path;

use chrono::{TimeZone, Utc};
use horde_scheduler::{config::GlobalConfig, AppError};

fn sample_toml() -> &'static str {
    r#"
db_path = "data/scheduler.db"
retention_days = 14

[session]
expiry_seconds = 600
long_poll_seconds = 30
renew_seconds = 60
listener_idle_seconds = 10
expiry_sweep_seconds = 15
expiry_page_size = 50

[[downtime]]
name = "weekly maintenance"
start = "2026-10-18T02:00:00Z"
finish = "2026-10-18T04:00:00Z"
"#
}

#[test]
fn parses_full_config() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("valid config");

    assert_eq!(config.db_path(), Path::new("data/scheduler.db"));
    assert_eq!(config.retention_days, 14);
    assert_eq!(config.session.expiry_seconds, 600);
    assert_eq!(config.session.long_poll_seconds, 30);
    assert_eq!(config.session.renew_seconds, 60);
    assert_eq!(config.session.listener_idle_seconds, 10);
    assert_eq!(config.session.expiry_page_size, 50);
    assert_eq!(config.session.expiry(), chrono::Duration::seconds(600));
    assert_eq!(
        config.session.expiry_sweep_interval(),
        std::time::Duration::from_secs(15)
    );

    assert_eq!(config.downtime.len(), 1);
    let window = &config.downtime[0];
    assert_eq!(window.name.as_deref(), Some("weekly maintenance"));
    assert!(window.contains(Utc.with_ymd_and_hms(2026, 10, 18, 3, 0, 0).unwrap()));
    assert!(!window.contains(Utc.with_ymd_and_hms(2026, 10, 18, 4, 0, 0).unwrap()));
}

#[test]
fn empty_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("defaults are valid");

    assert_eq!(config.db_path(), Path::new("horde-scheduler.db"));
    assert_eq!(config.retention_days, 30);
    assert_eq!(config.session.expiry_seconds, 300);
    assert_eq!(config.session.long_poll_seconds, 55);
    assert_eq!(config.session.renew_seconds, 50);
    assert_eq!(config.session.listener_idle_seconds, 20);
    assert_eq!(config.session.expiry_sweep_seconds, 30);
    assert_eq!(config.session.expiry_page_size, 100);
    assert!(config.downtime.is_empty());
}

#[test]
fn partial_session_table_keeps_other_defaults() {
    let config = GlobalConfig::from_toml_str("[session]\nexpiry_seconds = 900\n")
        .expect("valid config");
    assert_eq!(config.session.expiry_seconds, 900);
    assert_eq!(config.session.long_poll_seconds, 55);
}

#[test]
fn long_poll_must_be_shorter_than_expiry() {
    let result = GlobalConfig::from_toml_str(
        "[session]\nexpiry_seconds = 60\nlong_poll_seconds = 60\nrenew_seconds = 10\n",
    );
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("long_poll_seconds")));
}

#[test]
fn renew_must_be_shorter_than_expiry() {
    let result = GlobalConfig::from_toml_str(
        "[session]\nexpiry_seconds = 60\nlong_poll_seconds = 30\nrenew_seconds = 90\n",
    );
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("renew_seconds")));
}

#[test]
fn zero_timing_is_rejected() {
    let result = GlobalConfig::from_toml_str("[session]\nlistener_idle_seconds = 0\n");
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("listener_idle_seconds")));
}

#[test]
fn zero_page_size_is_rejected() {
    let result = GlobalConfig::from_toml_str("[session]\nexpiry_page_size = 0\n");
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("expiry_page_size")));
}

#[test]
fn zero_retention_is_rejected() {
    let result = GlobalConfig::from_toml_str("retention_days = 0\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn downtime_window_must_finish_after_start() {
    let result = GlobalConfig::from_toml_str(
        r#"
[[downtime]]
name = "backwards"
start = "2026-10-18T04:00:00Z"
finish = "2026-10-18T02:00:00Z"
"#,
    );
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("backwards")));
}

#[test]
fn invalid_toml_is_a_config_error() {
    let result = GlobalConfig::from_toml_str("[session\nexpiry_seconds = ");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(sample_toml().as_bytes()).expect("write config");

    let config = GlobalConfig::load_from_path(file.path()).expect("load config");
    assert_eq!(config.retention_days, 14);
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let result = GlobalConfig::load_from_path(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(AppError::Config(_))));
}
