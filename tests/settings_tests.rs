// Settings persistence tests

mod common;
use common::setup_logging;

use anyhow::Result;
use std::time::Duration;

use chatdesk::settings::{load_settings_from, save_settings_to, Settings};

#[test]
fn test_settings_round_trip_through_file() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nested").join("settings.json");

    let mut settings = Settings::new("https://demo.example.co", "anon-key")
        .with_access_token("user-jwt")
        .with_actor_id("agent-42");
    settings.sync.pending_timeout_secs = 45;
    save_settings_to(&settings, &path)?;

    let raw = std::fs::read_to_string(&path)?;
    assert!(!raw.contains("user-jwt"), "access token must not be stored in clear");

    let loaded = load_settings_from(&path)?.expect("settings file exists");
    assert_eq!(loaded, settings);
    assert_eq!(loaded.access_token().as_deref(), Some("user-jwt"));
    assert_eq!(loaded.actor_id.as_deref(), Some("agent-42"));

    let config = loaded.sync_config();
    assert_eq!(config.pending_timeout, Duration::from_secs(45));
    assert_eq!(config.correlation_window, Duration::from_secs(10));
    Ok(())
}

#[test]
fn test_missing_settings_file_is_not_an_error() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    assert!(load_settings_from(&dir.path().join("absent.json"))?.is_none());
    Ok(())
}

#[test]
fn test_bearer_falls_back_to_anon_key() {
    let settings = Settings::new("https://demo.example.co", "anon-key");
    assert!(settings.access_token().is_none());
    assert_eq!(settings.bearer(), "anon-key");
}
