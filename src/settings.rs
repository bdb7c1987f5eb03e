use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::SyncConfig;

pub const ENV_URL: &str = "CHATDESK_URL";
pub const ENV_ANON_KEY: &str = "CHATDESK_ANON_KEY";
pub const ENV_ACCESS_TOKEN: &str = "CHATDESK_ACCESS_TOKEN";
pub const ENV_ACTOR_ID: &str = "CHATDESK_ACTOR_ID";

/// Tunables for the sync core and the realtime socket.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncSettings {
    #[serde(default = "default_correlation_window")]
    pub correlation_window_secs: u64,
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

fn default_correlation_window() -> u64 {
    10
}

fn default_pending_timeout() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    100
}

fn default_heartbeat() -> u64 {
    25
}

fn default_dispatch_function() -> String {
    "send-whatsapp-message".to_string()
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            correlation_window_secs: default_correlation_window(),
            pending_timeout_secs: default_pending_timeout(),
            queue_capacity: default_queue_capacity(),
            heartbeat_secs: default_heartbeat(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    pub project_url: String,
    pub anon_key: String,
    /// Stored base64-encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default = "default_dispatch_function")]
    pub dispatch_function: String,
    #[serde(default)]
    pub sync: SyncSettings,
}

impl Settings {
    pub fn new(project_url: &str, anon_key: &str) -> Self {
        Settings {
            project_url: project_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            access_token: None,
            actor_id: None,
            dispatch_function: default_dispatch_function(),
            sync: SyncSettings::default(),
        }
    }

    pub fn with_access_token(mut self, token: &str) -> Self {
        self.access_token = Some(BASE64.encode(token));
        self
    }

    pub fn with_actor_id(mut self, actor_id: &str) -> Self {
        self.actor_id = Some(actor_id.to_string());
        self
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token
            .as_ref()
            .and_then(|encoded| BASE64.decode(encoded).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Token sent as bearer; the anon key when nobody is signed in.
    pub fn bearer(&self) -> String {
        self.access_token().unwrap_or_else(|| self.anon_key.clone())
    }

    pub fn from_env() -> Option<Self> {
        let url = env::var(ENV_URL).ok()?;
        let key = env::var(ENV_ANON_KEY).ok()?;
        let mut settings = Settings::new(&url, &key);
        if let Ok(token) = env::var(ENV_ACCESS_TOKEN) {
            settings = settings.with_access_token(&token);
        }
        if let Ok(actor) = env::var(ENV_ACTOR_ID) {
            settings = settings.with_actor_id(&actor);
        }
        Some(settings)
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            correlation_window: Duration::from_secs(self.sync.correlation_window_secs),
            pending_timeout: Duration::from_secs(self.sync.pending_timeout_secs),
            queue_capacity: self.sync.queue_capacity.max(1),
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.sync.heartbeat_secs.max(1))
    }
}

static SETTINGS_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `path` instead of the default settings file for this process.
pub fn set_settings_path_override(path: PathBuf) {
    let _ = SETTINGS_PATH_OVERRIDE.set(path);
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("chatdesk");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_settings_path() -> Result<PathBuf> {
    if let Some(path) = SETTINGS_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("settings.json"))
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, settings)?;

    info!("Settings saved for {}", settings.project_url);
    Ok(())
}

pub fn load_settings() -> Result<Option<Settings>> {
    load_settings_from(&get_settings_path()?)
}

pub fn load_settings_from(path: &Path) -> Result<Option<Settings>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&contents)?;
    info!("Loaded settings for {} from {}", settings.project_url, path.display());

    Ok(Some(settings))
}

/// Environment first, then the settings file.
pub fn resolve_settings() -> Result<Settings> {
    if let Some(settings) = Settings::from_env() {
        info!("Using settings from environment for {}", settings.project_url);
        return Ok(settings);
    }
    load_settings()?.ok_or_else(|| {
        anyhow!(
            "No settings found: set {} and {} or run `chatdesk login`",
            ENV_URL,
            ENV_ANON_KEY
        )
    })
}
