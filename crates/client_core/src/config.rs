use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use shared::{
    domain::DeviceId,
    protocol::{AuthenticateRequest, Credentials},
};
use tracing::warn;

use crate::pager::{GapPolicy, DEFAULT_PAGE_SIZE};

pub const DEFAULT_CONFIG_FILE: &str = "sync_client.toml";

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_url: String,
    /// `None` runs the reconciliation store on volatile state only.
    pub storage_url: Option<String>,
    pub device_id: Option<String>,
    pub platform: String,
    pub username: String,
    pub secret: String,
    pub page_size: u32,
    pub gap_policy: GapPolicy,
    pub orphan_retention_secs: u64,
    pub purge_interval_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            storage_url: Some("sqlite://./data/sync_client.db".into()),
            device_id: None,
            platform: std::env::consts::OS.into(),
            username: String::new(),
            secret: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
            gap_policy: GapPolicy::default(),
            orphan_retention_secs: 7 * 24 * 60 * 60,
            purge_interval_secs: 60 * 60,
        }
    }
}

impl ClientSettings {
    pub fn orphan_retention(&self) -> Duration {
        Duration::from_secs(self.orphan_retention_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }

    pub fn auth_request(&self, device_id: DeviceId) -> AuthenticateRequest {
        AuthenticateRequest {
            device_id,
            platform: self.platform.clone(),
            credentials: Credentials {
                username: self.username.clone(),
                secret: self.secret.clone(),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    server_url: Option<String>,
    storage_url: Option<String>,
    device_id: Option<String>,
    platform: Option<String>,
    username: Option<String>,
    secret: Option<String>,
    page_size: Option<u32>,
    gap_policy: Option<GapPolicy>,
    orphan_retention_secs: Option<u64>,
    purge_interval_secs: Option<u64>,
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE))
}

/// Defaults, then the toml file at `path` if it exists, then environment
/// overrides. An unreadable or malformed file is logged and skipped.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match parse_file_settings(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), "config: ignoring settings file: {err:#}"),
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn parse_file_settings(raw: &str) -> anyhow::Result<FileSettings> {
    toml::from_str(raw).context("invalid settings toml")
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.storage_url {
        settings.storage_url = storage_url_setting(&v);
    }
    if let Some(v) = file_cfg.device_id {
        settings.device_id = Some(v);
    }
    if let Some(v) = file_cfg.platform {
        settings.platform = v;
    }
    if let Some(v) = file_cfg.username {
        settings.username = v;
    }
    if let Some(v) = file_cfg.secret {
        settings.secret = v;
    }
    if let Some(v) = file_cfg.page_size {
        settings.page_size = v;
    }
    if let Some(v) = file_cfg.gap_policy {
        settings.gap_policy = v;
    }
    if let Some(v) = file_cfg.orphan_retention_secs {
        settings.orphan_retention_secs = v;
    }
    if let Some(v) = file_cfg.purge_interval_secs {
        settings.purge_interval_secs = v;
    }
}

/// `SYNC_*` first, then `APP__*`, so the `APP__` form wins when both are set.
fn apply_env_overrides(settings: &mut ClientSettings, env: impl Fn(&str) -> Option<String>) {
    let lookup = |name: &str| {
        env(&format!("APP__{name}")).or_else(|| env(&format!("SYNC_{name}")))
    };

    if let Some(v) = lookup("SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("STORAGE_URL") {
        settings.storage_url = storage_url_setting(&v);
    }
    if let Some(v) = lookup("DEVICE_ID") {
        settings.device_id = Some(v);
    }
    if let Some(v) = lookup("PLATFORM") {
        settings.platform = v;
    }
    if let Some(v) = lookup("USERNAME") {
        settings.username = v;
    }
    if let Some(v) = lookup("SECRET") {
        settings.secret = v;
    }
    if let Some(v) = lookup("PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.page_size = parsed;
        }
    }
    if let Some(v) = lookup("GAP_POLICY") {
        match v.trim() {
            "hold_on_gap" => settings.gap_policy = GapPolicy::HoldOnGap,
            "contiguous_prefix" => settings.gap_policy = GapPolicy::ContiguousPrefix,
            other => warn!(value = other, "config: unknown gap policy ignored"),
        }
    }
    if let Some(v) = lookup("ORPHAN_RETENTION_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.orphan_retention_secs = parsed;
        }
    }
    if let Some(v) = lookup("PURGE_INTERVAL_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.purge_interval_secs = parsed;
        }
    }
}

/// `none` or an empty value disables durable storage.
fn storage_url_setting(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return None;
    }
    Some(normalize_database_url(trimmed))
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
