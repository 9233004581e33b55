use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use shared::lifecycle::UnsubscribePolicy;
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "eventsync.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_url: String,
    pub request_timeout_secs: u64,
    pub mutation_timeout_secs: u64,
    pub notification_poll_secs: u64,
    pub unsubscribe_policy: UnsubscribePolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3333/api".into(),
            request_timeout_secs: 15,
            mutation_timeout_secs: 20,
            notification_poll_secs: 30,
            unsubscribe_policy: UnsubscribePolicy::Grandfathered,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_secs(self.mutation_timeout_secs)
    }

    pub fn notification_poll_interval(&self) -> Duration {
        Duration::from_secs(self.notification_poll_secs.max(1))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    request_timeout_secs: Option<u64>,
    mutation_timeout_secs: Option<u64>,
    notification_poll_secs: Option<u64>,
    unsubscribe_policy: Option<UnsubscribePolicy>,
}

/// Defaults, then `eventsync.toml` in the working directory, then the environment.
pub fn load_settings() -> anyhow::Result<ClientSettings> {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        apply_file_overrides(&mut settings, &raw)
            .with_context(|| format!("invalid settings file '{}'", path.display()))?;
    }
    apply_env_overrides(&mut settings, env)?;

    settings.api_url = normalize_api_url(&settings.api_url)?;
    Ok(settings)
}

fn apply_file_overrides(settings: &mut ClientSettings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file_cfg.api_url {
        settings.api_url = v;
    }
    if let Some(v) = file_cfg.request_timeout_secs {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = file_cfg.mutation_timeout_secs {
        settings.mutation_timeout_secs = v;
    }
    if let Some(v) = file_cfg.notification_poll_secs {
        settings.notification_poll_secs = v;
    }
    if let Some(v) = file_cfg.unsubscribe_policy {
        settings.unsubscribe_policy = v;
    }
    Ok(())
}

fn apply_env_overrides(
    settings: &mut ClientSettings,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = env("EVENTSYNC_API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = env("APP__API_URL") {
        settings.api_url = v;
    }

    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECS") {
        settings.request_timeout_secs = parse_secs("APP__REQUEST_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = env("APP__MUTATION_TIMEOUT_SECS") {
        settings.mutation_timeout_secs = parse_secs("APP__MUTATION_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = env("APP__NOTIFICATION_POLL_SECS") {
        settings.notification_poll_secs = parse_secs("APP__NOTIFICATION_POLL_SECS", &v)?;
    }

    if let Some(v) = env("APP__UNSUBSCRIBE_POLICY") {
        settings.unsubscribe_policy = match v.trim() {
            "follow_open_flag" => UnsubscribePolicy::FollowOpenFlag,
            "grandfathered" => UnsubscribePolicy::Grandfathered,
            other => return Err(anyhow!("APP__UNSUBSCRIBE_POLICY: unknown policy '{other}'")),
        };
    }

    Ok(())
}

fn parse_secs(key: &str, raw: &str) -> anyhow::Result<u64> {
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("{key} must be a whole number of seconds, got '{raw}'"))
}

/// Validates the URL and strips the trailing slash so paths can be appended verbatim.
pub fn normalize_api_url(raw: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(raw.trim()).with_context(|| format!("invalid api url '{raw}'"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(anyhow!("api url must use http or https, got '{raw}'"));
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
