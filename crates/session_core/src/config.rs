use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use config::{Config, Environment, File};
use serde::Deserialize;
use url::Url;

const SETTINGS_FILE: &str = "session.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_base_url: String,
    pub request_timeout_seconds: u64,
    pub auth_scheme: String,
    pub token_path: Option<PathBuf>,
    pub default_headers: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.realworld.io/api".into(),
            request_timeout_seconds: 30,
            auth_scheme: "Token".into(),
            token_path: None,
            default_headers: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn base_url(&self) -> anyhow::Result<Url> {
        let url = Url::parse(self.api_base_url.trim())
            .with_context(|| format!("invalid api_base_url '{}'", self.api_base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!(
                "api_base_url '{}' must use http or https, got '{}'",
                self.api_base_url,
                url.scheme()
            );
        }
        Ok(url)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.base_url()?;
        if self.request_timeout_seconds == 0 {
            bail!("request_timeout_seconds must be greater than zero");
        }
        if self.auth_scheme.trim().is_empty() {
            bail!("auth_scheme must not be empty");
        }
        Ok(())
    }
}

/// Loads settings from `session.toml` in the working directory, then
/// `APP__*` environment overrides.
pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Settings> {
    let settings: Settings = Config::builder()
        .add_source(File::from(path).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to read session settings from '{}'", path.display()))?
        .try_deserialize()
        .context("failed to decode session settings")?;

    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
