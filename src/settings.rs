use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::discord::{RateLimiterConfig, DEFAULT_CLIENT_ID};
use crate::error::{BridgeError, Result};
use crate::presence::{FormatOptions, FormatTemplates, PipelineConfig};

const SETTINGS_FILE: &str = "settings.json";
pub const APP_DIR_NAME: &str = "presence-for-plex";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub discord_client_id: String,
    pub discord_enabled: bool,
    pub show_buttons: bool,
    pub show_progress: bool,
    pub show_artwork: bool,
    pub update_interval_secs: u64,

    pub plex_token: Option<String>,
    pub plex_client_identifier: String,
    /// Overrides the signed-in account name for session filtering
    pub plex_username: Option<String>,
    pub server_urls: Vec<String>,
    pub auto_discover: bool,
    pub include_relay: bool,

    pub enable_movies: bool,
    pub enable_tv_shows: bool,
    pub enable_music: bool,

    pub enable_tmdb: bool,
    pub tmdb_access_token: String,
    pub enable_jikan: bool,

    #[serde(flatten)]
    pub templates: FormatTemplates,

    pub log_level: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            discord_client_id: DEFAULT_CLIENT_ID.to_string(),
            discord_enabled: true,
            show_buttons: true,
            show_progress: true,
            show_artwork: true,
            update_interval_secs: 15,
            plex_token: None,
            plex_client_identifier: uuid::Uuid::new_v4().to_string(),
            plex_username: None,
            server_urls: Vec::new(),
            auto_discover: true,
            include_relay: false,
            enable_movies: true,
            enable_tv_shows: true,
            enable_music: true,
            enable_tmdb: true,
            tmdb_access_token: String::new(),
            enable_jikan: true,
            templates: FormatTemplates::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> Result<()> {
        if self.discord_client_id.trim().is_empty() {
            return Err(BridgeError::config("discord_client_id must not be empty"));
        }
        if self.update_interval_secs == 0 {
            return Err(BridgeError::config("update_interval_secs must be positive"));
        }
        if self.templates.all().iter().any(|t| t.trim().is_empty()) {
            return Err(BridgeError::config("format templates must not be empty"));
        }
        Ok(())
    }

    pub fn format_options(&self) -> FormatOptions {
        FormatOptions {
            show_progress: self.show_progress,
            show_buttons: self.show_buttons,
            show_artwork: self.show_artwork,
            templates: self.templates.clone(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let defaults = RateLimiterConfig::default();
        let primary_window = Duration::from_secs(self.update_interval_secs).max(defaults.burst_window);
        PipelineConfig {
            rate_limit: RateLimiterConfig {
                primary_window,
                ..defaults
            },
            format: self.format_options(),
            ..PipelineConfig::default()
        }
    }

    /// Signed-in token, ignoring blanks
    pub fn token(&self) -> Option<&str> {
        self.plex_token.as_deref().filter(|t| !t.trim().is_empty())
    }
}

pub fn app_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| BridgeError::config("Could not determine config directory"))?;
    let dir = base.join(APP_DIR_NAME);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn settings_path() -> Result<PathBuf> {
    Ok(app_dir()?.join(SETTINGS_FILE))
}

pub fn load_settings() -> Result<AppSettings> {
    load_settings_from(&settings_path()?)
}

pub fn save_settings(settings: &AppSettings) -> Result<()> {
    save_settings_to(&settings_path()?, settings)
}

pub fn load_settings_from(path: &Path) -> Result<AppSettings> {
    tracing::debug!("Loading settings from {}", path.display());

    if !path.exists() {
        return Ok(AppSettings::default());
    }

    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Failed to read settings file, using defaults: {}", e);
            return Ok(AppSettings::default());
        }
    };

    if contents.trim().is_empty() {
        tracing::warn!("Settings file is empty, using defaults");
        return Ok(AppSettings::default());
    }

    match serde_json::from_str(&contents) {
        Ok(settings) => Ok(settings),
        Err(e) => {
            tracing::warn!("Failed to parse settings file, using defaults: {}", e);
            Ok(AppSettings::default())
        }
    }
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<()> {
    tracing::debug!("Saving settings");
    let contents = serde_json::to_string_pretty(settings)?;
    fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_empty_or_invalid_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.discord_client_id, DEFAULT_CLIENT_ID);
        assert_eq!(settings.update_interval_secs, 15);

        fs::write(&path, "   ").unwrap();
        assert!(load_settings_from(&path).unwrap().auto_discover);

        fs::write(&path, "{not json").unwrap();
        assert!(load_settings_from(&path).unwrap().enable_music);
    }

    #[test]
    fn partial_files_keep_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, r#"{"enable_music": false, "tv_details": "{show} ({year})"}"#).unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert!(!settings.enable_music);
        assert!(settings.enable_movies);
        assert_eq!(settings.templates.tv_details, "{show} ({year})");
        assert_eq!(settings.templates.tv_state, "{se} - {title}");
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);

        let settings = AppSettings {
            plex_token: Some("secret".into()),
            server_urls: vec!["http://10.0.0.2:32400".into()],
            ..AppSettings::default()
        };
        save_settings_to(&path, &settings).unwrap();
        assert_eq!(load_settings_from(&path).unwrap(), settings);
    }

    #[test]
    fn validation_rejects_unusable_values() {
        assert!(AppSettings::default().validate().is_ok());

        let blank_id = AppSettings {
            discord_client_id: " ".into(),
            ..AppSettings::default()
        };
        assert!(matches!(blank_id.validate(), Err(BridgeError::Config(_))));

        let zero_interval = AppSettings {
            update_interval_secs: 0,
            ..AppSettings::default()
        };
        assert!(zero_interval.validate().is_err());

        let mut blank_template = AppSettings::default();
        blank_template.templates.music_state.clear();
        assert!(blank_template.validate().is_err());
    }

    #[test]
    fn short_intervals_keep_a_valid_rate_window() {
        let settings = AppSettings {
            update_interval_secs: 1,
            ..AppSettings::default()
        };
        let config = settings.pipeline_config();
        assert!(config.rate_limit.validate().is_ok());
        assert_eq!(config.rate_limit.primary_window, Duration::from_secs(5));
    }

    #[test]
    fn blank_tokens_count_as_signed_out() {
        let settings = AppSettings {
            plex_token: Some("  ".into()),
            ..AppSettings::default()
        };
        assert_eq!(settings.token(), None);
    }
}
