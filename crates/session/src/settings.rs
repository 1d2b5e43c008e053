use std::path::PathBuf;

use snafu::{ResultExt, Snafu};

use vellum_llm::ProviderConfig;

/// Default provider ID when none is specified.
pub const DEFAULT_PROVIDER_ID: &str = "chat";

/// Default streaming chat endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:3000/api/chat";

/// Settings that persist across app restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: DEFAULT_PROVIDER_ID.to_string(),
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            default_model: String::new(),
        }
    }
}

impl ProviderSettings {
    /// Creates a provider config from these settings. Returns `None` when
    /// the API key is blank; callers treat that as a fatal configuration
    /// error at send time.
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        let default_model =
            (!self.default_model.trim().is_empty()).then(|| self.default_model.trim().to_string());

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
            default_model,
        ))
    }

    pub fn is_valid(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

#[derive(Debug, Snafu)]
pub enum SettingsError {
    #[snafu(display("failed to create config directory at {path:?}: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write settings file to {path:?}: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Settings persistence layer using a simple line-based format.
pub struct SettingsStore {
    settings: ProviderSettings,
    config_path: PathBuf,
}

impl SettingsStore {
    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        PathBuf::from(".vellum").join("settings.conf")
    }

    /// Creates a new settings store with the given config path.
    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings,
            config_path,
        }
    }

    /// Loads settings with the default path.
    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Updates settings and persists to disk.
    pub fn update(&mut self, settings: ProviderSettings) -> SettingsResult<()> {
        self.persist(&settings)?;
        self.settings = settings;
        Ok(())
    }

    fn load_from_disk(path: &PathBuf) -> ProviderSettings {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                tracing::info!(path = ?path, "settings file not found, using defaults");
                return ProviderSettings::default();
            }
        };

        Self::parse_settings(&content)
    }

    /// Parses settings from `key=value` lines; comments and unknown keys
    /// are ignored.
    fn parse_settings(content: &str) -> ProviderSettings {
        let mut settings = ProviderSettings::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();

                match key {
                    "provider_id" => settings.provider_id = value.to_string(),
                    "api_key" => settings.api_key = value.to_string(),
                    "endpoint" => settings.endpoint = value.to_string(),
                    "default_model" => settings.default_model = value.to_string(),
                    _ => {}
                }
            }
        }

        settings
    }

    fn format_settings(settings: &ProviderSettings) -> String {
        format!(
            "# Vellum Settings\n\
             provider_id={}\n\
             api_key={}\n\
             endpoint={}\n\
             default_model={}\n",
            settings.provider_id, settings.api_key, settings.endpoint, settings.default_model
        )
    }

    fn persist(&self, settings: &ProviderSettings) -> SettingsResult<()> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "settings-persist-create-dir",
                path: parent.to_path_buf(),
            })?;
        }

        let content = Self::format_settings(settings);
        std::fs::write(&self.config_path, content).context(WriteFileSnafu {
            stage: "settings-persist-write",
            path: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_through_the_config_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("settings.conf");

        let mut store = SettingsStore::new(path.clone());
        store
            .update(ProviderSettings {
                provider_id: "chat".to_string(),
                api_key: "sk-test".to_string(),
                endpoint: "https://chat.example/api/chat".to_string(),
                default_model: "gpt-test".to_string(),
            })
            .expect("persist");

        let reloaded = SettingsStore::new(path);
        assert_eq!(reloaded.settings().api_key, "sk-test");
        assert_eq!(reloaded.settings().default_model, "gpt-test");
    }

    #[test]
    fn parse_ignores_comments_and_unknown_keys() {
        let settings = SettingsStore::parse_settings(
            "# a comment\n\
             unknown_key=whatever\n\
             api_key = sk-spaced \n\
             \n\
             endpoint=https://chat.example/api/chat\n",
        );

        assert_eq!(settings.api_key, "sk-spaced");
        assert_eq!(settings.endpoint, "https://chat.example/api/chat");
        assert_eq!(settings.provider_id, DEFAULT_PROVIDER_ID);
    }

    #[test]
    fn blank_api_key_yields_no_provider_config() {
        let settings = ProviderSettings::default();
        assert!(settings.to_provider_config().is_none());
        assert!(!settings.is_valid());

        let configured = ProviderSettings {
            api_key: "sk-test".to_string(),
            ..ProviderSettings::default()
        };
        let config = configured.to_provider_config().expect("config");
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.default_model, None);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = SettingsStore::new(dir.path().join("absent.conf"));
        assert_eq!(store.settings(), &ProviderSettings::default());
    }
}
