use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::mqtt::config::{BrokerCredentials, BrokerEndpoint, EndpointError, MqttConfig};
use crate::session::actuator::ToggleMode;
use crate::session::discovery::DiscoverySettings;
use crate::session::telemetry::ClassificationEncoding;
use crate::session::SessionSettings;

pub const APP_DIR: &str = "esteira-control";
const CONFIG_FILE: &str = "config.toml";

pub const USERNAME_ENV: &str = "ESTEIRA_MQTT_USERNAME";
pub const PASSWORD_ENV: &str = "ESTEIRA_MQTT_PASSWORD";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid broker URL: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerSection,
    pub topics: TopicSection,
    pub actuator: ActuatorSection,
    pub classification: ClassificationSection,
    pub discovery: DiscoverySection,
    pub storage: StorageSection,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub url: String,
    /// Prefer `ESTEIRA_MQTT_USERNAME` over storing it here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Prefer `ESTEIRA_MQTT_PASSWORD` over storing it here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub channel_capacity: usize,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost:1883".to_string(),
            username: None,
            password: None,
            client_id_prefix: "esteira".to_string(),
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            channel_capacity: 10,
        }
    }
}

impl fmt::Debug for BrokerSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSection")
            .field("url", &self.url)
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_some() {
                    &"<redacted>"
                } else {
                    &"<not set>"
                },
            )
            .field("client_id_prefix", &self.client_id_prefix)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicSection {
    pub receive: String,
    pub send: String,
}

impl Default for TopicSection {
    fn default() -> Self {
        Self {
            receive: "dados/camera".to_string(),
            send: "dados/app".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorSection {
    pub debounce_ms: u64,
    /// Device status topic. When set, toggles wait for the device instead
    /// of the debounce delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_topic: Option<String>,
    pub ack_timeout_ms: u64,
}

impl Default for ActuatorSection {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            ack_topic: None,
            ack_timeout_ms: 3_000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationSection {
    pub encoding: ClassificationEncoding,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub request_topic: String,
    pub response_topic: String,
    pub request_token: String,
    pub timeout_secs: u64,
    /// The rig's camera firmware answers with a bare `http://<ip>:5000`
    /// and no request id, so plain answers are accepted unless this is
    /// turned off. Only honored while a single request is outstanding.
    pub accept_uncorrelated: bool,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        let defaults = DiscoverySettings::default();
        Self {
            request_topic: defaults.request_topic,
            response_topic: defaults.response_topic,
            request_token: defaults.request_token,
            timeout_secs: defaults.timeout.as_secs(),
            accept_uncorrelated: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Key/value settings file. Defaults next to the config file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(APP_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config: AppConfig = toml::from_str(&content)?;
        debug!("Config loaded from {}", path.display());
        Ok(config)
    }

    /// Loads the config, writing the defaults first if the file is missing.
    /// Environment credentials are applied afterwards and never written back.
    pub async fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let mut config = if exists {
            Self::load(path).await?
        } else {
            info!("No config at {}, writing defaults", path.display());
            let config = Self::default();
            config.save(path).await?;
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await.map_err(io_error)?;
        debug!("Config written to {}", path.display());
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_credentials(
            std::env::var(USERNAME_ENV).ok(),
            std::env::var(PASSWORD_ENV).ok(),
        );
    }

    fn apply_credentials(&mut self, username: Option<String>, password: Option<String>) {
        if let Some(username) = username.filter(|v| !v.is_empty()) {
            debug!("Broker username taken from {}", USERNAME_ENV);
            self.broker.username = Some(username);
        }
        if let Some(password) = password.filter(|v| !v.is_empty()) {
            debug!("Broker password taken from {}", PASSWORD_ENV);
            self.broker.password = Some(password);
        }
    }

    pub fn mqtt_config(&self) -> Result<MqttConfig, ConfigError> {
        let endpoint = BrokerEndpoint::parse(&self.broker.url)?;

        if self.broker.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broker.channel_capacity must be at least 1".to_string(),
            ));
        }

        let credentials = match (&self.broker.username, &self.broker.password) {
            (Some(username), password) => Some(BrokerCredentials {
                username: username.clone(),
                password: password.clone().unwrap_or_default(),
            }),
            (None, Some(_)) => {
                warn!("Broker password set without a username, ignoring it");
                None
            }
            (None, None) => None,
        };

        Ok(MqttConfig {
            endpoint,
            credentials,
            client_id_prefix: self.broker.client_id_prefix.clone(),
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            channel_capacity: self.broker.channel_capacity,
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        let toggle_mode = match &self.actuator.ack_topic {
            Some(topic) if !topic.trim().is_empty() => ToggleMode::Acknowledged {
                topic: topic.clone(),
                timeout: Duration::from_millis(self.actuator.ack_timeout_ms),
            },
            _ => ToggleMode::Debounce(Duration::from_millis(self.actuator.debounce_ms)),
        };

        SessionSettings {
            receive_topic: self.topics.receive.clone(),
            send_topic: self.topics.send.clone(),
            encoding: self.classification.encoding,
            toggle_mode,
            discovery: DiscoverySettings {
                request_topic: self.discovery.request_topic.clone(),
                response_topic: self.discovery.response_topic.clone(),
                request_token: self.discovery.request_token.clone(),
                timeout: Duration::from_secs(self.discovery.timeout_secs),
                accept_uncorrelated: self.discovery.accept_uncorrelated,
            },
            connect_timeout: Duration::from_secs(self.broker.connect_timeout_secs),
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.storage
            .settings_path
            .clone()
            .unwrap_or_else(crate::persistence::KeyValueStore::default_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(APP_DIR).join(CONFIG_FILE);

        let config = AppConfig::load_or_init(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.topics, TopicSection::default());

        let reloaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(reloaded.broker.url, "mqtt://localhost:1883");
        assert_eq!(reloaded.discovery.timeout_secs, 15);
    }

    #[tokio::test]
    async fn partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(
            &path,
            r#"
[topics]
receive = "esp32/placa_esp"
send = "esp32/site"

[classification]
encoding = "numeric"
"#,
        )
        .await
        .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        let settings = config.session_settings();
        assert_eq!(settings.receive_topic, "esp32/placa_esp");
        assert_eq!(settings.send_topic, "esp32/site");
        assert_eq!(settings.encoding, ClassificationEncoding::Numeric);
        assert_eq!(
            settings.toggle_mode,
            ToggleMode::Debounce(Duration::from_millis(500))
        );
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert!(settings.discovery.accept_uncorrelated);
    }

    #[tokio::test]
    async fn plain_discovery_answers_can_be_turned_off() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[discovery]\naccept_uncorrelated = false\n")
            .await
            .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert!(!config.session_settings().discovery.accept_uncorrelated);
        assert_eq!(config.discovery.timeout_secs, 15);
    }

    #[tokio::test]
    async fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[broker\nurl = 3").await.unwrap();
        assert!(matches!(
            AppConfig::load(&path).await,
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn ack_topic_switches_toggle_mode() {
        let mut config = AppConfig::default();
        config.actuator.ack_topic = Some("dados/esteira/estado".to_string());
        config.actuator.ack_timeout_ms = 2_000;
        assert_eq!(
            config.session_settings().toggle_mode,
            ToggleMode::Acknowledged {
                topic: "dados/esteira/estado".to_string(),
                timeout: Duration::from_secs(2),
            }
        );
    }

    #[test]
    fn credentials_come_from_environment_values() {
        let mut config = AppConfig::default();
        config.apply_credentials(Some("operador".to_string()), Some("s3cret".to_string()));

        let mqtt = config.mqtt_config().unwrap();
        let credentials = mqtt.credentials.expect("credentials set");
        assert_eq!(credentials.username, "operador");
        assert_eq!(credentials.password, "s3cret");

        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn empty_environment_values_are_ignored() {
        let mut config = AppConfig::default();
        config.broker.username = Some("from-file".to_string());
        config.apply_credentials(Some(String::new()), None);
        assert_eq!(config.broker.username.as_deref(), Some("from-file"));
        assert!(format!("{:?}", config).contains("<not set>"));
    }

    #[test]
    fn invalid_broker_settings_are_rejected() {
        let mut config = AppConfig::default();
        config.broker.url = "http://broker.local".to_string();
        assert!(matches!(
            config.mqtt_config(),
            Err(ConfigError::Endpoint(EndpointError::UnsupportedScheme(_)))
        ));

        let mut config = AppConfig::default();
        config.broker.channel_capacity = 0;
        assert!(matches!(config.mqtt_config(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn credentials_are_never_serialized_when_unset() {
        let content = toml::to_string_pretty(&AppConfig::default()).unwrap();
        assert!(!content.contains("password"));
        assert!(!content.contains("username"));
    }
}
