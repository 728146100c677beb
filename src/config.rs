//! Configuration for MAIA bus clients, the dispatcher and agents
//!
//! Loaded from a TOML file. Every field has a default so a missing section or
//! an empty file yields a working local setup (RabbitMQ on localhost with the
//! guest account).

use crate::protocol::validate_segment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MaiaConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub classifier: ClassifierSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub agent: AgentSection,
}

/// Broker connection settings
///
/// Immutable once a connection has been built from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_guest")]
    pub username: String,
    #[serde(default = "default_guest", skip_serializing)]
    pub password: String,
    /// Environment variable that overrides `password` when set
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_exchange_type")]
    pub exchange_type: String,
    #[serde(default = "default_connection_attempts")]
    pub connection_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u16,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_guest() -> String {
    "guest".to_string()
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_exchange() -> String {
    "maia".to_string()
}

fn default_exchange_type() -> String {
    "topic".to_string()
}

fn default_connection_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    2
}

fn default_heartbeat_secs() -> u16 {
    60
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_guest(),
            password: default_guest(),
            password_env: None,
            virtual_host: default_virtual_host(),
            exchange: default_exchange(),
            exchange_type: default_exchange_type(),
            connection_attempts: default_connection_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl BrokerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Build the AMQP URI, percent-encoding the virtual host (`/` becomes `%2F`).
    pub fn amqp_uri(&self) -> Result<String, ConfigError> {
        let invalid = |what: &str| {
            ConfigError::InvalidConfig(format!("Cannot build broker URI: invalid {what}"))
        };

        let mut url = Url::parse(&format!("amqp://{}:{}", self.host, self.port))
            .map_err(|_| invalid("host"))?;
        url.set_username(&self.username)
            .map_err(|_| invalid("username"))?;
        url.set_password(Some(&self.password))
            .map_err(|_| invalid("password"))?;
        url.path_segments_mut()
            .map_err(|_| invalid("virtual host"))?
            .clear()
            .push(&self.virtual_host);
        url.query_pairs_mut()
            .append_pair("heartbeat", &self.heartbeat_secs.to_string());

        Ok(url.to_string())
    }

    /// URI safe for logs
    pub fn display_uri(&self) -> String {
        format!(
            "amqp://{}@{}:{}/{}",
            self.username, self.host, self.port, self.virtual_host
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exchange_type != "topic" {
            return Err(ConfigError::InvalidConfig(format!(
                "exchange_type must be 'topic', got '{}'",
                self.exchange_type
            )));
        }
        if self.exchange.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "exchange name cannot be empty".to_string(),
            ));
        }
        if self.connection_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "connection_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Intent classifier settings (OpenAI-compatible chat completions endpoint)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable containing the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gemma-3-12b-it".to_string()
}

fn default_api_key_env() -> String {
    "MAIA_LLM_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/openai".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    500
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Dispatcher routing policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherSection {
    /// Agent used when the classifier selects none
    #[serde(default = "default_fallback_agent")]
    pub fallback_agent: String,
    /// Replaces the built-in routing prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_fallback_agent() -> String {
    "SearchAgent".to_string()
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            fallback_agent: default_fallback_agent(),
            system_prompt: None,
        }
    }
}

/// Settings for `maia agent`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MaiaConfig {
    /// Load configuration from a TOML file, validate it and resolve env overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: MaiaConfig = toml::from_str(content)?;
        config.validate()?;
        config.resolve_env_vars();
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;

        validate_segment(&self.dispatcher.fallback_agent).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "fallback_agent '{}' is not a valid topic segment: {e}",
                self.dispatcher.fallback_agent
            ))
        })?;

        if !(0.0..=2.0).contains(&self.classifier.temperature) {
            return Err(ConfigError::InvalidConfig(format!(
                "classifier temperature must be within 0.0..=2.0, got {}",
                self.classifier.temperature
            )));
        }

        Ok(())
    }

    fn resolve_env_vars(&mut self) {
        if let Some(password) = Self::get_env_var_optional(self.broker.password_env.as_ref()) {
            self.broker.password = password;
        }
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Broker settings for building connections
    pub fn broker_config(&self) -> BrokerConfig {
        self.broker.clone()
    }

    /// Classifier API key from the configured environment variable
    pub fn get_classifier_api_key(&self) -> Result<String, ConfigError> {
        Self::get_env_var_required(&self.classifier.api_key_env)
    }
}
