//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Placeholder substituted with the job's source path in a profile template
pub const INPUT_PLACEHOLDER: &str = "{inputFile}";

/// Placeholder substituted with the job's derived output path in a profile template
pub const OUTPUT_PLACEHOLDER: &str = "{outputFile}";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A configured value is unusable
    Invalid(String),
    /// A profile template is malformed
    InvalidProfile { id: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
            ConfigError::InvalidProfile { id, reason } => {
                write!(f, "Invalid profile '{}': {}", id, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Folder roots, encoder invocation and daemon settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MainConfig {
    /// Every job source must live under this folder
    pub root_folder: PathBuf,
    /// Output paths mirror the source tree under this folder
    pub output_folder: PathBuf,
    /// Port for the JSON operation surface (default 3000)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Encoder executable (default `HandBrakeCLI`)
    #[serde(default = "default_encoder")]
    pub encoder: String,
    /// Regex matched against encoder output to detect a finished encode
    #[serde(default = "default_completion_marker")]
    pub completion_marker: String,
    /// Location of the persisted queue document (default `config.json`)
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Seconds to wait after SIGINT before force-killing the encoder
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,
}

fn default_listen_port() -> u16 {
    3000
}

fn default_encoder() -> String {
    "HandBrakeCLI".to_string()
}

fn default_completion_marker() -> String {
    "Encode done!".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from("config.json")
}

fn default_terminate_grace_secs() -> u64 {
    30
}

impl MainConfig {
    /// Settings with defaults for everything but the two folder roots
    pub fn new(root_folder: impl Into<PathBuf>, output_folder: impl Into<PathBuf>) -> Self {
        Self {
            root_folder: root_folder.into(),
            output_folder: output_folder.into(),
            listen_port: default_listen_port(),
            encoder: default_encoder(),
            completion_marker: default_completion_marker(),
            state_file: default_state_file(),
            terminate_grace_secs: default_terminate_grace_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub main: MainConfig,
    /// Profile id -> whitespace-separated argument template
    #[serde(default)]
    pub profiles: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - HBQ_ROOT_FOLDER -> main.root_folder
    /// - HBQ_OUTPUT_FOLDER -> main.output_folder
    /// - HBQ_LISTEN_PORT -> main.listen_port
    /// - HBQ_ENCODER -> main.encoder
    /// - HBQ_STATE_FILE -> main.state_file
    /// - HBQ_TERMINATE_GRACE_SECS -> main.terminate_grace_secs
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("HBQ_ROOT_FOLDER") {
            self.main.root_folder = PathBuf::from(val);
        }

        if let Ok(val) = env::var("HBQ_OUTPUT_FOLDER") {
            self.main.output_folder = PathBuf::from(val);
        }

        if let Ok(val) = env::var("HBQ_LISTEN_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.main.listen_port = port;
            }
        }

        if let Ok(val) = env::var("HBQ_ENCODER") {
            if !val.is_empty() {
                self.main.encoder = val;
            }
        }

        if let Ok(val) = env::var("HBQ_STATE_FILE") {
            self.main.state_file = PathBuf::from(val);
        }

        if let Ok(val) = env::var("HBQ_TERMINATE_GRACE_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.main.terminate_grace_secs = secs;
            }
        }
    }

    /// Check folder roots and every registered profile template
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.main.root_folder.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "root_folder must be absolute, got {}",
                self.main.root_folder.display()
            )));
        }
        if !self.main.output_folder.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "output_folder must be absolute, got {}",
                self.main.output_folder.display()
            )));
        }
        if self.main.encoder.trim().is_empty() {
            return Err(ConfigError::Invalid("encoder must not be empty".to_string()));
        }
        for (id, template) in &self.profiles {
            validate_profile_template(id, template)?;
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

/// Validate a profile argument template at registration time
///
/// The template must name the input and output exactly once each, and the
/// output token must spell out the container extension, since the derived
/// output path has its extension stripped.
pub fn validate_profile_template(id: &str, template: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidProfile {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    let tokens: Vec<&str> = template.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(invalid("template is empty"));
    }

    let input_count = template.matches(INPUT_PLACEHOLDER).count();
    if input_count != 1 {
        return Err(invalid("template must contain {inputFile} exactly once"));
    }

    let output_count = template.matches(OUTPUT_PLACEHOLDER).count();
    if output_count != 1 {
        return Err(invalid("template must contain {outputFile} exactly once"));
    }

    let output_token = tokens
        .iter()
        .find(|t| t.contains(OUTPUT_PLACEHOLDER))
        .ok_or_else(|| invalid("template must contain {outputFile} exactly once"))?;
    let suffix = output_token
        .split(OUTPUT_PLACEHOLDER)
        .nth(1)
        .unwrap_or_default();
    if !suffix.starts_with('.') || suffix.len() < 2 {
        return Err(invalid(
            "{outputFile} must be followed by an extension, e.g. {outputFile}.mkv",
        ));
    }

    Ok(())
}
