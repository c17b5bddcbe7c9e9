use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::transcribe::Provider;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    /// The operator's Telegram user id. Commands and error reports go here.
    owner_id: i64,
    telegram_bot_token: String,
    /// Gemini web app cookies.
    secure_1psid: String,
    secure_1psidts: Option<String>,
    /// Directory for state files (database, logs, temp media). Defaults to
    /// current directory.
    data_dir: Option<String>,
    /// Seconds of inactivity before a user's buffered messages are flushed.
    #[serde(default = "default_quiet_window")]
    quiet_window_secs: u64,
    /// Speech-to-text provider for the /ts command.
    stt_provider: Option<Provider>,
    assemblyai_token: Option<String>,
    deepgram_token: Option<String>,
    mistral_token: Option<String>,
}

fn default_quiet_window() -> u64 {
    8
}

pub struct Config {
    pub owner_id: i64,
    pub telegram_bot_token: String,
    pub secure_1psid: String,
    pub secure_1psidts: Option<String>,
    pub data_dir: PathBuf,
    pub quiet_window_secs: u64,
    pub stt_provider: Option<Provider>,
    pub assemblyai_token: Option<String>,
    pub deepgram_token: Option<String>,
    pub mistral_token: Option<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        // Validate required fields
        if file.owner_id == 0 {
            return Err(ConfigError::Validation("owner_id is required".into()));
        }
        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }
        if file.secure_1psid.is_empty() {
            return Err(ConfigError::Validation("secure_1psid is required".into()));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let config = Self {
            owner_id: file.owner_id,
            telegram_bot_token: file.telegram_bot_token,
            secure_1psid: file.secure_1psid,
            secure_1psidts: file.secure_1psidts,
            data_dir,
            quiet_window_secs: file.quiet_window_secs,
            stt_provider: file.stt_provider,
            assemblyai_token: file.assemblyai_token,
            deepgram_token: file.deepgram_token,
            mistral_token: file.mistral_token,
        };
        if config.stt_provider.is_some() && config.stt_token().is_none() {
            return Err(ConfigError::Validation(
                "stt_provider is set but no token is configured for it".into(),
            ));
        }
        Ok(config)
    }

    /// Token for the configured speech-to-text provider.
    pub fn stt_token(&self) -> Option<String> {
        match self.stt_provider? {
            Provider::AssemblyAi => self.assemblyai_token.clone(),
            Provider::Deepgram => self.deepgram_token.clone(),
            Provider::Mistral => self.mistral_token.clone(),
        }
    }
}
