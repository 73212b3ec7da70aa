use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use thiserror::Error;

use crate::dispatch::OutputOrder;

pub const APP_DIR_NAME: &str = "chunk-relay";
pub const CONFIG_FILE_NAME: &str = "config.toml";

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo-0301";
pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_MAX_TOKENS: u32 = 200;
pub const DEFAULT_TEMPERATURE: f32 = 0.5;

/// Environment variables consulted for the API key, in order.
pub const API_KEY_VARS: [&str; 2] = ["OPENAI_KEY", "OPENAI_API_KEY"];
pub const API_BASE_VAR: &str = "OPENAI_API_BASE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing API key: set OPENAI_KEY (or OPENAI_API_KEY) in the environment or .env")]
    MissingApiKey,
    #[error("chunk_size must be at least 1")]
    ZeroChunkSize,
    #[error("unable to resolve OS config directory")]
    NoConfigDir,
    #[error("reading config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Optional on-disk defaults. Every field may be overridden from the command line.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FileConfig {
    pub model: Option<String>,
    pub chunk_size: Option<usize>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub api_base: Option<String>,
    pub timeout_secs: Option<u64>,
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let base = config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

pub fn load_config_if_exists(path: &Path) -> Result<Option<FileConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(cfg))
}

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub input: PathBuf,
    pub output: PathBuf,
    pub log: PathBuf,
    pub prompt: String,
    pub model: Option<String>,
    pub chunk_size: Option<usize>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout_secs: Option<u64>,
    pub preserve_order: bool,
    pub config_path: Option<PathBuf>,
}

/// Everything a run needs, resolved once at startup and passed down explicitly.
#[derive(Clone)]
pub struct Settings {
    pub input: PathBuf,
    pub output: PathBuf,
    pub log: PathBuf,
    pub prompt: String,
    pub model: String,
    pub chunk_size: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub api_key: String,
    pub api_base: Option<String>,
    pub timeout: Option<Duration>,
    pub order: OutputOrder,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("input", &self.input)
            .field("output", &self.output)
            .field("log", &self.log)
            .field("model", &self.model)
            .field("chunk_size", &self.chunk_size)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("api_key", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("timeout", &self.timeout)
            .field("order", &self.order)
            .finish()
    }
}

/// First non-blank value among [`API_KEY_VARS`].
pub fn api_key_from_env() -> Result<String, ConfigError> {
    API_KEY_VARS
        .iter()
        .filter_map(|name| env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .ok_or(ConfigError::MissingApiKey)
}

/// Merge command line, config file and built-in defaults, in that priority.
pub fn resolve_settings(
    cli: CliOverrides,
    file: Option<FileConfig>,
    api_key: String,
) -> Result<Settings, ConfigError> {
    let file = file.unwrap_or_default();
    let chunk_size = cli.chunk_size.or(file.chunk_size).unwrap_or(DEFAULT_CHUNK_SIZE);
    if chunk_size == 0 {
        return Err(ConfigError::ZeroChunkSize);
    }
    let api_base = env::var(API_BASE_VAR)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or(file.api_base);
    Ok(Settings {
        input: cli.input,
        output: cli.output,
        log: cli.log,
        prompt: cli.prompt,
        model: cli.model.or(file.model).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        chunk_size,
        max_tokens: cli.max_tokens.or(file.max_tokens).unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: cli.temperature.or(file.temperature).unwrap_or(DEFAULT_TEMPERATURE),
        api_key,
        api_base,
        timeout: cli.timeout_secs.or(file.timeout_secs).map(Duration::from_secs),
        order: if cli.preserve_order { OutputOrder::Chunk } else { OutputOrder::Arrival },
    })
}

/// Read the config file (explicit path, else the default location) and the
/// API key, then build [`Settings`].
pub fn load_settings(cli: CliOverrides) -> Result<Settings, ConfigError> {
    let api_key = api_key_from_env()?;
    let path = match &cli.config_path {
        Some(p) => p.clone(),
        None => match default_config_path() {
            Ok(p) => p,
            Err(_) => return resolve_settings(cli, None, api_key),
        },
    };
    let file = load_config_if_exists(&path)?;
    if file.is_some() {
        tracing::debug!(path = %path.display(), "loaded config file");
    }
    resolve_settings(cli, file, api_key)
}
