//! Configuration management for parley.
//!
//! Loads configuration from ${PARLEY_HOME}/config.toml with sensible defaults.
//! The loaded [`Config`] is only a set of defaults: sessions copy what they
//! need when they are created.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::filters::FilterChain;
use crate::request::Numeric;
use crate::transport::Secret;

/// Default config template with comments, embedded at compile time.
const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../default_config.toml");

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const BASE_URL_ENV: &str = "PARLEY_BASE_URL";

pub mod paths {
    //! Path resolution for parley configuration and data directories.
    //!
    //! PARLEY_HOME resolution order:
    //! 1. PARLEY_HOME environment variable (if set)
    //! 2. ~/.config/parley (default)

    use std::path::PathBuf;

    /// Returns the parley home directory.
    pub fn parley_home() -> PathBuf {
        if let Ok(home) = std::env::var("PARLEY_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".parley"),
            |h| h.join(".config").join("parley"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        parley_home().join("config.toml")
    }

    /// Returns the directory log files are written to.
    pub fn log_dir() -> PathBuf {
        parley_home().join("logs")
    }
}

/// How responses are rendered into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Insert the completion as returned.
    #[default]
    Plain,
    /// Rewrite Markdown to Org markup.
    Org,
}

impl RenderMode {
    /// Parses `plain` / `org`.
    pub fn from_id(id: &str) -> Option<RenderMode> {
        match id.trim().to_lowercase().as_str() {
            "plain" | "text" => Some(RenderMode::Plain),
            "org" => Some(RenderMode::Org),
            _ => None,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            RenderMode::Plain => "plain",
            RenderMode::Org => "org",
        }
    }
}

/// Which transport carries requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Curl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Type responses out incrementally
    pub enabled: bool,
    /// Grapheme clusters inserted per tick
    pub chunk_size: usize,
    /// Milliseconds between ticks
    pub interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: 16,
            interval_ms: 150,
        }
    }
}

impl PlaybackConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Endpoint root (for proxies or test rigs)
    pub base_url: Option<String>,
    /// Literal secret
    pub api_key: Option<String>,
    /// Shell command whose stdout is the secret
    pub api_key_command: Option<String>,
    /// Environment variable holding the secret
    pub api_key_env: String,
    pub transport: TransportKind,
    /// Request timeout in seconds (0 disables)
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            api_key_command: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            transport: TransportKind::Http,
            timeout_secs: 120,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The model to use
    pub model: String,

    /// Optional inline system prompt
    pub system_prompt: Option<String>,

    /// Optional path to a file containing the system prompt
    pub system_prompt_file: Option<String>,

    pub temperature: Option<Numeric>,

    pub max_tokens: Option<Numeric>,

    /// Exchanges of history to send (None sends the whole buffer)
    pub turn_limit: Option<usize>,

    pub render_mode: RenderMode,

    /// Text appended after each response
    pub prompt: String,

    /// Response filter names, applied in order
    pub filters: Vec<String>,

    pub playback: PlaybackConfig,

    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: Self::DEFAULT_MODEL.to_string(),
            system_prompt: Some(Self::DEFAULT_SYSTEM_PROMPT.to_string()),
            system_prompt_file: None,
            temperature: None,
            max_tokens: None,
            turn_limit: None,
            render_mode: RenderMode::default(),
            prompt: Self::DEFAULT_PROMPT.to_string(),
            filters: vec!["markup".to_string()],
            playback: PlaybackConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Config {
    const DEFAULT_MODEL: &str = "gpt-4o-mini";
    const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
    const DEFAULT_PROMPT: &str = "\n\n* ";

    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or names an
    /// unknown filter.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        } else {
            Config::default()
        };
        config
            .filter_chain()
            .with_context(|| format!("Invalid filters in {}", path.display()))?;
        Ok(config)
    }

    /// Creates a default config file at the given path.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, DEFAULT_CONFIG_TEMPLATE)
    }

    /// Sets one top-level or dotted (`playback.enabled`) key in a config file.
    ///
    /// Creates the file from the default template if it doesn't exist.
    /// Preserves existing fields and comments using `toml_edit`. The value is
    /// parsed as a TOML value when possible and stored as a string otherwise.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or written, or if
    /// the result is not a valid config.
    pub fn save_value_to(path: &Path, key: &str, value: &str) -> Result<()> {
        use toml_edit::{DocumentMut, Item, Table, Value};

        let contents = if path.exists() {
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?
        } else {
            DEFAULT_CONFIG_TEMPLATE.to_string()
        };

        let mut doc: DocumentMut = contents
            .parse()
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        let parsed = value
            .parse::<Value>()
            .unwrap_or_else(|_| Value::from(value));

        let mut parts: Vec<&str> = key.split('.').collect();
        let Some(leaf) = parts.pop() else {
            anyhow::bail!("Empty config key");
        };
        let mut table = doc.as_table_mut();
        for part in parts {
            let entry = table.entry(part).or_insert(Item::Table(Table::new()));
            table = entry
                .as_table_mut()
                .with_context(|| format!("Config key '{part}' is not a table"))?;
        }
        table[leaf] = Item::Value(parsed);

        let rendered = doc.to_string();
        toml::from_str::<Config>(&rendered)
            .with_context(|| format!("Invalid value for '{key}': {value}"))?;
        Self::write_config(path, &rendered)
    }

    /// Returns the effective system prompt, preferring the file if both are set.
    ///
    /// # Errors
    /// Returns an error if the system prompt file cannot be read.
    pub fn effective_system_prompt(&self) -> Result<String> {
        if let Some(path_str) = &self.system_prompt_file {
            let path = Path::new(path_str);
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read system prompt file: {path_str}"))?;
            return Ok(content.trim().to_string());
        }

        Ok(self.system_prompt.as_deref().unwrap_or("").trim().to_string())
    }

    /// Builds the configured filter chain.
    ///
    /// # Errors
    /// Returns an error if a filter name is unknown.
    pub fn filter_chain(&self) -> Result<FilterChain> {
        FilterChain::from_names(&self.filters)
    }

    /// Resolves the secret with precedence: literal > command > env.
    ///
    /// Returns `None` when no source is configured; sending then fails
    /// before any request is made.
    pub fn resolve_secret(&self) -> Option<Secret> {
        if let Some(key) = non_empty(self.api.api_key.as_deref()) {
            return Some(Secret::literal(key));
        }
        if let Some(command) = non_empty(self.api.api_key_command.as_deref()) {
            return Some(Secret::command(command));
        }
        std::env::var(&self.api.api_key_env)
            .ok()
            .as_deref()
            .and_then(|v| non_empty(Some(v)))
            .map(Secret::literal)
    }

    /// Resolves the base URL with precedence: env > config > default.
    ///
    /// # Errors
    /// Returns an error if the chosen URL is not a valid URL.
    pub fn resolve_base_url(&self) -> Result<String> {
        let env_url = std::env::var(BASE_URL_ENV).ok();
        let chosen = non_empty(env_url.as_deref())
            .or_else(|| non_empty(self.api.base_url.as_deref()))
            .unwrap_or(DEFAULT_BASE_URL);
        url::Url::parse(chosen).with_context(|| format!("Invalid base URL: {chosen}"))?;
        Ok(chosen.trim_end_matches('/').to_string())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        if self.api.timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.api.timeout_secs))
        }
    }

    /// Writes config content to a file, creating parent directories as needed.
    /// Uses atomic write (temp file + rename) to prevent corruption.
    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;
        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
