//! Settings file loading.
//!
//! Values are layered: built-in defaults, then the YAML file, then
//! environment variables. CLI flags are applied last by the command layer.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_REDIS_ADDR: &str = "127.0.0.1:6379";
pub const DEFAULT_CHANNEL_PREFIX: &str = "discord:relay";
pub const DEFAULT_API_BASE_URL: &str = "https://discord.com/api/v10";
pub const DEFAULT_INTERACTION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub const CONFIG_PATH_ENV: &str = "DISCORD_RELAY_CONFIG";
pub const PUBLIC_KEY_ENV: &str = "DISCORD_RELAY_PUBLIC_KEY";
pub const PUBLIC_URL_ENV: &str = "DISCORD_RELAY_PUBLIC_URL";
pub const APPLICATION_ID_ENV: &str = "DISCORD_RELAY_APPLICATION_ID";
pub const TUNNEL_PROVIDER_ENV: &str = "DISCORD_RELAY_TUNNEL_PROVIDER";
pub const NGROK_AUTH_TOKEN_ENV: &str = "DISCORD_RELAY_NGROK_AUTH_TOKEN";
pub const REDIS_ADDR_ENV: &str = "DISCORD_RELAY_REDIS_ADDR";
pub const REDIS_PASSWORD_ENV: &str = "DISCORD_RELAY_REDIS_PASSWORD";
pub const REDIS_PREFIX_ENV: &str = "DISCORD_RELAY_REDIS_PREFIX";
pub const AGENT_ID_ENV: &str = "DISCORD_RELAY_AGENT_ID";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub discord: DiscordSettings,
    pub server: ServerSettings,
    pub redis: RedisSettings,
    pub tunnel: TunnelSettings,
    pub interactions: InteractionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordSettings {
    pub application_id: String,
    pub public_key: String,
    pub public_url: String,
    pub api_base_url: String,
}

impl Default for DiscordSettings {
    fn default() -> Self {
        Self {
            application_id: String::new(),
            public_key: String::new(),
            public_url: String::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub addr: String,
    pub db: u8,
    pub password: String,
    pub channel_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_REDIS_ADDR.to_string(),
            db: 0,
            password: String::new(),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    pub provider: String,
    pub ngrok_auth_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionSettings {
    pub enabled: bool,
    pub timeout: Option<TimeoutSetting>,
    pub handlers: HandlersConfig,
}

impl Default for InteractionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: None,
            handlers: HandlersConfig::default(),
        }
    }
}

/// `timeout: 30s`, `timeout: 15m` or `timeout: 90`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeoutSetting {
    Seconds(u64),
    Text(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlersConfig {
    pub commands: BTreeMap<String, RouteConfig>,
    pub components: BTreeMap<String, RouteConfig>,
    pub modals: BTreeMap<String, RouteConfig>,
    pub autocomplete: BTreeMap<String, RouteConfig>,
}

impl HandlersConfig {
    pub fn total(&self) -> usize {
        self.commands.len() + self.components.len() + self.modals.len() + self.autocomplete.len()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub agent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<ChoiceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChoiceConfig {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub value: Option<Value>,
}

/// Settings plus the file they came from, if any.
#[derive(Debug, Clone)]
pub struct LoadedSettings {
    pub settings: Settings,
    pub path: Option<PathBuf>,
}

impl Settings {
    /// Parse a YAML document and normalise it.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut settings: Settings =
            serde_yaml::from_str(text).context("failed to parse settings yaml")?;
        settings.normalize()?;
        settings.interaction_timeout()?;
        Ok(settings)
    }

    /// Discover and load the settings file, then apply environment overrides.
    ///
    /// No file at all is not an error; a file that exists but does not parse is.
    pub fn load(explicit: Option<&Path>) -> Result<LoadedSettings> {
        Self::load_with(explicit, |key| std::env::var(key).ok())
    }

    pub fn load_with<F>(explicit: Option<&Path>, lookup: F) -> Result<LoadedSettings>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = explicit {
            if !path.exists() {
                anyhow::bail!("config file {} does not exist", path.display());
            }
        }

        let path = discover_config_path(explicit, &lookup);
        let mut settings = match &path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_yaml(&text)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Settings::default(),
        };
        settings.apply_env(&lookup);
        settings.normalize()?;

        Ok(LoadedSettings { settings, path })
    }

    /// Environment overrides. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = get(PUBLIC_KEY_ENV) {
            self.discord.public_key = value;
        }
        if let Some(value) = get(PUBLIC_URL_ENV) {
            self.discord.public_url = value;
        }
        if let Some(value) = get(APPLICATION_ID_ENV) {
            self.discord.application_id = value;
        }
        if let Some(value) = get(TUNNEL_PROVIDER_ENV) {
            self.tunnel.provider = value;
        }
        if let Some(value) = get(NGROK_AUTH_TOKEN_ENV) {
            self.tunnel.ngrok_auth_token = value;
        }
        if let Some(value) = get(REDIS_ADDR_ENV) {
            self.redis.addr = value;
        }
        if let Some(value) = get(REDIS_PASSWORD_ENV) {
            self.redis.password = value;
        }
        if let Some(value) = get(REDIS_PREFIX_ENV) {
            self.redis.channel_prefix = value;
        }
    }

    /// Fill blanks with defaults and lowercase command-style keys. Two keys
    /// that collapse to the same lowercase name are an error.
    pub fn normalize(&mut self) -> Result<()> {
        if self.server.listen_addr.trim().is_empty() {
            self.server.listen_addr = DEFAULT_LISTEN_ADDR.to_string();
        }
        if self.redis.addr.trim().is_empty() {
            self.redis.addr = DEFAULT_REDIS_ADDR.to_string();
        }
        if self.redis.channel_prefix.trim().is_empty() {
            self.redis.channel_prefix = DEFAULT_CHANNEL_PREFIX.to_string();
        }
        if self.discord.api_base_url.trim().is_empty() {
            self.discord.api_base_url = DEFAULT_API_BASE_URL.to_string();
        }

        let handlers = &mut self.interactions.handlers;
        handlers.commands = lowercase_keys("commands", std::mem::take(&mut handlers.commands))?;
        handlers.autocomplete =
            lowercase_keys("autocomplete", std::mem::take(&mut handlers.autocomplete))?;
        Ok(())
    }

    pub fn interaction_timeout(&self) -> Result<Duration> {
        match &self.interactions.timeout {
            None => Ok(DEFAULT_INTERACTION_TIMEOUT),
            Some(TimeoutSetting::Seconds(0)) => Ok(DEFAULT_INTERACTION_TIMEOUT),
            Some(TimeoutSetting::Seconds(secs)) => Ok(Duration::from_secs(*secs)),
            Some(TimeoutSetting::Text(text)) if text.trim().is_empty() => {
                Ok(DEFAULT_INTERACTION_TIMEOUT)
            }
            Some(TimeoutSetting::Text(text)) => parse_duration(text)
                .with_context(|| format!("invalid interactions.timeout {text:?}")),
        }
    }
}

fn lowercase_keys(
    table: &str,
    map: BTreeMap<String, RouteConfig>,
) -> Result<BTreeMap<String, RouteConfig>> {
    let mut lowered = BTreeMap::new();
    for (key, route) in map {
        let normalized = key.trim().to_lowercase();
        if lowered.insert(normalized.clone(), route).is_some() {
            anyhow::bail!(
                "interactions.handlers.{table}: `{key}` collides with another `{normalized}` key"
            );
        }
    }
    Ok(lowered)
}

/// Parse `500ms`, `30s`, `15m`, `1h` or a bare number of seconds.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    if digits.is_empty() {
        anyhow::bail!("duration {text:?} has no number");
    }
    let value: u64 = digits
        .parse()
        .with_context(|| format!("duration {text:?} is out of range"))?;
    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(scale(value, 60, text)?),
        "h" => Duration::from_secs(scale(value, 3600, text)?),
        other => anyhow::bail!("unknown duration unit {other:?} in {text:?}"),
    };
    Ok(duration)
}

fn scale(value: u64, factor: u64, text: &str) -> Result<u64> {
    value
        .checked_mul(factor)
        .with_context(|| format!("duration {text:?} is out of range"))
}

/// First existing candidate wins: explicit path, `$DISCORD_RELAY_CONFIG`,
/// the per-user config dir, then the working directory.
pub fn discover_config_path<F>(explicit: Option<&Path>, lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    config_candidates(explicit, lookup)
        .into_iter()
        .find(|candidate| candidate.is_file())
}

pub fn config_candidates<F>(explicit: Option<&Path>, lookup: F) -> Vec<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    if let Some(path) = lookup(CONFIG_PATH_ENV).filter(|value| !value.trim().is_empty()) {
        candidates.push(PathBuf::from(path));
    }
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("discord-relay").join("config.yaml"));
    }
    candidates.push(PathBuf::from("discord-relay.yaml"));
    candidates.push(PathBuf::from("config").join("discord-relay.yaml"));
    candidates
}
