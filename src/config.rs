use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Placeholder substituted with the percent-encoded feed URL in relay templates.
pub const RELAY_URL_PLACEHOLDER: &str = "{url}";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Shared-scope sync interval in minutes, 0 disables the scheduler
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seed the source list into a user's scope on their first sync
    #[serde(default)]
    pub seed_new_users: bool,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_refresh_interval() -> u64 {
    15
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_source_timeout")]
    pub source_timeout_secs: u64,
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Relay URL templates tried in order after the direct fetch fails
    #[serde(default)]
    pub relays: Vec<String>,
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_source_timeout() -> u64 {
    30
}

fn default_run_timeout() -> u64 {
    120
}

fn default_max_concurrency() -> usize {
    4
}

fn default_user_agent() -> String {
    "Newsdesk/1.0 (Feed Aggregator)".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
            source_timeout_secs: default_source_timeout(),
            run_timeout_secs: default_run_timeout(),
            max_concurrency: default_max_concurrency(),
            user_agent: default_user_agent(),
            relays: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Worker pool size, clamped to 1..=16
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, 16)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranslationConfig {
    #[serde(default = "default_translation_base_url")]
    pub base_url: String,
    #[serde(default = "default_translation_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_translation_timeout")]
    pub timeout_secs: u64,
}

fn default_translation_base_url() -> String {
    "https://api.minimaxi.com/v1/text/chatcompletion_v2".to_string()
}

fn default_translation_model() -> String {
    "MiniMax-Text-01".to_string()
}

fn default_system_prompt() -> String {
    "You are a professional technical translator. Translate the following text into \
     Simplified Chinese. Keep technical terms accurate, preserve code and links, and \
     output only the translation."
        .to_string()
}

fn default_translation_timeout() -> u64 {
    60
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            base_url: default_translation_base_url(),
            model: default_translation_model(),
            system_prompt: default_system_prompt(),
            timeout_secs: default_translation_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for relay in &self.sync.relays {
            if !relay.contains(RELAY_URL_PLACEHOLDER) {
                anyhow::bail!(
                    "relay template '{}' is missing the {} placeholder",
                    relay,
                    RELAY_URL_PLACEHOLDER
                );
            }
        }
        Ok(())
    }
}
