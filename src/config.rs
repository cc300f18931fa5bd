//! Config file + environment secrets, mirroring the teacher's
//! `BaseConfig`/`InnerConfig` two-stage pattern: a JSON file carries
//! structural config, environment variables carry secrets that must never
//! be checked in.

use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Raw, on-disk configuration. Secrets are resolved separately from the
/// environment so this struct is safe to commit as a template.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BaseConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default = "default_provider_health_refresh_ms")]
    pub provider_health_refresh_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub batch_model: Option<String>,
    #[serde(default)]
    pub fallback_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_history_turns")]
    pub history_max_turns: usize,
    /// Whether `/ws/voice` also opens a second, room-mic streaming
    /// session demultiplexed from the same socket (spec §4.H meeting mode).
    #[serde(default)]
    pub meeting_mode: bool,
    #[serde(default)]
    pub intro_enabled: bool,
    #[serde(default)]
    pub wake_words: Vec<String>,
    #[serde(default)]
    pub require_wake_word: bool,
    #[serde(default = "default_open_window_ms")]
    pub open_window_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_echo_suppress_ms")]
    pub echo_suppress_ms: u64,
    #[serde(default = "default_echo_similarity_threshold")]
    pub echo_similarity_threshold: f32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        VoiceConfig {
            system_prompt: None,
            history_max_turns: default_history_turns(),
            meeting_mode: false,
            intro_enabled: false,
            wake_words: Vec::new(),
            require_wake_word: false,
            open_window_ms: default_open_window_ms(),
            cooldown_ms: default_cooldown_ms(),
            echo_suppress_ms: default_echo_suppress_ms(),
            echo_similarity_threshold: default_echo_similarity_threshold(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8445".to_string()
}

fn default_provider_health_refresh_ms() -> u64 {
    5_000
}

fn default_history_turns() -> usize {
    12
}

fn default_open_window_ms() -> u64 {
    6_000
}

fn default_cooldown_ms() -> u64 {
    1_500
}

fn default_echo_suppress_ms() -> u64 {
    3_000
}

fn default_echo_similarity_threshold() -> f32 {
    0.8
}

impl BaseConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let conf: BaseConfig = serde_json::from_reader(file)?;
        Ok(conf)
    }
}

/// Fully resolved configuration: the file plus secrets pulled from the
/// environment. Construction fails fast the way the teacher's
/// `OidcCredentials` setup does when a required secret is absent.
#[derive(Debug, Clone)]
pub struct InnerConfig {
    pub bind_addr: String,
    pub tls: Option<TlsConfig>,
    pub providers: HashMap<String, ResolvedProviderConfig>,
    pub voice: VoiceConfig,
    pub provider_health_refresh_ms: u64,
    pub allowed_origins: Vec<String>,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedProviderConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub batch_model: Option<String>,
    pub fallback_model: Option<String>,
}

impl TryFrom<BaseConfig> for InnerConfig {
    type Error = ConfigError;

    fn try_from(conf: BaseConfig) -> Result<Self, ConfigError> {
        let mut providers = HashMap::new();
        for (name, provider) in conf.providers {
            let env_key = format!("{}_API_KEY", name.to_ascii_uppercase());
            let api_key = env::var(&env_key).ok();
            if provider.enabled && api_key.is_none() {
                tracing::warn!(
                    provider = %name,
                    env_key = %env_key,
                    "provider enabled in config but no API key present in environment"
                );
            }
            providers.insert(
                name,
                ResolvedProviderConfig {
                    enabled: provider.enabled,
                    api_key,
                    model: provider.model,
                    batch_model: provider.batch_model,
                    fallback_model: provider.fallback_model,
                },
            );
        }

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .map(|csv| csv.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        let mut voice = conf.voice;
        if voice.system_prompt.is_none() {
            voice.system_prompt = env::var("VOICE_SYSTEM_PROMPT").ok();
        }
        if let Ok(turns) = env::var("VOICE_HISTORY_MAX_TURNS") {
            if let Ok(turns) = turns.parse() {
                voice.history_max_turns = turns;
            }
        }

        Ok(InnerConfig {
            bind_addr: conf.bind_addr,
            tls: conf.tls,
            providers,
            voice,
            provider_health_refresh_ms: conf.provider_health_refresh_ms,
            allowed_origins,
            database_url: env::var("DATABASE_URL").ok(),
        })
    }
}

impl InnerConfig {
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == origin)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_allow_list_permits_all() {
        let conf = InnerConfig {
            bind_addr: default_bind_addr(),
            tls: None,
            providers: HashMap::new(),
            voice: VoiceConfig::default(),
            provider_health_refresh_ms: 5_000,
            allowed_origins: vec![],
            database_url: None,
        };
        assert!(conf.is_origin_allowed("https://anything.example"));
    }

    #[test]
    fn non_empty_allow_list_rejects_unknown_origin() {
        let conf = InnerConfig {
            bind_addr: default_bind_addr(),
            tls: None,
            providers: HashMap::new(),
            voice: VoiceConfig::default(),
            provider_health_refresh_ms: 5_000,
            allowed_origins: vec!["https://good.example".to_string()],
            database_url: None,
        };
        assert!(conf.is_origin_allowed("https://good.example"));
        assert!(!conf.is_origin_allowed("https://evil.example"));
    }
}
