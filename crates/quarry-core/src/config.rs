use std::time::Duration;

use serde::{Deserialize, Serialize};

use quarry_providers::ProviderSettings;
use quarry_store::TeamConfig;

use crate::gate::{DEFAULT_FIREWORKS_LIMIT, DEFAULT_OPENAI_LIMIT, DEFAULT_OPENROUTER_LIMIT};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimits {
    pub openrouter: usize,
    pub fireworks: usize,
    pub openai: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            openrouter: DEFAULT_OPENROUTER_LIMIT,
            fireworks: DEFAULT_FIREWORKS_LIMIT,
            openai: DEFAULT_OPENAI_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub session_ttl_secs: u64,
    pub heartbeat_ttl_secs: u64,
    pub rate_limits: RateLimits,
    /// Model catalog exposed by `GET /models`.
    pub hunt_models: Vec<String>,
    pub judge_models: Vec<String>,
    #[serde(skip)]
    pub providers: ProviderSettings,
    #[serde(default)]
    pub team: TeamConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 60 * 60 * 24 * 7,
            heartbeat_ttl_secs: 30,
            rate_limits: RateLimits::default(),
            hunt_models: vec![
                "nvidia/nemotron-3-nano-30b-a3b".to_string(),
                "qwen/qwen3-235b-a22b-thinking-2507".to_string(),
            ],
            judge_models: vec!["gpt-5".to_string(), "gpt-4o".to_string()],
            providers: ProviderSettings::default(),
            team: TeamConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides for deploy-time knobs.
    pub fn from_env() -> Self {
        let mut config = Self {
            providers: ProviderSettings::from_env(),
            ..Self::default()
        };
        if let Some(ttl) = env_u64("QUARRY_SESSION_TTL_SECS") {
            config.session_ttl_secs = ttl;
        }
        if let Some(ttl) = env_u64("QUARRY_HEARTBEAT_TTL_SECS") {
            config.heartbeat_ttl_secs = ttl.max(1);
        }
        config
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn rate_limit_entries(&self) -> Vec<(String, usize)> {
        vec![
            ("openrouter".to_string(), self.rate_limits.openrouter),
            ("fireworks".to_string(), self.rate_limits.fireworks),
            ("openai".to_string(), self.rate_limits.openai),
        ]
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
