//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.trivia/config.json`) and environment.
//! Every field has a default, so an empty `{}` (or no file at all) is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::game::ScoringPolicy;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP + WebSocket server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream trivia content service.
    #[serde(default)]
    pub content: ContentConfig,

    /// Per-session limits, scoring policy and reaper timings.
    #[serde(default)]
    pub sessions: SessionsConfig,
}

/// Server bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port for HTTP and WebSocket (default 8080).
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_server_bind")]
    pub bind: String,
}

fn default_server_port() -> u16 {
    8080
}

fn default_server_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            bind: default_server_bind(),
        }
    }
}

/// Content service base URL and persistence switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentConfig {
    /// Base URL of the content service. Overridden by TRIVIA_CONTENT_URL env.
    #[serde(default = "default_content_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_content_timeout_secs")]
    pub timeout_secs: u64,

    /// Forward every accepted answer submission to the content service.
    #[serde(default)]
    pub persist_answers: bool,

    /// Forward session status transitions to the content service.
    #[serde(default)]
    pub persist_status: bool,
}

fn default_content_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_content_timeout_secs() -> u64 {
    30
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            base_url: default_content_base_url(),
            timeout_secs: default_content_timeout_secs(),
            persist_answers: false,
            persist_status: false,
        }
    }
}

/// Session queue bounds, scoring policy and lifecycle timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsConfig {
    /// Bound of each session's inbound event queue.
    #[serde(default = "default_queue_capacity")]
    pub inbound_queue_capacity: usize,

    /// Bound of each connection's outbound queue. A fan-out that finds it full drops the connection.
    #[serde(default = "default_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// "manual" (host enters points per team) or "autoAward" (every submitter gets full points).
    #[serde(default)]
    pub scoring_policy: ScoringPolicy,

    /// Max teams requested from the content service when the create request omits it.
    #[serde(default = "default_max_teams")]
    pub max_teams: u32,

    /// How many times session creation retries when the content service hands back a code already in use.
    #[serde(default = "default_max_code_attempts")]
    pub max_code_attempts: u32,

    /// Sessions with no inbound activity for this long are retired.
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,

    /// Completed sessions are retired this long after completion.
    #[serde(default = "default_completed_ttl_secs")]
    pub completed_ttl_secs: u64,

    /// How often the reaper scans the registry.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_teams() -> u32 {
    10
}

fn default_max_code_attempts() -> u32 {
    5
}

fn default_idle_ttl_secs() -> u64 {
    4 * 60 * 60
}

fn default_completed_ttl_secs() -> u64 {
    30 * 60
}

fn default_reap_interval_secs() -> u64 {
    60
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            inbound_queue_capacity: default_queue_capacity(),
            outbound_queue_capacity: default_queue_capacity(),
            scoring_policy: ScoringPolicy::default(),
            max_teams: default_max_teams(),
            max_code_attempts: default_max_code_attempts(),
            idle_ttl_secs: default_idle_ttl_secs(),
            completed_ttl_secs: default_completed_ttl_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

impl SessionsConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn completed_ttl(&self) -> Duration {
        Duration::from_secs(self.completed_ttl_secs)
    }

    /// Never zero; `tokio::time::interval` panics on a zero period.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Resolve the content service base URL: env TRIVIA_CONTENT_URL overrides config.
pub fn resolve_content_base_url(config: &Config) -> String {
    std::env::var("TRIVIA_CONTENT_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| config.content.base_url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("TRIVIA_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".trivia").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
