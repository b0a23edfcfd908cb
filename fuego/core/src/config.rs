// Copyright (c) 2024 Botho Foundation

//! Agent configuration.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::{
    challenge::{SupportedKind, CHALLENGE_HEADER, PROOF_HEADER},
    network::Network,
};

/// Environment variable overriding the gateway URL.
pub const ENV_SERVER: &str = "FUEGO_SERVER";

/// Environment variable overriding the network.
pub const ENV_NETWORK: &str = "FUEGO_NETWORK";

/// Main configuration for the authorization agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Cluster every request targets
    #[serde(default)]
    pub network: Network,

    /// Builder, oracle and broadcaster endpoint
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Backoff for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Pay-to-proceed behaviour
    #[serde(default)]
    pub challenge: ChallengeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the transaction gateway
    #[serde(default = "default_gateway_url")]
    pub url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Commitment level passed to the broadcaster, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commitment: Option<String>,
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            timeout_secs: default_timeout_secs(),
            commitment: None,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    2_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Response header holding the challenge
    #[serde(default = "default_challenge_header")]
    pub challenge_header: String,

    /// Request header carrying the proof
    #[serde(default = "default_proof_header")]
    pub proof_header: String,

    /// Statuses that mean the paid retry was served. Only 201 by default;
    /// 200 must be listed explicitly.
    #[serde(default = "default_accepted_statuses")]
    pub accepted_statuses: Vec<u16>,

    /// Payment kinds this agent can satisfy. Empty means `exact` on the
    /// configured network.
    #[serde(default)]
    pub supported: Vec<SupportedKind>,
}

fn default_challenge_header() -> String {
    CHALLENGE_HEADER.to_string()
}

fn default_proof_header() -> String {
    PROOF_HEADER.to_string()
}

fn default_accepted_statuses() -> Vec<u16> {
    vec![201]
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            challenge_header: default_challenge_header(),
            proof_header: default_proof_header(),
            accepted_statuses: default_accepted_statuses(),
            supported: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load config from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Apply `FUEGO_SERVER` and `FUEGO_NETWORK` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SERVER).filter(|v| !v.trim().is_empty()) {
            self.gateway.url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(network) = lookup(ENV_NETWORK).filter(|v| !v.trim().is_empty()) {
            self.network = network
                .trim()
                .parse()
                .with_context(|| format!("Invalid {} value", ENV_NETWORK))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.url.trim().is_empty() {
            bail!("gateway.url must not be empty");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.challenge.accepted_statuses.is_empty() {
            bail!("challenge.accepted_statuses must not be empty");
        }
        if self.challenge.accepted_statuses.contains(&402) {
            bail!("challenge.accepted_statuses must not contain 402");
        }
        Ok(())
    }

    /// Payment kinds to match against challenge options.
    pub fn supported_kinds(&self) -> Vec<SupportedKind> {
        if self.challenge.supported.is_empty() {
            vec![SupportedKind::exact(self.network)]
        } else {
            self.challenge.supported.clone()
        }
    }
}
