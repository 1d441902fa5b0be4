//! Configuration management for the vault observer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::types::{Address, Asset, Chain, PubKey};

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub node: NodeConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Environment variable holding the node's hex signing key
    pub private_key_env: String,
    pub submit_workers: usize,
    pub channel_capacity: usize,
    pub retry_interval_ms: u64,
    pub submit_timeout_ms: u64,
    pub max_submit_attempts: u32,
    pub address_refresh_secs: u64,
}

impl NodeConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    /// Host a single-node sequential ledger in this process
    Local,
    /// Submit to a ledger reachable over HTTP
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub mode: LedgerMode,
    pub remote_url: Option<String>,
    pub block_time_ms: u64,
    pub quorum_numerator: u64,
    pub quorum_denominator: u64,
    /// Ledger heights a rotated-out vault stays authorized
    pub churn_grace_blocks: u64,
    /// Network fee charged per outbound, keyed by chain symbol
    #[serde(default)]
    pub network_fees: HashMap<String, u64>,
    /// Signing addresses of the active node set
    #[serde(default)]
    pub active_nodes: Vec<String>,
    /// Signing addresses allowed to rotate vaults and change parameters
    #[serde(default)]
    pub admin_nodes: Vec<String>,
    #[serde(default)]
    pub vaults: Vec<VaultConfig>,
    /// Fixed conversion rates `FROM->TO = rate`, scaled by 1e8
    #[serde(default)]
    pub rates: HashMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    pub chain: String,
    pub pub_key: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain: String,
    pub native_asset: String,
    pub rpc_urls: Vec<String>,
    pub confirmations: u64,
    #[serde(default)]
    pub start_height: u64,
    pub poll_interval_ms: u64,
    pub max_fetch_attempts: u32,
    pub fetch_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub enabled: bool,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("VAULT_OBSERVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.node.submit_workers == 0 {
            anyhow::bail!("node.submit_workers must be at least 1");
        }
        if self.node.max_submit_attempts == 0 {
            anyhow::bail!("node.max_submit_attempts must be at least 1");
        }

        let ledger = &self.ledger;
        if ledger.quorum_denominator == 0 || ledger.quorum_numerator == 0 {
            anyhow::bail!("quorum fraction must be positive");
        }
        if ledger.quorum_numerator > ledger.quorum_denominator {
            anyhow::bail!("quorum fraction must not exceed 1");
        }
        // A minority must never be able to finalize, or two payloads could both reach quorum
        if ledger.quorum_numerator * 2 <= ledger.quorum_denominator {
            anyhow::bail!("quorum fraction must be greater than 1/2");
        }
        if ledger.mode == LedgerMode::Remote && ledger.remote_url.is_none() {
            anyhow::bail!("ledger.remote_url is required in remote mode");
        }
        for node in &ledger.active_nodes {
            Address::new(node).with_context(|| format!("invalid active node {}", node))?;
        }
        for admin in &ledger.admin_nodes {
            Address::new(admin).with_context(|| format!("invalid admin node {}", admin))?;
        }
        for vault in &ledger.vaults {
            Chain::new(&vault.chain)?;
            PubKey::new(&vault.pub_key)?;
            Address::new(&vault.address)?;
        }
        for chain in ledger.network_fees.keys() {
            Chain::new(chain)?;
        }

        for (name, chain) in &self.chains {
            if chain.enabled {
                Chain::new(&chain.chain)
                    .with_context(|| format!("chain {} has an invalid symbol", name))?;
                chain
                    .native_asset
                    .parse::<Asset>()
                    .with_context(|| format!("chain {} has an invalid native asset", name))?;
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.max_fetch_attempts == 0 {
                    anyhow::bail!("Chain {} must allow at least one fetch attempt", name);
                }
            }
        }

        if self.enabled_chains().is_empty() {
            tracing::warn!("No chains enabled - node will only serve the ledger");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

lazy_static! {
    static ref ENV_VAR: regex::Regex =
        regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: &str = include_str!("../config/default.toml");

    #[test]
    fn test_env_var_substitution() {
        env::set_var("VAULT_OBSERVER_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${VAULT_OBSERVER_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_default_config_parses() {
        let settings = Settings::parse(DEFAULT).unwrap();
        assert_eq!(settings.ledger.mode, LedgerMode::Local);
        assert_eq!(settings.ledger.quorum_numerator, 2);
        assert_eq!(settings.ledger.quorum_denominator, 3);
        assert!(settings.node.submit_workers > 0);
        assert!(!settings.enabled_chains().is_empty());
        assert_eq!(settings.ledger.admin_nodes.len(), 1);
    }

    #[test]
    fn test_rejects_minority_quorum() {
        let bad = DEFAULT.replace("quorum_numerator = 2", "quorum_numerator = 1");
        assert!(Settings::parse(&bad).is_err());
    }
}
