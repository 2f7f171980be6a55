//! Configuration management for SatForge.
//!
//! Settings are stored in TOML. Every section has serde defaults so a partial
//! (or empty) file is a valid configuration.
//!
//! ## Security Considerations
//!
//! - No keys or secrets belong in this file
//! - All values are validated before they reach fee or selection code

use anyhow::{anyhow, Result};
use bdk::FeeRate;
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::fee_estimation::DEFAULT_CONFIRMATION_TARGET;
use crate::logging::LogConfig;
use crate::marketplace::Marketplace;
use crate::types::{SpendStrategy, FEE_FLOOR, OFFER_TX_VBYTES, PADDING_UTXO_VALUE};
use crate::utxo_selection::Overshoot;

/// Main configuration structure for SatForge
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub fees: FeeConfig,

    #[serde(default)]
    pub selection: SelectionConfig,

    #[serde(default)]
    pub spend: SpendStrategy,

    #[serde(default)]
    pub marketplace: MarketplaceConfig,

    #[serde(default)]
    pub commit_reveal: CommitRevealConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

/// Network-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// "bitcoin", "testnet", "signet" or "regtest"
    #[serde(default = "default_network")]
    pub network: String,

    /// Timeout for a whole build, including every chain fetch
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            timeout_seconds: default_timeout(),
        }
    }
}

/// Fee configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Fixed rate in sat/vB; when unset the fee-rate source is asked
    #[serde(default)]
    pub default_fee_rate: Option<f32>,

    /// Confirmation target (blocks) used with the fee-rate source
    #[serde(default = "default_confirmation_target")]
    pub confirmation_target: u16,

    /// No transaction pays less than this, in sats
    #[serde(default = "default_fee_floor")]
    pub fee_floor: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            default_fee_rate: None,
            confirmation_target: default_confirmation_target(),
            fee_floor: default_fee_floor(),
        }
    }
}

/// Coin selection and convergence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Upper bound on fee re-estimation rounds in one build
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default)]
    pub overshoot: Overshoot,

    /// General-purpose spends only use confirmed outputs
    #[serde(default = "default_true")]
    pub insist_confirmed: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            overshoot: Overshoot::default(),
            insist_confirmed: default_true(),
        }
    }
}

/// Marketplace policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    /// Marketplaces that reject bids funded by unconfirmed outputs
    #[serde(default = "default_confirmed_enforcing")]
    pub confirmed_enforcing: Vec<Marketplace>,

    #[serde(default = "default_padding_value")]
    pub padding_value: u64,

    #[serde(default = "default_offer_vbytes")]
    pub offer_vbytes: u64,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            confirmed_enforcing: default_confirmed_enforcing(),
            padding_value: default_padding_value(),
            offer_vbytes: default_offer_vbytes(),
        }
    }
}

/// Commit/reveal flow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRevealConfig {
    /// Delay between checks for the commit transaction
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Checks before giving up on observing the commit
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
}

impl Default for CommitRevealConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_attempts: default_poll_attempts(),
        }
    }
}

impl CommitRevealConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|e| anyhow!("Failed to read config file: {}", e))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| anyhow!("Failed to parse config file: {}", e))?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(path, content).map_err(|e| anyhow!("Failed to write config file: {}", e))?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.bitcoin_network()?;

        if self.network.timeout_seconds == 0 {
            return Err(anyhow!("Invalid network timeout: must be greater than 0"));
        }

        if self.selection.max_iterations == 0 {
            return Err(anyhow!("Invalid max_iterations: must be greater than 0"));
        }

        if let Some(rate) = self.fees.default_fee_rate {
            crate::validation::validate_fee_rate(rate).map_err(|e| anyhow!("{}", e))?;
        }

        if self.fees.confirmation_target == 0 {
            return Err(anyhow!("Invalid confirmation target: must be at least 1 block"));
        }

        if self.spend.address_order.is_empty() {
            anyhow::bail!("Spend strategy address order is empty");
        }

        if self.marketplace.offer_vbytes == 0 {
            anyhow::bail!("Invalid offer_vbytes: must be greater than 0");
        }

        if self.commit_reveal.poll_attempts == 0 {
            anyhow::bail!("Invalid poll_attempts: must be greater than 0");
        }

        Ok(())
    }

    /// The configured network as a `bitcoin::Network`
    pub fn bitcoin_network(&self) -> Result<Network> {
        match self.network.network.to_lowercase().as_str() {
            "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            other => Err(anyhow!("Invalid network type: {}", other)),
        }
    }

    /// The configured default fee rate, if any
    pub fn default_fee_rate(&self) -> Option<FeeRate> {
        self.fees.default_fee_rate.map(FeeRate::from_sat_per_vb)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.network.timeout_seconds))
    }

    /// Confirmed-enforcing marketplaces as a set
    pub fn confirmed_enforcing(&self) -> HashSet<Marketplace> {
        self.marketplace.confirmed_enforcing.iter().cloned().collect()
    }
}

/// Ensure a configuration file exists at the specified path
/// If it doesn't exist, create it with default values
pub fn ensure_config_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        let default_config = Config::default();
        let content = toml::to_string_pretty(&default_config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| anyhow!("Failed to create config directory: {}", e))?;
            }
        }

        fs::write(path, content)
            .map_err(|e| anyhow!("Failed to write default config file: {}", e))?;
    }

    Ok(())
}

// Default value functions

fn default_network() -> String {
    "bitcoin".to_string()
}

fn default_timeout() -> u32 {
    30
}

fn default_confirmation_target() -> u16 {
    DEFAULT_CONFIRMATION_TARGET
}

fn default_fee_floor() -> u64 {
    FEE_FLOOR
}

fn default_max_iterations() -> u32 {
    16
}

fn default_true() -> bool {
    true
}

fn default_confirmed_enforcing() -> Vec<Marketplace> {
    vec![Marketplace::Unisat]
}

fn default_padding_value() -> u64 {
    PADDING_UTXO_VALUE
}

fn default_offer_vbytes() -> u64 {
    OFFER_TX_VBYTES
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_poll_attempts() -> u32 {
    30
}
