//! SatForge Core Library
//!
//! Builds unsigned PSBTs for a Bitcoin wallet that also carries meta-protocol
//! assets (inscriptions, runes, alkanes): it picks which outputs to spend,
//! converges on a fee, and drives two-phase commit/reveal deployments.
//!
//! # Modules
//!
//! - `types`: Core domain types (outputs, accounts, asset ids)
//! - `math`: Size and fee arithmetic
//! - `logging`: Structured logging
//! - `config`: Configuration management
//! - `error`: Error types
//! - `validation`: Address, fee-rate and draft checks
//! - `providers`: Chain, fee-rate, broadcast and signing seams
//! - `utxo_management`: Inventory views over an address or account
//! - `utxo_selection`: Greedy coin selection
//! - `fee_estimation`: Draft sizing and fee quotes
//! - `transaction_builder`: Fee-converging PSBT builder
//! - `protostone`: Runestone/protostone encoding
//! - `envelope`: Taproot envelope scripts
//! - `commit_reveal`: Commit/reveal deployment
//! - `marketplace`: Bid affordability and padding outputs
//! - `wallet_operations`: Sends and contract calls
//!
//! # Security Considerations
//!
//! - Keys never enter this crate; signing goes through [`providers::Signer`]
//! - Every transaction is test-accepted before it is broadcast
//! - Outputs carrying assets are excluded from fee funding

/// Core domain types
pub mod types;

/// Size and fee arithmetic
pub mod math;

/// Structured logging
pub mod logging;

/// Configuration management
pub mod config;

/// Error types
pub mod error;

/// Address, fee-rate and draft validation
pub mod validation;

/// External collaborators: chain data, fee rates, broadcast, signing
pub mod providers;

/// Spendable-output inventory
pub mod utxo_management;

/// Coin selection
pub mod utxo_selection;

/// Fee estimation
pub mod fee_estimation;

/// Fee-converging PSBT builder
pub mod transaction_builder;

/// Runestone and protostone encoding
pub mod protostone;

/// Taproot envelope scripts
pub mod envelope;

/// Commit/reveal deployment
pub mod commit_reveal;

/// Marketplace affordability
pub mod marketplace;

/// Wallet operations
pub mod wallet_operations;

// Re-export important Bitcoin and BDK types
pub use bdk::FeeRate;
pub use bitcoin::{Address, Network, OutPoint, Transaction, Txid};

/// Re-export common types for convenience
pub use types::{
    Account, AddressKind, AssetId, Attachment, AttachmentKey, SpendSource, SpendStrategy, UnspentOutput,
    DUST_THRESHOLD, FEE_FLOOR, MAX_BITCOIN_SUPPLY, PADDING_UTXO_VALUE, SATS_PER_BTC,
};

pub use error::{SatForgeError, SatForgeResult};

pub use providers::{Broadcaster, ChainSource, Deadline, FeeRateSource, Signer};

pub use utxo_selection::{CoinSelector, Overshoot, Selection, SelectionPolicy};

pub use fee_estimation::{DraftInput, DraftOutput, DraftTransaction, FeeEstimator, FeeQuote, FeeRatePolicy};

pub use transaction_builder::{BuildRequest, BuiltPsbt, FeeConvergingBuilder, FundingInput};

pub use commit_reveal::{CommitRequest, CommitRevealBuilder, Committed, Revealed};

pub use marketplace::{AffordabilityPolicy, Marketplace, MarketplaceOffer, MarketplacePolicy};

pub use wallet_operations::WalletOperations;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::sync::Once;

// Ensure initialization happens only once
static INIT: Once = Once::new();

/// Library initialization
///
/// Sets up logging with the default configuration. Safe to call repeatedly;
/// only the first call does any work.
pub fn init() -> Result<(), String> {
    let mut result = Ok(());
    INIT.call_once(|| {
        let config = logging::LogConfig::default();
        result = logging::init(&config).map_err(|e| format!("Failed to initialize logging: {}", e));
    });
    result
}
