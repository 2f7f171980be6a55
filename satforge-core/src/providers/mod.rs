//! Boundaries to the outside world
//!
//! The builder never talks to a node, an indexer or a key store directly. It is
//! handed implementations of the traits below for the duration of one call:
//!
//! - [`ChainSource`]: unspent outputs per address and previous transactions
//! - [`FeeRateSource`]: fee estimates keyed by confirmation target
//! - [`Broadcaster`]: mempool test-accept, broadcast and decode
//! - [`Signer`]: signs and finalizes PSBT inputs
//!
//! # Security Considerations
//!
//! - Private keys stay behind [`Signer`]; nothing here sees key material
//! - Chain data is advisory. `Broadcaster::test_accept` is the final gate before
//!   anything is broadcast

use bitcoin::consensus::encode;
use bitcoin::psbt::PartiallySignedTransaction;
use bitcoin::{Address, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{SatForgeError, SatForgeResult};
use crate::logging::{self, LogLevel};
use crate::types::UnspentOutput;

pub mod mock;

pub use mock::{MockChainSource, MockSigner};

/// Source of truth for unspent outputs and confirmed/mempool transactions
pub trait ChainSource {
    /// Unspent outputs currently owned by `address`, mempool outputs included
    fn list_unspent(&self, address: &Address) -> SatForgeResult<Vec<UnspentOutput>>;

    /// Look up a transaction by id
    ///
    /// # Returns
    /// * `Ok(None)` when the source does not know the transaction (yet)
    fn transaction(&self, txid: &Txid) -> SatForgeResult<Option<Transaction>>;
}

/// Fee-rate estimates, consulted when the caller gives no explicit rate
pub trait FeeRateSource {
    /// Map of confirmation target (blocks) to rate in sat/vB
    fn fee_estimates(&self) -> SatForgeResult<BTreeMap<u16, f32>>;
}

/// Outcome of a mempool acceptance test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptResult {
    pub allowed: bool,
    pub reject_reason: Option<String>,
}

impl AcceptResult {
    pub fn accepted() -> Self {
        Self {
            allowed: true,
            reject_reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reject_reason: Some(reason.into()),
        }
    }
}

/// Summary of a decoded raw transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedTransaction {
    pub txid: Txid,
    pub vsize: usize,
    pub weight: usize,
}

/// Mempool access
pub trait Broadcaster {
    /// Ask the node whether it would accept the transaction, without relaying it
    fn test_accept(&self, raw_tx_hex: &str) -> SatForgeResult<AcceptResult>;

    /// Relay the transaction, returning its id
    fn send_raw_transaction(&self, raw_tx_hex: &str) -> SatForgeResult<Txid>;

    /// Decode a raw transaction
    ///
    /// The default implementation decodes locally; node-backed broadcasters may
    /// override it with an RPC call.
    fn decode_raw_transaction(&self, raw_tx_hex: &str) -> SatForgeResult<DecodedTransaction> {
        let bytes = hex::decode(raw_tx_hex)?;
        let tx: Transaction = encode::deserialize(&bytes)?;
        let weight = tx.weight().to_wu() as usize;
        Ok(DecodedTransaction {
            txid: tx.txid(),
            vsize: (weight + 3) / 4,
            weight,
        })
    }
}

/// Signs PSBT inputs on behalf of the account
pub trait Signer {
    /// Sign every input the signer holds a key for
    ///
    /// # Arguments
    /// * `psbt` - The unsigned PSBT
    /// * `finalize` - Whether to fill `final_script_sig`/`final_script_witness`
    fn sign_all_inputs(
        &self,
        psbt: PartiallySignedTransaction,
        finalize: bool,
    ) -> SatForgeResult<PartiallySignedTransaction>;

    /// Sign and finalize one taproot script-path input
    fn sign_reveal_input(
        &self,
        psbt: PartiallySignedTransaction,
        index: usize,
    ) -> SatForgeResult<PartiallySignedTransaction>;
}

/// A point in time after which a build gives up
///
/// Checked before every external fetch so a slow chain source cannot hold a
/// build open indefinitely.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    /// Expire `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now().checked_add(timeout),
        }
    }

    /// Expire after the configured build timeout
    pub fn from_config(config: &Config) -> Self {
        Self::after(config.build_timeout())
    }

    /// Never expire
    pub fn none() -> Self {
        Self { expires_at: None }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() >= at)
    }

    /// Time left, `None` for an unbounded deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Fail with `Timeout` once the deadline has passed
    pub fn check(&self, context: &str) -> SatForgeResult<()> {
        if self.is_expired() {
            return Err(SatForgeError::timeout(context.to_string()));
        }
        Ok(())
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

/// Test-accept a signed transaction and broadcast it
///
/// Nothing is relayed when the node refuses the transaction at test-accept.
///
/// # Errors
/// * `BroadcastRejected` with the node's reason
pub fn broadcast_checked(broadcaster: &dyn Broadcaster, tx: &Transaction) -> SatForgeResult<Txid> {
    let raw = encode::serialize_hex(tx);
    let verdict = broadcaster.test_accept(&raw)?;

    if !verdict.allowed {
        let reason = verdict
            .reject_reason
            .unwrap_or_else(|| "rejected without a reason".to_string());
        logging::log_broadcast(
            LogLevel::Warn,
            "test-accept refused transaction",
            Some(serde_json::json!({ "txid": tx.txid().to_string(), "reason": reason })),
        );
        return Err(SatForgeError::broadcast_rejected(reason));
    }

    let txid = broadcaster.send_raw_transaction(&raw)?;
    logging::log_broadcast(
        LogLevel::Info,
        "transaction broadcast",
        Some(serde_json::json!({ "txid": txid.to_string() })),
    );
    Ok(txid)
}
