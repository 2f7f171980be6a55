//! Fee estimation for draft transactions
//!
//! Fees are quoted from the *structure* of a draft rather than its
//! serialization: each input contributes the base and witness bytes of its
//! address kind (or the exact length of an explicit witness, for script-path
//! spends), each output contributes `8 + varint + script` bytes, and the header
//! is counted once. This lets the builder price a transaction before any
//! signature exists.
//!
//! # Fee Estimation Strategy
//!
//! - `weight = 3 × base + (base + witness)`, `vsize = ceil(weight / 4)`
//! - `fee = max(ceil(vsize × rate), floor)` with a 250 sat floor by default
//! - Fee rates come from the caller or, failing that, a [`FeeRateSource`]

use bdk::FeeRate;
use bitcoin::{Address, OutPoint, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{SatForgeError, SatForgeResult};
use crate::logging::{self, LogLevel};
use crate::math;
use crate::providers::FeeRateSource;
use crate::types::{AddressKind, FEE_FLOOR};
use crate::validation;

/// One input of a draft transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftInput {
    pub outpoint: OutPoint,
    pub value: u64,
    pub kind: AddressKind,
    /// Exact witness stack, when known; replaces the kind's default estimate
    pub witness: Option<Vec<Vec<u8>>>,
}

impl DraftInput {
    pub fn new(outpoint: OutPoint, value: u64, kind: AddressKind) -> Self {
        Self {
            outpoint,
            value,
            kind,
            witness: None,
        }
    }

    pub fn with_witness(mut self, witness: Vec<Vec<u8>>) -> Self {
        self.witness = Some(witness);
        self
    }

    fn size(&self) -> math::InputSize {
        match &self.witness {
            Some(witness) => math::get_input_size_with_witness(self.kind, witness),
            None => math::get_input_size(self.kind),
        }
    }
}

/// One output of a draft transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftOutput {
    pub script_pubkey: ScriptBuf,
    pub value: u64,
}

impl DraftOutput {
    /// Pay `value` to `address`
    pub fn to_address(address: &Address, value: u64) -> Self {
        Self {
            script_pubkey: address.script_pubkey(),
            value,
        }
    }

    /// A raw script output, e.g. an OP_RETURN carrying protocol data
    pub fn raw(script_pubkey: ScriptBuf, value: u64) -> Self {
        Self { script_pubkey, value }
    }

    fn size(&self) -> usize {
        math::get_output_size(self.script_pubkey.len())
    }
}

/// An in-progress transaction: typed inputs and ordered outputs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DraftTransaction {
    pub inputs: Vec<DraftInput>,
    pub outputs: Vec<DraftOutput>,
}

impl DraftTransaction {
    pub fn new(inputs: Vec<DraftInput>, outputs: Vec<DraftOutput>) -> Self {
        Self { inputs, outputs }
    }

    pub fn input_value(&self) -> u64 {
        self.inputs.iter().map(|input| input.value).sum()
    }

    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|output| output.value).sum()
    }

    fn has_witness(&self) -> bool {
        self.inputs
            .iter()
            .any(|input| input.kind.is_segwit() || input.witness.is_some())
    }

    /// Non-witness and witness byte counts
    pub fn sizes(&self) -> (usize, usize) {
        let segwit = self.has_witness();

        let mut base = math::TX_FIXED_OVERHEAD
            + math::varint_len(self.inputs.len())
            + math::varint_len(self.outputs.len());
        let mut witness = if segwit { math::SEGWIT_MARKER_SIZE } else { 0 };

        for input in &self.inputs {
            let size = input.size();
            base += size.base;
            witness += size.witness;
            // A legacy input in a segwit transaction still needs an empty stack
            if segwit && size.witness == 0 {
                witness += 1;
            }
        }

        base += self.outputs.iter().map(DraftOutput::size).sum::<usize>();

        (base, witness)
    }
}

/// Virtual size and fee of a draft
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    pub weight: usize,
    pub vsize: usize,
    /// Fee in satoshis
    pub fee: u64,
}

/// Quotes fees for drafts
#[derive(Debug, Clone, Copy)]
pub struct FeeEstimator {
    floor: u64,
}

impl Default for FeeEstimator {
    fn default() -> Self {
        Self { floor: FEE_FLOOR }
    }
}

impl FeeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different minimum fee
    pub fn with_floor(floor: u64) -> Self {
        Self { floor }
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Estimate the virtual size and fee of `draft` at `fee_rate`
    ///
    /// # Errors
    /// `InvalidDraft` if the draft has no inputs or no outputs, or the rate is
    /// not a usable number.
    pub fn estimate(&self, draft: &DraftTransaction, fee_rate: FeeRate) -> SatForgeResult<FeeQuote> {
        if draft.inputs.is_empty() {
            return Err(SatForgeError::invalid_draft("cannot estimate a fee without inputs"));
        }
        if draft.outputs.is_empty() {
            return Err(SatForgeError::invalid_draft("cannot estimate a fee without outputs"));
        }

        let (base, witness) = draft.sizes();
        let weight = math::calculate_tx_weight(base, witness);
        let vsize = math::weight_to_vsize(weight);
        let fee = math::fee_for_vsize(vsize, fee_rate)
            .ok_or_else(|| {
                SatForgeError::invalid_draft(format!("unusable fee rate {}", fee_rate.as_sat_per_vb()))
            })?
            .max(self.floor);

        Ok(FeeQuote { weight, vsize, fee })
    }
}

/// Pick the fee rate for a build
///
/// An explicit rate always wins. Otherwise the source's estimate for
/// `target_blocks` is used, falling back to the nearest longer target it
/// reports.
pub fn resolve_fee_rate(
    explicit: Option<FeeRate>,
    source: &dyn FeeRateSource,
    target_blocks: u16,
) -> SatForgeResult<FeeRate> {
    if let Some(rate) = explicit {
        validation::validate_fee_rate(rate.as_sat_per_vb())?;
        return Ok(rate);
    }

    let estimates = source.fee_estimates()?;
    let rate = estimates
        .range(target_blocks..)
        .next()
        .or_else(|| estimates.iter().next_back())
        .map(|(_, rate)| *rate)
        .ok_or_else(|| crate::error::source_error("fee-rate source returned no estimates"))?;

    validation::validate_fee_rate(rate)?;
    logging::log_fee(
        LogLevel::Debug,
        "resolved fee rate from source",
        Some(serde_json::json!({ "target_blocks": target_blocks, "sat_per_vb": rate })),
    );
    Ok(FeeRate::from_sat_per_vb(rate))
}

/// Confirmation target used when nothing else is configured
pub const DEFAULT_CONFIRMATION_TARGET: u16 = 1;

/// Where an operation gets its fee rate when the caller passes none
///
/// Lookup order: the caller's rate, the configured default rate, then the
/// fee-rate source at the configured confirmation target.
#[derive(Clone, Copy)]
pub struct FeeRatePolicy<'a> {
    source: Option<&'a dyn FeeRateSource>,
    default_rate: Option<FeeRate>,
    target_blocks: u16,
}

impl Default for FeeRatePolicy<'_> {
    fn default() -> Self {
        Self {
            source: None,
            default_rate: None,
            target_blocks: DEFAULT_CONFIRMATION_TARGET,
        }
    }
}

impl<'a> FeeRatePolicy<'a> {
    pub fn from_config(config: &Config) -> Self {
        Self::default().with_config(config)
    }

    /// Take the default rate and confirmation target from `config`, keeping the source
    pub fn with_config(mut self, config: &Config) -> Self {
        self.default_rate = config.default_fee_rate();
        self.target_blocks = config.fees.confirmation_target;
        self
    }

    pub fn with_source(mut self, source: &'a dyn FeeRateSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn target_blocks(&self) -> u16 {
        self.target_blocks
    }

    /// Settle on a rate for one operation
    ///
    /// # Errors
    /// * `Validation` when the rate is out of bounds, or when no rate was given
    ///   and there is neither a default nor a source to ask
    /// * Source failures propagate unchanged
    pub fn resolve(&self, explicit: Option<FeeRate>) -> SatForgeResult<FeeRate> {
        match (explicit.or(self.default_rate), self.source) {
            (Some(rate), _) => {
                validation::validate_fee_rate(rate.as_sat_per_vb())?;
                Ok(rate)
            }
            (None, Some(source)) => resolve_fee_rate(None, source, self.target_blocks),
            (None, None) => Err(SatForgeError::validation(
                "no fee rate given and no fee-rate source to ask",
            )),
        }
    }
}
