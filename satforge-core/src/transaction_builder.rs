//! Fee-converging PSBT builder
//!
//! Coin selection and fee estimation depend on each other: more inputs raise
//! the fee, and a higher fee may need more inputs. The builder runs both in a
//! loop until the inputs retrieved from the spend address cover the spend
//! amount plus the fee for the transaction as it would finally look.
//!
//! # Convergence
//!
//! Each round:
//! 1. size the draft (inputs, outputs and a provisional change output)
//! 2. `needed = spend + fee`, `change = retrieved - needed`
//! 3. if change is non-negative, assemble the PSBT from scratch and stop
//! 4. otherwise select another `needed` from the funding addresses, excluding
//!    everything already held, and go again
//!
//! Funding starts at the request's spend address and, when the request lists
//! further sources (typically the rest of an account), continues through them
//! in order. Each input is populated for the kind of the address it came from.
//!
//! The loop is bounded by `max_iterations` and by progress: a round that
//! cannot add a new input ends the build with `InsufficientFunds`.
//!
//! # Security Considerations
//!
//! - The builder never signs; it only populates the fields a signer needs
//! - A failed build has no side effects beyond chain-source reads

use bdk::FeeRate;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode;
use bitcoin::psbt::{Input, PartiallySignedTransaction};
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::{Address, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use serde_json::json;
use std::collections::HashSet;

use crate::config::Config;
use crate::error::{SatForgeError, SatForgeResult};
use crate::fee_estimation::{DraftInput, DraftOutput, DraftTransaction, FeeEstimator, FeeQuote};
use crate::logging::{self, LogLevel};
use crate::providers::{ChainSource, Deadline};
use crate::types::{AddressKind, SpendSource, UnspentOutput, DUST_THRESHOLD};
use crate::utxo_management::{Inventory, InventoryPolicy, SpendableSet};
use crate::utxo_selection::{CoinSelector, SelectionPolicy};
use crate::validation;

/// Transaction version used for everything built here
pub const TX_VERSION: i32 = 2;

/// Default bound on fee re-estimation rounds
pub const DEFAULT_MAX_ITERATIONS: u32 = 16;

/// An input the build spends, with what the signer needs to know about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingInput {
    pub utxo: UnspentOutput,
    pub kind: AddressKind,
    /// Key controlling the output; required for nested segwit and taproot
    pub pubkey: Option<PublicKey>,
}

impl FundingInput {
    pub fn new(utxo: UnspentOutput, kind: AddressKind, pubkey: Option<PublicKey>) -> Self {
        Self { utxo, kind, pubkey }
    }

    /// An input drawn from `source`
    pub fn from_source(utxo: UnspentOutput, source: &SpendSource) -> Self {
        Self {
            utxo,
            kind: source.kind,
            pubkey: Some(source.pubkey),
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        self.utxo.outpoint()
    }

    fn draft(&self) -> DraftInput {
        DraftInput::new(self.outpoint(), self.utxo.value, self.kind)
    }
}

/// What to build
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Inputs the caller already chose (collectibles, asset carriers, funding)
    pub inputs: Vec<FundingInput>,
    /// Outputs in final order; change is appended after them
    pub outputs: Vec<DraftOutput>,
    /// Address that funds the spend and the fee
    pub spend: SpendSource,
    /// Addresses drawn from after `spend`, in order
    pub additional_sources: Vec<SpendSource>,
    /// Value of `inputs` that counts towards the spend
    pub amount_retrieved: u64,
    /// Value of `outputs` the spend address pays for
    pub spend_amount: u64,
    pub fee_rate: FeeRate,
    /// Defaults to the spend address
    pub change_address: Option<Address>,
}

impl BuildRequest {
    /// A request with no pre-selected inputs
    pub fn new(spend: SpendSource, outputs: Vec<DraftOutput>, spend_amount: u64, fee_rate: FeeRate) -> Self {
        Self {
            inputs: Vec::new(),
            outputs,
            spend,
            additional_sources: Vec::new(),
            amount_retrieved: 0,
            spend_amount,
            fee_rate,
            change_address: None,
        }
    }

    /// Start from `inputs`, of which `amount_retrieved` counts towards the spend
    pub fn with_inputs(mut self, inputs: Vec<FundingInput>, amount_retrieved: u64) -> Self {
        self.inputs = inputs;
        self.amount_retrieved = amount_retrieved;
        self
    }

    /// Fund from `sources` in order; the first becomes the spend address
    ///
    /// # Errors
    /// `InsufficientFunds` when `sources` is empty: there is nothing to draw from.
    pub fn from_sources(
        sources: Vec<SpendSource>,
        outputs: Vec<DraftOutput>,
        spend_amount: u64,
        fee_rate: FeeRate,
    ) -> SatForgeResult<Self> {
        let mut sources = sources.into_iter();
        let spend = sources
            .next()
            .ok_or_else(|| SatForgeError::insufficient_funds(spend_amount, 0))?;
        Ok(Self::new(spend, outputs, spend_amount, fee_rate).with_additional_sources(sources.collect()))
    }

    pub fn with_additional_sources(mut self, sources: Vec<SpendSource>) -> Self {
        self.additional_sources = sources
            .into_iter()
            .filter(|source| source.address != self.spend.address)
            .collect();
        self
    }

    /// Every funding address, spend address first
    pub fn funding_sources(&self) -> Vec<SpendSource> {
        let mut sources = Vec::with_capacity(self.additional_sources.len() + 1);
        sources.push(self.spend.clone());
        sources.extend(self.additional_sources.iter().cloned());
        sources
    }

    pub fn with_change_address(mut self, change_address: Address) -> Self {
        self.change_address = Some(change_address);
        self
    }

    fn change_script(&self) -> ScriptBuf {
        self.change_address
            .as_ref()
            .unwrap_or(&self.spend.address)
            .script_pubkey()
    }
}

/// An unsigned PSBT ready for the signer
#[derive(Debug, Clone)]
pub struct BuiltPsbt {
    pub psbt: PartiallySignedTransaction,
    /// Fee in satoshis the transaction pays
    pub fee: u64,
    /// Estimated virtual size once signed
    pub vsize: usize,
    /// Change value, 0 when change was below dust and left to the fee
    pub change: u64,
    pub inputs: Vec<FundingInput>,
    /// Rounds the convergence loop took
    pub iterations: u32,
}

impl BuiltPsbt {
    /// BIP-174 binary encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        self.psbt.serialize()
    }

    pub fn to_base64(&self) -> String {
        base64::encode(self.to_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Index of the change output, if there is one
    pub fn change_vout(&self) -> Option<usize> {
        if self.change == 0 {
            return None;
        }
        self.psbt.unsigned_tx.output.len().checked_sub(1)
    }

    pub fn unsigned_tx(&self) -> &Transaction {
        &self.psbt.unsigned_tx
    }
}

/// Output set and fee from a fixed-input two-pass estimate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedPlan {
    pub outputs: Vec<DraftOutput>,
    pub quote: FeeQuote,
    /// Change value, 0 when none was added
    pub change: u64,
}

/// Drives selection and estimation until the fee converges
pub struct FeeConvergingBuilder<'a> {
    chain: &'a dyn ChainSource,
    estimator: FeeEstimator,
    max_iterations: u32,
    insist_confirmed: bool,
    greatest_to_least: bool,
    policy: SelectionPolicy,
}

impl<'a> FeeConvergingBuilder<'a> {
    pub fn new(chain: &'a dyn ChainSource) -> Self {
        Self {
            chain,
            estimator: FeeEstimator::default(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            insist_confirmed: true,
            greatest_to_least: true,
            policy: SelectionPolicy::default(),
        }
    }

    /// A builder using the configured floor, bounds and selection rules
    pub fn from_config(chain: &'a dyn ChainSource, config: &Config) -> Self {
        Self {
            chain,
            estimator: FeeEstimator::with_floor(config.fees.fee_floor),
            max_iterations: config.selection.max_iterations,
            insist_confirmed: config.selection.insist_confirmed,
            greatest_to_least: config.spend.utxo_sort_greatest_to_least,
            policy: SelectionPolicy::new(config.selection.overshoot),
        }
    }

    pub fn with_estimator(mut self, estimator: FeeEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_insist_confirmed(mut self, insist_confirmed: bool) -> Self {
        self.insist_confirmed = insist_confirmed;
        self
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn estimator(&self) -> &FeeEstimator {
        &self.estimator
    }

    pub fn chain(&self) -> &'a dyn ChainSource {
        self.chain
    }

    /// Build an unsigned PSBT for `request`
    ///
    /// # Errors
    /// * `InsufficientFunds` when the funding addresses cannot cover spend plus fee,
    ///   including when the iteration bound is hit or a round adds nothing
    /// * `InvalidDraft` for malformed outputs or inputs the signer could not use
    /// * `Timeout` when `deadline` passes before a chain fetch
    pub fn build(&self, request: BuildRequest, deadline: &Deadline) -> SatForgeResult<BuiltPsbt> {
        validation::validate_outputs(&request.outputs)?;

        let inventory = Inventory::new(self.chain).with_deadline(*deadline);
        let selector = CoinSelector::new(self.policy);
        let inventory_policy = InventoryPolicy::default()
            .confirmed(self.insist_confirmed)
            .sorted(self.greatest_to_least);

        let change_script = request.change_script();
        let sources = request.funding_sources();
        let mut inputs = request.inputs.clone();
        let mut retrieved = request.amount_retrieved;

        if inputs.is_empty() {
            let candidates = inventory.sources_spendable(&sources, &inventory_policy, None)?;
            if candidates.utxos.is_empty() {
                return Err(SatForgeError::insufficient_funds(request.spend_amount, 0));
            }
            let selection = selector.select(&candidates.utxos, request.spend_amount, &HashSet::new(), false);
            // Falling short of the bare amount: take everything so the failure
            // below reports the shortfall including the fee
            let picked = if selection.is_empty() {
                candidates.utxos.clone()
            } else {
                selection.utxos
            };
            retrieved = picked.iter().fold(retrieved, |sum, utxo| sum.saturating_add(utxo.value));
            inputs.extend(picked.into_iter().map(|utxo| funding_input(&candidates, utxo, &request.spend)));
        }

        let mut last_needed = request.spend_amount;
        for iteration in 1..=self.max_iterations {
            let mut draft = DraftTransaction::new(
                inputs.iter().map(FundingInput::draft).collect(),
                request.outputs.clone(),
            );
            if retrieved > request.spend_amount {
                draft.outputs.push(DraftOutput::raw(change_script.clone(), 0));
            }

            let quote = self.estimator.estimate(&draft, request.fee_rate)?;
            let needed = request.spend_amount.saturating_add(quote.fee);
            last_needed = needed;

            logging::log_build(
                LogLevel::Debug,
                "convergence round",
                Some(json!({
                    "iteration": iteration,
                    "inputs": inputs.len(),
                    "retrieved": retrieved,
                    "needed": needed,
                    "vsize": quote.vsize,
                })),
            );

            if retrieved >= needed {
                let change = retrieved - needed;
                return self.finalize(&request, inputs, &change_script, change, quote, iteration, deadline);
            }

            let held: HashSet<OutPoint> = inputs.iter().map(FundingInput::outpoint).collect();
            let candidates = inventory.sources_spendable(&sources, &inventory_policy, None)?;
            let selection = selector.select(&candidates.utxos, needed, &held, false);

            let fresh: Vec<UnspentOutput> = selection
                .utxos
                .into_iter()
                .filter(|utxo| !held.contains(&utxo.outpoint()))
                .collect();
            let added: u64 = fresh.iter().map(|utxo| utxo.value).sum();
            if fresh.is_empty() || added == 0 {
                logging::log_build(
                    LogLevel::Info,
                    "no further inputs available",
                    Some(json!({ "needed": needed, "retrieved": retrieved })),
                );
                return Err(SatForgeError::insufficient_funds(needed, retrieved));
            }

            retrieved = retrieved.saturating_add(added);
            inputs.extend(
                fresh
                    .into_iter()
                    .map(|utxo| funding_input(&candidates, utxo, &request.spend)),
            );
        }

        logging::log_build(
            LogLevel::Warn,
            "fee did not converge within the iteration bound",
            Some(json!({ "max_iterations": self.max_iterations, "needed": last_needed })),
        );
        Err(SatForgeError::insufficient_funds(last_needed, retrieved))
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        request: &BuildRequest,
        inputs: Vec<FundingInput>,
        change_script: &ScriptBuf,
        change: u64,
        quote: FeeQuote,
        iterations: u32,
        deadline: &Deadline,
    ) -> SatForgeResult<BuiltPsbt> {
        let mut outputs = request.outputs.clone();
        let change = if change >= DUST_THRESHOLD {
            outputs.push(DraftOutput::raw(change_script.clone(), change));
            change
        } else {
            0
        };

        let psbt = assemble_psbt(self.chain, &inputs, &outputs, deadline)?;
        let input_total: u64 = inputs.iter().map(|input| input.utxo.value).sum();
        let output_total: u64 = outputs.iter().map(|output| output.value).sum();
        let fee = input_total.saturating_sub(output_total);

        logging::log_build(
            LogLevel::Info,
            "built PSBT",
            Some(json!({
                "txid": psbt.unsigned_tx.txid().to_string(),
                "inputs": inputs.len(),
                "outputs": outputs.len(),
                "fee": fee,
                "change": change,
                "iterations": iterations,
            })),
        );

        Ok(BuiltPsbt {
            psbt,
            fee,
            vsize: quote.vsize,
            change,
            inputs,
            iterations,
        })
    }
}

fn funding_input(candidates: &SpendableSet, utxo: UnspentOutput, fallback: &SpendSource) -> FundingInput {
    let source = candidates.source_of(&utxo.outpoint()).unwrap_or(fallback);
    FundingInput::from_source(utxo, source)
}

/// Two-pass estimate for a fixed input set
///
/// The first pass sizes the outputs alone. If what is left after that fee
/// clears dust, a second pass sizes the draft again with a change output and
/// the change is recomputed against the larger fee. Change that would fall to
/// dust or below is left to the fee.
///
/// # Errors
/// * `InsufficientFunds` when the inputs cannot pay outputs plus fee
pub fn plan_fixed_inputs(
    estimator: &FeeEstimator,
    inputs: &[DraftInput],
    outputs: Vec<DraftOutput>,
    change_script: ScriptBuf,
    fee_rate: FeeRate,
) -> SatForgeResult<FixedPlan> {
    validation::validate_outputs(&outputs)?;

    let input_total: u64 = inputs.iter().map(|input| input.value).sum();
    let output_total: u64 = outputs.iter().map(|output| output.value).sum();

    let quote = estimator.estimate(&DraftTransaction::new(inputs.to_vec(), outputs.clone()), fee_rate)?;
    let needed = output_total.saturating_add(quote.fee);
    if input_total < needed {
        return Err(SatForgeError::insufficient_funds(needed, input_total));
    }
    if input_total - needed <= DUST_THRESHOLD {
        return Ok(FixedPlan { outputs, quote, change: 0 });
    }

    let mut with_change = outputs.clone();
    with_change.push(DraftOutput::raw(change_script, 0));
    let second = estimator.estimate(&DraftTransaction::new(inputs.to_vec(), with_change.clone()), fee_rate)?;
    let change = input_total.saturating_sub(output_total.saturating_add(second.fee));
    if change <= DUST_THRESHOLD {
        return Ok(FixedPlan { outputs, quote, change: 0 });
    }

    if let Some(last) = with_change.last_mut() {
        last.value = change;
    }
    Ok(FixedPlan {
        outputs: with_change,
        quote: second,
        change,
    })
}

/// Assemble an unsigned PSBT and populate each input for its kind
///
/// | kind    | fields                                       |
/// |---------|----------------------------------------------|
/// | legacy  | `non_witness_utxo` (fetched from the chain)  |
/// | nested  | `witness_utxo`, `redeem_script`              |
/// | native  | `witness_utxo`                               |
/// | taproot | `witness_utxo`, `tap_internal_key`           |
pub fn assemble_psbt(
    chain: &dyn ChainSource,
    inputs: &[FundingInput],
    outputs: &[DraftOutput],
    deadline: &Deadline,
) -> SatForgeResult<PartiallySignedTransaction> {
    let tx = unsigned_transaction(
        inputs.iter().map(FundingInput::outpoint),
        outputs,
    );
    validation::validate_transaction(&tx)?;

    let mut psbt = PartiallySignedTransaction::from_unsigned_tx(tx)?;
    for (slot, input) in psbt.inputs.iter_mut().zip(inputs) {
        populate_input(chain, slot, input, deadline)?;
    }
    Ok(psbt)
}

/// Version 2, zero locktime, RBF-signalling inputs with empty scripts
pub fn unsigned_transaction(outpoints: impl IntoIterator<Item = OutPoint>, outputs: &[DraftOutput]) -> Transaction {
    Transaction {
        version: TX_VERSION,
        lock_time: LockTime::ZERO,
        input: outpoints
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|output| TxOut {
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
            })
            .collect(),
    }
}

fn populate_input(
    chain: &dyn ChainSource,
    slot: &mut Input,
    input: &FundingInput,
    deadline: &Deadline,
) -> SatForgeResult<()> {
    let outpoint = input.outpoint();
    let witness_utxo = TxOut {
        value: input.utxo.value,
        script_pubkey: input.utxo.script_pubkey.clone(),
    };

    match input.kind {
        AddressKind::Legacy => {
            deadline.check("fetching previous transaction")?;
            let previous = chain.transaction(&outpoint.txid)?.ok_or_else(|| {
                SatForgeError::invalid_draft(format!("previous transaction of legacy input {} not found", outpoint))
            })?;
            if previous.output.get(outpoint.vout as usize).is_none() {
                return Err(SatForgeError::invalid_draft(format!(
                    "previous transaction has no output {}",
                    outpoint.vout
                )));
            }
            slot.non_witness_utxo = Some(previous);
        }
        AddressKind::NestedSegwit => {
            let pubkey = input.pubkey.ok_or_else(|| {
                SatForgeError::invalid_draft(format!("nested segwit input {} has no public key", outpoint))
            })?;
            let wpkh = pubkey.wpubkey_hash().ok_or_else(|| {
                SatForgeError::invalid_draft(format!("public key for {} is not compressed", outpoint))
            })?;
            slot.witness_utxo = Some(witness_utxo);
            slot.redeem_script = Some(ScriptBuf::new_v0_p2wpkh(&wpkh));
        }
        AddressKind::NativeSegwit => {
            slot.witness_utxo = Some(witness_utxo);
        }
        AddressKind::Taproot => {
            let pubkey = input.pubkey.ok_or_else(|| {
                SatForgeError::invalid_draft(format!("taproot input {} has no internal key", outpoint))
            })?;
            slot.witness_utxo = Some(witness_utxo);
            slot.tap_internal_key = Some(XOnlyPublicKey::from(pubkey.inner));
        }
    }

    Ok(())
}

/// Decode a PSBT from its BIP-174 bytes
pub fn psbt_from_bytes(bytes: &[u8]) -> SatForgeResult<PartiallySignedTransaction> {
    Ok(PartiallySignedTransaction::deserialize(bytes)?)
}

/// Extract a finalized transaction and hex-encode it for broadcast
pub fn extract_hex(psbt: PartiallySignedTransaction) -> (Transaction, String) {
    let tx = psbt.extract_tx();
    let raw = encode::serialize_hex(&tx);
    (tx, raw)
}
