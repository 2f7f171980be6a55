//! In-memory collaborators
//!
//! # WARNING: FOR TESTING PURPOSES ONLY
//!
//! These implementations never touch a network and never produce real
//! signatures. They exist so selection, fee convergence and the commit/reveal
//! flow can be exercised deterministically.
//!
//! # Testing Assumptions
//!
//! - The UTXO set only changes when a test adds outputs or a broadcast spends them
//! - Broadcast transactions become visible to [`ChainSource::transaction`]
//!   immediately unless indexing is switched off
//! - Signatures are fixed-size placeholders with realistic lengths, so a signed
//!   transaction has the same virtual size as a real one

use bitcoin::blockdata::script::{Builder, PushBytesBuf};
use bitcoin::consensus::encode;
use bitcoin::psbt::{Input, PartiallySignedTransaction};
use bitcoin::{Address, OutPoint, ScriptBuf, Transaction, Txid, Witness};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::{AcceptResult, Broadcaster, ChainSource, FeeRateSource, Signer};
use crate::error::{source_error, SatForgeError, SatForgeResult};
use crate::types::UnspentOutput;

/// DER signature with sighash byte, at its most common length
const ECDSA_SIGNATURE_LEN: usize = 72;
const COMPRESSED_PUBKEY_LEN: usize = 33;
const SCHNORR_SIGNATURE_LEN: usize = 64;

/// In-memory chain source, fee-rate source and broadcaster
#[derive(Debug)]
pub struct MockChainSource {
    unspent: RwLock<HashMap<String, Vec<UnspentOutput>>>,
    transactions: RwLock<HashMap<Txid, Transaction>>,
    broadcasts: RwLock<Vec<Transaction>>,
    fee_rates: BTreeMap<u16, Decimal>,
    reject_reason: Option<String>,
    index_broadcasts: bool,
    list_calls: AtomicUsize,
    accept_calls: AtomicUsize,
}

impl Default for MockChainSource {
    fn default() -> Self {
        let mut fee_rates = BTreeMap::new();
        fee_rates.insert(1, dec!(20.0));
        fee_rates.insert(3, dec!(10.0));
        fee_rates.insert(6, dec!(5.0));
        fee_rates.insert(12, dec!(2.0));
        fee_rates.insert(24, dec!(1.0));

        Self {
            unspent: RwLock::new(HashMap::new()),
            transactions: RwLock::new(HashMap::new()),
            broadcasts: RwLock::new(Vec::new()),
            fee_rates,
            reject_reason: None,
            index_broadcasts: true,
            list_calls: AtomicUsize::new(0),
            accept_calls: AtomicUsize::new(0),
        }
    }
}

impl MockChainSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unspent output, keyed by its address
    pub fn with_unspent(self, utxo: UnspentOutput) -> Self {
        self.add_unspent(utxo);
        self
    }

    /// Make a transaction known to [`ChainSource::transaction`]
    pub fn with_transaction(self, tx: Transaction) -> Self {
        self.add_transaction(tx);
        self
    }

    /// Replace the fee estimate for one confirmation target
    pub fn with_fee_rate(mut self, target_blocks: u16, sat_per_vb: Decimal) -> Self {
        self.fee_rates.insert(target_blocks, sat_per_vb);
        self
    }

    /// Drop every fee estimate
    pub fn without_fee_rates(mut self) -> Self {
        self.fee_rates.clear();
        self
    }

    /// Refuse every transaction at test-accept with `reason`
    pub fn rejecting(mut self, reason: impl Into<String>) -> Self {
        self.reject_reason = Some(reason.into());
        self
    }

    /// Whether broadcasts become visible through [`ChainSource::transaction`]
    pub fn with_indexing(mut self, index_broadcasts: bool) -> Self {
        self.index_broadcasts = index_broadcasts;
        self
    }

    pub fn add_unspent(&self, utxo: UnspentOutput) {
        if let Ok(mut unspent) = self.unspent.write() {
            unspent.entry(utxo.address.clone()).or_default().push(utxo);
        }
    }

    pub fn add_transaction(&self, tx: Transaction) {
        if let Ok(mut transactions) = self.transactions.write() {
            transactions.insert(tx.txid(), tx);
        }
    }

    /// Transactions relayed so far, in order
    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcasts
            .read()
            .map(|broadcasts| broadcasts.clone())
            .unwrap_or_default()
    }

    /// Number of `list_unspent` calls served
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of `test_accept` calls served
    pub fn accept_calls(&self) -> usize {
        self.accept_calls.load(Ordering::SeqCst)
    }

    fn spend(&self, spent: &[OutPoint]) -> SatForgeResult<()> {
        let mut unspent = self
            .unspent
            .write()
            .map_err(|_| source_error("mock UTXO set lock poisoned"))?;
        for utxos in unspent.values_mut() {
            utxos.retain(|utxo| !spent.contains(&utxo.outpoint()));
        }
        Ok(())
    }
}

impl ChainSource for MockChainSource {
    fn list_unspent(&self, address: &Address) -> SatForgeResult<Vec<UnspentOutput>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let unspent = self
            .unspent
            .read()
            .map_err(|_| source_error("mock UTXO set lock poisoned"))?;
        Ok(unspent.get(&address.to_string()).cloned().unwrap_or_default())
    }

    fn transaction(&self, txid: &Txid) -> SatForgeResult<Option<Transaction>> {
        let transactions = self
            .transactions
            .read()
            .map_err(|_| source_error("mock transaction index lock poisoned"))?;
        Ok(transactions.get(txid).cloned())
    }
}

impl FeeRateSource for MockChainSource {
    fn fee_estimates(&self) -> SatForgeResult<BTreeMap<u16, f32>> {
        Ok(self
            .fee_rates
            .iter()
            .filter_map(|(target, rate)| rate.to_f32().map(|rate| (*target, rate)))
            .collect())
    }
}

impl Broadcaster for MockChainSource {
    fn test_accept(&self, raw_tx_hex: &str) -> SatForgeResult<AcceptResult> {
        self.accept_calls.fetch_add(1, Ordering::SeqCst);
        // Must at least decode
        let bytes = hex::decode(raw_tx_hex)?;
        let _: Transaction = encode::deserialize(&bytes)?;

        Ok(match &self.reject_reason {
            Some(reason) => AcceptResult::rejected(reason.clone()),
            None => AcceptResult::accepted(),
        })
    }

    fn send_raw_transaction(&self, raw_tx_hex: &str) -> SatForgeResult<Txid> {
        if let Some(reason) = &self.reject_reason {
            return Err(SatForgeError::broadcast_rejected(reason.clone()));
        }

        let bytes = hex::decode(raw_tx_hex)?;
        let tx: Transaction = encode::deserialize(&bytes)?;
        let txid = tx.txid();

        let spent: Vec<OutPoint> = tx.input.iter().map(|input| input.previous_output).collect();
        self.spend(&spent)?;

        if self.index_broadcasts {
            self.add_transaction(tx.clone());
        }
        self.broadcasts
            .write()
            .map_err(|_| source_error("mock broadcast log lock poisoned"))?
            .push(tx);

        Ok(txid)
    }
}

/// Signer that writes placeholder signatures of realistic size
#[derive(Debug, Clone, Default)]
pub struct MockSigner;

impl MockSigner {
    pub fn new() -> Self {
        Self
    }

    fn previous_script(input: &Input, index: usize, tx: &Transaction) -> SatForgeResult<ScriptBuf> {
        if let Some(txout) = &input.witness_utxo {
            return Ok(txout.script_pubkey.clone());
        }
        let vout = tx.input[index].previous_output.vout as usize;
        input
            .non_witness_utxo
            .as_ref()
            .and_then(|prev| prev.output.get(vout))
            .map(|txout| txout.script_pubkey.clone())
            .ok_or_else(|| SatForgeError::invalid_draft(format!("input {} has no previous output", index)))
    }

    fn push(bytes: Vec<u8>) -> SatForgeResult<PushBytesBuf> {
        PushBytesBuf::try_from(bytes)
            .map_err(|e| SatForgeError::invalid_draft(format!("script push too large: {}", e)))
    }
}

impl Signer for MockSigner {
    fn sign_all_inputs(
        &self,
        mut psbt: PartiallySignedTransaction,
        finalize: bool,
    ) -> SatForgeResult<PartiallySignedTransaction> {
        if !finalize {
            return Ok(psbt);
        }

        let ecdsa_sig = vec![0x30; ECDSA_SIGNATURE_LEN];
        let pubkey = vec![0x02; COMPRESSED_PUBKEY_LEN];

        for index in 0..psbt.inputs.len() {
            let script = Self::previous_script(&psbt.inputs[index], index, &psbt.unsigned_tx)?;
            let input = &mut psbt.inputs[index];

            if script.is_v1_p2tr() {
                // Script-path inputs are signed by sign_reveal_input
                if !input.tap_scripts.is_empty() {
                    continue;
                }
                input.final_script_witness =
                    Some(Witness::from_slice(&[vec![0x01; SCHNORR_SIGNATURE_LEN]]));
            } else if script.is_v0_p2wpkh() {
                input.final_script_witness = Some(Witness::from_slice(&[ecdsa_sig.clone(), pubkey.clone()]));
            } else if script.is_p2sh() {
                let redeem = input.redeem_script.clone().ok_or_else(|| {
                    SatForgeError::invalid_draft(format!("nested segwit input {} has no redeem script", index))
                })?;
                let script_sig = Builder::new()
                    .push_slice(Self::push(redeem.into_bytes())?)
                    .into_script();
                input.final_script_sig = Some(script_sig);
                input.final_script_witness = Some(Witness::from_slice(&[ecdsa_sig.clone(), pubkey.clone()]));
            } else if script.is_p2pkh() {
                let script_sig = Builder::new()
                    .push_slice(Self::push(ecdsa_sig.clone())?)
                    .push_slice(Self::push(pubkey.clone())?)
                    .into_script();
                input.final_script_sig = Some(script_sig);
            } else {
                return Err(SatForgeError::invalid_draft(format!(
                    "input {} has an unsupported script",
                    index
                )));
            }
        }

        Ok(psbt)
    }

    fn sign_reveal_input(
        &self,
        mut psbt: PartiallySignedTransaction,
        index: usize,
    ) -> SatForgeResult<PartiallySignedTransaction> {
        let input = psbt
            .inputs
            .get_mut(index)
            .ok_or_else(|| SatForgeError::invalid_draft(format!("PSBT has no input {}", index)))?;

        let (control_block, (script, _)) = input
            .tap_scripts
            .iter()
            .next()
            .map(|(cb, leaf)| (cb.clone(), leaf.clone()))
            .ok_or_else(|| SatForgeError::invalid_draft(format!("input {} has no tap script", index)))?;

        input.final_script_witness = Some(Witness::from_slice(&[
            vec![0x01; SCHNORR_SIGNATURE_LEN],
            script.into_bytes(),
            control_block.serialize(),
        ]));
        Ok(psbt)
    }
}
